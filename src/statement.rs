//! The declarative statement tree describing traversal, staging, invocation and
//! synchronization order.
//!
//! A tree is authored for one backend. Dimensions, parameter slots and bodies are referenced
//! by position; [`KernelBuilder::build`](crate::engine::KernelBuilder::build) validates every
//! reference before anything runs.

use std::fmt;

use derive_more::Display;
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{space::TileDescriptor, tile::Storage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Axis {
    #[display("x")]
    X,
    #[display("y")]
    Y,
    #[display("z")]
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    #[inline]
    pub const fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }
}

/// How one traversal maps onto iterations or threads.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Policy {
    /// Scalar iteration in order.
    #[default]
    #[display("seq")]
    Seq,
    /// Iterations distributed across the host worker pool.
    #[display("parallel")]
    Parallel,
    /// One iteration per block along `axis` (block-stride loop).
    #[display("block.{_0}")]
    Block(Axis),
    /// One iteration per thread along `axis`; threads past the extent idle.
    #[display("thread.{_0}")]
    Thread(Axis),
    /// Threads along `axis` stride through the extent.
    #[display("thread_loop.{_0}")]
    ThreadLoop(Axis),
}

impl Policy {
    /// Checks if the policy only makes sense inside a GPU kernel.
    #[inline]
    pub fn is_gpu(self) -> bool {
        matches!(
            self,
            Policy::Block(_) | Policy::Thread(_) | Policy::ThreadLoop(_)
        )
    }

    /// Checks if different threads of one block take different iterations.
    #[inline]
    pub fn is_thread(self) -> bool {
        matches!(self, Policy::Thread(_) | Policy::ThreadLoop(_))
    }
}

/// Where one argument of a body comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Binding {
    /// The active global index of a dimension.
    #[display("seg<{_0}>")]
    Index(usize),
    /// The active position of a dimension relative to its current tile (or segment) start.
    #[display("offset<{_0}>")]
    Offset(usize),
    /// The number of the innermost tile enclosing a dimension.
    #[display("tile<{_0}>")]
    TileIndex(usize),
    /// A parameter tuple slot.
    #[display("param<{_0}>")]
    Param(usize),
}

/// Bindings to the global indices of `dims`, in order.
pub fn segs(dims: impl IntoIterator<Item = usize>) -> Vec<Binding> {
    dims.into_iter().map(Binding::Index).collect()
}

/// Bindings to the local offsets of `dims`, in order.
pub fn offsets(dims: impl IntoIterator<Item = usize>) -> Vec<Binding> {
    dims.into_iter().map(Binding::Offset).collect()
}

/// Bindings to parameter `slots`, in order.
pub fn params(slots: impl IntoIterator<Item = usize>) -> Vec<Binding> {
    slots.into_iter().map(Binding::Param).collect()
}

/// Whether an invocation runs at positions outside the iteration space.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Guard {
    /// Skip the call if any actively traversed dimension is out of range.
    #[default]
    #[display("in_bounds")]
    InBounds,
    /// Always call; the body must not touch caller memory at invalid positions.
    #[display("always")]
    Always,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Statement {
    /// Traverses every position of a dimension's current window.
    /// A missing policy inherits the inner policy of the enclosing tile of `dim`.
    Loop {
        dim: usize,
        policy: Option<Policy>,
        children: Vec<Statement>,
    },
    /// Splits a dimension's window into tiles and traverses the outer tile index.
    Tile {
        tile: TileDescriptor,
        children: Vec<Statement>,
    },
    /// Allocates the local tiles of `slots` for the duration of `children`.
    Stage {
        slots: Vec<usize>,
        storage: Storage,
        children: Vec<Statement>,
    },
    /// Fuses the windows of `dims` into one flattened traversal, first dimension outermost.
    Collapse {
        dims: Vec<usize>,
        policy: Policy,
        children: Vec<Statement>,
    },
    /// Calls body `body` with arguments assembled from `bindings`.
    Invoke {
        body: usize,
        bindings: Vec<Binding>,
        guard: Guard,
    },
    /// Block-wide barrier on the GPU backend; no-op elsewhere.
    Sync,
    /// GPU kernel entry. Everything below runs in the thread-block model.
    Kernel { children: Vec<Statement> },
}

impl Statement {
    pub fn for_each(dim: usize, policy: Policy, children: impl Into<Vec<Statement>>) -> Self {
        let policy = Some(policy);
        let children = children.into();
        Self::Loop {
            dim,
            policy,
            children,
        }
    }

    /// A loop over the inner offsets of `dim`, using the enclosing tile's inner policy.
    pub fn inner(dim: usize, children: impl Into<Vec<Statement>>) -> Self {
        let children = children.into();
        Self::Loop {
            dim,
            policy: None,
            children,
        }
    }

    pub fn tile(
        dim: usize,
        size: usize,
        outer: Policy,
        inner: Policy,
        children: impl Into<Vec<Statement>>,
    ) -> Self {
        let tile = TileDescriptor {
            dim,
            size,
            outer,
            inner,
        };
        let children = children.into();
        Self::Tile { tile, children }
    }

    pub fn stage(
        slots: impl Into<Vec<usize>>,
        storage: Storage,
        children: impl Into<Vec<Statement>>,
    ) -> Self {
        let slots = slots.into();
        let children = children.into();
        Self::Stage {
            slots,
            storage,
            children,
        }
    }

    pub fn collapse(
        dims: impl Into<Vec<usize>>,
        policy: Policy,
        children: impl Into<Vec<Statement>>,
    ) -> Self {
        let dims = dims.into();
        let children = children.into();
        Self::Collapse {
            dims,
            policy,
            children,
        }
    }

    /// An invocation skipped at out-of-range positions.
    pub fn invoke(body: usize, bindings: impl Into<Vec<Binding>>) -> Self {
        let bindings = bindings.into();
        Self::Invoke {
            body,
            bindings,
            guard: Guard::InBounds,
        }
    }

    /// An invocation that also runs at out-of-range positions.
    pub fn invoke_always(body: usize, bindings: impl Into<Vec<Binding>>) -> Self {
        let bindings = bindings.into();
        Self::Invoke {
            body,
            bindings,
            guard: Guard::Always,
        }
    }

    pub fn kernel(children: impl Into<Vec<Statement>>) -> Self {
        let children = children.into();
        Self::Kernel { children }
    }

    /// Number of statements in this subtree, including itself.
    pub fn count(&self) -> usize {
        1 + self.children().iter().map(Statement::count).sum::<usize>()
    }

    pub fn children(&self) -> &[Statement] {
        match self {
            Statement::Loop { children, .. }
            | Statement::Tile { children, .. }
            | Statement::Stage { children, .. }
            | Statement::Collapse { children, .. }
            | Statement::Kernel { children } => children,
            Statement::Invoke { .. } | Statement::Sync => &[],
        }
    }

    fn fmt_indent(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let indent = "  ".repeat(depth);
        match self {
            Statement::Loop { dim, policy, .. } => match policy {
                Some(policy) => writeln!(f, "{indent}for<{dim}, {policy}>")?,
                None => writeln!(f, "{indent}for<{dim}, inner>")?,
            },
            Statement::Tile { tile, .. } => writeln!(
                f,
                "{indent}tile<{}, {}, {}, {}>",
                tile.dim, tile.size, tile.outer, tile.inner
            )?,
            Statement::Stage { slots, storage, .. } => writeln!(
                f,
                "{indent}stage<[{}], {storage}>",
                slots.iter().format(", ")
            )?,
            Statement::Collapse { dims, policy, .. } => writeln!(
                f,
                "{indent}collapse<[{}], {policy}>",
                dims.iter().format(", ")
            )?,
            Statement::Invoke {
                body,
                bindings,
                guard,
            } => writeln!(
                f,
                "{indent}invoke<{body}, [{}], {guard}>",
                bindings.iter().format(", ")
            )?,
            Statement::Sync => writeln!(f, "{indent}sync")?,
            Statement::Kernel { .. } => writeln!(f, "{indent}kernel")?,
        }
        self.children()
            .iter()
            .try_for_each(|child| child.fmt_indent(f, depth + 1))
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indent(f, 0)
    }
}
