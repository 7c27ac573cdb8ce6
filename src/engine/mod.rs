//! Validation and interpretation of statement trees on a selected backend.

use std::sync::Arc;

use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    body::{Arg, Body},
    layout::LayoutError,
    param::{Param, Params},
    space::{IterationSpace, SpaceError},
    statement::{Policy, Statement},
    tile::Storage,
};

mod gpu;
#[cfg(feature = "rayon")]
mod parallel;
mod plan;
mod sequential;
#[cfg(test)]
mod tests;
mod walk;

pub use plan::LaunchConfig;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Backend {
    /// One thread, document order.
    #[default]
    #[display("sequential")]
    Sequential,
    /// `Parallel` traversals run on a fixed-size worker pool.
    #[display("host-parallel")]
    HostParallel,
    /// Kernel entries run in the thread-block model.
    #[display("gpu")]
    Gpu,
}

/// Bounds on the launch configuration of a kernel entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Limits {
    pub max_threads_per_block: usize,
    pub max_threads_per_axis: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_threads_per_block: 1024,
            max_threads_per_axis: 1024,
        }
    }
}

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("iteration space error")]
    Space(#[from] SpaceError),
    #[error("tile layout error")]
    Layout(#[from] LayoutError),
    #[error("dimension {dim} out of range for rank {rank}")]
    Dimension { dim: usize, rank: usize },
    #[error("parameter slot {slot} out of range for arity {arity}")]
    Slot { slot: usize, arity: usize },
    #[error("body {body} out of range for {count} bodies")]
    Body { body: usize, count: usize },
    #[error("body {body} takes {expected} arguments, but {actual} are bound")]
    Arity {
        body: usize,
        expected: usize,
        actual: usize,
    },
    #[error("body {body} of {count} bodies is never invoked")]
    Unused { body: usize, count: usize },
    #[error("body {body} argument {position} expects {expected}, but {actual} is bound")]
    Binding {
        body: usize,
        position: usize,
        expected: Arg,
        actual: Arg,
    },
    #[error("body {body} binds dimension {dim} outside any traversal of it")]
    Inactive { body: usize, dim: usize },
    #[error("dimension {0} is not tiled here")]
    Untiled(usize),
    #[error("body {body} binds tile slot {slot} outside any stage of it")]
    Unstaged { body: usize, slot: usize },
    #[error("parameter slot {0} is not a tile")]
    NotTile(usize),
    #[error("tile slot {0} is already staged")]
    Restaged(usize),
    #[error("dimension {0} is already traversed by an enclosing statement")]
    Active(usize),
    #[error("policy {policy} is not supported here on the {backend} backend")]
    Policy { policy: Policy, backend: Backend },
    #[error("{storage} storage is not supported here on the {backend} backend")]
    Storage { storage: Storage, backend: Backend },
    #[error("kernel entry on the {0} backend")]
    Kernel(Backend),
    #[error("kernel entries cannot nest")]
    NestedKernel,
    #[error("policy {0} outside a kernel entry")]
    OutsideKernel(Policy),
    #[error("barrier under a thread-mapped traversal")]
    DivergentBarrier,
    #[error("launch needs {threads} threads, limit is {limit}")]
    Launch { threads: usize, limit: usize },
    #[error("collapse lists no dimensions")]
    EmptyCollapse,
    #[error("dimension {0} listed twice")]
    DuplicateDim(usize),
    #[error("engine config error: {0}")]
    Config(&'static str),
    #[cfg(feature = "rayon")]
    #[error("failed to build thread pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// A configured backend. Cheap to clone; clones share the worker pool.
#[derive(Debug, Clone)]
pub struct Engine {
    backend: Backend,
    limits: Limits,
    resident_blocks: usize,
    #[cfg(feature = "rayon")]
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl Engine {
    #[inline]
    pub fn backend(&self) -> Backend {
        self.backend
    }

    #[inline]
    pub fn limits(&self) -> Limits {
        self.limits
    }

    #[inline]
    pub fn resident_blocks(&self) -> usize {
        self.resident_blocks
    }

    /// Number of host workers available to `Parallel` traversals.
    pub fn num_threads(&self) -> usize {
        #[cfg(feature = "rayon")]
        if let Some(pool) = &self.pool {
            return pool.current_num_threads();
        }
        1
    }
}

#[derive(Debug, Clone)]
pub struct EngineBuilder {
    pub backend: Backend,
    /// Worker count of the host-parallel pool; `None` lets the pool decide.
    pub threads: Option<usize>,
    pub limits: Limits,
    /// Number of blocks a GPU launch runs concurrently.
    pub resident_blocks: usize,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            backend: Backend::default(),
            threads: None,
            limits: Limits::default(),
            resident_blocks: 1,
        }
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn resident_blocks(mut self, resident_blocks: usize) -> Self {
        self.resident_blocks = resident_blocks;
        self
    }

    pub fn build(self) -> Result<Engine, KernelError> {
        let Self {
            backend,
            threads,
            limits,
            resident_blocks,
        } = self;

        if threads == Some(0) {
            return Err(KernelError::Config("thread count must be positive"));
        }
        if resident_blocks == 0 {
            return Err(KernelError::Config("resident block count must be positive"));
        }
        if limits.max_threads_per_block == 0 || limits.max_threads_per_axis == 0 {
            return Err(KernelError::Config("launch limits must be positive"));
        }

        #[cfg(feature = "rayon")]
        let pool = match backend {
            Backend::HostParallel => {
                let builder = rayon::ThreadPoolBuilder::new()
                    .thread_name(|index| format!("weft-worker-{index}"));
                let builder = match threads {
                    Some(threads) => builder.num_threads(threads),
                    None => builder,
                };
                Some(Arc::new(builder.build()?))
            }
            _ => None,
        };
        #[cfg(not(feature = "rayon"))]
        if backend == Backend::HostParallel {
            log::warn!("host-parallel backend without the `rayon` feature runs sequentially");
        }

        log::debug!("engine: {backend} backend, {limits:?}, {resident_blocks} resident blocks");
        Ok(Engine {
            backend,
            limits,
            resident_blocks,
            #[cfg(feature = "rayon")]
            pool,
        })
    }
}

/// A validated, executable statement tree bound to its space, parameters and bodies.
#[derive(Debug, Clone)]
pub struct Kernel {
    engine: Engine,
    program: Arc<plan::Program>,
}

impl Kernel {
    #[inline]
    pub fn space(&self) -> &IterationSpace {
        &self.program.space
    }

    #[inline]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Launch configurations of the kernel entries, in document order.
    pub fn launches(&self) -> Vec<LaunchConfig> {
        self.program.launches()
    }

    /// Walks the tree once.
    ///
    /// # Panics
    /// A panic raised by a body propagates to the caller.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn execute(&self) {
        let program = &*self.program;
        let mut frame = walk::Frame::new(&program.space, &program.params);

        #[cfg(feature = "rayon")]
        if let Some(pool) = &self.engine.pool {
            let adapter = parallel::HostParallel::new(pool);
            let walker = walk::Walker {
                program,
                adapter: &adapter,
            };
            walker.walk(&program.nodes, &mut frame);
            return;
        }

        let adapter = sequential::Sequential;
        let walker = walk::Walker {
            program,
            adapter: &adapter,
        };
        walker.walk(&program.nodes, &mut frame);
    }
}

#[derive(Debug, Clone)]
pub struct KernelBuilder {
    space: IterationSpace,
    params: Params,
    bodies: Vec<Body>,
    tree: Vec<Statement>,
}

impl KernelBuilder {
    pub fn new(space: impl Into<IterationSpace>) -> Self {
        Self {
            space: space.into(),
            params: Params::new(),
            bodies: vec![],
            tree: vec![],
        }
    }

    /// Replaces the parameter tuple.
    pub fn params(mut self, params: impl Into<Params>) -> Self {
        self.params = params.into();
        self
    }

    /// Appends one slot to the parameter tuple.
    pub fn param(mut self, param: impl Into<Param>) -> Self {
        self.params.push(param.into());
        self
    }

    /// Appends a body; bodies are numbered in insertion order.
    pub fn body(mut self, body: Body) -> Self {
        self.bodies.push(body);
        self
    }

    pub fn bodies(mut self, bodies: impl IntoIterator<Item = Body>) -> Self {
        self.bodies.extend(bodies);
        self
    }

    pub fn tree(mut self, tree: impl Into<Vec<Statement>>) -> Self {
        self.tree = tree.into();
        self
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn build(self, engine: &Engine) -> Result<Kernel, KernelError> {
        let Self {
            space,
            params,
            bodies,
            tree,
        } = self;

        space.check()?;
        let nodes = plan::Planner::new(
            &space,
            &params,
            &bodies,
            engine.backend,
            engine.limits,
        )
        .plan(&tree)?;

        log::debug!(
            "kernel: space {space}, params {params}, {} bodies, {} statements",
            bodies.len(),
            tree.iter().map(Statement::count).sum::<usize>()
        );
        let program = plan::Program {
            space,
            params,
            bodies,
            nodes,
            resident_blocks: engine.resident_blocks,
        };
        let program = Arc::new(program);
        let engine = engine.clone();
        Ok(Kernel { engine, program })
    }
}

/// Validates and runs a statement tree once.
///
/// Nothing runs if the tree, parameters or bodies are inconsistent.
pub fn execute(
    engine: &Engine,
    space: impl Into<IterationSpace>,
    tree: impl Into<Vec<Statement>>,
    params: impl Into<Params>,
    bodies: impl IntoIterator<Item = Body>,
) -> Result<(), KernelError> {
    let kernel = KernelBuilder::new(space)
        .params(params)
        .bodies(bodies)
        .tree(tree)
        .build(engine)?;
    kernel.execute();
    Ok(())
}
