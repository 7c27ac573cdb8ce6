//! Construction-time validation of a statement tree into an executable plan.

use itertools::Itertools;

use super::{Backend, KernelError, Limits};
use crate::{
    body::{Arg, Body},
    param::{Param, Params},
    space::IterationSpace,
    statement::{Axis, Binding, Guard, Policy, Statement},
    tile::Storage,
};

/// A validated statement. Policies are resolved for the target backend.
#[derive(Debug, Clone)]
pub(crate) enum Node {
    Loop {
        dim: usize,
        policy: Policy,
        children: Vec<Node>,
    },
    Tile {
        dim: usize,
        size: usize,
        policy: Policy,
        children: Vec<Node>,
    },
    Stage {
        slots: Vec<usize>,
        storage: Storage,
        children: Vec<Node>,
    },
    Collapse {
        dims: Vec<usize>,
        policy: Policy,
        children: Vec<Node>,
    },
    Invoke {
        body: usize,
        bindings: Vec<Binding>,
        guard: Guard,
    },
    Sync,
    Kernel(Launch),
}

/// Grid and block extents of one kernel entry, per [`Axis`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LaunchConfig {
    pub grid: [usize; 3],
    pub block: [usize; 3],
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            grid: [1; 3],
            block: [1; 3],
        }
    }
}

impl LaunchConfig {
    #[inline]
    pub fn num_blocks(&self) -> usize {
        self.grid.iter().product()
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block.iter().product()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Launch {
    pub config: LaunchConfig,
    /// Slots staged with shared storage anywhere in the kernel.
    pub shared: Vec<usize>,
    pub children: Vec<Node>,
}

/// Everything a kernel needs at execution time.
#[derive(Debug)]
pub(crate) struct Program {
    pub space: IterationSpace,
    pub params: Params,
    pub bodies: Vec<Body>,
    pub nodes: Vec<Node>,
    pub resident_blocks: usize,
}

impl Program {
    pub fn launches(&self) -> Vec<LaunchConfig> {
        fn collect(nodes: &[Node], output: &mut Vec<LaunchConfig>) {
            for node in nodes {
                match node {
                    Node::Loop { children, .. }
                    | Node::Tile { children, .. }
                    | Node::Stage { children, .. }
                    | Node::Collapse { children, .. } => collect(children, output),
                    Node::Kernel(launch) => output.push(launch.config),
                    Node::Invoke { .. } | Node::Sync => {}
                }
            }
        }
        let mut output = vec![];
        collect(&self.nodes, &mut output);
        output
    }
}

/// Scope state while walking the tree once at build time.
pub(crate) struct Planner<'a> {
    space: &'a IterationSpace,
    params: &'a Params,
    bodies: &'a [Body],
    backend: Backend,
    limits: Limits,
    /// Dimensions bound by an enclosing loop or collapse.
    active: Vec<bool>,
    /// Inner policies of the enclosing tiles per dimension, innermost last.
    tiles: Vec<Vec<Policy>>,
    /// Maximum window length per dimension.
    extent: Vec<usize>,
    staged: Vec<bool>,
    /// Bodies referenced by an invoke so far.
    invoked: Vec<bool>,
    /// Number of enclosing thread-mapped traversals.
    threads: usize,
    kernel: Option<(LaunchConfig, Vec<usize>)>,
}

impl<'a> Planner<'a> {
    pub fn new(
        space: &'a IterationSpace,
        params: &'a Params,
        bodies: &'a [Body],
        backend: Backend,
        limits: Limits,
    ) -> Self {
        let rank = space.rank();
        Self {
            space,
            params,
            bodies,
            backend,
            limits,
            active: vec![false; rank],
            tiles: vec![vec![]; rank],
            extent: space.iter().map(|segment| segment.len()).collect(),
            staged: vec![false; params.arity()],
            invoked: vec![false; bodies.len()],
            threads: 0,
            kernel: None,
        }
    }

    pub fn plan(mut self, statements: &[Statement]) -> Result<Vec<Node>, KernelError> {
        let nodes = self.nodes(statements)?;
        if let Some(body) = self.invoked.iter().position(|&invoked| !invoked) {
            let count = self.bodies.len();
            return Err(KernelError::Unused { body, count });
        }
        Ok(nodes)
    }

    fn nodes(&mut self, statements: &[Statement]) -> Result<Vec<Node>, KernelError> {
        statements.iter().map(|x| self.node(x)).collect()
    }

    fn check_dim(&self, dim: usize) -> Result<usize, KernelError> {
        let rank = self.space.rank();
        if dim >= rank {
            return Err(KernelError::Dimension { dim, rank });
        }
        Ok(dim)
    }

    fn check_inactive(&self, dim: usize) -> Result<usize, KernelError> {
        let dim = self.check_dim(dim)?;
        if self.active[dim] {
            return Err(KernelError::Active(dim));
        }
        Ok(dim)
    }

    fn check_slot(&self, slot: usize) -> Result<&'a Param, KernelError> {
        let params = self.params;
        let arity = params.arity();
        params.get(slot).ok_or(KernelError::Slot { slot, arity })
    }

    /// Resolves `policy` for the backend and the current kernel scope.
    fn check_policy(&self, policy: Policy) -> Result<Policy, KernelError> {
        let backend = self.backend;
        match (policy, backend) {
            (Policy::Seq, _) => Ok(Policy::Seq),
            (Policy::Parallel, Backend::Sequential) => Ok(Policy::Seq),
            (Policy::Parallel, Backend::HostParallel) if !cfg!(feature = "rayon") => Ok(Policy::Seq),
            (Policy::Parallel, Backend::HostParallel) => Ok(Policy::Parallel),
            (Policy::Parallel, Backend::Gpu) => Err(KernelError::Policy { policy, backend }),
            (_, Backend::Gpu) if self.kernel.is_some() => Ok(policy),
            (_, Backend::Gpu) => Err(KernelError::OutsideKernel(policy)),
            (_, backend) => Err(KernelError::Policy { policy, backend }),
        }
    }

    /// Records the extent a GPU-mapped traversal needs from the launch.
    fn map(&mut self, policy: Policy, extent: usize) {
        let max_threads_per_axis = self.limits.max_threads_per_axis;
        let Some((config, _)) = self.kernel.as_mut() else {
            return;
        };
        match policy {
            Policy::Block(axis) => {
                let grid = &mut config.grid[axis.index()];
                *grid = (*grid).max(extent);
            }
            Policy::Thread(axis) => {
                let block = &mut config.block[axis.index()];
                *block = (*block).max(extent);
            }
            Policy::ThreadLoop(axis) => {
                let block = &mut config.block[axis.index()];
                *block = (*block).max(extent.min(max_threads_per_axis));
            }
            Policy::Seq | Policy::Parallel => {}
        }
    }

    fn mapped(
        &mut self,
        policy: Policy,
        children: &[Statement],
    ) -> Result<Vec<Node>, KernelError> {
        let thread = policy.is_thread() as usize;
        self.threads += thread;
        let children = self.nodes(children)?;
        self.threads -= thread;
        Ok(children)
    }

    fn node(&mut self, statement: &Statement) -> Result<Node, KernelError> {
        match statement {
            Statement::Loop {
                dim,
                policy,
                children,
            } => {
                let dim = self.check_inactive(*dim)?;
                let policy = match policy {
                    Some(policy) => *policy,
                    None => match self.tiles[dim].last() {
                        Some(&policy) => policy,
                        None => return Err(KernelError::Untiled(dim)),
                    },
                };
                let policy = self.check_policy(policy)?;
                self.map(policy, self.extent[dim]);

                self.active[dim] = true;
                let children = self.mapped(policy, children)?;
                self.active[dim] = false;

                Ok(Node::Loop {
                    dim,
                    policy,
                    children,
                })
            }
            Statement::Tile { tile, children } => {
                let tile = tile.check()?;
                let dim = self.check_inactive(tile.dim)?;
                let size = tile.size;
                let policy = self.check_policy(tile.outer)?;
                let extent = self.extent[dim];
                self.map(policy, tile.num_tiles(extent));

                self.extent[dim] = size;
                self.tiles[dim].push(tile.inner);
                let children = self.mapped(policy, children)?;
                self.tiles[dim].pop();
                self.extent[dim] = extent;

                Ok(Node::Tile {
                    dim,
                    size,
                    policy,
                    children,
                })
            }
            Statement::Stage {
                slots,
                storage,
                children,
            } => {
                for &slot in slots {
                    if self.check_slot(slot)?.as_tile().is_none() {
                        return Err(KernelError::NotTile(slot));
                    }
                    if self.staged[slot] {
                        return Err(KernelError::Restaged(slot));
                    }
                    self.staged[slot] = true;
                }
                if let Storage::Shared = storage {
                    let backend = self.backend;
                    let Some((_, shared)) = self.kernel.as_mut() else {
                        let storage = *storage;
                        return Err(KernelError::Storage { storage, backend });
                    };
                    for &slot in slots {
                        if !shared.contains(&slot) {
                            shared.push(slot);
                        }
                    }
                }

                let children = self.nodes(children)?;
                slots.iter().for_each(|&slot| self.staged[slot] = false);

                let slots = slots.clone();
                let storage = *storage;
                Ok(Node::Stage {
                    slots,
                    storage,
                    children,
                })
            }
            Statement::Collapse {
                dims,
                policy,
                children,
            } => {
                if dims.is_empty() {
                    return Err(KernelError::EmptyCollapse);
                }
                if let Some(&dim) = dims.iter().duplicates().next() {
                    return Err(KernelError::DuplicateDim(dim));
                }
                for &dim in dims {
                    self.check_inactive(dim)?;
                }
                let policy = self.check_policy(*policy)?;
                if policy.is_gpu() {
                    let backend = self.backend;
                    return Err(KernelError::Policy { policy, backend });
                }

                dims.iter().for_each(|&dim| self.active[dim] = true);
                let children = self.nodes(children)?;
                dims.iter().for_each(|&dim| self.active[dim] = false);

                let dims = dims.clone();
                Ok(Node::Collapse {
                    dims,
                    policy,
                    children,
                })
            }
            Statement::Invoke {
                body,
                bindings,
                guard,
            } => {
                let body = *body;
                self.check_invoke(body, bindings)?;
                self.invoked[body] = true;
                let bindings = bindings.clone();
                let guard = *guard;
                Ok(Node::Invoke {
                    body,
                    bindings,
                    guard,
                })
            }
            Statement::Sync => match self.threads {
                0 => Ok(Node::Sync),
                _ => Err(KernelError::DivergentBarrier),
            },
            Statement::Kernel { children } => {
                if self.kernel.is_some() {
                    return Err(KernelError::NestedKernel);
                }
                if self.backend != Backend::Gpu {
                    return Err(KernelError::Kernel(self.backend));
                }

                self.kernel = Some(Default::default());
                let children = self.nodes(children)?;
                let (config, shared) = self.kernel.take().unwrap_or_default();
                self.check_launch(&config)?;

                log::debug!(
                    "kernel entry: grid {:?}, block {:?}, shared slots [{}]",
                    config.grid,
                    config.block,
                    shared.iter().format(", ")
                );
                Ok(Node::Kernel(Launch {
                    config,
                    shared,
                    children,
                }))
            }
        }
    }

    fn check_invoke(&self, body: usize, bindings: &[Binding]) -> Result<(), KernelError> {
        let count = self.bodies.len();
        let signature = match self.bodies.get(body) {
            Some(x) => x.signature(),
            None => return Err(KernelError::Body { body, count }),
        };
        if signature.len() != bindings.len() {
            let expected = signature.len();
            let actual = bindings.len();
            return Err(KernelError::Arity {
                body,
                expected,
                actual,
            });
        }

        for (position, (binding, &expected)) in itertools::zip_eq(bindings, signature).enumerate()
        {
            let actual = match *binding {
                Binding::Index(dim) | Binding::Offset(dim) => {
                    let dim = self.check_dim(dim)?;
                    if !self.active[dim] {
                        return Err(KernelError::Inactive { body, dim });
                    }
                    match binding {
                        Binding::Index(_) => Arg::Index,
                        _ => Arg::Offset,
                    }
                }
                Binding::TileIndex(dim) => {
                    let dim = self.check_dim(dim)?;
                    if self.tiles[dim].is_empty() {
                        return Err(KernelError::Untiled(dim));
                    }
                    Arg::TileIndex
                }
                Binding::Param(slot) => {
                    let param = self.check_slot(slot)?;
                    if param.as_tile().is_some() && !self.staged[slot] {
                        return Err(KernelError::Unstaged { body, slot });
                    }
                    param.arg()
                }
            };
            if actual != expected {
                return Err(KernelError::Binding {
                    body,
                    position,
                    expected,
                    actual,
                });
            }
        }
        Ok(())
    }

    fn check_launch(&self, config: &LaunchConfig) -> Result<(), KernelError> {
        let Limits {
            max_threads_per_block,
            max_threads_per_axis,
        } = self.limits;
        for axis in Axis::ALL {
            let threads = config.block[axis.index()];
            if threads > max_threads_per_axis {
                let limit = max_threads_per_axis;
                return Err(KernelError::Launch { threads, limit });
            }
        }
        let threads = config.block_size();
        if threads > max_threads_per_block {
            let limit = max_threads_per_block;
            return Err(KernelError::Launch { threads, limit });
        }
        Ok(())
    }
}
