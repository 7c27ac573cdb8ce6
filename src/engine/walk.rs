use itertools::{Itertools, izip};

use super::{
    gpu,
    plan::{Node, Program},
};
use crate::{
    body::{Args, Body, Value},
    param::{Params, Slot},
    space::{IterationSpace, Window},
    statement::{Binding, Guard, Policy},
    tile::{LocalTile, Storage, TileDecl},
};

/// Traversal state of one dimension.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Dim {
    pub window: Window,
    /// Number of the innermost tile enclosing the dimension.
    pub tile: usize,
    pub position: usize,
    /// Set while a loop or collapse binds `position`.
    pub active: bool,
}

/// One traversal context: a worker, a GPU thread, or the host thread.
#[derive(Debug, Clone)]
pub(crate) struct Frame {
    pub dims: Vec<Dim>,
    pub slots: Vec<Slot>,
    values: Vec<Value>,
}

impl Frame {
    pub fn new(space: &IterationSpace, params: &Params) -> Self {
        let dims = space
            .iter()
            .map(|segment| Dim {
                window: Window::full(segment),
                tile: 0,
                position: 0,
                active: false,
            })
            .collect();
        let slots = params.iter().map(Slot::from).collect();
        let values = vec![];
        Self { dims, slots, values }
    }

    /// Checks if every actively traversed dimension sits at a position that maps inside its
    /// segment and inside the enclosing tile.
    #[inline]
    pub fn in_bounds(&self, space: &IterationSpace) -> bool {
        izip!(space.iter(), &self.dims).all(|(segment, dim)| {
            !dim.active
                || (segment.contains_position(dim.position) && dim.window.contains(dim.position))
        })
    }
}

pub(crate) type Visit<'a> = dyn Fn(&mut Frame, usize) + Sync + 'a;

/// Maps traversals of the statement tree onto an execution resource.
pub(crate) trait Adapter: Sync {
    /// Calls `f` for every iteration in `0..extent` this executor owns under `policy`.
    fn traverse(&self, policy: Policy, extent: usize, frame: &mut Frame, f: &Visit<'_>);

    /// Waits until every cooperating thread reaches the same barrier.
    fn sync(&self) {}

    fn stage(&self, _slot: usize, _storage: Storage, decl: &TileDecl) -> LocalTile {
        decl.allocate()
    }

    fn invoke(&self, body: &Body, args: &mut Args<'_>) {
        body.call(args)
    }
}

pub(crate) struct Walker<'a, A> {
    pub program: &'a Program,
    pub adapter: &'a A,
}

impl<A: Adapter> Walker<'_, A> {
    pub fn walk(&self, nodes: &[Node], frame: &mut Frame) {
        nodes.iter().for_each(|node| self.visit(node, frame))
    }

    fn visit(&self, node: &Node, frame: &mut Frame) {
        match node {
            &Node::Loop {
                dim,
                policy,
                ref children,
            } => {
                let saved = frame.dims[dim];
                let window = saved.window;
                self.adapter
                    .traverse(policy, window.len, frame, &|frame: &mut Frame, offset: usize| {
                        let dim = &mut frame.dims[dim];
                        dim.position = window.start + offset;
                        dim.active = true;
                        self.walk(children, frame);
                    });
                frame.dims[dim] = saved;
            }
            &Node::Tile {
                dim,
                size,
                policy,
                ref children,
            } => {
                let saved = frame.dims[dim];
                let window = saved.window;
                let count = window.num_tiles(size);
                self.adapter
                    .traverse(policy, count, frame, &|frame: &mut Frame, tile: usize| {
                        let dim = &mut frame.dims[dim];
                        dim.window = window.tile(size, tile);
                        dim.tile = tile;
                        self.walk(children, frame);
                    });
                frame.dims[dim] = saved;
            }
            &Node::Stage {
                ref slots,
                storage,
                ref children,
            } => {
                let saved = slots
                    .iter()
                    .map(|&slot| frame.slots[slot].clone())
                    .collect_vec();
                for &slot in slots {
                    if let Some(decl) = self.program.params[slot].as_tile() {
                        let tile = self.adapter.stage(slot, storage, decl);
                        frame.slots[slot] = Slot::Tile(Some(tile));
                    }
                }
                self.walk(children, frame);
                for (&slot, saved) in izip!(slots, saved) {
                    frame.slots[slot] = saved;
                }
            }
            &Node::Collapse {
                ref dims,
                policy,
                ref children,
            } => {
                let saved = dims.iter().map(|&dim| frame.dims[dim]).collect_vec();
                let windows = saved.iter().map(|dim| dim.window).collect_vec();
                let extent = windows.iter().map(|window| window.len).product();
                self.adapter
                    .traverse(policy, extent, frame, &|frame: &mut Frame, index: usize| {
                        let mut rest = index;
                        for (&dim, window) in izip!(dims, &windows).rev() {
                            let dim = &mut frame.dims[dim];
                            dim.position = window.start + rest % window.len;
                            dim.active = true;
                            rest /= window.len;
                        }
                        self.walk(children, frame);
                    });
                for (&dim, saved) in izip!(dims, saved) {
                    frame.dims[dim] = saved;
                }
            }
            &Node::Invoke {
                body,
                ref bindings,
                guard,
            } => {
                let space = &self.program.space;
                if guard == Guard::InBounds && !frame.in_bounds(space) {
                    return;
                }
                let Frame {
                    dims,
                    slots,
                    values,
                } = frame;
                values.clear();
                values.extend(bindings.iter().map(|&binding| match binding {
                    Binding::Index(dim) => Value::Index(space[dim].index_at(dims[dim].position)),
                    Binding::Offset(dim) => {
                        Value::Offset(dims[dim].position - dims[dim].window.start)
                    }
                    Binding::TileIndex(dim) => Value::TileIndex(dims[dim].tile),
                    Binding::Param(slot) => Value::Slot(slot),
                }));
                let mut args = Args::new(values, slots);
                self.adapter.invoke(&self.program.bodies[body], &mut args);
            }
            Node::Sync => self.adapter.sync(),
            Node::Kernel(launch) => gpu::launch(self.program, launch, frame),
        }
    }
}
