//! The GPU thread-block execution model.
//!
//! A kernel entry launches a grid of blocks. Every block thread is a scoped OS thread;
//! `resident_blocks` groups of threads run concurrently, each group taking blocks
//! `g, g + groups, ...` in turn. A group owns one barrier and one instance of every shared
//! tile, both reused by each block it runs.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{
        Barrier, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;

use super::{
    plan::{Launch, LaunchConfig, Program},
    walk::{Adapter, Frame, Visit, Walker},
};
use crate::{
    body::{Args, Body},
    statement::Policy,
    tile::{LocalTile, Storage, TileDecl},
};

/// The first panic raised by a body during a launch.
#[derive(Default)]
struct Fault {
    raised: AtomicBool,
    payload: Mutex<Option<Box<dyn Any + Send>>>,
}

impl Fault {
    #[inline]
    fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    fn raise(&self, payload: Box<dyn Any + Send>) {
        let mut slot = self.payload.lock().expect("failed to lock");
        if slot.is_none() {
            *slot = Some(payload);
        }
        self.raised.store(true, Ordering::Release);
    }

    fn take(self) -> Option<Box<dyn Any + Send>> {
        self.payload.into_inner().unwrap_or_else(|err| err.into_inner())
    }
}

/// Resources shared by the threads of one resident block.
struct Group {
    barrier: Barrier,
    shared: HashMap<usize, LocalTile>,
}

/// Converts a linear id into per-axis coordinates, x fastest.
#[inline]
fn unravel(id: usize, extent: [usize; 3]) -> [usize; 3] {
    let [x, y, _] = extent;
    [id % x, (id / x) % y, id / (x * y)]
}

/// One thread of one block.
pub(crate) struct GpuThread<'a> {
    config: LaunchConfig,
    block: [usize; 3],
    thread: [usize; 3],
    group: &'a Group,
    fault: &'a Fault,
}

impl Adapter for GpuThread<'_> {
    fn traverse(&self, policy: Policy, extent: usize, frame: &mut Frame, f: &Visit<'_>) {
        match policy {
            Policy::Block(axis) => {
                let axis = axis.index();
                (self.block[axis]..extent)
                    .step_by(self.config.grid[axis])
                    .for_each(|index| f(frame, index))
            }
            Policy::Thread(axis) => {
                let index = self.thread[axis.index()];
                if index < extent {
                    f(frame, index)
                }
            }
            Policy::ThreadLoop(axis) => {
                let axis = axis.index();
                (self.thread[axis]..extent)
                    .step_by(self.config.block[axis])
                    .for_each(|index| f(frame, index))
            }
            Policy::Seq | Policy::Parallel => (0..extent).for_each(|index| f(frame, index)),
        }
    }

    fn sync(&self) {
        log::trace!("barrier: block {:?}, thread {:?}", self.block, self.thread);
        self.group.barrier.wait();
    }

    fn stage(&self, slot: usize, storage: Storage, decl: &TileDecl) -> LocalTile {
        match storage {
            Storage::Shared => match self.group.shared.get(&slot) {
                Some(tile) => tile.clone(),
                None => decl.allocate(),
            },
            Storage::Stack => decl.allocate(),
        }
    }

    /// After a body panics, the remaining bodies of the launch are skipped while every
    /// thread keeps arriving at its barriers.
    fn invoke(&self, body: &Body, args: &mut Args<'_>) {
        if self.fault.is_raised() {
            return;
        }
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| body.call(args))) {
            self.fault.raise(payload);
        }
    }
}

#[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
pub(crate) fn launch(program: &Program, launch: &Launch, frame: &Frame) {
    let Launch {
        config,
        shared,
        children,
    } = launch;
    let config = *config;
    let num_blocks = config.num_blocks();
    let block_size = config.block_size();
    let groups = program.resident_blocks.clamp(1, num_blocks.max(1));
    log::debug!(
        "launch: grid {:?}, block {:?}, {groups} resident blocks",
        config.grid,
        config.block
    );

    let fault = Fault::default();
    let resources = (0..groups)
        .map(|_| {
            let barrier = Barrier::new(block_size);
            let shared = shared
                .iter()
                .filter_map(|&slot| Some((slot, program.params[slot].as_tile()?.allocate())))
                .collect();
            Group { barrier, shared }
        })
        .collect_vec();

    thread::scope(|scope| {
        for (index, group) in resources.iter().enumerate() {
            for thread in 0..block_size {
                let fault = &fault;
                scope.spawn(move || {
                    let thread = unravel(thread, config.block);
                    for id in (index..num_blocks).step_by(groups) {
                        group.barrier.wait();
                        let block = unravel(id, config.grid);
                        let adapter = GpuThread {
                            config,
                            block,
                            thread,
                            group,
                            fault,
                        };
                        let walker = Walker {
                            program,
                            adapter: &adapter,
                        };
                        let mut frame = frame.clone();
                        walker.walk(children, &mut frame);
                    }
                });
            }
        }
    });

    if let Some(payload) = fault.take() {
        log::debug!("launch: resuming a panic raised by a body");
        panic::resume_unwind(payload);
    }
}
