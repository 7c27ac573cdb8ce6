use rayon::prelude::*;

use super::walk::{Adapter, Frame, Visit};
use crate::statement::Policy;

/// Distributes `Parallel` traversals across a fixed-size worker pool.
///
/// Each worker continues with its own copy of the frame: scalar slots are private and
/// writes to them do not escape the region. Tiles staged before the region are shared by
/// handle; tiles staged inside it are allocated per visit.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HostParallel<'a> {
    pool: &'a rayon::ThreadPool,
}

impl<'a> HostParallel<'a> {
    #[inline]
    pub fn new(pool: &'a rayon::ThreadPool) -> Self {
        Self { pool }
    }
}

impl Adapter for HostParallel<'_> {
    fn traverse(&self, policy: Policy, extent: usize, frame: &mut Frame, f: &Visit<'_>) {
        match policy {
            Policy::Parallel => {
                log::trace!(
                    "parallel region: {extent} iterations on {} workers",
                    self.pool.current_num_threads()
                );
                let frame: &Frame = frame;
                self.pool.install(|| {
                    (0..extent)
                        .into_par_iter()
                        .for_each_with(frame.clone(), |frame, index| f(frame, index))
                });
            }
            _ => (0..extent).for_each(|index| f(frame, index)),
        }
    }
}
