use super::walk::{Adapter, Frame, Visit};
use crate::statement::Policy;

/// Runs every traversal as a scalar loop on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Sequential;

impl Adapter for Sequential {
    #[inline]
    fn traverse(&self, _policy: Policy, extent: usize, frame: &mut Frame, f: &Visit<'_>) {
        (0..extent).for_each(|index| f(frame, index))
    }
}
