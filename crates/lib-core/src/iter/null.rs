use knotd_store::{LocalId, Store};

use super::{Budget, IdIter, IdStep, IterCost, PrimSummary, RangeEstimate, Step, Traverse};
use crate::Result;

/// The empty set. Statically-false constraints plan to this.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullIter;

impl NullIter {
    pub fn new() -> IdIter {
        IdIter::Null(NullIter)
    }
}

impl Traverse for NullIter {
    fn next_id(&mut self, _store: &dyn Store, _budget: &mut Budget) -> IdStep {
        Ok(Step::Ready(None))
    }

    fn find(&mut self, _store: &dyn Store, _id: LocalId, _budget: &mut Budget) -> IdStep {
        Ok(Step::Ready(None))
    }

    fn check(
        &mut self,
        _store: &dyn Store,
        _id: LocalId,
        _budget: &mut Budget,
    ) -> Result<Step<bool>> {
        Ok(Step::Ready(false))
    }

    fn statistics(&mut self, _store: &dyn Store, _budget: &mut Budget) -> Result<Step<IterCost>> {
        Ok(Step::Ready(self.cost()))
    }

    fn cost(&self) -> IterCost {
        IterCost::default()
    }

    fn reset(&mut self) {}

    fn clone_iter(&self) -> IdIter {
        IdIter::Null(*self)
    }

    fn freeze(&self, out: &mut String) {
        out.push_str("null:");
    }

    fn primitive_summary(&self) -> PrimSummary {
        PrimSummary::default()
    }

    fn beyond(&self, _store: &dyn Store, _id: LocalId) -> bool {
        true
    }

    fn range_estimate(&self, _store: &dyn Store) -> RangeEstimate {
        RangeEstimate::empty()
    }
}
