use std::fmt::Write;

use knotd_store::{LocalId, Store};

use super::{
    Budget, COST_FUNCALL, IdIter, IdStep, IterCost, NullIter, PrimSummary, RangeEstimate, Step,
    Traverse,
};
use crate::Result;

/// Scan of the id axis over an inclusive window. Every id in the window
/// exists (the store is append-only), so membership is a range test.
#[derive(Debug, Clone, Copy)]
pub struct AllIter {
    low: LocalId,
    high: LocalId,
    pos: LocalId,
}

impl AllIter {
    /// Window `[low, high]`, both sides clamped to the store's contents.
    pub fn new(store: &dyn Store, low: Option<LocalId>, high: Option<LocalId>) -> IdIter {
        let Some(top) = store.horizon().prev() else {
            return NullIter::new();
        };
        let low = low.unwrap_or(LocalId::FIRST).max(LocalId::FIRST);
        let high = high.unwrap_or(top).min(top);
        if low > high {
            return NullIter::new();
        }
        IdIter::All(AllIter {
            low,
            high,
            pos: low,
        })
    }

    pub(super) fn from_parts(low: LocalId, high: LocalId, pos: LocalId) -> AllIter {
        AllIter { low, high, pos }
    }
}

impl Traverse for AllIter {
    fn next_id(&mut self, _store: &dyn Store, budget: &mut Budget) -> IdStep {
        if budget.exhausted() {
            return Ok(Step::More);
        }
        budget.charge(COST_FUNCALL);
        if self.pos > self.high {
            return Ok(Step::Ready(None));
        }
        let id = self.pos;
        self.pos = self.pos.next();
        Ok(Step::Ready(Some(id)))
    }

    fn find(&mut self, store: &dyn Store, id: LocalId, budget: &mut Budget) -> IdStep {
        self.pos = id.max(self.low);
        self.next_id(store, budget)
    }

    fn check(
        &mut self,
        _store: &dyn Store,
        id: LocalId,
        budget: &mut Budget,
    ) -> Result<Step<bool>> {
        if budget.exhausted() {
            return Ok(Step::More);
        }
        budget.charge(COST_FUNCALL);
        Ok(Step::Ready(self.low <= id && id <= self.high))
    }

    fn statistics(&mut self, _store: &dyn Store, _budget: &mut Budget) -> Result<Step<IterCost>> {
        Ok(Step::Ready(self.cost()))
    }

    fn cost(&self) -> IterCost {
        IterCost {
            n: self.high.raw() - self.low.raw() + 1,
            ..IterCost::default()
        }
    }

    fn reset(&mut self) {
        self.pos = self.low;
    }

    fn clone_iter(&self) -> IdIter {
        IdIter::All(*self)
    }

    fn freeze(&self, out: &mut String) {
        let _ = write!(
            out,
            "all:{}-{}@{}",
            self.low.raw(),
            self.high.raw(),
            self.pos.raw()
        );
    }

    fn primitive_summary(&self) -> PrimSummary {
        PrimSummary::default()
    }

    fn beyond(&self, _store: &dyn Store, id: LocalId) -> bool {
        self.pos > self.high || self.pos > id
    }

    fn range_estimate(&self, _store: &dyn Store) -> RangeEstimate {
        RangeEstimate {
            low: self.low,
            high: self.high,
            n: Some(self.high.raw() - self.low.raw() + 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use knotd_store::{Draft, MemStore, Store as _, Timestamp};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::iter::testutil::assert_contract;

    fn store_with(n: u64) -> MemStore {
        let mut store = MemStore::new(1);
        for s in 0..n {
            store.alloc(Draft::node(Timestamp::from_unix(s, 0))).unwrap();
        }
        store.commit().unwrap();
        store
    }

    #[test]
    fn scans_the_window() {
        let store = store_with(5);
        let mut it = AllIter::new(&store, Some(LocalId::new(2)), Some(LocalId::new(4)));
        let ids = it.drain(&store).unwrap();
        assert_eq!(
            ids,
            vec![LocalId::new(2), LocalId::new(3), LocalId::new(4)]
        );
        assert_contract(
            AllIter::new(&store, Some(LocalId::new(2)), Some(LocalId::new(4))),
            &store,
        );
    }

    #[test]
    fn empty_store_degrades_to_null() {
        let store = MemStore::new(1);
        let mut it = AllIter::new(&store, None, None);
        assert!(matches!(it, IdIter::Null(_)));
        assert_eq!(it.drain(&store).unwrap(), vec![]);
    }

    #[test]
    fn budget_suspends_and_resumes() {
        let store = store_with(3);
        let mut it = AllIter::new(&store, None, None);
        let mut tiny = Budget::new(1);
        assert_eq!(
            it.next_id(&store, &mut tiny).unwrap(),
            Step::Ready(Some(LocalId::new(1)))
        );
        assert_eq!(it.next_id(&store, &mut tiny).unwrap(), Step::More);
        let mut fresh = Budget::new(10);
        assert_eq!(
            it.next_id(&store, &mut fresh).unwrap(),
            Step::Ready(Some(LocalId::new(2)))
        );
    }
}
