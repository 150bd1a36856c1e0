use std::fmt::Write;

use knotd_store::{LocalId, Store};

use super::{Budget, IdIter, IdStep, IterCost, PrimSummary, RangeEstimate, Step, Traverse};
use crate::Result;

/// Set difference: everything the producer yields that the checker does
/// not contain. Ordering and range come from the producer.
#[derive(Debug, Clone)]
pub struct WithoutIter {
    producer: Box<IdIter>,
    checker: Box<IdIter>,
    /// Candidate pulled from the producer but not yet cleared by the
    /// checker; survives a `More` suspension mid-step.
    pending: Option<LocalId>,
}

impl WithoutIter {
    pub fn new(producer: IdIter, checker: IdIter) -> IdIter {
        IdIter::Without(WithoutIter {
            producer: Box::new(producer),
            checker: Box::new(checker),
            pending: None,
        })
    }

    pub(super) fn with_pending(
        producer: IdIter,
        checker: IdIter,
        pending: Option<LocalId>,
    ) -> WithoutIter {
        WithoutIter {
            producer: Box::new(producer),
            checker: Box::new(checker),
            pending,
        }
    }

    /// Screen `pending` (and further producer output) through the
    /// checker until something survives.
    fn screen(&mut self, store: &dyn Store, budget: &mut Budget) -> IdStep {
        loop {
            let id = match self.pending {
                Some(id) => id,
                None => match self.producer.next_id(store, budget)? {
                    Step::More => return Ok(Step::More),
                    Step::Ready(None) => return Ok(Step::Ready(None)),
                    Step::Ready(Some(id)) => {
                        self.pending = Some(id);
                        id
                    }
                },
            };
            match self.checker.check(store, id, budget)? {
                Step::More => return Ok(Step::More),
                Step::Ready(true) => {
                    self.pending = None;
                }
                Step::Ready(false) => {
                    self.pending = None;
                    return Ok(Step::Ready(Some(id)));
                }
            }
        }
    }
}

impl Traverse for WithoutIter {
    fn next_id(&mut self, store: &dyn Store, budget: &mut Budget) -> IdStep {
        self.screen(store, budget)
    }

    fn find(&mut self, store: &dyn Store, id: LocalId, budget: &mut Budget) -> IdStep {
        if self.pending.is_none() {
            match self.producer.find(store, id, budget)? {
                Step::More => return Ok(Step::More),
                Step::Ready(None) => return Ok(Step::Ready(None)),
                Step::Ready(Some(found)) => self.pending = Some(found),
            }
        }
        self.screen(store, budget)
    }

    fn check(
        &mut self,
        store: &dyn Store,
        id: LocalId,
        budget: &mut Budget,
    ) -> Result<Step<bool>> {
        match self.producer.check(store, id, budget)? {
            Step::More => Ok(Step::More),
            Step::Ready(false) => Ok(Step::Ready(false)),
            Step::Ready(true) => Ok(self
                .checker
                .check(store, id, budget)?
                .map(|excluded| !excluded)),
        }
    }

    fn statistics(&mut self, store: &dyn Store, budget: &mut Budget) -> Result<Step<IterCost>> {
        if self.producer.statistics(store, budget)?.is_more() {
            return Ok(Step::More);
        }
        if self.checker.statistics(store, budget)?.is_more() {
            return Ok(Step::More);
        }
        Ok(Step::Ready(self.cost()))
    }

    fn cost(&self) -> IterCost {
        let p = self.producer.cost();
        let c = self.checker.cost();
        IterCost {
            check: p.check + c.check,
            next: p.next + c.check,
            find: p.find + c.check,
            n: p.n,
            sorted: p.sorted,
            forward: p.forward,
        }
    }

    fn reset(&mut self) {
        self.producer.reset();
        self.checker.reset();
        self.pending = None;
    }

    fn clone_iter(&self) -> IdIter {
        IdIter::Without(WithoutIter {
            producer: Box::new(self.producer.clone_iter()),
            checker: Box::new(self.checker.clone_iter()),
            pending: self.pending,
        })
    }

    fn freeze(&self, out: &mut String) {
        out.push_str("without:{");
        self.producer.freeze(out);
        out.push_str("}{");
        self.checker.freeze(out);
        out.push('}');
        match self.pending {
            Some(id) => {
                let _ = write!(out, "@{id}");
            }
            None => out.push_str("@-"),
        }
    }

    fn primitive_summary(&self) -> PrimSummary {
        self.producer.primitive_summary()
    }

    fn beyond(&self, store: &dyn Store, id: LocalId) -> bool {
        match self.pending {
            Some(p) => p > id,
            None => self.producer.beyond(store, id),
        }
    }

    fn range_estimate(&self, store: &dyn Store) -> RangeEstimate {
        self.producer.range_estimate(store)
    }
}

#[cfg(test)]
mod tests {
    use knotd_store::MemStore;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::iter::FixedIter;
    use crate::iter::testutil::assert_contract;

    fn ids(raw: &[u64]) -> Vec<LocalId> {
        raw.iter().map(|&r| LocalId::new(r)).collect()
    }

    fn diff(produce: &[u64], exclude: &[u64]) -> IdIter {
        WithoutIter::new(
            FixedIter::new(ids(produce)),
            FixedIter::new(ids(exclude)),
        )
    }

    #[test]
    fn subtracts_the_checker() {
        let store = MemStore::new(1);
        let mut it = diff(&[1, 2, 3, 4, 5], &[2, 4]);
        assert_eq!(it.drain(&store).unwrap(), ids(&[1, 3, 5]));
        assert_contract(diff(&[1, 2, 3, 4, 5], &[2, 4]), &store);
    }

    #[test]
    fn check_is_yes_minus_yes() {
        let store = MemStore::new(1);
        let mut it = diff(&[1, 2, 3], &[2]);
        let mut budget = Budget::unlimited();
        for (id, expect) in [(1, true), (2, false), (3, true), (9, false)] {
            assert_eq!(
                it.check(&store, LocalId::new(id), &mut budget).unwrap(),
                Step::Ready(expect),
                "check({id})"
            );
        }
    }

    #[test]
    fn find_filters_past_exclusions() {
        let store = MemStore::new(1);
        let mut it = diff(&[1, 2, 3, 4], &[2, 3]);
        let mut budget = Budget::unlimited();
        assert_eq!(
            it.find(&store, LocalId::new(2), &mut budget).unwrap(),
            Step::Ready(Some(LocalId::new(4)))
        );
    }

    #[test]
    fn suspension_keeps_the_candidate() {
        let store = MemStore::new(1);
        let mut it = diff(&[1, 2], &[1]);
        // Enough for the first produce, not for its check.
        let mut budget = Budget::new(1);
        assert_eq!(it.next_id(&store, &mut budget).unwrap(), Step::More);
        let mut fresh = Budget::unlimited();
        assert_eq!(
            it.next_id(&store, &mut fresh).unwrap(),
            Step::Ready(Some(LocalId::new(2)))
        );
    }

    #[test]
    fn cost_adds_checker_to_every_operation() {
        let it = diff(&[1, 2, 3], &[2]);
        let cost = it.cost();
        assert!(cost.next >= 2);
        assert!(cost.check >= 2);
        assert_eq!(cost.n, 3);
        assert!(cost.sorted);
    }
}
