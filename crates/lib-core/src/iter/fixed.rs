use std::fmt::Write;
use std::rc::Rc;

use knotd_store::{LocalId, Store};

use super::{
    Budget, COST_FUNCALL, IdIter, IdStep, IterCost, PrimSummary, RangeEstimate, Step, Traverse,
};
use crate::Result;

/// A materialized, sorted id array. Exact and cheap: `next` is an index
/// bump, `find` a binary search. Store enumerations and sampled fallbacks
/// all end up here.
#[derive(Debug, Clone)]
pub struct FixedIter {
    ids: Rc<[LocalId]>,
    pos: usize,
}

impl FixedIter {
    pub fn new(mut ids: Vec<LocalId>) -> IdIter {
        ids.sort_unstable();
        ids.dedup();
        IdIter::Fixed(FixedIter {
            ids: ids.into(),
            pos: 0,
        })
    }

    pub(super) fn with_pos(ids: Vec<LocalId>, pos: usize) -> FixedIter {
        let IdIter::Fixed(mut it) = FixedIter::new(ids) else {
            unreachable!()
        };
        it.pos = pos.min(it.ids.len());
        it
    }

    pub fn ids(&self) -> &[LocalId] {
        &self.ids
    }
}

impl Traverse for FixedIter {
    fn next_id(&mut self, _store: &dyn Store, budget: &mut Budget) -> IdStep {
        if budget.exhausted() {
            return Ok(Step::More);
        }
        budget.charge(COST_FUNCALL);
        let id = self.ids.get(self.pos).copied();
        if id.is_some() {
            self.pos += 1;
        }
        Ok(Step::Ready(id))
    }

    fn find(&mut self, _store: &dyn Store, id: LocalId, budget: &mut Budget) -> IdStep {
        if budget.exhausted() {
            return Ok(Step::More);
        }
        budget.charge(COST_FUNCALL);
        self.pos = self.ids.partition_point(|&have| have < id);
        let found = self.ids.get(self.pos).copied();
        if found.is_some() {
            self.pos += 1;
        }
        Ok(Step::Ready(found))
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
        Ok(Step::Ready(self.ids.binary_search(&id).is_ok()))
    }

    fn statistics(&mut self, _store: &dyn Store, _budget: &mut Budget) -> Result<Step<IterCost>> {
        Ok(Step::Ready(self.cost()))
    }

    fn cost(&self) -> IterCost {
        IterCost {
            n: self.ids.len() as u64,
            ..IterCost::default()
        }
    }

    fn reset(&mut self) {
        self.pos = 0;
    }

    fn clone_iter(&self) -> IdIter {
        IdIter::Fixed(FixedIter {
            ids: Rc::clone(&self.ids),
            pos: self.pos,
        })
    }

    fn freeze(&self, out: &mut String) {
        out.push_str("fixed:");
        for (i, id) in self.ids.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            let _ = write!(out, "{id}");
        }
        let _ = write!(out, "@{}", self.pos);
    }

    fn primitive_summary(&self) -> PrimSummary {
        PrimSummary::default()
    }

    fn beyond(&self, _store: &dyn Store, id: LocalId) -> bool {
        self.ids.get(self.pos).is_none_or(|&ahead| ahead > id)
    }

    fn range_estimate(&self, _store: &dyn Store) -> RangeEstimate {
        match (self.ids.first(), self.ids.last()) {
            (Some(&low), Some(&high)) => RangeEstimate {
                low,
                high,
                n: Some(self.ids.len() as u64),
            },
            _ => RangeEstimate::empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use knotd_store::MemStore;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::iter::testutil::assert_contract;

    fn ids(raw: &[u64]) -> Vec<LocalId> {
        raw.iter().map(|&r| LocalId::new(r)).collect()
    }

    #[test]
    fn sorts_and_dedups_input() {
        let store = MemStore::new(1);
        let mut it = FixedIter::new(ids(&[9, 3, 3, 7]));
        assert_eq!(it.drain(&store).unwrap(), ids(&[3, 7, 9]));
    }

    #[test]
    fn find_is_lower_bound_and_advances() {
        let store = MemStore::new(1);
        let mut it = FixedIter::new(ids(&[2, 4, 8]));
        let mut budget = Budget::unlimited();
        assert_eq!(
            it.find(&store, LocalId::new(3), &mut budget).unwrap(),
            Step::Ready(Some(LocalId::new(4)))
        );
        assert_eq!(
            it.next_id(&store, &mut budget).unwrap(),
            Step::Ready(Some(LocalId::new(8)))
        );
        assert_eq!(
            it.find(&store, LocalId::new(9), &mut budget).unwrap(),
            Step::Ready(None)
        );
    }

    #[test]
    fn check_leaves_position_alone() {
        let store = MemStore::new(1);
        let mut it = FixedIter::new(ids(&[2, 4]));
        let mut budget = Budget::unlimited();
        assert_eq!(
            it.check(&store, LocalId::new(4), &mut budget).unwrap(),
            Step::Ready(true)
        );
        assert_eq!(
            it.next_id(&store, &mut budget).unwrap(),
            Step::Ready(Some(LocalId::new(2)))
        );
    }

    #[test]
    fn contract() {
        let store = MemStore::new(1);
        assert_contract(FixedIter::new(ids(&[1, 5, 6, 11])), &store);
        assert_contract(FixedIter::new(vec![]), &store);
    }

    #[test]
    fn beyond_tracks_position() {
        let store = MemStore::new(1);
        let mut it = FixedIter::new(ids(&[2, 10]));
        assert!(!it.beyond(&store, LocalId::new(5)));
        let mut budget = Budget::unlimited();
        it.next_id(&store, &mut budget).unwrap();
        assert!(it.beyond(&store, LocalId::new(5)));
        assert!(!it.beyond(&store, LocalId::new(10)));
    }
}
