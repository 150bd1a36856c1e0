use std::fmt::Write;

use knotd_store::{Guid, Linkage, LocalId, Store};

use super::{
    AndIter, Budget, COST_FUNCALL, COST_PRIMITIVE, FixedIter, IdIter, IdStep, IterCost,
    PrimSummary, RangeEstimate, Step, Traverse,
};
use crate::Result;

/// Fallback ceiling: with both sides this small, intersect the two
/// enumerations outright instead of building an `and`.
const VIP_SAMPLE_MAX: usize = 8;

/// Source+type subset: primitives whose linkage `l` points at `source`
/// and whose typeguid is `typeguid`. Three creation strategies, best
/// first: a native store index, a planned intersection of the two
/// single-key enumerations, or an eager sampled intersection wrapped in
/// a fixed array.
#[derive(Debug, Clone)]
pub struct VipIter {
    linkage: Linkage,
    source: Guid,
    typeguid: Guid,
    sub: Box<IdIter>,
}

impl VipIter {
    pub fn new(store: &dyn Store, linkage: Linkage, source: Guid, typeguid: Guid) -> IdIter {
        let sub = match store.vip_ids(linkage, source, typeguid) {
            Some(native) => FixedIter::new(native),
            None => {
                let by_link = store.ids_with_linkage(linkage, source);
                let by_type = store.ids_with_linkage(Linkage::Typeguid, typeguid);
                if by_link.len().min(by_type.len()) <= VIP_SAMPLE_MAX {
                    let sample: Vec<LocalId> = by_link
                        .iter()
                        .copied()
                        .filter(|id| by_type.binary_search(id).is_ok())
                        .collect();
                    FixedIter::new(sample)
                } else {
                    AndIter::new(vec![FixedIter::new(by_link), FixedIter::new(by_type)])
                }
            }
        };
        IdIter::Vip(VipIter {
            linkage,
            source,
            typeguid,
            sub: Box::new(sub),
        })
    }

    pub(super) fn wrap(linkage: Linkage, source: Guid, typeguid: Guid, sub: IdIter) -> VipIter {
        VipIter {
            linkage,
            source,
            typeguid,
            sub: Box::new(sub),
        }
    }
}

impl Traverse for VipIter {
    fn next_id(&mut self, store: &dyn Store, budget: &mut Budget) -> IdStep {
        self.sub.next_id(store, budget)
    }

    fn find(&mut self, store: &dyn Store, id: LocalId, budget: &mut Budget) -> IdStep {
        self.sub.find(store, id, budget)
    }

    /// Consult the cheapest oracle: the range bound, then the
    /// subiterator if its check is cheaper than a primitive read, then
    /// the primitive itself.
    fn check(
        &mut self,
        store: &dyn Store,
        id: LocalId,
        budget: &mut Budget,
    ) -> Result<Step<bool>> {
        if budget.exhausted() {
            return Ok(Step::More);
        }
        if !self.sub.range_estimate(store).contains(id) {
            budget.charge(COST_FUNCALL);
            return Ok(Step::Ready(false));
        }
        if self.sub.cost().check <= COST_PRIMITIVE + COST_FUNCALL {
            return self.sub.check(store, id, budget);
        }
        budget.charge(COST_PRIMITIVE);
        let prim = match store.read(id) {
            Ok(prim) => prim,
            Err(err) if err.is_not_found() => return Ok(Step::Ready(false)),
            Err(err) => return Err(err.into()),
        };
        Ok(Step::Ready(
            prim.linkage(self.linkage) == Some(self.source)
                && prim.linkage(Linkage::Typeguid) == Some(self.typeguid),
        ))
    }

    fn statistics(&mut self, store: &dyn Store, budget: &mut Budget) -> Result<Step<IterCost>> {
        match self.sub.statistics(store, budget)? {
            Step::More => Ok(Step::More),
            Step::Ready(_) => Ok(Step::Ready(self.cost())),
        }
    }

    fn cost(&self) -> IterCost {
        // Sort order and per-step costs are the subiterator's; the
        // membership check may shortcut through a primitive read.
        let sub = self.sub.cost();
        IterCost {
            check: sub.check.min(COST_PRIMITIVE + COST_FUNCALL),
            ..sub
        }
    }

    fn reset(&mut self) {
        self.sub.reset();
    }

    fn clone_iter(&self) -> IdIter {
        IdIter::Vip(VipIter {
            linkage: self.linkage,
            source: self.source,
            typeguid: self.typeguid,
            sub: Box::new(self.sub.clone_iter()),
        })
    }

    fn freeze(&self, out: &mut String) {
        let _ = write!(
            out,
            "vip:{},{},{}:{{",
            self.linkage.as_ref(),
            self.source,
            self.typeguid
        );
        self.sub.freeze(out);
        out.push('}');
    }

    fn primitive_summary(&self) -> PrimSummary {
        let mut summary = self.sub.primitive_summary();
        summary.locked[self.linkage.index()] = Some(self.source);
        summary.locked[Linkage::Typeguid.index()] = Some(self.typeguid);
        summary
    }

    fn beyond(&self, store: &dyn Store, id: LocalId) -> bool {
        self.sub.beyond(store, id)
    }

    fn range_estimate(&self, store: &dyn Store) -> RangeEstimate {
        self.sub.range_estimate(store)
    }
}
