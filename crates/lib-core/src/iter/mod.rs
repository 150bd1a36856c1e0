//! The iterator algebra: cost-annotated sequence sources over primitive
//! ids, all speaking the same contract so the planner can compose them.
//!
//! Every operation takes a [`Budget`] and may come back with
//! [`Step::More`] instead of an answer; the caller yields to the
//! scheduler and re-invokes with fresh budget. Iterators here are forward
//! and yield ascending ids; descending presentation is the sort buffer's
//! job.

pub mod all;
pub mod and;
pub mod cache;
pub mod fixed;
pub mod freeze;
pub mod null;
pub mod vip;
pub mod without;

use enum_dispatch::enum_dispatch;
use knotd_store::{Guid, LINKAGE_N, LocalId, Store};

use crate::Result;

pub use all::AllIter;
pub use and::AndIter;
pub use cache::IterCache;
pub use fixed::FixedIter;
pub use null::NullIter;
pub use vip::VipIter;
pub use without::WithoutIter;

/// One function call's worth of work.
pub const COST_FUNCALL: u64 = 1;
/// Probing a secondary index.
pub const COST_INDEX: u64 = 4;
/// Fetching a primitive from the store.
pub const COST_PRIMITIVE: u64 = 24;

/// Work allowance, decremented as iterators run. The balance may dip
/// below zero by one operation; callers see `More` on the next call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    balance: i64,
}

impl Budget {
    pub fn new(units: u64) -> Budget {
        Budget {
            balance: units.min(i64::MAX as u64) as i64,
        }
    }

    pub fn unlimited() -> Budget {
        Budget { balance: i64::MAX }
    }

    pub fn charge(&mut self, cost: u64) {
        self.balance = self.balance.saturating_sub(cost.min(i64::MAX as u64) as i64);
    }

    pub fn exhausted(&self) -> bool {
        self.balance <= 0
    }

    pub fn remaining(&self) -> u64 {
        self.balance.max(0) as u64
    }
}

/// An answer, or a request to be re-invoked once budget is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step<T> {
    Ready(T),
    More,
}

impl<T> Step<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Step<U> {
        match self {
            Step::Ready(t) => Step::Ready(f(t)),
            Step::More => Step::More,
        }
    }

    pub fn is_more(&self) -> bool {
        matches!(self, Step::More)
    }
}

/// Shorthand for the `next`/`find` outcome: an id, EOF, or More.
pub type IdStep = Result<Step<Option<LocalId>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterCost {
    pub check: u64,
    pub next: u64,
    pub find: u64,
    /// Estimated element count; an upper bound once statistics ran.
    pub n: u64,
    pub sorted: bool,
    pub forward: bool,
}

impl Default for IterCost {
    fn default() -> IterCost {
        IterCost {
            check: COST_FUNCALL,
            next: COST_FUNCALL,
            find: COST_FUNCALL,
            n: 0,
            sorted: true,
            forward: true,
        }
    }
}

/// Coarse low/high/n guess for planners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeEstimate {
    pub low: LocalId,
    pub high: LocalId,
    pub n: Option<u64>,
}

impl RangeEstimate {
    pub fn empty() -> RangeEstimate {
        RangeEstimate {
            low: LocalId::ZERO,
            high: LocalId::ZERO,
            n: Some(0),
        }
    }

    pub fn contains(&self, id: LocalId) -> bool {
        self.low <= id && id <= self.high
    }
}

/// What is fixed about every primitive an iterator returns: linkages
/// locked to specific guids. Intersection planners fuse on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrimSummary {
    pub locked: [Option<Guid>; LINKAGE_N],
}

impl PrimSummary {
    pub fn merge(mut self, other: PrimSummary) -> PrimSummary {
        for (slot, incoming) in self.locked.iter_mut().zip(other.locked) {
            if slot.is_none() {
                *slot = incoming;
            }
        }
        self
    }
}

/// The uniform iterator contract (spec: next, find, check, statistics,
/// clone, reset, freeze/thaw, primitive-summary, beyond, range-estimate).
#[enum_dispatch]
pub trait Traverse {
    /// The next id in ascending order, `None` at EOF.
    fn next_id(&mut self, store: &dyn Store, budget: &mut Budget) -> IdStep;

    /// Position at and return the first id `>= id`, `None` if past the
    /// end. Subsequent `next_id` continues after the returned id.
    fn find(&mut self, store: &dyn Store, id: LocalId, budget: &mut Budget) -> IdStep;

    /// Membership test; does not disturb the iteration position.
    fn check(&mut self, store: &dyn Store, id: LocalId, budget: &mut Budget)
    -> Result<Step<bool>>;

    /// Settle the cost vector. Idempotent once it returns `Ready`.
    fn statistics(&mut self, store: &dyn Store, budget: &mut Budget) -> Result<Step<IterCost>>;

    /// The current cost estimate; meaningful after `statistics`.
    fn cost(&self) -> IterCost;

    /// Back to the first element.
    fn reset(&mut self);

    /// Independent position over the same set. Clones of an intersection
    /// share its memo cache.
    fn clone_iter(&self) -> IdIter;

    /// Append this iterator's serialized state to `out`; see
    /// [`freeze::thaw`] for the inverse.
    fn freeze(&self, out: &mut String);

    fn primitive_summary(&self) -> PrimSummary;

    /// True if every element still ahead of the position is `> id`.
    fn beyond(&self, store: &dyn Store, id: LocalId) -> bool;

    fn range_estimate(&self, store: &dyn Store) -> RangeEstimate;
}

#[enum_dispatch(Traverse)]
#[derive(Debug, Clone)]
pub enum IdIter {
    Null(NullIter),
    All(AllIter),
    Fixed(FixedIter),
    Without(WithoutIter),
    Vip(VipIter),
    And(AndIter),
}

impl IdIter {
    /// Drain every remaining id without a budget. Statistics sampling and
    /// tests use this; request-path iteration never does.
    pub fn drain(&mut self, store: &dyn Store) -> Result<Vec<LocalId>> {
        let mut out = Vec::new();
        let mut budget = Budget::unlimited();
        while let Step::Ready(next) = self.next_id(store, &mut budget)? {
            match next {
                Some(id) => out.push(id),
                None => break,
            }
        }
        Ok(out)
    }
}
