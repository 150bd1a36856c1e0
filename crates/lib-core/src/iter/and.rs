use std::cell::RefCell;
use std::fmt::Write;
use std::rc::Rc;

use knotd_store::{LocalId, Store};

use super::{
    Budget, COST_FUNCALL, IdIter, IdStep, IterCache, IterCost, PrimSummary, RangeEstimate, Step,
    Traverse,
};
use crate::Result;

/// Intersection. Statistics pick the cheapest subiterator as producer;
/// the rest become membership checkers. Confirmed ids accumulate in a
/// cache shared by every clone, so one clone's work pays for all of them:
/// a clone first serves the cached prefix, then advances the frontier
/// with `find(cache.last + 1)` on its own producer.
///
/// A `find` that leaps past the frontier detaches the instance from the
/// cache (the skipped gap would leave a hole in the prefix).
#[derive(Debug, Clone)]
pub struct AndIter {
    subs: Vec<IdIter>,
    producer: usize,
    stats_done: bool,
    cost: IterCost,
    cache: Rc<RefCell<IterCache>>,
    cache_pos: usize,
    detached: bool,
    /// Candidate produced but not yet through all checkers.
    pending: Option<LocalId>,
    /// Next checker to consult for `pending`.
    pending_checker: usize,
    /// Next checker to consult in a suspended `check`.
    check_resume: usize,
    /// Set by thaw: position after this id before producing.
    resume_after: Option<LocalId>,
    /// Everything strictly below this id has been produced and rejected;
    /// production restarts at or above it.
    skip_hint: Option<LocalId>,
    last: Option<LocalId>,
}

impl AndIter {
    pub fn new(subs: Vec<IdIter>) -> IdIter {
        debug_assert!(subs.len() >= 2, "an intersection wants two or more sides");
        let cache = Rc::new(RefCell::new(IterCache::new()));
        cache.borrow_mut().note_use();
        IdIter::And(AndIter {
            subs,
            producer: 0,
            stats_done: false,
            cost: IterCost::default(),
            cache,
            cache_pos: 0,
            detached: false,
            pending: None,
            pending_checker: 0,
            check_resume: 0,
            resume_after: None,
            skip_hint: None,
            last: None,
        })
    }

    pub(super) fn with_resume(subs: Vec<IdIter>, resume_after: Option<LocalId>) -> AndIter {
        let IdIter::And(mut it) = AndIter::new(subs) else {
            unreachable!()
        };
        it.resume_after = resume_after;
        it
    }

    fn ensure_stats(&mut self, store: &dyn Store, budget: &mut Budget) -> Result<Step<()>> {
        if self.stats_done {
            return Ok(Step::Ready(()));
        }
        for sub in &mut self.subs {
            if sub.statistics(store, budget)?.is_more() {
                return Ok(Step::More);
            }
        }
        let mut best = 0;
        for (i, sub) in self.subs.iter().enumerate() {
            let (c, b) = (sub.cost(), self.subs[best].cost());
            if (c.n, c.next) < (b.n, b.next) {
                best = i;
            }
        }
        self.producer = best;

        let p = self.subs[best].cost();
        let checks: u64 = self
            .subs
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != best)
            .map(|(_, s)| s.cost().check)
            .sum();
        self.cost = IterCost {
            check: self.subs.iter().map(|s| s.cost().check).sum(),
            next: p.next + checks,
            find: p.find + checks,
            n: self.subs.iter().map(|s| s.cost().n).min().unwrap_or(0),
            sorted: p.sorted,
            forward: p.forward,
        };
        self.stats_done = true;
        Ok(Step::Ready(()))
    }

    /// Drive the producer/checker loop until an id survives every
    /// checker. Appends to the cache while attached.
    ///
    /// Production is always positioned by value: the next candidate is
    /// the producer's first id at or above `max(frontier + 1, last + 1,
    /// skip_hint)`. A stale producer (a clone that mostly served the
    /// shared cache) leaps forward; a rejected candidate advances the
    /// skip hint so re-finding cannot loop.
    fn advance(&mut self, store: &dyn Store, budget: &mut Budget) -> IdStep {
        'candidates: loop {
            let id = match self.pending {
                // A pending candidate is only trustworthy ahead of the
                // position we last served.
                Some(id) if self.last.is_none_or(|l| id > l) => id,
                _ => {
                    self.pending = None;
                    let mut target: Option<LocalId> = None;
                    if !self.detached
                        && let Some(f) = self.cache.borrow().last()
                    {
                        target = target.max(Some(f.next()));
                    }
                    if let Some(l) = self.last {
                        target = target.max(Some(l.next()));
                    }
                    target = target.max(self.skip_hint);
                    let produced = match target {
                        Some(t) => self.subs[self.producer].find(store, t, budget)?,
                        None => self.subs[self.producer].next_id(store, budget)?,
                    };
                    match produced {
                        Step::More => return Ok(Step::More),
                        Step::Ready(None) => {
                            if !self.detached {
                                self.cache.borrow_mut().set_eof();
                            }
                            return Ok(Step::Ready(None));
                        }
                        Step::Ready(Some(id)) => {
                            self.pending = Some(id);
                            self.pending_checker = 0;
                            id
                        }
                    }
                }
            };

            while self.pending_checker < self.subs.len() {
                if self.pending_checker == self.producer {
                    self.pending_checker += 1;
                    continue;
                }
                let checker = &mut self.subs[self.pending_checker];
                match checker.check(store, id, budget)? {
                    Step::More => return Ok(Step::More),
                    Step::Ready(true) => self.pending_checker += 1,
                    Step::Ready(false) => {
                        self.pending = None;
                        self.skip_hint = Some(id.next());
                        continue 'candidates;
                    }
                }
            }

            self.pending = None;
            self.skip_hint = None;
            if !self.detached {
                let mut cache = self.cache.borrow_mut();
                if cache.last().is_none_or(|l| id > l) {
                    cache.add(id, self.cost.next);
                }
                self.cache_pos = cache.len();
            }
            self.last = Some(id);
            return Ok(Step::Ready(Some(id)));
        }
    }
}

impl Traverse for AndIter {
    fn next_id(&mut self, store: &dyn Store, budget: &mut Budget) -> IdStep {
        if self.ensure_stats(store, budget)?.is_more() {
            return Ok(Step::More);
        }
        if let Some(resume) = self.resume_after.take() {
            return self.find(store, resume.next(), budget);
        }
        if !self.detached {
            let cached = {
                let cache = self.cache.borrow();
                if self.cache_pos < cache.len() {
                    Some(cache.index(self.cache_pos))
                } else if cache.is_eof() {
                    Some(None)
                } else {
                    None
                }
            };
            match cached {
                Some(Some(id)) => {
                    if budget.exhausted() {
                        return Ok(Step::More);
                    }
                    budget.charge(COST_FUNCALL);
                    self.cache_pos += 1;
                    // Any in-flight candidate is behind us now.
                    self.pending = None;
                    self.last = Some(id);
                    return Ok(Step::Ready(Some(id)));
                }
                Some(None) => return Ok(Step::Ready(None)),
                None => {}
            }
        }
        self.advance(store, budget)
    }

    fn find(&mut self, store: &dyn Store, id: LocalId, budget: &mut Budget) -> IdStep {
        if self.ensure_stats(store, budget)?.is_more() {
            return Ok(Step::More);
        }
        self.resume_after = None;
        // Repositioning invalidates every anchor; the search target is
        // the only truth now.
        self.pending = None;
        self.skip_hint = None;
        self.last = None;
        if !self.detached {
            let serve = {
                let cache = self.cache.borrow();
                match cache.search(id) {
                    Some((off, found)) => Some((off, found)),
                    None if cache.is_eof() => {
                        return Ok(Step::Ready(None));
                    }
                    None => None,
                }
            };
            if let Some((off, found)) = serve {
                if budget.exhausted() {
                    return Ok(Step::More);
                }
                budget.charge(COST_FUNCALL);
                self.cache_pos = off + 1;
                self.pending = None;
                self.last = Some(found);
                return Ok(Step::Ready(Some(found)));
            }
            // Target beyond the frontier. Contiguous advancement keeps
            // the cache a prefix; a leap cuts this instance loose.
            let contiguous = match self.cache.borrow().last() {
                Some(f) => id <= f.next(),
                None => id <= LocalId::FIRST,
            };
            if !contiguous {
                self.detached = true;
            }
        }
        match self.subs[self.producer].find(store, id, budget)? {
            Step::More => return Ok(Step::More),
            Step::Ready(None) => {
                if !self.detached {
                    self.cache.borrow_mut().set_eof();
                }
                return Ok(Step::Ready(None));
            }
            Step::Ready(Some(found)) => {
                self.pending = Some(found);
                self.pending_checker = 0;
            }
        }
        self.advance(store, budget)
    }

    fn check(
        &mut self,
        store: &dyn Store,
        id: LocalId,
        budget: &mut Budget,
    ) -> Result<Step<bool>> {
        if self.ensure_stats(store, budget)?.is_more() {
            return Ok(Step::More);
        }
        if let Some(answer) = self.cache.borrow().check(id) {
            if budget.exhausted() {
                return Ok(Step::More);
            }
            budget.charge(COST_FUNCALL);
            self.check_resume = 0;
            return Ok(Step::Ready(answer));
        }
        while self.check_resume < self.subs.len() {
            let i = self.check_resume;
            match self.subs[i].check(store, id, budget)? {
                Step::More => return Ok(Step::More),
                Step::Ready(true) => self.check_resume += 1,
                Step::Ready(false) => {
                    self.check_resume = 0;
                    return Ok(Step::Ready(false));
                }
            }
        }
        self.check_resume = 0;
        Ok(Step::Ready(true))
    }

    fn statistics(&mut self, store: &dyn Store, budget: &mut Budget) -> Result<Step<IterCost>> {
        Ok(self.ensure_stats(store, budget)?.map(|()| self.cost))
    }

    fn cost(&self) -> IterCost {
        self.cost
    }

    fn reset(&mut self) {
        for sub in &mut self.subs {
            sub.reset();
        }
        self.cache_pos = 0;
        self.detached = false;
        self.pending = None;
        self.pending_checker = 0;
        self.check_resume = 0;
        self.resume_after = None;
        self.skip_hint = None;
        self.last = None;
    }

    fn clone_iter(&self) -> IdIter {
        self.cache.borrow_mut().note_use();
        IdIter::And(self.clone())
    }

    fn freeze(&self, out: &mut String) {
        out.push_str("and:");
        for sub in &self.subs {
            out.push('{');
            sub.freeze(out);
            out.push('}');
        }
        match self.last.or(self.resume_after) {
            Some(id) => {
                let _ = write!(out, "@{id}");
            }
            None => out.push_str("@-"),
        }
    }

    fn primitive_summary(&self) -> PrimSummary {
        self.subs
            .iter()
            .map(|s| s.primitive_summary())
            .fold(PrimSummary::default(), PrimSummary::merge)
    }

    fn beyond(&self, store: &dyn Store, id: LocalId) -> bool {
        self.subs.iter().any(|s| s.beyond(store, id))
    }

    fn range_estimate(&self, store: &dyn Store) -> RangeEstimate {
        let mut estimate: Option<RangeEstimate> = None;
        for sub in &self.subs {
            let e = sub.range_estimate(store);
            estimate = Some(match estimate {
                None => e,
                Some(have) => RangeEstimate {
                    low: have.low.max(e.low),
                    high: have.high.min(e.high),
                    n: match (have.n, e.n) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (a, b) => a.or(b),
                    },
                },
            });
        }
        estimate.unwrap_or_else(RangeEstimate::empty)
    }
}
