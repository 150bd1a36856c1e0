use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use knotd_lib_core::constraint::{ConstraintSet, semantic};
use knotd_lib_core::error::EngineError;
use knotd_lib_core::exec::{EvalCx, FrameResult, Stack};
use knotd_lib_core::iter::{Budget, Step};
use knotd_lib_core::parser::{ParsedRequest, RequestKind, parse_request};
use knotd_lib_core::pattern::Pattern;
use knotd_lib_core::read::SetFrame;
use knotd_lib_core::value::Value;
use knotd_lib_core::write::{self, Bootstrap};
use knotd_store::{Store, Timestamp};

/// Budget per scheduler slice, in iterator cost units.
const SLICE_BUDGET: u64 = 50_000;

#[derive(Debug, Default, Clone, Copy)]
pub struct RequestStats {
    pub slices: u64,
    pub cost_spent: u64,
    pub wall: Duration,
}

/// One client request: the parsed, completed constraint tree plus its
/// execution stack, deadline, and runtime statistics. The arena (the
/// constraint set and everything hanging off it) dies with the request.
pub struct Request {
    pub kind: RequestKind,
    set: Rc<RefCell<ConstraintSet>>,
    stack: Stack,
    now: Timestamp,
    deadline: Option<Instant>,
    started: Instant,
    cancelled: bool,
    stats: RequestStats,
}

impl Request {
    /// Parse and semantically complete. `deadline_ms` of 0 disables the
    /// deadline.
    pub fn prepare(
        text: &str,
        store: &dyn Store,
        boot: &mut Bootstrap,
        deadline_ms: u64,
    ) -> Result<Request, EngineError> {
        let ParsedRequest { kind, mut constraints } = parse_request(text)?;
        semantic::complete(&mut constraints, store, kind, boot)?;
        if kind == RequestKind::Iterate {
            // An iterate is a read that only counts.
            let root = constraints.root();
            constraints.node_mut(root).result =
                Some(Pattern::List(vec![Pattern::Count, Pattern::EstimateCount]));
        }

        let now = Timestamp::now();
        let started = Instant::now();
        let deadline = (deadline_ms > 0).then(|| started + Duration::from_millis(deadline_ms));
        let set = Rc::new(RefCell::new(constraints));
        let mut stack = Stack::new();
        if kind != RequestKind::Write {
            let root = set.borrow().root();
            stack.push(Box::new(SetFrame::new(Rc::clone(&set), root, None)));
        }
        Ok(Request {
            kind,
            set,
            stack,
            now,
            deadline,
            started,
            cancelled: false,
            stats: RequestStats::default(),
        })
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn stats(&self) -> RequestStats {
        self.stats
    }

    /// Suspend every frame (releasing loaded primitives); `More` if some
    /// frame cannot suspend and the request must instead run to the end.
    pub fn suspend(&mut self) -> Step<()> {
        self.stack.suspend_all()
    }

    pub fn resume(&mut self) {
        self.stack.unsuspend_all();
    }

    /// Run one scheduler slice. `Ready` carries the reply value.
    pub fn step(&mut self, store: &mut dyn Store, boot: &mut Bootstrap) -> Result<Step<Value>, EngineError> {
        self.stats.slices += 1;
        let outcome = match self.kind {
            RequestKind::Write => {
                // Writes run in one slice; they may overshoot the
                // deadline (the stack logs reads that do at a higher
                // severity than writes).
                let mut set = self.set.borrow_mut();
                let (value, dateline) = write::execute(&mut set, store, boot, self.now)?;
                log::debug!("write advanced the dateline to {dateline}");
                Ok(Step::Ready(value))
            }
            _ => {
                let mut cx = EvalCx::new(store, self.now);
                cx.budget = Budget::new(SLICE_BUDGET);
                cx.cancelled = self.cancelled;
                match self.stack.run_slice(&mut cx, self.deadline)? {
                    Step::More => {
                        if self.deadline.is_some_and(|d| Instant::now() >= d) {
                            self.stack.abort_to(0);
                            return Err(EngineError::Timeout);
                        }
                        self.stats.cost_spent += SLICE_BUDGET - cx.budget.remaining();
                        return Ok(Step::More);
                    }
                    Step::Ready(FrameResult::Set(outcome)) => {
                        self.stats.cost_spent += SLICE_BUDGET - cx.budget.remaining();
                        Ok(Step::Ready(outcome.value))
                    }
                    Step::Ready(FrameResult::SetEmpty) => Err(EngineError::NotFound),
                    Step::Ready(_) => {
                        Err(EngineError::internal("read produced a non-set result"))
                    }
                }
            }
        };
        self.stats.wall = self.started.elapsed();
        if outcome.is_ok() {
            log::debug!(
                "request finished: {} slices, {} cost units, {:?} wall",
                self.stats.slices,
                self.stats.cost_spent,
                self.stats.wall
            );
        }
        outcome
    }

    /// Step until done; the session's submit loop in miniature.
    pub fn run(
        &mut self,
        store: &mut dyn Store,
        boot: &mut Bootstrap,
    ) -> Result<Value, EngineError> {
        loop {
            match self.step(store, boot)? {
                Step::Ready(value) => return Ok(value),
                Step::More => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use knotd_store::{Draft, MemStore, Store as _};
    use pretty_assertions::assert_eq;

    use super::*;

    fn seeded(n: u64) -> MemStore {
        let mut store = MemStore::new(1);
        for i in 0..n {
            store
                .alloc(
                    Draft::node(Timestamp::from_unix(i, 0))
                        .with_name("n")
                        .with_value(&*i.to_string()),
                )
                .unwrap();
        }
        store.commit().unwrap();
        store
    }

    #[test]
    fn read_completes_over_slices() {
        let mut store = seeded(20);
        let mut boot = Bootstrap::new();
        let mut request =
            Request::prepare(r#"read (name="n" result=(count))"#, &store, &mut boot, 0).unwrap();
        let value = request.run(&mut store, &mut boot).unwrap();
        assert_eq!(value.to_string(), "(20)");
        assert!(request.stats().slices >= 1);
    }

    #[test]
    fn iterate_counts_without_values() {
        let mut store = seeded(5);
        let mut boot = Bootstrap::new();
        let mut request =
            Request::prepare(r#"iterate (name="n")"#, &store, &mut boot, 0).unwrap();
        let value = request.run(&mut store, &mut boot).unwrap();
        assert_eq!(value.to_string(), "(5 5)");
    }

    #[test]
    fn suspend_resume_mid_request() {
        let mut store = seeded(10);
        let mut boot = Bootstrap::new();
        let mut request =
            Request::prepare(r#"read (name="n" result=(count))"#, &store, &mut boot, 0).unwrap();

        // Nibble with a tiny budget so frames are mid-flight, then
        // suspend and resume; the result must be unaffected.
        let mut cx = EvalCx::new(&mut store, Timestamp::MIN);
        cx.budget = Budget::new(30);
        let step = request.stack.run_slice(&mut cx, None).unwrap();
        assert!(matches!(step, Step::More));
        drop(cx);

        assert!(matches!(request.suspend(), Step::Ready(())));
        request.resume();
        let value = request.run(&mut store, &mut boot).unwrap();
        assert_eq!(value.to_string(), "(10)");
    }

    #[test]
    fn cancel_kills_the_request() {
        let mut store = seeded(5);
        let mut boot = Bootstrap::new();
        let mut request =
            Request::prepare(r#"read (name="n")"#, &store, &mut boot, 0).unwrap();
        request.cancel();
        let err = request.run(&mut store, &mut boot).unwrap_err();
        assert_eq!(err, EngineError::Cancelled);
    }
}
