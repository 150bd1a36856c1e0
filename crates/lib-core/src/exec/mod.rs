//! The cooperative execution stack: suspendable frames driven in slices
//! under a deadline, with LIFO teardown when a request dies.

use std::time::{Duration, Instant};

use knotd_store::{LocalId, Store, Timestamp};
use smol_str::SmolStr;

use crate::constraint::ConstraintId;
use crate::error::EngineError;
use crate::iter::{Budget, Step};
use crate::value::Value;

/// Wall-clock probes are amortized: the loop only consults the clock
/// every this many frame steps (the TSC-style coarsening; correctness
/// never depends on it).
const CLOCK_STRIDE: u32 = 1024;

/// Past-deadline overshoot that earns a log line.
const OVERSHOOT_COMPLAINT: Duration = Duration::from_millis(500);

/// Everything a frame may touch while running. Rebuilt per slice; frames
/// hold no store references across suspensions.
pub struct EvalCx<'a> {
    pub store: &'a mut dyn Store,
    pub budget: Budget,
    /// Set between slices by the session when the client goes away.
    pub cancelled: bool,
    /// The request's timestamp; writes stamp primitives with it.
    pub now: Timestamp,
    pub is_write: bool,
}

impl<'a> EvalCx<'a> {
    pub fn new(store: &'a mut dyn Store, now: Timestamp) -> EvalCx<'a> {
        EvalCx {
            store,
            budget: Budget::unlimited(),
            cancelled: false,
            now,
            is_write: false,
        }
    }

    pub fn store_ref(&self) -> &dyn Store {
        &*self.store
    }
}

/// What a completed frame hands to the frame below it.
#[derive(Debug)]
pub enum FrameResult {
    /// A set evaluation produced its value.
    Set(SetOutcome),
    /// A set evaluation matched nothing (or too few); recoverable by the
    /// parent (or-tails, optional subconstraints), EMPTY at the top.
    SetEmpty,
    /// A single primitive passed its constraint.
    One(OneOutcome),
    /// A single primitive failed its constraint.
    OneMiss,
}

#[derive(Debug)]
pub struct SetOutcome {
    pub value: Value,
    pub count: u64,
    /// Variable values travelling to ancestors: (name, value, declaring
    /// constraint). First match wins at each declaration site.
    pub exports: Vec<(SmolStr, Value, ConstraintId)>,
}

#[derive(Debug)]
pub struct OneOutcome {
    pub id: LocalId,
    /// Values for the set frame's per-primitive pattern items, keyed by
    /// item ordinal.
    pub values: Vec<(usize, Value)>,
    /// Sort key values, when the set is buffering for a sort.
    pub sort_key: Vec<Value>,
    pub exports: Vec<(SmolStr, Value, ConstraintId)>,
}

/// Frame protocol. `run` advances the frame; pushes and pops happen via
/// the returned [`Control`], never by reaching into the stack (a frame
/// cannot hold the stack and itself mutably at once).
pub trait Frame {
    fn run(&mut self, cx: &mut EvalCx<'_>) -> Result<Control, EngineError>;

    /// Delivery of the result of a frame this one pushed.
    fn child_done(&mut self, result: FrameResult) -> Result<(), EngineError>;

    /// Release resources that must not live across a suspension (loaded
    /// primitives, mostly). Position state stays.
    fn suspend(&mut self) {}

    fn unsuspend(&mut self) {}

    /// Frames that cannot suspend make [`Stack::suspend_all`] report
    /// `More`; the request then runs to completion instead.
    fn can_suspend(&self) -> bool {
        true
    }
}

pub enum Control {
    /// Out of budget or voluntarily yielding; re-enter later.
    Yield,
    /// Push a frame; its result arrives via `child_done`.
    Push(Box<dyn Frame>),
    /// Pop this frame, delivering the result.
    Done(FrameResult),
}

/// One request's stack of frames. Dropping the stack drops frames in
/// LIFO order, which is the abort path.
#[derive(Default)]
pub struct Stack {
    frames: Vec<Box<dyn Frame>>,
    result: Option<FrameResult>,
    suspended: bool,
}

impl Stack {
    pub fn new() -> Stack {
        Stack::default()
    }

    pub fn push(&mut self, frame: Box<dyn Frame>) {
        self.frames.push(frame);
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Abort every frame above `depth`, releasing them LIFO.
    pub fn abort_to(&mut self, depth: usize) {
        while self.frames.len() > depth {
            self.frames.pop();
        }
    }

    /// Drive the top frame until the stack empties, the budget runs dry,
    /// or the deadline passes. `Ready` carries the root frame's result.
    pub fn run_slice(
        &mut self,
        cx: &mut EvalCx<'_>,
        deadline: Option<Instant>,
    ) -> Result<Step<FrameResult>, EngineError> {
        if self.suspended {
            self.unsuspend_all();
        }
        let mut ticks = 0u32;
        loop {
            if cx.cancelled {
                return Err(EngineError::Cancelled);
            }
            let Some(top) = self.frames.last_mut() else {
                let result = self
                    .result
                    .take()
                    .ok_or_else(|| EngineError::internal("stack finished with no result"))?;
                return Ok(Step::Ready(result));
            };
            match top.run(cx)? {
                Control::Push(frame) => self.frames.push(frame),
                Control::Done(result) => {
                    self.frames.pop();
                    match self.frames.last_mut() {
                        Some(parent) => parent.child_done(result)?,
                        None => self.result = Some(result),
                    }
                }
                Control::Yield => {
                    if cx.budget.exhausted() {
                        return Ok(Step::More);
                    }
                }
            }

            ticks = ticks.wrapping_add(1);
            if ticks % CLOCK_STRIDE == 0
                && let Some(deadline) = deadline
            {
                let now = Instant::now();
                if now >= deadline {
                    let over = now - deadline;
                    if over >= OVERSHOOT_COMPLAINT {
                        if cx.is_write {
                            log::debug!("write ran {}ms past its deadline", over.as_millis());
                        } else {
                            log::error!("read ran {}ms past its deadline", over.as_millis());
                        }
                    }
                    return Ok(Step::More);
                }
            }
        }
    }

    /// Map `suspend` across every frame. `More` if any frame cannot
    /// suspend; the caller then lets the request run to completion.
    pub fn suspend_all(&mut self) -> Step<()> {
        if self.frames.iter().any(|f| !f.can_suspend()) {
            return Step::More;
        }
        for frame in &mut self.frames {
            frame.suspend();
        }
        self.suspended = true;
        Step::Ready(())
    }

    pub fn unsuspend_all(&mut self) {
        for frame in &mut self.frames {
            frame.unsuspend();
        }
        self.suspended = false;
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }
}

#[cfg(test)]
mod tests {
    use knotd_store::MemStore;
    use pretty_assertions::assert_eq;

    use super::*;

    /// Counts down, yielding once per run call, then completes.
    struct Countdown {
        left: u32,
        done_children: u32,
        spawn: u32,
    }

    impl Frame for Countdown {
        fn run(&mut self, cx: &mut EvalCx<'_>) -> Result<Control, EngineError> {
            cx.budget.charge(1);
            if self.spawn > 0 {
                self.spawn -= 1;
                return Ok(Control::Push(Box::new(Countdown {
                    left: 1,
                    done_children: 0,
                    spawn: 0,
                })));
            }
            if self.left == 0 {
                return Ok(Control::Done(FrameResult::Set(SetOutcome {
                    value: Value::Number(self.done_children as u64),
                    count: 0,
                    exports: vec![],
                })));
            }
            self.left -= 1;
            Ok(Control::Yield)
        }

        fn child_done(&mut self, _result: FrameResult) -> Result<(), EngineError> {
            self.done_children += 1;
            Ok(())
        }
    }

    fn run_to_end(stack: &mut Stack, store: &mut MemStore) -> FrameResult {
        loop {
            let mut cx = EvalCx::new(store, Timestamp::MIN);
            cx.budget = Budget::new(4);
            match stack.run_slice(&mut cx, None).unwrap() {
                Step::Ready(result) => return result,
                Step::More => {}
            }
        }
    }

    #[test]
    fn children_complete_before_parents() {
        let mut store = MemStore::new(1);
        let mut stack = Stack::new();
        stack.push(Box::new(Countdown {
            left: 2,
            done_children: 0,
            spawn: 2,
        }));
        match run_to_end(&mut stack, &mut store) {
            FrameResult::Set(outcome) => assert_eq!(outcome.value, Value::Number(2)),
            other => panic!("unexpected result {other:?}"),
        }
        assert!(stack.is_empty());
    }

    #[test]
    fn cancellation_aborts_the_slice() {
        let mut store = MemStore::new(1);
        let mut stack = Stack::new();
        stack.push(Box::new(Countdown {
            left: 100,
            done_children: 0,
            spawn: 0,
        }));
        let mut cx = EvalCx::new(&mut store, Timestamp::MIN);
        cx.cancelled = true;
        let err = stack.run_slice(&mut cx, None).unwrap_err();
        assert_eq!(err, EngineError::Cancelled);
        stack.abort_to(0);
        assert!(stack.is_empty());
    }

    #[test]
    fn budget_slices_the_run() {
        let mut store = MemStore::new(1);
        let mut stack = Stack::new();
        stack.push(Box::new(Countdown {
            left: 10,
            done_children: 0,
            spawn: 0,
        }));
        let mut cx = EvalCx::new(&mut store, Timestamp::MIN);
        cx.budget = Budget::new(3);
        assert!(matches!(stack.run_slice(&mut cx, None).unwrap(), Step::More));
        assert_eq!(stack.depth(), 1);
    }
}
