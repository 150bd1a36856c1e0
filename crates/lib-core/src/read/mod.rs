//! The read engine: per-set and per-primitive evaluation frames over the
//! execution stack, plus planning, or-maps, and cursors.

pub mod cursor;
pub mod one;
pub mod ormap;
pub mod plan;
pub mod set;

use std::cell::RefCell;
use std::rc::Rc;

use knotd_store::{Store, Timestamp};

use crate::constraint::ConstraintSet;
use crate::error::EngineError;
use crate::exec::{EvalCx, FrameResult, SetOutcome, Stack};
use crate::iter::Step;
pub use plan::Bind;
pub use set::SetFrame;

/// Drive a completed constraint tree to its result in one go, with no
/// deadline. The session uses sliced execution instead; this is the
/// entry for internal reads and tests. `Ok(None)` is the EMPTY outcome.
pub fn evaluate(
    set: &Rc<RefCell<ConstraintSet>>,
    store: &mut dyn Store,
    now: Timestamp,
) -> Result<Option<SetOutcome>, EngineError> {
    let root = set.borrow().root();
    let mut stack = Stack::new();
    stack.push(Box::new(SetFrame::new(Rc::clone(set), root, None)));
    let mut cx = EvalCx::new(store, now);
    match stack.run_slice(&mut cx, None)? {
        Step::More => Err(EngineError::internal("unbudgeted run suspended")),
        Step::Ready(FrameResult::Set(outcome)) => Ok(Some(outcome)),
        Step::Ready(FrameResult::SetEmpty) => Ok(None),
        Step::Ready(_) => Err(EngineError::internal("read produced a non-set result")),
    }
}
