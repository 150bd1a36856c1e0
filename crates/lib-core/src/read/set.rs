use std::cell::RefCell;
use std::rc::Rc;

use knotd_store::{Dateline, LocalId};
use smol_str::SmolStr;

use crate::constraint::{Constraint, ConstraintId, ConstraintSet, SortDir, SortKey};
use crate::error::EngineError;
use crate::exec::{Control, EvalCx, Frame, FrameResult, SetOutcome};
use crate::iter::{IdIter, Step, Traverse, freeze};
use crate::pattern::{Pattern, SetItem, compare_values, split_frames};
use crate::read::cursor::CursorState;
use crate::read::one::OneFrame;
use crate::read::plan::{Bind, build};
use crate::value::Value;

enum Phase {
    Init,
    Stats,
    Next,
    AwaitOne,
    Finish,
}

struct Buffered {
    sort_key: Vec<Value>,
    values: Vec<(usize, Value)>,
}

/// Evaluates one constraint's result set: drives the iterator, pushes a
/// [`OneFrame`] per candidate id, pages or sorts the matches, and cuts a
/// cursor when the page fills.
pub struct SetFrame {
    set: Rc<RefCell<ConstraintSet>>,
    con: ConstraintId,
    bind: Option<Bind>,
    phase: Phase,
    it: Option<IdIter>,
    set_items: Vec<SetItem>,
    per_prim: Vec<(usize, Pattern)>,
    sort_keys: Vec<SortKey>,
    sorting: bool,
    // Paging state.
    start: u64,
    pagesize: u64,
    countlimit: u64,
    count_max: Option<u64>,
    seen: u64,
    skipped: u64,
    page: Vec<Vec<(usize, Value)>>,
    buffer: Vec<Buffered>,
    exports: Vec<(SmolStr, Value, ConstraintId)>,
    // Cursor state.
    resumed: Option<CursorState>,
    snapshot: Option<CursorState>,
    matched_after_snapshot: bool,
    estimate: Option<u64>,
}

impl SetFrame {
    pub fn new(set: Rc<RefCell<ConstraintSet>>, con: ConstraintId, bind: Option<Bind>) -> SetFrame {
        SetFrame {
            set,
            con,
            bind,
            phase: Phase::Init,
            it: None,
            set_items: Vec::new(),
            per_prim: Vec::new(),
            sort_keys: Vec::new(),
            sorting: false,
            start: 0,
            pagesize: u64::MAX,
            countlimit: u64::MAX,
            count_max: None,
            seen: 0,
            skipped: 0,
            page: Vec::new(),
            buffer: Vec::new(),
            exports: Vec::new(),
            resumed: None,
            snapshot: None,
            matched_after_snapshot: false,
            estimate: None,
        }
    }

    /// An ascending single timestamp sort is the iterator's own order;
    /// everything else buffers.
    fn needs_buffering(con: &Constraint) -> bool {
        match con.sort.as_slice() {
            [] => false,
            [one] => {
                !(one.dir == SortDir::Ascending && one.pattern == Pattern::Timestamp)
            }
            _ => true,
        }
    }

    fn init(&mut self, cx: &mut EvalCx<'_>) -> Result<(), EngineError> {
        let set = Rc::clone(&self.set);
        let set_ref = set.borrow();
        let con = set_ref.node(self.con);

        self.start = con.start;
        // Nested sets page by resultpagesize; only the root set honors
        // the client-facing pagesize.
        self.pagesize = if con.parent.is_some() {
            con.resultpagesize.or(con.pagesize).unwrap_or(u64::MAX)
        } else {
            con.pagesize.unwrap_or(u64::MAX)
        };
        self.countlimit = con.countlimit.unwrap_or(u64::MAX);
        self.count_max = con.count_max;
        self.sorting = Self::needs_buffering(con);
        self.sort_keys = con.sort.clone();

        let result = con
            .result
            .clone()
            .unwrap_or(Pattern::List(vec![Pattern::List(vec![Pattern::Guid])]));
        self.set_items = split_frames(&result);
        let mut ordinal = 0;
        for item in &self.set_items {
            if let SetItem::PerPrimitive(pattern) = item {
                self.per_prim.push((ordinal, pattern.clone()));
                ordinal += 1;
            }
        }

        if let Some(text) = &con.cursor {
            let cursor = CursorState::parse(text)?;
            if !self.sorting && let Some(frozen) = &cursor.frozen_iter {
                self.it = Some(freeze::thaw(frozen)?);
                // The frozen iterator already consumed the first pages.
                self.start = 0;
            }
            self.resumed = Some(cursor);
        }
        if self.it.is_none() {
            self.it = Some(build(cx.store_ref(), &set_ref, self.con, self.bind));
        }
        Ok(())
    }

    fn push_one(&mut self, id: LocalId) -> Control {
        self.phase = Phase::AwaitOne;
        Control::Push(Box::new(OneFrame::new(
            Rc::clone(&self.set),
            self.con,
            id,
            self.bind,
            self.per_prim.clone(),
            if self.sorting {
                self.sort_keys.clone()
            } else {
                Vec::new()
            },
        )))
    }

    /// Record a match; true if the set is now known to be over-full.
    fn record(&mut self, values: Vec<(usize, Value)>, sort_key: Vec<Value>) -> bool {
        self.seen += 1;
        self.matched_after_snapshot = self.snapshot.is_some();
        if self.count_max.is_some_and(|max| self.seen > max) {
            return true;
        }
        if self.sorting {
            self.buffer.push(Buffered { sort_key, values });
        } else if self.skipped < self.start {
            self.skipped += 1;
        } else if (self.page.len() as u64) < self.pagesize {
            self.page.push(values);
            if self.page.len() as u64 == self.pagesize {
                self.cut_cursor();
            }
        }
        false
    }

    /// Freeze the iterator the moment the page fills, so the cursor
    /// resumes exactly here even though counting continues.
    fn cut_cursor(&mut self) {
        let offset = self.resumed.as_ref().map_or(0, |c| c.offset);
        let mut state = CursorState {
            offset: offset + self.page.len() as u64,
            ..CursorState::default()
        };
        if self.sorting {
            state.sort_pos = Some(state.offset);
        } else if let Some(it) = &self.it {
            let mut frozen = String::new();
            it.freeze(&mut frozen);
            state.frozen_iter = Some(frozen);
        }
        self.snapshot = Some(state);
    }

    fn sorted_page(&mut self) {
        let set = Rc::clone(&self.set);
        let comparator = set.borrow().node(self.con).comparator;
        let dirs: Vec<SortDir> = self.sort_keys.iter().map(|k| k.dir).collect();
        self.buffer.sort_by(|a, b| {
            for (i, dir) in dirs.iter().enumerate() {
                let (x, y) = (
                    a.sort_key.get(i).unwrap_or(&Value::Null),
                    b.sort_key.get(i).unwrap_or(&Value::Null),
                );
                let ordering = match dir {
                    SortDir::Ascending => compare_values(x, y, comparator),
                    SortDir::Descending => compare_values(y, x, comparator),
                };
                if !ordering.is_eq() {
                    return ordering;
                }
            }
            std::cmp::Ordering::Equal
        });

        let from = self
            .resumed
            .as_ref()
            .and_then(|c| c.sort_pos)
            .unwrap_or(0)
            .max(self.start) as usize;
        let buffered = std::mem::take(&mut self.buffer);
        let total = buffered.len();
        self.page = buffered
            .into_iter()
            .skip(from)
            .take(self.pagesize.min(usize::MAX as u64) as usize)
            .map(|b| b.values)
            .collect();
        if from + self.page.len() < total {
            self.snapshot = Some(CursorState {
                offset: (from + self.page.len()) as u64,
                sort_pos: Some((from + self.page.len()) as u64),
                ..CursorState::default()
            });
            self.matched_after_snapshot = true;
        }
    }

    fn finish(&mut self, cx: &mut EvalCx<'_>) -> Result<Control, EngineError> {
        let count_min = {
            let set = self.set.borrow();
            set.node(self.con).count_min
        };
        if self.count_max.is_some_and(|max| self.seen > max) || self.seen < count_min {
            return Ok(Control::Done(FrameResult::SetEmpty));
        }
        if self.sorting {
            self.sorted_page();
        }

        let mut cursor_value = Value::Null;
        if let Some(mut snapshot) = self.snapshot.take() {
            if self.matched_after_snapshot {
                let horizon = cx.store.horizon().prev().unwrap_or(LocalId::ZERO);
                snapshot.dateline = Dateline::single(cx.store.instance_id(), horizon);
                cursor_value = Value::string(snapshot.render());
            }
        }

        let mut items = Vec::with_capacity(self.set_items.len());
        let mut per_prim_ordinal = 0usize;
        for item in &self.set_items {
            match item {
                SetItem::PerPrimitive(_) => {
                    let ordinal = per_prim_ordinal;
                    per_prim_ordinal += 1;
                    let column: Vec<Value> = self
                        .page
                        .iter()
                        .map(|one| {
                            one.iter()
                                .find(|(o, _)| *o == ordinal)
                                .map(|(_, v)| v.clone())
                                .unwrap_or(Value::Null)
                        })
                        .collect();
                    items.push(Value::Sequence(column));
                }
                SetItem::Whole(pattern) => items.push(self.whole_value(pattern, &cursor_value, cx)),
            }
        }

        Ok(Control::Done(FrameResult::Set(SetOutcome {
            value: Value::List(items),
            count: self.seen,
            exports: std::mem::take(&mut self.exports),
        })))
    }

    fn whole_value(&self, pattern: &Pattern, cursor_value: &Value, cx: &EvalCx<'_>) -> Value {
        match pattern {
            Pattern::Count => Value::Number(self.seen),
            Pattern::Cursor => cursor_value.clone(),
            Pattern::Iterator => {
                let mut frozen = String::new();
                if let Some(it) = &self.it {
                    it.freeze(&mut frozen);
                }
                Value::string(frozen)
            }
            Pattern::Estimate => Value::Number(self.estimate.unwrap_or(self.seen)),
            Pattern::EstimateCount => {
                Value::Number(self.estimate.unwrap_or(self.seen).min(self.countlimit))
            }
            Pattern::Dateline => {
                let horizon = cx.store.horizon().prev().unwrap_or(LocalId::ZERO);
                Value::string(
                    Dateline::single(cx.store.instance_id(), horizon).to_string(),
                )
            }
            Pattern::Literal(text) => Value::string(text.clone()),
            _ => Value::Null,
        }
    }
}

impl Frame for SetFrame {
    fn run(&mut self, cx: &mut EvalCx<'_>) -> Result<Control, EngineError> {
        if cx.budget.exhausted() {
            return Ok(Control::Yield);
        }
        match self.phase {
            Phase::Init => {
                self.init(cx)?;
                self.phase = Phase::Stats;
                Ok(Control::Yield)
            }
            Phase::Stats => {
                let it = self.it.as_mut().expect("iterator built in init");
                let EvalCx { store, budget, .. } = cx;
                match it.statistics(&**store, budget)? {
                    Step::More => Ok(Control::Yield),
                    Step::Ready(cost) => {
                        self.estimate = Some(cost.n);
                        self.set.borrow_mut().node_mut(self.con).set_size = Some(cost.n);
                        self.phase = Phase::Next;
                        Ok(Control::Yield)
                    }
                }
            }
            Phase::Next => {
                if self.seen >= self.countlimit {
                    self.phase = Phase::Finish;
                    return Ok(Control::Yield);
                }
                let it = self.it.as_mut().expect("iterator built in init");
                let EvalCx { store, budget, .. } = cx;
                match it.next_id(&**store, budget)? {
                    Step::More => Ok(Control::Yield),
                    Step::Ready(None) => {
                        self.phase = Phase::Finish;
                        Ok(Control::Yield)
                    }
                    Step::Ready(Some(id)) => Ok(self.push_one(id)),
                }
            }
            Phase::AwaitOne => Err(EngineError::internal(
                "set frame scheduled while awaiting its one-frame",
            )),
            Phase::Finish => self.finish(cx),
        }
    }

    fn child_done(&mut self, result: FrameResult) -> Result<(), EngineError> {
        match result {
            FrameResult::One(outcome) => {
                if self.exports.is_empty() {
                    self.exports = outcome.exports;
                }
                let overfull = self.record(outcome.values, outcome.sort_key);
                self.phase = if overfull { Phase::Finish } else { Phase::Next };
                Ok(())
            }
            FrameResult::OneMiss => {
                self.phase = Phase::Next;
                Ok(())
            }
            _ => Err(EngineError::internal("set frame got a non-one result")),
        }
    }
}
