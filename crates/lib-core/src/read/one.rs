use std::cell::RefCell;
use std::rc::Rc;

use knotd_store::{Linkage, LocalId, Primitive};
use smol_str::SmolStr;

use crate::constraint::{
    Comparator, Constraint, ConstraintId, ConstraintSet, GenSpec, LinkRel, SortKey, ValueClause,
    ValueOp,
};
use crate::error::EngineError;
use crate::exec::{Control, EvalCx, Frame, FrameResult, OneOutcome, SetOutcome};
use crate::iter::{COST_FUNCALL, COST_INDEX, COST_PRIMITIVE};
use crate::pattern::{OneScope, Pattern, eval_one};
use crate::read::ormap::OrMap;
use crate::read::plan::Bind;
use crate::read::set::SetFrame;
use crate::value::Value;

/// Glob match for `~=`: `*` and `?` wildcards over the whole operand.
pub(crate) fn glob_match(pattern: &str, text: &str) -> Result<bool, EngineError> {
    let mut regex = String::with_capacity(pattern.len() + 8);
    regex.push('^');
    for c in pattern.chars() {
        match c {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            c => {
                if !c.is_alphanumeric() {
                    regex.push('\\');
                }
                regex.push(c);
            }
        }
    }
    regex.push('$');
    let compiled = fancy_regex::Regex::new(&regex)
        .map_err(|_| EngineError::semantics(format!("bad match pattern `{pattern}`")))?;
    compiled
        .is_match(text)
        .map_err(|_| EngineError::semantics(format!("bad match pattern `{pattern}`")))
}

fn clauses_admit(
    clauses: &[ValueClause],
    actual: Option<&str>,
    comparator: Comparator,
) -> Result<bool, EngineError> {
    for clause in clauses {
        let ok = match (&clause.operand, actual) {
            (None, _) => match clause.op {
                ValueOp::Eq => actual.is_none(),
                ValueOp::Ne => actual.is_some(),
                _ => false,
            },
            (Some(_), None) => clause.op == ValueOp::Ne,
            (Some(want), Some(have)) => match clause.op {
                ValueOp::Eq => have == want.as_str(),
                ValueOp::Ne => have != want.as_str(),
                ValueOp::Match => glob_match(want, have)?,
                ValueOp::Lt => comparator.compare(have, want).is_lt(),
                ValueOp::Le => comparator.compare(have, want).is_le(),
                ValueOp::Gt => comparator.compare(have, want).is_gt(),
                ValueOp::Ge => comparator.compare(have, want).is_ge(),
            },
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

enum Phase {
    Intrinsics,
    /// Next child index to evaluate.
    Children(usize),
    /// A head's set frame is on the stack.
    AwaitChild(usize),
    /// The head at this index failed; push its tail alternative.
    PushTail(usize),
    /// The tail's set frame is on the stack.
    AwaitTail(usize),
    Finish,
}

/// Evaluates one candidate primitive against one constraint: the
/// intrinsic filters its iterator could not express, then each
/// subconstraint as a nested set, then the per-primitive result patterns.
pub struct OneFrame {
    set: Rc<RefCell<ConstraintSet>>,
    con: ConstraintId,
    id: LocalId,
    bind: Option<Bind>,
    /// Released on suspend, reloaded by id on the next run.
    prim: Option<Primitive>,
    phase: Phase,
    or_map: OrMap,
    contents: Vec<Value>,
    locals: Vec<(SmolStr, Value)>,
    exports: Vec<(SmolStr, Value, ConstraintId)>,
    per_prim: Vec<(usize, Pattern)>,
    sort_keys: Vec<SortKey>,
}

impl OneFrame {
    pub fn new(
        set: Rc<RefCell<ConstraintSet>>,
        con: ConstraintId,
        id: LocalId,
        bind: Option<Bind>,
        per_prim: Vec<(usize, Pattern)>,
        sort_keys: Vec<SortKey>,
    ) -> OneFrame {
        let branches = set.borrow().or_count;
        OneFrame {
            set,
            con,
            id,
            bind,
            prim: None,
            phase: Phase::Intrinsics,
            or_map: OrMap::new(branches),
            contents: Vec::new(),
            locals: Vec::new(),
            exports: Vec::new(),
            per_prim,
            sort_keys,
        }
    }

    fn load(&mut self, cx: &mut EvalCx<'_>) -> Result<Primitive, EngineError> {
        if let Some(prim) = &self.prim {
            return Ok(prim.clone());
        }
        cx.budget.charge(COST_PRIMITIVE);
        let prim = cx.store.read(self.id)?;
        self.prim = Some(prim.clone());
        Ok(prim)
    }

    /// Everything the iterator may not have enforced.
    fn intrinsics_admit(
        &self,
        con: &Constraint,
        prim: &Primitive,
        cx: &mut EvalCx<'_>,
    ) -> Result<bool, EngineError> {
        match self.bind {
            Some(Bind::LinkageTo(l, source)) => {
                if prim.linkage(l) != Some(source) {
                    return Ok(false);
                }
            }
            Some(Bind::Exactly(guid)) => {
                if prim.guid() != guid {
                    return Ok(false);
                }
            }
            None => {}
        }
        if !con.live.admits(prim.is_live()) || !con.archival.admits(prim.is_archival()) {
            return Ok(false);
        }
        if !con.guid.admits(Some(prim.guid())) {
            return Ok(false);
        }
        for l in Linkage::ALL {
            if !con.linkage[l.index()].admits(prim.linkage(l)) {
                return Ok(false);
            }
        }
        if con.datatype.is_some_and(|dt| dt != prim.datatype()) {
            return Ok(false);
        }
        if let Some((t, inclusive)) = con.timestamp_min {
            let ts = prim.timestamp();
            if ts < t || (!inclusive && ts == t) {
                return Ok(false);
            }
        }
        if let Some((t, inclusive)) = con.timestamp_max {
            let ts = prim.timestamp();
            if ts > t || (!inclusive && ts == t) {
                return Ok(false);
            }
        }
        if con.id_min.is_some_and(|lo| self.id < lo) || con.id_max.is_some_and(|hi| self.id > hi)
        {
            return Ok(false);
        }
        if !clauses_admit(&con.name.clauses, prim.name(), Comparator::Octet)? {
            return Ok(false);
        }
        if !clauses_admit(&con.value.clauses, prim.value(), con.value_comparator)? {
            return Ok(false);
        }

        // Generation distance, resolved through the lineage chain.
        if con.newest != GenSpec::DontCare || con.oldest != GenSpec::DontCare {
            cx.budget.charge(COST_INDEX);
            let chain = cx.store.generations(prim.guid());
            let position = chain.iter().position(|&g| g == prim.guid()).unwrap_or(0);
            let from_oldest = position as u64;
            let from_newest = (chain.len().saturating_sub(1) - position) as u64;
            if !con.newest.admits(from_newest) || !con.oldest.admits(from_oldest) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Route a subconstraint's exports: values declared here land in the
    /// locals (first assignment wins), the rest continue upward.
    fn take_exports(&mut self, exports: Vec<(SmolStr, Value, ConstraintId)>) {
        for (var, value, declared_at) in exports {
            if declared_at == self.con {
                if !self.locals.iter().any(|(name, _)| *name == var) {
                    self.locals.push((var, value));
                }
            } else {
                self.exports.push((var, value, declared_at));
            }
        }
    }

    /// The bind a subconstraint inherits from this primitive, or `None`
    /// in the second slot if a null parent linkage makes it unmatchable.
    fn child_bind(&self, child: ConstraintId, prim: &Primitive) -> Result<Option<Bind>, ()> {
        let set = self.set.borrow();
        match set.node(child).rel {
            Some(LinkRel::MyLinkageToParent(l)) => Ok(Some(Bind::LinkageTo(l, prim.guid()))),
            Some(LinkRel::ParentLinkageToMe(l)) => match prim.linkage(l) {
                Some(target) => Ok(Some(Bind::Exactly(target))),
                None => Err(()),
            },
            None => Ok(None),
        }
    }

    /// A child subtree matched nothing: head failures fall through to
    /// the tail alternative, optional children pass with an empty entry,
    /// anything else dooms this primitive.
    fn settle_empty(&mut self, index: usize, is_tail: bool) {
        let set = Rc::clone(&self.set);
        let set = set.borrow();
        let child_id = set.node(self.con).children[index];
        let head = set.node(child_id);

        if !is_tail && head.alt.is_some() {
            self.or_map.fail(head.or_index);
            self.phase = Phase::PushTail(index);
            return;
        }

        let failed_id = if is_tail {
            let tail_id = head.alt.expect("tail exists");
            self.or_map.fail(set.node(tail_id).or_index);
            tail_id
        } else {
            child_id
        };

        if set.node(failed_id).is_optional() || set.node(child_id).is_optional() {
            self.contents.push(Value::Sequence(vec![]));
            self.phase = Phase::Children(index + 1);
        } else {
            self.or_map.fail(0);
            self.phase = Phase::Finish;
        }
    }

    fn finish(&mut self, cx: &mut EvalCx<'_>) -> Result<Control, EngineError> {
        if !self.or_map.root_viable() {
            return Ok(Control::Done(FrameResult::OneMiss));
        }
        let prim = self.load(cx)?;
        let set = Rc::clone(&self.set);
        let set = set.borrow();
        let con = set.node(self.con);

        // Pick patterns index the or-pairs of this constraint in order.
        let heads: Vec<usize> = con
            .children
            .iter()
            .filter(|&&c| set.node(c).alt.is_some())
            .map(|&c| set.node(c).or_index)
            .collect();
        let or_map = self.or_map.clone();
        let pick_choice =
            move |ordinal: usize| heads.get(ordinal).map_or(0, |&head| or_map.pick_choice(head));

        // Own assignments extend the locals before patterns read them.
        let contents = self.contents.clone();
        let premise = self.locals.clone();
        let lookup_premise = |name: &str| -> Option<Value> {
            premise
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
        };
        let scope = OneScope {
            primitive: &prim,
            locals: &lookup_premise,
            contents: &contents,
            pick_choice: &pick_choice,
        };
        let mut exports = std::mem::take(&mut self.exports);
        for assignment in &con.assignments {
            let value = eval_one(&assignment.pattern, &scope);
            match assignment.declared_at {
                Some(declared) if declared == self.con => {
                    if !self.locals.iter().any(|(n, _)| *n == assignment.var) {
                        self.locals.push((assignment.var.clone(), value));
                    }
                }
                Some(declared) => exports.push((assignment.var.clone(), value, declared)),
                None => {}
            }
        }

        let locals = self.locals.clone();
        let lookup = |name: &str| -> Option<Value> {
            locals
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
        };
        let scope = OneScope {
            locals: &lookup,
            ..scope
        };

        let values = self
            .per_prim
            .iter()
            .map(|(ordinal, pattern)| (*ordinal, eval_one(pattern, &scope)))
            .collect();
        let sort_key = self
            .sort_keys
            .iter()
            .map(|key| eval_one(&key.pattern, &scope))
            .collect();

        Ok(Control::Done(FrameResult::One(OneOutcome {
            id: self.id,
            values,
            sort_key,
            exports,
        })))
    }
}

impl Frame for OneFrame {
    fn run(&mut self, cx: &mut EvalCx<'_>) -> Result<Control, EngineError> {
        if cx.budget.exhausted() {
            return Ok(Control::Yield);
        }
        match self.phase {
            Phase::Intrinsics => {
                let prim = self.load(cx)?;
                let admitted = {
                    let set = Rc::clone(&self.set);
                    let set = set.borrow();
                    self.intrinsics_admit(set.node(self.con), &prim, cx)?
                };
                if !admitted {
                    return Ok(Control::Done(FrameResult::OneMiss));
                }
                self.phase = Phase::Children(0);
                Ok(Control::Yield)
            }
            Phase::Children(index) => {
                cx.budget.charge(COST_FUNCALL);
                let child = {
                    let set = self.set.borrow();
                    set.node(self.con).children.get(index).copied()
                };
                let Some(child) = child else {
                    self.phase = Phase::Finish;
                    return Ok(Control::Yield);
                };
                let prim = self.load(cx)?;
                match self.child_bind(child, &prim) {
                    Ok(bind) => {
                        self.phase = Phase::AwaitChild(index);
                        Ok(Control::Push(Box::new(SetFrame::new(
                            Rc::clone(&self.set),
                            child,
                            bind,
                        ))))
                    }
                    Err(()) => {
                        self.settle_empty(index, false);
                        Ok(Control::Yield)
                    }
                }
            }
            Phase::PushTail(index) => {
                let prim = self.load(cx)?;
                let tail = {
                    let set = self.set.borrow();
                    let head_id = set.node(self.con).children[index];
                    set.node(head_id).alt.expect("push-tail phase needs a tail")
                };
                match self.child_bind(tail, &prim) {
                    Ok(bind) => {
                        self.phase = Phase::AwaitTail(index);
                        Ok(Control::Push(Box::new(SetFrame::new(
                            Rc::clone(&self.set),
                            tail,
                            bind,
                        ))))
                    }
                    Err(()) => {
                        self.settle_empty(index, true);
                        Ok(Control::Yield)
                    }
                }
            }
            Phase::AwaitChild(_) | Phase::AwaitTail(_) => Err(EngineError::internal(
                "one frame scheduled while awaiting its child",
            )),
            Phase::Finish => self.finish(cx),
        }
    }

    fn child_done(&mut self, result: FrameResult) -> Result<(), EngineError> {
        let (index, is_tail) = match self.phase {
            Phase::AwaitChild(i) => (i, false),
            Phase::AwaitTail(i) => (i, true),
            _ => {
                return Err(EngineError::internal("one frame got an unexpected child"));
            }
        };
        match result {
            FrameResult::Set(SetOutcome { value, exports, .. }) => {
                self.contents.push(value);
                self.take_exports(exports);
                if !is_tail {
                    let branches = {
                        let set = self.set.borrow();
                        let head = set.node(set.node(self.con).children[index]);
                        head.alt
                            .map(|t| (head.or_index, set.node(t).or_index))
                    };
                    if let Some((head_branch, tail_branch)) = branches {
                        self.or_map.matched(head_branch, Some(tail_branch));
                    }
                }
                self.phase = Phase::Children(index + 1);
                Ok(())
            }
            FrameResult::SetEmpty => {
                self.settle_empty(index, is_tail);
                Ok(())
            }
            _ => Err(EngineError::internal("one frame got a non-set result")),
        }
    }

    fn suspend(&mut self) {
        self.prim = None;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn glob_wildcards() {
        assert!(glob_match("al*", "alpha").unwrap());
        assert!(glob_match("al*", "al").unwrap());
        assert!(glob_match("a?c", "abc").unwrap());
        assert!(!glob_match("a?c", "abbc").unwrap());
        assert!(!glob_match("al*", "ALPHA").unwrap());
        // Metacharacters in the operand match themselves.
        assert!(glob_match("a.b*", "a.b-c").unwrap());
        assert!(!glob_match("a.b", "axb").unwrap());
    }

    fn clause(op: ValueOp, operand: Option<&str>) -> ValueClause {
        ValueClause {
            op,
            operand: operand.map(Into::into),
        }
    }

    #[test]
    fn null_operands_test_absence() {
        let wants_absent = [clause(ValueOp::Eq, None)];
        assert!(clauses_admit(&wants_absent, None, Comparator::Octet).unwrap());
        assert!(!clauses_admit(&wants_absent, Some("x"), Comparator::Octet).unwrap());

        let wants_present = [clause(ValueOp::Ne, None)];
        assert!(!clauses_admit(&wants_present, None, Comparator::Octet).unwrap());
        assert!(clauses_admit(&wants_present, Some("x"), Comparator::Octet).unwrap());
    }

    #[test]
    fn queued_clauses_all_apply() {
        let range = [
            clause(ValueOp::Ge, Some("b")),
            clause(ValueOp::Lt, Some("d")),
        ];
        assert!(clauses_admit(&range, Some("b"), Comparator::Octet).unwrap());
        assert!(clauses_admit(&range, Some("c"), Comparator::Octet).unwrap());
        assert!(!clauses_admit(&range, Some("d"), Comparator::Octet).unwrap());
        assert!(!clauses_admit(&range, Some("a"), Comparator::Octet).unwrap());
        assert!(!clauses_admit(&range, None, Comparator::Octet).unwrap());
    }

    #[test]
    fn numeric_comparator_orders_by_value() {
        let over_nine = [clause(ValueOp::Gt, Some("9"))];
        assert!(clauses_admit(&over_nine, Some("10"), Comparator::Numeric).unwrap());
        assert!(!clauses_admit(&over_nine, Some("10"), Comparator::Octet).unwrap());
        assert_eq!(
            clauses_admit(&over_nine, Some("9.5"), Comparator::Numeric).unwrap(),
            true
        );
    }
}
