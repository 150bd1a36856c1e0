use knotd_store::{Linkage, Primitive};
use smol_str::SmolStr;

use crate::value::Value;

/// Result/sort/assignment pattern. A pattern names either a per-primitive
/// field (one-level) or a whole-result figure (set-level); `split_frames`
/// sorts out which is which for a `result=` clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    List(Vec<Pattern>),
    /// One sub-pattern per or-branch; the branch that matched supplies
    /// the value.
    Pick(Vec<Pattern>),
    Variable(SmolStr),
    Guid,
    Previous,
    Timestamp,
    Name,
    Value,
    Datatype,
    Linkage(Linkage),
    Live,
    Archival,
    Generation,
    Contents,
    Count,
    Cursor,
    Iterator,
    Estimate,
    EstimateCount,
    Dateline,
    Literal(SmolStr),
}

impl Pattern {
    /// True if this pattern speaks about the result set as a whole rather
    /// than any single primitive.
    pub fn is_set_level(&self) -> bool {
        matches!(
            self,
            Pattern::Count
                | Pattern::Cursor
                | Pattern::Iterator
                | Pattern::Estimate
                | Pattern::EstimateCount
                | Pattern::Dateline
        )
    }

    /// Variables read anywhere inside this pattern.
    pub fn variables(&self, out: &mut Vec<SmolStr>) {
        match self {
            Pattern::Variable(name) => out.push(name.clone()),
            Pattern::List(items) | Pattern::Pick(items) => {
                for item in items {
                    item.variables(out);
                }
            }
            _ => {}
        }
    }

}

/// The split form of a `result=` clause: set-level items in order, where
/// a nested list is the one-level pattern applied per matched primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetItem {
    PerPrimitive(Pattern),
    Whole(Pattern),
}

/// `result=(a b (c d) e)` → frames `[Whole(a), Whole(b),
/// PerPrimitive((c d)), Whole(e)]`. A bare one-level atom at set level
/// (e.g. `result=(guid)`) is treated as a one-element per-primitive list,
/// which is what writers of terse queries mean by it.
pub fn split_frames(result: &Pattern) -> Vec<SetItem> {
    let items = match result {
        Pattern::List(items) => items.as_slice(),
        other => std::slice::from_ref(other),
    };
    items
        .iter()
        .map(|item| match item {
            Pattern::List(_) => SetItem::PerPrimitive(item.clone()),
            one if !one.is_set_level() => {
                SetItem::PerPrimitive(Pattern::List(vec![one.clone()]))
            }
            set => SetItem::Whole(set.clone()),
        })
        .collect()
}

/// Everything a one-level pattern can draw from.
pub struct OneScope<'a> {
    pub primitive: &'a Primitive,
    pub locals: &'a dyn Fn(&str) -> Option<Value>,
    pub contents: &'a [Value],
    /// Which alternative of the n-th or-pair matched; `pick` indexes
    /// this by position.
    pub pick_choice: &'a dyn Fn(usize) -> usize,
}

pub fn eval_one(pattern: &Pattern, scope: &OneScope<'_>) -> Value {
    let p = scope.primitive;
    match pattern {
        Pattern::List(items) => {
            Value::List(items.iter().map(|i| eval_one(i, scope)).collect())
        }
        Pattern::Pick(items) => {
            let choice = (scope.pick_choice)(0).min(items.len().saturating_sub(1));
            items
                .get(choice)
                .map_or(Value::Null, |i| eval_one(i, scope))
        }
        Pattern::Variable(name) => (scope.locals)(name).unwrap_or(Value::Null),
        Pattern::Guid => Value::Guid(p.guid()),
        Pattern::Previous => Value::opt_guid(p.previous()),
        Pattern::Timestamp => Value::Timestamp(p.timestamp()),
        Pattern::Name => Value::opt_string(p.name()),
        Pattern::Value => Value::opt_string(p.value()),
        Pattern::Datatype => Value::string(p.datatype().as_ref()),
        Pattern::Linkage(l) => Value::opt_guid(p.linkage(*l)),
        Pattern::Live => Value::Bool(p.is_live()),
        Pattern::Archival => Value::Bool(p.is_archival()),
        Pattern::Generation => Value::Number(p.generation() as u64),
        Pattern::Contents => Value::Sequence(scope.contents.to_vec()),
        Pattern::Literal(text) => Value::string(text.clone()),
        // Set-level figures render as null inside a one-level frame.
        _ => Value::Null,
    }
}

/// Sort keys compare the evaluated pattern values; this gives patterns a
/// total order consistent with the reply rendering.
pub fn compare_values(
    a: &Value,
    b: &Value,
    comparator: crate::constraint::Comparator,
) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Greater,
        (_, Value::Null) => Ordering::Less,
        (Value::Number(x), Value::Number(y)) => x.cmp(y),
        (Value::Timestamp(x), Value::Timestamp(y)) => x.cmp(y),
        (Value::Guid(x), Value::Guid(y)) => x.cmp(y),
        (Value::String(x), Value::String(y)) => comparator.compare(x, y),
        (x, y) => x.to_string().cmp(&y.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_mixed_result() {
        let result = Pattern::List(vec![
            Pattern::Count,
            Pattern::List(vec![Pattern::Guid, Pattern::Value]),
            Pattern::Cursor,
        ]);
        let frames = split_frames(&result);
        assert_eq!(frames.len(), 3);
        assert!(matches!(frames[0], SetItem::Whole(Pattern::Count)));
        assert!(matches!(frames[1], SetItem::PerPrimitive(_)));
        assert!(matches!(frames[2], SetItem::Whole(Pattern::Cursor)));
    }

    #[test]
    fn bare_atom_becomes_per_primitive() {
        let frames = split_frames(&Pattern::List(vec![Pattern::Guid]));
        match &frames[0] {
            SetItem::PerPrimitive(Pattern::List(items)) => {
                assert_eq!(items.as_slice(), &[Pattern::Guid]);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn variables_collects_nested() {
        let p = Pattern::List(vec![
            Pattern::Variable("a".into()),
            Pattern::Pick(vec![Pattern::Variable("b".into()), Pattern::Guid]),
        ]);
        let mut vars = Vec::new();
        p.variables(&mut vars);
        assert_eq!(vars, ["a", "b"]);
    }
}
