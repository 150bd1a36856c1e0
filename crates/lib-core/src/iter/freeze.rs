//! Thawing: rebuilding an iterator from its frozen text. Each variant
//! writes `tag:…` in its `freeze`; this module is the inverse registry.
//! The text is what cursors embed, so malformed input is a client error,
//! not a panic.

use knotd_store::{Guid, Linkage, LocalId};

use super::{AllIter, AndIter, FixedIter, IdIter, NullIter, VipIter, WithoutIter};
use crate::error::EngineError;

fn bad(text: &str, why: &str) -> EngineError {
    EngineError::semantics(format!("unthawable iterator `{text}`: {why}"))
}

/// Split `{a}{b}{c}rest` into the brace groups and the remainder.
fn brace_groups(mut text: &str) -> Option<(Vec<&str>, &str)> {
    let mut groups = Vec::new();
    while text.starts_with('{') {
        let mut depth = 0usize;
        let mut end = None;
        for (i, b) in text.bytes().enumerate() {
            match b {
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(i);
                        break;
                    }
                }
                _ => {}
            }
        }
        let end = end?;
        groups.push(&text[1..end]);
        text = &text[end + 1..];
    }
    Some((groups, text))
}

fn parse_id(text: &str) -> Option<LocalId> {
    text.parse::<u64>().ok().map(LocalId::new)
}

fn parse_opt_id(text: &str) -> Option<Option<LocalId>> {
    match text {
        "-" => Some(None),
        _ => parse_id(text).map(Some),
    }
}

pub fn thaw(text: &str) -> Result<IdIter, EngineError> {
    let (tag, body) = text
        .split_once(':')
        .ok_or_else(|| bad(text, "missing tag"))?;
    match tag {
        "null" => {
            if !body.is_empty() {
                return Err(bad(text, "null takes no state"));
            }
            Ok(NullIter::new())
        }
        "all" => {
            let (range, pos) = body.split_once('@').ok_or_else(|| bad(text, "no position"))?;
            let (low, high) = range.split_once('-').ok_or_else(|| bad(text, "no range"))?;
            let (low, high, pos) = (
                parse_id(low).ok_or_else(|| bad(text, "bad low"))?,
                parse_id(high).ok_or_else(|| bad(text, "bad high"))?,
                parse_id(pos).ok_or_else(|| bad(text, "bad position"))?,
            );
            if low > high || pos < low {
                return Err(bad(text, "inverted range"));
            }
            Ok(IdIter::All(AllIter::from_parts(low, high, pos)))
        }
        "fixed" => {
            let (ids, pos) = body.split_once('@').ok_or_else(|| bad(text, "no position"))?;
            let ids: Vec<LocalId> = if ids.is_empty() {
                Vec::new()
            } else {
                ids.split(',')
                    .map(parse_id)
                    .collect::<Option<_>>()
                    .ok_or_else(|| bad(text, "bad id list"))?
            };
            let pos: usize = pos.parse().map_err(|_| bad(text, "bad position"))?;
            Ok(IdIter::Fixed(FixedIter::with_pos(ids, pos)))
        }
        "without" => {
            let (groups, rest) = brace_groups(body).ok_or_else(|| bad(text, "bad braces"))?;
            let [producer, checker] = groups.as_slice() else {
                return Err(bad(text, "wants two sides"));
            };
            let pending = rest
                .strip_prefix('@')
                .and_then(parse_opt_id)
                .ok_or_else(|| bad(text, "bad pending"))?;
            Ok(IdIter::Without(WithoutIter::with_pending(
                thaw(producer)?,
                thaw(checker)?,
                pending,
            )))
        }
        "vip" => {
            let (head, sub) = body.split_once(":{").ok_or_else(|| bad(text, "no sub"))?;
            let sub = sub.strip_suffix('}').ok_or_else(|| bad(text, "bad braces"))?;
            let mut fields = head.split(',');
            let (Some(l), Some(source), Some(typeguid), None) = (
                fields.next(),
                fields.next(),
                fields.next(),
                fields.next(),
            ) else {
                return Err(bad(text, "wants linkage,source,typeguid"));
            };
            let l: Linkage = l.parse().map_err(|_| bad(text, "bad linkage"))?;
            let source: Guid = source.parse().map_err(|_| bad(text, "bad source"))?;
            let typeguid: Guid = typeguid.parse().map_err(|_| bad(text, "bad typeguid"))?;
            Ok(IdIter::Vip(VipIter::wrap(l, source, typeguid, thaw(sub)?)))
        }
        "and" => {
            let (groups, rest) = brace_groups(body).ok_or_else(|| bad(text, "bad braces"))?;
            if groups.len() < 2 {
                return Err(bad(text, "wants two or more sides"));
            }
            let subs = groups
                .iter()
                .map(|g| thaw(g))
                .collect::<Result<Vec<_>, _>>()?;
            let resume = rest
                .strip_prefix('@')
                .and_then(parse_opt_id)
                .ok_or_else(|| bad(text, "bad resume point"))?;
            Ok(IdIter::And(AndIter::with_resume(subs, resume)))
        }
        _ => Err(bad(text, "unknown tag")),
    }
}

#[cfg(test)]
mod tests {
    use knotd_store::{Draft, MemStore, Store as _, Timestamp};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::iter::{Budget, Step, Traverse};

    fn ids(raw: &[u64]) -> Vec<LocalId> {
        raw.iter().map(|&r| LocalId::new(r)).collect()
    }

    #[test]
    fn frozen_midway_resumes_with_the_remainder() {
        let store = MemStore::new(1);
        let mut it = FixedIter::new(ids(&[2, 4, 6, 8]));
        let mut budget = Budget::unlimited();
        it.next_id(&store, &mut budget).unwrap();
        it.next_id(&store, &mut budget).unwrap();

        let mut frozen = String::new();
        it.freeze(&mut frozen);
        let mut thawed = thaw(&frozen).unwrap();
        assert_eq!(thawed.drain(&store).unwrap(), ids(&[6, 8]));
        assert_eq!(it.drain(&store).unwrap(), ids(&[6, 8]));
    }

    #[test]
    fn nested_composites_round_trip() {
        let store = MemStore::new(1);
        let original = WithoutIter::new(
            AndIter::new(vec![
                FixedIter::new(ids(&[1, 2, 3, 4, 5])),
                FixedIter::new(ids(&[2, 3, 4, 9])),
            ]),
            FixedIter::new(ids(&[3])),
        );
        let mut frozen = String::new();
        original.freeze(&mut frozen);

        let mut thawed = thaw(&frozen).unwrap();
        let mut reference = original.clone_iter();
        assert_eq!(
            thawed.drain(&store).unwrap(),
            reference.drain(&store).unwrap()
        );
    }

    #[test]
    fn and_resumes_past_the_frozen_position() {
        let store = MemStore::new(1);
        let mut it = AndIter::new(vec![
            FixedIter::new(ids(&[1, 2, 3, 4, 5])),
            FixedIter::new(ids(&[2, 4, 5])),
        ]);
        let mut budget = Budget::unlimited();
        assert_eq!(
            it.next_id(&store, &mut budget).unwrap(),
            Step::Ready(Some(LocalId::new(2)))
        );
        let mut frozen = String::new();
        it.freeze(&mut frozen);

        let mut thawed = thaw(&frozen).unwrap();
        assert_eq!(thawed.drain(&store).unwrap(), ids(&[4, 5]));
    }

    #[test]
    fn all_iterator_round_trips_against_the_store() {
        let mut store = MemStore::new(1);
        for s in 0..4 {
            store.alloc(Draft::node(Timestamp::from_unix(s, 0))).unwrap();
        }
        store.commit().unwrap();
        let mut it = AllIter::new(&store, None, None);
        let mut budget = Budget::unlimited();
        it.next_id(&store, &mut budget).unwrap();

        let mut frozen = String::new();
        it.freeze(&mut frozen);
        assert_eq!(frozen, "all:1-4@2");
        let mut thawed = thaw(&frozen).unwrap();
        assert_eq!(thawed.drain(&store).unwrap(), ids(&[2, 3, 4]));
    }

    #[test]
    fn garbage_is_an_error_not_a_panic() {
        for text in [
            "",
            "mystery:1",
            "all:9-3@1",
            "fixed:1,x@0",
            "without:{null:}@-",
            "and:{null:}@-",
            "vip:up,00,00:{null:}",
        ] {
            assert!(thaw(text).is_err(), "{text:?}");
        }
    }
}
