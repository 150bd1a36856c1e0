use knotd_store::{Guid, Linkage, LocalId, Store};

use crate::constraint::{Constraint, ConstraintId, ConstraintSet, GuidSpec};
use crate::iter::{AllIter, AndIter, FixedIter, IdIter, NullIter, VipIter, WithoutIter};

/// Structural binding a parent match imposes on a subconstraint's set:
/// either the candidate's linkage must point at the parent's guid, or the
/// candidate is the one primitive the parent's linkage names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bind {
    LinkageTo(Linkage, Guid),
    Exactly(Guid),
}

fn eq_guids(spec: &GuidSpec) -> Option<Vec<Guid>> {
    spec.eq
        .as_ref()
        .map(|set| set.iter().flatten().copied().collect())
}

/// The single guid a spec pins, if it pins exactly one.
fn pinned(spec: &GuidSpec) -> Option<Guid> {
    match eq_guids(spec)?.as_slice() {
        [one] => Some(*one),
        _ => None,
    }
}

/// Build the iterator for one constraint. The result over-approximates
/// the set (intrinsics the iterator cannot express are re-checked per
/// primitive); it never under-approximates.
pub fn build(
    store: &dyn Store,
    set: &ConstraintSet,
    id: ConstraintId,
    bind: Option<Bind>,
) -> IdIter {
    let con = set.node(id);
    if con.con_false {
        return NullIter::new();
    }

    if let Some(Bind::Exactly(guid)) = bind {
        return match store.guid_to_id(guid) {
            Some(local) => FixedIter::new(vec![local]),
            None => NullIter::new(),
        };
    }

    let mut candidates: Vec<IdIter> = Vec::new();
    let mut typeguid_used = false;

    // An explicit guid set beats every enumeration.
    if let Some(guids) = eq_guids(&con.guid) {
        let ids: Vec<LocalId> = guids
            .iter()
            .filter_map(|g| store.guid_to_id(*g))
            .collect();
        if ids.is_empty() {
            return NullIter::new();
        }
        candidates.push(FixedIter::new(ids));
    }

    // The structural binding, fused with the typeguid into a VIP lookup
    // when the store can serve one.
    if let Some(Bind::LinkageTo(l, source)) = bind {
        match pinned(&con.linkage[Linkage::Typeguid.index()]) {
            Some(t) if l.has_vip_index() => {
                typeguid_used = true;
                candidates.push(VipIter::new(store, l, source, t));
            }
            _ => candidates.push(FixedIter::new(store.ids_with_linkage(l, source))),
        }
    }

    // Per-linkage eq sets.
    for l in Linkage::ALL {
        if l == Linkage::Typeguid && typeguid_used {
            continue;
        }
        let Some(guids) = eq_guids(&con.linkage[l.index()]) else {
            continue;
        };
        // `linkage=null` alone says "no such linkage" and cannot be
        // enumerated; the per-primitive filter enforces it.
        if guids.is_empty() {
            continue;
        }
        if let (true, [source]) = (l.has_vip_index(), guids.as_slice())
            && !typeguid_used
            && let Some(t) = pinned(&con.linkage[Linkage::Typeguid.index()])
        {
            typeguid_used = true;
            candidates.push(VipIter::new(store, l, *source, t));
            continue;
        }
        let mut ids: Vec<LocalId> = Vec::new();
        for g in guids {
            ids.extend(store.ids_with_linkage(l, g));
        }
        candidates.push(FixedIter::new(ids));
    }

    // Name/value equalities enumerate through the hash indexes.
    if let Some(name) = con.name.eq_operand() {
        candidates.push(FixedIter::new(store.ids_with_name(name)));
    }
    if let Some(value) = con.value.eq_operand() {
        candidates.push(FixedIter::new(store.ids_with_value(value)));
    }

    // The dateline window joins as a candidate when something else
    // enumerates, and is the scan fallback when nothing does.
    let windowed = con.id_min.is_some() || con.id_max.is_some();
    if candidates.is_empty() || windowed {
        candidates.push(AllIter::new(store, con.id_min, con.id_max));
    }

    let combined = match candidates.len() {
        1 => candidates.pop().expect("one candidate"),
        _ => AndIter::new(candidates),
    };

    subtract_exclusions(store, con, combined)
}

/// Guid exclusions are carved out with a difference iterator so the page
/// arithmetic never sees them.
fn subtract_exclusions(store: &dyn Store, con: &Constraint, combined: IdIter) -> IdIter {
    let excluded: Vec<LocalId> = con
        .guid
        .ne
        .iter()
        .flatten()
        .filter_map(|g| store.guid_to_id(*g))
        .collect();
    if excluded.is_empty() {
        combined
    } else {
        WithoutIter::new(combined, FixedIter::new(excluded))
    }
}
