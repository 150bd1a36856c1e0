//! Semantic completion: the ordered normalization pass between parsing
//! and planning. Running it twice must be a no-op.

use ahash::AHashSet;
use knotd_store::{LocalId, Store, Timestamp};
use smol_str::SmolStr;

use crate::constraint::{
    AnchorMode, Asof, Constraint, ConstraintId, ConstraintSet, GenSpec, SortDir, SortRoot,
};
use crate::error::EngineError;
use crate::parser::RequestKind;
use crate::pattern::Pattern;
use crate::write::Bootstrap;

pub const PAGESIZE_DEFAULT: u64 = 1024;
pub const PAGESIZE_MAX: u64 = 64 * 1024;

pub fn complete(
    set: &mut ConstraintSet,
    store: &dyn Store,
    kind: RequestKind,
    boot: &mut Bootstrap,
) -> Result<(), EngineError> {
    number_or_branches(set);
    analyze_variables(set)?;
    check_key_unique(set, kind)?;
    infer_anchors(set)?;
    compile_datelines(set, store)?;
    resolve_types(set, store, kind, boot);
    expand_lineage_matches(set, store);
    promote_sort_roots(set);
    apply_defaults(set);
    shortcut_false(set);
    Ok(())
}

/// Step 1: dense or-branch numbering. The root branch is 0; every or-head
/// gets a fresh index and its tail the next one; everything else inherits
/// its parent's branch.
fn number_or_branches(set: &mut ConstraintSet) {
    let root = set.root();
    let mut next = 1;
    for id in set.walk(root) {
        if id == root {
            set.node_mut(id).or_index = 0;
        } else if set.node(id).alt_of.is_none() {
            let inherited = set.node(id).parent.map_or(0, |p| set.node(p).or_index);
            set.node_mut(id).or_index = inherited;
        }
        if let Some(tail) = set.node(id).alt {
            set.node_mut(id).or_index = next;
            set.node_mut(tail).or_index = next + 1;
            next += 2;
        }
    }
    set.or_count = next;
}

fn reads_of(con: &Constraint) -> Vec<SmolStr> {
    let mut vars = Vec::new();
    if let Some(result) = &con.result {
        result.variables(&mut vars);
    }
    for key in &con.sort {
        key.pattern.variables(&mut vars);
    }
    for a in &con.assignments {
        a.pattern.variables(&mut vars);
    }
    vars
}

/// Step 2: variable scope analysis. Each assignment must be read at the
/// same constraint or an ancestor; each read must be assigned at the same
/// constraint or a descendant; overlapping double assignment and
/// self-referential chains are refused.
fn analyze_variables(set: &mut ConstraintSet) -> Result<(), EngineError> {
    let root = set.root();
    let all = set.walk(root);

    // Resolve every assignment's declaring constraint.
    for &id in &all {
        for slot in 0..set.node(id).assignments.len() {
            let var = set.node(id).assignments[slot].var.clone();
            let mut declared = None;
            let mut cursor = Some(id);
            while let Some(c) = cursor {
                if reads_of(set.node(c)).contains(&var) {
                    declared = Some(c);
                    break;
                }
                cursor = set.node(c).parent.or_else(|| {
                    // A tail alternative hangs off the same parent as its
                    // head; scope-wise it sits where the head sits.
                    set.node(c).alt_of.and_then(|h| set.node(h).parent)
                });
            }
            let Some(declared) = declared else {
                return Err(EngineError::semantics(format!(
                    "variable ${var} is assigned but never read"
                )));
            };
            set.node_mut(id).assignments[slot].declared_at = Some(declared);
        }
    }

    // Every read must have an assignment somewhere below.
    for &id in &all {
        for var in reads_of(set.node(id)) {
            let assigned = set
                .walk(id)
                .into_iter()
                .any(|d| set.node(d).assignments.iter().any(|a| a.var == var));
            if !assigned {
                return Err(EngineError::semantics(format!(
                    "variable ${var} is read but never assigned"
                )));
            }
        }
    }

    // Overlapping double assignment: same variable, same declaration,
    // one assigning constraint an ancestor of the other (or the same).
    for (i, &a_id) in all.iter().enumerate() {
        for a in &set.node(a_id).assignments {
            for &b_id in &all[i..] {
                for b in &set.node(b_id).assignments {
                    if std::ptr::eq(a, b) || a.var != b.var || a.declared_at != b.declared_at
                    {
                        continue;
                    }
                    let overlapping = a_id == b_id
                        || set.ancestors(b_id).contains(&a_id)
                        || set.ancestors(a_id).contains(&b_id);
                    if overlapping {
                        return Err(EngineError::semantics(format!(
                            "variable ${} is assigned twice in one scope",
                            a.var
                        )));
                    }
                }
            }
        }
    }

    // Assignment chains may not loop back on themselves.
    let mut edges: Vec<(SmolStr, SmolStr)> = Vec::new();
    for &id in &all {
        for a in &set.node(id).assignments {
            let mut reads = Vec::new();
            a.pattern.variables(&mut reads);
            for read in reads {
                edges.push((a.var.clone(), read));
            }
        }
    }
    let vars: Vec<SmolStr> = edges.iter().map(|(v, _)| v.clone()).collect();
    for start in vars {
        let mut frontier = vec![start.clone()];
        let mut seen: AHashSet<SmolStr> = AHashSet::new();
        while let Some(v) = frontier.pop() {
            for (from, to) in &edges {
                if *from == v {
                    if *to == start {
                        return Err(EngineError::semantics(format!(
                            "variable ${start} is defined in terms of itself"
                        )));
                    }
                    if seen.insert(to.clone()) {
                        frontier.push(to.clone());
                    }
                }
            }
        }
    }

    Ok(())
}

/// Step 3: `key=`/`unique=` apply to writes only, and every field they
/// name must actually be constrained.
fn check_key_unique(set: &ConstraintSet, kind: RequestKind) -> Result<(), EngineError> {
    for id in set.walk(set.root()) {
        let node = set.node(id);
        for (mask, what) in [(node.key_mask, "key"), (node.unique_mask, "unique")] {
            if mask.is_empty() {
                continue;
            }
            if kind != RequestKind::Write {
                return Err(EngineError::semantics(format!(
                    "`{what}=` only applies to write requests"
                )));
            }
            for field in mask.fields() {
                if !set.constrains_with_children(id, field) {
                    return Err(EngineError::semantics(format!(
                        "`{what}=` names `{}`, which the constraint leaves open",
                        field.as_ref()
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Step 5: anchor propagation. Anchored constraints make the subtrees
/// they point at (or that point at them) anchored-local; an explicit
/// `anchor=false` inside an anchored region is an error.
fn infer_anchors(set: &mut ConstraintSet) -> Result<(), EngineError> {
    let mut frontier: Vec<ConstraintId> = set
        .walk(set.root())
        .into_iter()
        .filter(|&id| set.node(id).anchor == AnchorMode::Anchor)
        .collect();
    while let Some(id) = frontier.pop() {
        for child in set.node(id).children.clone() {
            if set.node(child).rel.is_none() {
                continue;
            }
            match set.node(child).anchor {
                AnchorMode::NoAnchor => {
                    return Err(EngineError::semantics(
                        "an anchored constraint points at an anchor=false one",
                    ));
                }
                AnchorMode::DontCare => {
                    set.node_mut(child).anchor = AnchorMode::AnchorLocal;
                    frontier.push(child);
                }
                _ => {}
            }
        }
    }
    Ok(())
}

/// Step 6: dateline compilation. Timestamp bounds become inclusive id
/// bounds by binary-searching the store; `asof` caps every maximum.
fn compile_datelines(set: &mut ConstraintSet, store: &dyn Store) -> Result<(), EngineError> {
    let root = set.root();
    let global_cap = asof_cap(set.node(root).asof.as_ref(), store)?;

    for id in set.walk(root) {
        let node = set.node(id);
        let mut id_min = None;
        let mut id_max = None;
        let mut falsify = false;

        if let Some((t, inclusive)) = node.timestamp_min {
            let from = if inclusive {
                t
            } else {
                Timestamp::from_ticks(t.ticks().saturating_add(1))
            };
            match store.first_id_at_or_after(from) {
                Some(lo) => id_min = Some(lo),
                None => falsify = true,
            }
        }
        if let Some((t, inclusive)) = node.timestamp_max {
            let until = if inclusive {
                t
            } else {
                Timestamp::from_ticks(t.ticks().saturating_sub(1))
            };
            match store.last_id_at_or_before(until) {
                Some(hi) => id_max = Some(hi),
                None => falsify = true,
            }
        }

        let own_cap = if id == root {
            None
        } else {
            asof_cap(node.asof.as_ref(), store)?
        };
        for cap in [global_cap, own_cap].into_iter().flatten() {
            id_max = Some(id_max.map_or(cap, |m: LocalId| m.min(cap)));
        }

        let node = set.node_mut(id);
        node.id_min = id_min;
        node.id_max = id_max;
        if falsify {
            node.mark_false();
        }
    }
    Ok(())
}

fn asof_cap(asof: Option<&Asof>, store: &dyn Store) -> Result<Option<LocalId>, EngineError> {
    match asof {
        None => Ok(None),
        Some(Asof::Timestamp(t)) => match store.last_id_at_or_before(*t) {
            Some(cap) => Ok(Some(cap)),
            // Nothing existed at that point; the snapshot is unresolvable.
            None => Err(EngineError::NotFound),
        },
        Some(Asof::Dateline(dl)) => Ok(dl.get(store.instance_id())),
    }
}

/// Step 7: `type="…"` resolution through the bootstrap namespace. For
/// reads an unknown type matches nothing; for writes it stays unresolved
/// for the insert phase to intern.
fn resolve_types(
    set: &mut ConstraintSet,
    store: &dyn Store,
    kind: RequestKind,
    boot: &mut Bootstrap,
) {
    use knotd_store::Linkage;
    for id in set.walk(set.root()) {
        let node = set.node(id);
        if node.type_names.is_empty() || node.typeguids_resolved {
            continue;
        }
        let names = node.type_names.clone();
        let resolved: Vec<_> = names
            .iter()
            .filter_map(|n| boot.type_guid_from_name(store, n))
            .collect();
        let node = set.node_mut(id);
        if resolved.len() == names.len() {
            node.linkage[Linkage::Typeguid.index()]
                .intersect_eq(resolved.into_iter().map(Some));
            node.typeguids_resolved = true;
        } else if kind != RequestKind::Write {
            node.mark_false();
            node.typeguids_resolved = true;
        }
    }
}

/// Step 8: `~=` guid matches expand to explicit eq sets over the full
/// generation chain of each named lineage.
fn expand_lineage_matches(set: &mut ConstraintSet, store: &dyn Store) {
    for id in set.walk(set.root()) {
        let node = set.node_mut(id);
        let mut specs: Vec<_> = node.linkage.iter_mut().collect();
        specs.push(&mut node.guid);
        for spec in specs {
            if spec.lineage.is_empty() {
                continue;
            }
            let lineage = std::mem::take(&mut spec.lineage);
            let mut chain = Vec::new();
            for g in lineage {
                chain.extend(store.generations(g).into_iter().map(Some));
            }
            spec.intersect_eq(chain);
        }
    }
}

/// Step 9: sort-root promotion. A sort on a variable is rooted at the
/// assigning constraint; a local sort at the constraint itself. Roots
/// that are locally expressible in id order are pruned.
fn promote_sort_roots(set: &mut ConstraintSet) {
    for id in set.walk(set.root()) {
        let node = set.node(id);
        if node.sort.is_empty() || node.sort_root.is_some() {
            continue;
        }
        let primary = node.sort[0].clone();
        let root = match &primary.pattern {
            Pattern::Variable(var) => set
                .walk(id)
                .into_iter()
                .find_map(|d| {
                    set.node(d)
                        .assignments
                        .iter()
                        .find(|a| a.var == *var && a.declared_at == Some(id))
                        .map(|a| SortRoot {
                            at: d,
                            pattern: a.pattern.clone(),
                            ordering: format!("var:{var}").into(),
                        })
                }),
            pattern => Some(SortRoot {
                at: id,
                pattern: pattern.clone(),
                ordering: SmolStr::new("local"),
            }),
        };
        let root = root.filter(|r| {
            // Prune the trivial case: an ascending local timestamp sort
            // is already the iterator's id order.
            !(r.at == id
                && primary.dir == SortDir::Ascending
                && r.pattern == Pattern::Timestamp
                && node.sort.len() == 1)
        });
        set.node_mut(id).sort_root = root;
    }
}

/// Step 10: defaults. `newest=0`, pagesize and friends capped at 64k,
/// and the implicit `((guid contents))` result.
fn apply_defaults(set: &mut ConstraintSet) {
    for id in set.walk(set.root()) {
        let node = set.node_mut(id);
        if node.newest == GenSpec::Unspecified {
            node.newest = GenSpec::Distance(0);
        }
        if node.oldest == GenSpec::Unspecified {
            node.oldest = GenSpec::DontCare;
        }
        let pagesize = node.pagesize.unwrap_or(PAGESIZE_DEFAULT).min(PAGESIZE_MAX);
        node.pagesize = Some(pagesize);
        node.countlimit = Some(node.countlimit.unwrap_or(PAGESIZE_MAX).min(PAGESIZE_MAX));
        node.resultpagesize = Some(node.resultpagesize.unwrap_or(pagesize).min(PAGESIZE_MAX));
        if node.result.is_none() {
            node.result = Some(Pattern::List(vec![Pattern::List(vec![
                Pattern::Guid,
                Pattern::Contents,
            ])]));
        }
    }
}

/// Step 11: truthiness shortcut. Statically unsatisfiable constraints are
/// marked false; unsatisfiability climbs past or-tails and optional
/// children to the root.
fn shortcut_false(set: &mut ConstraintSet) {
    let all = set.walk(set.root());
    for &id in &all {
        let node = set.node(id);
        let statically_false = node.guid.is_false()
            || node.linkage.iter().any(|spec| spec.is_false())
            || node.name.contradictory()
            || node.value.contradictory()
            || node
                .count_max
                .is_some_and(|max| max < node.count_min)
            || matches!((node.id_min, node.id_max), (Some(lo), Some(hi)) if lo > hi)
            || matches!(
                (node.timestamp_min, node.timestamp_max),
                (Some((lo, _)), Some((hi, _))) if lo > hi
            );
        if statically_false {
            set.node_mut(id).mark_false();
        }
    }

    // Bottom-up vacuous propagation.
    for &id in all.iter().rev() {
        let node = set.node(id);
        if node.con_false {
            continue;
        }
        let doomed = node.children.iter().any(|&c| {
            let child = set.node(c);
            if child.is_optional() {
                return false;
            }
            let head_false = child.con_false;
            let tail_false = child
                .alt
                .map_or(true, |tail| set.node(tail).con_false);
            head_false && tail_false
        });
        if doomed {
            set.node_mut(id).mark_false();
        }
    }
}

#[cfg(test)]
mod tests {
    use knotd_store::{Draft, MemStore};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::parser::parse_request;

    fn ts(seconds: u64) -> Timestamp {
        Timestamp::from_unix(seconds, 0)
    }

    fn completed(src: &str, store: &MemStore) -> Result<ConstraintSet, EngineError> {
        let parsed = parse_request(src)?;
        let mut set = parsed.constraints;
        let mut boot = Bootstrap::new();
        complete(&mut set, store, parsed.kind, &mut boot)?;
        Ok(set)
    }

    #[test]
    fn or_branches_numbered_densely() {
        let store = MemStore::new(1);
        let set = completed(
            r#"read (name="a" (value="1") | (value="2") (value="3") | (value="4"))"#,
            &store,
        )
        .unwrap();
        let root = set.node(set.root());
        assert_eq!(root.or_index, 0);
        assert_eq!(set.or_count, 5);
        let h1 = set.node(root.children[0]);
        let t1 = set.node(h1.alt.unwrap());
        assert_eq!((h1.or_index, t1.or_index), (1, 2));
        let h2 = set.node(root.children[1]);
        let t2 = set.node(h2.alt.unwrap());
        assert_eq!((h2.or_index, t2.or_index), (3, 4));
    }

    #[test]
    fn variable_scope_checks() {
        let store = MemStore::new(1);
        assert!(completed(r#"read (result=($x) ($x=value))"#, &store).is_ok());

        let unread = completed(r#"read (name="a" ($x=value))"#, &store).unwrap_err();
        assert_eq!(unread.code(), "SEMANTICS");

        let unassigned = completed(r#"read (result=($x))"#, &store).unwrap_err();
        assert_eq!(unassigned.code(), "SEMANTICS");

        let double =
            completed(r#"read (result=($x) ($x=value ($x=name)))"#, &store).unwrap_err();
        assert_eq!(double.code(), "SEMANTICS");
    }

    #[test]
    fn key_requires_write() {
        let store = MemStore::new(1);
        let err = completed(r#"read (name="a" key=(name))"#, &store).unwrap_err();
        assert_eq!(err.code(), "SEMANTICS");

        let err = completed(r#"write (name="a" key=(name value))"#, &store).unwrap_err();
        assert_eq!(err.code(), "SEMANTICS");

        assert!(completed(r#"write (name="a" value="1" key=(name value))"#, &store).is_ok());
    }

    #[test]
    fn anchors_propagate_and_clash() {
        let store = MemStore::new(1);
        let set = completed(r#"read (anchor=true (<-left name="b"))"#, &store).unwrap();
        let root = set.node(set.root());
        assert_eq!(set.node(root.children[0]).anchor, AnchorMode::AnchorLocal);

        let err =
            completed(r#"read (anchor=true (<-left anchor=false))"#, &store).unwrap_err();
        assert_eq!(err.code(), "SEMANTICS");
    }

    #[test]
    fn datelines_compile_to_id_bounds() {
        let mut store = MemStore::new(1);
        for s in [100, 200, 300] {
            store.alloc(Draft::node(ts(s))).unwrap();
        }
        store.commit().unwrap();

        let set = completed(
            &format!("read (timestamp>={} timestamp<{})", ts(200), ts(300)),
            &store,
        )
        .unwrap();
        let root = set.node(set.root());
        assert_eq!(root.id_min, Some(LocalId::new(2)));
        assert_eq!(root.id_max, Some(LocalId::new(2)));

        // A window the store never reaches falsifies the constraint.
        let set = completed(&format!("read (timestamp>{})", ts(300)), &store).unwrap();
        assert!(set.node(set.root()).con_false);
    }

    #[test]
    fn asof_before_store_start_is_not_found() {
        let mut store = MemStore::new(1);
        store.alloc(Draft::node(ts(100))).unwrap();
        store.commit().unwrap();

        let err = completed(&format!("read (asof={})", ts(50)), &store).unwrap_err();
        assert_eq!(err, EngineError::NotFound);

        let set = completed(&format!("read (asof={})", ts(100)), &store).unwrap();
        assert_eq!(set.node(set.root()).id_max, Some(LocalId::new(1)));
    }

    #[test]
    fn unknown_type_falsifies_reads_only() {
        let store = MemStore::new(1);
        let set = completed(r#"read (type="Person")"#, &store).unwrap();
        assert!(set.node(set.root()).con_false);

        let set = completed(r#"write (type="Person" name="n")"#, &store).unwrap();
        let root = set.node(set.root());
        assert!(!root.con_false);
        assert!(!root.typeguids_resolved);
    }

    #[test]
    fn lineage_match_expands_generations() {
        let mut store = MemStore::new(1);
        let (_, g0) = store.alloc(Draft::node(ts(1)).with_value("a")).unwrap();
        let mut draft = Draft::node(ts(2)).with_value("b");
        draft.previous = Some(g0);
        let (_, g1) = store.alloc(draft).unwrap();
        store.commit().unwrap();

        let set = completed(&format!("read (guid~={g0} newest=null)"), &store).unwrap();
        let root = set.node(set.root());
        let eq = root.guid.eq.as_ref().unwrap();
        assert_eq!(eq.as_slice(), &[Some(g0), Some(g1)]);
        assert!(root.guid.lineage.is_empty());
    }

    #[test]
    fn sort_roots_promote_through_variables() {
        let store = MemStore::new(1);
        let set = completed(r#"read (sort=($x) (<-left $x=value))"#, &store).unwrap();
        let root = set.node(set.root());
        let sort_root = root.sort_root.as_ref().unwrap();
        assert_eq!(sort_root.at, root.children[0]);
        assert_eq!(sort_root.pattern, Pattern::Value);

        // Ascending local timestamp order is the iterator's own order.
        let set = completed(r#"read (sort=(timestamp))"#, &store).unwrap();
        assert!(set.node(set.root()).sort_root.is_none());

        let set = completed(r#"read (sort=(-timestamp))"#, &store).unwrap();
        assert!(set.node(set.root()).sort_root.is_some());
    }

    #[test]
    fn defaults_and_idempotence() {
        let store = MemStore::new(1);
        let parsed = parse_request(r#"read (name="a" pagesize=200000)"#).unwrap();
        let mut set = parsed.constraints;
        let mut boot = Bootstrap::new();
        complete(&mut set, &store, parsed.kind, &mut boot).unwrap();

        {
            let root = set.node(set.root());
            assert_eq!(root.newest, GenSpec::Distance(0));
            assert_eq!(root.pagesize, Some(PAGESIZE_MAX));
            assert_eq!(root.countlimit, Some(PAGESIZE_MAX));
            assert!(root.result.is_some());
        }

        let before = format!("{:?}", set.node(set.root()));
        complete(&mut set, &store, RequestKind::Read, &mut boot).unwrap();
        assert_eq!(format!("{:?}", set.node(set.root())), before);
    }

    #[test]
    fn empty_guid_set_is_false_and_propagates() {
        let store = MemStore::new(1);
        let set = completed(r#"read (name="a" (left=()))"#, &store).unwrap();
        let root = set.node(set.root());
        assert!(set.node(root.children[0]).con_false);
        assert!(root.con_false);

        // An or-tail keeps the parent alive.
        let set = completed(r#"read (name="a" (left=()) | (value="2"))"#, &store).unwrap();
        assert!(!set.node(set.root()).con_false);

        // So does optionality.
        let set = completed(r#"read (name="a" (left=() optional))"#, &store).unwrap();
        assert!(!set.node(set.root()).con_false);
    }
}
