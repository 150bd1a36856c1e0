//! Key and unique clusters: the maximal keyed subtrees of a write, their
//! duplication as internal reads, and the guid annotation of a match.

use std::cell::RefCell;
use std::rc::Rc;

use knotd_store::{Guid, Linkage, Store, Timestamp};

use crate::constraint::{
    Constraint, ConstraintId, ConstraintSet, FieldMask, GenSpec, KeyField, LinkRel, Tri,
};
use crate::error::EngineError;
use crate::parser::RequestKind;
use crate::pattern::Pattern;
use crate::read;
use crate::value::Value;
use crate::write::Bootstrap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterKind {
    Key,
    Unique,
}

impl ClusterKind {
    fn mask(self, con: &Constraint) -> FieldMask {
        match self {
            ClusterKind::Key => con.key_mask,
            ClusterKind::Unique => con.unique_mask,
        }
    }
}

/// Is the child joined to its parent by a linkage listed in the key/unique
/// bitmask of whichever side holds the linkage?
fn keyed_connection(kind: ClusterKind, parent: &Constraint, child: &Constraint) -> bool {
    match child.rel {
        Some(LinkRel::MyLinkageToParent(l)) => kind.mask(child).has_linkage(l),
        Some(LinkRel::ParentLinkageToMe(l)) => kind.mask(parent).has_linkage(l),
        None => false,
    }
}

/// Cluster roots in pre-order: a constraint with a mask whose parent
/// either has none or is not joined by a keyed linkage.
pub fn cluster_roots(set: &ConstraintSet, kind: ClusterKind) -> Vec<ConstraintId> {
    set.walk(set.root())
        .into_iter()
        .filter(|&id| {
            let con = set.node(id);
            if kind.mask(con).is_empty() {
                return false;
            }
            match con.parent {
                None => true,
                Some(p) => {
                    let parent = set.node(p);
                    kind.mask(parent).is_empty() || !keyed_connection(kind, parent, con)
                }
            }
        })
        .collect()
}

/// The members of one cluster: the root, then children joined by keyed
/// linkages, recursively, in duplication order.
fn cluster_children(set: &ConstraintSet, kind: ClusterKind, id: ConstraintId) -> Vec<ConstraintId> {
    let con = set.node(id);
    con.children
        .iter()
        .copied()
        .filter(|&c| {
            let child = set.node(c);
            !kind.mask(child).is_empty() && keyed_connection(kind, con, child)
        })
        .collect()
}

/// Copy only the fields the mask names into an independent read
/// constraint, pinned to a single newest live match.
fn duplicate_one(
    src_set: &ConstraintSet,
    src_id: ConstraintId,
    kind: ClusterKind,
    exclude: Option<Guid>,
) -> Constraint {
    let src = src_set.node(src_id);
    let mask = kind.mask(src);
    let mut dup = Constraint::new();

    if mask.has(KeyField::Name) {
        dup.name = src.name.clone();
    }
    if mask.has(KeyField::Value) {
        dup.value = src.value.clone();
    }
    if mask.has(KeyField::Datatype) {
        dup.datatype = src.datatype;
    }
    if mask.has(KeyField::Timestamp) {
        dup.timestamp_min = src.timestamp_min;
        dup.timestamp_max = src.timestamp_max;
    }
    for l in Linkage::ALL {
        if mask.has_linkage(l) {
            dup.linkage[l.index()] = src.linkage[l.index()].clone();
        }
    }
    if mask.has(KeyField::Typeguid) {
        dup.type_names = src.type_names.clone();
    }

    dup.live = Tri::True;
    dup.archival = Tri::DontCare;
    dup.newest = GenSpec::Distance(0);
    dup.pagesize = Some(1);
    dup.countlimit = Some(1);
    dup.resultpagesize = Some(1);
    dup.result = Some(Pattern::List(vec![Pattern::List(vec![
        Pattern::Guid,
        Pattern::Contents,
    ])]));
    if let Some(own) = exclude {
        // A versioning write must not match its own predecessor.
        dup.guid.ne.push(Some(own));
    }
    dup
}

/// Duplicate a whole cluster into `dst`, returning the new node and the
/// source members in lock-step order for later annotation.
fn duplicate_cluster(
    src_set: &ConstraintSet,
    src_id: ConstraintId,
    kind: ClusterKind,
    exclude: Option<Guid>,
    dst: &mut ConstraintSet,
    members: &mut Vec<(ConstraintId, Vec<ConstraintId>)>,
) -> ConstraintId {
    let children = cluster_children(src_set, kind, src_id);
    members.push((src_id, children.clone()));

    let mut dup = duplicate_one(src_set, src_id, kind, exclude);
    dup.rel = src_set.node(src_id).rel;
    let dup_id = dst.alloc(dup);
    for child in children {
        let child_dup = duplicate_cluster(src_set, child, kind, None, dst, members);
        dst.node_mut(child_dup).parent = Some(dup_id);
        dst.node_mut(dup_id).children.push(child_dup);
    }
    dup_id
}

/// Outcome of probing one cluster against the existing graph.
pub enum ClusterMatch {
    /// The cluster already exists; its members are annotated.
    Found,
    /// Nothing matches; the cluster is new.
    New,
}

/// Probe one cluster: duplicate it as a read, run it through the read
/// engine, and on a hit annotate every member with its matched guid.
pub fn probe_cluster(
    set: &mut ConstraintSet,
    root: ConstraintId,
    kind: ClusterKind,
    store: &mut dyn Store,
    boot: &mut Bootstrap,
    now: Timestamp,
) -> Result<ClusterMatch, EngineError> {
    // Writing a new version of an explicit guid? Don't match it.
    let exclude = set.node(root).guid.eq.as_ref().and_then(|eq| {
        match eq.as_slice() {
            [Some(own)] => Some(*own),
            _ => None,
        }
    });

    let mut dup_set = ConstraintSet::new();
    let mut members = Vec::new();
    let dup_root = duplicate_cluster(set, root, kind, exclude, &mut dup_set, &mut members);
    dup_set.node_mut(dup_root).rel = None;
    dup_set.set_root(dup_root);

    crate::constraint::semantic::complete(&mut dup_set, store, RequestKind::Read, boot)?;
    let dup_set = Rc::new(RefCell::new(dup_set));
    let Some(outcome) = read::evaluate(&dup_set, store, now)? else {
        return Ok(ClusterMatch::New);
    };

    annotate(set, &members, 0, &outcome.value)?;
    Ok(ClusterMatch::Found)
}

/// Walk the original cluster and the result tuple in lock-step: each
/// level supplies a guid and one nested sequence per keyed child.
fn annotate(
    set: &mut ConstraintSet,
    members: &[(ConstraintId, Vec<ConstraintId>)],
    index: usize,
    set_value: &Value,
) -> Result<usize, EngineError> {
    let shape = || EngineError::internal("key-cluster result tuple lost its shape");

    let Value::List(items) = set_value else {
        return Err(shape());
    };
    let Some(Value::Sequence(ones)) = items.first() else {
        return Err(shape());
    };
    let Some(Value::List(one)) = ones.first() else {
        return Err(shape());
    };
    let (Some(Value::Guid(guid)), Some(Value::Sequence(contents))) = (one.first(), one.get(1))
    else {
        return Err(shape());
    };

    let (src_id, children) = members.get(index).ok_or_else(shape)?;
    set.node_mut(*src_id).matched_guid = Some(*guid);

    let mut cursor = index + 1;
    for (slot, _child) in children.iter().enumerate() {
        let child_value = contents.get(slot).ok_or_else(shape)?;
        cursor = annotate(set, members, cursor, child_value)?;
    }
    Ok(cursor)
}

/// Unique clusters assert absence: any hit fails the write.
pub fn check_unique(
    set: &mut ConstraintSet,
    store: &mut dyn Store,
    boot: &mut Bootstrap,
    now: Timestamp,
) -> Result<(), EngineError> {
    for root in cluster_roots(set, ClusterKind::Unique) {
        let description = describe(set, root);
        match probe_cluster(set, root, ClusterKind::Unique, store, boot, now)? {
            ClusterMatch::New => {}
            ClusterMatch::Found => {
                return Err(EngineError::UniqueExists(description));
            }
        }
    }
    Ok(())
}

/// Resolve every key cluster to existing guids where the graph already
/// has them.
pub fn resolve_keys(
    set: &mut ConstraintSet,
    store: &mut dyn Store,
    boot: &mut Bootstrap,
    now: Timestamp,
) -> Result<(), EngineError> {
    for root in cluster_roots(set, ClusterKind::Key) {
        probe_cluster(set, root, ClusterKind::Key, store, boot, now)?;
    }
    Ok(())
}

fn describe(set: &ConstraintSet, id: ConstraintId) -> String {
    let con = set.node(id);
    let mut parts = Vec::new();
    if let Some(name) = con.name.eq_operand() {
        parts.push(format!("name={name:?}"));
    }
    if let Some(value) = con.value.eq_operand() {
        parts.push(format!("value={value:?}"));
    }
    for t in &con.type_names {
        parts.push(format!("type={t:?}"));
    }
    if parts.is_empty() {
        parts.push("(anonymous)".to_string());
    }
    parts.join(" ")
}
