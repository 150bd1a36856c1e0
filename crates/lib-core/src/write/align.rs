//! The insert phase: walk the write tree deciding, per constraint, to
//! reuse an existing primitive, version it, or create a fresh one, with
//! linkage guids flowing between parents and children.

use knotd_store::{Draft, Guid, LINKAGE_N, Linkage, Primitive, Store, Timestamp, ValueType};
use smol_str::SmolStr;

use crate::constraint::{Constraint, ConstraintId, ConstraintSet, LinkRel, Tri};
use crate::error::EngineError;
use crate::value::Value;
use crate::write::Bootstrap;

pub struct AlignCx<'a> {
    pub store: &'a mut dyn Store,
    pub boot: &'a mut Bootstrap,
    pub now: Timestamp,
    /// False until the first primitive of this request; that one carries
    /// the txstart flag so the store can delimit the transaction.
    pub wrote_any: bool,
}

/// What this constraint would write, before deciding whether an existing
/// primitive already is that.
struct Prospect {
    name: Option<SmolStr>,
    value: Option<SmolStr>,
    datatype: ValueType,
    live: bool,
    archival: bool,
    linkages: [Option<Guid>; LINKAGE_N],
}

impl Prospect {
    fn matches(&self, prim: &Primitive) -> bool {
        prim.name() == self.name.as_deref()
            && prim.value() == self.value.as_deref()
            && prim.datatype() == self.datatype
            && prim.is_live() == self.live
            && prim.is_archival() == self.archival
            && *prim.linkages() == self.linkages
    }

    fn draft(&self, now: Timestamp, previous: Option<Guid>, txstart: bool) -> Draft {
        Draft {
            timestamp: now,
            datatype: self.datatype,
            live: self.live,
            archival: self.archival,
            txstart,
            linkages: self.linkages,
            name: self.name.clone(),
            value: self.value.clone(),
            previous,
        }
    }
}

fn pinned_guid(con: &Constraint) -> Option<Guid> {
    match con.guid.eq.as_deref() {
        Some([Some(guid)]) => Some(*guid),
        _ => None,
    }
}

fn pinned_linkage(con: &Constraint, l: Linkage) -> Option<Guid> {
    match con.linkage[l.index()].eq.as_deref() {
        Some([Some(guid)]) => Some(*guid),
        _ => None,
    }
}

/// Align one constraint and its subtree. `from_parent` carries the
/// linkage this node must point at its parent with.
pub fn align(
    set: &mut ConstraintSet,
    id: ConstraintId,
    cx: &mut AlignCx<'_>,
    from_parent: Option<(Linkage, Guid)>,
) -> Result<(Guid, Value), EngineError> {
    if set.node(id).con_false {
        return Err(EngineError::semantics(
            "write constraint is statically unsatisfiable",
        ));
    }

    // Children that stand in this primitive's linkage slots are written
    // first; their guids feed the linkage array.
    let incoming: Vec<(ConstraintId, Linkage)> = set
        .node(id)
        .children
        .iter()
        .filter_map(|&c| match set.node(c).rel {
            Some(LinkRel::ParentLinkageToMe(l)) => Some((c, l)),
            _ => None,
        })
        .collect();
    let mut child_values: Vec<(ConstraintId, Value)> = Vec::new();
    let mut fed: [Option<Guid>; LINKAGE_N] = [None; LINKAGE_N];
    for (child, l) in incoming {
        let (guid, value) = align(set, child, cx, None)?;
        if fed[l.index()].is_some_and(|have| have != guid) {
            return Err(EngineError::semantics(format!(
                "two subconstraints claim the {} linkage",
                l.as_ref()
            )));
        }
        fed[l.index()] = Some(guid);
        child_values.push((child, value));
    }

    // Assemble what we would write.
    let prospect = {
        let con = set.node(id);
        let mut linkages = fed;
        for l in Linkage::ALL {
            if linkages[l.index()].is_none() {
                linkages[l.index()] = pinned_linkage(con, l);
            }
        }
        if let Some((l, parent_guid)) = from_parent {
            if linkages[l.index()].is_some_and(|have| have != parent_guid) {
                return Err(EngineError::semantics(format!(
                    "the {} linkage is pinned away from the parent",
                    l.as_ref()
                )));
            }
            linkages[l.index()] = Some(parent_guid);
        }
        let type_name = con.type_names.first().cloned();
        if linkages[Linkage::Typeguid.index()].is_none()
            && let Some(name) = type_name
        {
            linkages[Linkage::Typeguid.index()] =
                Some(cx.boot.intern_type(cx.store, &name, cx.now)?);
        }
        let con = set.node(id);
        let value = con.value.eq_operand().map(SmolStr::new);
        let datatype = match con.datatype {
            Some(dt) => dt,
            None if value.is_some() => ValueType::String,
            None => ValueType::Unspecified,
        };
        Prospect {
            name: con.name.eq_operand().map(SmolStr::new),
            value,
            datatype,
            live: con.live != Tri::False,
            archival: con.archival == Tri::True,
            linkages,
        }
    };

    // Reuse, version, or create.
    let target = match pinned_guid(set.node(id)) {
        Some(explicit) => {
            let newest = cx.store.newest(explicit).ok_or_else(|| {
                EngineError::semantics(format!("guid {explicit} does not exist"))
            })?;
            Some(newest)
        }
        None => set.node(id).matched_guid,
    };

    let guid = match target {
        Some(existing_guid) => {
            let existing_id = cx.store.guid_to_id(existing_guid).ok_or_else(|| {
                EngineError::internal("annotated guid vanished from the store")
            })?;
            let existing = cx.store.read(existing_id)?;
            if prospect.matches(&existing) {
                existing.guid()
            } else {
                let draft = prospect.draft(cx.now, Some(existing.guid()), !cx.wrote_any);
                cx.wrote_any = true;
                let (_, guid) = cx.store.alloc(draft)?;
                guid
            }
        }
        None => {
            let draft = prospect.draft(cx.now, None, !cx.wrote_any);
            cx.wrote_any = true;
            let (_, guid) = cx.store.alloc(draft)?;
            guid
        }
    };

    // Children that point at this primitive get its guid.
    let outgoing: Vec<(ConstraintId, Linkage)> = set
        .node(id)
        .children
        .iter()
        .filter_map(|&c| match set.node(c).rel {
            Some(LinkRel::MyLinkageToParent(l)) => Some((c, l)),
            _ => None,
        })
        .collect();
    for (child, l) in outgoing {
        let (_, value) = align(set, child, cx, Some((l, guid)))?;
        child_values.push((child, value));
    }

    // Unlinked children are independent writes in document order.
    let loose: Vec<ConstraintId> = set
        .node(id)
        .children
        .iter()
        .copied()
        .filter(|&c| set.node(c).rel.is_none())
        .collect();
    for child in loose {
        let (_, value) = align(set, child, cx, None)?;
        child_values.push((child, value));
    }

    let mut reply = vec![Value::Guid(guid)];
    // Preserve the constraint's own child order in the reply.
    let order: Vec<ConstraintId> = set.node(id).children.clone();
    for child in order {
        if let Some(pos) = child_values.iter().position(|(c, _)| *c == child) {
            reply.push(child_values.remove(pos).1);
        }
    }
    Ok((guid, Value::List(reply)))
}
