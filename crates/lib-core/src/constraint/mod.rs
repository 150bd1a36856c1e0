pub mod semantic;

use knotd_store::{Dateline, Guid, LocalId, Linkage, Timestamp, ValueType};
use smol_str::SmolStr;
use strum_macros::{AsRefStr, EnumString};

use crate::pattern::Pattern;

/// Handle of a constraint inside its request's [`ConstraintSet`].
/// Structural links (parent, children, or-alternatives) are handles, never
/// references; traversal always goes through the owning set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConstraintId(u32);

impl ConstraintId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Arena of one request's constraints. The root is the constraint the
/// request's outermost parentheses produced.
#[derive(Debug, Default)]
pub struct ConstraintSet {
    nodes: Vec<Constraint>,
    root: Option<ConstraintId>,
    /// Number of or-branches; branch 0 is the root branch. Filled by
    /// semantic completion.
    pub or_count: usize,
}

impl ConstraintSet {
    pub fn new() -> ConstraintSet {
        ConstraintSet::default()
    }

    pub fn alloc(&mut self, con: Constraint) -> ConstraintId {
        let id = ConstraintId(self.nodes.len() as u32);
        self.nodes.push(con);
        id
    }

    pub fn root(&self) -> ConstraintId {
        self.root.expect("constraint set has no root")
    }

    pub fn set_root(&mut self, id: ConstraintId) {
        self.root = Some(id);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: ConstraintId) -> &Constraint {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: ConstraintId) -> &mut Constraint {
        &mut self.nodes[id.index()]
    }

    /// Pre-order walk from `from`, self first, or-alternatives included.
    pub fn walk(&self, from: ConstraintId) -> Vec<ConstraintId> {
        let mut out = Vec::new();
        let mut pending = vec![from];
        while let Some(id) = pending.pop() {
            out.push(id);
            let node = self.node(id);
            for &child in node.children.iter().rev() {
                pending.push(child);
            }
            if let Some(alt) = node.alt {
                pending.push(alt);
            }
        }
        out
    }

    /// Ancestors of `id`, nearest first, excluding `id` itself.
    pub fn ancestors(&self, id: ConstraintId) -> Vec<ConstraintId> {
        let mut out = Vec::new();
        let mut cursor = self.node(id).parent;
        while let Some(p) = cursor {
            out.push(p);
            cursor = self.node(p).parent;
        }
        out
    }
}

/// How a constraint connects to its parent.
///
/// `MyLinkageToParent(l)`: this primitive's linkage `l` points at the
/// parent's primitive. `ParentLinkageToMe(l)`: the parent's linkage `l`
/// points at this primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRel {
    MyLinkageToParent(Linkage),
    ParentLinkageToMe(Linkage),
}

/// Three-valued intrinsic flags (`live`, `archival`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tri {
    True,
    False,
    #[default]
    DontCare,
}

impl Tri {
    pub fn admits(self, actual: bool) -> bool {
        match self {
            Tri::True => actual,
            Tri::False => !actual,
            Tri::DontCare => true,
        }
    }
}

/// String comparison rule used by value/name inequalities and sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum Comparator {
    #[default]
    Octet,
    Numeric,
}

impl Comparator {
    pub fn compare(self, a: &str, b: &str) -> std::cmp::Ordering {
        match self {
            Comparator::Octet => a.cmp(b),
            Comparator::Numeric => match (a.parse::<f64>(), b.parse::<f64>()) {
                (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
                // Non-numbers sort after numbers, among themselves by octets.
                (Ok(_), Err(_)) => std::cmp::Ordering::Less,
                (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
                (Err(_), Err(_)) => a.cmp(b),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueOp {
    Eq,
    Ne,
    Match,
    Lt,
    Le,
    Gt,
    Ge,
}

/// One `name=`/`value=` clause. Clauses queue up; all must hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueClause {
    pub op: ValueOp,
    /// `None` is the explicit `null` operand: the field must be absent.
    pub operand: Option<SmolStr>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValueQueue {
    pub clauses: Vec<ValueClause>,
}

impl ValueQueue {
    pub fn push(&mut self, op: ValueOp, operand: Option<SmolStr>) {
        self.clauses.push(ValueClause { op, operand });
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// The single equality operand, if the queue pins one.
    pub fn eq_operand(&self) -> Option<&str> {
        self.clauses.iter().find_map(|c| match c.op {
            ValueOp::Eq => c.operand.as_deref(),
            _ => None,
        })
    }

    /// True if two equality clauses can never both hold.
    pub fn contradictory(&self) -> bool {
        let mut eqs = self.clauses.iter().filter_map(|c| match c.op {
            ValueOp::Eq => Some(c.operand.as_deref()),
            _ => None,
        });
        match eqs.next() {
            None => false,
            Some(first) => eqs.any(|other| other != first),
        }
    }
}

/// Guid-set constraint on the primitive itself or one of its linkages.
/// `eq: None` is unconstrained; `eq: Some(vec![])` is unsatisfiable.
/// Operands are `None` for the literal `null` (linkage absent).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuidSpec {
    pub eq: Option<Vec<Option<Guid>>>,
    pub ne: Vec<Option<Guid>>,
    /// `~=` lineage matches; semantic completion expands these into `eq`
    /// sets over the full generation chain.
    pub lineage: Vec<Guid>,
}

impl GuidSpec {
    pub fn is_unconstrained(&self) -> bool {
        self.eq.is_none() && self.ne.is_empty() && self.lineage.is_empty()
    }

    pub fn require(&mut self, guid: Option<Guid>) {
        match &mut self.eq {
            Some(set) => set.retain(|g| *g == guid),
            None => self.eq = Some(vec![guid]),
        }
    }

    pub fn intersect_eq(&mut self, guids: impl IntoIterator<Item = Option<Guid>>) {
        let incoming: Vec<Option<Guid>> = guids.into_iter().collect();
        match &mut self.eq {
            Some(set) => set.retain(|g| incoming.contains(g)),
            None => self.eq = Some(incoming),
        }
    }

    pub fn admits(&self, guid: Option<Guid>) -> bool {
        if let Some(set) = &self.eq
            && !set.contains(&guid)
        {
            return false;
        }
        !self.ne.contains(&guid)
    }

    /// Statically unsatisfiable: an empty eq set admits nothing.
    pub fn is_false(&self) -> bool {
        self.eq.as_ref().is_some_and(|set| {
            set.iter().all(|g| self.ne.contains(g)) || set.is_empty()
        })
    }
}

/// Fields a `key=`/`unique=` clause can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum KeyField {
    Name,
    Value,
    Datatype,
    Timestamp,
    Typeguid,
    Right,
    Left,
    Scope,
}

impl KeyField {
    const ALL: [KeyField; 8] = [
        KeyField::Name,
        KeyField::Value,
        KeyField::Datatype,
        KeyField::Timestamp,
        KeyField::Typeguid,
        KeyField::Right,
        KeyField::Left,
        KeyField::Scope,
    ];

    pub fn of_linkage(l: Linkage) -> KeyField {
        match l {
            Linkage::Typeguid => KeyField::Typeguid,
            Linkage::Right => KeyField::Right,
            Linkage::Left => KeyField::Left,
            Linkage::Scope => KeyField::Scope,
        }
    }
}

/// Bitmask over [`KeyField`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FieldMask(u16);

impl FieldMask {
    pub const EMPTY: FieldMask = FieldMask(0);

    pub fn set(&mut self, field: KeyField) {
        self.0 |= 1 << field as u16;
    }

    pub fn has(self, field: KeyField) -> bool {
        self.0 & (1 << field as u16) != 0
    }

    pub fn has_linkage(self, l: Linkage) -> bool {
        self.has(KeyField::of_linkage(l))
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn fields(self) -> impl Iterator<Item = KeyField> {
        KeyField::ALL.into_iter().filter(move |f| self.has(*f))
    }
}

/// One `$var=pattern` assignment. `declared_at` is filled by semantic
/// completion: the nearest ancestor (or self) that reads the variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub var: SmolStr,
    pub pattern: Pattern,
    pub declared_at: Option<ConstraintId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDir {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub dir: SortDir,
    pub pattern: Pattern,
}

/// Where a sort key's value is defined: the constraint whose primitive
/// supplies it (possibly reached through variable assignments), the
/// pattern to extract, and the ordering name used to match an iterator's
/// native ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortRoot {
    pub at: ConstraintId,
    pub pattern: Pattern,
    pub ordering: SmolStr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnchorMode {
    #[default]
    DontCare,
    Anchor,
    AnchorLocal,
    NoAnchor,
}

/// Generation selector (`newest=`/`oldest=`). `Unspecified` is what the
/// parser leaves behind; completion defaults `newest` to `Distance(0)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GenSpec {
    #[default]
    Unspecified,
    DontCare,
    /// Exact distance from the newest (for `newest=`) or oldest (for
    /// `oldest=`) generation of the lineage.
    Distance(u64),
}

impl GenSpec {
    pub fn admits(self, distance: u64) -> bool {
        match self {
            GenSpec::Unspecified | GenSpec::DontCare => true,
            GenSpec::Distance(want) => distance == want,
        }
    }
}

/// Unresolved `asof=` operand; dateline compilation turns it into id caps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Asof {
    Timestamp(Timestamp),
    Dateline(Dateline),
}

/// A node of the query tree. Built by the parser, normalized by semantic
/// completion, annotated with its iterator by the planner.
#[derive(Debug, Clone, Default)]
pub struct Constraint {
    // Structure.
    pub parent: Option<ConstraintId>,
    pub children: Vec<ConstraintId>,
    pub rel: Option<LinkRel>,
    /// Bare `->`/`<-` written without a linkage name; resolved by the
    /// linkage-inference step.
    pub rel_inferred: bool,
    /// My tail alternative (this node is an or-head).
    pub alt: Option<ConstraintId>,
    /// The head this node is the tail alternative of.
    pub alt_of: Option<ConstraintId>,
    /// Dense or-branch index; 0 is the root branch. Assigned by semantic
    /// completion.
    pub or_index: usize,

    // Intrinsics.
    pub type_names: Vec<SmolStr>,
    pub guid: GuidSpec,
    pub linkage: [GuidSpec; 4],
    pub name: ValueQueue,
    pub value: ValueQueue,
    pub datatype: Option<ValueType>,
    pub live: Tri,
    pub archival: Tri,
    pub timestamp_min: Option<(Timestamp, bool)>,
    pub timestamp_max: Option<(Timestamp, bool)>,
    pub newest: GenSpec,
    pub oldest: GenSpec,
    pub asof: Option<Asof>,
    pub anchor: AnchorMode,
    pub count_min: u64,
    pub count_max: Option<u64>,
    pub pagesize: Option<u64>,
    pub countlimit: Option<u64>,
    pub resultpagesize: Option<u64>,
    pub start: u64,
    pub cursor: Option<SmolStr>,
    pub comparator: Comparator,
    pub value_comparator: Comparator,
    pub key_mask: FieldMask,
    pub unique_mask: FieldMask,

    pub result: Option<Pattern>,
    pub sort: Vec<SortKey>,
    pub assignments: Vec<Assignment>,

    // Derived at completion / evaluation.
    pub sort_root: Option<SortRoot>,
    /// Compiled dateline window on the id axis, inclusive.
    pub id_min: Option<LocalId>,
    pub id_max: Option<LocalId>,
    /// Resolved `type=` names.
    pub typeguids_resolved: bool,
    /// Statically unsatisfiable; monotonic within a request.
    pub con_false: bool,
    /// Estimated upper bound of the result set, from the iterator.
    pub set_size: Option<u64>,
    /// Existing primitive this keyed constraint resolved to, found by the
    /// key-cluster read before the insert phase.
    pub matched_guid: Option<Guid>,
}

impl Constraint {
    /// A fresh constraint carries only what the parser saw; the rest of
    /// the defaults land in `semantic::complete`.
    pub fn new() -> Constraint {
        Constraint {
            count_min: 1,
            live: Tri::True,
            ..Default::default()
        }
    }

    pub fn mark_false(&mut self) {
        self.con_false = true;
    }

    pub fn is_optional(&self) -> bool {
        self.count_min == 0
    }

    /// The linkage on this primitive that points at the parent, if the
    /// relation goes that way.
    pub fn my_linkage(&self) -> Option<Linkage> {
        match self.rel {
            Some(LinkRel::MyLinkageToParent(l)) => Some(l),
            _ => None,
        }
    }

    /// The linkage on the parent that points at this primitive.
    pub fn parent_linkage(&self) -> Option<Linkage> {
        match self.rel {
            Some(LinkRel::ParentLinkageToMe(l)) => Some(l),
            _ => None,
        }
    }

    /// Whether the given key/unique field is actually constrained here;
    /// semantic completion refuses masks naming absent fields.
    pub fn constrains(&self, field: KeyField) -> bool {
        match field {
            KeyField::Name => !self.name.is_empty(),
            KeyField::Value => !self.value.is_empty(),
            KeyField::Datatype => self.datatype.is_some(),
            KeyField::Timestamp => {
                self.timestamp_min.is_some() || self.timestamp_max.is_some()
            }
            KeyField::Typeguid => {
                !self.type_names.is_empty()
                    || !self.linkage[Linkage::Typeguid.index()].is_unconstrained()
            }
            KeyField::Right => !self.linkage[Linkage::Right.index()].is_unconstrained(),
            KeyField::Left => !self.linkage[Linkage::Left.index()].is_unconstrained(),
            KeyField::Scope => !self.linkage[Linkage::Scope.index()].is_unconstrained(),
        }
    }
}

impl ConstraintSet {
    /// Like [`Constraint::constrains`], but a linkage field is also
    /// satisfied by a subconstraint standing in the parent's linkage
    /// (`ParentLinkageToMe`), the way keyed clusters join.
    pub fn constrains_with_children(&self, id: ConstraintId, field: KeyField) -> bool {
        let node = self.node(id);
        if node.constrains(field) {
            return true;
        }
        let wanted = match field {
            KeyField::Typeguid => Some(Linkage::Typeguid),
            KeyField::Right => Some(Linkage::Right),
            KeyField::Left => Some(Linkage::Left),
            KeyField::Scope => Some(Linkage::Scope),
            _ => None,
        };
        let Some(wanted) = wanted else {
            return false;
        };
        node.children
            .iter()
            .any(|&c| self.node(c).parent_linkage() == Some(wanted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guid_spec_intersection_narrows() {
        let g1 = Guid::new(1, LocalId::new(1), 0);
        let g2 = Guid::new(1, LocalId::new(2), 0);

        let mut spec = GuidSpec::default();
        assert!(spec.admits(Some(g1)));
        spec.intersect_eq([Some(g1), Some(g2)]);
        assert!(spec.admits(Some(g2)));
        spec.require(Some(g1));
        assert!(spec.admits(Some(g1)));
        assert!(!spec.admits(Some(g2)));
        spec.require(Some(g2));
        assert!(spec.is_false());
    }

    #[test]
    fn guid_spec_exclusion() {
        let g1 = Guid::new(1, LocalId::new(1), 0);
        let mut spec = GuidSpec::default();
        spec.ne.push(Some(g1));
        assert!(!spec.admits(Some(g1)));
        assert!(spec.admits(None));
        spec.eq = Some(vec![Some(g1)]);
        assert!(spec.is_false());
    }

    #[test]
    fn value_queue_contradiction() {
        let mut q = ValueQueue::default();
        q.push(ValueOp::Eq, Some("a".into()));
        assert!(!q.contradictory());
        q.push(ValueOp::Ne, Some("b".into()));
        assert!(!q.contradictory());
        q.push(ValueOp::Eq, Some("b".into()));
        assert!(q.contradictory());
    }

    #[test]
    fn field_mask_round_trip() {
        let mut mask = FieldMask::EMPTY;
        mask.set(KeyField::Name);
        mask.set(KeyField::Left);
        assert!(mask.has(KeyField::Name));
        assert!(mask.has_linkage(Linkage::Left));
        assert!(!mask.has(KeyField::Value));
        assert_eq!(mask.fields().count(), 2);
    }

    #[test]
    fn walk_is_preorder() {
        let mut set = ConstraintSet::new();
        let root = set.alloc(Constraint::new());
        let a = set.alloc(Constraint::new());
        let b = set.alloc(Constraint::new());
        let b_child = set.alloc(Constraint::new());
        set.node_mut(root).children = vec![a, b];
        set.node_mut(a).parent = Some(root);
        set.node_mut(b).parent = Some(root);
        set.node_mut(b).children = vec![b_child];
        set.node_mut(b_child).parent = Some(b);
        set.set_root(root);

        assert_eq!(set.walk(root), vec![root, a, b, b_child]);
        assert_eq!(set.ancestors(b_child), vec![b, root]);
    }
}
