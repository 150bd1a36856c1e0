use crate::error::StoreError;
use crate::guid::{Guid, LocalId};
use crate::primitive::{Draft, Linkage, Primitive};
use crate::timestamp::Timestamp;

/// The narrow contract the query engine consumes. An implementation is an
/// append-only sequence of primitives, addressed by local id in insertion
/// order, plus secondary enumerations that return ids sorted ascending.
///
/// Timestamps must be non-decreasing in id order; the dateline compiler
/// binary-searches the id axis by timestamp on that assumption.
pub trait Store {
    /// Instance id stamped into guids and datelines.
    fn instance_id(&self) -> u32;

    /// The next local id that would be assigned. Every id in
    /// `1..horizon().raw()` reads successfully.
    fn horizon(&self) -> LocalId;

    fn read(&self, id: LocalId) -> Result<Primitive, StoreError>;

    fn guid_to_id(&self, guid: Guid) -> Option<LocalId>;

    /// The newest generation of `guid`'s lineage, if the lineage exists.
    fn newest(&self, guid: Guid) -> Option<Guid>;

    /// All generations of `guid`'s lineage, oldest first.
    fn generations(&self, guid: Guid) -> Vec<Guid>;

    /// First phase of a write: append and index the primitive, returning
    /// its id and guid. The primitive is visible to readers of this store
    /// handle immediately, but remains part of an open transaction until
    /// [`commit`](Store::commit).
    fn alloc(&mut self, draft: Draft) -> Result<(LocalId, Guid), StoreError>;

    /// Seal the open transaction. A no-op when nothing is pending.
    fn commit(&mut self) -> Result<(), StoreError>;

    /// Horizon to restore on rollback, taken before a write begins.
    fn checkpoint(&self) -> LocalId;

    /// Discard every primitive at or above `horizon`, committed or not.
    fn rollback_to(&mut self, horizon: LocalId) -> Result<(), StoreError>;

    /// Ids of primitives whose linkage `l` points at `guid`, ascending.
    fn ids_with_linkage(&self, l: Linkage, guid: Guid) -> Vec<LocalId>;

    /// Native source+type ("VIP") enumeration: ids whose linkage `l`
    /// points at `guid` and whose typeguid is `typeguid`. `None` when no
    /// native index covers this pair and the caller must intersect.
    fn vip_ids(&self, l: Linkage, guid: Guid, typeguid: Guid) -> Option<Vec<LocalId>>;

    fn ids_with_name(&self, name: &str) -> Vec<LocalId>;

    fn ids_with_value(&self, value: &str) -> Vec<LocalId>;

    fn first_id_at_or_after(&self, t: Timestamp) -> Option<LocalId>;

    fn last_id_at_or_before(&self, t: Timestamp) -> Option<LocalId>;
}
