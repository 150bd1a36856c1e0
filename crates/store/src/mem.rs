use ahash::AHashMap;
use smol_str::SmolStr;

use crate::error::{MAX_BLOB, StoreError};
use crate::guid::{Guid, LocalId};
use crate::primitive::{Draft, LINKAGE_N, Linkage, Primitive};
use crate::store::Store;
use crate::timestamp::Timestamp;

/// Fan-in at which a (linkage, source) pair gets a native source+type
/// enumeration. Below it, [`Store::vip_ids`] reports no index and the
/// engine intersects the two single-key enumerations instead.
pub const VIP_THRESHOLD: usize = 8;

/// In-memory reference store: a `Vec` of primitives (`id == index + 1`)
/// with eagerly-maintained secondary indexes. Rollback truncates the
/// vector and rebuilds the indexes from what is left.
#[derive(Debug, Default)]
pub struct MemStore {
    instance: u32,
    read_only: bool,
    prims: Vec<Primitive>,
    // First id of the open transaction; cleared by commit.
    pending_from: Option<LocalId>,
    ids: AHashMap<Guid, LocalId>,
    lineages: AHashMap<Guid, Vec<LocalId>>,
    by_linkage: [AHashMap<Guid, Vec<LocalId>>; LINKAGE_N],
    vips: AHashMap<(Linkage, Guid, Guid), Vec<LocalId>>,
    by_name: AHashMap<SmolStr, Vec<LocalId>>,
    by_value: AHashMap<SmolStr, Vec<LocalId>>,
}

impl MemStore {
    pub fn new(instance: u32) -> MemStore {
        MemStore {
            instance,
            ..Default::default()
        }
    }

    pub fn read_only(instance: u32) -> MemStore {
        MemStore {
            instance,
            read_only: true,
            ..Default::default()
        }
    }

    pub fn primitive_n(&self) -> usize {
        self.prims.len()
    }

    /// Follower-side refresh: adopt the leader's committed primitives.
    /// Only meaningful on a read-only mirror of the same instance.
    pub fn refresh_from(&mut self, leader: &MemStore) -> Result<(), StoreError> {
        if leader.instance != self.instance {
            return Err(StoreError::Corrupt(format!(
                "refresh across instances {:x} -> {:x}",
                leader.instance, self.instance
            )));
        }
        for prim in &leader.prims[self.prims.len()..] {
            self.index(prim.clone());
        }
        Ok(())
    }

    fn index(&mut self, prim: Primitive) {
        let id = LocalId::new(self.prims.len() as u64 + 1);
        self.ids.insert(prim.guid(), id);
        self.lineages
            .entry(prim.guid().original())
            .or_default()
            .push(id);
        for l in Linkage::ALL {
            let Some(target) = prim.linkage(l) else {
                continue;
            };
            self.by_linkage[l.index()]
                .entry(target)
                .or_default()
                .push(id);
            if l.has_vip_index()
                && let Some(typeguid) = prim.linkage(Linkage::Typeguid)
            {
                self.vips.entry((l, target, typeguid)).or_default().push(id);
            }
        }
        if let Some(name) = prim.name() {
            self.by_name.entry(name.into()).or_default().push(id);
        }
        if let Some(value) = prim.value() {
            self.by_value.entry(value.into()).or_default().push(id);
        }
        self.prims.push(prim);
    }

    fn rebuild_indexes(&mut self) {
        self.ids.clear();
        self.lineages.clear();
        self.by_linkage = Default::default();
        self.vips.clear();
        self.by_name.clear();
        self.by_value.clear();
        let prims = std::mem::take(&mut self.prims);
        for prim in prims {
            self.index(prim);
        }
    }

    fn check_draft(&self, draft: &Draft) -> Result<(), StoreError> {
        if let Some(name) = &draft.name
            && name.len() > MAX_BLOB
        {
            return Err(StoreError::TooBig {
                what: "name",
                size: name.len(),
            });
        }
        if let Some(value) = &draft.value
            && value.len() > MAX_BLOB
        {
            return Err(StoreError::TooBig {
                what: "value",
                size: value.len(),
            });
        }
        for target in draft.linkages.iter().flatten() {
            if !self.ids.contains_key(target) {
                return Err(StoreError::DanglingLinkage(*target));
            }
        }
        Ok(())
    }
}

impl Store for MemStore {
    fn instance_id(&self) -> u32 {
        self.instance
    }

    fn horizon(&self) -> LocalId {
        LocalId::new(self.prims.len() as u64 + 1)
    }

    fn read(&self, id: LocalId) -> Result<Primitive, StoreError> {
        match id.raw() {
            0 => Err(StoreError::IdNotFound(id)),
            n => self
                .prims
                .get(n as usize - 1)
                .cloned()
                .ok_or(StoreError::IdNotFound(id)),
        }
    }

    fn guid_to_id(&self, guid: Guid) -> Option<LocalId> {
        self.ids.get(&guid).copied()
    }

    fn newest(&self, guid: Guid) -> Option<Guid> {
        let chain = self.lineages.get(&guid.original())?;
        let last = *chain.last()?;
        Some(self.prims[last.raw() as usize - 1].guid())
    }

    fn generations(&self, guid: Guid) -> Vec<Guid> {
        self.lineages
            .get(&guid.original())
            .map(|chain| {
                chain
                    .iter()
                    .map(|id| self.prims[id.raw() as usize - 1].guid())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn alloc(&mut self, draft: Draft) -> Result<(LocalId, Guid), StoreError> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        self.check_draft(&draft)?;
        let id = self.horizon();
        let guid = match draft.previous {
            None => Guid::new(self.instance, id, 0),
            Some(prev) => {
                let newest = self
                    .newest(prev)
                    .ok_or(StoreError::GuidNotFound(prev))?;
                if newest != prev {
                    return Err(StoreError::StaleVersion(prev));
                }
                prev.with_generation(prev.generation() + 1)
            }
        };
        self.pending_from.get_or_insert(id);
        self.index(Primitive::from_draft(guid, draft));
        Ok((id, guid))
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.pending_from = None;
        Ok(())
    }

    fn checkpoint(&self) -> LocalId {
        self.pending_from.unwrap_or_else(|| self.horizon())
    }

    fn rollback_to(&mut self, horizon: LocalId) -> Result<(), StoreError> {
        if horizon == LocalId::ZERO || horizon > self.horizon() {
            return Err(StoreError::Corrupt(format!(
                "rollback to {horizon} outside 1..={}",
                self.horizon()
            )));
        }
        self.prims.truncate(horizon.raw() as usize - 1);
        self.pending_from = None;
        self.rebuild_indexes();
        Ok(())
    }

    fn ids_with_linkage(&self, l: Linkage, guid: Guid) -> Vec<LocalId> {
        self.by_linkage[l.index()]
            .get(&guid)
            .cloned()
            .unwrap_or_default()
    }

    fn vip_ids(&self, l: Linkage, guid: Guid, typeguid: Guid) -> Option<Vec<LocalId>> {
        if !l.has_vip_index() {
            return None;
        }
        let fan_in = self.by_linkage[l.index()].get(&guid).map_or(0, Vec::len);
        if fan_in < VIP_THRESHOLD {
            return None;
        }
        Some(
            self.vips
                .get(&(l, guid, typeguid))
                .cloned()
                .unwrap_or_default(),
        )
    }

    fn ids_with_name(&self, name: &str) -> Vec<LocalId> {
        self.by_name.get(name).cloned().unwrap_or_default()
    }

    fn ids_with_value(&self, value: &str) -> Vec<LocalId> {
        self.by_value.get(value).cloned().unwrap_or_default()
    }

    fn first_id_at_or_after(&self, t: Timestamp) -> Option<LocalId> {
        let off = self.prims.partition_point(|p| p.timestamp() < t);
        (off < self.prims.len()).then(|| LocalId::new(off as u64 + 1))
    }

    fn last_id_at_or_before(&self, t: Timestamp) -> Option<LocalId> {
        let off = self.prims.partition_point(|p| p.timestamp() <= t);
        (off > 0).then(|| LocalId::new(off as u64))
    }
}
