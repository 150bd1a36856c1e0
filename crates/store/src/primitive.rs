use smol_str::SmolStr;
use strum_macros::{AsRefStr, EnumIter, EnumString};

use crate::guid::Guid;
use crate::timestamp::Timestamp;

/// The four typed references a primitive can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum Linkage {
    Typeguid,
    Right,
    Left,
    Scope,
}

pub const LINKAGE_N: usize = 4;

impl Linkage {
    pub const ALL: [Linkage; LINKAGE_N] = [
        Linkage::Typeguid,
        Linkage::Right,
        Linkage::Left,
        Linkage::Scope,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Linkage> {
        Linkage::ALL.get(index).copied()
    }

    /// Linkages backed by a dedicated source+type index in the store.
    pub const fn has_vip_index(self) -> bool {
        matches!(self, Linkage::Left | Linkage::Right)
    }
}

/// Tag describing how a primitive's value octets should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum ValueType {
    #[default]
    Unspecified,
    Null,
    String,
    Integer,
    Float,
    Guid,
    Timestamp,
    Url,
    Bytestring,
    Boolean,
}

/// One immutable record. Everything a primitive will ever say about itself
/// is fixed at creation; revising one means appending a new primitive whose
/// `previous` points at the old generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Primitive {
    guid: Guid,
    timestamp: Timestamp,
    datatype: ValueType,
    live: bool,
    archival: bool,
    txstart: bool,
    linkages: [Option<Guid>; LINKAGE_N],
    name: Option<SmolStr>,
    value: Option<SmolStr>,
    previous: Option<Guid>,
}

impl Primitive {
    pub(crate) fn from_draft(guid: Guid, draft: Draft) -> Primitive {
        Primitive {
            guid,
            timestamp: draft.timestamp,
            datatype: draft.datatype,
            live: draft.live,
            archival: draft.archival,
            txstart: draft.txstart,
            linkages: draft.linkages,
            name: draft.name,
            value: draft.value,
            previous: draft.previous,
        }
    }

    pub fn guid(&self) -> Guid {
        self.guid
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn datatype(&self) -> ValueType {
        self.datatype
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn is_archival(&self) -> bool {
        self.archival
    }

    pub fn is_txstart(&self) -> bool {
        self.txstart
    }

    pub fn linkage(&self, l: Linkage) -> Option<Guid> {
        self.linkages[l.index()]
    }

    pub fn linkages(&self) -> &[Option<Guid>; LINKAGE_N] {
        &self.linkages
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn previous(&self) -> Option<Guid> {
        self.previous
    }

    pub fn generation(&self) -> u32 {
        self.guid.generation()
    }
}

/// What a writer hands to [`Store::alloc`](crate::store::Store::alloc).
/// The store assigns the local id and derives the guid: a fresh lineage for
/// originals, `previous.generation() + 1` for versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    pub timestamp: Timestamp,
    pub datatype: ValueType,
    pub live: bool,
    pub archival: bool,
    pub txstart: bool,
    pub linkages: [Option<Guid>; LINKAGE_N],
    pub name: Option<SmolStr>,
    pub value: Option<SmolStr>,
    pub previous: Option<Guid>,
}

impl Draft {
    pub fn node(timestamp: Timestamp) -> Draft {
        Draft {
            timestamp,
            datatype: ValueType::Unspecified,
            live: true,
            archival: false,
            txstart: false,
            linkages: [None; LINKAGE_N],
            name: None,
            value: None,
            previous: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<SmolStr>) -> Draft {
        self.name = Some(name.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<SmolStr>) -> Draft {
        self.value = Some(value.into());
        self.datatype = ValueType::String;
        self
    }

    pub fn with_linkage(mut self, l: Linkage, guid: Guid) -> Draft {
        self.linkages[l.index()] = Some(guid);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linkage_names_round_trip() {
        for l in Linkage::ALL {
            assert_eq!(l.as_ref().parse::<Linkage>().unwrap(), l);
        }
        assert_eq!("left".parse::<Linkage>().unwrap(), Linkage::Left);
        assert!("lefty".parse::<Linkage>().is_err());
    }

    #[test]
    fn linkage_index_round_trips() {
        for (i, l) in Linkage::ALL.into_iter().enumerate() {
            assert_eq!(l.index(), i);
            assert_eq!(Linkage::from_index(i), Some(l));
        }
        assert_eq!(Linkage::from_index(LINKAGE_N), None);
    }
}
