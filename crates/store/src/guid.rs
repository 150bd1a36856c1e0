use std::fmt;
use std::str::FromStr;

/// Local insertion-order id of a primitive. Ids start at 1 and grow by one
/// per committed primitive; 0 is never assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct LocalId(u64);

impl LocalId {
    pub const ZERO: LocalId = LocalId(0);
    pub const FIRST: LocalId = LocalId(1);

    pub const fn new(raw: u64) -> Self {
        LocalId(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn next(self) -> Self {
        LocalId(self.0 + 1)
    }

    pub const fn prev(self) -> Option<Self> {
        match self.0 {
            0 | 1 => None,
            n => Some(LocalId(n - 1)),
        }
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl nohash_hasher::IsEnabled for LocalId {}

/// 128-bit primitive identity. The packing is
/// `[instance:32][lineage start id:64][generation:32]`: the instance id of
/// the database that created the lineage, the local id the lineage started
/// at, and how many versions down the chain this guid is.
///
/// Two guids of the same lineage differ only in their low 32 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Guid(u128);

impl Guid {
    pub fn new(instance: u32, lineage_start: LocalId, generation: u32) -> Self {
        Guid(((instance as u128) << 96) | ((lineage_start.raw() as u128) << 32) | generation as u128)
    }

    pub const fn from_raw(raw: u128) -> Self {
        Guid(raw)
    }

    pub const fn raw(self) -> u128 {
        self.0
    }

    pub fn instance(self) -> u32 {
        (self.0 >> 96) as u32
    }

    pub fn lineage_start(self) -> LocalId {
        LocalId::new((self.0 >> 32) as u64)
    }

    pub fn generation(self) -> u32 {
        self.0 as u32
    }

    /// The generation-zero guid of this guid's lineage.
    pub fn original(self) -> Guid {
        Guid(self.0 & !0xffff_ffffu128)
    }

    /// True if `other` names the same lineage, at any generation.
    pub fn same_lineage(self, other: Guid) -> bool {
        self.original() == other.original()
    }

    pub fn with_generation(self, generation: u32) -> Guid {
        Guid((self.0 & !0xffff_ffffu128) | generation as u128)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuidParseError;

impl fmt::Display for GuidParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("guid must be 1..=32 hex digits")
    }
}

impl std::error::Error for GuidParseError {}

impl FromStr for Guid {
    type Err = GuidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > 32 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(GuidParseError);
        }
        let raw = u128::from_str_radix(s, 16).map_err(|_| GuidParseError)?;
        Ok(Guid(raw))
    }
}
