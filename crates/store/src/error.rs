use thiserror::Error;

use crate::guid::{Guid, LocalId};

/// Size ceiling for a single name or value, in bytes.
pub const MAX_BLOB: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("no primitive with local id {0}")]
    IdNotFound(LocalId),
    #[error("no primitive with guid {0}")]
    GuidNotFound(Guid),
    #[error("{what} is {size} bytes, limit is {MAX_BLOB}")]
    TooBig { what: &'static str, size: usize },
    #[error("linkage {0} does not exist in the store")]
    DanglingLinkage(Guid),
    #[error("previous guid {0} is not the newest of its lineage")]
    StaleVersion(Guid),
    #[error("store is read-only")]
    ReadOnly,
    #[error("store corrupt: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::IdNotFound(_) | StoreError::GuidNotFound(_)
        )
    }
}
