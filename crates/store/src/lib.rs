pub mod dateline;
pub mod error;
pub mod guid;
pub mod mem;
pub mod primitive;
pub mod store;
pub mod timestamp;

pub use dateline::Dateline;
pub use error::StoreError;
pub use guid::{Guid, LocalId};
pub use mem::MemStore;
pub use primitive::{Draft, LINKAGE_N, Linkage, Primitive, ValueType};
pub use store::Store;
pub use timestamp::Timestamp;
