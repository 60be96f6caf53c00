//! Storage: the backend protocol, its implementations, and the engine

pub mod backend;
pub mod engine;
pub mod memory;
pub mod record;
pub mod redb_backend;

pub use backend::{BackendTransaction, IncludeSpec, StorageBackend};
pub use engine::{
	NodeAddress, NodeInfo, NodeValue, ReadOptions, RevisionAssert, StorageEngine, WriteOptions,
};
pub use memory::MemoryBackend;
pub use record::{RecordValue, StoredRecord};
pub use redb_backend::RedbBackend;
