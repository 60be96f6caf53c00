//! canopy — an embedded hierarchical realtime database
//!
//! Data lives in a single JSON-like tree addressed by slash-separated
//! paths. Reads, writes, event subscriptions and queries all work on
//! arbitrary sub-trees, over a pluggable storage backend.
//!
//! ```no_run
//! use canopy::{Database, DatabaseConfig, object};
//!
//! # async fn demo() -> canopy::DbResult<()> {
//! let db = Database::in_memory(DatabaseConfig::default()).await?;
//!
//! let alice = db.reference("users/alice");
//! let mut events = alice.on("value")?;
//! alice.set(object! { "name" => "alice", "age" => 30 }).await?;
//!
//! let snapshot = events.next().await.unwrap();
//! assert!(snapshot.exists());
//!
//! let adults = db
//! 	.reference("users")
//! 	.query()
//! 	.filter("age", ">=", 18)
//! 	.sort("age", true)
//! 	.get()
//! 	.await?;
//! # let _ = adults;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod ids;
pub mod index;
pub mod lock;
pub mod mutations;
pub mod path;
pub mod query;
pub mod storage;
pub mod subscriptions;
pub mod value;

pub use api::{
	Database, DatabaseStats, DataReference, DataSnapshot, EventStream, IndexOptions,
	LiveQueryResults, QueryBuilder,
};
pub use config::DatabaseConfig;
pub use error::{DbError, DbResult};
pub use index::{IndexKind, IndexSpec};
pub use mutations::{compare_values, Compare};
pub use path::{PathInfo, PathKey};
pub use query::{MonitorOptions, QueryEvent, QueryEventName, QueryMonitor};
pub use storage::{
	MemoryBackend, NodeAddress, NodeInfo, ReadOptions, RedbBackend, StorageBackend,
};
pub use subscriptions::{DataEvent, EventType, Mutation};
pub use value::{PathReference, Value, ValueKind};
