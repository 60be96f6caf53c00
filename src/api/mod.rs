//! Public database API
//!
//! `Database` owns the engine and hands out `DataReference`s, the façade
//! for all reads, writes, subscriptions and queries.

mod reference;
mod snapshot;

pub use reference::{DataReference, EventStream, LiveQueryResults, QueryBuilder};
pub use snapshot::DataSnapshot;

use crate::config::DatabaseConfig;
use crate::error::{DbError, DbResult};
use crate::index::{IndexCoordinator, IndexKind, IndexSpec};
use crate::storage::backend::StorageBackend;
use crate::storage::engine::StorageEngine;
use crate::storage::memory::MemoryBackend;
use crate::storage::redb_backend::RedbBackend;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Options for creating a secondary index
#[derive(Debug, Clone)]
pub struct IndexOptions {
	pub kind: IndexKind,
	/// Extra keys stored with each entry so covered queries skip record
	/// loads
	pub include: Vec<String>,
}

impl Default for IndexOptions {
	fn default() -> Self {
		Self { kind: IndexKind::Normal, include: Vec::new() }
	}
}

/// Usage counters for one database
#[derive(Debug, Clone, Default)]
pub struct DatabaseStats {
	pub reads: u64,
	pub writes: u64,
	pub deletes: u64,
	pub events_dispatched: u64,
	pub subscriber_count: usize,
	pub index_count: usize,
}

pub(crate) struct DbInner {
	pub(crate) engine: Arc<StorageEngine>,
}

/// An embedded hierarchical realtime database
#[derive(Clone)]
pub struct Database {
	inner: Arc<DbInner>,
}

impl Database {
	/// Open a database on any backend implementing the storage protocol
	pub async fn with_backend(
		backend: Arc<dyn StorageBackend>,
		config: DatabaseConfig,
	) -> DbResult<Database> {
		let name = backend.name();
		let engine = Arc::new(StorageEngine::new(backend, config).await?);
		info!(backend = name, "database opened");
		Ok(Database { inner: Arc::new(DbInner { engine }) })
	}

	/// Open a non-persistent in-memory database
	pub async fn in_memory(config: DatabaseConfig) -> DbResult<Database> {
		Self::with_backend(Arc::new(MemoryBackend::new()), config).await
	}

	/// Open (or create) a redb-backed database file
	pub async fn open(file: impl AsRef<Path>, config: DatabaseConfig) -> DbResult<Database> {
		let backend = RedbBackend::new(file)?;
		Self::with_backend(Arc::new(backend), config).await
	}

	/// Reference a node by path. The path is validated when the reference
	/// is used; wildcard paths only support subscriptions and queries.
	pub fn reference(&self, path: &str) -> DataReference {
		DataReference::new(Arc::clone(&self.inner), path)
	}

	/// Reference the root node
	pub fn root(&self) -> DataReference {
		self.reference("")
	}

	/// Create and build a secondary index on the child records of `path`,
	/// keyed on `key`. Returns without work when an identical index exists.
	pub async fn create_index(
		&self,
		path: &str,
		key: &str,
		options: IndexOptions,
	) -> DbResult<()> {
		let coordinator: &Arc<IndexCoordinator> = self.inner.engine.indexes();
		if coordinator.exists(path, key, options.kind) {
			return Ok(());
		}
		let spec = IndexSpec {
			path: path.to_string(),
			key: key.to_string(),
			include: options.include,
			kind: options.kind,
		};
		let index = IndexCoordinator::instantiate(spec)?;
		// Register before building so concurrent writes reach the index;
		// the build overwrites entries per path, so replays are harmless
		coordinator.add(Arc::clone(&index));
		index.build(&self.inner.engine).await?;
		info!(index = %index.spec().description(), "index ready");
		Ok(())
	}

	/// Definitions of all registered indexes
	pub fn indexes(&self) -> Vec<IndexSpec> {
		self.inner.engine.indexes().specs()
	}

	/// Usage counters
	pub fn stats(&self) -> DatabaseStats {
		let engine = &self.inner.engine;
		DatabaseStats {
			reads: engine.stats().reads(),
			writes: engine.stats().writes(),
			deletes: engine.stats().deletes(),
			events_dispatched: engine.subscriptions().events_dispatched(),
			subscriber_count: engine.subscriptions().subscriber_count(),
			index_count: engine.indexes().all().len(),
		}
	}

	/// The storage engine, for integrating external collaborators
	pub fn engine(&self) -> &Arc<StorageEngine> {
		&self.inner.engine
	}
}

impl DbInner {
	pub(crate) fn validate_concrete(&self, path: &str, operation: &str) -> DbResult<()> {
		let info = crate::path::PathInfo::parse(path)?;
		if info.contains_wildcards() {
			return Err(DbError::not_allowed(
				path,
				format!("{} is not possible on a wildcard path, use query() instead", operation),
			));
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::object;
	use crate::value::Value;

	#[tokio::test]
	async fn test_open_in_memory_and_stats() {
		let db = Database::in_memory(DatabaseConfig::default()).await.unwrap();
		db.reference("greeting").set("hello").await.unwrap();
		let _ = db.reference("greeting").get().await.unwrap();

		let stats = db.stats();
		assert_eq!(stats.writes, 1);
		assert!(stats.reads >= 1);
		assert_eq!(stats.index_count, 0);
	}

	#[tokio::test]
	async fn test_open_redb_backed() {
		let dir = tempfile::tempdir().unwrap();
		let file = dir.path().join("db.redb");
		{
			let db = Database::open(&file, DatabaseConfig::default()).await.unwrap();
			db.reference("users/alice")
				.set(object! { "name" => "alice" })
				.await
				.unwrap();
		}
		// Values survive reopening
		let db = Database::open(&file, DatabaseConfig::default()).await.unwrap();
		let snapshot = db.reference("users/alice").get().await.unwrap();
		assert_eq!(snapshot.val(), Some(&object! { "name" => "alice" }));
	}

	#[tokio::test]
	async fn test_create_index_idempotent() {
		let db = Database::in_memory(DatabaseConfig::default()).await.unwrap();
		db.reference("users/alice").set(object! { "age" => 30 }).await.unwrap();

		db.create_index("users", "age", IndexOptions::default()).await.unwrap();
		db.create_index("users", "age", IndexOptions::default()).await.unwrap();
		assert_eq!(db.indexes().len(), 1);
		assert_eq!(db.stats().index_count, 1);
	}

	#[tokio::test]
	async fn test_wildcard_write_rejected() {
		let db = Database::in_memory(DatabaseConfig::default()).await.unwrap();
		let result = db.reference("users/*").set(Value::from(1)).await;
		assert!(matches!(result, Err(DbError::NotAllowed { .. })));
	}
}
