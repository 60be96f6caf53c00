//! Persistent storage backend on redb
//!
//! Records are bincode-encoded and keyed by canonical path in a single
//! table; canonical paths sharing a prefix are contiguous, so child and
//! descendant streams are prefix range scans. Writes are staged in memory
//! and applied in one redb write transaction on commit.

use crate::error::DbResult;
use crate::storage::backend::{
	AddCallback, BackendTransaction, CheckCallback, IncludeSpec, StorageBackend,
};
use crate::storage::record::StoredRecord;
use crate::path::{is_descendant_path, is_direct_child_path};
use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

const NODES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Durable backend storing records in a redb database file
pub struct RedbBackend {
	database: Arc<Database>,
}

impl RedbBackend {
	/// Create or open the database file at the given location
	pub fn new(file: impl AsRef<Path>) -> DbResult<Self> {
		let database = Database::create(file)?;

		// Make sure the table exists so read transactions can open it
		let init = database.begin_write()?;
		init.open_table(NODES_TABLE)?;
		init.commit()?;

		Ok(Self { database: Arc::new(database) })
	}

	/// Access the underlying redb database
	pub fn database(&self) -> &Arc<Database> {
		&self.database
	}
}

#[async_trait]
impl StorageBackend for RedbBackend {
	fn name(&self) -> &'static str {
		"redb"
	}

	fn supports_transactions(&self) -> bool {
		true
	}

	async fn transaction(&self, path: &str, write: bool) -> DbResult<Box<dyn BackendTransaction>> {
		Ok(Box::new(RedbTransaction {
			database: Arc::clone(&self.database),
			target_path: path.to_string(),
			write,
			staged: BTreeMap::new(),
		}))
	}
}

struct RedbTransaction {
	database: Arc<Database>,
	target_path: String,
	write: bool,
	/// Staged writes; None marks a removal
	staged: BTreeMap<String, Option<StoredRecord>>,
}

impl RedbTransaction {
	/// Walk the committed store and the staged overlay for one subtree,
	/// applying the check/add protocol. Records are decoded only after
	/// `check` accepts their path.
	fn stream(
		&self,
		parent: &str,
		children_only: bool,
		include: IncludeSpec,
		check: CheckCallback<'_>,
		add: AddCallback<'_>,
	) -> DbResult<()> {
		let related = |candidate: &str| {
			if children_only {
				is_direct_child_path(parent, candidate)
			} else {
				is_descendant_path(parent, candidate)
			}
		};
		let wants_record = include.metadata || include.value;

		let read = self.database.begin_read()?;
		let table = read.open_table(NODES_TABLE)?;
		for item in table.range(parent..)? {
			let (key, value) = item?;
			let path = key.value();
			if !path.starts_with(parent) {
				break;
			}
			if self.staged.contains_key(path) || !related(path) {
				continue;
			}
			if !check(path) {
				continue;
			}
			let payload = if wants_record {
				Some(StoredRecord::from_bytes(value.value())?)
			} else {
				None
			};
			if !add(path, payload) {
				return Ok(());
			}
		}

		for (path, staged) in &self.staged {
			let Some(record) = staged else {
				continue;
			};
			if !related(path) || !check(path) {
				continue;
			}
			let payload = wants_record.then(|| record.clone());
			if !add(path, payload) {
				return Ok(());
			}
		}
		Ok(())
	}
}

#[async_trait]
impl BackendTransaction for RedbTransaction {
	fn target_path(&self) -> &str {
		&self.target_path
	}

	fn is_write(&self) -> bool {
		self.write
	}

	async fn get(&mut self, path: &str) -> DbResult<Option<StoredRecord>> {
		if let Some(staged) = self.staged.get(path) {
			return Ok(staged.clone());
		}
		let read = self.database.begin_read()?;
		let table = read.open_table(NODES_TABLE)?;
		match table.get(path)? {
			Some(guard) => Ok(Some(StoredRecord::from_bytes(guard.value())?)),
			None => Ok(None),
		}
	}

	async fn set(&mut self, path: &str, record: StoredRecord) -> DbResult<()> {
		self.staged.insert(path.to_string(), Some(record));
		Ok(())
	}

	async fn remove(&mut self, path: &str) -> DbResult<()> {
		self.staged.insert(path.to_string(), None);
		Ok(())
	}

	async fn children_of(
		&mut self,
		path: &str,
		include: IncludeSpec,
		check: CheckCallback<'_>,
		add: AddCallback<'_>,
	) -> DbResult<()> {
		self.stream(path, true, include, check, add)
	}

	async fn descendants_of(
		&mut self,
		path: &str,
		include: IncludeSpec,
		check: CheckCallback<'_>,
		add: AddCallback<'_>,
	) -> DbResult<()> {
		self.stream(path, false, include, check, add)
	}

	async fn commit(self: Box<Self>) -> DbResult<()> {
		if self.staged.is_empty() {
			return Ok(());
		}
		let write = self.database.begin_write()?;
		{
			let mut table = write.open_table(NODES_TABLE)?;
			for (path, staged) in &self.staged {
				match staged {
					Some(record) => {
						let bytes = record.to_bytes()?;
						table.insert(path.as_str(), bytes.as_slice())?;
					}
					None => {
						table.remove(path.as_str())?;
					}
				}
			}
		}
		write.commit()?;
		Ok(())
	}

	async fn rollback(self: Box<Self>, reason: &str) -> DbResult<()> {
		debug!(path = %self.target_path, reason, "redb transaction rolled back");
		Ok(())
	}
}
