//! In-memory storage backend
//!
//! Keeps all records in a single ordered map keyed by canonical path.
//! Writes are staged per transaction and applied on commit; atomicity
//! comes from the engine's single-writer locking.

use crate::error::DbResult;
use crate::storage::backend::{
	stream_staged_tree, AddCallback, BackendTransaction, CheckCallback, IncludeSpec,
	StorageBackend,
};
use crate::storage::record::StoredRecord;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

type Tree = BTreeMap<String, StoredRecord>;

/// Non-persistent backend backed by an ordered map
#[derive(Default)]
pub struct MemoryBackend {
	tree: Arc<Mutex<Tree>>,
}

impl MemoryBackend {
	pub fn new() -> Self {
		Self::default()
	}

	/// Number of stored records, for diagnostics and tests
	pub fn record_count(&self) -> usize {
		self.tree.lock().expect("memory tree poisoned").len()
	}
}

#[async_trait]
impl StorageBackend for MemoryBackend {
	fn name(&self) -> &'static str {
		"memory"
	}

	async fn transaction(&self, path: &str, write: bool) -> DbResult<Box<dyn BackendTransaction>> {
		Ok(Box::new(MemoryTransaction {
			tree: Arc::clone(&self.tree),
			target_path: path.to_string(),
			write,
			staged: BTreeMap::new(),
		}))
	}
}

struct MemoryTransaction {
	tree: Arc<Mutex<Tree>>,
	target_path: String,
	write: bool,
	/// Staged writes; None marks a removal
	staged: BTreeMap<String, Option<StoredRecord>>,
}

impl MemoryTransaction {
	/// Materialize the requested subtree with staged changes applied
	fn merged_subtree(&self, parent: &str) -> Tree {
		let tree = self.tree.lock().expect("memory tree poisoned");
		let mut merged: Tree = tree
			.range(parent.to_string()..)
			.take_while(|(path, _)| path.starts_with(parent))
			.map(|(path, record)| (path.clone(), record.clone()))
			.collect();
		drop(tree);

		for (path, staged) in &self.staged {
			if !path.starts_with(parent) {
				continue;
			}
			match staged {
				Some(record) => {
					merged.insert(path.clone(), record.clone());
				}
				None => {
					merged.remove(path);
				}
			}
		}
		merged
	}
}

#[async_trait]
impl BackendTransaction for MemoryTransaction {
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
		let tree = self.tree.lock().expect("memory tree poisoned");
		Ok(tree.get(path).cloned())
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
		let merged = self.merged_subtree(path);
		stream_staged_tree(&merged, path, true, include, check, add)
	}

	async fn descendants_of(
		&mut self,
		path: &str,
		include: IncludeSpec,
		check: CheckCallback<'_>,
		add: AddCallback<'_>,
	) -> DbResult<()> {
		let merged = self.merged_subtree(path);
		stream_staged_tree(&merged, path, false, include, check, add)
	}

	async fn commit(self: Box<Self>) -> DbResult<()> {
		let mut tree = self.tree.lock().expect("memory tree poisoned");
		for (path, staged) in self.staged {
			match staged {
				Some(record) => {
					tree.insert(path, record);
				}
				None => {
					tree.remove(&path);
				}
			}
		}
		Ok(())
	}

	async fn rollback(self: Box<Self>, reason: &str) -> DbResult<()> {
		debug!(path = %self.target_path, reason, "memory transaction rolled back");
		Ok(())
	}
}
