//! Storage backend protocol
//!
//! Backends persist `StoredRecord`s keyed by canonical path inside
//! transactions. A backend either supports atomicity natively (its
//! `commit`/`rollback` apply) or opts into engine-managed locking, in which
//! case the engine serializes writers and commit/rollback are cheap.
//!
//! Child and descendant enumeration is a streaming protocol: the backend
//! walks candidate paths in any order that covers the requested subtree,
//! asks `check` *before* loading a record, and hands loaded records to
//! `add`. `add` returning false halts the iteration. `check` is guaranteed
//! to have been called for every path passed to `add`.

use crate::error::DbResult;
use crate::storage::record::StoredRecord;
use async_trait::async_trait;

/// What a child/descendant stream should load for each accepted path
#[derive(Debug, Clone, Copy, Default)]
pub struct IncludeSpec {
	/// Load record metadata (kind, revision, timestamps)
	pub metadata: bool,
	/// Load the record payload as well
	pub value: bool,
}

impl IncludeSpec {
	pub fn all() -> Self {
		Self { metadata: true, value: true }
	}

	pub fn paths_only() -> Self {
		Self { metadata: false, value: false }
	}

	fn loads_record(self) -> bool {
		self.metadata || self.value
	}
}

/// Path filter invoked before a record is loaded
pub type CheckCallback<'a> = &'a mut (dyn FnMut(&str) -> bool + Send);

/// Receives accepted paths with their records (when requested by the
/// [`IncludeSpec`]); return false to halt the stream
pub type AddCallback<'a> = &'a mut (dyn FnMut(&str, Option<StoredRecord>) -> bool + Send);

/// A transaction against a backend store
#[async_trait]
pub trait BackendTransaction: Send {
	/// The path this transaction was opened for
	fn target_path(&self) -> &str;

	/// Whether this transaction may write
	fn is_write(&self) -> bool;

	/// Load the record at a path
	async fn get(&mut self, path: &str) -> DbResult<Option<StoredRecord>>;

	/// Store a record at a path
	async fn set(&mut self, path: &str, record: StoredRecord) -> DbResult<()>;

	/// Remove the record at a path
	async fn remove(&mut self, path: &str) -> DbResult<()>;

	/// Load several records; default implementation loops over [`Self::get`]
	async fn get_multiple(&mut self, paths: &[String]) -> DbResult<Vec<Option<StoredRecord>>> {
		let mut records = Vec::with_capacity(paths.len());
		for path in paths {
			records.push(self.get(path).await?);
		}
		Ok(records)
	}

	/// Store several records; default implementation loops over [`Self::set`]
	async fn set_multiple(&mut self, entries: Vec<(String, StoredRecord)>) -> DbResult<()> {
		for (path, record) in entries {
			self.set(&path, record).await?;
		}
		Ok(())
	}

	/// Remove several records; default implementation loops over
	/// [`Self::remove`]
	async fn remove_multiple(&mut self, paths: &[String]) -> DbResult<()> {
		for path in paths {
			self.remove(path).await?;
		}
		Ok(())
	}

	/// Stream the direct children of a path
	async fn children_of(
		&mut self,
		path: &str,
		include: IncludeSpec,
		check: CheckCallback<'_>,
		add: AddCallback<'_>,
	) -> DbResult<()>;

	/// Stream all descendants of a path
	async fn descendants_of(
		&mut self,
		path: &str,
		include: IncludeSpec,
		check: CheckCallback<'_>,
		add: AddCallback<'_>,
	) -> DbResult<()>;

	/// Re-target the transaction at the parent path, for callers narrowing
	/// their work upward. Returns the effective path. Backends with
	/// engine-managed locking can keep this a no-op.
	async fn move_to_parent_path(&mut self, target_parent: &str) -> DbResult<String> {
		Ok(target_parent.to_string())
	}

	/// Apply all staged changes
	async fn commit(self: Box<Self>) -> DbResult<()>;

	/// Discard all staged changes
	async fn rollback(self: Box<Self>, reason: &str) -> DbResult<()>;
}

/// Factory for backend transactions
#[async_trait]
pub trait StorageBackend: Send + Sync {
	/// Short backend name for logging
	fn name(&self) -> &'static str;

	/// Whether the backend provides atomic commit/rollback itself. When
	/// false, the engine's single-writer locking provides the atomicity.
	fn supports_transactions(&self) -> bool {
		false
	}

	/// Open a transaction for the given path
	async fn transaction(&self, path: &str, write: bool) -> DbResult<Box<dyn BackendTransaction>>;
}

pub(crate) use helpers::stream_staged_tree;

mod helpers {
	use super::*;
	use crate::path::{is_descendant_path, is_direct_child_path};
	use std::collections::BTreeMap;

	/// Shared enumeration logic for backends that can materialize the
	/// requested subtree as an ordered path→record map. Applies the
	/// check/add protocol over it.
	pub(crate) fn stream_staged_tree(
		tree: &BTreeMap<String, StoredRecord>,
		parent: &str,
		children_only: bool,
		include: IncludeSpec,
		check: CheckCallback<'_>,
		add: AddCallback<'_>,
	) -> DbResult<()> {
		for (path, record) in tree.range(parent.to_string()..) {
			if !path.starts_with(parent) {
				break;
			}
			let related = if children_only {
				is_direct_child_path(parent, path)
			} else {
				is_descendant_path(parent, path)
			};
			if !related {
				continue;
			}
			if !check(path) {
				continue;
			}
			let payload = include.loads_record().then(|| record.clone());
			if !add(path, payload) {
				break;
			}
		}
		Ok(())
	}
}
