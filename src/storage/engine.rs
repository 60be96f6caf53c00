//! Storage engine core
//!
//! Implements path reads and writes on top of the backend protocol with
//! the inline-children optimization: a composite record carries its small
//! children inline, larger children live in dedicated records discovered
//! by path scans. The engine coordinates the value codec, the node locker,
//! the subscription registry and the index coordinator.
//!
//! Write pipeline: resolve the top event path (the shallowest ancestor
//! whose pre-image any subscriber or index needs), take a write lock
//! there, load the pre-image, apply the write recursively inside one
//! backend transaction, commit, then hand old/new images to the mutation
//! dispatcher.

use crate::config::DatabaseConfig;
use crate::error::{DbError, DbResult};
use crate::index::IndexCoordinator;
use crate::lock::{LockOptions, NodeLocker};
use crate::mutations;
use crate::path::{PathInfo, PathKey};
use crate::storage::backend::{BackendTransaction, IncludeSpec, StorageBackend};
use crate::storage::record::{new_revision, RecordValue, StoredRecord};
use crate::subscriptions::SubscriptionRegistry;
use crate::value::codec::{fits_inline, InlineValue};
use crate::value::{Value, ValueKind};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};
use uuid::Uuid;

/// Optimistic concurrency expectation for a write
#[derive(Debug, Clone, PartialEq)]
pub enum RevisionAssert {
	/// The node must not exist yet
	Absent,
	/// The node must still be at this revision
	Revision(String),
}

/// Options for a write operation
#[derive(Debug, Clone)]
pub struct WriteOptions {
	/// Reuse a revision id (shared by all nodes written together);
	/// generated when absent
	pub revision: Option<String>,
	/// Skip event dispatch for this write
	pub suppress_events: bool,
	/// Opaque context attached to all resulting events
	pub context: serde_json::Value,
	/// Fail with a revision mismatch when the node moved on
	pub assert_revision: Option<RevisionAssert>,
}

impl Default for WriteOptions {
	fn default() -> Self {
		Self {
			revision: None,
			suppress_events: false,
			context: serde_json::Value::Null,
			assert_revision: None,
		}
	}
}

/// Options for a read operation
#[derive(Debug, Clone)]
pub struct ReadOptions {
	/// Relative child paths to load; empty loads everything. `*` matches
	/// one key.
	pub include: Vec<String>,
	/// Relative child paths to prune
	pub exclude: Vec<String>,
	/// Load composite children; false prunes every nested object/array
	pub child_objects: bool,
}

impl Default for ReadOptions {
	fn default() -> Self {
		Self { include: Vec::new(), exclude: Vec::new(), child_objects: true }
	}
}

impl ReadOptions {
	pub fn including(keys: impl IntoIterator<Item = String>) -> Self {
		Self { include: keys.into_iter().collect(), ..Self::default() }
	}
}

/// A loaded node value with its record metadata
#[derive(Debug, Clone, PartialEq)]
pub struct NodeValue {
	pub value: Value,
	pub revision: String,
	pub revision_nr: u64,
	pub created: i64,
	pub modified: i64,
}

/// Where a node's data lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeAddress {
	/// Inside the parent's record
	Inline,
	/// In its own record
	Dedicated,
}

/// Reflection info about a node
#[derive(Debug, Clone)]
pub struct NodeInfo {
	pub path: String,
	pub key: Option<PathKey>,
	pub exists: bool,
	pub kind: Option<ValueKind>,
	pub address: Option<NodeAddress>,
	/// Loaded for inline children only
	pub value: Option<Value>,
	pub revision: Option<String>,
	pub revision_nr: Option<u64>,
	pub created: Option<i64>,
	pub modified: Option<i64>,
}

impl NodeInfo {
	fn missing(path: &PathInfo) -> Self {
		Self {
			path: path.path().to_string(),
			key: path.key().cloned(),
			exists: false,
			kind: None,
			address: None,
			value: None,
			revision: None,
			revision_nr: None,
			created: None,
			modified: None,
		}
	}
}

/// Operation counters
#[derive(Debug, Default)]
pub struct EngineStats {
	reads: AtomicU64,
	writes: AtomicU64,
	deletes: AtomicU64,
}

impl EngineStats {
	pub fn reads(&self) -> u64 {
		self.reads.load(Ordering::Relaxed)
	}

	pub fn writes(&self) -> u64 {
		self.writes.load(Ordering::Relaxed)
	}

	pub fn deletes(&self) -> u64 {
		self.deletes.load(Ordering::Relaxed)
	}
}

/// How a write affects the parent record's entry for the written node
enum ParentEntry {
	/// Store this inline entry at the child key
	Inline(InlineValue),
	/// The child has a dedicated record; drop any inline entry
	Dedicated,
	/// The child is gone; drop any inline entry, never create ancestors
	Removed,
}

type BoxedWrite<'a> = Pin<Box<dyn Future<Output = DbResult<()>> + Send + 'a>>;

/// The storage engine for one database
pub struct StorageEngine {
	backend: Arc<dyn StorageBackend>,
	locker: NodeLocker,
	config: DatabaseConfig,
	subscriptions: Arc<SubscriptionRegistry>,
	indexes: Arc<IndexCoordinator>,
	stats: EngineStats,
}

impl StorageEngine {
	/// Create the engine and make sure the root record exists
	pub async fn new(backend: Arc<dyn StorageBackend>, config: DatabaseConfig) -> DbResult<Self> {
		config
			.validate()
			.map_err(DbError::InvalidConfiguration)?;

		let engine = Self {
			locker: NodeLocker::new(&config),
			backend,
			config,
			subscriptions: Arc::new(SubscriptionRegistry::new()),
			indexes: Arc::new(IndexCoordinator::new()),
			stats: EngineStats::default(),
		};

		let mut txn = engine.backend.transaction("", true).await?;
		if txn.get("").await?.is_none() {
			let root = StoredRecord::new_composite(ValueKind::Object, BTreeMap::new(), new_revision());
			txn.set("", root).await?;
			txn.commit().await?;
			debug!(backend = engine.backend.name(), "root record initialized");
		} else {
			txn.rollback("root already initialized").await?;
		}

		Ok(engine)
	}

	pub fn config(&self) -> &DatabaseConfig {
		&self.config
	}

	pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
		&self.subscriptions
	}

	pub fn indexes(&self) -> &Arc<IndexCoordinator> {
		&self.indexes
	}

	pub fn stats(&self) -> &EngineStats {
		&self.stats
	}

	/// Replace the node at a path. `Null` deletes it.
	pub async fn set_node(
		&self,
		path: &str,
		value: Value,
		options: WriteOptions,
	) -> DbResult<String> {
		self.write_node(path, value, false, options).await
	}

	/// Merge properties into the node at a path; `Null` property values
	/// mark deletions
	pub async fn update_node(
		&self,
		path: &str,
		value: Value,
		options: WriteOptions,
	) -> DbResult<String> {
		// Merging a non-object degenerates to a replace
		let merge = matches!(value, Value::Object(_));
		self.write_node(path, value, merge, options).await
	}

	async fn write_node(
		&self,
		path: &str,
		value: Value,
		merge: bool,
		options: WriteOptions,
	) -> DbResult<String> {
		let path_info = PathInfo::parse(path)?;
		if path_info.contains_wildcards() {
			return Err(DbError::not_allowed(path, "cannot write to a wildcard path"));
		}
		if path_info.is_root() && !matches!(value, Value::Object(_)) {
			return Err(DbError::invalid_value(
				path,
				"the root node must be an object",
			));
		}
		let value = self.sanitize_value(&path_info, value)?;
		let deleting = value.is_null();

		let tid = Uuid::new_v4();
		let revision = options.revision.clone().unwrap_or_else(new_revision);

		// Who needs the pre-image, and how shallow must it be
		let value_subs = self.subscriptions.value_subscribers_for_path(&path_info);
		let straddling = self.indexes.straddling(&path_info);
		let top = self.resolve_top_event_path(&path_info, &value_subs, &straddling);
		let needs_pre_image = !value_subs.is_empty() || !straddling.is_empty();
		let keys_filter =
			self.resolve_keys_filter(&path_info, &top, &value, merge, &value_subs, &straddling);

		trace!(
			path,
			top = top.path(),
			pre_image = needs_pre_image,
			merge,
			"write planned"
		);

		let lock = self
			.locker
			.lock(top.path(), tid, true, "write_node", LockOptions::default())
			.await?;
		let mut txn = self.backend.transaction(path, true).await?;

		let staged = self
			.write_in_transaction(
				&mut *txn,
				&path_info,
				&top,
				&value,
				merge,
				&revision,
				&options,
				needs_pre_image,
				keys_filter,
			)
			.await;

		match staged {
			Ok((old_top, new_top, existed_before)) => {
				// A forcibly expired lock means another writer may have been
				// admitted; this write may no longer be applied
				if let Err(e) = lock.check() {
					txn.rollback("lock expired").await?;
					return Err(e);
				}
				txn.commit().await?;
				lock.release();

				if deleting {
					self.stats.deletes.fetch_add(1, Ordering::Relaxed);
				} else {
					self.stats.writes.fetch_add(1, Ordering::Relaxed);
				}

				mutations::process_mutation(
					&self.subscriptions,
					&self.indexes,
					&top,
					old_top.as_ref(),
					new_top.as_ref(),
					&path_info,
					mutations::WriteEventInfo {
						existed_before,
						removed: deleting,
						images_loaded: needs_pre_image,
					},
					&options.context,
					self.config.wait_for_index_updates,
					options.suppress_events,
				)
				.await;

				Ok(revision)
			}
			Err(e) => {
				txn.rollback(&e.to_string()).await?;
				lock.release();
				Err(e)
			}
		}
	}

	/// The shallowest path whose previous value any interested subscriber
	/// or straddling index needs
	fn resolve_top_event_path(
		&self,
		write_path: &PathInfo,
		value_subs: &[crate::subscriptions::SubscriberMatch],
		straddling: &[Arc<dyn crate::index::QueryIndex>],
	) -> PathInfo {
		let mut top = write_path.clone();
		for sub in value_subs {
			if sub.data_path.depth() < top.depth() {
				top = sub.data_path.clone();
			}
		}
		for index in straddling {
			let filled = index.record_pattern().fill_overlapping(write_path);
			let concrete_len = filled
				.keys()
				.iter()
				.position(|k| k.is_wildcard())
				.unwrap_or(filled.depth());
			if concrete_len < top.depth() {
				top = PathInfo::from_keys(filled.keys()[..concrete_len].to_vec());
			}
		}
		top
	}

	/// Restrict the pre-image read to the keys being updated plus the keys
	/// straddling indexes need, when no subscriber wants the whole node
	fn resolve_keys_filter(
		&self,
		write_path: &PathInfo,
		top: &PathInfo,
		value: &Value,
		merge: bool,
		value_subs: &[crate::subscriptions::SubscriberMatch],
		straddling: &[Arc<dyn crate::index::QueryIndex>],
	) -> Option<Vec<String>> {
		if !merge || !top.equals(write_path) {
			return None;
		}
		let Value::Object(update) = value else {
			return None;
		};
		let whole_node_needed = value_subs.iter().any(|sub| {
			!sub.event.is_child_event() && sub.data_path.depth() <= write_path.depth()
		});
		if whole_node_needed {
			return None;
		}

		let mut keys: BTreeSet<String> = update.keys().cloned().collect();
		for index in straddling {
			keys.insert(index.spec().key.clone());
			keys.extend(index.spec().include.iter().cloned());
		}
		Some(keys.into_iter().collect())
	}

	/// Everything that happens inside the backend transaction: revision
	/// assertion, pre-image read, recursive write, post-image computation
	#[allow(clippy::too_many_arguments)]
	async fn write_in_transaction(
		&self,
		txn: &mut dyn BackendTransaction,
		path: &PathInfo,
		top: &PathInfo,
		value: &Value,
		merge: bool,
		revision: &str,
		options: &WriteOptions,
		needs_pre_image: bool,
		keys_filter: Option<Vec<String>>,
	) -> DbResult<(Option<Value>, Option<Value>, bool)> {
		let current = self.current_revision(txn, path).await?;
		let existed_before = current.is_some();
		if let Some(assert) = &options.assert_revision {
			match (assert, current) {
				(RevisionAssert::Absent, None) => {}
				(RevisionAssert::Absent, Some(found)) => {
					return Err(DbError::RevisionMismatch {
						path: path.path().to_string(),
						expected: "<absent>".to_string(),
						found,
					});
				}
				(RevisionAssert::Revision(expected), Some(found)) if *expected == found => {}
				(RevisionAssert::Revision(expected), found) => {
					return Err(DbError::RevisionMismatch {
						path: path.path().to_string(),
						expected: expected.clone(),
						found: found.unwrap_or_else(|| "<absent>".to_string()),
					});
				}
			}
		}

		let pre_image = if needs_pre_image {
			let read_options = match &keys_filter {
				Some(keys) => ReadOptions::including(keys.iter().cloned()),
				None => ReadOptions::default(),
			};
			self.read_tree(txn, top, &read_options)
				.await?
				.map(|nv| nv.value)
		} else {
			None
		};

		self.apply_write(txn, path.clone(), value.clone(), merge, revision, true)
			.await?;

		let new_top = if needs_pre_image {
			apply_patch(
				pre_image.clone(),
				&path.keys()[top.depth()..],
				value,
				merge,
			)
		} else {
			None
		};

		Ok((pre_image, new_top, existed_before))
	}

	/// Recursive write step. `link_parent` is true only for the node the
	/// write was issued on; nested dedicated children are linked by their
	/// parent's own record write.
	fn apply_write<'a>(
		&'a self,
		txn: &'a mut dyn BackendTransaction,
		path: PathInfo,
		value: Value,
		merge: bool,
		revision: &'a str,
		link_parent: bool,
	) -> BoxedWrite<'a> {
		Box::pin(async move {
			match value {
				Value::Null => self.delete_node(txn, &path, revision).await,
				value if fits_inline(&value, self.config.max_inline_value_size)
					&& !path.is_root() =>
				{
					// The node becomes an inline child of its parent
					self.delete_dedicated(txn, &path).await?;
					let entry = InlineValue::encode(&value).ok_or_else(|| {
						DbError::invalid_value(path.path(), "value cannot be stored")
					})?;
					self.set_parent_entry(txn, &path, ParentEntry::Inline(entry), revision)
						.await
				}
				value if !value.is_composite() => {
					// Dedicated scalar record
					let scalar = InlineValue::encode(&value).ok_or_else(|| {
						DbError::invalid_value(path.path(), "value cannot be stored")
					})?;
					let current = txn.get(path.path()).await?;
					if current.as_ref().map(|c| c.is_composite()).unwrap_or(false) {
						self.delete_descendants(txn, &path).await?;
					}
					let record = match &current {
						Some(current) => {
							current.updated(scalar.kind(), RecordValue::Scalar(scalar), revision)
						}
						None => StoredRecord::new_scalar(scalar, revision),
					};
					txn.set(path.path(), record).await?;
					if link_parent && !path.is_root() {
						self.set_parent_entry(txn, &path, ParentEntry::Dedicated, revision)
							.await?;
					}
					Ok(())
				}
				value => {
					self.write_composite(txn, &path, &value, merge, revision, link_parent)
						.await
				}
			}
		})
	}

	/// Write a non-empty composite node: partition children into inline
	/// entries and dedicated records, validate array denseness, cascade
	/// removed children
	async fn write_composite(
		&self,
		txn: &mut dyn BackendTransaction,
		path: &PathInfo,
		value: &Value,
		merge: bool,
		revision: &str,
		link_parent: bool,
	) -> DbResult<()> {
		let current = txn.get(path.path()).await?;
		let current_kind = current.as_ref().map(|c| c.kind);

		let new_children: Vec<(String, &Value)> = match value {
			Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v)).collect(),
			Value::Array(items) => items
				.iter()
				.enumerate()
				.map(|(i, v)| (i.to_string(), v))
				.collect(),
			_ => unreachable!("write_composite is only called for composites"),
		};

		let kind = match value {
			Value::Array(_) => ValueKind::Array,
			Value::Object(_)
				if merge
					&& current_kind == Some(ValueKind::Array)
					&& new_children.iter().all(|(k, _)| k.parse::<usize>().is_ok()) =>
			{
				ValueKind::Array
			}
			_ => ValueKind::Object,
		};

		let keep_current = merge && current_kind == Some(kind);
		let mut inline_map: BTreeMap<String, InlineValue> = if keep_current {
			current
				.as_ref()
				.and_then(|c| c.value.as_map().cloned())
				.unwrap_or_default()
		} else {
			BTreeMap::new()
		};

		// Current dedicated children, discovered by path scan
		let mut dedicated: BTreeSet<String> = BTreeSet::new();
		if current.is_some() {
			let parent_depth = path.depth();
			let mut collect = |child_path: &str, _: Option<StoredRecord>| {
				if let Ok(info) = PathInfo::parse(child_path) {
					if let Some(key) = info.keys().get(parent_depth) {
						dedicated.insert(record_key(key));
					}
				}
				true
			};
			txn.children_of(path.path(), IncludeSpec::paths_only(), &mut |_| true, &mut collect)
				.await?;
		}

		// Children disappearing in a full replace (or kind change)
		if !keep_current {
			let new_keys: BTreeSet<&String> = new_children.iter().map(|(k, _)| k).collect();
			let removed: Vec<String> = dedicated
				.iter()
				.filter(|k| !new_keys.contains(*k))
				.cloned()
				.collect();
			for key in removed {
				let child_path = path.child(child_key(&key, kind));
				self.delete_dedicated(txn, &child_path).await?;
				dedicated.remove(&key);
			}
		}

		for (key, child) in &new_children {
			let child_path = path.child(child_key(key, kind));
			match child {
				Value::Null => {
					inline_map.remove(key);
					if dedicated.remove(key) {
						self.delete_dedicated(txn, &child_path).await?;
					}
				}
				child if fits_inline(child, self.config.max_inline_value_size) => {
					if dedicated.remove(key) {
						self.delete_dedicated(txn, &child_path).await?;
					}
					let entry = InlineValue::encode(child).ok_or_else(|| {
						DbError::invalid_value(child_path.path(), "value cannot be stored")
					})?;
					inline_map.insert(key.clone(), entry);
				}
				child => {
					inline_map.remove(key);
					self.apply_write(
						txn,
						child_path,
						(*child).clone(),
						false,
						revision,
						false,
					)
					.await?;
					dedicated.insert(key.clone());
				}
			}
		}

		if kind == ValueKind::Array {
			let keys: BTreeSet<&String> = inline_map.keys().chain(dedicated.iter()).collect();
			validate_array_keys(path, keys.into_iter())?;
		}

		let record = match &current {
			Some(current) => current.updated(kind, RecordValue::Map(inline_map), revision),
			None => StoredRecord::new_composite(kind, inline_map, revision),
		};
		txn.set(path.path(), record).await?;

		if link_parent && !path.is_root() {
			self.set_parent_entry(txn, path, ParentEntry::Dedicated, revision)
				.await?;
		}
		Ok(())
	}

	/// Remove the node: dedicated record, its descendants, and its inline
	/// entry in the parent
	async fn delete_node(
		&self,
		txn: &mut dyn BackendTransaction,
		path: &PathInfo,
		revision: &str,
	) -> DbResult<()> {
		if path.is_root() {
			return Err(DbError::not_allowed(path.path(), "cannot delete the root node"));
		}
		self.delete_dedicated(txn, path).await?;
		self.set_parent_entry(txn, path, ParentEntry::Removed, revision)
			.await
	}

	/// Remove the dedicated record at a path (if any) and cascade over its
	/// descendants
	async fn delete_dedicated(
		&self,
		txn: &mut dyn BackendTransaction,
		path: &PathInfo,
	) -> DbResult<()> {
		let Some(record) = txn.get(path.path()).await? else {
			return Ok(());
		};
		if record.is_composite() {
			self.delete_descendants(txn, path).await?;
		}
		txn.remove(path.path()).await
	}

	async fn delete_descendants(
		&self,
		txn: &mut dyn BackendTransaction,
		path: &PathInfo,
	) -> DbResult<()> {
		let mut doomed: Vec<String> = Vec::new();
		txn.descendants_of(
			path.path(),
			IncludeSpec::paths_only(),
			&mut |_| true,
			&mut |descendant, _| {
				doomed.push(descendant.to_string());
				true
			},
		)
		.await?;
		if !doomed.is_empty() {
			trace!(path = path.path(), count = doomed.len(), "cascading delete");
			txn.remove_multiple(&doomed).await?;
		}
		Ok(())
	}

	/// Update the parent record's entry for a written/removed child,
	/// creating missing ancestor records on the way up
	fn set_parent_entry<'a>(
		&'a self,
		txn: &'a mut dyn BackendTransaction,
		path: &'a PathInfo,
		entry: ParentEntry,
		revision: &'a str,
	) -> BoxedWrite<'a> {
		Box::pin(async move {
			let parent = path
				.parent()
				.ok_or_else(|| DbError::not_allowed("", "the root node has no parent"))?;
			let key = path.key().expect("non-root path has a key");
			let key_str = record_key(key);

			let current = txn.get(parent.path()).await?;
			match current {
				Some(record) => {
					// A scalar parent becomes a composite when a child is
					// written beneath it
					let kind = if record.is_composite() {
						record.kind
					} else {
						container_kind(key)
					};
					let mut map = record.value.as_map().cloned().unwrap_or_default();
					let mut changed = !record.is_composite();
					match &entry {
						ParentEntry::Inline(inline) => {
							let replaced = map.insert(key_str.clone(), inline.clone());
							changed = changed || replaced.as_ref() != Some(inline);
						}
						ParentEntry::Dedicated | ParentEntry::Removed => {
							changed = map.remove(&key_str).is_some() || changed;
						}
					}

					if kind == ValueKind::Array {
						let mut keys: BTreeSet<String> = map.keys().cloned().collect();
						self.collect_dedicated_keys(txn, &parent, &mut keys).await?;
						match &entry {
							ParentEntry::Dedicated => {
								keys.insert(key_str.clone());
							}
							ParentEntry::Removed => {
								keys.remove(&key_str);
							}
							ParentEntry::Inline(_) => {}
						}
						validate_array_keys(&parent, keys.iter())?;
					}

					let write_needed = changed || matches!(entry, ParentEntry::Dedicated);
					if write_needed {
						let updated = record.updated(kind, RecordValue::Map(map), revision);
						txn.set(parent.path(), updated).await?;
					}
					Ok(())
				}
				None => {
					if matches!(entry, ParentEntry::Removed) {
						// Deleting under a parent that never existed must not
						// conjure the ancestor chain
						return Ok(());
					}
					let mut map = BTreeMap::new();
					let mut keys: BTreeSet<String> = BTreeSet::new();
					keys.insert(key_str.clone());
					if let ParentEntry::Inline(inline) = &entry {
						map.insert(key_str, inline.clone());
					}
					let kind = container_kind(key);
					if kind == ValueKind::Array {
						validate_array_keys(&parent, keys.iter())?;
					}
					let record = StoredRecord::new_composite(kind, map, revision);
					txn.set(parent.path(), record).await?;
					self.set_parent_entry(txn, &parent, ParentEntry::Dedicated, revision)
						.await
				}
			}
		})
	}

	async fn collect_dedicated_keys(
		&self,
		txn: &mut dyn BackendTransaction,
		parent: &PathInfo,
		keys: &mut BTreeSet<String>,
	) -> DbResult<()> {
		let parent_depth = parent.depth();
		txn.children_of(
			parent.path(),
			IncludeSpec::paths_only(),
			&mut |_| true,
			&mut |child_path, _| {
				if let Ok(info) = PathInfo::parse(child_path) {
					if let Some(key) = info.keys().get(parent_depth) {
						keys.insert(record_key(key));
					}
				}
				true
			},
		)
		.await
	}

	/// Revision of the node at a path: its own record's, or the containing
	/// parent record's for inline children
	async fn current_revision(
		&self,
		txn: &mut dyn BackendTransaction,
		path: &PathInfo,
	) -> DbResult<Option<String>> {
		if let Some(record) = txn.get(path.path()).await? {
			return Ok(Some(record.revision));
		}
		let Some(parent) = path.parent() else {
			return Ok(None);
		};
		let Some(record) = txn.get(parent.path()).await? else {
			return Ok(None);
		};
		let key = record_key(path.key().expect("non-root path has a key"));
		Ok(record
			.value
			.as_map()
			.and_then(|map| map.get(&key))
			.map(|_| record.revision))
	}

	/// Assemble the value tree at a path: the record's inline children plus
	/// all dedicated descendants, pruned by the read options
	async fn read_tree(
		&self,
		txn: &mut dyn BackendTransaction,
		path: &PathInfo,
		options: &ReadOptions,
	) -> DbResult<Option<NodeValue>> {
		let Some(record) = txn.get(path.path()).await? else {
			// The node may live inline in its parent's record
			let Some(parent) = path.parent() else {
				return Ok(None);
			};
			let Some(parent_record) = txn.get(parent.path()).await? else {
				return Ok(None);
			};
			let key = record_key(path.key().expect("non-root path has a key"));
			return Ok(parent_record.value.as_map().and_then(|map| map.get(&key)).map(
				|entry| NodeValue {
					value: entry.decode(),
					revision: parent_record.revision.clone(),
					revision_nr: parent_record.revision_nr,
					created: parent_record.created,
					modified: parent_record.modified,
				},
			));
		};

		let meta = |value: Value| NodeValue {
			value,
			revision: record.revision.clone(),
			revision_nr: record.revision_nr,
			created: record.created,
			modified: record.modified,
		};

		let map = match &record.value {
			RecordValue::Scalar(scalar) => return Ok(Some(meta(scalar.decode()))),
			RecordValue::Map(map) => map,
		};

		let filter = ReadFilter::new(options)?;
		let mut assembled = empty_container(record.kind);

		for (key, entry) in map {
			let rel = PathInfo::from_keys(vec![child_key(key, record.kind)]);
			if !filter.allows(&rel) {
				continue;
			}
			if !options.child_objects && entry.kind().is_composite() {
				continue;
			}
			place_value(&mut assembled, rel.keys(), entry.decode());
		}

		// Dedicated descendants, parents before children so containers
		// exist when their children arrive
		let base_depth = path.depth();
		let mut collected: Vec<(PathInfo, StoredRecord)> = Vec::new();
		{
			let filter = &filter;
			let child_objects = options.child_objects;
			let mut check = |descendant: &str| match PathInfo::parse(descendant) {
				Ok(info) => {
					let rel = PathInfo::from_keys(info.keys()[base_depth..].to_vec());
					if !child_objects && rel.depth() > 1 {
						return false;
					}
					filter.allows(&rel)
				}
				Err(_) => false,
			};
			let mut add = |descendant: &str, record: Option<StoredRecord>| {
				if let (Ok(info), Some(record)) = (PathInfo::parse(descendant), record) {
					let rel = PathInfo::from_keys(info.keys()[base_depth..].to_vec());
					collected.push((rel, record));
				}
				true
			};
			txn.descendants_of(path.path(), IncludeSpec::all(), &mut check, &mut add)
				.await?;
		}
		collected.sort_by_key(|(rel, _)| rel.depth());

		for (rel, descendant) in collected {
			let node = match &descendant.value {
				RecordValue::Scalar(scalar) => scalar.decode(),
				RecordValue::Map(map) => {
					let mut container = empty_container(descendant.kind);
					for (key, entry) in map {
						let child_rel = rel.child(child_key(key, descendant.kind));
						if !filter.allows(&child_rel) {
							continue;
						}
						if !options.child_objects && entry.kind().is_composite() {
							continue;
						}
						place_value(
							&mut container,
							&child_rel.keys()[rel.depth()..],
							entry.decode(),
						);
					}
					container
				}
			};
			if !options.child_objects && node.is_composite() && rel.depth() == 1 {
				continue;
			}
			place_value(&mut assembled, rel.keys(), node);
		}

		Ok(Some(meta(assembled)))
	}

	/// Load the node at a path with its record metadata
	pub async fn get_node(&self, path: &str, options: ReadOptions) -> DbResult<Option<NodeValue>> {
		let path_info = PathInfo::parse(path)?;
		if path_info.contains_wildcards() {
			return Err(DbError::invalid_argument(format!(
				"cannot read wildcard path \"{}\"",
				path
			)));
		}

		let tid = Uuid::new_v4();
		let lock = self
			.locker
			.lock(path, tid, false, "get_node", LockOptions::default())
			.await?;
		let mut txn = self.backend.transaction(path, false).await?;
		let result = self.read_tree(&mut *txn, &path_info, &options).await;
		txn.rollback("read complete").await?;
		lock.release();

		self.stats.reads.fetch_add(1, Ordering::Relaxed);
		result
	}

	/// Load just the value at a path
	pub async fn get_node_value(&self, path: &str) -> DbResult<Option<Value>> {
		Ok(self.get_node(path, ReadOptions::default()).await?.map(|nv| nv.value))
	}

	/// Reflection info about the node at a path
	pub async fn get_node_info(&self, path: &str) -> DbResult<NodeInfo> {
		let path_info = PathInfo::parse(path)?;
		let tid = Uuid::new_v4();
		let lock = self
			.locker
			.lock(path, tid, false, "get_node_info", LockOptions::default())
			.await?;
		let mut txn = self.backend.transaction(path, false).await?;
		let result = self.node_info_in_transaction(&mut *txn, &path_info).await;
		txn.rollback("read complete").await?;
		lock.release();
		result
	}

	async fn node_info_in_transaction(
		&self,
		txn: &mut dyn BackendTransaction,
		path: &PathInfo,
	) -> DbResult<NodeInfo> {
		if let Some(record) = txn.get(path.path()).await? {
			return Ok(NodeInfo {
				path: path.path().to_string(),
				key: path.key().cloned(),
				exists: true,
				kind: Some(record.kind),
				address: Some(NodeAddress::Dedicated),
				value: None,
				revision: Some(record.revision),
				revision_nr: Some(record.revision_nr),
				created: Some(record.created),
				modified: Some(record.modified),
			});
		}
		let Some(parent) = path.parent() else {
			return Ok(NodeInfo::missing(path));
		};
		let Some(parent_record) = txn.get(parent.path()).await? else {
			return Ok(NodeInfo::missing(path));
		};
		let key = record_key(path.key().expect("non-root path has a key"));
		match parent_record.value.as_map().and_then(|map| map.get(&key)) {
			Some(entry) => Ok(NodeInfo {
				path: path.path().to_string(),
				key: path.key().cloned(),
				exists: true,
				kind: Some(entry.kind()),
				address: Some(NodeAddress::Inline),
				value: Some(entry.decode()),
				revision: Some(parent_record.revision),
				revision_nr: Some(parent_record.revision_nr),
				created: Some(parent_record.created),
				modified: Some(parent_record.modified),
			}),
			None => Ok(NodeInfo::missing(path)),
		}
	}

	/// Stream the direct children of a node: inline entries first, then
	/// dedicated records. The callback returns false to stop; no further
	/// reads happen after that.
	pub async fn get_children(
		&self,
		path: &str,
		key_filter: Option<&[String]>,
		mut each: impl FnMut(NodeInfo) -> bool + Send,
	) -> DbResult<usize> {
		let path_info = PathInfo::parse(path)?;
		let tid = Uuid::new_v4();
		let lock = self
			.locker
			.lock(path, tid, false, "get_children", LockOptions::default())
			.await?;
		let mut txn = self.backend.transaction(path, false).await?;

		let result: DbResult<usize> = async {
			let Some(record) = txn.get(path_info.path()).await? else {
				return Ok(0);
			};
			let Some(map) = record.value.as_map() else {
				return Ok(0);
			};

			let wanted = |key: &str| {
				key_filter
					.map(|keys| keys.iter().any(|k| k == key))
					.unwrap_or(true)
			};

			let mut count = 0usize;
			let mut stopped = false;
			for (key, entry) in map {
				if !wanted(key) {
					continue;
				}
				let child = path_info.child(child_key(key, record.kind));
				count += 1;
				let info = NodeInfo {
					path: child.path().to_string(),
					key: child.key().cloned(),
					exists: true,
					kind: Some(entry.kind()),
					address: Some(NodeAddress::Inline),
					value: Some(entry.decode()),
					revision: Some(record.revision.clone()),
					revision_nr: Some(record.revision_nr),
					created: Some(record.created),
					modified: Some(record.modified),
				};
				if !each(info) {
					stopped = true;
					break;
				}
			}

			if !stopped {
				let parent_depth = path_info.depth();
				let mut check = |child_path: &str| match PathInfo::parse(child_path) {
					Ok(info) => info
						.keys()
						.get(parent_depth)
						.map(|k| wanted(&record_key(k)))
						.unwrap_or(false),
					Err(_) => false,
				};
				let mut add = |child_path: &str, child: Option<StoredRecord>| {
					let (Ok(info), Some(child)) = (PathInfo::parse(child_path), child) else {
						return true;
					};
					count += 1;
					each(NodeInfo {
						path: info.path().to_string(),
						key: info.key().cloned(),
						exists: true,
						kind: Some(child.kind),
						address: Some(NodeAddress::Dedicated),
						value: None,
						revision: Some(child.revision),
						revision_nr: Some(child.revision_nr),
						created: Some(child.created),
						modified: Some(child.modified),
					})
				};
				txn.children_of(path_info.path(), IncludeSpec::all(), &mut check, &mut add)
					.await?;
			}
			Ok(count)
		}
		.await;

		txn.rollback("read complete").await?;
		lock.release();
		self.stats.reads.fetch_add(1, Ordering::Relaxed);
		result
	}

	/// All concrete record paths matching a pattern, resolved level by
	/// level through child listings
	pub async fn collect_pattern_paths(&self, pattern: &PathInfo) -> DbResult<Vec<String>> {
		let mut current: Vec<PathInfo> = vec![PathInfo::root()];
		for key in pattern.keys() {
			let mut next = Vec::new();
			for base in &current {
				if key.is_wildcard() {
					let mut children = Vec::new();
					self.get_children(base.path(), None, |info| {
						children.push(info.path);
						true
					})
					.await?;
					for child in children {
						next.push(PathInfo::parse(&child)?);
					}
				} else {
					next.push(base.child(key.clone()));
				}
			}
			current = next;
		}
		Ok(current.into_iter().map(|p| p.path().to_string()).collect())
	}

	/// Read-modify-write with optimistic concurrency. The callback receives
	/// the current value; returning None cancels, `Value::Null` deletes.
	/// One retry on a revision mismatch.
	pub async fn transact_node<F>(&self, path: &str, callback: F) -> DbResult<Option<String>>
	where
		F: Fn(Option<Value>) -> Option<Value> + Send + Sync,
	{
		let mut attempt = 0;
		loop {
			let current = self.get_node(path, ReadOptions::default()).await?;
			let (current_value, assert) = match &current {
				Some(nv) => (
					Some(nv.value.clone()),
					RevisionAssert::Revision(nv.revision.clone()),
				),
				None => (None, RevisionAssert::Absent),
			};

			let Some(new_value) = callback(current_value) else {
				trace!(path, "transaction canceled by callback");
				return Ok(None);
			};

			let options = WriteOptions {
				assert_revision: Some(assert),
				..WriteOptions::default()
			};
			match self.set_node(path, new_value, options).await {
				Ok(revision) => return Ok(Some(revision)),
				Err(e @ DbError::RevisionMismatch { .. }) if attempt == 0 => {
					debug!(path, "transaction raced a concurrent write, retrying: {}", e);
					attempt += 1;
				}
				Err(e) => return Err(e),
			}
		}
	}

	fn sanitize_value(&self, path: &PathInfo, value: Value) -> DbResult<Value> {
		fn walk(value: Value, path: &PathInfo, remove_void: bool) -> DbResult<Value> {
			match value {
				Value::Array(items) => {
					let mut sanitized = Vec::with_capacity(items.len());
					for (i, item) in items.into_iter().enumerate() {
						if item.is_null() {
							if remove_void {
								continue;
							}
							return Err(DbError::invalid_value(
								path.child(PathKey::Index(i)).path(),
								"null is not allowed inside arrays",
							));
						}
						sanitized.push(walk(item, &path.child(PathKey::Index(i)), remove_void)?);
					}
					Ok(Value::Array(sanitized))
				}
				Value::Object(map) => {
					let mut sanitized = BTreeMap::new();
					for (key, child) in map {
						let child_path = path.child(key.as_str());
						sanitized.insert(key, walk(child, &child_path, remove_void)?);
					}
					Ok(Value::Object(sanitized))
				}
				scalar => Ok(scalar),
			}
		}
		walk(value, path, self.config.remove_void_properties)
	}
}

/// Record-map key for a path key: array indices stringify
fn record_key(key: &PathKey) -> String {
	match key {
		PathKey::Key(k) => k.clone(),
		PathKey::Index(i) => i.to_string(),
	}
}

/// Path key for a record-map key, honoring the container kind
fn child_key(key: &str, kind: ValueKind) -> PathKey {
	if kind == ValueKind::Array {
		if let Ok(index) = key.parse::<usize>() {
			return PathKey::Index(index);
		}
	}
	PathKey::Key(key.to_string())
}

fn container_kind(key: &PathKey) -> ValueKind {
	match key {
		PathKey::Index(_) => ValueKind::Array,
		PathKey::Key(_) => ValueKind::Object,
	}
}

fn empty_container(kind: ValueKind) -> Value {
	match kind {
		ValueKind::Array => Value::Array(Vec::new()),
		_ => Value::object(),
	}
}

/// Arrays store an exhaustive 0..n-1 key set; anything else (gaps,
/// non-trailing removals, out-of-range insertions) violates the contract
fn validate_array_keys<'k>(
	path: &PathInfo,
	keys: impl Iterator<Item = &'k String>,
) -> DbResult<()> {
	let mut indices = BTreeSet::new();
	for key in keys {
		let index: usize = key.parse().map_err(|_| {
			DbError::array_constraint(path.path(), format!("non-numeric array key \"{}\"", key))
		})?;
		indices.insert(index);
	}
	for (expected, actual) in indices.iter().enumerate() {
		if *actual != expected {
			return Err(DbError::array_constraint(
				path.path(),
				"arrays must keep an exhaustive 0..n-1 index set; only trailing entries can be inserted or removed",
			));
		}
	}
	Ok(())
}

/// Insert a node into a value tree at a relative key path, growing arrays
/// as needed
fn place_value(root: &mut Value, keys: &[PathKey], node: Value) {
	let Some((first, rest)) = keys.split_first() else {
		*root = node;
		return;
	};
	match (root, first) {
		(Value::Object(map), key) => {
			let key = record_key(key);
			let slot = map.entry(key).or_insert(Value::Null);
			place_value(slot, rest, node);
		}
		(Value::Array(items), PathKey::Index(i)) => {
			if items.len() <= *i {
				items.resize(*i + 1, Value::Null);
			}
			place_value(&mut items[*i], rest, node);
		}
		(Value::Array(items), PathKey::Key(k)) => {
			if let Ok(i) = k.parse::<usize>() {
				if items.len() <= i {
					items.resize(i + 1, Value::Null);
				}
				place_value(&mut items[i], rest, node);
			}
		}
		_ => {}
	}
}

/// Apply the write to a clone of the pre-image, producing the post-image
/// at the top event path
fn apply_patch(
	base: Option<Value>,
	rel: &[PathKey],
	value: &Value,
	merge: bool,
) -> Option<Value> {
	let Some((first, rest)) = rel.split_first() else {
		return match (base, value) {
			(_, Value::Null) => None,
			(Some(mut base), Value::Object(update)) if merge && base.is_composite() => {
				for (key, child) in update {
					match &mut base {
						Value::Object(map) => {
							if child.is_null() {
								map.remove(key);
							} else {
								map.insert(key.clone(), child.clone());
							}
						}
						Value::Array(items) => {
							let Ok(index) = key.parse::<usize>() else {
								continue;
							};
							if child.is_null() {
								if index < items.len() {
									items.remove(index);
								}
							} else if index < items.len() {
								items[index] = child.clone();
							} else {
								items.resize(index, Value::Null);
								items.push(child.clone());
							}
						}
						_ => {}
					}
				}
				Some(base)
			}
			(_, value) => Some(value.clone()),
		};
	};

	let mut container = match base {
		Some(v) if v.is_composite() => v,
		_ => match first {
			PathKey::Index(_) => Value::Array(Vec::new()),
			PathKey::Key(_) => Value::object(),
		},
	};

	let child_current = match (&container, first) {
		(Value::Object(map), key) => map.get(&record_key(key)).cloned(),
		(Value::Array(items), PathKey::Index(i)) => items.get(*i).cloned(),
		_ => None,
	};
	let patched = apply_patch(child_current, rest, value, merge);

	match (&mut container, first) {
		(Value::Object(map), key) => {
			let key = record_key(key);
			match patched {
				Some(v) => {
					map.insert(key, v);
				}
				None => {
					map.remove(&key);
				}
			}
		}
		(Value::Array(items), PathKey::Index(i)) => match patched {
			Some(v) => {
				if items.len() <= *i {
					items.resize(*i + 1, Value::Null);
				}
				items[*i] = v;
			}
			None => {
				if *i < items.len() {
					items.remove(*i);
				}
			}
		},
		_ => {}
	}
	Some(container)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::object;
	use crate::storage::memory::MemoryBackend;

	async fn engine() -> StorageEngine {
		StorageEngine::new(Arc::new(MemoryBackend::new()), DatabaseConfig::default())
			.await
			.unwrap()
	}

	#[tokio::test]
	async fn test_set_and_get_inline() {
		let engine = engine().await;
		engine
			.set_node("a/b", Value::from("short"), WriteOptions::default())
			.await
			.unwrap();

		let loaded = engine.get_node_value("a").await.unwrap().unwrap();
		assert_eq!(loaded, object! { "b" => "short" });

		// Small scalars live inline, not in their own record
		let info = engine.get_node_info("a/b").await.unwrap();
		assert!(info.exists);
		assert_eq!(info.address, Some(NodeAddress::Inline));
		assert_eq!(info.value, Some(Value::from("short")));
	}

	#[tokio::test]
	async fn test_inline_promotion_to_dedicated() {
		let engine = engine().await;
		engine
			.set_node("a/b", Value::from("short"), WriteOptions::default())
			.await
			.unwrap();

		let long = "x".repeat(200);
		engine
			.set_node("a/b", Value::from(long.as_str()), WriteOptions::default())
			.await
			.unwrap();

		let info = engine.get_node_info("a/b").await.unwrap();
		assert_eq!(info.address, Some(NodeAddress::Dedicated));

		let loaded = engine.get_node_value("a").await.unwrap().unwrap();
		assert_eq!(loaded, object! { "b" => long.as_str() });

		// And back again: a small write demotes the dedicated record
		engine
			.set_node("a/b", Value::from("tiny"), WriteOptions::default())
			.await
			.unwrap();
		let info = engine.get_node_info("a/b").await.unwrap();
		assert_eq!(info.address, Some(NodeAddress::Inline));
	}

	#[tokio::test]
	async fn test_nested_object_write() {
		let engine = engine().await;
		engine
			.set_node(
				"users/alice",
				object! {
					"name" => "alice",
					"address" => object! { "city" => "Amsterdam", "zip" => "1234" },
				},
				WriteOptions::default(),
			)
			.await
			.unwrap();

		let loaded = engine.get_node_value("users/alice").await.unwrap().unwrap();
		assert_eq!(
			loaded,
			object! {
				"name" => "alice",
				"address" => object! { "city" => "Amsterdam", "zip" => "1234" },
			}
		);

		let city = engine
			.get_node_value("users/alice/address/city")
			.await
			.unwrap()
			.unwrap();
		assert_eq!(city, Value::from("Amsterdam"));
	}

	#[tokio::test]
	async fn test_update_merges_and_set_replaces() {
		let engine = engine().await;
		engine
			.set_node(
				"users/alice",
				object! { "name" => "alice", "age" => 30 },
				WriteOptions::default(),
			)
			.await
			.unwrap();

		engine
			.update_node("users/alice", object! { "age" => 31 }, WriteOptions::default())
			.await
			.unwrap();
		let loaded = engine.get_node_value("users/alice").await.unwrap().unwrap();
		assert_eq!(loaded, object! { "name" => "alice", "age" => 31 });

		engine
			.set_node("users/alice", object! { "age" => 32 }, WriteOptions::default())
			.await
			.unwrap();
		let loaded = engine.get_node_value("users/alice").await.unwrap().unwrap();
		assert_eq!(loaded, object! { "age" => 32 });
	}

	#[tokio::test]
	async fn test_null_deletes() {
		let engine = engine().await;
		engine
			.set_node(
				"users/alice",
				object! { "name" => "alice", "age" => 30 },
				WriteOptions::default(),
			)
			.await
			.unwrap();

		engine
			.update_node("users/alice", object! { "age" => Value::Null }, WriteOptions::default())
			.await
			.unwrap();
		let loaded = engine.get_node_value("users/alice").await.unwrap().unwrap();
		assert_eq!(loaded, object! { "name" => "alice" });

		engine
			.set_node("users/alice", Value::Null, WriteOptions::default())
			.await
			.unwrap();
		assert!(engine.get_node_value("users/alice").await.unwrap().is_none());
		let info = engine.get_node_info("users/alice").await.unwrap();
		assert!(!info.exists);
	}

	#[tokio::test]
	async fn test_replace_cascades_dedicated_children() {
		let engine = engine().await;
		let long = "x".repeat(200);
		engine
			.set_node(
				"doc",
				object! { "big" => long.as_str(), "small" => 1 },
				WriteOptions::default(),
			)
			.await
			.unwrap();
		assert_eq!(
			engine.get_node_info("doc/big").await.unwrap().address,
			Some(NodeAddress::Dedicated)
		);

		engine
			.set_node("doc", object! { "other" => 2 }, WriteOptions::default())
			.await
			.unwrap();
		assert!(!engine.get_node_info("doc/big").await.unwrap().exists);
		assert_eq!(
			engine.get_node_value("doc").await.unwrap().unwrap(),
			object! { "other" => 2 }
		);
	}

	#[tokio::test]
	async fn test_array_roundtrip_and_trailing_removal() {
		let engine = engine().await;
		engine
			.set_node("arr", Value::from(vec!["u", "v", "w"]), WriteOptions::default())
			.await
			.unwrap();
		assert_eq!(
			engine.get_node_value("arr").await.unwrap().unwrap(),
			Value::from(vec!["u", "v", "w"])
		);

		// Trailing removal is fine
		engine
			.update_node("arr", object! { "2" => Value::Null }, WriteOptions::default())
			.await
			.unwrap();
		assert_eq!(
			engine.get_node_value("arr").await.unwrap().unwrap(),
			Value::from(vec!["u", "v"])
		);

		// Removing a non-trailing element leaves a gap
		let result = engine
			.update_node("arr", object! { "0" => Value::Null }, WriteOptions::default())
			.await;
		assert!(matches!(result, Err(DbError::ArrayConstraint { .. })));

		// Inserting beyond the end leaves a gap too
		let result = engine
			.set_node("arr[5]", Value::from("z"), WriteOptions::default())
			.await;
		assert!(matches!(result, Err(DbError::ArrayConstraint { .. })));

		// Appending at the end is allowed
		engine
			.set_node("arr[2]", Value::from("w2"), WriteOptions::default())
			.await
			.unwrap();
		assert_eq!(
			engine.get_node_value("arr").await.unwrap().unwrap(),
			Value::from(vec!["u", "v", "w2"])
		);
	}

	#[tokio::test]
	async fn test_array_element_access() {
		let engine = engine().await;
		engine
			.set_node(
				"list",
				Value::Array(vec![object! { "n" => 1 }, object! { "n" => 2 }]),
				WriteOptions::default(),
			)
			.await
			.unwrap();

		let second = engine.get_node_value("list[1]").await.unwrap().unwrap();
		assert_eq!(second, object! { "n" => 2 });
		assert_eq!(
			engine.get_node_value("list[1]/n").await.unwrap().unwrap(),
			Value::from(2)
		);
	}

	#[tokio::test]
	async fn test_root_constraints() {
		let engine = engine().await;
		assert!(matches!(
			engine
				.set_node("", Value::from(1), WriteOptions::default())
				.await,
			Err(DbError::InvalidValue { .. })
		));
		assert!(matches!(
			engine.set_node("", Value::Null, WriteOptions::default()).await,
			Err(DbError::InvalidValue { .. })
		));
		assert!(matches!(
			engine
				.set_node("users/*", Value::from(1), WriteOptions::default())
				.await,
			Err(DbError::NotAllowed { .. })
		));

		engine
			.set_node("", object! { "hello" => "world" }, WriteOptions::default())
			.await
			.unwrap();
		assert_eq!(
			engine.get_node_value("").await.unwrap().unwrap(),
			object! { "hello" => "world" }
		);
	}

	#[tokio::test]
	async fn test_revision_nr_increments_and_resets() {
		let engine = engine().await;
		engine
			.set_node("doc", object! { "a" => 1 }, WriteOptions::default())
			.await
			.unwrap();
		let first = engine.get_node("doc", ReadOptions::default()).await.unwrap().unwrap();
		assert_eq!(first.revision_nr, 1);

		engine
			.update_node("doc", object! { "a" => 2 }, WriteOptions::default())
			.await
			.unwrap();
		let second = engine.get_node("doc", ReadOptions::default()).await.unwrap().unwrap();
		assert_eq!(second.revision_nr, 2);
		assert_eq!(second.created, first.created);
		assert_ne!(second.revision, first.revision);

		// Deletion resets the counter on recreation
		engine
			.set_node("doc", Value::Null, WriteOptions::default())
			.await
			.unwrap();
		engine
			.set_node("doc", object! { "a" => 3 }, WriteOptions::default())
			.await
			.unwrap();
		let recreated = engine.get_node("doc", ReadOptions::default()).await.unwrap().unwrap();
		assert_eq!(recreated.revision_nr, 1);
	}

	#[tokio::test]
	async fn test_include_exclude_filters() {
		let engine = engine().await;
		engine
			.set_node(
				"users/alice",
				object! {
					"name" => "alice",
					"age" => 30,
					"address" => object! { "city" => "Amsterdam", "zip" => "1234" },
				},
				WriteOptions::default(),
			)
			.await
			.unwrap();

		let loaded = engine
			.get_node(
				"users/alice",
				ReadOptions {
					include: vec!["name".to_string(), "address/city".to_string()],
					..ReadOptions::default()
				},
			)
			.await
			.unwrap()
			.unwrap();
		assert_eq!(
			loaded.value,
			object! {
				"name" => "alice",
				"address" => object! { "city" => "Amsterdam" },
			}
		);

		let loaded = engine
			.get_node(
				"users/alice",
				ReadOptions {
					exclude: vec!["address".to_string()],
					..ReadOptions::default()
				},
			)
			.await
			.unwrap()
			.unwrap();
		assert_eq!(loaded.value, object! { "name" => "alice", "age" => 30 });

		let loaded = engine
			.get_node(
				"users/alice",
				ReadOptions { child_objects: false, ..ReadOptions::default() },
			)
			.await
			.unwrap()
			.unwrap();
		assert_eq!(loaded.value, object! { "name" => "alice", "age" => 30 });
	}

	#[tokio::test]
	async fn test_get_children_streams_and_stops() {
		let engine = engine().await;
		let long = "x".repeat(120);
		engine
			.set_node(
				"docs",
				object! { "a" => 1, "b" => long.as_str(), "c" => 3 },
				WriteOptions::default(),
			)
			.await
			.unwrap();

		let mut seen = Vec::new();
		engine
			.get_children("docs", None, |info| {
				seen.push((info.path.clone(), info.address));
				true
			})
			.await
			.unwrap();
		// Inline entries come first, then dedicated records
		assert_eq!(
			seen,
			vec![
				("docs/a".to_string(), Some(NodeAddress::Inline)),
				("docs/c".to_string(), Some(NodeAddress::Inline)),
				("docs/b".to_string(), Some(NodeAddress::Dedicated)),
			]
		);

		let mut seen = 0;
		engine
			.get_children("docs", None, |_| {
				seen += 1;
				false
			})
			.await
			.unwrap();
		assert_eq!(seen, 1);

		let mut filtered = Vec::new();
		engine
			.get_children("docs", Some(&["c".to_string()]), |info| {
				filtered.push(info.path);
				true
			})
			.await
			.unwrap();
		assert_eq!(filtered, vec!["docs/c"]);
	}

	#[tokio::test]
	async fn test_transact_node() {
		let engine = engine().await;
		let revision = engine
			.transact_node("counter", |current| {
				let n = current.and_then(|v| v.as_number()).unwrap_or(0.0);
				Some(Value::from(n + 1.0))
			})
			.await
			.unwrap();
		assert!(revision.is_some());
		assert_eq!(
			engine.get_node_value("counter").await.unwrap().unwrap(),
			Value::from(1)
		);

		// Canceling leaves the node untouched
		let revision = engine.transact_node("counter", |_| None).await.unwrap();
		assert!(revision.is_none());
		assert_eq!(
			engine.get_node_value("counter").await.unwrap().unwrap(),
			Value::from(1)
		);
	}

	#[tokio::test]
	async fn test_assert_revision() {
		let engine = engine().await;
		engine
			.set_node("doc", object! { "a" => 1 }, WriteOptions::default())
			.await
			.unwrap();
		let current = engine.get_node("doc", ReadOptions::default()).await.unwrap().unwrap();

		// Stale revision is rejected
		let result = engine
			.set_node(
				"doc",
				object! { "a" => 2 },
				WriteOptions {
					assert_revision: Some(RevisionAssert::Revision("stale".to_string())),
					..WriteOptions::default()
				},
			)
			.await;
		assert!(matches!(result, Err(DbError::RevisionMismatch { .. })));

		// Matching revision is accepted
		engine
			.set_node(
				"doc",
				object! { "a" => 2 },
				WriteOptions {
					assert_revision: Some(RevisionAssert::Revision(current.revision)),
					..WriteOptions::default()
				},
			)
			.await
			.unwrap();
	}

	#[tokio::test]
	async fn test_null_in_array_rejected_unless_voids_removed() {
		let engine = engine().await;
		let result = engine
			.set_node(
				"list",
				Value::Array(vec![Value::from(1), Value::Null]),
				WriteOptions::default(),
			)
			.await;
		assert!(matches!(result, Err(DbError::InvalidValue { .. })));

		let lenient = StorageEngine::new(
			Arc::new(MemoryBackend::new()),
			DatabaseConfig::default().with_remove_void_properties(true),
		)
		.await
		.unwrap();
		lenient
			.set_node(
				"list",
				Value::Array(vec![Value::from(1), Value::Null, Value::from(2)]),
				WriteOptions::default(),
			)
			.await
			.unwrap();
		assert_eq!(
			lenient.get_node_value("list").await.unwrap().unwrap(),
			Value::from(vec![1, 2])
		);
	}

	#[tokio::test]
	async fn test_typed_value_roundtrip() {
		let engine = engine().await;
		let value = object! {
			"when" => Value::datetime_ms(1_700_000_000_000),
			"blob" => Value::Binary(vec![1, 2, 3, 4]),
			"link" => Value::Reference(crate::value::PathReference::new("users/alice")),
			"big_blob" => Value::Binary(vec![7; 300]),
		};
		engine
			.set_node("typed", value.clone(), WriteOptions::default())
			.await
			.unwrap();
		assert_eq!(engine.get_node_value("typed").await.unwrap().unwrap(), value);
	}

	#[tokio::test]
	async fn test_collect_pattern_paths() {
		let engine = engine().await;
		for (user, post) in [("alice", "p1"), ("alice", "p2"), ("bob", "p3")] {
			engine
				.set_node(
					&format!("users/{}/posts/{}", user, post),
					object! { "title" => post },
					WriteOptions::default(),
				)
				.await
				.unwrap();
		}

		let pattern = PathInfo::parse("users/*/posts/*").unwrap();
		let mut paths = engine.collect_pattern_paths(&pattern).await.unwrap();
		paths.sort();
		assert_eq!(
			paths,
			vec!["users/alice/posts/p1", "users/alice/posts/p2", "users/bob/posts/p3"]
		);
	}

	#[test]
	fn test_apply_patch() {
		// Replace at depth
		let base = Some(object! { "a" => object! { "b" => 1 }, "c" => 2 });
		let patched = apply_patch(
			base,
			&[PathKey::Key("a".to_string()), PathKey::Key("b".to_string())],
			&Value::from(9),
			false,
		);
		assert_eq!(
			patched,
			Some(object! { "a" => object! { "b" => 9 }, "c" => 2 })
		);

		// Merge with deletion marker
		let base = Some(object! { "x" => 1, "y" => 2 });
		let patched = apply_patch(base, &[], &object! { "y" => Value::Null, "z" => 3 }, true);
		assert_eq!(patched, Some(object! { "x" => 1, "z" => 3 }));

		// Null deletes the node itself
		assert_eq!(apply_patch(Some(Value::from(1)), &[], &Value::Null, false), None);

		// Creating missing intermediate containers
		let patched = apply_patch(
			None,
			&[PathKey::Key("a".to_string()), PathKey::Index(0)],
			&Value::from("v"),
			false,
		);
		assert_eq!(patched, Some(object! { "a" => Value::from(vec!["v"]) }));
	}
}

/// Parsed include/exclude patterns for a read
struct ReadFilter {
	include: Vec<PathInfo>,
	exclude: Vec<PathInfo>,
}

impl ReadFilter {
	fn new(options: &ReadOptions) -> DbResult<Self> {
		let parse = |patterns: &[String]| -> DbResult<Vec<PathInfo>> {
			patterns.iter().map(|p| PathInfo::parse(p)).collect()
		};
		Ok(Self {
			include: parse(&options.include)?,
			exclude: parse(&options.exclude)?,
		})
	}

	/// Whether a relative path survives the filters. Ancestors of an
	/// included path are kept so the containers can be assembled.
	fn allows(&self, rel: &PathInfo) -> bool {
		if rel.is_root() {
			return true;
		}
		if self
			.exclude
			.iter()
			.any(|p| p.equals(rel) || p.is_ancestor_of(rel))
		{
			return false;
		}
		if self.include.is_empty() {
			return true;
		}
		self.include.iter().any(|p| p.is_on_trail_of(rel))
	}
}
