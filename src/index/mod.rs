//! Secondary indexes
//!
//! An index covers the child records of a collection path pattern (e.g.
//! `users/*/posts` indexes every `users/*/posts/*` record) on one key.
//! Indexes are fed incrementally by the mutation dispatcher and queried by
//! the planner. The on-disk index formats of the original system are leaf
//! modules; these implementations keep their state in memory behind the
//! same contract.

pub mod fulltext;
pub mod geo;
pub mod normal;

pub use fulltext::FulltextIndex;
pub use geo::GeoIndex;
pub use normal::{ArrayIndex, NormalIndex};

use crate::error::{DbError, DbResult};
use crate::path::{PathInfo, PathKey};
use crate::query::QueryOp;
use crate::storage::engine::StorageEngine;
use crate::value::Value;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Index flavors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
	Normal,
	Array,
	Fulltext,
	Geo,
}

impl fmt::Display for IndexKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			IndexKind::Normal => "normal",
			IndexKind::Array => "array",
			IndexKind::Fulltext => "fulltext",
			IndexKind::Geo => "geo",
		};
		write!(f, "{}", name)
	}
}

/// Definition of an index
#[derive(Debug, Clone)]
pub struct IndexSpec {
	/// Collection path pattern; children of its instances are indexed
	pub path: String,
	/// Indexed key of each child record; nested keys use `/`
	pub key: String,
	/// Additional keys stored with each entry, so queries covered by them
	/// skip record loads
	pub include: Vec<String>,
	pub kind: IndexKind,
}

impl IndexSpec {
	pub fn description(&self) -> String {
		format!("{} index on {}/*:{}", self.kind, self.path, self.key)
	}
}

/// One index hit
#[derive(Debug, Clone)]
pub struct IndexEntry {
	/// Path of the matched record
	pub path: String,
	/// The indexed value that matched
	pub indexed_value: Value,
	/// Values of the included keys, captured at update time
	pub metadata: BTreeMap<String, Value>,
}

/// Contract between the engine and an index implementation
#[async_trait]
pub trait QueryIndex: Send + Sync {
	fn spec(&self) -> &IndexSpec;

	/// Pattern of the records this index covers: the collection path plus
	/// one wildcard level
	fn record_pattern(&self) -> &PathInfo;

	/// Operator names this index can answer
	fn valid_operators(&self) -> &'static [&'static str];

	/// Populate from existing data
	async fn build(&self, engine: &StorageEngine) -> DbResult<()>;

	/// Apply one record mutation to the index
	async fn handle_record_update(
		&self,
		path: &str,
		old: Option<&Value>,
		new: Option<&Value>,
	) -> DbResult<()>;

	/// Answer a filter with matching entries
	async fn query(&self, op: &QueryOp, compare: &Value) -> DbResult<Vec<IndexEntry>>;

	/// Sorted slice of all entries, for sort-only index use
	async fn take(&self, skip: usize, count: usize, ascending: bool) -> DbResult<Vec<IndexEntry>>;

	/// Evaluate the operator against a concrete value, the way this index
	/// would match it
	fn test(&self, value: Option<&Value>, op: &QueryOp, compare: &Value) -> bool;
}

/// Whether an operator name is accepted by an index
pub fn supports_operator(index: &dyn QueryIndex, op: &QueryOp) -> bool {
	index.valid_operators().contains(&op.name())
}

/// Rebuild helper shared by all index kinds: enumerate the records covered
/// by the pattern and feed them as insertions
pub(crate) async fn rebuild_from_engine(
	index: &dyn QueryIndex,
	engine: &StorageEngine,
) -> DbResult<()> {
	let paths = engine.collect_pattern_paths(index.record_pattern()).await?;
	debug!(
		index = %index.spec().description(),
		records = paths.len(),
		"building index"
	);
	for path in paths {
		let value = engine.get_node_value(&path).await?;
		index.handle_record_update(&path, None, value.as_ref()).await?;
	}
	Ok(())
}

/// Resolve a (possibly nested) key against a record value
pub(crate) fn key_value<'v>(record: Option<&'v Value>, key: &str) -> Option<&'v Value> {
	let mut current = record?;
	for part in key.split('/') {
		current = current.child(part)?;
	}
	Some(current)
}

/// Capture the included keys of a record for entry metadata
pub(crate) fn capture_metadata(record: Option<&Value>, include: &[String]) -> BTreeMap<String, Value> {
	include
		.iter()
		.filter_map(|key| key_value(record, key).map(|v| (key.clone(), v.clone())))
		.collect()
}

/// The set of indexes attached to one database
#[derive(Default)]
pub struct IndexCoordinator {
	indexes: RwLock<Vec<Arc<dyn QueryIndex>>>,
}

impl IndexCoordinator {
	pub fn new() -> Self {
		Self::default()
	}

	/// Construct the implementation for a spec
	pub fn instantiate(spec: IndexSpec) -> DbResult<Arc<dyn QueryIndex>> {
		Ok(match spec.kind {
			IndexKind::Normal => Arc::new(NormalIndex::new(spec)?),
			IndexKind::Array => Arc::new(ArrayIndex::new(spec)?),
			IndexKind::Fulltext => Arc::new(FulltextIndex::new(spec)?),
			IndexKind::Geo => Arc::new(GeoIndex::new(spec)?),
		})
	}

	pub fn add(&self, index: Arc<dyn QueryIndex>) {
		let mut indexes = self.indexes.write().expect("index list poisoned");
		debug!(index = %index.spec().description(), "index registered");
		indexes.push(index);
	}

	pub fn all(&self) -> Vec<Arc<dyn QueryIndex>> {
		self.indexes.read().expect("index list poisoned").clone()
	}

	pub fn specs(&self) -> Vec<IndexSpec> {
		self.all().iter().map(|i| i.spec().clone()).collect()
	}

	/// Whether an identical index already exists
	pub fn exists(&self, path: &str, key: &str, kind: IndexKind) -> bool {
		self.all()
			.iter()
			.any(|i| i.spec().path == path && i.spec().key == key && i.spec().kind == kind)
	}

	/// Indexes whose record pattern lies on the same trail as a write
	/// path, deepest index paths first so nested dependent indexes update
	/// before shallower ones
	pub fn straddling(&self, write_path: &PathInfo) -> Vec<Arc<dyn QueryIndex>> {
		let mut matched: Vec<_> = self
			.all()
			.into_iter()
			.filter(|i| i.record_pattern().is_on_trail_of(write_path))
			.collect();
		matched.sort_by_key(|i| std::cmp::Reverse(i.record_pattern().depth()));
		matched
	}

	/// Indexes usable for a query on a base path and filter key
	pub fn for_query(&self, base: &PathInfo, key: &str) -> Vec<Arc<dyn QueryIndex>> {
		self.all()
			.into_iter()
			.filter(|i| i.spec().key == key)
			.filter(|i| {
				PathInfo::parse(&i.spec().path)
					.map(|p| p.equals(base))
					.unwrap_or(false)
			})
			.collect()
	}
}

/// Parse a collection path pattern into the record pattern it covers
pub(crate) fn record_pattern_for(path: &str) -> DbResult<PathInfo> {
	let collection = PathInfo::parse(path)?;
	if collection
		.keys()
		.last()
		.map(|k| k.is_wildcard())
		.unwrap_or(false)
	{
		return Err(DbError::invalid_argument(format!(
			"index path \"{}\" may not end with a wildcard",
			path
		)));
	}
	Ok(collection.child(PathKey::Key("*".to_string())))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::object;

	#[test]
	fn test_record_pattern() {
		let pattern = record_pattern_for("users/*/posts").unwrap();
		assert_eq!(pattern.path(), "users/*/posts/*");
		assert!(record_pattern_for("users/*").is_err());
	}

	#[test]
	fn test_key_value_nested() {
		let record = object! {
			"name" => "alice",
			"address" => object! { "city" => "Amsterdam" },
		};
		assert_eq!(
			key_value(Some(&record), "name"),
			Some(&Value::from("alice"))
		);
		assert_eq!(
			key_value(Some(&record), "address/city"),
			Some(&Value::from("Amsterdam"))
		);
		assert_eq!(key_value(Some(&record), "address/zip"), None);
		assert_eq!(key_value(None, "name"), None);
	}

	#[test]
	fn test_capture_metadata() {
		let record = object! { "a" => 1, "b" => 2, "c" => 3 };
		let captured = capture_metadata(
			Some(&record),
			&["a".to_string(), "c".to_string(), "missing".to_string()],
		);
		assert_eq!(captured.len(), 2);
		assert_eq!(captured.get("a"), Some(&Value::from(1)));
	}

	#[tokio::test]
	async fn test_coordinator_straddling_order() {
		let coordinator = IndexCoordinator::new();
		coordinator.add(
			IndexCoordinator::instantiate(IndexSpec {
				path: "users".to_string(),
				key: "name".to_string(),
				include: Vec::new(),
				kind: IndexKind::Normal,
			})
			.unwrap(),
		);
		coordinator.add(
			IndexCoordinator::instantiate(IndexSpec {
				path: "users/*/posts".to_string(),
				key: "likes".to_string(),
				include: Vec::new(),
				kind: IndexKind::Normal,
			})
			.unwrap(),
		);

		let write = PathInfo::parse("users/alice/posts/p1/likes").unwrap();
		let straddling = coordinator.straddling(&write);
		assert_eq!(straddling.len(), 2);
		// Deepest record pattern first
		assert_eq!(straddling[0].spec().path, "users/*/posts");
		assert_eq!(straddling[1].spec().path, "users");

		let unrelated = PathInfo::parse("groups/admins").unwrap();
		assert!(coordinator.straddling(&unrelated).is_empty());
	}

	#[tokio::test]
	async fn test_coordinator_for_query() {
		let coordinator = IndexCoordinator::new();
		coordinator.add(
			IndexCoordinator::instantiate(IndexSpec {
				path: "users/*/posts".to_string(),
				key: "likes".to_string(),
				include: Vec::new(),
				kind: IndexKind::Normal,
			})
			.unwrap(),
		);

		let base = PathInfo::parse("users/alice/posts").unwrap();
		assert_eq!(coordinator.for_query(&base, "likes").len(), 1);
		assert!(coordinator.for_query(&base, "title").is_empty());
		assert!(coordinator
			.for_query(&PathInfo::parse("users").unwrap(), "likes")
			.is_empty());
		assert!(coordinator.exists("users/*/posts", "likes", IndexKind::Normal));
	}
}
