//! Normal and array index implementations
//!
//! Both keep an ordered map from indexed value to matching record paths.
//! The normal index stores one entry per record; the array index stores
//! one entry per array element, so `contains` lookups are exact-key reads.

use super::{
	capture_metadata, key_value, rebuild_from_engine, record_pattern_for, IndexEntry, IndexKind,
	IndexSpec, QueryIndex,
};
use crate::error::{DbError, DbResult};
use crate::path::PathInfo;
use crate::query::{test_operator, QueryOp};
use crate::storage::engine::StorageEngine;
use crate::value::Value;
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::RwLock;

/// Indexed key value with a total order; records missing the key rank
/// before every defined value
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct OrdKey(pub Option<Value>);

impl Eq for OrdKey {}

impl PartialOrd for OrdKey {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for OrdKey {
	fn cmp(&self, other: &Self) -> Ordering {
		match (&self.0, &other.0) {
			(None, None) => Ordering::Equal,
			(None, Some(_)) => Ordering::Less,
			(Some(_), None) => Ordering::Greater,
			(Some(a), Some(b)) => a.natural_cmp(b),
		}
	}
}

type Metadata = BTreeMap<String, Value>;
type PathMap = BTreeMap<String, Metadata>;

#[derive(Default)]
struct SingleValueState {
	by_value: BTreeMap<OrdKey, PathMap>,
	by_path: HashMap<String, OrdKey>,
}

impl SingleValueState {
	fn remove_path(&mut self, path: &str) {
		if let Some(key) = self.by_path.remove(path) {
			if let Some(paths) = self.by_value.get_mut(&key) {
				paths.remove(path);
				if paths.is_empty() {
					self.by_value.remove(&key);
				}
			}
		}
	}

	fn insert(&mut self, path: String, key: OrdKey, metadata: Metadata) {
		self.by_value
			.entry(key.clone())
			.or_default()
			.insert(path.clone(), metadata);
		self.by_path.insert(path, key);
	}
}

/// Index on a single-valued key
pub struct NormalIndex {
	spec: IndexSpec,
	record_pattern: PathInfo,
	state: RwLock<SingleValueState>,
}

impl NormalIndex {
	pub fn new(spec: IndexSpec) -> DbResult<Self> {
		let record_pattern = record_pattern_for(&spec.path)?;
		Ok(Self {
			spec,
			record_pattern,
			state: RwLock::new(SingleValueState::default()),
		})
	}

	fn entries_for(&self, key: &OrdKey, paths: &PathMap) -> Vec<IndexEntry> {
		paths
			.iter()
			.map(|(path, metadata)| IndexEntry {
				path: path.clone(),
				indexed_value: key.0.clone().unwrap_or(Value::Null),
				metadata: metadata.clone(),
			})
			.collect()
	}
}

#[async_trait]
impl QueryIndex for NormalIndex {
	fn spec(&self) -> &IndexSpec {
		&self.spec
	}

	fn record_pattern(&self) -> &PathInfo {
		&self.record_pattern
	}

	fn valid_operators(&self) -> &'static [&'static str] {
		&[
			"<", "<=", "==", "!=", ">=", ">", "like", "!like", "in", "!in", "matches",
			"!matches", "between", "!between", "exists", "!exists",
		]
	}

	async fn build(&self, engine: &StorageEngine) -> DbResult<()> {
		rebuild_from_engine(self, engine).await
	}

	async fn handle_record_update(
		&self,
		path: &str,
		_old: Option<&Value>,
		new: Option<&Value>,
	) -> DbResult<()> {
		let mut state = self.state.write().expect("index state poisoned");
		state.remove_path(path);
		if new.is_some() {
			let key = OrdKey(key_value(new, &self.spec.key).cloned());
			let metadata = capture_metadata(new, &self.spec.include);
			state.insert(path.to_string(), key, metadata);
		}
		Ok(())
	}

	async fn query(&self, op: &QueryOp, compare: &Value) -> DbResult<Vec<IndexEntry>> {
		let state = self.state.read().expect("index state poisoned");
		let mut entries = Vec::new();

		match op {
			QueryOp::Eq => {
				let key = OrdKey(Some(compare.clone()));
				if let Some(paths) = state.by_value.get(&key) {
					entries.extend(self.entries_for(&key, paths));
				}
			}
			QueryOp::Lt | QueryOp::Lte | QueryOp::Gt | QueryOp::Gte => {
				let bound = OrdKey(Some(compare.clone()));
				let range: (Bound<&OrdKey>, Bound<&OrdKey>) = match op {
					QueryOp::Lt => (Bound::Unbounded, Bound::Excluded(&bound)),
					QueryOp::Lte => (Bound::Unbounded, Bound::Included(&bound)),
					QueryOp::Gt => (Bound::Excluded(&bound), Bound::Unbounded),
					_ => (Bound::Included(&bound), Bound::Unbounded),
				};
				for (key, paths) in state.by_value.range(range) {
					// Records without the key never satisfy a comparison
					if key.0.is_some() {
						entries.extend(self.entries_for(key, paths));
					}
				}
			}
			QueryOp::Between => {
				let (low, high) = between_bounds(compare)?;
				let low = OrdKey(Some(low));
				let high = OrdKey(Some(high));
				for (key, paths) in state.by_value.range(low..=high) {
					entries.extend(self.entries_for(key, paths));
				}
			}
			QueryOp::In => {
				let Value::Array(candidates) = compare else {
					return Err(DbError::invalid_argument("\"in\" expects a list"));
				};
				for candidate in candidates {
					let key = OrdKey(Some(candidate.clone()));
					if let Some(paths) = state.by_value.get(&key) {
						entries.extend(self.entries_for(&key, paths));
					}
				}
			}
			QueryOp::Exists => {
				for (key, paths) in state.by_value.iter() {
					if key.0.is_some() {
						entries.extend(self.entries_for(key, paths));
					}
				}
			}
			QueryOp::NotExists => {
				let key = OrdKey(None);
				if let Some(paths) = state.by_value.get(&key) {
					entries.extend(self.entries_for(&key, paths));
				}
			}
			// Everything else scans the whole index with the shared
			// operator semantics
			other => {
				for (key, paths) in state.by_value.iter() {
					if test_operator(key.0.as_ref(), other, compare) {
						entries.extend(self.entries_for(key, paths));
					}
				}
			}
		}
		Ok(entries)
	}

	async fn take(&self, skip: usize, count: usize, ascending: bool) -> DbResult<Vec<IndexEntry>> {
		let state = self.state.read().expect("index state poisoned");
		let mut all: Vec<IndexEntry> = Vec::new();
		for (key, paths) in state.by_value.iter() {
			all.extend(self.entries_for(key, paths));
		}
		if !ascending {
			all.reverse();
		}
		Ok(all.into_iter().skip(skip).take(count).collect())
	}

	fn test(&self, value: Option<&Value>, op: &QueryOp, compare: &Value) -> bool {
		test_operator(value, op, compare)
	}
}

fn between_bounds(compare: &Value) -> DbResult<(Value, Value)> {
	let Value::Array(pair) = compare else {
		return Err(DbError::invalid_argument(
			"\"between\" expects a two-element list",
		));
	};
	if pair.len() != 2 {
		return Err(DbError::invalid_argument(
			"\"between\" expects a two-element list",
		));
	}
	let (a, b) = (pair[0].clone(), pair[1].clone());
	if a.natural_cmp(&b) == Ordering::Greater {
		Ok((b, a))
	} else {
		Ok((a, b))
	}
}

#[derive(Default)]
struct MultiValueState {
	by_value: BTreeMap<OrdKey, PathMap>,
	by_path: HashMap<String, Vec<OrdKey>>,
}

/// Index on an array-valued key, one entry per element
pub struct ArrayIndex {
	spec: IndexSpec,
	record_pattern: PathInfo,
	state: RwLock<MultiValueState>,
}

impl ArrayIndex {
	pub fn new(spec: IndexSpec) -> DbResult<Self> {
		let record_pattern = record_pattern_for(&spec.path)?;
		Ok(Self {
			spec,
			record_pattern,
			state: RwLock::new(MultiValueState::default()),
		})
	}

	fn paths_containing(&self, state: &MultiValueState, element: &Value) -> Vec<String> {
		state
			.by_value
			.get(&OrdKey(Some(element.clone())))
			.map(|paths| paths.keys().cloned().collect())
			.unwrap_or_default()
	}
}

#[async_trait]
impl QueryIndex for ArrayIndex {
	fn spec(&self) -> &IndexSpec {
		&self.spec
	}

	fn record_pattern(&self) -> &PathInfo {
		&self.record_pattern
	}

	fn valid_operators(&self) -> &'static [&'static str] {
		&["contains", "!contains"]
	}

	async fn build(&self, engine: &StorageEngine) -> DbResult<()> {
		rebuild_from_engine(self, engine).await
	}

	async fn handle_record_update(
		&self,
		path: &str,
		_old: Option<&Value>,
		new: Option<&Value>,
	) -> DbResult<()> {
		let mut state = self.state.write().expect("index state poisoned");
		if let Some(keys) = state.by_path.remove(path) {
			for key in keys {
				if let Some(paths) = state.by_value.get_mut(&key) {
					paths.remove(path);
					if paths.is_empty() {
						state.by_value.remove(&key);
					}
				}
			}
		}

		let Some(new) = new else {
			return Ok(());
		};
		let Some(Value::Array(elements)) = key_value(Some(new), &self.spec.key) else {
			return Ok(());
		};
		let metadata = capture_metadata(Some(new), &self.spec.include);
		let mut keys = Vec::with_capacity(elements.len());
		for element in elements {
			let key = OrdKey(Some(element.clone()));
			state
				.by_value
				.entry(key.clone())
				.or_default()
				.insert(path.to_string(), metadata.clone());
			keys.push(key);
		}
		state.by_path.insert(path.to_string(), keys);
		Ok(())
	}

	async fn query(&self, op: &QueryOp, compare: &Value) -> DbResult<Vec<IndexEntry>> {
		let state = self.state.read().expect("index state poisoned");

		let matching: Vec<String> = match compare {
			// A list means every element must be present
			Value::Array(required) => {
				let mut sets: Vec<Vec<String>> = required
					.iter()
					.map(|element| self.paths_containing(&state, element))
					.collect();
				sets.sort_by_key(|s| s.len());
				match sets.split_first() {
					None => state.by_path.keys().cloned().collect(),
					Some((first, rest)) => first
						.iter()
						.filter(|path| rest.iter().all(|set| set.contains(path)))
						.cloned()
						.collect(),
				}
			}
			single => self.paths_containing(&state, single),
		};

		let selected: Vec<String> = match op {
			QueryOp::Contains => matching,
			QueryOp::NotContains => state
				.by_path
				.keys()
				.filter(|path| !matching.contains(path))
				.cloned()
				.collect(),
			other => {
				return Err(DbError::invalid_argument(format!(
					"operator \"{}\" is not supported by an array index",
					other.name()
				)))
			}
		};

		Ok(selected
			.into_iter()
			.map(|path| IndexEntry {
				path,
				indexed_value: compare.clone(),
				metadata: Metadata::new(),
			})
			.collect())
	}

	async fn take(&self, skip: usize, count: usize, ascending: bool) -> DbResult<Vec<IndexEntry>> {
		let state = self.state.read().expect("index state poisoned");
		let mut seen = std::collections::HashSet::new();
		let mut all = Vec::new();
		for (key, paths) in state.by_value.iter() {
			for path in paths.keys() {
				if seen.insert(path.clone()) {
					all.push(IndexEntry {
						path: path.clone(),
						indexed_value: key.0.clone().unwrap_or(Value::Null),
						metadata: Metadata::new(),
					});
				}
			}
		}
		if !ascending {
			all.reverse();
		}
		Ok(all.into_iter().skip(skip).take(count).collect())
	}

	fn test(&self, value: Option<&Value>, op: &QueryOp, compare: &Value) -> bool {
		test_operator(value, op, compare)
	}
}
