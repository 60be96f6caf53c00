//! Fulltext index
//!
//! Tokenizes the indexed string on word boundaries and maps each lowercase
//! word to the records containing it. Stemming and language-aware analysis
//! belong to the leaf modules of the original system and are not part of
//! this contract; the tokenizer here is plain word splitting.

use super::{
	capture_metadata, key_value, rebuild_from_engine, record_pattern_for, IndexEntry, IndexSpec,
	QueryIndex,
};
use crate::error::{DbError, DbResult};
use crate::path::PathInfo;
use crate::query::QueryOp;
use crate::storage::engine::StorageEngine;
use crate::value::Value;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

/// Split text into lowercase word tokens
pub fn tokenize(text: &str) -> Vec<String> {
	text.split(|c: char| !c.is_alphanumeric())
		.filter(|word| !word.is_empty())
		.map(|word| word.to_lowercase())
		.collect()
}

#[derive(Default)]
struct FulltextState {
	by_word: BTreeMap<String, BTreeSet<String>>,
	by_path: HashMap<String, (Vec<String>, BTreeMap<String, Value>)>,
}

pub struct FulltextIndex {
	spec: IndexSpec,
	record_pattern: PathInfo,
	state: RwLock<FulltextState>,
}

impl FulltextIndex {
	pub fn new(spec: IndexSpec) -> DbResult<Self> {
		let record_pattern = record_pattern_for(&spec.path)?;
		Ok(Self {
			spec,
			record_pattern,
			state: RwLock::new(FulltextState::default()),
		})
	}

	fn paths_with_all_words(&self, state: &FulltextState, words: &[String]) -> Vec<String> {
		if words.is_empty() {
			return Vec::new();
		}
		let mut sets: Vec<&BTreeSet<String>> = Vec::with_capacity(words.len());
		for word in words {
			match state.by_word.get(word) {
				Some(set) => sets.push(set),
				None => return Vec::new(),
			}
		}
		sets.sort_by_key(|s| s.len());
		let (first, rest) = sets.split_first().expect("at least one word set");
		first
			.iter()
			.filter(|path| rest.iter().all(|set| set.contains(*path)))
			.cloned()
			.collect()
	}
}

#[async_trait]
impl QueryIndex for FulltextIndex {
	fn spec(&self) -> &IndexSpec {
		&self.spec
	}

	fn record_pattern(&self) -> &PathInfo {
		&self.record_pattern
	}

	fn valid_operators(&self) -> &'static [&'static str] {
		&["fulltext:contains", "fulltext:!contains"]
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
		if let Some((words, _)) = state.by_path.remove(path) {
			for word in words {
				if let Some(paths) = state.by_word.get_mut(&word) {
					paths.remove(path);
					if paths.is_empty() {
						state.by_word.remove(&word);
					}
				}
			}
		}

		let Some(new) = new else {
			return Ok(());
		};
		let Some(Value::String(text)) = key_value(Some(new), &self.spec.key) else {
			return Ok(());
		};
		let words = tokenize(text);
		for word in &words {
			state
				.by_word
				.entry(word.clone())
				.or_default()
				.insert(path.to_string());
		}
		let metadata = capture_metadata(Some(new), &self.spec.include);
		state.by_path.insert(path.to_string(), (words, metadata));
		Ok(())
	}

	async fn query(&self, op: &QueryOp, compare: &Value) -> DbResult<Vec<IndexEntry>> {
		let Value::String(text) = compare else {
			return Err(DbError::invalid_argument(
				"fulltext operators expect a string",
			));
		};
		let words = tokenize(text);
		let state = self.state.read().expect("index state poisoned");
		let containing = self.paths_with_all_words(&state, &words);

		let selected: Vec<String> = match op.name() {
			"fulltext:contains" => containing,
			"fulltext:!contains" => state
				.by_path
				.keys()
				.filter(|path| !containing.contains(path))
				.cloned()
				.collect(),
			other => {
				return Err(DbError::invalid_argument(format!(
					"operator \"{}\" is not supported by a fulltext index",
					other
				)))
			}
		};

		Ok(selected
			.into_iter()
			.map(|path| {
				let metadata = state
					.by_path
					.get(&path)
					.map(|(_, m)| m.clone())
					.unwrap_or_default();
				IndexEntry { path, indexed_value: compare.clone(), metadata }
			})
			.collect())
	}

	async fn take(&self, skip: usize, count: usize, ascending: bool) -> DbResult<Vec<IndexEntry>> {
		let state = self.state.read().expect("index state poisoned");
		let mut paths: Vec<String> = state.by_path.keys().cloned().collect();
		paths.sort();
		if !ascending {
			paths.reverse();
		}
		Ok(paths
			.into_iter()
			.skip(skip)
			.take(count)
			.map(|path| IndexEntry {
				path,
				indexed_value: Value::Null,
				metadata: BTreeMap::new(),
			})
			.collect())
	}

	fn test(&self, value: Option<&Value>, op: &QueryOp, compare: &Value) -> bool {
		let (Some(Value::String(text)), Value::String(query)) = (value, compare) else {
			return false;
		};
		let words = tokenize(text);
		let contains = tokenize(query).iter().all(|w| words.contains(w));
		match op.name() {
			"fulltext:contains" => contains,
			"fulltext:!contains" => !contains,
			_ => false,
		}
	}
}
