//! Query planning and execution
//!
//! A query runs against the children of a base path: filters pick records,
//! order/skip/take shape the result. The planner prefers indexes — scoring
//! candidates by how many other filter and sort keys their included keys
//! cover — and falls back to a table scan over the base path's children
//! for standard operators. Wildcard base paths must be fully index-backed.
//! Specialized operators (`fulltext:contains`, `geo:nearby`, ...) always
//! require an index of the matching type.

use crate::error::{DbError, DbResult};
use crate::index::{key_value, IndexEntry, QueryIndex};
use crate::path::PathInfo;
use crate::storage::engine::{ReadOptions, StorageEngine};
use crate::subscriptions::EventType;
use crate::value::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Filter and sort operators
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryOp {
	Lt,
	Lte,
	Eq,
	Neq,
	Gte,
	Gt,
	Like,
	NotLike,
	In,
	NotIn,
	Matches,
	NotMatches,
	Between,
	NotBetween,
	Has,
	NotHas,
	Contains,
	NotContains,
	Exists,
	NotExists,
	/// Specialized `<indexType>:<op>` operator, e.g. `fulltext:contains`
	Custom(String),
}

impl QueryOp {
	pub fn parse(op: &str) -> DbResult<QueryOp> {
		Ok(match op {
			"<" => QueryOp::Lt,
			"<=" => QueryOp::Lte,
			"==" => QueryOp::Eq,
			"!=" => QueryOp::Neq,
			">=" => QueryOp::Gte,
			">" => QueryOp::Gt,
			"like" => QueryOp::Like,
			"!like" => QueryOp::NotLike,
			"in" => QueryOp::In,
			"!in" => QueryOp::NotIn,
			"matches" => QueryOp::Matches,
			"!matches" => QueryOp::NotMatches,
			"between" => QueryOp::Between,
			"!between" => QueryOp::NotBetween,
			"has" => QueryOp::Has,
			"!has" => QueryOp::NotHas,
			"contains" => QueryOp::Contains,
			"!contains" => QueryOp::NotContains,
			"exists" => QueryOp::Exists,
			"!exists" => QueryOp::NotExists,
			custom if custom.contains(':') => QueryOp::Custom(custom.to_string()),
			other => {
				return Err(DbError::invalid_argument(format!(
					"unknown query operator \"{}\"",
					other
				)))
			}
		})
	}

	pub fn name(&self) -> &str {
		match self {
			QueryOp::Lt => "<",
			QueryOp::Lte => "<=",
			QueryOp::Eq => "==",
			QueryOp::Neq => "!=",
			QueryOp::Gte => ">=",
			QueryOp::Gt => ">",
			QueryOp::Like => "like",
			QueryOp::NotLike => "!like",
			QueryOp::In => "in",
			QueryOp::NotIn => "!in",
			QueryOp::Matches => "matches",
			QueryOp::NotMatches => "!matches",
			QueryOp::Between => "between",
			QueryOp::NotBetween => "!between",
			QueryOp::Has => "has",
			QueryOp::NotHas => "!has",
			QueryOp::Contains => "contains",
			QueryOp::NotContains => "!contains",
			QueryOp::Exists => "exists",
			QueryOp::NotExists => "!exists",
			QueryOp::Custom(op) => op,
		}
	}

	/// Specialized operators can only run against an index of their type
	pub fn is_specialized(&self) -> bool {
		matches!(self, QueryOp::Custom(_))
	}
}

/// One query filter: `key op compare`
#[derive(Debug, Clone)]
pub struct QueryFilter {
	pub key: String,
	pub op: QueryOp,
	pub compare: Value,
}

impl QueryFilter {
	/// Check operand constraints up front
	pub fn validate(&self) -> DbResult<()> {
		match &self.op {
			QueryOp::In | QueryOp::NotIn => match &self.compare {
				Value::Array(items) if !items.is_empty() => Ok(()),
				_ => Err(DbError::invalid_argument(format!(
					"\"{}\" expects a non-empty list",
					self.op.name()
				))),
			},
			QueryOp::Between | QueryOp::NotBetween => match &self.compare {
				Value::Array(items) if items.len() == 2 => Ok(()),
				_ => Err(DbError::invalid_argument(format!(
					"\"{}\" expects a two-element list",
					self.op.name()
				))),
			},
			QueryOp::Matches | QueryOp::NotMatches => {
				compile_regex(&self.compare).map(|_| ())
			}
			_ => Ok(()),
		}
	}
}

/// Sort instruction
#[derive(Debug, Clone)]
pub struct QueryOrder {
	pub key: String,
	pub ascending: bool,
}

/// A prepared query
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
	pub path: String,
	pub filters: Vec<QueryFilter>,
	pub order: Vec<QueryOrder>,
	pub skip: usize,
	/// 0 takes everything
	pub take: usize,
}

/// Live-match tracking switches
#[derive(Debug, Clone, Copy, Default)]
pub struct MonitorOptions {
	pub add: bool,
	pub change: bool,
	pub remove: bool,
}

impl MonitorOptions {
	pub fn any(self) -> bool {
		self.add || self.change || self.remove
	}
}

/// Execution options
#[derive(Debug, Clone)]
pub struct QueryExecOptions {
	/// Load matched node values; false returns paths only
	pub snapshots: bool,
	pub include: Vec<String>,
	pub exclude: Vec<String>,
	pub child_objects: bool,
	pub monitor: MonitorOptions,
}

impl Default for QueryExecOptions {
	fn default() -> Self {
		Self {
			snapshots: true,
			include: Vec::new(),
			exclude: Vec::new(),
			child_objects: true,
			monitor: MonitorOptions::default(),
		}
	}
}

/// One matched record
#[derive(Debug, Clone)]
pub struct QueryRow {
	pub path: String,
	pub value: Option<Value>,
}

/// Change notification from a live query
#[derive(Debug, Clone, PartialEq)]
pub struct QueryEvent {
	pub name: QueryEventName,
	pub path: String,
	pub value: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryEventName {
	Add,
	Change,
	Remove,
}

/// Handle to a live query's event stream; dropping it stops the monitor
pub struct QueryMonitor {
	receiver: mpsc::UnboundedReceiver<QueryEvent>,
	task: tokio::task::JoinHandle<()>,
}

impl QueryMonitor {
	pub async fn next(&mut self) -> Option<QueryEvent> {
		self.receiver.recv().await
	}

	pub fn stop(self) {
		self.task.abort();
	}
}

impl Drop for QueryMonitor {
	fn drop(&mut self) {
		self.task.abort();
	}
}

/// Query results plus the optional live monitor
pub struct QueryResults {
	pub rows: Vec<QueryRow>,
	pub monitor: Option<QueryMonitor>,
}

/// A filter with its chosen index, if any
struct PlannedFilter {
	filter: QueryFilter,
	index: Option<Arc<dyn QueryIndex>>,
}

/// Execute a query against the children of the request's base path
pub async fn execute_query(
	engine: &Arc<StorageEngine>,
	request: QueryRequest,
	options: QueryExecOptions,
) -> DbResult<QueryResults> {
	for filter in &request.filters {
		filter.validate()?;
	}
	let base = PathInfo::parse(&request.path)?;
	let wildcard = base.contains_wildcards();

	let planned = plan_filters(engine, &base, &request)?;
	let table_scan: Vec<&PlannedFilter> =
		planned.iter().filter(|p| p.index.is_none()).collect();
	let indexed: Vec<&PlannedFilter> = planned.iter().filter(|p| p.index.is_some()).collect();

	if wildcard && !table_scan.is_empty() {
		return Err(DbError::index_unavailable(format!(
			"query on wildcard path \"{}\" requires an index on \"{}\"",
			request.path,
			table_scan[0].filter.key
		)));
	}

	debug!(
		path = %request.path,
		indexed = indexed.len(),
		table_scan = table_scan.len(),
		"query planned"
	);

	// Matched paths with any metadata captured from index entries
	let mut matches: Vec<(String, BTreeMap<String, Value>)> = if !indexed.is_empty() {
		let mut sets: Vec<Vec<IndexEntry>> = Vec::with_capacity(indexed.len());
		for p in &indexed {
			let index = p.index.as_ref().expect("indexed filter has an index");
			sets.push(index.query(&p.filter.op, &p.filter.compare).await?);
		}
		intersect_index_results(sets)
	} else if wildcard {
		// No filters on a wildcard path: enumerate the record pattern
		let pattern = base.child("*");
		engine
			.collect_pattern_paths(&pattern)
			.await?
			.into_iter()
			.map(|p| (p, BTreeMap::new()))
			.collect()
	} else {
		let mut candidates = Vec::new();
		engine
			.get_children(base.path(), None, |info| {
				candidates.push(info.path);
				true
			})
			.await?;
		candidates.into_iter().map(|p| (p, BTreeMap::new())).collect()
	};

	// Keys the remaining evaluation needs per candidate
	let needed_keys: Vec<String> = {
		let mut keys: Vec<String> = table_scan.iter().map(|p| p.filter.key.clone()).collect();
		keys.extend(request.order.iter().map(|o| o.key.clone()));
		keys.sort();
		keys.dedup();
		keys
	};

	// Table-scan filters and sort keys: resolve from index metadata where
	// captured, load the rest
	let mut evaluated: Vec<(String, BTreeMap<String, Value>)> = Vec::new();
	let unordered_limit = if request.order.is_empty() && request.take > 0 {
		Some(request.skip + request.take)
	} else {
		None
	};
	for (path, mut metadata) in matches.drain(..) {
		let missing: Vec<String> = needed_keys
			.iter()
			.filter(|k| !metadata.contains_key(*k))
			.cloned()
			.collect();
		if !missing.is_empty() {
			if let Some(node) = engine
				.get_node(&path, ReadOptions::including(missing.iter().cloned()))
				.await?
			{
				for key in &missing {
					if let Some(v) = key_value(Some(&node.value), key) {
						metadata.insert(key.clone(), v.clone());
					}
				}
			}
		}

		let keep = table_scan.iter().all(|p| {
			test_operator(metadata.get(&p.filter.key), &p.filter.op, &p.filter.compare)
		});
		if keep {
			evaluated.push((path, metadata));
			if let Some(limit) = unordered_limit {
				if evaluated.len() >= limit {
					break;
				}
			}
		}
	}

	// Sort contract: undefined before defined, natural ordering, ties by
	// path
	if !request.order.is_empty() {
		evaluated.sort_by(|(path_a, meta_a), (path_b, meta_b)| {
			for order in &request.order {
				let ord = compare_optional(meta_a.get(&order.key), meta_b.get(&order.key));
				let ord = if order.ascending { ord } else { ord.reverse() };
				if ord != Ordering::Equal {
					return ord;
				}
			}
			path_a.cmp(path_b)
		});
	} else {
		evaluated.sort_by(|(a, _), (b, _)| a.cmp(b));
	}

	let matched_paths: Vec<String> = evaluated.iter().map(|(p, _)| p.clone()).collect();

	let page: Vec<String> = evaluated
		.into_iter()
		.skip(request.skip)
		.take(if request.take == 0 { usize::MAX } else { request.take })
		.map(|(path, _)| path)
		.collect();

	let mut rows = Vec::with_capacity(page.len());
	for path in page {
		let value = if options.snapshots {
			engine
				.get_node(
					&path,
					ReadOptions {
						include: options.include.clone(),
						exclude: options.exclude.clone(),
						child_objects: options.child_objects,
					},
				)
				.await?
				.map(|nv| nv.value)
		} else {
			None
		};
		rows.push(QueryRow { path, value });
	}

	let monitor = if options.monitor.any() {
		Some(start_monitor(engine, &request, options.monitor, matched_paths, planned).await?)
	} else {
		None
	};

	Ok(QueryResults { rows, monitor })
}

/// Pick the best index per filter. Candidates are scored by how many other
/// filter and order keys their included keys cover; the highest scorer
/// wins.
fn plan_filters(
	engine: &Arc<StorageEngine>,
	base: &PathInfo,
	request: &QueryRequest,
) -> DbResult<Vec<PlannedFilter>> {
	let coordinator = engine.indexes();
	let mut planned = Vec::with_capacity(request.filters.len());

	for filter in &request.filters {
		let candidates: Vec<Arc<dyn QueryIndex>> = coordinator
			.for_query(base, &filter.key)
			.into_iter()
			.filter(|index| crate::index::supports_operator(index.as_ref(), &filter.op))
			.collect();

		let chosen = candidates
			.into_iter()
			.max_by_key(|index| {
				let include = &index.spec().include;
				let other_filters = request
					.filters
					.iter()
					.filter(|f| f.key != filter.key && include.contains(&f.key))
					.count();
				let orders = request
					.order
					.iter()
					.filter(|o| include.contains(&o.key))
					.count();
				other_filters + orders
			});

		if chosen.is_none() && filter.op.is_specialized() {
			return Err(DbError::index_unavailable(format!(
				"operator \"{}\" requires a matching index on \"{}\"",
				filter.op.name(),
				filter.key
			)));
		}

		planned.push(PlannedFilter { filter: filter.clone(), index: chosen });
	}
	Ok(planned)
}

/// Intersect index result sets on record path, probing from the smallest
/// set; metadata from all sets is merged per path
fn intersect_index_results(
	mut sets: Vec<Vec<IndexEntry>>,
) -> Vec<(String, BTreeMap<String, Value>)> {
	if sets.is_empty() {
		return Vec::new();
	}
	sets.sort_by_key(|s| s.len());
	let mut lookups: Vec<HashMap<String, BTreeMap<String, Value>>> = sets
		.iter()
		.skip(1)
		.map(|set| {
			set.iter()
				.map(|e| (e.path.clone(), e.metadata.clone()))
				.collect()
		})
		.collect();

	let mut seen = HashSet::new();
	sets.remove(0)
		.into_iter()
		.filter(|entry| seen.insert(entry.path.clone()))
		.filter_map(|entry| {
			let mut metadata = entry.metadata;
			for lookup in lookups.iter_mut() {
				match lookup.get(&entry.path) {
					Some(extra) => {
						for (k, v) in extra {
							metadata.entry(k.clone()).or_insert_with(|| v.clone());
						}
					}
					None => return None,
				}
			}
			Some((entry.path, metadata))
		})
		.collect()
}

/// Compare possibly-missing sort keys: undefined sorts before defined
fn compare_optional(a: Option<&Value>, b: Option<&Value>) -> Ordering {
	match (a, b) {
		(None, None) => Ordering::Equal,
		(None, Some(_)) => Ordering::Less,
		(Some(_), None) => Ordering::Greater,
		(Some(a), Some(b)) => a.natural_cmp(b),
	}
}

/// Evaluate a standard operator against a record's key value. Missing
/// values only match `!=`, `!in`, `!like`, `!contains`, `!has`,
/// `!matches`, `!between` and `!exists`.
pub(crate) fn test_operator(value: Option<&Value>, op: &QueryOp, compare: &Value) -> bool {
	match op {
		QueryOp::Exists => value.is_some(),
		QueryOp::NotExists => value.is_none(),
		QueryOp::Neq => value.map(|v| v != compare).unwrap_or(true),
		QueryOp::NotIn => match compare {
			Value::Array(items) => value.map(|v| !items.contains(v)).unwrap_or(true),
			_ => false,
		},
		QueryOp::NotLike => value
			.map(|v| !like_match(v, compare))
			.unwrap_or(true),
		QueryOp::NotMatches => value
			.map(|v| !regex_match(v, compare))
			.unwrap_or(true),
		QueryOp::NotBetween => value
			.map(|v| !between_match(v, compare))
			.unwrap_or(true),
		QueryOp::NotContains => value
			.map(|v| !contains_match(v, compare))
			.unwrap_or(true),
		QueryOp::NotHas => value.map(|v| !has_match(v, compare)).unwrap_or(true),
		positive => {
			let Some(value) = value else {
				return false;
			};
			match positive {
				QueryOp::Eq => value == compare,
				QueryOp::Lt => value.natural_cmp(compare) == Ordering::Less,
				QueryOp::Lte => value.natural_cmp(compare) != Ordering::Greater,
				QueryOp::Gt => value.natural_cmp(compare) == Ordering::Greater,
				QueryOp::Gte => value.natural_cmp(compare) != Ordering::Less,
				QueryOp::Like => like_match(value, compare),
				QueryOp::Matches => regex_match(value, compare),
				QueryOp::Between => between_match(value, compare),
				QueryOp::In => match compare {
					Value::Array(items) => items.contains(value),
					_ => false,
				},
				QueryOp::Contains => contains_match(value, compare),
				QueryOp::Has => has_match(value, compare),
				QueryOp::Custom(_) => false,
				_ => false,
			}
		}
	}
}

/// Case-insensitive pattern match; `*` spans any number of characters
fn like_match(value: &Value, compare: &Value) -> bool {
	let (Value::String(text), Value::String(pattern)) = (value, compare) else {
		return false;
	};
	let text = text.to_lowercase();
	let pattern = pattern.to_lowercase();

	fn matches(text: &[char], pattern: &[char]) -> bool {
		match pattern.split_first() {
			None => text.is_empty(),
			Some(('*', rest)) => {
				(0..=text.len()).any(|i| matches(&text[i..], rest))
			}
			Some((c, rest)) => text.first() == Some(c) && matches(&text[1..], rest),
		}
	}

	let text: Vec<char> = text.chars().collect();
	let pattern: Vec<char> = pattern.chars().collect();
	matches(&text, &pattern)
}

fn compile_regex(compare: &Value) -> DbResult<regex::Regex> {
	let (source, flags) = match compare {
		Value::String(source) => (source.clone(), String::new()),
		Value::Object(map) => {
			let source = map
				.get("source")
				.and_then(|v| v.as_str())
				.ok_or_else(|| {
					DbError::invalid_argument("\"matches\" expects a regex source and flags")
				})?
				.to_string();
			let flags = map
				.get("flags")
				.and_then(|v| v.as_str())
				.unwrap_or("")
				.to_string();
			(source, flags)
		}
		_ => {
			return Err(DbError::invalid_argument(
				"\"matches\" expects a regex source and flags",
			))
		}
	};
	regex::RegexBuilder::new(&source)
		.case_insensitive(flags.contains('i'))
		.multi_line(flags.contains('m'))
		.dot_matches_new_line(flags.contains('s'))
		.build()
		.map_err(|e| DbError::invalid_argument(format!("invalid regex: {}", e)))
}

fn regex_match(value: &Value, compare: &Value) -> bool {
	let Value::String(text) = value else {
		return false;
	};
	match compile_regex(compare) {
		Ok(regex) => regex.is_match(text),
		Err(_) => false,
	}
}

fn between_match(value: &Value, compare: &Value) -> bool {
	let Value::Array(pair) = compare else {
		return false;
	};
	if pair.len() != 2 {
		return false;
	}
	let (mut low, mut high) = (&pair[0], &pair[1]);
	if low.natural_cmp(high) == Ordering::Greater {
		std::mem::swap(&mut low, &mut high);
	}
	value.natural_cmp(low) != Ordering::Less && value.natural_cmp(high) != Ordering::Greater
}

/// Collection membership; a list compare requires every element
fn contains_match(value: &Value, compare: &Value) -> bool {
	let Value::Array(items) = value else {
		return false;
	};
	match compare {
		Value::Array(required) => required.iter().all(|r| items.contains(r)),
		single => items.contains(single),
	}
}

fn has_match(value: &Value, compare: &Value) -> bool {
	let (Value::Object(map), Value::String(key)) = (value, compare) else {
		return false;
	};
	map.contains_key(key)
}

/// Start the live monitor for a query: notify subscriptions on the base
/// path drive re-evaluation of single children
async fn start_monitor(
	engine: &Arc<StorageEngine>,
	request: &QueryRequest,
	monitor: MonitorOptions,
	matched_paths: Vec<String>,
	planned: Vec<PlannedFilter>,
) -> DbResult<QueryMonitor> {
	let registry = engine.subscriptions();
	let (added_id, mut added_rx) =
		registry.subscribe(&request.path, EventType::NotifyChildAdded)?;
	let (changed_id, mut changed_rx) =
		registry.subscribe(&request.path, EventType::NotifyChildChanged)?;
	let (removed_id, mut removed_rx) =
		registry.subscribe(&request.path, EventType::NotifyChildRemoved)?;

	let (event_tx, event_rx) = mpsc::unbounded_channel();
	let engine = Arc::clone(engine);
	let registry = Arc::clone(engine.subscriptions());
	let filters: Vec<(QueryFilter, Option<Arc<dyn QueryIndex>>)> = planned
		.into_iter()
		.map(|p| (p.filter, p.index))
		.collect();
	let filter_keys: Vec<String> = filters.iter().map(|(f, _)| f.key.clone()).collect();
	let mut matched: HashSet<String> = matched_paths.into_iter().collect();

	let task = tokio::spawn(async move {
		loop {
			let (path, removed) = tokio::select! {
				Some(event) = added_rx.recv() => (event.path, false),
				Some(event) = changed_rx.recv() => (event.path, false),
				Some(event) = removed_rx.recv() => (event.path, true),
				else => break,
			};

			let (matches_now, value) = if removed {
				(false, None)
			} else {
				// Reload only the keys the filters need
				match engine
					.get_node(&path, ReadOptions::including(filter_keys.iter().cloned()))
					.await
				{
					Ok(Some(node)) => {
						let all = filters.iter().all(|(filter, index)| {
							let value = key_value(Some(&node.value), &filter.key);
							match index {
								Some(index) => index.test(value, &filter.op, &filter.compare),
								None => test_operator(value, &filter.op, &filter.compare),
							}
						});
						(all, Some(node.value))
					}
					Ok(None) => (false, None),
					Err(e) => {
						warn!(path, "live query re-evaluation failed: {}", e);
						continue;
					}
				}
			};

			let was_matched = matched.contains(&path);
			let event = match (was_matched, matches_now) {
				(false, true) => {
					matched.insert(path.clone());
					monitor.add.then_some(QueryEventName::Add)
				}
				(true, false) => {
					matched.remove(&path);
					monitor.remove.then_some(QueryEventName::Remove)
				}
				(true, true) => monitor.change.then_some(QueryEventName::Change),
				(false, false) => None,
			};

			if let Some(name) = event {
				trace!(path, ?name, "live query event");
				let send = event_tx.send(QueryEvent {
					name,
					path: path.clone(),
					value: if name == QueryEventName::Remove { None } else { value },
				});
				if send.is_err() {
					break;
				}
			}
		}

		registry.unsubscribe(added_id);
		registry.unsubscribe(changed_id);
		registry.unsubscribe(removed_id);
	});

	Ok(QueryMonitor { receiver: event_rx, task })
}
