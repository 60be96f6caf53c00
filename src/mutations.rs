//! Mutation diffing and event dispatch
//!
//! After a write commits, the engine hands the pre- and post-image of the
//! top event path to this module. It computes the structural diff, routes
//! record updates to straddling indexes (deepest index paths first), and
//! fans events out to subscribers: descending both images in lockstep
//! along each subscriber's path, expanding wildcards into the keys present
//! on either side. Dispatch is ordered deepest anchor path first, so a
//! `child_changed` on a parent arrives after a `value` on the child.

use crate::index::IndexCoordinator;
use crate::path::{PathInfo, PathKey};
use crate::subscriptions::{DataEvent, EventType, Mutation, SubscriptionRegistry};
use crate::value::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{trace, warn};

/// Result of comparing two node values
#[derive(Debug, Clone, PartialEq)]
pub enum Compare {
	Identical,
	Added,
	Removed,
	Changed,
	ChangedChildren(Box<ChildChanges>),
}

/// Per-child breakdown of a composite change
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChildChanges {
	pub added: Vec<String>,
	pub removed: Vec<String>,
	pub changed: Vec<(String, Compare)>,
}

impl Compare {
	pub fn is_identical(&self) -> bool {
		matches!(self, Compare::Identical)
	}
}

/// Structural comparison of two optional values. Binary values compare
/// byte-wise, datetimes by their instant; composites are compared child by
/// child.
pub fn compare_values(old: Option<&Value>, new: Option<&Value>) -> Compare {
	match (old, new) {
		(None, None) => Compare::Identical,
		(None, Some(_)) => Compare::Added,
		(Some(_), None) => Compare::Removed,
		(Some(old), Some(new)) => {
			if old.is_composite() && new.is_composite() {
				let old_keys = composite_keys(old);
				let new_keys = composite_keys(new);
				let mut changes = ChildChanges::default();
				for key in old_keys.union(&new_keys) {
					let key_str = key.to_string();
					let sub = compare_values(value_child(old, key), value_child(new, key));
					match sub {
						Compare::Identical => {}
						Compare::Added => changes.added.push(key_str),
						Compare::Removed => changes.removed.push(key_str),
						other => changes.changed.push((key_str, other)),
					}
				}
				if changes.added.is_empty()
					&& changes.removed.is_empty()
					&& changes.changed.is_empty()
				{
					Compare::Identical
				} else {
					Compare::ChangedChildren(Box::new(changes))
				}
			} else if old == new {
				Compare::Identical
			} else {
				Compare::Changed
			}
		}
	}
}

/// Direct-child key set of a composite value
fn composite_keys(value: &Value) -> BTreeSet<PathKey> {
	match value {
		Value::Object(map) => map.keys().map(|k| PathKey::Key(k.clone())).collect(),
		Value::Array(items) => (0..items.len()).map(PathKey::Index).collect(),
		_ => BTreeSet::new(),
	}
}

/// Direct child of a value by path key
fn value_child<'v>(value: &'v Value, key: &PathKey) -> Option<&'v Value> {
	match (value, key) {
		(Value::Object(map), PathKey::Key(k)) => map.get(k),
		(Value::Array(items), PathKey::Index(i)) => items.get(*i),
		(Value::Array(items), PathKey::Key(k)) => {
			k.parse::<usize>().ok().and_then(|i| items.get(i))
		}
		_ => None,
	}
}

/// All concrete instances of `target` under `from`, with the old/new value
/// at each. Wildcards expand into the union of keys present on either
/// side.
fn descend_instances<'v>(
	from: &PathInfo,
	old: Option<&'v Value>,
	new: Option<&'v Value>,
	target: &PathInfo,
) -> Vec<(PathInfo, Option<&'v Value>, Option<&'v Value>)> {
	if target.depth() < from.depth() {
		return Vec::new();
	}
	let mut instances = vec![(from.clone(), old, new)];
	for key in &target.keys()[from.depth()..] {
		let mut next = Vec::new();
		for (path, old, new) in instances {
			if key.is_wildcard() {
				let mut keys = old.map(composite_keys).unwrap_or_default();
				keys.extend(new.map(composite_keys).unwrap_or_default());
				for concrete in keys {
					let old_child = old.and_then(|v| value_child(v, &concrete));
					let new_child = new.and_then(|v| value_child(v, &concrete));
					next.push((path.child(concrete), old_child, new_child));
				}
			} else {
				let old_child = old.and_then(|v| value_child(v, key));
				let new_child = new.and_then(|v| value_child(v, key));
				next.push((path.child(key.clone()), old_child, new_child));
			}
		}
		instances = next;
	}
	instances
}

/// Leaf-level changes between two values, anchored at `base`. Arrays are
/// atomic: a changed array yields one entry on the array path instead of
/// per-index entries.
fn enumerate_leaf_changes(
	base: &PathInfo,
	old: Option<&Value>,
	new: Option<&Value>,
	out: &mut Vec<(PathInfo, Option<Value>, Option<Value>)>,
) {
	match (old, new) {
		(None, None) => {}
		(Some(Value::Object(old_map)), Some(Value::Object(new_map))) => {
			let keys: BTreeSet<&String> = old_map.keys().chain(new_map.keys()).collect();
			for key in keys {
				enumerate_leaf_changes(
					&base.child(key.as_str()),
					old_map.get(key),
					new_map.get(key),
					out,
				);
			}
		}
		(old, new) => {
			if old != new {
				out.push((base.clone(), old.cloned(), new.cloned()));
			}
		}
	}
}

/// A subscriber event staged for dispatch, with its ordering anchor
struct StagedEvent {
	subscriber_id: u64,
	anchor_depth: usize,
	event: DataEvent,
}

/// What the write pipeline observed about the mutated node, for event
/// classification when no pre-image was loaded
#[derive(Debug, Clone, Copy)]
pub struct WriteEventInfo {
	/// Whether the node existed before the write
	pub existed_before: bool,
	/// Whether the write removed the node
	pub removed: bool,
	/// Whether old/new images at the top event path were loaded
	pub images_loaded: bool,
}

/// Process one committed mutation: update indexes and dispatch events.
#[allow(clippy::too_many_arguments)]
pub async fn process_mutation(
	registry: &SubscriptionRegistry,
	indexes: &IndexCoordinator,
	top_path: &PathInfo,
	old: Option<&Value>,
	new: Option<&Value>,
	write_path: &PathInfo,
	info: WriteEventInfo,
	context: &serde_json::Value,
	wait_for_index_updates: bool,
	suppress_events: bool,
) {
	if !info.images_loaded {
		// Only notify subscribers are interested (anything else would have
		// forced a pre-image read), and no index straddles the write
		if !suppress_events {
			dispatch_notify_only(registry, write_path, info, context);
		}
		return;
	}

	let diff = compare_values(old, new);
	if diff.is_identical() {
		trace!(path = %write_path, "mutation produced no effective change");
		return;
	}

	update_indexes(indexes, top_path, old, new, write_path, wait_for_index_updates).await;

	if !suppress_events {
		dispatch_events(registry, top_path, old, new, write_path, context);
	}
}

/// Fast-path dispatch when the pre-image read was skipped: only notify
/// variants fire, classified by the observed existence transition. Child
/// events above the write's own level cannot be enumerated without data
/// and are skipped.
fn dispatch_notify_only(
	registry: &SubscriptionRegistry,
	write_path: &PathInfo,
	info: WriteEventInfo,
	context: &serde_json::Value,
) {
	if info.removed && !info.existed_before {
		return;
	}
	let mut staged: Vec<StagedEvent> = Vec::new();

	for sub in registry.all_subscribers_for_path(write_path) {
		if !sub.event.is_notify() {
			continue;
		}
		let make = |event: EventType, at: &PathInfo| DataEvent {
			event,
			subscription_path: sub.pattern.path().to_string(),
			path: at.path().to_string(),
			previous: None,
			value: None,
			mutations: Vec::new(),
			context: context.clone(),
		};

		match sub.event.base() {
			EventType::Value | EventType::Mutated | EventType::Mutations => {
				if sub.event_path.depth() <= write_path.depth() {
					staged.push(StagedEvent {
						subscriber_id: sub.id,
						anchor_depth: sub.event_path.depth(),
						event: make(sub.event, &sub.event_path),
					});
				}
			}
			EventType::ChildAdded | EventType::ChildChanged | EventType::ChildRemoved => {
				let child_depth = sub.event_path.depth() + 1;
				if write_path.depth() < child_depth {
					continue;
				}
				let child = PathInfo::from_keys(write_path.keys()[..child_depth].to_vec());
				let wanted = if child.depth() == write_path.depth() {
					if info.removed {
						EventType::ChildRemoved
					} else if info.existed_before {
						EventType::ChildChanged
					} else {
						EventType::ChildAdded
					}
				} else {
					EventType::ChildChanged
				};
				if wanted == sub.event.base() {
					staged.push(StagedEvent {
						subscriber_id: sub.id,
						anchor_depth: sub.event_path.depth(),
						event: make(sub.event, &child),
					});
				}
			}
			_ => {}
		}
	}

	staged.sort_by(|a, b| b.anchor_depth.cmp(&a.anchor_depth));
	for event in staged {
		registry.deliver(event.subscriber_id, event.event);
	}
}

/// Feed straddling indexes, deepest index paths first so nested dependent
/// indexes observe consistent state
async fn update_indexes(
	indexes: &IndexCoordinator,
	top_path: &PathInfo,
	old: Option<&Value>,
	new: Option<&Value>,
	write_path: &PathInfo,
	wait: bool,
) {
	for index in indexes.straddling(write_path) {
		let pattern = index.record_pattern().clone();
		if pattern.depth() < top_path.depth() {
			// The engine chooses the top event path to cover every
			// straddling index; anything shallower cannot be resolved here
			continue;
		}
		for (path, old_rec, new_rec) in descend_instances(top_path, old, new, &pattern) {
			if old_rec.is_none() && new_rec.is_none() {
				continue;
			}
			if wait {
				if let Err(e) = index
					.handle_record_update(path.path(), old_rec, new_rec)
					.await
				{
					warn!(index = %index.spec().description(), path = %path, "index update failed: {}", e);
				}
			} else {
				let index = Arc::clone(&index);
				let old_owned = old_rec.cloned();
				let new_owned = new_rec.cloned();
				tokio::spawn(async move {
					if let Err(e) = index
						.handle_record_update(path.path(), old_owned.as_ref(), new_owned.as_ref())
						.await
					{
						warn!(index = %index.spec().description(), path = %path, "detached index update failed: {}", e);
					}
				});
			}
		}
	}
}

fn dispatch_events(
	registry: &SubscriptionRegistry,
	top_path: &PathInfo,
	old: Option<&Value>,
	new: Option<&Value>,
	write_path: &PathInfo,
	context: &serde_json::Value,
) {
	let mut staged: Vec<StagedEvent> = Vec::new();

	for sub in registry.all_subscribers_for_path(write_path) {
		if sub.event_path.depth() < top_path.depth() {
			stage_ancestor_events(&sub, top_path, old, new, write_path, context, &mut staged);
			continue;
		}

		for (path, o, n) in descend_instances(top_path, old, new, &sub.event_path) {
			stage_instance_events(&sub, &path, o, n, context, &mut staged);
		}
	}

	// Deepest anchor first; equal depths keep value events ahead of child
	// events on the same node
	staged.sort_by(|a, b| {
		b.anchor_depth
			.cmp(&a.anchor_depth)
			.then_with(|| type_rank(a.event.event).cmp(&type_rank(b.event.event)))
	});

	for event in staged {
		registry.deliver(event.subscriber_id, event.event);
	}
}

fn type_rank(event: EventType) -> u8 {
	match event.base() {
		EventType::Value => 0,
		EventType::ChildAdded | EventType::ChildChanged | EventType::ChildRemoved => 1,
		_ => 2,
	}
}

/// Events for one concrete subscriber instance at or below the top event
/// path
fn stage_instance_events(
	sub: &crate::subscriptions::SubscriberMatch,
	path: &PathInfo,
	old: Option<&Value>,
	new: Option<&Value>,
	context: &serde_json::Value,
	staged: &mut Vec<StagedEvent>,
) {
	let notify = sub.event.is_notify();
	let make = |event: EventType,
	            at: &PathInfo,
	            prev: Option<&Value>,
	            val: Option<&Value>,
	            mutations: Vec<Mutation>| DataEvent {
		event,
		subscription_path: sub.pattern.path().to_string(),
		path: at.path().to_string(),
		previous: if notify { None } else { prev.cloned() },
		value: if notify { None } else { val.cloned() },
		mutations: if notify { Vec::new() } else { mutations },
		context: context.clone(),
	};

	match sub.event.base() {
		EventType::Value => {
			if !compare_values(old, new).is_identical() {
				staged.push(StagedEvent {
					subscriber_id: sub.id,
					anchor_depth: path.depth(),
					event: make(sub.event, path, old, new, Vec::new()),
				});
			}
		}
		EventType::ChildAdded | EventType::ChildChanged | EventType::ChildRemoved => {
			let old_keys = old.map(composite_keys).unwrap_or_default();
			let new_keys = new.map(composite_keys).unwrap_or_default();
			for key in old_keys.union(&new_keys) {
				let old_child = old.and_then(|v| value_child(v, key));
				let new_child = new.and_then(|v| value_child(v, key));
				let wanted = match compare_values(old_child, new_child) {
					Compare::Identical => None,
					Compare::Added => Some(EventType::ChildAdded),
					Compare::Removed => Some(EventType::ChildRemoved),
					_ => Some(EventType::ChildChanged),
				};
				if wanted == Some(sub.event.base()) {
					let child_path = path.child(key.clone());
					staged.push(StagedEvent {
						subscriber_id: sub.id,
						anchor_depth: path.depth(),
						event: make(sub.event, &child_path, old_child, new_child, Vec::new()),
					});
				}
			}
		}
		EventType::Mutated => {
			let mut changes = Vec::new();
			enumerate_leaf_changes(path, old, new, &mut changes);
			for (at, prev, val) in changes {
				staged.push(StagedEvent {
					subscriber_id: sub.id,
					anchor_depth: path.depth(),
					event: make(sub.event, &at, prev.as_ref(), val.as_ref(), Vec::new()),
				});
			}
		}
		EventType::Mutations => {
			let mut changes = Vec::new();
			enumerate_leaf_changes(path, old, new, &mut changes);
			if changes.is_empty() {
				return;
			}
			let mutations = changes
				.into_iter()
				.map(|(at, prev, val)| Mutation {
					target: at.keys()[path.depth()..].to_vec(),
					prev,
					val,
				})
				.collect();
			staged.push(StagedEvent {
				subscriber_id: sub.id,
				anchor_depth: path.depth(),
				event: make(sub.event, path, old, new, mutations),
			});
		}
		_ => {}
	}
}

/// Events for subscribers registered above the top event path. Only notify
/// variants can land here (value-carrying subscribers pull the top event
/// path up to their own), so no payloads are needed.
fn stage_ancestor_events(
	sub: &crate::subscriptions::SubscriberMatch,
	top_path: &PathInfo,
	old: Option<&Value>,
	new: Option<&Value>,
	write_path: &PathInfo,
	context: &serde_json::Value,
	staged: &mut Vec<StagedEvent>,
) {
	if !sub.event.is_notify() {
		return;
	}
	let make = |event: EventType, at: &PathInfo| DataEvent {
		event,
		subscription_path: sub.pattern.path().to_string(),
		path: at.path().to_string(),
		previous: None,
		value: None,
		mutations: Vec::new(),
		context: context.clone(),
	};

	match sub.event.base() {
		EventType::Value | EventType::Mutated | EventType::Mutations => {
			staged.push(StagedEvent {
				subscriber_id: sub.id,
				anchor_depth: sub.event_path.depth(),
				event: make(sub.event, &sub.event_path),
			});
		}
		EventType::ChildAdded | EventType::ChildChanged | EventType::ChildRemoved => {
			// The affected child of the ancestor is the write path truncated
			// one key below the subscription
			let child_depth = sub.event_path.depth() + 1;
			if write_path.depth() < child_depth {
				return;
			}
			let child = PathInfo::from_keys(write_path.keys()[..child_depth].to_vec());
			let wanted = if child.depth() == top_path.depth() {
				match compare_values(old, new) {
					Compare::Identical => None,
					Compare::Added => Some(EventType::ChildAdded),
					Compare::Removed => Some(EventType::ChildRemoved),
					_ => Some(EventType::ChildChanged),
				}
			} else {
				// The change happened deeper inside an existing child
				Some(EventType::ChildChanged)
			};
			if wanted == Some(sub.event.base()) {
				staged.push(StagedEvent {
					subscriber_id: sub.id,
					anchor_depth: sub.event_path.depth(),
					event: make(sub.event, &child),
				});
			}
		}
		_ => {}
	}
}
