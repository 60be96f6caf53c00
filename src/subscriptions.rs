//! Subscription registry
//!
//! Event listeners register on path patterns (wildcards allowed) with a
//! typed event. Delivery is channel-based: every subscriber owns the
//! receiving half of an unbounded channel, so dispatching never suspends
//! inside the storage engine and subscribers consume events on their own
//! schedule, strictly after the write that produced them.

use crate::error::{DbError, DbResult};
use crate::path::{PathInfo, PathKey};
use crate::value::Value;
use chrono::{DateTime, Utc};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Subscription event types. Each value-carrying type has a notify-only
/// variant that delivers a path reference without loading any payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
	Value,
	NotifyValue,
	ChildAdded,
	NotifyChildAdded,
	ChildChanged,
	NotifyChildChanged,
	ChildRemoved,
	NotifyChildRemoved,
	Mutated,
	NotifyMutated,
	Mutations,
	NotifyMutations,
}

impl EventType {
	pub fn as_str(self) -> &'static str {
		match self {
			EventType::Value => "value",
			EventType::NotifyValue => "notify_value",
			EventType::ChildAdded => "child_added",
			EventType::NotifyChildAdded => "notify_child_added",
			EventType::ChildChanged => "child_changed",
			EventType::NotifyChildChanged => "notify_child_changed",
			EventType::ChildRemoved => "child_removed",
			EventType::NotifyChildRemoved => "notify_child_removed",
			EventType::Mutated => "mutated",
			EventType::NotifyMutated => "notify_mutated",
			EventType::Mutations => "mutations",
			EventType::NotifyMutations => "notify_mutations",
		}
	}

	/// Whether this is a notify-only variant (reference, no payload)
	pub fn is_notify(self) -> bool {
		matches!(
			self,
			EventType::NotifyValue
				| EventType::NotifyChildAdded
				| EventType::NotifyChildChanged
				| EventType::NotifyChildRemoved
				| EventType::NotifyMutated
				| EventType::NotifyMutations
		)
	}

	/// The value-carrying counterpart of a notify variant
	pub fn base(self) -> EventType {
		match self {
			EventType::NotifyValue => EventType::Value,
			EventType::NotifyChildAdded => EventType::ChildAdded,
			EventType::NotifyChildChanged => EventType::ChildChanged,
			EventType::NotifyChildRemoved => EventType::ChildRemoved,
			EventType::NotifyMutated => EventType::Mutated,
			EventType::NotifyMutations => EventType::Mutations,
			other => other,
		}
	}

	/// Whether this event compares the children of its path
	pub fn is_child_event(self) -> bool {
		matches!(
			self.base(),
			EventType::ChildAdded | EventType::ChildChanged | EventType::ChildRemoved
		)
	}

	/// Whether this event enumerates leaf-level mutations
	pub fn is_mutation_event(self) -> bool {
		matches!(self.base(), EventType::Mutated | EventType::Mutations)
	}
}

impl FromStr for EventType {
	type Err = DbError;

	fn from_str(s: &str) -> DbResult<Self> {
		match s {
			"value" => Ok(EventType::Value),
			"notify_value" => Ok(EventType::NotifyValue),
			"child_added" => Ok(EventType::ChildAdded),
			"notify_child_added" => Ok(EventType::NotifyChildAdded),
			"child_changed" => Ok(EventType::ChildChanged),
			"notify_child_changed" => Ok(EventType::NotifyChildChanged),
			"child_removed" => Ok(EventType::ChildRemoved),
			"notify_child_removed" => Ok(EventType::NotifyChildRemoved),
			"mutated" => Ok(EventType::Mutated),
			"notify_mutated" => Ok(EventType::NotifyMutated),
			"mutations" => Ok(EventType::Mutations),
			"notify_mutations" => Ok(EventType::NotifyMutations),
			other => Err(DbError::invalid_argument(format!(
				"unknown event type \"{}\"",
				other
			))),
		}
	}
}

/// One leaf-level change inside a `mutations` batch
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
	/// Keys from the subscription path down to the changed node
	pub target: Vec<PathKey>,
	/// Value before the change; None when the node was added
	pub prev: Option<Value>,
	/// Value after the change; None when the node was removed
	pub val: Option<Value>,
}

/// An event as delivered to a subscriber
#[derive(Debug, Clone)]
pub struct DataEvent {
	pub event: EventType,
	/// The pattern the subscriber registered on
	pub subscription_path: String,
	/// Concrete path this event applies to
	pub path: String,
	/// New value; None for notify variants and removals
	pub value: Option<Value>,
	/// Previous value; None for notify variants and additions
	pub previous: Option<Value>,
	/// Batched changes, populated for `mutations` events only
	pub mutations: Vec<Mutation>,
	/// Context attached to the write that caused this event
	pub context: serde_json::Value,
}

struct SubscriberEntry {
	id: u64,
	pattern: PathInfo,
	event: EventType,
	sender: mpsc::UnboundedSender<DataEvent>,
	created: DateTime<Utc>,
}

/// A subscriber matched against a mutated path
#[derive(Debug, Clone)]
pub struct SubscriberMatch {
	pub id: u64,
	pub event: EventType,
	/// Registered pattern
	pub pattern: PathInfo,
	/// Pattern with wildcards filled from the mutated path where they
	/// overlap; may keep wildcards deeper than the mutation
	pub event_path: PathInfo,
	/// Deepest path whose data this subscriber needs
	pub data_path: PathInfo,
}

/// Process-wide registry of event subscriptions for one database
#[derive(Default)]
pub struct SubscriptionRegistry {
	subscribers: Mutex<Vec<SubscriberEntry>>,
	next_id: AtomicU64,
	events_dispatched: AtomicU64,
}

impl SubscriptionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Register a subscriber; returns its id and the event receiver
	pub fn subscribe(
		&self,
		path: &str,
		event: EventType,
	) -> DbResult<(u64, mpsc::UnboundedReceiver<DataEvent>)> {
		let pattern = PathInfo::parse(path)?;
		let (sender, receiver) = mpsc::unbounded_channel();
		let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
		let mut subscribers = self.subscribers.lock().expect("subscriber table poisoned");
		subscribers.push(SubscriberEntry {
			id,
			pattern,
			event,
			sender,
			created: Utc::now(),
		});
		debug!(path, event = event.as_str(), id, "subscription added");
		Ok((id, receiver))
	}

	/// Remove a subscriber by id
	pub fn unsubscribe(&self, id: u64) {
		let mut subscribers = self.subscribers.lock().expect("subscriber table poisoned");
		let before = subscribers.len();
		subscribers.retain(|s| s.id != id);
		if subscribers.len() < before {
			debug!(id, "subscription removed");
		}
	}

	pub fn subscriber_count(&self) -> usize {
		self.subscribers.lock().expect("subscriber table poisoned").len()
	}

	pub fn events_dispatched(&self) -> u64 {
		self.events_dispatched.load(Ordering::Relaxed)
	}

	/// Subscribers whose contract requires loading previous data for a
	/// mutation at the given path. Notify variants are excluded; they are
	/// the reason a pre-image read can be skipped entirely.
	pub fn value_subscribers_for_path(&self, mutated: &PathInfo) -> Vec<SubscriberMatch> {
		self.collect(mutated, |entry, pattern, mutated| {
			if entry.event.is_notify() {
				return false;
			}
			match entry.event.base() {
				// Needs pre-image on itself or any ancestor position, and on
				// descendants of the mutation
				EventType::Value | EventType::Mutated | EventType::Mutations => {
					pattern.is_on_trail_of(mutated)
				}
				// Child comparison happens at the event path: the mutated
				// node's parent, the mutated node itself (children replaced),
				// any ancestor (nested change), or a descendant
				EventType::ChildAdded | EventType::ChildRemoved | EventType::ChildChanged => {
					pattern.is_on_trail_of(mutated)
				}
				_ => false,
			}
		})
	}

	/// Every subscriber on the same trail as the mutated path, notify
	/// variants included
	pub fn all_subscribers_for_path(&self, mutated: &PathInfo) -> Vec<SubscriberMatch> {
		self.collect(mutated, |_, pattern, mutated| pattern.is_on_trail_of(mutated))
	}

	fn collect(
		&self,
		mutated: &PathInfo,
		matches: impl Fn(&SubscriberEntry, &PathInfo, &PathInfo) -> bool,
	) -> Vec<SubscriberMatch> {
		let subscribers = self.subscribers.lock().expect("subscriber table poisoned");
		subscribers
			.iter()
			.filter(|entry| matches(entry, &entry.pattern, mutated))
			.map(|entry| {
				let event_path = entry.pattern.fill_overlapping(mutated);
				SubscriberMatch {
					id: entry.id,
					event: entry.event,
					pattern: entry.pattern.clone(),
					data_path: event_path.clone(),
					event_path,
				}
			})
			.collect()
	}

	/// Deliver an event to one subscriber. A closed receiver means the
	/// subscriber is gone; it is pruned and the failure is not surfaced.
	pub fn deliver(&self, id: u64, event: DataEvent) {
		let mut subscribers = self.subscribers.lock().expect("subscriber table poisoned");
		let Some(entry) = subscribers.iter().find(|s| s.id == id) else {
			return;
		};
		trace!(
			id,
			event = event.event.as_str(),
			path = %event.path,
			"delivering event"
		);
		if entry.sender.send(event).is_err() {
			debug!(id, "subscriber receiver dropped, pruning subscription");
			subscribers.retain(|s| s.id != id);
		} else {
			self.events_dispatched.fetch_add(1, Ordering::Relaxed);
		}
	}

	/// Age of a subscription, for diagnostics
	pub fn subscribed_since(&self, id: u64) -> Option<DateTime<Utc>> {
		let subscribers = self.subscribers.lock().expect("subscriber table poisoned");
		subscribers.iter().find(|s| s.id == id).map(|s| s.created)
	}
}
