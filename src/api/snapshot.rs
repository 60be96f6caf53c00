//! Data snapshots
//!
//! A snapshot carries the value of a node at one moment, the previous
//! value when the snapshot came from an event, and the context of the
//! write that produced it.

use super::reference::DataReference;
use crate::path::PathInfo;
use crate::subscriptions::{EventType, Mutation};
use crate::value::Value;

/// Value of a node at a point in time
#[derive(Clone)]
pub struct DataSnapshot {
	reference: DataReference,
	value: Option<Value>,
	previous: Option<Value>,
	event: Option<EventType>,
	mutations: Vec<Mutation>,
	context: serde_json::Value,
}

impl DataSnapshot {
	pub(crate) fn new(reference: DataReference, value: Option<Value>) -> Self {
		Self {
			reference,
			value,
			previous: None,
			event: None,
			mutations: Vec::new(),
			context: serde_json::Value::Null,
		}
	}

	pub(crate) fn from_event(
		reference: DataReference,
		event: EventType,
		value: Option<Value>,
		previous: Option<Value>,
		mutations: Vec<Mutation>,
		context: serde_json::Value,
	) -> Self {
		Self {
			reference,
			value,
			previous,
			event: Some(event),
			mutations,
			context,
		}
	}

	/// The reference this snapshot was taken of
	pub fn reference(&self) -> &DataReference {
		&self.reference
	}

	/// Last key of the snapshot's path
	pub fn key(&self) -> Option<String> {
		self.reference.key()
	}

	/// The event that produced this snapshot, for event stream snapshots
	pub fn event(&self) -> Option<EventType> {
		self.event
	}

	/// The node's value; None when the node does not exist (or was removed)
	pub fn val(&self) -> Option<&Value> {
		self.value.as_ref()
	}

	/// The node's value before the mutation that produced this snapshot
	pub fn previous(&self) -> Option<&Value> {
		self.previous.as_ref()
	}

	/// For `mutations` events: the batched per-node changes
	pub fn mutations(&self) -> &[Mutation] {
		&self.mutations
	}

	/// Context attached to the write that produced this snapshot
	pub fn context(&self) -> &serde_json::Value {
		&self.context
	}

	pub fn exists(&self) -> bool {
		self.value.is_some()
	}

	/// Snapshot of a child value, addressed by a relative path
	pub fn child(&self, rel_path: &str) -> DataSnapshot {
		let reference = self.reference.child(rel_path);
		let descend = |base: Option<&Value>| -> Option<Value> {
			let mut current = base?;
			// Relative paths may start with an array index; parse those
			// behind a placeholder key
			let (parsed, skip) = if rel_path.starts_with('[') {
				(PathInfo::parse(&format!("x{}", rel_path)).ok()?, 1)
			} else {
				(PathInfo::parse(rel_path).ok()?, 0)
			};
			for key in &parsed.keys()[skip..] {
				let key = match key {
					crate::path::PathKey::Key(k) => k.clone(),
					crate::path::PathKey::Index(i) => i.to_string(),
				};
				current = current.child(&key)?;
			}
			Some(current.clone())
		};
		DataSnapshot {
			reference,
			value: descend(self.value.as_ref()),
			previous: descend(self.previous.as_ref()),
			event: self.event,
			mutations: Vec::new(),
			context: self.context.clone(),
		}
	}

	pub fn has_child(&self, rel_path: &str) -> bool {
		self.child(rel_path).exists()
	}

	pub fn has_children(&self) -> bool {
		self.num_children() > 0
	}

	pub fn num_children(&self) -> usize {
		self.value.as_ref().map(|v| v.child_count()).unwrap_or(0)
	}

	/// Visit every direct child; return false to stop early
	pub fn for_each(&self, mut visit: impl FnMut(DataSnapshot) -> bool) {
		let Some(value) = &self.value else {
			return;
		};
		match value {
			Value::Object(map) => {
				for key in map.keys() {
					if !visit(self.child(key)) {
						break;
					}
				}
			}
			Value::Array(items) => {
				for i in 0..items.len() {
					if !visit(self.child(&format!("[{}]", i))) {
						break;
					}
				}
			}
			_ => {}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::api::Database;
	use crate::config::DatabaseConfig;
	use crate::object;

	async fn snapshot() -> DataSnapshot {
		let db = Database::in_memory(DatabaseConfig::default()).await.unwrap();
		db.reference("users/alice")
			.set(object! {
				"name" => "alice",
				"address" => object! { "city" => "Amsterdam" },
				"tags" => vec!["admin", "staff"],
			})
			.await
			.unwrap();
		db.reference("users/alice").get().await.unwrap()
	}

	#[tokio::test]
	async fn test_snapshot_basics() {
		let snapshot = snapshot().await;
		assert!(snapshot.exists());
		assert_eq!(snapshot.key(), Some("alice".to_string()));
		assert_eq!(snapshot.num_children(), 3);
		assert!(snapshot.has_children());
	}

	#[tokio::test]
	async fn test_snapshot_child_access() {
		let snapshot = snapshot().await;
		assert_eq!(
			snapshot.child("address/city").val(),
			Some(&Value::from("Amsterdam"))
		);
		assert_eq!(snapshot.child("tags[0]").val(), Some(&Value::from("admin")));
		assert!(snapshot.has_child("name"));
		assert!(!snapshot.has_child("missing"));
		assert!(!snapshot.child("missing").exists());
	}

	#[tokio::test]
	async fn test_snapshot_for_each() {
		let snapshot = snapshot().await;
		let mut keys = Vec::new();
		snapshot.for_each(|child| {
			keys.push(child.key().unwrap());
			true
		});
		assert_eq!(keys, vec!["address", "name", "tags"]);

		let mut visited = 0;
		snapshot.for_each(|_| {
			visited += 1;
			false
		});
		assert_eq!(visited, 1);
	}
}
