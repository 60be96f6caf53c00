//! Data references and event streams
//!
//! A `DataReference` composes a database handle, a path and an optional
//! write context. References are cheap to clone and carry no I/O until an
//! operation is invoked.

use super::snapshot::DataSnapshot;
use super::DbInner;
use crate::error::{DbError, DbResult};
use crate::ids;
use crate::path::{PathInfo, PathKey};
use crate::query::{
	execute_query, MonitorOptions, QueryExecOptions, QueryFilter, QueryMonitor, QueryOp,
	QueryOrder, QueryRequest,
};
use crate::storage::engine::{NodeInfo, ReadOptions, WriteOptions};
use crate::subscriptions::{DataEvent, EventType, SubscriptionRegistry};
use crate::value::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Reference to a node in the database tree
#[derive(Clone)]
pub struct DataReference {
	db: Arc<DbInner>,
	path: String,
	context: serde_json::Value,
}

impl DataReference {
	pub(crate) fn new(db: Arc<DbInner>, path: &str) -> Self {
		Self {
			db,
			path: path.trim_matches('/').to_string(),
			context: serde_json::Value::Null,
		}
	}

	/// Canonical path of this reference
	pub fn path(&self) -> &str {
		&self.path
	}

	/// Last key of the path, None for the root
	pub fn key(&self) -> Option<String> {
		PathInfo::parse(&self.path)
			.ok()?
			.key()
			.map(|key| match key {
				PathKey::Key(k) => k.clone(),
				PathKey::Index(i) => i.to_string(),
			})
	}

	/// Reference to the parent node, None for the root
	pub fn parent(&self) -> Option<DataReference> {
		let parent = PathInfo::parse(&self.path).ok()?.parent()?;
		Some(DataReference {
			db: Arc::clone(&self.db),
			path: parent.path().to_string(),
			context: self.context.clone(),
		})
	}

	/// Reference to a child node, addressed relative to this one
	pub fn child(&self, rel_path: &str) -> DataReference {
		let rel = rel_path.trim_matches('/');
		let path = if self.path.is_empty() {
			rel.to_string()
		} else if rel.starts_with('[') {
			format!("{}{}", self.path, rel)
		} else {
			format!("{}/{}", self.path, rel)
		};
		DataReference {
			db: Arc::clone(&self.db),
			path,
			context: self.context.clone(),
		}
	}

	/// Attach a context object propagated to all events caused by writes
	/// through this reference. Event subscribers read it back via
	/// [`DataSnapshot::context`].
	pub fn with_context(mut self, context: serde_json::Value) -> Self {
		self.context = context;
		self
	}

	fn write_options(&self) -> WriteOptions {
		WriteOptions {
			context: self.context.clone(),
			..WriteOptions::default()
		}
	}

	/// Load the node's value
	pub async fn get(&self) -> DbResult<DataSnapshot> {
		self.get_with_options(ReadOptions::default()).await
	}

	/// Load the node's value with include/exclude/child_objects filters
	pub async fn get_with_options(&self, options: ReadOptions) -> DbResult<DataSnapshot> {
		self.db.validate_concrete(&self.path, "get")?;
		let node = self.db.engine.get_node(&self.path, options).await?;
		Ok(DataSnapshot::new(self.clone(), node.map(|nv| nv.value)))
	}

	/// Replace the node's value. `Value::Null` removes the node.
	pub async fn set(&self, value: impl Into<Value>) -> DbResult<DataReference> {
		self.db.validate_concrete(&self.path, "set")?;
		self.db
			.engine
			.set_node(&self.path, value.into(), self.write_options())
			.await?;
		Ok(self.clone())
	}

	/// Merge properties into the node. Property values of `Value::Null`
	/// remove those properties.
	pub async fn update(&self, value: Value) -> DbResult<DataReference> {
		self.db.validate_concrete(&self.path, "update")?;
		if !matches!(value, Value::Object(_)) {
			return Err(DbError::invalid_argument(
				"update() expects an object; use set() to replace the value",
			));
		}
		self.db
			.engine
			.update_node(&self.path, value, self.write_options())
			.await?;
		Ok(self.clone())
	}

	/// Remove the node
	pub async fn remove(&self) -> DbResult<DataReference> {
		self.set(Value::Null).await
	}

	/// Append a child under a generated time-sortable key. With a value
	/// the child is written; without, only the reference is handed out.
	pub async fn push(&self, value: Option<Value>) -> DbResult<DataReference> {
		self.db.validate_concrete(&self.path, "push")?;
		let child = self.child(&ids::push_key());
		if let Some(value) = value {
			child.set(value).await?;
		}
		Ok(child)
	}

	/// Read-modify-write the node's value. The callback gets the current
	/// value; returning None cancels the transaction, `Value::Null`
	/// removes the node. Retried once when a concurrent write interferes.
	pub async fn transaction<F>(&self, callback: F) -> DbResult<DataReference>
	where
		F: Fn(Option<Value>) -> Option<Value> + Send + Sync,
	{
		self.db.validate_concrete(&self.path, "transaction")?;
		self.db.engine.transact_node(&self.path, callback).await?;
		Ok(self.clone())
	}

	/// Whether a node exists at this path
	pub async fn exists(&self) -> DbResult<bool> {
		self.db.validate_concrete(&self.path, "exists")?;
		Ok(self.db.engine.get_node_info(&self.path).await?.exists)
	}

	/// Number of direct children
	pub async fn count(&self) -> DbResult<usize> {
		self.db.validate_concrete(&self.path, "count")?;
		self.db.engine.get_children(&self.path, None, |_| true).await
	}

	/// Subscribe to an event on this path (wildcards allowed). Events are
	/// consumed from the returned stream; dropping it unsubscribes.
	pub fn on(&self, event: &str) -> DbResult<EventStream> {
		let event: EventType = event.parse()?;
		let registry = Arc::clone(self.db.engine.subscriptions());
		let (id, receiver) = registry.subscribe(&self.path, event)?;
		Ok(EventStream {
			db: Arc::clone(&self.db),
			registry,
			id,
			receiver,
		})
	}

	/// One-shot event. `value` resolves immediately with the current
	/// snapshot; other events wait for their first occurrence.
	pub async fn once(&self, event: &str) -> DbResult<Option<DataSnapshot>> {
		let parsed: EventType = event.parse()?;
		if parsed == EventType::Value {
			return Ok(Some(self.get().await?));
		}
		let mut stream = self.on(event)?;
		Ok(stream.next().await)
	}

	/// Start building a query on this node's children
	pub fn query(&self) -> QueryBuilder {
		QueryBuilder {
			db: Arc::clone(&self.db),
			request: QueryRequest { path: self.path.clone(), ..QueryRequest::default() },
			error: None,
		}
	}

	/// Reflection: kind, existence, address and revision metadata
	pub async fn reflect_info(&self) -> DbResult<NodeInfo> {
		self.db.validate_concrete(&self.path, "reflect")?;
		self.db.engine.get_node_info(&self.path).await
	}

	/// Reflection: paged listing of direct children
	pub async fn reflect_children(&self, skip: usize, limit: usize) -> DbResult<Vec<NodeInfo>> {
		self.db.validate_concrete(&self.path, "reflect")?;
		let mut children = Vec::new();
		let mut seen = 0usize;
		self.db
			.engine
			.get_children(&self.path, None, |info| {
				seen += 1;
				if seen <= skip {
					return true;
				}
				children.push(info);
				limit == 0 || children.len() < limit
			})
			.await?;
		Ok(children)
	}

	/// Export the subtree as round-trippable JSON with typed annotations
	pub async fn export(&self) -> DbResult<serde_json::Value> {
		let snapshot = self.get().await?;
		Ok(snapshot
			.val()
			.map(|v| v.to_exported_json())
			.unwrap_or(serde_json::Value::Null))
	}
}

/// Stream of events for one subscription. Dropping the stream removes the
/// subscription.
pub struct EventStream {
	db: Arc<DbInner>,
	registry: Arc<SubscriptionRegistry>,
	id: u64,
	receiver: mpsc::UnboundedReceiver<DataEvent>,
}

impl EventStream {
	/// Next event as a snapshot; None when the stream ended
	pub async fn next(&mut self) -> Option<DataSnapshot> {
		let event = self.receiver.recv().await?;
		Some(self.to_snapshot(event))
	}

	/// Next event in raw form
	pub async fn next_event(&mut self) -> Option<DataEvent> {
		self.receiver.recv().await
	}

	/// Non-blocking poll used to assert absence of events in tests
	pub fn try_next(&mut self) -> Option<DataSnapshot> {
		self.receiver.try_recv().ok().map(|event| self.to_snapshot(event))
	}

	fn to_snapshot(&self, event: DataEvent) -> DataSnapshot {
		let reference = DataReference::new(Arc::clone(&self.db), &event.path);
		DataSnapshot::from_event(
			reference,
			event.event,
			event.value,
			event.previous,
			event.mutations,
			event.context,
		)
	}

	/// Stop the subscription
	pub fn stop(self) {
		// Drop handles the unsubscribe
	}
}

impl Drop for EventStream {
	fn drop(&mut self) {
		self.registry.unsubscribe(self.id);
	}
}

/// Results of a live query: the current matches plus the change monitor
pub struct LiveQueryResults {
	pub snapshots: Vec<DataSnapshot>,
	pub monitor: QueryMonitor,
}

/// Fluent query builder over a node's children
pub struct QueryBuilder {
	db: Arc<DbInner>,
	request: QueryRequest,
	error: Option<DbError>,
}

impl QueryBuilder {
	/// Add a filter; `op` is one of the standard operators or a
	/// specialized `<indexType>:<op>`
	pub fn filter(mut self, key: &str, op: &str, compare: impl Into<Value>) -> Self {
		match QueryOp::parse(op) {
			Ok(op) => self.request.filters.push(QueryFilter {
				key: key.to_string(),
				op,
				compare: compare.into(),
			}),
			Err(e) => self.error = self.error.take().or(Some(e)),
		}
		self
	}

	/// Add a sort key
	pub fn sort(mut self, key: &str, ascending: bool) -> Self {
		self.request
			.order
			.push(QueryOrder { key: key.to_string(), ascending });
		self
	}

	pub fn skip(mut self, n: usize) -> Self {
		self.request.skip = n;
		self
	}

	pub fn take(mut self, n: usize) -> Self {
		self.request.take = n;
		self
	}

	fn into_request(self) -> DbResult<(Arc<DbInner>, QueryRequest)> {
		match self.error {
			Some(e) => Err(e),
			None => Ok((self.db, self.request)),
		}
	}

	/// Run the query, loading matched values
	pub async fn get(self) -> DbResult<Vec<DataSnapshot>> {
		let (db, request) = self.into_request()?;
		let results =
			execute_query(&db.engine, request, QueryExecOptions::default()).await?;
		Ok(results
			.rows
			.into_iter()
			.map(|row| {
				DataSnapshot::new(DataReference::new(Arc::clone(&db), &row.path), row.value)
			})
			.collect())
	}

	/// Run the query, returning references only
	pub async fn get_refs(self) -> DbResult<Vec<DataReference>> {
		let (db, request) = self.into_request()?;
		let options = QueryExecOptions { snapshots: false, ..QueryExecOptions::default() };
		let results = execute_query(&db.engine, request, options).await?;
		Ok(results
			.rows
			.into_iter()
			.map(|row| DataReference::new(Arc::clone(&db), &row.path))
			.collect())
	}

	/// Number of matches
	pub async fn count(self) -> DbResult<usize> {
		let (db, request) = self.into_request()?;
		let options = QueryExecOptions { snapshots: false, ..QueryExecOptions::default() };
		let results = execute_query(&db.engine, request, options).await?;
		Ok(results.rows.len())
	}

	/// Remove every matched node; returns how many were removed
	pub async fn remove(self) -> DbResult<usize> {
		let refs = self.get_refs().await?;
		let count = refs.len();
		for reference in refs {
			reference.remove().await?;
		}
		Ok(count)
	}

	/// Run the query and keep watching: matches entering/changing/leaving
	/// the result set are reported through the monitor
	pub async fn monitor(self, monitor: MonitorOptions) -> DbResult<LiveQueryResults> {
		let (db, request) = self.into_request()?;
		let options = QueryExecOptions { monitor, ..QueryExecOptions::default() };
		let results = execute_query(&db.engine, request, options).await?;
		let snapshots = results
			.rows
			.into_iter()
			.map(|row| {
				DataSnapshot::new(DataReference::new(Arc::clone(&db), &row.path), row.value)
			})
			.collect();
		let monitor = results
			.monitor
			.expect("monitor requested but not started");
		Ok(LiveQueryResults { snapshots, monitor })
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::api::Database;
	use crate::config::DatabaseConfig;
	use crate::object;

	async fn db() -> Database {
		Database::in_memory(DatabaseConfig::default()).await.unwrap()
	}

	#[tokio::test]
	async fn test_reference_navigation() {
		let db = db().await;
		let posts = db.reference("users/alice/posts");
		assert_eq!(posts.key(), Some("posts".to_string()));
		assert_eq!(posts.parent().unwrap().path(), "users/alice");
		assert_eq!(posts.child("p1/title").path(), "users/alice/posts/p1/title");
		assert_eq!(db.reference("arr").child("[2]").path(), "arr[2]");
		assert!(db.root().parent().is_none());
	}

	#[tokio::test]
	async fn test_set_update_remove() {
		let db = db().await;
		let alice = db.reference("users/alice");
		alice.set(object! { "name" => "alice", "age" => 30 }).await.unwrap();
		alice.update(object! { "age" => 31 }).await.unwrap();

		let snapshot = alice.get().await.unwrap();
		assert_eq!(snapshot.val(), Some(&object! { "name" => "alice", "age" => 31 }));

		assert!(alice.update(Value::from(1)).await.is_err());

		alice.remove().await.unwrap();
		assert!(!alice.exists().await.unwrap());
	}

	#[tokio::test]
	async fn test_push_generates_sortable_keys() {
		let db = db().await;
		let chat = db.reference("chat");
		let first = chat.push(Some(object! { "text" => "hi" })).await.unwrap();
		let second = chat.push(Some(object! { "text" => "there" })).await.unwrap();
		assert!(first.key().unwrap() < second.key().unwrap());
		assert_eq!(chat.count().await.unwrap(), 2);

		// push without a value only reserves the reference
		let reserved = chat.push(None).await.unwrap();
		assert!(!reserved.exists().await.unwrap());
		assert_eq!(chat.count().await.unwrap(), 2);
	}

	#[tokio::test]
	async fn test_value_event_stream() {
		let db = db().await;
		let alice = db.reference("users/alice");
		let mut stream = alice.on("value").unwrap();

		alice.set(object! { "age" => 30 }).await.unwrap();
		let snapshot = stream.next().await.unwrap();
		assert_eq!(snapshot.val(), Some(&object! { "age" => 30 }));
		assert_eq!(snapshot.previous(), None);
		assert_eq!(snapshot.event(), Some(EventType::Value));

		alice.update(object! { "age" => 31 }).await.unwrap();
		let snapshot = stream.next().await.unwrap();
		assert_eq!(snapshot.previous(), Some(&object! { "age" => 30 }));
		assert_eq!(snapshot.val(), Some(&object! { "age" => 31 }));

		// Unrelated writes do not reach this subscriber
		db.reference("users/bob").set(object! { "age" => 1 }).await.unwrap();
		assert!(stream.try_next().is_none());
	}

	#[tokio::test]
	async fn test_event_stream_unsubscribes_on_drop() {
		let db = db().await;
		let stream = db.reference("users").on("child_added").unwrap();
		assert_eq!(db.stats().subscriber_count, 1);
		drop(stream);
		assert_eq!(db.stats().subscriber_count, 0);
	}

	#[tokio::test]
	async fn test_context_propagates_to_events() {
		let db = db().await;
		let tagged = db
			.reference("doc")
			.with_context(serde_json::json!({ "source": "sync" }));
		let mut stream = db.reference("doc").on("value").unwrap();

		tagged.set(object! { "a" => 1 }).await.unwrap();
		let snapshot = stream.next().await.unwrap();
		assert_eq!(snapshot.context()["source"], "sync");
	}

	#[tokio::test]
	async fn test_transaction_retry_scenario() {
		let db = db().await;
		let counter = db.reference("counter");

		let increment = |current: Option<Value>| {
			let n = current.and_then(|v| v.as_number()).unwrap_or(0.0);
			Some(Value::from(n + 1.0))
		};

		let (a, b) = tokio::join!(counter.transaction(increment), counter.transaction(increment));
		a.unwrap();
		b.unwrap();

		let snapshot = counter.get().await.unwrap();
		assert_eq!(snapshot.val(), Some(&Value::from(2)));
	}

	#[tokio::test]
	async fn test_reflect_children_paging() {
		let db = db().await;
		for i in 0..5 {
			db.reference(&format!("items/i{}", i)).set(i).await.unwrap();
		}
		let page = db.reference("items").reflect_children(1, 2).await.unwrap();
		assert_eq!(page.len(), 2);
		assert_eq!(page[0].path, "items/i1");
		assert_eq!(page[1].path, "items/i2");
	}

	#[tokio::test]
	async fn test_export_roundtrip() {
		let db = db().await;
		db.reference("doc")
			.set(object! {
				"when" => Value::datetime_ms(1_700_000_000_000),
				"name" => "x",
			})
			.await
			.unwrap();
		let exported = db.reference("doc").export().await.unwrap();
		let reimported = Value::from_exported_json(exported);
		assert_eq!(
			reimported,
			object! { "when" => Value::datetime_ms(1_700_000_000_000), "name" => "x" }
		);
	}

	#[tokio::test]
	async fn test_query_builder() {
		let db = db().await;
		for (id, likes) in [("p1", 10), ("p2", 3), ("p3", 25)] {
			db.reference(&format!("posts/{}", id))
				.set(object! { "likes" => likes })
				.await
				.unwrap();
		}

		let snapshots = db
			.reference("posts")
			.query()
			.filter("likes", ">", 5)
			.sort("likes", false)
			.get()
			.await
			.unwrap();
		let paths: Vec<&str> = snapshots.iter().map(|s| s.reference().path()).collect();
		assert_eq!(paths, vec!["posts/p3", "posts/p1"]);

		let count = db
			.reference("posts")
			.query()
			.filter("likes", "<", 5)
			.count()
			.await
			.unwrap();
		assert_eq!(count, 1);

		// Bad operator surfaces at execution
		let result = db.reference("posts").query().filter("likes", "~", 1).get().await;
		assert!(matches!(result, Err(DbError::InvalidArgument(_))));

		let removed = db
			.reference("posts")
			.query()
			.filter("likes", ">", 5)
			.remove()
			.await
			.unwrap();
		assert_eq!(removed, 2);
		assert_eq!(db.reference("posts").count().await.unwrap(), 1);
	}
}
