// Integration tests for the live event system

use canopy::{object, EventType, PathKey, Value};

mod common;

#[tokio::test]
async fn test_subscription_granularity() {
	let db = common::test_db().await;
	db.reference("users/alice").set(object! { "name" => "alice" }).await.unwrap();
	db.reference("users/bob").set(object! { "name" => "bob" }).await.unwrap();

	let mut events = db.reference("users/alice").on("value").unwrap();

	// A write on the subscribed path fires exactly once with old and new
	db.reference("users/alice").update(object! { "age" => 30 }).await.unwrap();
	let snapshot = common::within_timeout(events.next()).await;
	assert_eq!(snapshot.previous(), Some(&object! { "name" => "alice" }));
	assert_eq!(
		snapshot.val(),
		Some(&object! { "name" => "alice", "age" => 30 })
	);

	// A write elsewhere fires zero times
	db.reference("users/bob").update(object! { "age" => 31 }).await.unwrap();
	assert!(events.try_next().is_none());
}

#[tokio::test]
async fn test_value_event_from_ancestor_write() {
	let db = common::test_db().await;
	let mut events = db.reference("users/alice/name").on("value").unwrap();

	// The subscriber sits deeper than the write; the engine descends to it
	db.reference("users/alice")
		.set(object! { "name" => "alice", "age" => 30 })
		.await
		.unwrap();
	let snapshot = common::within_timeout(events.next()).await;
	assert_eq!(snapshot.val(), Some(&Value::from("alice")));
	assert_eq!(snapshot.reference().path(), "users/alice/name");

	// An ancestor write that leaves the subscribed value untouched is silent
	db.reference("users/alice").update(object! { "age" => 31 }).await.unwrap();
	assert!(events.try_next().is_none());
}

#[tokio::test]
async fn test_child_events() {
	let db = common::test_db().await;
	db.reference("users/alice").set(object! { "n" => 1 }).await.unwrap();

	let mut added = db.reference("users").on("child_added").unwrap();
	let mut changed = db.reference("users").on("child_changed").unwrap();
	let mut removed = db.reference("users").on("child_removed").unwrap();

	db.reference("users/bob").set(object! { "n" => 2 }).await.unwrap();
	let event = common::within_timeout(added.next()).await;
	assert_eq!(event.reference().path(), "users/bob");
	assert_eq!(event.val(), Some(&object! { "n" => 2 }));

	db.reference("users/alice").update(object! { "n" => 10 }).await.unwrap();
	let event = common::within_timeout(changed.next()).await;
	assert_eq!(event.reference().path(), "users/alice");
	assert_eq!(event.previous(), Some(&object! { "n" => 1 }));

	db.reference("users/bob").remove().await.unwrap();
	let event = common::within_timeout(removed.next()).await;
	assert_eq!(event.reference().path(), "users/bob");
	assert_eq!(event.previous(), Some(&object! { "n" => 2 }));
	assert!(event.val().is_none());
}

#[tokio::test]
async fn test_wildcard_subscription_binds_keys() {
	let db = common::test_db().await;
	let mut events = db.reference("users/$uid/posts").on("child_added").unwrap();

	db.reference("users/alice/posts/p1")
		.set(object! { "title" => "hello" })
		.await
		.unwrap();
	let event = common::within_timeout(events.next()).await;
	assert_eq!(event.reference().path(), "users/alice/posts/p1");
}

#[tokio::test]
async fn test_mutated_events_per_leaf() {
	let db = common::test_db().await;
	db.reference("doc")
		.set(object! { "a" => 1, "nested" => object! { "x" => 1, "y" => 2 } })
		.await
		.unwrap();

	let mut events = db.reference("doc").on("mutated").unwrap();
	db.reference("doc")
		.update(object! { "a" => 2, "nested" => object! { "x" => 9, "y" => 2 } })
		.await
		.unwrap();

	let mut changed_paths = Vec::new();
	for _ in 0..2 {
		let event = common::within_timeout(events.next()).await;
		changed_paths.push(event.reference().path().to_string());
	}
	changed_paths.sort();
	assert_eq!(changed_paths, vec!["doc/a", "doc/nested/x"]);
	assert!(events.try_next().is_none());
}

#[tokio::test]
async fn test_mutations_event_batches() {
	let db = common::test_db().await;
	db.reference("doc").set(object! { "a" => 1, "b" => 2 }).await.unwrap();

	let mut events = db.reference("doc").on("mutations").unwrap();
	db.reference("doc")
		.update(object! { "a" => 10, "c" => 3 })
		.await
		.unwrap();

	let snapshot = common::within_timeout(events.next()).await;
	assert_eq!(snapshot.event(), Some(EventType::Mutations));
	let mut mutations = snapshot.mutations().to_vec();
	mutations.sort_by_key(|m| m.target.clone());
	assert_eq!(mutations.len(), 2);
	assert_eq!(mutations[0].target, vec![PathKey::Key("a".to_string())]);
	assert_eq!(mutations[0].prev, Some(Value::from(1)));
	assert_eq!(mutations[0].val, Some(Value::from(10)));
	assert_eq!(mutations[1].target, vec![PathKey::Key("c".to_string())]);
	assert_eq!(mutations[1].prev, None);
	assert_eq!(mutations[1].val, Some(Value::from(3)));
}

#[tokio::test]
async fn test_array_mutations_are_atomic() {
	let db = common::test_db().await;
	db.reference("doc")
		.set(object! { "tags" => vec!["a", "b"] })
		.await
		.unwrap();

	let mut events = db.reference("doc").on("mutated").unwrap();
	db.reference("doc")
		.set(object! { "tags" => vec!["a", "c"] })
		.await
		.unwrap();

	// One event on the array path, not one per element
	let event = common::within_timeout(events.next()).await;
	assert_eq!(event.reference().path(), "doc/tags");
	assert_eq!(event.previous(), Some(&Value::from(vec!["a", "b"])));
	assert_eq!(event.val(), Some(&Value::from(vec!["a", "c"])));
	assert!(events.try_next().is_none());
}

#[tokio::test]
async fn test_notify_events_carry_no_payload() {
	let db = common::test_db().await;
	let mut events = db.reference("users").on("notify_child_added").unwrap();

	db.reference("users/alice").set(object! { "n" => 1 }).await.unwrap();
	let event = common::within_timeout(events.next()).await;
	assert_eq!(event.reference().path(), "users/alice");
	assert!(event.val().is_none());
	assert!(event.previous().is_none());
	assert_eq!(event.event(), Some(EventType::NotifyChildAdded));
}

#[tokio::test]
async fn test_event_ordering_deepest_first() {
	let db = common::test_db().await;
	db.reference("users/alice").set(object! { "age" => 1 }).await.unwrap();

	let mut child_events = db.reference("users/alice").on("value").unwrap();
	let mut parent_events = db.reference("users").on("child_changed").unwrap();

	db.reference("users/alice/age").set(2).await.unwrap();

	// The value event on the child is dispatched before the child_changed
	// on its parent
	let child_snapshot = common::within_timeout(child_events.next()).await;
	let parent_snapshot = common::within_timeout(parent_events.next()).await;
	assert_eq!(child_snapshot.val(), Some(&object! { "age" => 2 }));
	assert_eq!(parent_snapshot.reference().path(), "users/alice");
}

#[tokio::test]
async fn test_context_reaches_subscribers() {
	let db = common::test_db().await;
	let mut events = db.reference("doc").on("value").unwrap();

	db.reference("doc")
		.with_context(serde_json::json!({ "proxy": { "id": "abc", "source": "test" } }))
		.set(object! { "a" => 1 })
		.await
		.unwrap();

	let snapshot = common::within_timeout(events.next()).await;
	assert_eq!(snapshot.context()["proxy"]["id"], "abc");
}

#[tokio::test]
async fn test_unsubscribed_stream_stops_delivery() {
	let db = common::test_db().await;
	let events = db.reference("doc").on("value").unwrap();
	assert_eq!(db.stats().subscriber_count, 1);

	events.stop();
	assert_eq!(db.stats().subscriber_count, 0);

	// Writes after stop dispatch to nobody
	db.reference("doc").set(object! { "a" => 1 }).await.unwrap();
	assert_eq!(db.stats().events_dispatched, 0);
}
