// Integration tests for the redb-backed persistent backend

use canopy::{object, Database, DatabaseConfig, NodeAddress, Value};
use tempfile::TempDir;

mod common;

async fn open(dir: &TempDir) -> Database {
	Database::open(dir.path().join("test.redb"), DatabaseConfig::default())
		.await
		.expect("redb database should open")
}

#[tokio::test]
async fn test_values_survive_reopen() {
	let dir = TempDir::new().unwrap();
	{
		let db = open(&dir).await;
		db.reference("users/alice")
			.set(object! {
				"name" => "alice",
				"bio" => "y".repeat(300).as_str(),
				"tags" => vec!["admin", "staff"],
			})
			.await
			.unwrap();
	}

	let db = open(&dir).await;
	let snapshot = db.reference("users/alice").get().await.unwrap();
	assert_eq!(
		snapshot.val(),
		Some(&object! {
			"name" => "alice",
			"bio" => "y".repeat(300).as_str(),
			"tags" => vec!["admin", "staff"],
		})
	);

	// Inline/dedicated placement survives too
	let info = db.reference("users/alice/bio").reflect_info().await.unwrap();
	assert_eq!(info.address, Some(NodeAddress::Dedicated));
	let info = db.reference("users/alice/name").reflect_info().await.unwrap();
	assert_eq!(info.address, Some(NodeAddress::Inline));
}

#[tokio::test]
async fn test_same_semantics_as_memory() {
	let dir = TempDir::new().unwrap();
	let db = open(&dir).await;

	// Inline promotion behaves identically on the persistent backend
	db.reference("a/b").set("short").await.unwrap();
	assert_eq!(
		db.reference("a/b").reflect_info().await.unwrap().address,
		Some(NodeAddress::Inline)
	);
	db.reference("a/b").set("x".repeat(200).as_str()).await.unwrap();
	assert_eq!(
		db.reference("a/b").reflect_info().await.unwrap().address,
		Some(NodeAddress::Dedicated)
	);

	// Array constraints hold
	db.reference("arr").set(Value::from(vec!["u", "v", "w"])).await.unwrap();
	let result = db.reference("arr").update(object! { "0" => Value::Null }).await;
	assert!(result.is_err());
}

#[tokio::test]
async fn test_events_on_persistent_backend() {
	let dir = TempDir::new().unwrap();
	let db = open(&dir).await;

	let mut events = db.reference("chat").on("child_added").unwrap();
	let message = db
		.reference("chat")
		.push(Some(object! { "text" => "hello" }))
		.await
		.unwrap();

	let snapshot = common::within_timeout(events.next()).await;
	assert_eq!(snapshot.reference().path(), message.path());
	assert_eq!(snapshot.val(), Some(&object! { "text" => "hello" }));
}

#[tokio::test]
async fn test_deletion_is_durable() {
	let dir = TempDir::new().unwrap();
	{
		let db = open(&dir).await;
		db.reference("doc").set(object! { "keep" => 1, "drop" => 2 }).await.unwrap();
		db.reference("doc/drop").remove().await.unwrap();
	}

	let db = open(&dir).await;
	assert_eq!(
		db.reference("doc").get().await.unwrap().val(),
		Some(&object! { "keep" => 1 })
	);
}
