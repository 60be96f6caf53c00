// Shared helpers for integration tests
#![allow(dead_code)]

use canopy::{Database, DatabaseConfig};
use once_cell::sync::Lazy;
use std::time::Duration;

static TRACING: Lazy<()> = Lazy::new(|| {
	let _ = tracing_subscriber::fmt().with_test_writer().try_init();
});

/// Open a fresh in-memory database
pub async fn test_db() -> Database {
	Lazy::force(&TRACING);
	Database::in_memory(DatabaseConfig::default())
		.await
		.expect("in-memory database should open")
}

/// Open a fresh in-memory database with a custom configuration
pub async fn test_db_with(config: DatabaseConfig) -> Database {
	Lazy::force(&TRACING);
	Database::in_memory(config)
		.await
		.expect("in-memory database should open")
}

/// Await a value from an event source with a sane upper bound
pub async fn within_timeout<T>(fut: impl std::future::Future<Output = Option<T>>) -> T {
	tokio::time::timeout(Duration::from_secs(2), fut)
		.await
		.expect("timed out waiting for event")
		.expect("event source closed unexpectedly")
}
