//! Database configuration

use std::time::Duration;

/// Configuration for a database instance
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
	/// Maximum serialized size in bytes for a child value to be stored
	/// inline in its parent's record. Larger values get a dedicated record.
	pub max_inline_value_size: usize,

	/// Drop `Null` values nested inside array items instead of rejecting
	/// the write with an invalid-value error
	pub remove_void_properties: bool,

	/// How long a granted lock may be held before it is forcibly expired.
	/// A warning is logged every `lock_timeout / 3`.
	pub lock_timeout: Duration,

	/// Maximum time a lock request may wait in the queue before failing
	pub lock_queue_timeout: Duration,

	/// Block writes until affected indexes have been updated. When false,
	/// index updates are detached and complete in the background.
	pub wait_for_index_updates: bool,

	/// Capacity hint for the event dispatch queue
	pub event_queue_size: usize,
}

impl DatabaseConfig {
	/// Configuration tuned for many small leaf values (chat trees, counters).
	/// Lowers the inline threshold so small children stay individually addressable.
	pub fn for_small_values() -> Self {
		Self { max_inline_value_size: 16, ..Self::default() }
	}

	/// Configuration tuned for backends with large per-record overhead.
	/// Raises the inline threshold so more children ride along with their parent.
	pub fn for_large_records() -> Self {
		Self { max_inline_value_size: 255, ..Self::default() }
	}

	/// Set the inline threshold
	pub fn with_max_inline_value_size(mut self, size: usize) -> Self {
		self.max_inline_value_size = size;
		self
	}

	/// Set the void-property policy
	pub fn with_remove_void_properties(mut self, remove: bool) -> Self {
		self.remove_void_properties = remove;
		self
	}

	/// Set the lock timeout
	pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
		self.lock_timeout = timeout;
		self
	}

	/// Set the index update policy
	pub fn with_wait_for_index_updates(mut self, wait: bool) -> Self {
		self.wait_for_index_updates = wait;
		self
	}

	/// Validate configuration parameters
	pub fn validate(&self) -> Result<(), String> {
		if self.max_inline_value_size == 0 {
			return Err("Inline value size must be greater than 0".to_string());
		}

		if self.max_inline_value_size > u16::MAX as usize {
			return Err("Inline value size cannot exceed 65535 bytes".to_string());
		}

		if self.lock_timeout.is_zero() {
			return Err("Lock timeout must be greater than 0".to_string());
		}

		if self.lock_queue_timeout.is_zero() {
			return Err("Lock queue timeout must be greater than 0".to_string());
		}

		if self.event_queue_size == 0 {
			return Err("Event queue size must be greater than 0".to_string());
		}

		Ok(())
	}
}

impl Default for DatabaseConfig {
	fn default() -> Self {
		Self {
			max_inline_value_size: 50,
			remove_void_properties: false,
			lock_timeout: Duration::from_secs(90),
			lock_queue_timeout: Duration::from_secs(120),
			wait_for_index_updates: true,
			event_queue_size: 1000,
		}
	}
}
