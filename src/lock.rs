//! Path-aware node locking
//!
//! All logical locks on a database are tracked in one global queue. The
//! model is deliberately coarse: at most one writer may hold a lock across
//! the whole tree, and any number of readers may coexist while no writer
//! holds one. Per-subtree write locking is possible in principle but
//! recursive parent-ward traversals (event subscribers on ancestors) make
//! it deadlock-prone, so the queue stays global and the `path` on each
//! entry is informational.
//!
//! Granted locks are monitored: a warning is logged every `lock_timeout/3`
//! the lock is still held, and after three warnings the lock is forcibly
//! expired so a stuck operation cannot wedge the queue. Operations must
//! check their lock before continuing and fail with a lock-expired error
//! when it was taken from them.

use crate::config::DatabaseConfig;
use crate::error::{DbError, DbResult};
use crate::path::parent_path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

/// State of a queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
	Pending,
	Locked,
	Expired,
}

#[derive(Debug)]
struct LockEntry {
	id: u64,
	path: String,
	tid: Uuid,
	for_writing: bool,
	comment: String,
	priority: bool,
	no_timeout: bool,
	state: LockState,
	requested_at: Instant,
	granted_at: Option<Instant>,
	warnings: u32,
	waker: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct LockQueue {
	entries: Vec<LockEntry>,
}

impl LockQueue {
	/// A request is compatible when granting it upholds the single-writer
	/// rule. Entries of the same tid never conflict with each other.
	fn is_compatible(&self, tid: Uuid, for_writing: bool) -> bool {
		self.entries.iter().all(|e| {
			e.state != LockState::Locked
				|| e.tid == tid
				|| (!for_writing && !e.for_writing)
		})
	}

	fn find(&self, id: u64) -> Option<&LockEntry> {
		self.entries.iter().find(|e| e.id == id)
	}

	fn find_mut(&mut self, id: u64) -> Option<&mut LockEntry> {
		self.entries.iter_mut().find(|e| e.id == id)
	}

	fn remove(&mut self, id: u64) {
		self.entries.retain(|e| e.id != id);
	}

	/// Grant pending requests that are now compatible. Priority requests go
	/// first; within each class, request order (FIFO) decides.
	fn process_pending(&mut self) {
		let mut order: Vec<usize> = (0..self.entries.len())
			.filter(|&i| self.entries[i].state == LockState::Pending)
			.collect();
		order.sort_by_key(|&i| {
			let e = &self.entries[i];
			(!e.priority, e.requested_at, e.id)
		});

		for i in order {
			let (tid, for_writing) = {
				let e = &self.entries[i];
				(e.tid, e.for_writing)
			};
			if self.is_compatible(tid, for_writing) {
				let entry = &mut self.entries[i];
				entry.state = LockState::Locked;
				entry.granted_at = Some(Instant::now());
				debug!(
					path = %entry.path,
					tid = %entry.tid,
					write = entry.for_writing,
					"lock granted from queue"
				);
				if let Some(waker) = entry.waker.take() {
					let _ = waker.send(());
				}
			}
		}
	}
}

struct LockerInner {
	queue: Mutex<LockQueue>,
	lock_timeout: Duration,
	queue_timeout: Duration,
	next_id: AtomicU64,
}

/// Options for a lock request
#[derive(Debug, Clone, Copy, Default)]
pub struct LockOptions {
	/// Jump ahead of non-priority pending requests
	pub priority: bool,
	/// Exempt this lock from expiry monitoring
	pub no_timeout: bool,
}

/// The database-wide lock manager
#[derive(Clone)]
pub struct NodeLocker {
	inner: Arc<LockerInner>,
}

impl NodeLocker {
	pub fn new(config: &DatabaseConfig) -> Self {
		let inner = Arc::new(LockerInner {
			queue: Mutex::new(LockQueue::default()),
			lock_timeout: config.lock_timeout,
			queue_timeout: config.lock_queue_timeout,
			next_id: AtomicU64::new(1),
		});

		// One monitor task per locker handles warnings and expiry for all
		// granted locks
		let monitor = Arc::downgrade(&inner);
		let warn_interval = config.lock_timeout / 3;
		tokio::spawn(async move {
			let tick = (warn_interval / 4).max(Duration::from_millis(50));
			loop {
				tokio::time::sleep(tick).await;
				let Some(inner) = monitor.upgrade() else {
					break;
				};
				Self::monitor_tick(&inner, warn_interval);
			}
		});

		Self { inner }
	}

	fn monitor_tick(inner: &Arc<LockerInner>, warn_interval: Duration) {
		let mut queue = inner.queue.lock().expect("lock queue poisoned");
		let now = Instant::now();
		let mut expired_any = false;

		for entry in queue.entries.iter_mut() {
			if entry.state != LockState::Locked || entry.no_timeout {
				continue;
			}
			let Some(granted_at) = entry.granted_at else {
				continue;
			};
			let held = now.duration_since(granted_at);
			let due_warnings = (held.as_millis() / warn_interval.as_millis().max(1)) as u32;
			if due_warnings > entry.warnings {
				entry.warnings = due_warnings;
				if entry.warnings >= 3 {
					warn!(
						path = %entry.path,
						tid = %entry.tid,
						comment = %entry.comment,
						held = ?held,
						"lock expired, forcibly releasing"
					);
					entry.state = LockState::Expired;
					expired_any = true;
				} else {
					warn!(
						path = %entry.path,
						tid = %entry.tid,
						comment = %entry.comment,
						held = ?held,
						"lock held too long"
					);
				}
			}
		}

		if expired_any {
			queue.process_pending();
		}
	}

	/// Acquire a lock. Grants immediately when compatible, otherwise queues
	/// the request and waits for its turn.
	pub async fn lock(
		&self,
		path: &str,
		tid: Uuid,
		for_writing: bool,
		comment: &str,
		options: LockOptions,
	) -> DbResult<NodeLock> {
		let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
		let receiver = {
			let mut queue = self.inner.queue.lock().expect("lock queue poisoned");
			let granted = queue.is_compatible(tid, for_writing);
			let (waker, receiver) = if granted {
				(None, None)
			} else {
				let (tx, rx) = oneshot::channel();
				(Some(tx), Some(rx))
			};
			queue.entries.push(LockEntry {
				id,
				path: path.to_string(),
				tid,
				for_writing,
				comment: comment.to_string(),
				priority: options.priority,
				no_timeout: options.no_timeout,
				state: if granted { LockState::Locked } else { LockState::Pending },
				requested_at: Instant::now(),
				granted_at: granted.then(Instant::now),
				warnings: 0,
				waker,
			});
			if granted {
				debug!(path, %tid, write = for_writing, comment, "lock granted");
			} else {
				debug!(path, %tid, write = for_writing, comment, "lock queued");
			}
			receiver
		};

		if let Some(receiver) = receiver {
			match tokio::time::timeout(self.inner.queue_timeout, receiver).await {
				Ok(Ok(())) => {}
				_ => {
					// Timed out or the locker went away; the grant may still
					// have raced the timeout, so check before giving up
					let mut queue = self.inner.queue.lock().expect("lock queue poisoned");
					match queue.find(id).map(|e| e.state) {
						Some(LockState::Locked) => {}
						_ => {
							queue.remove(id);
							return Err(DbError::LockTimeout {
								path: path.to_string(),
								waited: self.inner.queue_timeout,
							});
						}
					}
				}
			}
		}

		Ok(NodeLock {
			inner: Arc::clone(&self.inner),
			id,
			path: path.to_string(),
			tid,
			for_writing,
			released: false,
		})
	}

	#[cfg(test)]
	fn queue_len(&self) -> usize {
		self.inner.queue.lock().expect("lock queue poisoned").entries.len()
	}
}

/// A held (or expired) lock. Dropping the guard releases it; prefer
/// [`NodeLock::release`] so the release point is explicit.
pub struct NodeLock {
	inner: Arc<LockerInner>,
	id: u64,
	path: String,
	tid: Uuid,
	for_writing: bool,
	released: bool,
}

impl NodeLock {
	pub fn path(&self) -> &str {
		&self.path
	}

	pub fn tid(&self) -> Uuid {
		self.tid
	}

	pub fn for_writing(&self) -> bool {
		self.for_writing
	}

	/// Fail with a lock-expired error if the monitor took this lock away
	pub fn check(&self) -> DbResult<()> {
		let queue = self.inner.queue.lock().expect("lock queue poisoned");
		match queue.find(self.id) {
			Some(entry) if entry.state == LockState::Locked => Ok(()),
			Some(entry) => Err(DbError::LockExpired {
				tid: self.tid,
				path: self.path.clone(),
				held_for: entry
					.granted_at
					.map(|t| t.elapsed())
					.unwrap_or_default(),
			}),
			None => Err(DbError::LockExpired {
				tid: self.tid,
				path: self.path.clone(),
				held_for: Duration::ZERO,
			}),
		}
	}

	/// Narrow this lock to the parent path. With the global queue the move
	/// is compatible in place; if it ever is not, the lock is released and
	/// re-acquired at the parent with priority.
	pub async fn move_to_parent(self) -> DbResult<NodeLock> {
		let parent = parent_path(&self.path).ok_or_else(|| {
			DbError::invalid_argument("cannot move a root lock to its parent")
		})?;
		self.move_to(&parent).await
	}

	/// Move this lock to another path on the same trail
	pub async fn move_to(mut self, path: &str) -> DbResult<NodeLock> {
		let moved_in_place = {
			let mut queue = self.inner.queue.lock().expect("lock queue poisoned");
			match queue.find_mut(self.id) {
				Some(entry) if entry.state == LockState::Locked => {
					entry.path = path.to_string();
					true
				}
				_ => false,
			}
		};

		if moved_in_place {
			self.path = path.to_string();
			return Ok(self);
		}

		// Expired or lost; release what is left and re-acquire with priority
		let locker = NodeLocker { inner: Arc::clone(&self.inner) };
		let (tid, for_writing) = (self.tid, self.for_writing);
		self.release();
		locker
			.lock(path, tid, for_writing, "moved lock", LockOptions {
				priority: true,
				no_timeout: false,
			})
			.await
	}

	/// Release the lock and grant any pending requests that became
	/// compatible
	pub fn release(mut self) {
		self.release_inner();
	}

	fn release_inner(&mut self) {
		if self.released {
			return;
		}
		self.released = true;
		let mut queue = self.inner.queue.lock().expect("lock queue poisoned");
		queue.remove(self.id);
		queue.process_pending();
		debug!(path = %self.path, tid = %self.tid, write = self.for_writing, "lock released");
	}
}

impl Drop for NodeLock {
	fn drop(&mut self) {
		self.release_inner();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	fn test_locker() -> NodeLocker {
		NodeLocker::new(&DatabaseConfig {
			lock_timeout: Duration::from_millis(400),
			lock_queue_timeout: Duration::from_millis(500),
			..DatabaseConfig::default()
		})
	}

	#[tokio::test]
	async fn test_readers_share() {
		let locker = test_locker();
		let a = locker
			.lock("users", Uuid::new_v4(), false, "read a", LockOptions::default())
			.await
			.unwrap();
		let b = locker
			.lock("posts", Uuid::new_v4(), false, "read b", LockOptions::default())
			.await
			.unwrap();
		assert!(a.check().is_ok());
		assert!(b.check().is_ok());
		a.release();
		b.release();
		assert_eq!(locker.queue_len(), 0);
	}

	#[tokio::test]
	async fn test_writer_excludes_writer() {
		let locker = test_locker();
		let a = locker
			.lock("users", Uuid::new_v4(), true, "write a", LockOptions::default())
			.await
			.unwrap();

		let locker2 = locker.clone();
		let waiter = tokio::spawn(async move {
			locker2
				.lock("posts", Uuid::new_v4(), true, "write b", LockOptions::default())
				.await
		});

		tokio::time::sleep(Duration::from_millis(50)).await;
		assert!(!waiter.is_finished());

		a.release();
		let b = waiter.await.unwrap().unwrap();
		assert!(b.check().is_ok());
	}

	#[tokio::test]
	async fn test_reader_blocks_writer_not_reader() {
		let locker = test_locker();
		let reader = locker
			.lock("users", Uuid::new_v4(), false, "read", LockOptions::default())
			.await
			.unwrap();

		// Another reader gets in immediately
		let reader2 = locker
			.lock("users", Uuid::new_v4(), false, "read2", LockOptions::default())
			.await
			.unwrap();
		reader2.release();

		let locker2 = locker.clone();
		let writer = tokio::spawn(async move {
			locker2
				.lock("users", Uuid::new_v4(), true, "write", LockOptions::default())
				.await
		});
		tokio::time::sleep(Duration::from_millis(50)).await;
		assert!(!writer.is_finished());

		reader.release();
		assert!(writer.await.unwrap().is_ok());
	}

	#[tokio::test]
	async fn test_same_tid_is_compatible() {
		let locker = test_locker();
		let tid = Uuid::new_v4();
		let write = locker
			.lock("users", tid, true, "write", LockOptions::default())
			.await
			.unwrap();
		let read = locker
			.lock("users/alice", tid, false, "nested read", LockOptions::default())
			.await
			.unwrap();
		read.release();
		write.release();
	}

	#[tokio::test]
	async fn test_expiry() {
		let locker = test_locker();
		let held = locker
			.lock("users", Uuid::new_v4(), true, "stuck write", LockOptions::default())
			.await
			.unwrap();

		// Wait past three warning intervals so the monitor expires the lock
		tokio::time::sleep(Duration::from_millis(700)).await;
		assert!(matches!(held.check(), Err(DbError::LockExpired { .. })));

		// The queue is no longer blocked
		let next = locker
			.lock("users", Uuid::new_v4(), true, "next write", LockOptions::default())
			.await
			.unwrap();
		next.release();
	}

	#[tokio::test]
	async fn test_move_to_parent() {
		let locker = test_locker();
		let lock = locker
			.lock("users/alice/posts", Uuid::new_v4(), true, "write", LockOptions::default())
			.await
			.unwrap();
		let lock = lock.move_to_parent().await.unwrap();
		assert_eq!(lock.path(), "users/alice");
		assert!(lock.check().is_ok());
		lock.release();
	}

	#[tokio::test]
	async fn test_priority_jumps_queue() {
		let locker = test_locker();
		let held = locker
			.lock("a", Uuid::new_v4(), true, "first", LockOptions::default())
			.await
			.unwrap();

		let locker_normal = locker.clone();
		let normal = tokio::spawn(async move {
			let lock = locker_normal
				.lock("b", Uuid::new_v4(), true, "normal", LockOptions::default())
				.await
				.unwrap();
			let at = Instant::now();
			lock.release();
			at
		});
		tokio::time::sleep(Duration::from_millis(20)).await;

		let locker_priority = locker.clone();
		let priority = tokio::spawn(async move {
			let lock = locker_priority
				.lock(
					"c",
					Uuid::new_v4(),
					true,
					"priority",
					LockOptions { priority: true, no_timeout: false },
				)
				.await
				.unwrap();
			let at = Instant::now();
			lock.release();
			at
		});
		tokio::time::sleep(Duration::from_millis(20)).await;

		held.release();
		let normal_at = normal.await.unwrap();
		let priority_at = priority.await.unwrap();
		assert!(priority_at < normal_at, "priority request should be granted first");
	}
}
