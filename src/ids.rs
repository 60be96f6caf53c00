//! Time-sortable id generation
//!
//! Revisions and push keys share one id shape: a fixed-width base-36
//! millisecond timestamp followed by a random tail, so lexical order equals
//! creation order at millisecond granularity.

use chrono::Utc;

const TIMESTAMP_WIDTH: usize = 9;
const RANDOM_WIDTH: usize = 8;
const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn to_base36(mut n: u128, width: usize) -> String {
	let mut buf = vec![b'0'; width];
	let mut pos = width;
	while n > 0 && pos > 0 {
		pos -= 1;
		buf[pos] = ALPHABET[(n % 36) as usize];
		n /= 36;
	}
	String::from_utf8(buf).expect("base36 output is ascii")
}

/// Generate a time-sortable id, used for revisions and push keys
pub fn time_sortable_id() -> String {
	let millis = Utc::now().timestamp_millis().max(0) as u128;
	let random = u128::from_le_bytes(*uuid::Uuid::new_v4().as_bytes());

	let mut id = to_base36(millis, TIMESTAMP_WIDTH);
	id.push_str(&to_base36(random % 36u128.pow(RANDOM_WIDTH as u32), RANDOM_WIDTH));
	id
}

/// Generate a child key for `push()` operations
pub fn push_key() -> String {
	time_sortable_id()
}
