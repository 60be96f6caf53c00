//! Inline value encoding
//!
//! Small direct-child values live inside their parent's stored record as
//! typed entries; anything larger, and any non-empty composite, gets a
//! dedicated record of its own. This module sizes values for that decision
//! and provides the tagged inline encoding.

use super::{PathReference, Value, ValueKind};
use serde::{Deserialize, Serialize};

/// A typed child placeholder as stored inside a composite record's value
/// map. Scalars are encoded losslessly: dates as epoch milliseconds,
/// references as absolute path strings, binary as raw bytes. Empty
/// composites are inline by definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InlineValue {
	String(String),
	Number(f64),
	Bool(bool),
	DateTime(i64),
	Binary(Vec<u8>),
	Reference(String),
	EmptyObject,
	EmptyArray,
}

impl InlineValue {
	/// The value kind this entry rehydrates to
	pub fn kind(&self) -> ValueKind {
		match self {
			InlineValue::String(_) => ValueKind::String,
			InlineValue::Number(_) => ValueKind::Number,
			InlineValue::Bool(_) => ValueKind::Boolean,
			InlineValue::DateTime(_) => ValueKind::DateTime,
			InlineValue::Binary(_) => ValueKind::Binary,
			InlineValue::Reference(_) => ValueKind::Reference,
			InlineValue::EmptyObject => ValueKind::Object,
			InlineValue::EmptyArray => ValueKind::Array,
		}
	}

	/// Encode a value for inline storage. Returns None for values that can
	/// never be inline: non-empty composites and the `Null` marker.
	pub fn encode(value: &Value) -> Option<InlineValue> {
		match value {
			Value::Null => None,
			Value::String(s) => Some(InlineValue::String(s.clone())),
			Value::Number(n) => Some(InlineValue::Number(*n)),
			Value::Bool(b) => Some(InlineValue::Bool(*b)),
			Value::DateTime(dt) => Some(InlineValue::DateTime(dt.timestamp_millis())),
			Value::Binary(bytes) => Some(InlineValue::Binary(bytes.clone())),
			Value::Reference(r) => Some(InlineValue::Reference(r.path.clone())),
			Value::Object(map) if map.is_empty() => Some(InlineValue::EmptyObject),
			Value::Array(items) if items.is_empty() => Some(InlineValue::EmptyArray),
			Value::Object(_) | Value::Array(_) => None,
		}
	}

	/// Rehydrate the native value
	pub fn decode(&self) -> Value {
		match self {
			InlineValue::String(s) => Value::String(s.clone()),
			InlineValue::Number(n) => Value::Number(*n),
			InlineValue::Bool(b) => Value::Bool(*b),
			InlineValue::DateTime(ms) => Value::datetime_ms(*ms),
			InlineValue::Binary(bytes) => Value::Binary(bytes.clone()),
			InlineValue::Reference(path) => Value::Reference(PathReference::new(path.clone())),
			InlineValue::EmptyObject => Value::object(),
			InlineValue::EmptyArray => Value::Array(Vec::new()),
		}
	}
}

/// Size of a value for the inline threshold check. Strings and path
/// references count UTF-8 bytes, binary counts raw bytes, scalars and dates
/// use their fixed widths, empty composites are free. None means the value
/// can never be inline.
pub fn serialized_size(value: &Value) -> Option<usize> {
	match value {
		Value::Null => None,
		Value::String(s) => Some(s.len()),
		Value::Reference(r) => Some(r.path.len()),
		Value::Binary(bytes) => Some(bytes.len()),
		Value::Number(_) => Some(8),
		Value::DateTime(_) => Some(8),
		Value::Bool(_) => Some(1),
		Value::Object(map) if map.is_empty() => Some(0),
		Value::Array(items) if items.is_empty() => Some(0),
		Value::Object(_) | Value::Array(_) => None,
	}
}

/// Whether a value fits inline in its parent's record under the given
/// threshold
pub fn fits_inline(value: &Value, max_inline_value_size: usize) -> bool {
	match serialized_size(value) {
		Some(size) => size <= max_inline_value_size,
		None => false,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::object;

	#[test]
	fn test_fits_inline_scalars() {
		assert!(fits_inline(&Value::from("short"), 50));
		assert!(!fits_inline(&Value::from("x".repeat(51).as_str()), 50));
		assert!(fits_inline(&Value::from(3.25), 50));
		assert!(fits_inline(&Value::from(true), 1));
		assert!(fits_inline(&Value::datetime_ms(0), 8));
		assert!(!fits_inline(&Value::datetime_ms(0), 7));
		assert!(fits_inline(&Value::Binary(vec![0; 50]), 50));
		assert!(!fits_inline(&Value::Binary(vec![0; 51]), 50));
	}

	#[test]
	fn test_fits_inline_composites() {
		// Empty composites are always inline; non-empty never are
		assert!(fits_inline(&Value::object(), 0));
		assert!(fits_inline(&Value::Array(Vec::new()), 0));
		assert!(!fits_inline(&object! { "a" => 1 }, 1000));
		assert!(!fits_inline(&Value::from(vec![1]), 1000));
	}

	#[test]
	fn test_null_never_inline() {
		assert_eq!(serialized_size(&Value::Null), None);
		assert!(!fits_inline(&Value::Null, usize::MAX));
	}

	#[test]
	fn test_encode_decode_roundtrip() {
		let values = vec![
			Value::from("text"),
			Value::from(42),
			Value::from(true),
			Value::datetime_ms(1_700_000_000_000),
			Value::Binary(vec![1, 2, 3]),
			Value::Reference(PathReference::new("users/alice")),
			Value::object(),
			Value::Array(Vec::new()),
		];
		for value in values {
			let entry = InlineValue::encode(&value).unwrap();
			assert_eq!(entry.kind(), value.kind().unwrap());
			assert_eq!(entry.decode(), value);
		}
	}

	#[test]
	fn test_encode_rejects_non_inline() {
		assert_eq!(InlineValue::encode(&Value::Null), None);
		assert_eq!(InlineValue::encode(&object! { "a" => 1 }), None);
		assert_eq!(InlineValue::encode(&Value::from(vec![1, 2])), None);
	}
}
