//! Value model
//!
//! Every node in the tree holds one of nine value kinds: object, array,
//! number, boolean, string, datetime, binary, path reference, or it is
//! absent. `Value::Null` is the deletion marker: writing it removes the
//! node, and it is never stored.

pub mod codec;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A reference to another path in the same database. Stored as a plain
/// string; references never participate in ownership and need no cycle
/// handling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathReference {
	pub path: String,
}

impl PathReference {
	pub fn new(path: impl Into<String>) -> Self {
		Self { path: path.into() }
	}
}

impl fmt::Display for PathReference {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.path)
	}
}

/// Storable value kinds with their wire codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ValueKind {
	Object = 1,
	Array = 2,
	Number = 3,
	Boolean = 4,
	String = 5,
	DateTime = 6,
	Binary = 8,
	Reference = 9,
}

impl ValueKind {
	pub fn code(self) -> u8 {
		self as u8
	}

	pub fn from_code(code: u8) -> Option<Self> {
		match code {
			1 => Some(ValueKind::Object),
			2 => Some(ValueKind::Array),
			3 => Some(ValueKind::Number),
			4 => Some(ValueKind::Boolean),
			5 => Some(ValueKind::String),
			6 => Some(ValueKind::DateTime),
			8 => Some(ValueKind::Binary),
			9 => Some(ValueKind::Reference),
			_ => None,
		}
	}

	pub fn is_composite(self) -> bool {
		matches!(self, ValueKind::Object | ValueKind::Array)
	}

	pub fn name(self) -> &'static str {
		match self {
			ValueKind::Object => "object",
			ValueKind::Array => "array",
			ValueKind::Number => "number",
			ValueKind::Boolean => "boolean",
			ValueKind::String => "string",
			ValueKind::DateTime => "datetime",
			ValueKind::Binary => "binary",
			ValueKind::Reference => "reference",
		}
	}
}

/// A value in the tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
	/// Deletion marker; writing `Null` at a path removes the node there
	Null,
	Bool(bool),
	Number(f64),
	String(String),
	DateTime(DateTime<Utc>),
	Binary(Vec<u8>),
	Reference(PathReference),
	Array(Vec<Value>),
	Object(BTreeMap<String, Value>),
}

impl Value {
	/// The stored kind of this value; None for the `Null` marker
	pub fn kind(&self) -> Option<ValueKind> {
		match self {
			Value::Null => None,
			Value::Bool(_) => Some(ValueKind::Boolean),
			Value::Number(_) => Some(ValueKind::Number),
			Value::String(_) => Some(ValueKind::String),
			Value::DateTime(_) => Some(ValueKind::DateTime),
			Value::Binary(_) => Some(ValueKind::Binary),
			Value::Reference(_) => Some(ValueKind::Reference),
			Value::Array(_) => Some(ValueKind::Array),
			Value::Object(_) => Some(ValueKind::Object),
		}
	}

	pub fn is_null(&self) -> bool {
		matches!(self, Value::Null)
	}

	pub fn is_composite(&self) -> bool {
		matches!(self, Value::Object(_) | Value::Array(_))
	}

	pub fn is_empty_composite(&self) -> bool {
		match self {
			Value::Object(map) => map.is_empty(),
			Value::Array(items) => items.is_empty(),
			_ => false,
		}
	}

	/// Direct child by string key (objects) or parsed index (arrays)
	pub fn child(&self, key: &str) -> Option<&Value> {
		match self {
			Value::Object(map) => map.get(key),
			Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
			_ => None,
		}
	}

	/// Number of direct children for composites, 0 otherwise
	pub fn child_count(&self) -> usize {
		match self {
			Value::Object(map) => map.len(),
			Value::Array(items) => items.len(),
			_ => 0,
		}
	}

	pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
		match self {
			Value::Object(map) => Some(map),
			_ => None,
		}
	}

	pub fn as_array(&self) -> Option<&Vec<Value>> {
		match self {
			Value::Array(items) => Some(items),
			_ => None,
		}
	}

	pub fn as_str(&self) -> Option<&str> {
		match self {
			Value::String(s) => Some(s),
			_ => None,
		}
	}

	pub fn as_number(&self) -> Option<f64> {
		match self {
			Value::Number(n) => Some(*n),
			_ => None,
		}
	}

	pub fn as_bool(&self) -> Option<bool> {
		match self {
			Value::Bool(b) => Some(*b),
			_ => None,
		}
	}

	/// Total order used for sorting and range queries: values rank by type
	/// first, then by natural per-type ordering (numbers numerically,
	/// strings lexically, datetimes by instant, binary byte-wise)
	pub fn natural_cmp(&self, other: &Value) -> std::cmp::Ordering {
		fn rank(v: &Value) -> u8 {
			match v {
				Value::Null => 0,
				Value::Bool(_) => 1,
				Value::Number(_) => 2,
				Value::String(_) => 3,
				Value::DateTime(_) => 4,
				Value::Binary(_) => 5,
				Value::Reference(_) => 6,
				Value::Array(_) => 7,
				Value::Object(_) => 8,
			}
		}
		match (self, other) {
			(Value::Bool(a), Value::Bool(b)) => a.cmp(b),
			(Value::Number(a), Value::Number(b)) => a.total_cmp(b),
			(Value::String(a), Value::String(b)) => a.cmp(b),
			(Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
			(Value::Binary(a), Value::Binary(b)) => a.cmp(b),
			(Value::Reference(a), Value::Reference(b)) => a.path.cmp(&b.path),
			(Value::Array(a), Value::Array(b)) => {
				for (x, y) in a.iter().zip(b.iter()) {
					let ord = x.natural_cmp(y);
					if ord != std::cmp::Ordering::Equal {
						return ord;
					}
				}
				a.len().cmp(&b.len())
			}
			(Value::Object(a), Value::Object(b)) => {
				let mut lhs = a.iter();
				let mut rhs = b.iter();
				loop {
					match (lhs.next(), rhs.next()) {
						(None, None) => return std::cmp::Ordering::Equal,
						(None, Some(_)) => return std::cmp::Ordering::Less,
						(Some(_), None) => return std::cmp::Ordering::Greater,
						(Some((ka, va)), Some((kb, vb))) => {
							let ord = ka.cmp(kb).then_with(|| va.natural_cmp(vb));
							if ord != std::cmp::Ordering::Equal {
								return ord;
							}
						}
					}
				}
			}
			(a, b) => rank(a).cmp(&rank(b)),
		}
	}

	/// Build an empty object
	pub fn object() -> Value {
		Value::Object(BTreeMap::new())
	}

	/// Build a datetime value from epoch milliseconds
	pub fn datetime_ms(ms: i64) -> Value {
		Value::DateTime(Utc.timestamp_millis_opt(ms).single().unwrap_or_default())
	}

	/// Convert a plain JSON value. Numbers become `Number`, everything maps
	/// one-to-one; there is no way to express datetime/binary/reference in
	/// plain JSON, use [`Value::from_exported_json`] for those.
	pub fn from_json(json: serde_json::Value) -> Value {
		match json {
			serde_json::Value::Null => Value::Null,
			serde_json::Value::Bool(b) => Value::Bool(b),
			serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
			serde_json::Value::String(s) => Value::String(s),
			serde_json::Value::Array(items) => {
				Value::Array(items.into_iter().map(Value::from_json).collect())
			}
			serde_json::Value::Object(map) => Value::Object(
				map.into_iter().map(|(k, v)| (k, Value::from_json(v))).collect(),
			),
		}
	}

	/// Convert to plain JSON. Datetimes render as ISO-8601 strings, binary
	/// as number arrays, references as their path string; use
	/// [`Value::to_exported_json`] for a round-trippable form.
	pub fn to_json(&self) -> serde_json::Value {
		match self {
			Value::Null => serde_json::Value::Null,
			Value::Bool(b) => serde_json::Value::Bool(*b),
			Value::Number(n) => serde_json::Number::from_f64(*n)
				.map(serde_json::Value::Number)
				.unwrap_or(serde_json::Value::Null),
			Value::String(s) => serde_json::Value::String(s.clone()),
			Value::DateTime(dt) => serde_json::Value::String(dt.to_rfc3339()),
			Value::Binary(bytes) => {
				serde_json::Value::Array(bytes.iter().map(|b| serde_json::Value::from(*b)).collect())
			}
			Value::Reference(r) => serde_json::Value::String(r.path.clone()),
			Value::Array(items) => {
				serde_json::Value::Array(items.iter().map(Value::to_json).collect())
			}
			Value::Object(map) => serde_json::Value::Object(
				map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
			),
		}
	}

	/// Round-trippable JSON export. Datetime, binary and reference values
	/// are written as `{".type": ..., ".value": ...}` tagged objects.
	pub fn to_exported_json(&self) -> serde_json::Value {
		match self {
			Value::DateTime(dt) => serde_json::json!({
				".type": "datetime",
				".value": dt.timestamp_millis(),
			}),
			Value::Binary(bytes) => serde_json::json!({
				".type": "binary",
				".value": bytes,
			}),
			Value::Reference(r) => serde_json::json!({
				".type": "reference",
				".value": r.path,
			}),
			Value::Array(items) => {
				serde_json::Value::Array(items.iter().map(Value::to_exported_json).collect())
			}
			Value::Object(map) => serde_json::Value::Object(
				map.iter().map(|(k, v)| (k.clone(), v.to_exported_json())).collect(),
			),
			other => other.to_json(),
		}
	}

	/// Parse the export format produced by [`Value::to_exported_json`]
	pub fn from_exported_json(json: serde_json::Value) -> Value {
		if let serde_json::Value::Object(map) = &json {
			if let (Some(serde_json::Value::String(tag)), Some(raw)) =
				(map.get(".type"), map.get(".value"))
			{
				match tag.as_str() {
					"datetime" => {
						if let Some(ms) = raw.as_i64() {
							return Value::datetime_ms(ms);
						}
					}
					"binary" => {
						if let serde_json::Value::Array(items) = raw {
							let bytes = items
								.iter()
								.filter_map(|v| v.as_u64().map(|b| b as u8))
								.collect();
							return Value::Binary(bytes);
						}
					}
					"reference" => {
						if let Some(path) = raw.as_str() {
							return Value::Reference(PathReference::new(path));
						}
					}
					_ => {}
				}
			}
		}
		match json {
			serde_json::Value::Array(items) => {
				Value::Array(items.into_iter().map(Value::from_exported_json).collect())
			}
			serde_json::Value::Object(map) => Value::Object(
				map.into_iter()
					.map(|(k, v)| (k, Value::from_exported_json(v)))
					.collect(),
			),
			other => Value::from_json(other),
		}
	}
}

impl From<bool> for Value {
	fn from(v: bool) -> Self {
		Value::Bool(v)
	}
}

impl From<f64> for Value {
	fn from(v: f64) -> Self {
		Value::Number(v)
	}
}

impl From<i64> for Value {
	fn from(v: i64) -> Self {
		Value::Number(v as f64)
	}
}

impl From<i32> for Value {
	fn from(v: i32) -> Self {
		Value::Number(v as f64)
	}
}

impl From<u32> for Value {
	fn from(v: u32) -> Self {
		Value::Number(v as f64)
	}
}

impl From<&str> for Value {
	fn from(v: &str) -> Self {
		Value::String(v.to_string())
	}
}

impl From<String> for Value {
	fn from(v: String) -> Self {
		Value::String(v)
	}
}

impl From<DateTime<Utc>> for Value {
	fn from(v: DateTime<Utc>) -> Self {
		Value::DateTime(v)
	}
}

impl From<PathReference> for Value {
	fn from(v: PathReference) -> Self {
		Value::Reference(v)
	}
}

impl<V: Into<Value>> From<Vec<V>> for Value {
	fn from(items: Vec<V>) -> Self {
		Value::Array(items.into_iter().map(Into::into).collect())
	}
}

impl<V: Into<Value>> FromIterator<(String, V)> for Value {
	fn from_iter<T: IntoIterator<Item = (String, V)>>(iter: T) -> Self {
		Value::Object(iter.into_iter().map(|(k, v)| (k, v.into())).collect())
	}
}

/// Build an object value from key/value pairs
#[macro_export]
macro_rules! object {
	() => { $crate::value::Value::object() };
	($($key:expr => $val:expr),+ $(,)?) => {{
		let mut map = std::collections::BTreeMap::new();
		$(map.insert($key.to_string(), $crate::value::Value::from($val));)+
		$crate::value::Value::Object(map)
	}};
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_kinds_and_codes() {
		assert_eq!(Value::from("x").kind(), Some(ValueKind::String));
		assert_eq!(Value::from(1.5).kind(), Some(ValueKind::Number));
		assert_eq!(Value::Null.kind(), None);
		assert_eq!(Value::object().kind(), Some(ValueKind::Object));

		for kind in [
			ValueKind::Object,
			ValueKind::Array,
			ValueKind::Number,
			ValueKind::Boolean,
			ValueKind::String,
			ValueKind::DateTime,
			ValueKind::Binary,
			ValueKind::Reference,
		] {
			assert_eq!(ValueKind::from_code(kind.code()), Some(kind));
		}
		assert_eq!(ValueKind::from_code(7), None);
		assert_eq!(ValueKind::from_code(0), None);
	}

	#[test]
	fn test_composites() {
		let obj = object! { "a" => 1, "b" => "two" };
		assert!(obj.is_composite());
		assert!(!obj.is_empty_composite());
		assert_eq!(obj.child_count(), 2);
		assert_eq!(obj.child("b"), Some(&Value::from("two")));

		let arr = Value::from(vec!["u", "v"]);
		assert_eq!(arr.child("1"), Some(&Value::from("v")));
		assert_eq!(arr.child("2"), None);

		assert!(Value::object().is_empty_composite());
	}

	#[test]
	fn test_json_roundtrip() {
		let value = object! {
			"name" => "alice",
			"age" => 30,
			"tags" => vec!["admin", "staff"],
		};
		let json = value.to_json();
		assert_eq!(Value::from_json(json), value);
	}

	#[test]
	fn test_exported_json_roundtrip() {
		let value = object! {
			"when" => Value::datetime_ms(1_700_000_000_000),
			"blob" => Value::Binary(vec![1, 2, 3]),
			"link" => Value::Reference(PathReference::new("users/alice")),
			"plain" => "text",
		};
		let exported = value.to_exported_json();
		assert_eq!(Value::from_exported_json(exported), value);
	}

	#[test]
	fn test_datetime_ms() {
		let dt = Value::datetime_ms(1_700_000_000_123);
		match dt {
			Value::DateTime(inner) => assert_eq!(inner.timestamp_millis(), 1_700_000_000_123),
			_ => panic!("expected datetime"),
		}
	}
}
