//! Stored record types
//!
//! A `StoredRecord` is the unit a backend persists, addressed by the node's
//! canonical path. Composite records carry a flat map of direct-child keys
//! to typed inline entries; children too large to inline get dedicated
//! records of their own and are discovered through path scans, never listed
//! in the parent.

use crate::error::DbResult;
use crate::ids;
use crate::value::codec::InlineValue;
use crate::value::ValueKind;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The payload of a stored record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordValue {
	/// A node whose value is a single scalar too large to inline in its
	/// parent (long strings, big binaries)
	Scalar(InlineValue),

	/// A composite node: direct-child key to inline entry. Array records
	/// key by stringified indices. Dedicated children are not listed here.
	Map(BTreeMap<String, InlineValue>),
}

impl RecordValue {
	pub fn as_map(&self) -> Option<&BTreeMap<String, InlineValue>> {
		match self {
			RecordValue::Map(map) => Some(map),
			RecordValue::Scalar(_) => None,
		}
	}

	pub fn as_map_mut(&mut self) -> Option<&mut BTreeMap<String, InlineValue>> {
		match self {
			RecordValue::Map(map) => Some(map),
			RecordValue::Scalar(_) => None,
		}
	}
}

/// A persisted node record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
	/// Value kind of the node
	pub kind: ValueKind,

	/// Scalar payload or inline-children map
	pub value: RecordValue,

	/// Time-sortable id shared by all nodes written in the same operation
	pub revision: String,

	/// 1-based write counter for this record; resets when the node is
	/// deleted and later recreated
	pub revision_nr: u64,

	/// Creation timestamp, epoch milliseconds
	pub created: i64,

	/// Last modification timestamp, epoch milliseconds
	pub modified: i64,
}

impl StoredRecord {
	/// Create the first revision of a composite record
	pub fn new_composite(
		kind: ValueKind,
		map: BTreeMap<String, InlineValue>,
		revision: impl Into<String>,
	) -> Self {
		let now = Utc::now().timestamp_millis();
		Self {
			kind,
			value: RecordValue::Map(map),
			revision: revision.into(),
			revision_nr: 1,
			created: now,
			modified: now,
		}
	}

	/// Create the first revision of a dedicated scalar record
	pub fn new_scalar(scalar: InlineValue, revision: impl Into<String>) -> Self {
		let now = Utc::now().timestamp_millis();
		Self {
			kind: scalar.kind(),
			value: RecordValue::Scalar(scalar),
			revision: revision.into(),
			revision_nr: 1,
			created: now,
			modified: now,
		}
	}

	/// Produce the next revision of this record with a new payload,
	/// preserving `created` and incrementing `revision_nr`
	pub fn updated(
		&self,
		kind: ValueKind,
		value: RecordValue,
		revision: impl Into<String>,
	) -> Self {
		Self {
			kind,
			value,
			revision: revision.into(),
			revision_nr: self.revision_nr + 1,
			created: self.created,
			modified: Utc::now().timestamp_millis(),
		}
	}

	pub fn is_composite(&self) -> bool {
		self.kind.is_composite()
	}

	/// Inline child entries; empty for scalar records
	pub fn inline_entries(&self) -> impl Iterator<Item = (&String, &InlineValue)> {
		self.value.as_map().into_iter().flatten()
	}

	/// Serialize for backend storage
	pub fn to_bytes(&self) -> DbResult<Vec<u8>> {
		Ok(bincode::serialize(self)?)
	}

	/// Deserialize from backend storage
	pub fn from_bytes(bytes: &[u8]) -> DbResult<Self> {
		bincode::deserialize(bytes)
			.map_err(|e| crate::error::DbError::Deserialization(e.to_string()))
	}
}

/// Generate the revision id for a write operation
pub fn new_revision() -> String {
	ids::time_sortable_id()
}
