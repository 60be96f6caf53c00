//! Error types for database operations

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
	#[error("No node found at \"{path}\"")]
	NotFound { path: String },

	#[error("Operation not allowed on \"{path}\": {reason}")]
	NotAllowed { path: String, reason: String },

	#[error("Invalid argument: {0}")]
	InvalidArgument(String),

	#[error("Invalid value at \"{path}\": {reason}")]
	InvalidValue { path: String, reason: String },

	#[error("Revision mismatch at \"{path}\": expected {expected}, found {found}")]
	RevisionMismatch {
		path: String,
		expected: String,
		found: String,
	},

	#[error("Lock {tid} on \"{path}\" expired after {held_for:?}")]
	LockExpired {
		tid: uuid::Uuid,
		path: String,
		held_for: Duration,
	},

	#[error("Lock request on \"{path}\" timed out after {waited:?}")]
	LockTimeout { path: String, waited: Duration },

	#[error("Backend error: {0}")]
	Backend(String),

	#[error("Index unavailable: {reason}")]
	IndexUnavailable { reason: String },

	#[error("Array constraint violated at \"{path}\": {reason}")]
	ArrayConstraint { path: String, reason: String },

	#[error("Transaction canceled")]
	TransactionCanceled,

	#[error("Serialization error: {0}")]
	Serialization(String),

	#[error("Deserialization error: {0}")]
	Deserialization(String),

	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),

	#[error("redb database error: {0}")]
	RedbError(#[from] redb::Error),

	#[error("redb transaction error: {0}")]
	RedbTransactionError(#[from] redb::TransactionError),

	#[error("redb commit error: {0}")]
	RedbCommitError(#[from] redb::CommitError),

	#[error("redb table error: {0}")]
	RedbTableError(#[from] redb::TableError),

	#[error("redb storage error: {0}")]
	RedbStorageError(#[from] redb::StorageError),

	#[error("Invalid configuration: {0}")]
	InvalidConfiguration(String),
}

impl DbError {
	/// Check if this error indicates that the operation should be retried.
	/// Only revision mismatches qualify; transactions retry those once.
	pub fn is_retryable(&self) -> bool {
		matches!(self, DbError::RevisionMismatch { .. })
	}

	/// Check if this error was caused by bad caller input
	pub fn is_caller_error(&self) -> bool {
		matches!(
			self,
			DbError::NotAllowed { .. }
				| DbError::InvalidArgument(_)
				| DbError::InvalidValue { .. }
				| DbError::ArrayConstraint { .. }
				| DbError::IndexUnavailable { .. }
		)
	}

	/// Get error category for logging and metrics
	pub fn category(&self) -> &'static str {
		match self {
			DbError::NotFound { .. } => "not_found",
			DbError::NotAllowed { .. } => "not_allowed",
			DbError::InvalidArgument(_) => "invalid_argument",
			DbError::InvalidValue { .. } => "invalid_value",
			DbError::RevisionMismatch { .. } => "revision_mismatch",
			DbError::LockExpired { .. } => "lock_expired",
			DbError::LockTimeout { .. } => "lock_timeout",
			DbError::Backend(_) => "backend",
			DbError::IndexUnavailable { .. } => "index_unavailable",
			DbError::ArrayConstraint { .. } => "array_constraint",
			DbError::TransactionCanceled => "transaction_canceled",
			DbError::Serialization(_) => "serialization",
			DbError::Deserialization(_) => "serialization",
			DbError::Io(_) => "io",
			DbError::RedbError(_)
			| DbError::RedbTransactionError(_)
			| DbError::RedbCommitError(_)
			| DbError::RedbTableError(_)
			| DbError::RedbStorageError(_) => "backend",
			DbError::InvalidConfiguration(_) => "configuration",
		}
	}

	/// Create a not-found error
	pub fn not_found(path: impl Into<String>) -> Self {
		DbError::NotFound { path: path.into() }
	}

	/// Create a not-allowed error
	pub fn not_allowed(path: impl Into<String>, reason: impl Into<String>) -> Self {
		DbError::NotAllowed { path: path.into(), reason: reason.into() }
	}

	/// Create an invalid-argument error
	pub fn invalid_argument(reason: impl Into<String>) -> Self {
		DbError::InvalidArgument(reason.into())
	}

	/// Create an invalid-value error
	pub fn invalid_value(path: impl Into<String>, reason: impl Into<String>) -> Self {
		DbError::InvalidValue { path: path.into(), reason: reason.into() }
	}

	/// Create an array-constraint error
	pub fn array_constraint(path: impl Into<String>, reason: impl Into<String>) -> Self {
		DbError::ArrayConstraint { path: path.into(), reason: reason.into() }
	}

	/// Create an index-unavailable error
	pub fn index_unavailable(reason: impl Into<String>) -> Self {
		DbError::IndexUnavailable { reason: reason.into() }
	}

	/// Create a backend error from any displayable cause
	pub fn backend(cause: impl std::fmt::Display) -> Self {
		DbError::Backend(cause.to_string())
	}
}

impl From<redb::DatabaseError> for DbError {
	fn from(e: redb::DatabaseError) -> Self {
		DbError::RedbError(redb::Error::from(e))
	}
}

impl From<bincode::Error> for DbError {
	fn from(e: bincode::Error) -> Self {
		DbError::Serialization(e.to_string())
	}
}

pub type DbResult<T> = Result<T, DbError>;
