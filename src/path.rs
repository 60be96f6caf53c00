//! Hierarchical path utilities
//!
//! Paths address nodes in the tree as slash-separated keys. Array entries are
//! addressed with bracketed indices (`posts[3]/title`), and patterns may use
//! wildcard keys: `*` matches any single key, `$name` matches any single key
//! and binds it to `name`. A wildcard never spans more than one key.

use crate::error::{DbError, DbResult};
use std::collections::HashMap;
use std::fmt;

/// A single key on a path: either a map key or an array index.
/// Wildcards (`*`, `$name`) are represented as ordinary map keys and only
/// gain meaning in pattern matching.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathKey {
	Key(String),
	Index(usize),
}

impl PathKey {
	/// Whether this key is a `*` or `$name` wildcard
	pub fn is_wildcard(&self) -> bool {
		match self {
			PathKey::Key(k) => k == "*" || k.starts_with('$'),
			PathKey::Index(_) => false,
		}
	}

	/// The `$name` binding of a named wildcard, without the `$` prefix
	pub fn variable_name(&self) -> Option<&str> {
		match self {
			PathKey::Key(k) if k.starts_with('$') && k.len() > 1 => Some(&k[1..]),
			_ => None,
		}
	}

	/// Whether a concrete key is matched by this (possibly wildcard) key
	pub fn matches(&self, other: &PathKey) -> bool {
		if self.is_wildcard() || other.is_wildcard() {
			return true;
		}
		self == other
	}
}

impl fmt::Display for PathKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			PathKey::Key(k) => write!(f, "{}", k),
			PathKey::Index(i) => write!(f, "[{}]", i),
		}
	}
}

impl From<&str> for PathKey {
	fn from(key: &str) -> Self {
		PathKey::Key(key.to_string())
	}
}

impl From<String> for PathKey {
	fn from(key: String) -> Self {
		PathKey::Key(key)
	}
}

impl From<usize> for PathKey {
	fn from(index: usize) -> Self {
		PathKey::Index(index)
	}
}

/// A parsed path with its canonical text form and key sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathInfo {
	path: String,
	keys: Vec<PathKey>,
}

impl PathInfo {
	/// The root path (empty key sequence)
	pub fn root() -> Self {
		Self { path: String::new(), keys: Vec::new() }
	}

	/// Parse a path from its textual form.
	/// Accepts leading/trailing slashes and normalizes them away.
	pub fn parse(path: &str) -> DbResult<Self> {
		let trimmed = path.trim_matches('/');
		if trimmed.is_empty() {
			return Ok(Self::root());
		}

		let mut keys = Vec::new();
		for segment in trimmed.split('/') {
			if segment.is_empty() {
				return Err(DbError::invalid_argument(format!(
					"empty key in path \"{}\"",
					path
				)));
			}
			parse_segment(segment, path, &mut keys)?;
		}

		let canonical = build_path(&keys);
		Ok(Self { path: canonical, keys })
	}

	/// Construct from an already-validated key sequence
	pub fn from_keys(keys: Vec<PathKey>) -> Self {
		let path = build_path(&keys);
		Self { path, keys }
	}

	/// Canonical text form
	pub fn path(&self) -> &str {
		&self.path
	}

	/// The key sequence, root first
	pub fn keys(&self) -> &[PathKey] {
		&self.keys
	}

	/// The last key, if any (None for the root)
	pub fn key(&self) -> Option<&PathKey> {
		self.keys.last()
	}

	/// Number of keys from the root
	pub fn depth(&self) -> usize {
		self.keys.len()
	}

	pub fn is_root(&self) -> bool {
		self.keys.is_empty()
	}

	/// Whether any key is a wildcard
	pub fn contains_wildcards(&self) -> bool {
		self.keys.iter().any(|k| k.is_wildcard())
	}

	/// Parent path, or None for the root
	pub fn parent(&self) -> Option<PathInfo> {
		if self.keys.is_empty() {
			return None;
		}
		let keys = self.keys[..self.keys.len() - 1].to_vec();
		Some(Self::from_keys(keys))
	}

	/// Child path obtained by appending one key
	pub fn child(&self, key: impl Into<PathKey>) -> PathInfo {
		let mut keys = self.keys.clone();
		keys.push(key.into());
		Self::from_keys(keys)
	}

	/// Whether two paths address the same node, wildcards matching any key
	pub fn equals(&self, other: &PathInfo) -> bool {
		self.keys.len() == other.keys.len() && self.is_prefix_match(other)
	}

	/// Whether self is a strict ancestor of other
	pub fn is_ancestor_of(&self, other: &PathInfo) -> bool {
		self.keys.len() < other.keys.len() && self.is_prefix_match(other)
	}

	/// Whether self is a strict descendant of other
	pub fn is_descendant_of(&self, other: &PathInfo) -> bool {
		other.is_ancestor_of(self)
	}

	/// Whether self is a direct child of other
	pub fn is_child_of(&self, other: &PathInfo) -> bool {
		self.keys.len() == other.keys.len() + 1 && other.is_prefix_match(self)
	}

	/// Whether self is the direct parent of other
	pub fn is_parent_of(&self, other: &PathInfo) -> bool {
		other.is_child_of(self)
	}

	/// Whether the two paths lie on the same root-to-leaf line
	pub fn is_on_trail_of(&self, other: &PathInfo) -> bool {
		if self.keys.len() <= other.keys.len() {
			self.is_prefix_match(other)
		} else {
			other.is_prefix_match(self)
		}
	}

	fn is_prefix_match(&self, other: &PathInfo) -> bool {
		let n = self.keys.len().min(other.keys.len());
		self.keys[..n]
			.iter()
			.zip(&other.keys[..n])
			.all(|(a, b)| a.matches(b))
	}

	/// Extract wildcard bindings from a concrete path matching this pattern.
	/// `users/$uid/posts` against `users/alice/posts` binds `{0: "alice", uid: "alice"}`.
	pub fn extract_variables(&self, concrete: &PathInfo) -> PathVariables {
		let mut vars = PathVariables::default();
		if self.keys.len() > concrete.keys.len() {
			return vars;
		}
		for (pattern_key, concrete_key) in self.keys.iter().zip(&concrete.keys) {
			if pattern_key.is_wildcard() {
				vars.push(pattern_key.variable_name(), concrete_key.clone());
			}
		}
		vars
	}

	/// Fill this pattern's wildcards with the keys of a concrete path at the
	/// same positions. The concrete path must be at least as deep as the
	/// pattern and match it on every non-wildcard key.
	pub fn fill_variables(&self, concrete: &PathInfo) -> DbResult<PathInfo> {
		if concrete.keys.len() < self.keys.len() {
			return Err(DbError::invalid_argument(format!(
				"path \"{}\" is shorter than pattern \"{}\"",
				concrete.path, self.path
			)));
		}
		let mut keys = Vec::with_capacity(self.keys.len());
		for (pattern_key, concrete_key) in self.keys.iter().zip(&concrete.keys) {
			if pattern_key.is_wildcard() {
				keys.push(concrete_key.clone());
			} else if pattern_key.matches(concrete_key) {
				keys.push(pattern_key.clone());
			} else {
				return Err(DbError::invalid_argument(format!(
					"path \"{}\" does not match pattern \"{}\"",
					concrete.path, self.path
				)));
			}
		}
		Ok(Self::from_keys(keys))
	}

	/// Fill this pattern's wildcards with concrete keys where the given path
	/// overlaps it; wildcards beyond the concrete path's depth are kept
	pub fn fill_overlapping(&self, concrete: &PathInfo) -> PathInfo {
		let keys = self
			.keys
			.iter()
			.enumerate()
			.map(|(i, key)| {
				if key.is_wildcard() {
					concrete.keys.get(i).cloned().unwrap_or_else(|| key.clone())
				} else {
					key.clone()
				}
			})
			.collect();
		Self::from_keys(keys)
	}

	/// Fill this pattern's wildcards with previously extracted bindings, in order
	pub fn fill_variables_with(&self, vars: &PathVariables) -> PathInfo {
		let mut next = 0usize;
		let keys = self
			.keys
			.iter()
			.map(|key| {
				if key.is_wildcard() {
					let filled = vars.get(next).cloned().unwrap_or_else(|| key.clone());
					next += 1;
					filled
				} else {
					key.clone()
				}
			})
			.collect();
		Self::from_keys(keys)
	}
}

impl fmt::Display for PathInfo {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.path)
	}
}

/// Wildcard bindings extracted from matching a pattern against a concrete path
#[derive(Debug, Clone, Default)]
pub struct PathVariables {
	positional: Vec<PathKey>,
	named: HashMap<String, PathKey>,
}

impl PathVariables {
	fn push(&mut self, name: Option<&str>, key: PathKey) {
		if let Some(name) = name {
			self.named.insert(name.to_string(), key.clone());
		}
		self.positional.push(key);
	}

	/// Binding by wildcard position (0-based)
	pub fn get(&self, index: usize) -> Option<&PathKey> {
		self.positional.get(index)
	}

	/// Binding by `$name`, with or without the `$` prefix
	pub fn get_named(&self, name: &str) -> Option<&PathKey> {
		self.named.get(name.trim_start_matches('$'))
	}

	pub fn len(&self) -> usize {
		self.positional.len()
	}

	pub fn is_empty(&self) -> bool {
		self.positional.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = &PathKey> {
		self.positional.iter()
	}
}

/// Split one slash-separated segment into its key and any trailing `[n]` indices
fn parse_segment(segment: &str, full_path: &str, keys: &mut Vec<PathKey>) -> DbResult<()> {
	let (name, rest) = match segment.find('[') {
		Some(0) => (None, segment),
		Some(pos) => (Some(&segment[..pos]), &segment[pos..]),
		None => (Some(segment), ""),
	};

	if let Some(name) = name {
		validate_key(name, full_path)?;
		keys.push(PathKey::Key(name.to_string()));
	} else if keys.is_empty() {
		// An index needs an array to index into
		return Err(DbError::invalid_argument(format!(
			"path \"{}\" starts with an array index",
			full_path
		)));
	}

	let mut remainder = rest;
	while !remainder.is_empty() {
		if !remainder.starts_with('[') {
			return Err(DbError::invalid_argument(format!(
				"malformed array index in path \"{}\"",
				full_path
			)));
		}
		let close = remainder.find(']').ok_or_else(|| {
			DbError::invalid_argument(format!("unterminated array index in path \"{}\"", full_path))
		})?;
		let digits = &remainder[1..close];
		let index: usize = digits.parse().map_err(|_| {
			DbError::invalid_argument(format!(
				"invalid array index \"{}\" in path \"{}\"",
				digits, full_path
			))
		})?;
		keys.push(PathKey::Index(index));
		remainder = &remainder[close + 1..];
	}

	Ok(())
}

fn validate_key(key: &str, full_path: &str) -> DbResult<()> {
	if key.is_empty() {
		return Err(DbError::invalid_argument(format!(
			"empty key in path \"{}\"",
			full_path
		)));
	}
	// `*` must stand alone; `$` marks a named wildcard and needs a name
	if key.contains('*') && key != "*" {
		return Err(DbError::invalid_argument(format!(
			"key \"{}\" in path \"{}\" may not contain '*'",
			key, full_path
		)));
	}
	if key == "$" {
		return Err(DbError::invalid_argument(format!(
			"unnamed variable key in path \"{}\"",
			full_path
		)));
	}
	if key.contains(']') {
		return Err(DbError::invalid_argument(format!(
			"key \"{}\" in path \"{}\" contains an invalid character",
			key, full_path
		)));
	}
	Ok(())
}

/// Build the canonical text form: keys joined by `/`, indices as `[n]` with
/// no slash before the bracket
pub fn build_path(keys: &[PathKey]) -> String {
	let mut path = String::new();
	for key in keys {
		match key {
			PathKey::Key(k) => {
				if !path.is_empty() {
					path.push('/');
				}
				path.push_str(k);
			}
			PathKey::Index(i) => {
				path.push('[');
				path.push_str(&i.to_string());
				path.push(']');
			}
		}
	}
	path
}

/// Parent of a canonical path string, or None for the root
pub fn parent_path(path: &str) -> Option<String> {
	let info = PathInfo::parse(path).ok()?;
	info.parent().map(|p| p.path().to_string())
}

/// Append a key to a canonical path string
pub fn child_path(path: &str, key: &PathKey) -> String {
	match key {
		PathKey::Key(k) => {
			if path.is_empty() {
				k.clone()
			} else {
				format!("{}/{}", path, k)
			}
		}
		PathKey::Index(i) => format!("{}[{}]", path, i),
	}
}

/// Number of keys in a canonical path, without parsing it into segments.
/// Canonical keys never contain `/` or `[`, so counting separators suffices.
pub fn path_depth(path: &str) -> usize {
	if path.is_empty() {
		return 0;
	}
	1 + path.bytes().filter(|&b| b == b'/' || b == b'[').count()
}

/// Whether `candidate` is a strict descendant of `parent`, comparing
/// canonical text forms only (no wildcard awareness)
pub fn is_descendant_path(parent: &str, candidate: &str) -> bool {
	if candidate.is_empty() {
		return false;
	}
	if parent.is_empty() {
		return true;
	}
	if candidate.len() <= parent.len() || !candidate.starts_with(parent) {
		return false;
	}
	matches!(candidate.as_bytes()[parent.len()], b'/' | b'[')
}

/// Whether `candidate` is a direct child of `parent`, comparing canonical
/// text forms only
pub fn is_direct_child_path(parent: &str, candidate: &str) -> bool {
	is_descendant_path(parent, candidate) && path_depth(candidate) == path_depth(parent) + 1
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_keys() {
		let info = PathInfo::parse("users/alice/posts[3]/title").unwrap();
		assert_eq!(
			info.keys(),
			&[
				PathKey::Key("users".to_string()),
				PathKey::Key("alice".to_string()),
				PathKey::Key("posts".to_string()),
				PathKey::Index(3),
				PathKey::Key("title".to_string()),
			]
		);
		assert_eq!(info.path(), "users/alice/posts[3]/title");
	}

	#[test]
	fn test_parse_root_and_normalization() {
		assert!(PathInfo::parse("").unwrap().is_root());
		assert!(PathInfo::parse("/").unwrap().is_root());
		assert_eq!(PathInfo::parse("/users/alice/").unwrap().path(), "users/alice");
	}

	#[test]
	fn test_parse_errors() {
		assert!(PathInfo::parse("users//alice").is_err());
		assert!(PathInfo::parse("[0]/x").is_err());
		assert!(PathInfo::parse("arr[-1]").is_err());
		assert!(PathInfo::parse("arr[x]").is_err());
		assert!(PathInfo::parse("arr[1").is_err());
		assert!(PathInfo::parse("us*ers/alice").is_err());
		assert!(PathInfo::parse("users/$").is_err());
	}

	#[test]
	fn test_nested_indices() {
		let info = PathInfo::parse("matrix[2][7]").unwrap();
		assert_eq!(
			info.keys(),
			&[
				PathKey::Key("matrix".to_string()),
				PathKey::Index(2),
				PathKey::Index(7),
			]
		);
		assert_eq!(info.path(), "matrix[2][7]");
	}

	#[test]
	fn test_parent_child() {
		let info = PathInfo::parse("users/alice/posts[3]").unwrap();
		let parent = info.parent().unwrap();
		assert_eq!(parent.path(), "users/alice/posts");
		assert_eq!(parent.child(PathKey::Index(3)).path(), info.path());
		assert!(PathInfo::root().parent().is_none());

		assert_eq!(parent_path("a/b"), Some("a".to_string()));
		assert_eq!(parent_path("a"), Some(String::new()));
		assert_eq!(parent_path(""), None);
	}

	#[test]
	fn test_relationships() {
		let a = PathInfo::parse("users").unwrap();
		let b = PathInfo::parse("users/alice").unwrap();
		let c = PathInfo::parse("users/alice/posts").unwrap();

		assert!(a.is_ancestor_of(&c));
		assert!(c.is_descendant_of(&a));
		assert!(b.is_child_of(&a));
		assert!(a.is_parent_of(&b));
		assert!(!a.is_parent_of(&c));
		assert!(a.is_on_trail_of(&c));
		assert!(c.is_on_trail_of(&a));
		assert!(!b.is_on_trail_of(&PathInfo::parse("groups/admins").unwrap()));
	}

	#[test]
	fn test_wildcard_matching() {
		let pattern = PathInfo::parse("users/*/posts").unwrap();
		let concrete = PathInfo::parse("users/alice/posts").unwrap();
		assert!(pattern.equals(&concrete));
		assert!(pattern.contains_wildcards());
		assert!(!concrete.contains_wildcards());

		let named = PathInfo::parse("users/$uid/posts").unwrap();
		assert!(named.is_ancestor_of(&PathInfo::parse("users/bob/posts/p1").unwrap()));
	}

	#[test]
	fn test_extract_variables() {
		let pattern = PathInfo::parse("users/$uid/posts/$postid").unwrap();
		let concrete = PathInfo::parse("users/alice/posts/p1").unwrap();
		let vars = pattern.extract_variables(&concrete);

		assert_eq!(vars.len(), 2);
		assert_eq!(vars.get(0), Some(&PathKey::Key("alice".to_string())));
		assert_eq!(vars.get(1), Some(&PathKey::Key("p1".to_string())));
		assert_eq!(vars.get_named("uid"), Some(&PathKey::Key("alice".to_string())));
		assert_eq!(vars.get_named("$postid"), Some(&PathKey::Key("p1".to_string())));
	}

	#[test]
	fn test_fill_variables() {
		let pattern = PathInfo::parse("users/$uid/posts").unwrap();
		let concrete = PathInfo::parse("users/alice/posts/p1/title").unwrap();
		let filled = pattern.fill_variables(&concrete).unwrap();
		assert_eq!(filled.path(), "users/alice/posts");

		let mismatch = PathInfo::parse("groups/admins/x").unwrap();
		assert!(pattern.fill_variables(&mismatch).is_err());
		assert!(pattern.fill_variables(&PathInfo::parse("users").unwrap()).is_err());
	}

	#[test]
	fn test_fill_variables_with_bindings() {
		let pattern = PathInfo::parse("users/$uid/posts/*").unwrap();
		let vars = pattern.extract_variables(&PathInfo::parse("users/alice/posts/p9").unwrap());
		let filled = pattern.fill_variables_with(&vars);
		assert_eq!(filled.path(), "users/alice/posts/p9");
	}

	#[test]
	fn test_text_form_helpers() {
		assert_eq!(path_depth(""), 0);
		assert_eq!(path_depth("a"), 1);
		assert_eq!(path_depth("a/b[1]/c"), 4);
		assert_eq!(path_depth("m[0][1]"), 3);

		assert!(is_descendant_path("", "a"));
		assert!(is_descendant_path("users", "users/alice/posts"));
		assert!(is_descendant_path("arr", "arr[0]"));
		assert!(!is_descendant_path("users", "users"));
		assert!(!is_descendant_path("users", "users2/alice"));

		assert!(is_direct_child_path("users", "users/alice"));
		assert!(is_direct_child_path("arr", "arr[2]"));
		assert!(!is_direct_child_path("users", "users/alice/posts"));
		assert!(!is_direct_child_path("", "a/b"));
		assert!(is_direct_child_path("", "a"));
	}

	#[test]
	fn test_display_roundtrip() {
		for path in ["", "a", "a/b", "a[0]", "a/b[1]/c", "m[0][1]"] {
			let info = PathInfo::parse(path).unwrap();
			assert_eq!(info.path(), path);
			assert_eq!(PathInfo::parse(info.path()).unwrap(), info);
		}
	}
}
