//! Geo index
//!
//! Indexes `{lat, long}` objects and answers `geo:nearby` with a haversine
//! distance scan. Geohash bucketing of the original system's disk format
//! is a leaf concern; the contract here is the radius match itself.

use super::{
	capture_metadata, key_value, rebuild_from_engine, record_pattern_for, IndexEntry, IndexSpec,
	QueryIndex,
};
use crate::error::{DbError, DbResult};
use crate::path::PathInfo;
use crate::query::QueryOp;
use crate::storage::engine::StorageEngine;
use crate::value::Value;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A geographic coordinate pair
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
	pub lat: f64,
	pub long: f64,
}

impl GeoPoint {
	/// Read a `{lat, long}` object
	pub fn from_value(value: &Value) -> Option<GeoPoint> {
		let lat = value.child("lat")?.as_number()?;
		let long = value.child("long")?.as_number()?;
		if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&long) {
			return None;
		}
		Some(GeoPoint { lat, long })
	}

	/// Great-circle distance in meters
	pub fn distance_to(&self, other: &GeoPoint) -> f64 {
		let lat_a = self.lat.to_radians();
		let lat_b = other.lat.to_radians();
		let d_lat = (other.lat - self.lat).to_radians();
		let d_long = (other.long - self.long).to_radians();

		let a = (d_lat / 2.0).sin().powi(2)
			+ lat_a.cos() * lat_b.cos() * (d_long / 2.0).sin().powi(2);
		2.0 * a.sqrt().asin() * EARTH_RADIUS_M
	}
}

/// A `geo:nearby` comparison: center plus radius in meters
#[derive(Debug, Clone, Copy)]
struct NearbyQuery {
	center: GeoPoint,
	radius: f64,
}

impl NearbyQuery {
	fn from_value(value: &Value) -> DbResult<NearbyQuery> {
		let center = GeoPoint::from_value(value).ok_or_else(|| {
			DbError::invalid_argument("\"geo:nearby\" expects {lat, long, radius}")
		})?;
		let radius = value
			.child("radius")
			.and_then(|v| v.as_number())
			.filter(|r| *r > 0.0)
			.ok_or_else(|| {
				DbError::invalid_argument("\"geo:nearby\" expects a positive radius in meters")
			})?;
		Ok(NearbyQuery { center, radius })
	}
}

#[derive(Default)]
struct GeoState {
	by_path: HashMap<String, (GeoPoint, BTreeMap<String, Value>)>,
}

pub struct GeoIndex {
	spec: IndexSpec,
	record_pattern: PathInfo,
	state: RwLock<GeoState>,
}

impl GeoIndex {
	pub fn new(spec: IndexSpec) -> DbResult<Self> {
		let record_pattern = record_pattern_for(&spec.path)?;
		Ok(Self {
			spec,
			record_pattern,
			state: RwLock::new(GeoState::default()),
		})
	}
}

#[async_trait]
impl QueryIndex for GeoIndex {
	fn spec(&self) -> &IndexSpec {
		&self.spec
	}

	fn record_pattern(&self) -> &PathInfo {
		&self.record_pattern
	}

	fn valid_operators(&self) -> &'static [&'static str] {
		&["geo:nearby"]
	}

	async fn build(&self, engine: &StorageEngine) -> DbResult<()> {
		rebuild_from_engine(self, engine).await
	}

	async fn handle_record_update(
		&self,
		path: &str,
		_old: Option<&Value>,
		new: Option<&Value>,
	) -> DbResult<()> {
		let mut state = self.state.write().expect("index state poisoned");
		state.by_path.remove(path);

		let Some(new) = new else {
			return Ok(());
		};
		let Some(point) = key_value(Some(new), &self.spec.key).and_then(GeoPoint::from_value)
		else {
			return Ok(());
		};
		let metadata = capture_metadata(Some(new), &self.spec.include);
		state.by_path.insert(path.to_string(), (point, metadata));
		Ok(())
	}

	async fn query(&self, op: &QueryOp, compare: &Value) -> DbResult<Vec<IndexEntry>> {
		if op.name() != "geo:nearby" {
			return Err(DbError::invalid_argument(format!(
				"operator \"{}\" is not supported by a geo index",
				op.name()
			)));
		}
		let nearby = NearbyQuery::from_value(compare)?;
		let state = self.state.read().expect("index state poisoned");

		let mut hits: Vec<(f64, IndexEntry)> = state
			.by_path
			.iter()
			.filter_map(|(path, (point, metadata))| {
				let distance = nearby.center.distance_to(point);
				if distance <= nearby.radius {
					Some((
						distance,
						IndexEntry {
							path: path.clone(),
							indexed_value: crate::object! {
								"lat" => point.lat,
								"long" => point.long,
							},
							metadata: metadata.clone(),
						},
					))
				} else {
					None
				}
			})
			.collect();
		hits.sort_by(|a, b| a.0.total_cmp(&b.0));
		Ok(hits.into_iter().map(|(_, entry)| entry).collect())
	}

	async fn take(&self, skip: usize, count: usize, ascending: bool) -> DbResult<Vec<IndexEntry>> {
		let state = self.state.read().expect("index state poisoned");
		let mut paths: Vec<String> = state.by_path.keys().cloned().collect();
		paths.sort();
		if !ascending {
			paths.reverse();
		}
		Ok(paths
			.into_iter()
			.skip(skip)
			.take(count)
			.map(|path| IndexEntry {
				path,
				indexed_value: Value::Null,
				metadata: BTreeMap::new(),
			})
			.collect())
	}

	fn test(&self, value: Option<&Value>, op: &QueryOp, compare: &Value) -> bool {
		if op.name() != "geo:nearby" {
			return false;
		}
		let (Some(value), Ok(nearby)) = (value, NearbyQuery::from_value(compare)) else {
			return false;
		};
		match GeoPoint::from_value(value) {
			Some(point) => nearby.center.distance_to(&point) <= nearby.radius,
			None => false,
		}
	}
}
