use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::bounds::Bounds;
use crate::model::point::Point;
use crate::model::schema::Schema;

pub mod csv;

// Carried opaquely to the reader, which owns all coordinate handling.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reprojection {
	#[serde(rename = "in", default, skip_serializing_if = "Option::is_none")]
	pub in_srs: Option<String>,
	pub out: String,
	// Force in_srs even when the file declares its own reference system.
	#[serde(default)]
	pub hammer: bool,
}

// Header-level facts about one input, available without reading the whole
// file when the format carries them.
#[derive(Clone, Debug, Default)]
pub struct Preview {
	pub num_points: u64,
	pub bounds: Option<Bounds>,
	pub srs: String,
	pub dim_names: Vec<String>,
	pub scale: Option<Point>,
}

// A run of schema-packed rows handed from the reader to the build loop.
pub struct PointBatch {
	point_size: usize,
	bytes: Vec<u8>,
}

impl PointBatch {
	pub fn new(point_size: usize) -> PointBatch {
		PointBatch {
			point_size,
			bytes: Vec::new(),
		}
	}

	pub fn push(&mut self, row: &[u8]) {
		debug_assert_eq!(row.len(), self.point_size);
		self.bytes.extend_from_slice(row);
	}

	pub fn len(&self) -> usize {
		self.bytes.len() / self.point_size
	}

	pub fn is_empty(&self) -> bool {
		self.bytes.is_empty()
	}

	pub fn rows(&self) -> impl Iterator<Item = &[u8]> {
		self.bytes.chunks_exact(self.point_size)
	}
}

pub type BatchIter = Box<dyn Iterator<Item = Result<PointBatch>> + Send>;

// The point source contract: readers yield iterated batches of reprojected,
// schema-packed points, and may expose header facts through preview().
pub trait Reader: Send + Sync {
	// Cheap reject for paths this reader cannot possibly handle.
	fn good(&self, path: &Path) -> bool;

	// deep previews may read the entire file to establish bounds and counts
	// for formats whose headers carry neither.
	fn preview(&self, path: &Path, reprojection: Option<&Reprojection>, deep: bool)
		-> Option<Preview>;

	fn read(
		&self,
		path: &Path,
		reprojection: Option<&Reprojection>,
		schema: &Schema,
	) -> Result<BatchIter>;
}

// An in-memory source for exercising the build loop without fixture files.
// Header claims can be overridden per path to model untrustworthy inputs.
#[cfg(test)]
pub(crate) mod mem {
	use std::collections::HashMap;
	use std::path::Path;

	use super::{BatchIter, PointBatch, Preview, Reader, Reprojection};
	use crate::error::Result;
	use crate::model::bounds::Bounds;
	use crate::model::point::Point;
	use crate::model::schema::Schema;

	#[derive(Default)]
	pub struct MemReader {
		files: HashMap<String, Vec<Point>>,
		claimed: HashMap<String, Bounds>,
		scales: HashMap<String, Point>,
		broken: HashMap<String, usize>,
	}

	// Inputs are matched by file name, so staged tmp copies of a "remote"
	// path resolve to the same synthetic file.
	fn key(path: &Path) -> String {
		path.file_name()
			.and_then(|n| n.to_str())
			.unwrap_or("")
			.to_string()
	}

	impl MemReader {
		pub fn new() -> MemReader {
			MemReader::default()
		}

		pub fn add(&mut self, path: &str, points: Vec<Point>) {
			self.files.insert(path.to_string(), points);
		}

		// Make preview() claim these bounds regardless of the points.
		pub fn claim(&mut self, path: &str, bounds: Bounds) {
			self.claimed.insert(path.to_string(), bounds);
		}

		// Make preview() declare this scale.
		pub fn claim_scale(&mut self, path: &str, scale: Point) {
			self.scales.insert(path.to_string(), scale);
		}

		// Make read() fail after yielding this many points.
		pub fn break_after(&mut self, path: &str, points: usize) {
			self.broken.insert(path.to_string(), points);
		}

		fn actual_bounds(points: &[Point]) -> Option<Bounds> {
			if points.is_empty() {
				return None;
			}
			let mut bounds = Bounds::expander(true);
			for p in points {
				bounds.grow(p);
			}
			Some(bounds)
		}
	}

	impl Reader for MemReader {
		fn good(&self, path: &Path) -> bool {
			self.files.contains_key(&key(path))
		}

		fn preview(
			&self,
			path: &Path,
			_reprojection: Option<&Reprojection>,
			_deep: bool,
		) -> Option<Preview> {
			let key = key(path);
			let points = self.files.get(&key)?;

			Some(Preview {
				num_points: points.len() as u64,
				bounds: self
					.claimed
					.get(&key)
					.copied()
					.or_else(|| Self::actual_bounds(points)),
				srs: "EPSG:3857".to_string(),
				dim_names: vec!["X".to_string(), "Y".to_string(), "Z".to_string()],
				scale: Some(
					self.scales
						.get(&key)
						.copied()
						.unwrap_or(Point::new(0.01, 0.01, 0.01)),
				),
			})
		}

		fn read(
			&self,
			path: &Path,
			_reprojection: Option<&Reprojection>,
			schema: &Schema,
		) -> Result<BatchIter> {
			let key = key(path);
			let points = self
				.files
				.get(&key)
				.cloned()
				.ok_or_else(|| crate::error::Error::NotFound(key.clone()))?;
			let fail_at = self.broken.get(&key).copied();

			let schema = schema.clone();
			let point_size = schema.point_size();
			let mut at = 0;

			let iter = std::iter::from_fn(move || {
				if at >= points.len() {
					return None;
				}
				if let Some(fail_at) = fail_at {
					if at >= fail_at {
						at = points.len();
						return Some(Err(crate::error::Error::Read(
							key.clone(),
							"stream truncated".to_string(),
						)));
					}
				}

				let end = points.len().min(at + 1024);
				let end = fail_at.map_or(end, |f| end.min(f.max(at)));

				let mut batch = PointBatch::new(point_size);
				let mut row = vec![0u8; point_size];
				for p in &points[at..end] {
					schema.set_point(&mut row, p);
					batch.push(&row);
				}
				at = end;

				Some(Ok(batch))
			});

			Ok(Box::new(iter))
		}
	}
}
