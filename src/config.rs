use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::model::bounds::Bounds;
use crate::model::manifest::FileInfo;
use crate::model::point::Point;
use crate::model::schema::Schema;
use crate::model::structure::Structure;
use crate::reader::Reprojection;

// Everything the core consumes from the outside world, either hand-written
// by the caller or produced by a Scan.  Unset fields take defaults at
// Builder construction.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
	pub bounds: Option<Bounds>,
	pub schema: Option<Schema>,
	pub structure: Option<Structure>,
	pub reprojection: Option<Reprojection>,
	pub trust_headers: bool,
	pub compress: bool,
	pub total_threads: usize,
	pub tmp: PathBuf,
	pub output: PathBuf,
	pub absolute: bool,
	pub scale: Option<Point>,
	pub num_points: u64,
	pub srs: String,
	pub input: Vec<FileInfo>,
	// Points between clipper recycles; derived from the thread count when
	// unset.
	pub sleep_count: Option<u64>,
}

impl Default for Config {
	fn default() -> Config {
		Config {
			bounds: None,
			schema: None,
			structure: None,
			reprojection: None,
			trust_headers: true,
			compress: false,
			total_threads: 8,
			tmp: PathBuf::from("tmp"),
			output: PathBuf::new(),
			absolute: false,
			scale: None,
			num_points: 0,
			srs: String::new(),
			input: Vec::new(),
			sleep_count: None,
		}
	}
}

impl Config {
	pub fn with_input(mut self, paths: &[&str]) -> Config {
		self.input = paths.iter().map(|p| FileInfo::new(p)).collect();
		self
	}
}
