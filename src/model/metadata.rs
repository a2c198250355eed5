use serde::{Deserialize, Serialize};

use crate::model::bounds::Bounds;
use crate::model::manifest::Manifest;
use crate::model::schema::Schema;
use crate::model::stats::StatsValues;
use crate::model::structure::Structure;
use crate::reader::Reprojection;

// The persisted description of one index (or one subset of it), written as
// JSON under the "entwine" key at the output root.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
	pub bbox: Bounds,
	pub schema: Schema,
	pub structure: Structure,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reprojection: Option<Reprojection>,
	pub manifest: Manifest,
	#[serde(default)]
	pub srs: String,
	pub stats: StatsValues,
	pub compressed: bool,
	pub trust_headers: bool,
	// Every cold chunk this build has written, as decimal strings, sorted.
	#[serde(default)]
	pub ids: Vec<String>,
}

impl Metadata {
	pub fn chunk_ids(&self) -> Vec<u64> {
		self.ids.iter().filter_map(|s| s.parse().ok()).collect()
	}
}
