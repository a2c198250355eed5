use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::model::bounds::Bounds;

pub type Origin = u32;

pub const INVALID_ORIGIN: Origin = u32::MAX;
pub const OMITTED_ORIGIN: Origin = u32::MAX - 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
	Queued,
	Inserted,
	Omitted,
	Errored,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
	pub path: String,
	pub status: FileStatus,
	#[serde(default)]
	pub num_points: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub bounds: Option<Bounds>,
}

impl FileInfo {
	pub fn new(path: &str) -> FileInfo {
		FileInfo {
			path: path.to_string(),
			status: FileStatus::Queued,
			num_points: 0,
			bounds: None,
		}
	}
}

// The ordered input list.  Origins are dense indices into it, assigned on
// first use; the two reserved values mark duplicates and readerless files.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(from = "Vec<FileInfo>", into = "Vec<FileInfo>")]
pub struct Manifest {
	files: Vec<FileInfo>,
	lookup: HashMap<String, Origin>,
}

impl Manifest {
	pub fn new() -> Manifest {
		Manifest::default()
	}

	// Assigns the next origin, or INVALID_ORIGIN if the path was already
	// added.
	pub fn add(&mut self, path: &str) -> Origin {
		if self.lookup.contains_key(path) {
			return INVALID_ORIGIN;
		}

		let origin = self.files.len() as Origin;
		self.files.push(FileInfo::new(path));
		self.lookup.insert(path.to_string(), origin);
		origin
	}

	// True if the path was newly recorded; repeats change nothing.
	pub fn add_omission(&mut self, path: &str) -> bool {
		if self.lookup.contains_key(path) {
			return false;
		}

		let mut info = FileInfo::new(path);
		info.status = FileStatus::Omitted;
		self.files.push(info);
		self.lookup.insert(path.to_string(), OMITTED_ORIGIN);
		true
	}

	pub fn set_status(&mut self, origin: Origin, status: FileStatus) {
		if let Some(info) = self.files.get_mut(origin as usize) {
			info.status = status;
		}
	}

	pub fn set_details(&mut self, origin: Origin, num_points: u64, bounds: Option<Bounds>) {
		if let Some(info) = self.files.get_mut(origin as usize) {
			info.num_points = num_points;
			info.bounds = bounds;
		}
	}

	pub fn get(&self, origin: Origin) -> Option<&FileInfo> {
		self.files.get(origin as usize)
	}

	pub fn files(&self) -> &[FileInfo] {
		&self.files
	}

	pub fn len(&self) -> usize {
		self.files.len()
	}

	pub fn is_empty(&self) -> bool {
		self.files.is_empty()
	}
}

impl From<Vec<FileInfo>> for Manifest {
	fn from(files: Vec<FileInfo>) -> Manifest {
		let lookup = files
			.iter()
			.enumerate()
			.map(|(i, f)| {
				let origin = match f.status {
					FileStatus::Omitted => OMITTED_ORIGIN,
					_ => i as Origin,
				};
				(f.path.clone(), origin)
			})
			.collect();

		Manifest { files, lookup }
	}
}

impl From<Manifest> for Vec<FileInfo> {
	fn from(manifest: Manifest) -> Vec<FileInfo> {
		manifest.files
	}
}
