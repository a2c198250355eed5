use std::path::Path;
use std::sync::Arc;

use log::info;
use ord_subset::OrdSubsetIterExt;
use parking_lot::Mutex;

use crate::config::Config;
use crate::endpoint::{mkdirp, DirEndpoint, Endpoint, LocalHandle};
use crate::error::{Error, Result};
use crate::model::bounds::Bounds;
use crate::model::manifest::{FileInfo, FileStatus};
use crate::model::point::Point;
use crate::model::schema::{DimType, Dimension, Schema};
use crate::pool::Pool;
use crate::reader::{Preview, Reader, Reprojection};

// Header previews over remote sources only need the front of the file.
const HEADER_PREVIEW_BYTES: u64 = 16384;

#[derive(Default)]
struct Aggregate {
	schema: Option<Schema>,
	scale: Option<Point>,
	bounds: Option<Bounds>,
	srs: String,
	total: u64,
}

// The pre-pass: previews (or fully reads, when headers are untrusted) every
// input to settle the bounds, schema, scale, and point count the build
// needs.
pub struct Scan {
	config: Config,
	ctx: Arc<ScanCtx>,
}

struct ScanCtx {
	reader: Arc<dyn Reader>,
	source: Option<Arc<dyn Endpoint>>,
	tmp: Arc<dyn Endpoint>,
	trust_headers: bool,
	reprojection: Option<Reprojection>,
}

impl Scan {
	pub fn new(config: Config, reader: Arc<dyn Reader>) -> Result<Scan> {
		let tmp: Arc<dyn Endpoint> = Arc::new(DirEndpoint::new(&config.tmp));
		Scan::with_endpoints(config, reader, tmp, None)
	}

	pub fn with_endpoints(
		config: Config,
		reader: Arc<dyn Reader>,
		tmp: Arc<dyn Endpoint>,
		source: Option<Arc<dyn Endpoint>>,
	) -> Result<Scan> {
		if !tmp.is_local() {
			return Err(Error::RemoteTmp);
		}
		mkdirp(tmp.root())?;

		let ctx = Arc::new(ScanCtx {
			reader,
			source,
			tmp,
			trust_headers: config.trust_headers,
			reprojection: config.reprojection.clone(),
		});

		Ok(Scan { config, ctx })
	}

	pub fn go(self) -> Result<Config> {
		let pool = Pool::new(self.config.total_threads);
		let files: Arc<Vec<Mutex<FileInfo>>> = Arc::new(
			self.config
				.input
				.iter()
				.map(|f| Mutex::new(f.clone()))
				.collect(),
		);
		let agg = Arc::new(Mutex::new(Aggregate::default()));

		for i in 0..files.len() {
			info!("{} / {}: {}", i + 1, files.len(), files[i].lock().path);

			let ctx = self.ctx.clone();
			let files = files.clone();
			let agg = agg.clone();
			pool.add(move || ctx.scan_one(&files[i], &agg));
		}

		pool.join()?;
		drop(pool);

		let files = Arc::try_unwrap(files)
			.ok()
			.expect("scan tasks joined")
			.into_iter()
			.map(|slot| slot.into_inner())
			.collect();
		let agg = Arc::try_unwrap(agg)
			.ok()
			.expect("scan tasks joined")
			.into_inner();

		self.aggregate(files, agg)
	}

	fn aggregate(&self, files: Vec<FileInfo>, agg: Aggregate) -> Result<Config> {
		if agg.total == 0 {
			return Err(Error::NoPoints);
		}

		let mut out = self.config.clone();
		out.input = files;
		out.num_points = agg.total.max(out.num_points);

		if out.bounds.is_none() {
			out.bounds = agg.bounds;
		}
		if out.schema.is_none() {
			out.schema = agg.schema;
		}

		if let Some(reprojection) = &out.reprojection {
			out.srs = reprojection.out.clone();
		} else if out.srs.is_empty() {
			out.srs = agg.srs;
		}

		// An absolute build keeps full-width coordinates; otherwise carry
		// the finest scale seen across the inputs.
		if !out.absolute {
			out.scale = agg.scale.or(out.scale);
		} else {
			out.scale = None;
		}

		Ok(out)
	}
}

impl ScanCtx {
	fn scan_one(&self, slot: &Mutex<FileInfo>, agg: &Mutex<Aggregate>) -> Result<()> {
		let path = slot.lock().path.clone();

		if !self.reader.good(Path::new(&path)) {
			slot.lock().status = FileStatus::Omitted;
			return Ok(());
		}

		let Some(preview) = self.preview(&path)? else {
			return Ok(());
		};

		if let Some(scale) = preview.scale {
			if scale.x == 0.0 || scale.y == 0.0 || scale.z == 0.0 {
				return Err(Error::InvalidScale(path));
			}
		}

		{
			let mut info = slot.lock();
			info.num_points = preview.num_points;
			info.bounds = preview.bounds;
		}

		if preview.num_points == 0 {
			return Ok(());
		}

		let mut agg = agg.lock();
		agg.total += preview.num_points;

		if let Some(bounds) = preview.bounds {
			match &mut agg.bounds {
				Some(union) => union.grow_bounds(&bounds),
				None => agg.bounds = Some(bounds),
			}
		}

		if agg.srs.is_empty() && !preview.srs.is_empty() {
			agg.srs = preview.srs.clone();
		}

		if let Some(scale) = preview.scale {
			agg.scale = Some(match agg.scale {
				Some(s) => Point::min(&s, &scale),
				None => scale,
			});
		}

		if !preview.dim_names.is_empty() {
			if let Ok(schema) = Schema::with_origin(
				preview
					.dim_names
					.iter()
					.map(|name| Dimension::new(name, DimType::Double))
					.collect(),
			) {
				agg.schema = Some(match &agg.schema {
					Some(merged) => merged.merge(&schema),
					None => schema,
				});
			}
		}

		Ok(())
	}

	// A header preview, reaching through the source endpoint for the first
	// 16 KiB when the input is remote; a full streaming pass when headers
	// are untrusted.
	fn preview(&self, path: &str) -> Result<Option<Preview>> {
		let reprojection = self.reprojection.as_ref();

		if self.trust_headers {
			if let Some(source) = &self.source {
				if !source.is_local() {
					let head = source.get_range(path, 0, HEADER_PREVIEW_BYTES)?;
					let name = path.replace(['/', '\\'], "-");
					self.tmp.put(&name, &head)?;

					let staged = LocalHandle::staged(self.tmp.root().join(&name));
					return Ok(self.reader.preview(staged.path(), reprojection, false));
				}
			}

			return Ok(self.reader.preview(Path::new(path), reprojection, false));
		}

		Ok(self.reader.preview(Path::new(path), reprojection, true))
	}
}

// Persists a scan result through an endpoint for later builds.
pub fn write_config(config: &Config, endpoint: &dyn Endpoint, key: &str) -> Result<()> {
	endpoint.put(key, &serde_json::to_vec_pretty(config)?)
}

// Per-axis minimum over a set of scales, for callers assembling their own
// aggregates.
pub fn min_scale(scales: &[Point]) -> Option<Point> {
	let x = scales.iter().map(|s| s.x).ord_subset_min()?;
	let y = scales.iter().map(|s| s.y).ord_subset_min()?;
	let z = scales.iter().map(|s| s.z).ord_subset_min()?;
	Some(Point::new(x, y, z))
}
