use std::path::Path;
use std::sync::Arc;

use log::{info, warn};
use parking_lot::{Mutex, RwLock};

use crate::chunk::Chunk;
use crate::climber::Climber;
use crate::clipper::Clipper;
use crate::config::Config;
use crate::endpoint::{mkdirp, DirEndpoint, Endpoint, LocalHandle};
use crate::error::{Error, Result};
use crate::model::bounds::{Bounds, Range};
use crate::model::manifest::{FileStatus, Manifest, Origin, INVALID_ORIGIN};
use crate::model::metadata::Metadata;
use crate::model::point::Point;
use crate::model::schema::Schema;
use crate::model::stats::Stats;
use crate::model::structure::Structure;
use crate::points::Pools;
use crate::pool::{clip_threads, work_threads, Pool};
use crate::reader::{Reader, Reprojection};
use crate::registry::Registry;

const META_KEY: &str = "entwine";
const SLEEP_COUNT: u64 = 65536 * 24;
const SLEEP_COUNT_SINGLE: u64 = 65536 * 256;

// Everything the per-file tasks share.  The builder owns it exclusively
// through the Arc; workers get the Arc by value and only ever borrow.
struct BuildState {
	out: Arc<dyn Endpoint>,
	tmp: Arc<dyn Endpoint>,
	source: Option<Arc<dyn Endpoint>>,
	reader: Arc<dyn Reader>,
	bounds: RwLock<Option<Bounds>>,
	schema: Schema,
	structure: Structure,
	reprojection: Option<Reprojection>,
	srs: Mutex<String>,
	manifest: Mutex<Manifest>,
	stats: Stats,
	registry: Registry,
	pools: Arc<Pools>,
	compress: bool,
	trust_headers: bool,
	sleep_count: u64,
}

impl BuildState {
	fn materialize(&self, path: &str) -> Result<LocalHandle> {
		let p = Path::new(path);
		if self.source.is_none() || p.exists() {
			return Ok(LocalHandle::borrowed(p));
		}

		let source = self.source.as_ref().expect("checked above");
		let bytes = source.get(path)?;
		let name = path.replace(['/', '\\'], "-");
		self.tmp.put(&name, &bytes)?;
		Ok(LocalHandle::staged(self.tmp.root().join(name)))
	}

	fn note_srs(&self, srs: &str) {
		if srs.is_empty() {
			return;
		}
		let mut stored = self.srs.lock();
		if stored.is_empty() {
			*stored = srs.to_string();
		}
	}

	fn mark_errored(&self, origin: Origin) {
		self.manifest.lock().set_status(origin, FileStatus::Errored);
		self.stats.add_errored(1);
	}
}

pub struct Builder {
	state: Arc<BuildState>,
	pool: Pool,
	is_continuation: bool,
}

impl Builder {
	pub fn new(config: &Config, reader: Arc<dyn Reader>) -> Result<Builder> {
		if config.output.as_os_str().is_empty() {
			return Err(Error::Config("output path required".to_string()));
		}

		let out: Arc<dyn Endpoint> = Arc::new(DirEndpoint::new(&config.output));
		let tmp: Arc<dyn Endpoint> = Arc::new(DirEndpoint::new(&config.tmp));
		Builder::with_endpoints(config, out, tmp, None, reader)
	}

	pub fn with_endpoints(
		config: &Config,
		out: Arc<dyn Endpoint>,
		tmp: Arc<dyn Endpoint>,
		source: Option<Arc<dyn Endpoint>>,
		reader: Arc<dyn Reader>,
	) -> Result<Builder> {
		let schema = match &config.schema {
			Some(schema) => Schema::with_origin(schema.dims().to_vec())?,
			None => Schema::xyz(),
		};

		let structure = match &config.structure {
			Some(structure) => structure.clone(),
			None => Structure::new(10, 4, 10, 4096, true, None)?,
		};

		Builder::construct(
			out,
			tmp,
			source,
			reader,
			config.bounds,
			schema,
			structure,
			config.reprojection.clone(),
			config.srs.clone(),
			Manifest::new(),
			Stats::new(),
			config.compress,
			config.trust_headers,
			config.total_threads,
			config.sleep_count,
			&[],
			false,
		)
	}

	// Continuation: reopen an existing output and resume from its manifest.
	pub fn open(
		out: Arc<dyn Endpoint>,
		tmp: Arc<dyn Endpoint>,
		source: Option<Arc<dyn Endpoint>>,
		reader: Arc<dyn Reader>,
		total_threads: usize,
	) -> Result<Builder> {
		let bytes = out.get(META_KEY)?;
		let meta: Metadata = serde_json::from_slice(&bytes)?;
		let chunk_ids = meta.chunk_ids();

		Builder::construct(
			out,
			tmp,
			source,
			reader,
			Some(meta.bbox),
			meta.schema,
			meta.structure,
			meta.reprojection,
			meta.srs,
			meta.manifest,
			Stats::from(meta.stats),
			meta.compressed,
			meta.trust_headers,
			total_threads,
			None,
			&chunk_ids,
			true,
		)
	}

	#[allow(clippy::too_many_arguments)]
	fn construct(
		out: Arc<dyn Endpoint>,
		tmp: Arc<dyn Endpoint>,
		source: Option<Arc<dyn Endpoint>>,
		reader: Arc<dyn Reader>,
		bounds: Option<Bounds>,
		schema: Schema,
		structure: Structure,
		reprojection: Option<Reprojection>,
		srs: String,
		manifest: Manifest,
		stats: Stats,
		compress: bool,
		trust_headers: bool,
		total_threads: usize,
		sleep_count: Option<u64>,
		known_ids: &[u64],
		is_continuation: bool,
	) -> Result<Builder> {
		if !tmp.is_local() {
			return Err(Error::RemoteTmp);
		}
		mkdirp(tmp.root())?;
		if out.is_local() {
			mkdirp(out.root())?;
		}

		let workers = work_threads(total_threads);
		let sleep_count = sleep_count.unwrap_or(if workers == 1 {
			SLEEP_COUNT_SINGLE
		} else {
			SLEEP_COUNT
		});

		let pools = Arc::new(Pools::new(schema.point_size()));
		let registry = Registry::open(
			out.clone(),
			schema.clone(),
			structure.clone(),
			pools.clone(),
			compress,
			clip_threads(total_threads),
			known_ids,
		)?;

		let state = Arc::new(BuildState {
			out,
			tmp,
			source,
			reader,
			bounds: RwLock::new(bounds),
			schema,
			structure,
			reprojection,
			srs: Mutex::new(srs),
			manifest: Mutex::new(manifest),
			stats,
			registry,
			pools,
			compress,
			trust_headers,
			sleep_count,
		});

		Ok(Builder {
			state,
			pool: Pool::new(workers),
			is_continuation,
		})
	}

	pub fn is_continuation(&self) -> bool {
		self.is_continuation
	}

	pub fn bounds(&self) -> Option<Bounds> {
		*self.state.bounds.read()
	}

	pub fn stats(&self) -> crate::model::stats::StatsValues {
		self.state.stats.values()
	}

	// Queues one input.  False means the path contributes nothing: the
	// reader cannot handle it, or it was already added.
	pub fn insert(&self, path: &str) -> bool {
		if !self.state.reader.good(Path::new(path)) {
			if self.state.manifest.lock().add_omission(path) {
				self.state.stats.add_omitted(1);
			}
			return false;
		}

		let origin = self.state.manifest.lock().add(path);
		if origin == INVALID_ORIGIN {
			return false;
		}

		if self.state.bounds.read().is_none() {
			if let Err(e) = self.infer(path) {
				warn!("could not infer bounds from {}: {}", path, e);
				self.state.mark_errored(origin);
				return false;
			}
		}

		info!("adding {} - {}", origin, path);

		let state = self.state.clone();
		let path = path.to_string();
		self.pool.add(move || run_file(&state, origin, &path));

		true
	}

	// First-file bounds inference for configurations that supplied none:
	// header bounds when trusted, otherwise a full pre-read, rounded
	// outward to integers.
	fn infer(&self, path: &str) -> Result<()> {
		let local = self.state.materialize(path)?;
		let reprojection = self.state.reprojection.as_ref();

		let shallow = if self.state.trust_headers {
			self.state
				.reader
				.preview(local.path(), reprojection, false)
				.filter(|p| p.bounds.is_some())
		} else {
			None
		};

		let preview = match shallow {
			Some(preview) => preview,
			None => self
				.state
				.reader
				.preview(local.path(), reprojection, true)
				.filter(|p| p.bounds.is_some())
				.ok_or_else(|| {
					Error::Read(path.to_string(), "no bounds to infer from".to_string())
				})?,
		};

		let b = preview.bounds.expect("filtered above");
		let inferred = Bounds::new(
			Point::new(b.min.x.floor(), b.min.y.floor(), b.min.z.floor()),
			Point::new(b.max.x.ceil(), b.max.y.ceil(), b.max.z.ceil()),
			self.state.structure.is_3d(),
		);

		info!("inferred bounds from {}", path);
		*self.state.bounds.write() = Some(inferred);
		self.state.note_srs(&preview.srs);
		Ok(())
	}

	// Barrier: waits for queued files, surfacing the first fatal fault.
	pub fn join(&self) -> Result<()> {
		self.pool.join()?;
		self.state.registry.join()
	}

	// Joins the workers, persists metadata and the base chunk, and leaves
	// the pool open for further inserts.
	pub fn save(&self) -> Result<()> {
		self.pool.join()?;

		let ids = self.state.registry.save()?;
		let meta = self.metadata(ids)?;
		let key = format!("{}{}", META_KEY, self.state.structure.subset_postfix());
		self.state.out.put(&key, &serde_json::to_vec_pretty(&meta)?)?;

		Ok(())
	}

	fn metadata(&self, ids: Vec<u64>) -> Result<Metadata> {
		let bounds = (*self.state.bounds.read())
			.ok_or_else(|| Error::Config("no bounds established".to_string()))?;

		Ok(Metadata {
			bbox: bounds,
			schema: self.state.schema.clone(),
			structure: self.state.structure.clone(),
			reprojection: self.state.reprojection.clone(),
			manifest: self.state.manifest.lock().clone(),
			srs: self.state.srs.lock().clone(),
			stats: self.state.stats.values(),
			compressed: self.state.compress,
			trust_headers: self.state.trust_headers,
			ids: ids.iter().map(|id| id.to_string()).collect(),
		})
	}

	// Collapses the n subset outputs under this root into one whole-tree
	// index: base chunks merge cell-wise, ids union, stats sum.
	pub fn merge(out: Arc<dyn Endpoint>) -> Result<()> {
		let first: Metadata = serde_json::from_slice(&out.get(&format!("{}-0", META_KEY))?)?;

		let count = match first.structure.subset() {
			Some(subset) => subset.of,
			None => 0,
		};
		if count == 0 {
			return Err(Error::Merge("metadata is not a subset build".to_string()));
		}

		let schema = first.schema.clone();
		let pools = Pools::new(schema.point_size());
		let base_span = first.structure.base_span();
		let subset_base_id = first.structure.base_chunk_id();

		let mut stats = first.stats;
		let mut ids: std::collections::BTreeSet<u64> = first.chunk_ids().into_iter().collect();
		let mut base: Option<Chunk> = None;

		for i in 0..count {
			info!("merging {} / {}", i + 1, count);

			let meta: Metadata = if i == 0 {
				first.clone()
			} else {
				serde_json::from_slice(&out.get(&format!("{}-{}", META_KEY, i))?)?
			};

			if i > 0 {
				if meta.stats.out_of_bounds != stats.out_of_bounds {
					warn!(
						"out-of-bounds mismatch in segment {}: {} != {}",
						i, meta.stats.out_of_bounds, stats.out_of_bounds
					);
				}
				if meta.stats.omitted != stats.omitted || meta.stats.errored != stats.errored {
					warn!(
						"per-file stat mismatch in segment {}: omitted {} != {}, errored {} != {}",
						i, meta.stats.omitted, stats.omitted, meta.stats.errored, stats.errored
					);
				}
				stats.absorb(&meta.stats);
				ids.extend(meta.chunk_ids());
			}

			let bytes = out.get(&format!("{}-{}", subset_base_id, i))?;
			let chunk = Chunk::from_bytes(0, base_span, 0, &bytes, &schema, meta.compressed, &pools)?;

			match &base {
				None => base = Some(chunk),
				Some(merged) => merged.merge(&chunk, &pools),
			}
		}

		let mut structure = first.structure.clone();
		structure.make_whole();

		let base = base.expect("count > 0");
		let whole = Metadata {
			bbox: first.bbox,
			schema: schema.clone(),
			structure: structure.clone(),
			reprojection: first.reprojection.clone(),
			manifest: first.manifest.clone(),
			srs: first.srs.clone(),
			stats,
			compressed: first.compressed,
			trust_headers: first.trust_headers,
			ids: ids.iter().map(|id| id.to_string()).collect(),
		};

		out.put(META_KEY, &serde_json::to_vec_pretty(&whole)?)?;
		out.put(
			&structure.base_chunk_id().to_string(),
			&base.serialize(&schema, first.compressed),
		)?;

		Ok(())
	}
}

// The per-file work task.  Everything that can go wrong with one input is
// recorded in the manifest and swallowed; only endpoint faults from chunk
// I/O propagate, to surface at join() as fatal.
fn run_file(state: &BuildState, origin: Origin, path: &str) -> Result<()> {
	let local = match state.materialize(path) {
		Ok(local) => local,
		Err(e) => {
			warn!("could not materialize {}: {}", path, e);
			state.mark_errored(origin);
			return Ok(());
		}
	};

	let Some(bounds) = *state.bounds.read() else {
		state.mark_errored(origin);
		return Ok(());
	};
	let sub_bounds = state.structure.subset_bounds(&bounds);
	let reprojection = state.reprojection.as_ref();

	if state.trust_headers {
		if let Some(preview) = state.reader.preview(local.path(), reprojection, false) {
			state.note_srs(&preview.srs);

			if let Some(claimed) = preview.bounds {
				let global_miss = !claimed.overlaps(&bounds);
				let subset_miss = sub_bounds
					.as_ref()
					.map(|sub| !claimed.overlaps(sub))
					.unwrap_or(false);

				if global_miss || subset_miss {
					// Disjoint by its own header: skip the read entirely.
					// Only a global miss counts against the stats; subset
					// misses are someone else's points.
					if global_miss {
						state.stats.add_out_of_bounds(preview.num_points);
					}
					let mut manifest = state.manifest.lock();
					manifest.set_status(origin, FileStatus::Inserted);
					manifest.set_details(origin, preview.num_points, Some(claimed));
					return Ok(());
				}
			}
		}
	}

	let batches = match state.reader.read(local.path(), reprojection, &state.schema) {
		Ok(batches) => batches,
		Err(e) => {
			warn!("during {}: {}", path, e);
			state.mark_errored(origin);
			return Ok(());
		}
	};

	let mut clipper = Clipper::new(&state.registry);
	let mut z_range = if state.structure.is_3d() {
		None
	} else {
		Some(Range::new())
	};
	let mut since_recycle = 0u64;
	let mut file_points = 0u64;

	for batch in batches {
		let batch = match batch {
			Ok(batch) => batch,
			Err(e) => {
				warn!("during {}: {}", path, e);
				state.mark_errored(origin);
				return Ok(());
			}
		};

		let mut stack = state.pools.acquire(batch.len());

		for row in batch.rows() {
			let mut info = stack.pop().expect("stack sized to batch");
			info.data.copy_from_slice(row);
			state.schema.set_origin(&mut info.data, origin);
			let p = state.schema.point(&info.data);
			info.point = p;
			file_points += 1;

			if !bounds.contains(&p) {
				state.stats.add_out_of_bounds(1);
				state.pools.release(info);
				continue;
			}
			if let Some(sub) = &sub_bounds {
				if !sub.contains(&p) {
					state.pools.release(info);
					continue;
				}
			}

			let mut climber = Climber::new(bounds, &state.structure);
			match state.registry.add_point(info, &mut climber, &mut clipper) {
				Ok(true) => {
					state.stats.add_inserted(1);
					if let Some(z_range) = &mut z_range {
						z_range.grow(p.z);
					}
				}
				Ok(false) => state.stats.add_fall_through(1),
				Err(e) => {
					state.pools.release_stack(stack);
					return Err(e);
				}
			}

			since_recycle += 1;
			if since_recycle >= state.sleep_count {
				since_recycle = 0;
				// Recycling the clipper drops every chunk pin this worker
				// holds, bounding residency for arbitrarily large files.
				clipper = Clipper::new(&state.registry);
			}
		}
	}

	if let Some(z_range) = z_range {
		if z_range.exists() {
			let rounded = Range {
				min: z_range.min.floor(),
				max: z_range.max.ceil(),
			};
			if let Some(bounds) = state.bounds.write().as_mut() {
				bounds.grow_z(&rounded);
			}
		}
	}

	{
		let mut manifest = state.manifest.lock();
		manifest.set_status(origin, FileStatus::Inserted);
		manifest.set_details(origin, file_points, None);
	}
	info!("done {} - {}", origin, path);

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::structure::Subset;
	use crate::reader::mem::MemReader;
	use rand::rngs::StdRng;
	use rand::{Rng, SeedableRng};
	use std::collections::HashSet;
	use tempfile::tempdir;

	// Synthetic points on distinct depth-7 cells: no two share a leaf, so a
	// ten-deep tree absorbs every one of them.
	fn distinct_cloud(n: usize, seed: u64) -> Vec<Point> {
		let mut rng = StdRng::seed_from_u64(seed);
		let mut cells = HashSet::new();
		let mut points = Vec::new();

		while points.len() < n {
			let c = (
				rng.gen_range(0..128u16),
				rng.gen_range(0..128u16),
				rng.gen_range(0..128u16),
			);
			if cells.insert(c) {
				points.push(Point::new(
					(c.0 as f64 + 0.5) / 128.0,
					(c.1 as f64 + 0.5) / 128.0,
					(c.2 as f64 + 0.5) / 128.0,
				));
			}
		}
		points
	}

	fn unit_config(out: &Path, tmp: &Path) -> Config {
		Config {
			bounds: Some(Bounds::new(Point::empty(), Point::new(1.0, 1.0, 1.0), true)),
			structure: Some(Structure::new(10, 4, 10, 4096, true, None).unwrap()),
			trust_headers: false,
			total_threads: 8,
			tmp: tmp.to_path_buf(),
			output: out.to_path_buf(),
			..Config::default()
		}
	}

	fn chunk_location(structure: &Structure, id: u64) -> (u64, usize) {
		for depth in structure.base_depth()..structure.total_depth() {
			if id >= structure.index_begin(depth) && id < structure.index_begin(depth + 1) {
				return (structure.span(depth), depth);
			}
		}
		panic!("chunk id {} outside the cold range", id);
	}

	#[test]
	fn test_build_save_and_reload() {
		let out = tempdir().unwrap();
		let tmp = tempdir().unwrap();
		let n = 5000;

		let mut reader = MemReader::new();
		reader.add("cloud.mem", distinct_cloud(n, 7));

		let config = unit_config(out.path(), tmp.path());
		let builder = Builder::new(&config, Arc::new(reader)).unwrap();

		assert!(builder.insert("cloud.mem"));
		builder.save().unwrap();

		let v = builder.stats();
		assert_eq!(v.inserted, n as u64);
		assert_eq!(v.out_of_bounds, 0);
		assert_eq!(v.fall_through, 0);
		assert_eq!(builder.state.registry.resident(), 0);

		// The persisted metadata is a complete description of the build.
		let ep = DirEndpoint::new(out.path());
		let meta: Metadata = serde_json::from_slice(&ep.get("entwine").unwrap()).unwrap();
		assert!(!meta.ids.is_empty());
		assert_eq!(meta.manifest.files()[0].status, FileStatus::Inserted);
		assert_eq!(meta.manifest.files()[0].num_points, n as u64);
		assert_eq!(meta.stats.inserted, n as u64);

		// Any persisted cold chunk round-trips to its exact byte form.
		let pools = Pools::new(meta.schema.point_size());
		let id = meta.chunk_ids()[0];
		let (span, depth) = chunk_location(&meta.structure, id);
		let bytes = ep.get(&id.to_string()).unwrap();
		let chunk =
			Chunk::from_bytes(id, span, depth, &bytes, &meta.schema, false, &pools).unwrap();
		assert!(chunk.num_points() > 0);
		assert_eq!(chunk.serialize(&meta.schema, false), bytes);

		// Base and cold cells together hold every inserted point.
		let base_bytes = ep.get("0").unwrap();
		let base =
			Chunk::from_bytes(0, meta.structure.base_span(), 0, &base_bytes, &meta.schema, false, &pools)
				.unwrap();
		let cold_total: usize = meta
			.chunk_ids()
			.iter()
			.map(|&id| {
				let (span, depth) = chunk_location(&meta.structure, id);
				let bytes = ep.get(&id.to_string()).unwrap();
				Chunk::from_bytes(id, span, depth, &bytes, &meta.schema, false, &pools)
					.unwrap()
					.num_points()
			})
			.sum();
		assert_eq!(base.num_points() + cold_total, n);
	}

	#[test]
	fn test_trusted_headers_skip_disjoint_file() {
		let out = tempdir().unwrap();
		let tmp = tempdir().unwrap();

		let mut reader = MemReader::new();
		reader.add("in.mem", distinct_cloud(1000, 1));
		let far: Vec<Point> = (0..500)
			.map(|i| Point::new(10.0 + (i as f64) / 1000.0, 0.5, 0.5))
			.collect();
		reader.add("out.mem", far);

		let mut config = unit_config(out.path(), tmp.path());
		config.trust_headers = true;
		let builder = Builder::new(&config, Arc::new(reader)).unwrap();

		assert!(builder.insert("in.mem"));
		assert!(builder.insert("out.mem"));
		builder.save().unwrap();

		let v = builder.stats();
		assert_eq!(v.inserted, 1000);
		// The whole disjoint file is charged to out-of-bounds from its
		// header, without being read.
		assert_eq!(v.out_of_bounds, 500);
		assert_eq!(v.inserted + v.out_of_bounds + v.fall_through, 1500);

		let manifest = builder.state.manifest.lock();
		assert!(manifest
			.files()
			.iter()
			.all(|f| f.status == FileStatus::Inserted));
	}

	#[test]
	fn test_overlapping_claim_with_outside_points() {
		let out = tempdir().unwrap();
		let tmp = tempdir().unwrap();

		let mut reader = MemReader::new();
		let far: Vec<Point> = (0..300)
			.map(|i| Point::new(10.0 + (i as f64) / 1000.0, 0.5, 0.5))
			.collect();
		reader.add("liar.mem", far);
		// The header claims in-bounds coverage, so the file is read and
		// every point is rejected individually.
		reader.claim(
			"liar.mem",
			Bounds::new(Point::empty(), Point::new(1.0, 1.0, 1.0), true),
		);

		let mut config = unit_config(out.path(), tmp.path());
		config.trust_headers = true;
		let builder = Builder::new(&config, Arc::new(reader)).unwrap();

		assert!(builder.insert("liar.mem"));
		builder.save().unwrap();

		let v = builder.stats();
		assert_eq!(v.inserted, 0);
		assert_eq!(v.out_of_bounds, 300);
		assert_eq!(
			builder.state.manifest.lock().files()[0].status,
			FileStatus::Inserted
		);
	}

	#[test]
	fn test_duplicate_and_unreadable_paths() {
		let out = tempdir().unwrap();
		let tmp = tempdir().unwrap();

		let mut reader = MemReader::new();
		reader.add("a.mem", distinct_cloud(10, 3));

		let config = unit_config(out.path(), tmp.path());
		let builder = Builder::new(&config, Arc::new(reader)).unwrap();

		assert!(builder.insert("a.mem"));
		assert!(!builder.insert("a.mem"));
		assert!(!builder.insert("unknown.mem"));
		assert!(!builder.insert("unknown.mem"));

		builder.save().unwrap();

		// One omission row and one omitted count, however often the path
		// is retried.
		assert_eq!(builder.stats().omitted, 1);
		let manifest = builder.state.manifest.lock();
		assert_eq!(manifest.len(), 2);
		assert_eq!(manifest.files()[1].status, FileStatus::Omitted);
	}

	#[test]
	fn test_mid_stream_fault_is_contained() {
		let out = tempdir().unwrap();
		let tmp = tempdir().unwrap();

		let mut reader = MemReader::new();
		reader.add("good.mem", distinct_cloud(1000, 11));
		reader.add("bad.mem", distinct_cloud(1000, 13));
		reader.break_after("bad.mem", 100);

		let config = unit_config(out.path(), tmp.path());
		let builder = Builder::new(&config, Arc::new(reader)).unwrap();

		assert!(builder.insert("good.mem"));
		assert!(builder.insert("bad.mem"));
		builder.save().unwrap();

		let v = builder.stats();
		assert_eq!(v.errored, 1);
		// The good file is unaffected; the broken one contributed whatever
		// it yielded before failing.
		assert!(v.inserted >= 1000);

		let manifest = builder.state.manifest.lock();
		let bad = manifest.files().iter().find(|f| f.path == "bad.mem").unwrap();
		assert_eq!(bad.status, FileStatus::Errored);
	}

	#[test]
	fn test_save_load_save_is_stable() {
		let out = tempdir().unwrap();
		let tmp = tempdir().unwrap();

		let mut reader = MemReader::new();
		reader.add("cloud.mem", distinct_cloud(500, 17));
		let reader: Arc<dyn Reader> = Arc::new(reader);

		let config = unit_config(out.path(), tmp.path());
		let builder = Builder::new(&config, reader.clone()).unwrap();
		builder.insert("cloud.mem");
		builder.save().unwrap();

		let ep = DirEndpoint::new(out.path());
		let first = ep.get("entwine").unwrap();

		let reopened = Builder::open(
			Arc::new(DirEndpoint::new(out.path())),
			Arc::new(DirEndpoint::new(tmp.path())),
			None,
			reader,
			8,
		)
		.unwrap();
		assert!(reopened.is_continuation());
		reopened.save().unwrap();

		assert_eq!(ep.get("entwine").unwrap(), first);
	}

	#[test]
	fn test_continuation_accumulates() {
		let out = tempdir().unwrap();
		let tmp = tempdir().unwrap();

		let mut reader = MemReader::new();
		reader.add("a.mem", distinct_cloud(800, 19));
		reader.add("b.mem", distinct_cloud(700, 23));
		let reader: Arc<dyn Reader> = Arc::new(reader);

		let config = unit_config(out.path(), tmp.path());
		let builder = Builder::new(&config, reader.clone()).unwrap();
		builder.insert("a.mem");
		builder.save().unwrap();
		drop(builder);

		let builder = Builder::open(
			Arc::new(DirEndpoint::new(out.path())),
			Arc::new(DirEndpoint::new(tmp.path())),
			None,
			reader,
			8,
		)
		.unwrap();

		// The manifest remembers a.mem across the reopen.
		assert!(!builder.insert("a.mem"));
		assert!(builder.insert("b.mem"));
		builder.save().unwrap();

		let v = builder.stats();
		assert_eq!(v.inserted + v.fall_through, 1500);
		assert_eq!(builder.state.manifest.lock().len(), 2);
	}

	#[test]
	fn test_subset_merge_matches_whole_build() {
		let whole_out = tempdir().unwrap();
		let subset_out = tempdir().unwrap();
		let tmp = tempdir().unwrap();
		let n = 2000;
		let cloud = distinct_cloud(n, 29);
		let bad = distinct_cloud(100, 43);

		// Every build sees the identical input list, including a file that
		// fails mid-stream and a path no reader handles.
		let make_reader = || {
			let mut reader = MemReader::new();
			reader.add("cloud.mem", cloud.clone());
			reader.add("bad.mem", bad.clone());
			reader.break_after("bad.mem", 50);
			let reader: Arc<dyn Reader> = Arc::new(reader);
			reader
		};
		let feed = |builder: &Builder| {
			assert!(builder.insert("cloud.mem"));
			assert!(builder.insert("bad.mem"));
			assert!(!builder.insert("missing.mem"));
		};

		// Reference: one whole build.
		let config = unit_config(whole_out.path(), tmp.path());
		let whole = Builder::new(&config, make_reader()).unwrap();
		feed(&whole);
		whole.save().unwrap();
		let whole_stats = whole.stats();
		assert_eq!(
			whole_stats.inserted + whole_stats.fall_through,
			n as u64 + 50
		);
		assert_eq!(whole_stats.errored, 1);
		assert_eq!(whole_stats.omitted, 1);

		// The same input as two disjoint subsets of one output root.
		for id in 0..2 {
			let mut config = unit_config(subset_out.path(), tmp.path());
			config.structure = Some(
				Structure::new(10, 4, 10, 4096, true, Some(Subset { id, of: 2 })).unwrap(),
			);
			let part = Builder::new(&config, make_reader()).unwrap();
			feed(&part);
			part.save().unwrap();
		}

		let ep = Arc::new(DirEndpoint::new(subset_out.path()));
		Builder::merge(ep.clone()).unwrap();

		let merged: Metadata = serde_json::from_slice(&ep.get("entwine").unwrap()).unwrap();
		assert!(merged.structure.subset().is_none());
		assert_eq!(
			merged.stats.inserted + merged.stats.fall_through,
			whole_stats.inserted + whole_stats.fall_through
		);
		assert_eq!(merged.stats.out_of_bounds, whole_stats.out_of_bounds);
		// Both segments failed on the same file and omitted the same path;
		// the merged counts match the whole build instead of doubling.
		assert_eq!(merged.stats.errored, whole_stats.errored);
		assert_eq!(merged.stats.omitted, whole_stats.omitted);
		assert!(!merged.ids.is_empty());

		// The unified base chunk is readable under the whole-tree key, each
		// occupied cell holding exactly one point.
		let pools = Pools::new(merged.schema.point_size());
		let bytes = ep.get("0").unwrap();
		let base = Chunk::from_bytes(
			0,
			merged.structure.base_span(),
			0,
			&bytes,
			&merged.schema,
			false,
			&pools,
		)
		.unwrap();
		assert!(base.num_points() > 0);
	}

	#[test]
	fn test_merge_requires_subset_metadata() {
		let out = tempdir().unwrap();
		let tmp = tempdir().unwrap();

		let mut reader = MemReader::new();
		reader.add("cloud.mem", distinct_cloud(50, 31));

		// A whole build saved under a subset key it never had.
		let config = unit_config(out.path(), tmp.path());
		let builder = Builder::new(&config, Arc::new(reader)).unwrap();
		builder.insert("cloud.mem");
		builder.save().unwrap();

		let ep = DirEndpoint::new(out.path());
		let meta = ep.get("entwine").unwrap();
		ep.put("entwine-0", &meta).unwrap();

		assert!(matches!(
			Builder::merge(Arc::new(DirEndpoint::new(out.path()))),
			Err(Error::Merge(_))
		));
	}

	#[test]
	fn test_2d_build_grows_z_extent() {
		let out = tempdir().unwrap();
		let tmp = tempdir().unwrap();

		let mut rng = StdRng::seed_from_u64(37);
		let mut cells = HashSet::new();
		let mut points = Vec::new();
		while points.len() < 600 {
			let c = (rng.gen_range(0..128u16), rng.gen_range(0..128u16));
			if cells.insert(c) {
				points.push(Point::new(
					(c.0 as f64 + 0.5) / 128.0,
					(c.1 as f64 + 0.5) / 128.0,
					rng.gen_range(-3.2..7.8),
				));
			}
		}

		let mut reader = MemReader::new();
		reader.add("flat.mem", points);

		let mut config = unit_config(out.path(), tmp.path());
		config.bounds = Some(Bounds::new(Point::empty(), Point::new(1.0, 1.0, 0.0), false));
		config.structure = Some(Structure::new(10, 4, 10, 4096, false, None).unwrap());
		let builder = Builder::new(&config, Arc::new(reader)).unwrap();

		builder.insert("flat.mem");
		builder.save().unwrap();

		assert_eq!(builder.stats().inserted, 600);
		let bounds = builder.bounds().unwrap();
		// Placement ignored z, but the saved bbox reflects the data.
		assert!(bounds.min.z <= -3.0 && bounds.min.z >= -4.0);
		assert!(bounds.max.z >= 7.0 && bounds.max.z <= 8.0);
	}

	#[test]
	fn test_bounds_inferred_from_first_file() {
		let out = tempdir().unwrap();
		let tmp = tempdir().unwrap();

		let mut reader = MemReader::new();
		reader.add("cloud.mem", distinct_cloud(200, 41));

		let mut config = unit_config(out.path(), tmp.path());
		config.bounds = None;
		let builder = Builder::new(&config, Arc::new(reader)).unwrap();

		assert!(builder.insert("cloud.mem"));
		builder.save().unwrap();

		let bounds = builder.bounds().unwrap();
		// Rounded outward to integers around the unit cube.
		assert_eq!(bounds.min, Point::empty());
		assert_eq!(bounds.max, Point::new(1.0, 1.0, 1.0));
		assert_eq!(builder.stats().inserted, 200);
	}

	#[test]
	fn test_remote_tmp_rejected() {
		struct RemoteStub(DirEndpoint);
		impl Endpoint for RemoteStub {
			fn get(&self, key: &str) -> Result<Vec<u8>> {
				self.0.get(key)
			}
			fn put(&self, key: &str, data: &[u8]) -> Result<()> {
				self.0.put(key, data)
			}
			fn get_range(&self, key: &str, lo: u64, hi: u64) -> Result<Vec<u8>> {
				self.0.get_range(key, lo, hi)
			}
			fn is_local(&self) -> bool {
				false
			}
			fn root(&self) -> &Path {
				self.0.root()
			}
		}

		let out = tempdir().unwrap();
		let tmp = tempdir().unwrap();
		let config = unit_config(out.path(), tmp.path());

		let result = Builder::with_endpoints(
			&config,
			Arc::new(DirEndpoint::new(out.path())),
			Arc::new(RemoteStub(DirEndpoint::new(tmp.path()))),
			None,
			Arc::new(MemReader::new()),
		);

		assert!(matches!(result, Err(Error::RemoteTmp)));
	}
}
