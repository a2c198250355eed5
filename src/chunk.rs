use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use byteorder::{ByteOrder, LittleEndian};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::model::point::Point;
use crate::model::schema::Schema;
use crate::points::{PointInfo, Pools, Stack};

pub enum Insertion {
	Placed,
	// The cell was already owned; the incoming record is handed back so the
	// caller can continue its descent.
	Collision(PointInfo),
}

// A dense array of cells covering the contiguous index range
// [id, id + span).  Cells are claimed exactly once per chunk lifetime:
// first-writer-wins, and an occupant never moves until the whole chunk is
// evicted.  Each cell has its own lock, so writers to different cells of
// one chunk never contend.
pub struct Chunk {
	id: u64,
	span: u64,
	depth: usize,
	cells: Vec<Mutex<Option<PointInfo>>>,
	count: AtomicUsize,
	dirty: AtomicBool,
}

impl Chunk {
	pub fn new(id: u64, span: u64, depth: usize) -> Chunk {
		let mut cells = Vec::with_capacity(span as usize);
		cells.resize_with(span as usize, || Mutex::new(None));

		Chunk {
			id,
			span,
			depth,
			cells,
			count: AtomicUsize::new(0),
			dirty: AtomicBool::new(false),
		}
	}

	pub fn id(&self) -> u64 {
		self.id
	}

	pub fn span(&self) -> u64 {
		self.span
	}

	pub fn depth(&self) -> usize {
		self.depth
	}

	pub fn num_points(&self) -> usize {
		self.count.load(Ordering::Relaxed)
	}

	pub fn is_dirty(&self) -> bool {
		self.dirty.load(Ordering::Relaxed)
	}

	pub fn insert(&self, offset: u64, info: PointInfo) -> Insertion {
		let mut cell = self.cells[offset as usize].lock();

		match *cell {
			Some(_) => Insertion::Collision(info),
			None => {
				*cell = Some(info);
				self.count.fetch_add(1, Ordering::Relaxed);
				self.dirty.store(true, Ordering::Relaxed);
				Insertion::Placed
			}
		}
	}

	pub fn read(&self, offset: u64) -> Option<(Point, Vec<u8>)> {
		let cell = self.cells[offset as usize].lock();
		cell.as_ref().map(|info| (info.point, info.data.clone()))
	}

	// Dense on-disk form: 8-byte little-endian span, occupancy bitmap of
	// ceil(span / 8) bytes, then the packed payloads of non-empty cells in
	// cell order.  With compression on, everything after the span is
	// gzip-wrapped.
	pub fn serialize(&self, schema: &Schema, compressed: bool) -> Vec<u8> {
		let bitmap_len = (self.span as usize + 7) / 8;
		let mut bitmap = vec![0u8; bitmap_len];
		let mut payload = Vec::with_capacity(self.num_points() * schema.point_size());

		for (i, cell) in self.cells.iter().enumerate() {
			let cell = cell.lock();
			if let Some(info) = cell.as_ref() {
				bitmap[i / 8] |= 1 << (i % 8);
				payload.extend_from_slice(&info.data);
			}
		}

		let mut out = vec![0u8; 8];
		LittleEndian::write_u64(&mut out, self.span);

		if compressed {
			let mut encoder = GzEncoder::new(out, Compression::default());
			encoder.write_all(&bitmap).expect("vec write");
			encoder.write_all(&payload).expect("vec write");
			encoder.finish().expect("vec write")
		} else {
			out.extend_from_slice(&bitmap);
			out.extend_from_slice(&payload);
			out
		}
	}

	pub fn from_bytes(
		id: u64,
		span: u64,
		depth: usize,
		bytes: &[u8],
		schema: &Schema,
		compressed: bool,
		pools: &Pools,
	) -> Result<Chunk> {
		if bytes.len() < 8 {
			return Err(Error::Chunk(id, "truncated header".to_string()));
		}

		let stored_span = LittleEndian::read_u64(bytes);
		if stored_span != span {
			return Err(Error::Chunk(
				id,
				format!("span mismatch: stored {}, expected {}", stored_span, span),
			));
		}

		let body = if compressed {
			let mut decoder = GzDecoder::new(&bytes[8..]);
			let mut body = Vec::new();
			decoder
				.read_to_end(&mut body)
				.map_err(|e| Error::Chunk(id, e.to_string()))?;
			body
		} else {
			bytes[8..].to_vec()
		};

		let bitmap_len = (span as usize + 7) / 8;
		if body.len() < bitmap_len {
			return Err(Error::Chunk(id, "truncated bitmap".to_string()));
		}
		let (bitmap, packed) = body.split_at(bitmap_len);

		let point_size = schema.point_size();
		let occupied: Vec<usize> = (0..span as usize)
			.filter(|i| bitmap[i / 8] & (1 << (i % 8)) != 0)
			.collect();

		if packed.len() != occupied.len() * point_size {
			return Err(Error::Chunk(
				id,
				format!(
					"payload size {} does not match {} occupied cells",
					packed.len(),
					occupied.len()
				),
			));
		}

		let chunk = Chunk::new(id, span, depth);
		let mut infos = pools.acquire(occupied.len());

		for (slot, i) in occupied.iter().enumerate() {
			let mut info = infos.pop().expect("stack sized to occupancy");
			let at = slot * point_size;
			info.data.copy_from_slice(&packed[at..at + point_size]);
			info.point = schema.point(&info.data);

			*chunk.cells[*i].lock() = Some(info);
		}
		chunk.count.store(occupied.len(), Ordering::Relaxed);

		Ok(chunk)
	}

	// Cell-wise union for combining subset base chunks: the first writer
	// keeps the cell, later arrivals are returned to the pool.
	pub fn merge(&self, other: &Chunk, pools: &Pools) {
		debug_assert_eq!(self.span, other.span);

		for (i, cell) in other.cells.iter().enumerate() {
			let Some(info) = cell.lock().take() else {
				continue;
			};
			other.count.fetch_sub(1, Ordering::Relaxed);

			let mut mine = self.cells[i].lock();
			if mine.is_none() {
				*mine = Some(info);
				self.count.fetch_add(1, Ordering::Relaxed);
				self.dirty.store(true, Ordering::Relaxed);
			} else {
				pools.release(info);
			}
		}
	}

	// Returns every resident record to the pools, leaving the chunk empty.
	pub fn drain(&self, pools: &Pools) {
		let mut stack = Stack::new();
		for cell in &self.cells {
			if let Some(info) = cell.lock().take() {
				stack.push(info);
			}
		}
		self.count.store(0, Ordering::Relaxed);
		pools.release_stack(stack);
	}
}
