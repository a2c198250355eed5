use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use log::debug;
use parking_lot::Mutex;

use crate::chunk::{Chunk, Insertion};
use crate::climber::{ChunkKey, Climber};
use crate::clipper::Clipper;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::model::schema::Schema;
use crate::model::structure::Structure;
use crate::points::{PointInfo, Pools};
use crate::pool::Pool;

enum SlotState {
	Vacant,
	Resident {
		chunk: Arc<Chunk>,
		refs: u64,
		last_use: u64,
	},
}

// One cache entry per chunk id.  The slot mutex serializes loading,
// flushing, and refcounting for that id, so exactly one chunk object exists
// per id and at most one persistence task is in flight for it; a fetch
// arriving mid-flush simply waits on the lock and reloads.
struct Slot {
	state: Mutex<SlotState>,
}

impl Default for Slot {
	fn default() -> Slot {
		Slot {
			state: Mutex::new(SlotState::Vacant),
		}
	}
}

// The global chunk cache: the always-resident base chunk, plus cold chunks
// pinned by worker clippers and written back through the clip pool as soon
// as their last pin is released.
pub struct Registry {
	endpoint: Arc<dyn Endpoint>,
	schema: Schema,
	structure: Structure,
	pools: Arc<Pools>,
	compressed: bool,
	base: Chunk,
	slots: DashMap<u64, Arc<Slot>>,
	ids: Mutex<BTreeSet<u64>>,
	clip_pool: Pool,
	tick: AtomicU64,
}

impl Registry {
	pub fn new(
		endpoint: Arc<dyn Endpoint>,
		schema: Schema,
		structure: Structure,
		pools: Arc<Pools>,
		compressed: bool,
		clip_threads: usize,
	) -> Result<Registry> {
		Registry::open(endpoint, schema, structure, pools, compressed, clip_threads, &[])
	}

	// Continuation form: picks up the base chunk persisted by an earlier
	// build and remembers which cold chunks already exist.
	pub fn open(
		endpoint: Arc<dyn Endpoint>,
		schema: Schema,
		structure: Structure,
		pools: Arc<Pools>,
		compressed: bool,
		clip_threads: usize,
		known_ids: &[u64],
	) -> Result<Registry> {
		let base_span = structure.base_span();
		let base_key = format!(
			"{}{}",
			structure.base_chunk_id(),
			structure.subset_postfix()
		);

		let base = if base_span == 0 {
			Chunk::new(0, 0, 0)
		} else {
			match endpoint.get(&base_key) {
				Ok(bytes) => {
					Chunk::from_bytes(0, base_span, 0, &bytes, &schema, compressed, &pools)?
				}
				Err(Error::NotFound(_)) => Chunk::new(0, base_span, 0),
				Err(e) => return Err(e),
			}
		};

		Ok(Registry {
			endpoint,
			schema,
			structure,
			pools,
			compressed,
			base,
			slots: DashMap::new(),
			ids: Mutex::new(known_ids.iter().copied().collect()),
			clip_pool: Pool::new(clip_threads),
			tick: AtomicU64::new(0),
		})
	}

	pub fn structure(&self) -> &Structure {
		&self.structure
	}

	pub fn base(&self) -> &Chunk {
		&self.base
	}

	fn key_of(&self, id: u64) -> String {
		format!("{}{}", id, self.structure.subset_postfix())
	}

	// The core insert: walk the climber down until the record claims a cell
	// or runs out of tree.  A collision leaves the occupant alone and sends
	// the incoming record one level deeper.
	pub fn add_point(
		&self,
		info: PointInfo,
		climber: &mut Climber,
		clipper: &mut Clipper,
	) -> Result<bool> {
		let mut info = info;

		while climber.depth() < self.structure.total_depth() {
			let result = if self.structure.is_base_depth(climber.depth()) {
				self.base.insert(climber.index(), info)
			} else {
				let key = climber.chunk();
				let chunk = match clipper.get(key.id) {
					Some(chunk) => chunk,
					None => {
						let chunk = self.fetch_or_create(&key)?;
						clipper.track(key.id, chunk.clone());
						chunk
					}
				};
				chunk.insert(key.offset, info)
			};

			match result {
				Insertion::Placed => return Ok(true),
				Insertion::Collision(back) => {
					let p = back.point;
					info = back;
					climber.down(&p);
				}
			}
		}

		self.pools.release(info);
		Ok(false)
	}

	// Pins the chunk resident, loading or creating it if needed.  Many
	// workers may ask for the same id at once; the slot lock lets exactly
	// one of them do the I/O while the rest wait for the installed chunk.
	pub fn fetch_or_create(&self, key: &ChunkKey) -> Result<Arc<Chunk>> {
		let slot = self.slots.entry(key.id).or_default().value().clone();

		let mut state = slot.state.lock();
		let tick = self.tick.fetch_add(1, Ordering::Relaxed);

		match &mut *state {
			SlotState::Resident {
				chunk,
				refs,
				last_use,
			} => {
				*refs += 1;
				*last_use = tick;
				Ok(chunk.clone())
			}
			SlotState::Vacant => {
				let chunk = match self.endpoint.get(&self.key_of(key.id)) {
					Ok(bytes) => Arc::new(Chunk::from_bytes(
						key.id,
						key.span,
						key.depth,
						&bytes,
						&self.schema,
						self.compressed,
						&self.pools,
					)?),
					Err(Error::NotFound(_)) => {
						Arc::new(Chunk::new(key.id, key.span, key.depth))
					}
					Err(e) => return Err(e),
				};

				self.ids.lock().insert(key.id);
				*state = SlotState::Resident {
					chunk: chunk.clone(),
					refs: 1,
					last_use: tick,
				};
				Ok(chunk)
			}
		}
	}

	// Releases one clipper's pin.  The last pin schedules the chunk on the
	// clip pool, which serializes it, writes it through the endpoint, and
	// frees the cells.
	pub fn clip(&self, id: u64) {
		let Some(slot) = self.slots.get(&id).map(|entry| entry.value().clone()) else {
			return;
		};

		let flush = {
			let mut state = slot.state.lock();
			match &mut *state {
				SlotState::Resident { refs, .. } => {
					debug_assert!(*refs > 0);
					*refs -= 1;
					*refs == 0
				}
				SlotState::Vacant => false,
			}
		};

		if !flush {
			return;
		}

		let key = self.key_of(id);
		let schema = self.schema.clone();
		let compressed = self.compressed;
		let pools = self.pools.clone();
		let endpoint = self.endpoint.clone();

		self.clip_pool.add(move || {
			let mut state = slot.state.lock();

			// A fetch may have re-pinned the chunk between the schedule and
			// now; leave it resident in that case.
			let SlotState::Resident {
				chunk,
				refs: 0,
				last_use,
			} = &*state
			else {
				return Ok(());
			};

			debug!("evicting chunk {} (tick {})", id, last_use);

			if chunk.is_dirty() {
				let bytes = chunk.serialize(&schema, compressed);
				endpoint.put(&key, &bytes)?;
			}
			chunk.drain(&pools);
			*state = SlotState::Vacant;

			Ok(())
		});
	}

	// Barrier over outstanding evictions, surfacing the first I/O fault.
	pub fn join(&self) -> Result<()> {
		self.clip_pool.join()
	}

	// Flushes the base chunk and reports every cold chunk id this build has
	// touched, sorted.
	pub fn save(&self) -> Result<Vec<u64>> {
		self.join()?;

		// A zero base depth has no base cells; writing the empty chunk would
		// shadow cold chunk 0 under the same key.
		if self.base.span() > 0 {
			let base_key = format!(
				"{}{}",
				self.structure.base_chunk_id(),
				self.structure.subset_postfix()
			);
			let bytes = self.base.serialize(&self.schema, self.compressed);
			self.endpoint.put(&base_key, &bytes)?;
		}

		Ok(self.ids.lock().iter().copied().collect())
	}

	// Number of cold chunks currently resident; zero after a join once all
	// clippers are gone.
	pub fn resident(&self) -> usize {
		self.slots
			.iter()
			.filter(|entry| matches!(&*entry.state.lock(), SlotState::Resident { .. }))
			.count()
	}
}
