use std::collections::HashMap;
use std::sync::Arc;

use crate::chunk::Chunk;
use crate::registry::Registry;

// One worker's residency registration.  The first touch of a chunk pins it
// in the cache; dropping (or recycling) the clipper releases every pin at
// once, which is what lets cold chunks get evicted while a file is still
// streaming in.
pub struct Clipper<'a> {
	registry: &'a Registry,
	chunks: HashMap<u64, Arc<Chunk>>,
}

impl<'a> Clipper<'a> {
	pub fn new(registry: &'a Registry) -> Clipper<'a> {
		Clipper {
			registry,
			chunks: HashMap::new(),
		}
	}

	pub fn get(&self, id: u64) -> Option<Arc<Chunk>> {
		self.chunks.get(&id).cloned()
	}

	pub fn track(&mut self, id: u64, chunk: Arc<Chunk>) {
		self.chunks.insert(id, chunk);
	}

	pub fn len(&self) -> usize {
		self.chunks.len()
	}

	pub fn is_empty(&self) -> bool {
		self.chunks.is_empty()
	}
}

impl Drop for Clipper<'_> {
	fn drop(&mut self) {
		// Drop our chunk handles before unpinning so the flush worker sees
		// the last reference gone.
		let ids: Vec<u64> = self.chunks.keys().copied().collect();
		self.chunks.clear();

		for id in ids {
			self.registry.clip(id);
		}
	}
}
