use crate::model::bounds::Bounds;
use crate::model::point::Point;
use crate::model::structure::Structure;

// Location of one cold cell: the owning chunk and the cell's slot in it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkKey {
	pub id: u64,
	pub offset: u64,
	pub span: u64,
	pub depth: usize,
}

// Descent cursor through the tree.  Starts at the root and steps one level
// per down(), shrinking its bounds to the child containing the point and
// tracking the sparse node index as it goes.
pub struct Climber<'a> {
	structure: &'a Structure,
	bounds: Bounds,
	index: u64,
	depth: usize,
}

impl<'a> Climber<'a> {
	pub fn new(root: Bounds, structure: &'a Structure) -> Climber<'a> {
		Climber {
			structure,
			bounds: root,
			index: 0,
			depth: 0,
		}
	}

	pub fn depth(&self) -> usize {
		self.depth
	}

	pub fn index(&self) -> u64 {
		self.index
	}

	pub fn bounds(&self) -> &Bounds {
		&self.bounds
	}

	pub fn down(&mut self, p: &Point) {
		let slot = self.bounds.child_of(p);
		self.index = self.structure.child_index(self.index, self.depth, slot);
		self.bounds = self.bounds.split(slot);
		self.depth += 1;
	}

	pub fn chunk(&self) -> ChunkKey {
		let (id, offset, span) = self.structure.chunk_of(self.index, self.depth);
		ChunkKey {
			id,
			offset,
			span,
			depth: self.depth,
		}
	}
}
