use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::bounds::Bounds;

// Tree shape shared by every build of an index.  Depths [0, base_depth) live
// in the single always-resident base chunk, deeper levels are carved into
// cold chunks on the span schedule below.  All spans and level sizes are
// powers of two, so spans always divide their level.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StructureRepr", into = "StructureRepr")]
pub struct Structure {
	total_depth: usize,
	base_depth: usize,
	cold_depth: usize,
	nominal_chunk_points: u64,
	is_3d: bool,
	subset: Option<Subset>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Subset {
	pub id: u64,
	pub of: u64,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StructureRepr {
	total_depth: usize,
	base_depth: usize,
	cold_depth: usize,
	nominal_chunk_points: u64,
	is_3d: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	subset: Option<Subset>,
}

impl Structure {
	pub fn new(
		total_depth: usize,
		base_depth: usize,
		cold_depth: usize,
		nominal_chunk_points: u64,
		is_3d: bool,
		subset: Option<Subset>,
	) -> Result<Structure> {
		if cold_depth < base_depth || total_depth < cold_depth {
			return Err(Error::Structure(format!(
				"depths must be ordered: base {} <= cold {} <= total {}",
				base_depth, cold_depth, total_depth
			)));
		}
		if !nominal_chunk_points.is_power_of_two() {
			return Err(Error::Structure(format!(
				"nominal chunk points must be a power of two, got {}",
				nominal_chunk_points
			)));
		}

		let bits = if is_3d { 3 } else { 2 };
		if total_depth * bits >= 60 {
			return Err(Error::Structure(format!(
				"total depth {} too deep to index",
				total_depth
			)));
		}

		if let Some(subset) = subset {
			if !subset.of.is_power_of_two() || subset.of == 0 {
				return Err(Error::Structure(format!(
					"subset count must be a power of two, got {}",
					subset.of
				)));
			}
			if subset.id >= subset.of {
				return Err(Error::Structure(format!(
					"subset id {} out of range 0..{}",
					subset.id, subset.of
				)));
			}
		}

		Ok(Structure {
			total_depth,
			base_depth,
			cold_depth,
			nominal_chunk_points,
			is_3d,
			subset,
		})
	}

	pub fn total_depth(&self) -> usize {
		self.total_depth
	}

	pub fn base_depth(&self) -> usize {
		self.base_depth
	}

	pub fn cold_depth(&self) -> usize {
		self.cold_depth
	}

	pub fn nominal_chunk_points(&self) -> u64 {
		self.nominal_chunk_points
	}

	pub fn is_3d(&self) -> bool {
		self.is_3d
	}

	pub fn subset(&self) -> Option<Subset> {
		self.subset
	}

	pub fn factor(&self) -> u64 {
		if self.is_3d {
			8
		} else {
			4
		}
	}

	fn bits(&self) -> u32 {
		if self.is_3d {
			3
		} else {
			2
		}
	}

	pub fn level_size(&self, depth: usize) -> u64 {
		1u64 << (self.bits() as usize * depth)
	}

	// First node index of the given depth: (B^d - 1) / (B - 1).
	pub fn index_begin(&self, depth: usize) -> u64 {
		(self.level_size(depth) - 1) / (self.factor() - 1)
	}

	pub fn child_index(&self, parent: u64, parent_depth: usize, slot: usize) -> u64 {
		let begin = self.index_begin(parent_depth);
		self.index_begin(parent_depth + 1) + (parent - begin) * self.factor() + slot as u64
	}

	pub fn is_base_depth(&self, depth: usize) -> bool {
		depth < self.base_depth
	}

	// Cells covered by the always-resident base chunk.
	pub fn base_span(&self) -> u64 {
		self.index_begin(self.base_depth)
	}

	// Cold chunk span at a depth: the nominal span up to the cold depth,
	// doubling once per depth past it, clamped to the level size.
	pub fn span(&self, depth: usize) -> u64 {
		debug_assert!(depth >= self.base_depth && depth < self.total_depth);

		let level = self.level_size(depth);
		if depth < self.cold_depth {
			level.min(self.nominal_chunk_points)
		} else {
			let doublings = (depth - self.cold_depth + 1) as u32;
			let grown = self
				.nominal_chunk_points
				.checked_shl(doublings)
				.unwrap_or(u64::MAX);
			level.min(grown)
		}
	}

	// Resolves a cold node index to its chunk id (the index of the chunk's
	// first cell) and the offset within that chunk.
	pub fn chunk_of(&self, index: u64, depth: usize) -> (u64, u64, u64) {
		let begin = self.index_begin(depth);
		let span = self.span(depth);
		let offset = index - begin;

		(begin + (offset / span) * span, offset % span, span)
	}

	// The persistence key of the base chunk.
	pub fn base_chunk_id(&self) -> u64 {
		if self.subset.is_some() && self.base_depth > 0 {
			self.index_begin(self.base_depth - 1)
		} else {
			0
		}
	}

	pub fn subset_postfix(&self) -> String {
		match self.subset {
			Some(subset) => format!("-{}", subset.id),
			None => String::new(),
		}
	}

	// The slice of the root bounds this subset is responsible for: log2(of)
	// successive halvings on the widest axis, selected by the id bits from
	// most significant down.
	pub fn subset_bounds(&self, root: &Bounds) -> Option<Bounds> {
		let subset = self.subset?;
		let splits = subset.of.trailing_zeros();

		let mut bounds = *root;
		for bit in (0..splits).rev() {
			bounds = bounds.halve(subset.id & (1 << bit) != 0);
		}

		Some(bounds)
	}

	pub fn make_whole(&mut self) {
		self.subset = None;
	}
}

impl TryFrom<StructureRepr> for Structure {
	type Error = Error;

	fn try_from(r: StructureRepr) -> Result<Structure> {
		Structure::new(
			r.total_depth,
			r.base_depth,
			r.cold_depth,
			r.nominal_chunk_points,
			r.is_3d,
			r.subset,
		)
	}
}

impl From<Structure> for StructureRepr {
	fn from(s: Structure) -> StructureRepr {
		StructureRepr {
			total_depth: s.total_depth,
			base_depth: s.base_depth,
			cold_depth: s.cold_depth,
			nominal_chunk_points: s.nominal_chunk_points,
			is_3d: s.is_3d,
			subset: s.subset,
		}
	}
}
