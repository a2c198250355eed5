use serde::{Deserialize, Serialize};

use crate::model::point::Point;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bounds {
	pub min: Point,
	pub max: Point,
	pub is_3d: bool,
}

impl Bounds {
	pub fn new(min: Point, max: Point, is_3d: bool) -> Bounds {
		Bounds { min, max, is_3d }
	}

	// Inverted bounds which grow() into the union of everything fed to them.
	pub fn expander(is_3d: bool) -> Bounds {
		Bounds {
			min: Point::infinity(),
			max: Point::neg_infinity(),
			is_3d,
		}
	}

	pub fn exists(&self) -> bool {
		self.min.x <= self.max.x && self.min.y <= self.max.y && self.min.z <= self.max.z
	}

	pub fn mid(&self) -> Point {
		Point {
			x: (self.min.x + self.max.x) / 2.0,
			y: (self.min.y + self.max.y) / 2.0,
			z: (self.min.z + self.max.z) / 2.0,
		}
	}

	pub fn contains(&self, p: &Point) -> bool {
		let xy = p.x >= self.min.x && p.x <= self.max.x && p.y >= self.min.y && p.y <= self.max.y;

		if self.is_3d {
			xy && p.z >= self.min.z && p.z <= self.max.z
		} else {
			xy
		}
	}

	pub fn overlaps(&self, other: &Bounds) -> bool {
		let xy = self.min.x <= other.max.x
			&& self.max.x >= other.min.x
			&& self.min.y <= other.max.y
			&& self.max.y >= other.min.y;

		if self.is_3d && other.is_3d {
			xy && self.min.z <= other.max.z && self.max.z >= other.min.z
		} else {
			xy
		}
	}

	pub fn grow(&mut self, p: &Point) {
		self.min = Point::min(&self.min, p);
		self.max = Point::max(&self.max, p);
	}

	pub fn grow_bounds(&mut self, other: &Bounds) {
		self.min = Point::min(&self.min, &other.min);
		self.max = Point::max(&self.max, &other.max);
	}

	pub fn grow_z(&mut self, range: &Range) {
		if range.min < self.min.z {
			self.min.z = range.min;
		}
		if range.max > self.max.z {
			self.max.z = range.max;
		}
	}

	// Child slot for a contained point: bit 0 selects the high x half, bit 1
	// the high y half, bit 2 the high z half (3d only).  Halves split at the
	// midpoint, lower-inclusive.
	pub fn child_of(&self, p: &Point) -> usize {
		let mid = self.mid();
		let mut slot = 0;

		if p.x >= mid.x {
			slot |= 1;
		}
		if p.y >= mid.y {
			slot |= 2;
		}
		if self.is_3d && p.z >= mid.z {
			slot |= 4;
		}

		slot
	}

	pub fn split(&self, slot: usize) -> Bounds {
		let mid = self.mid();
		let mut min = self.min;
		let mut max = self.max;

		if slot & 1 != 0 {
			min.x = mid.x;
		} else {
			max.x = mid.x;
		}
		if slot & 2 != 0 {
			min.y = mid.y;
		} else {
			max.y = mid.y;
		}
		if self.is_3d {
			if slot & 4 != 0 {
				min.z = mid.z;
			} else {
				max.z = mid.z;
			}
		}

		Bounds {
			min,
			max,
			is_3d: self.is_3d,
		}
	}

	pub fn width(&self) -> f64 {
		self.max.x - self.min.x
	}

	pub fn depth(&self) -> f64 {
		self.max.y - self.min.y
	}

	pub fn height(&self) -> f64 {
		self.max.z - self.min.z
	}

	// Halve on the longest axis, keeping the lower or upper half.  Used to
	// carve subset bounds out of the root.
	pub fn halve(&self, upper: bool) -> Bounds {
		let mid = self.mid();
		let mut min = self.min;
		let mut max = self.max;

		let w = self.width();
		let d = self.depth();
		let h = if self.is_3d { self.height() } else { f64::NEG_INFINITY };

		if w >= d && w >= h {
			if upper {
				min.x = mid.x;
			} else {
				max.x = mid.x;
			}
		} else if d >= h {
			if upper {
				min.y = mid.y;
			} else {
				max.y = mid.y;
			}
		} else if upper {
			min.z = mid.z;
		} else {
			max.z = mid.z;
		}

		Bounds {
			min,
			max,
			is_3d: self.is_3d,
		}
	}
}

#[derive(Clone, Copy, Debug)]
pub struct Range {
	pub min: f64,
	pub max: f64,
}

impl Range {
	pub fn new() -> Range {
		Range {
			min: f64::INFINITY,
			max: f64::NEG_INFINITY,
		}
	}

	pub fn grow(&mut self, v: f64) {
		if v < self.min {
			self.min = v;
		}
		if v > self.max {
			self.max = v;
		}
	}

	pub fn exists(&self) -> bool {
		self.min <= self.max
	}
}

impl Default for Range {
	fn default() -> Range {
		Range::new()
	}
}
