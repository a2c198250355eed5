use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

// Monotonic build counters, incremented lock-free from the work threads.
#[derive(Debug, Default)]
pub struct Stats {
	inserted: AtomicU64,
	out_of_bounds: AtomicU64,
	fall_through: AtomicU64,
	omitted: AtomicU64,
	errored: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsValues {
	pub inserted: u64,
	pub out_of_bounds: u64,
	pub fall_through: u64,
	pub omitted: u64,
	pub errored: u64,
}

impl Stats {
	pub fn new() -> Stats {
		Stats::default()
	}

	pub fn add_inserted(&self, n: u64) {
		self.inserted.fetch_add(n, Ordering::Relaxed);
	}

	pub fn add_out_of_bounds(&self, n: u64) {
		self.out_of_bounds.fetch_add(n, Ordering::Relaxed);
	}

	pub fn add_fall_through(&self, n: u64) {
		self.fall_through.fetch_add(n, Ordering::Relaxed);
	}

	pub fn add_omitted(&self, n: u64) {
		self.omitted.fetch_add(n, Ordering::Relaxed);
	}

	pub fn add_errored(&self, n: u64) {
		self.errored.fetch_add(n, Ordering::Relaxed);
	}

	pub fn values(&self) -> StatsValues {
		StatsValues {
			inserted: self.inserted.load(Ordering::Relaxed),
			out_of_bounds: self.out_of_bounds.load(Ordering::Relaxed),
			fall_through: self.fall_through.load(Ordering::Relaxed),
			omitted: self.omitted.load(Ordering::Relaxed),
			errored: self.errored.load(Ordering::Relaxed),
		}
	}
}

impl From<StatsValues> for Stats {
	fn from(v: StatsValues) -> Stats {
		Stats {
			inserted: AtomicU64::new(v.inserted),
			out_of_bounds: AtomicU64::new(v.out_of_bounds),
			fall_through: AtomicU64::new(v.fall_through),
			omitted: AtomicU64::new(v.omitted),
			errored: AtomicU64::new(v.errored),
		}
	}
}

impl StatsValues {
	// Fold another segment's per-point counters in.  out_of_bounds is
	// taken against the global bounds, and omitted/errored are per-file
	// counts over the identical input list every segment processes, so all
	// three repeat across segments and are carried over unchanged rather
	// than multiplied by the segment count.
	pub fn absorb(&mut self, other: &StatsValues) {
		self.inserted += other.inserted;
		self.fall_through += other.fall_through;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_counters() {
		let stats = Stats::new();
		stats.add_inserted(10);
		stats.add_inserted(1);
		stats.add_out_of_bounds(3);
		stats.add_fall_through(2);

		let v = stats.values();
		assert_eq!(v.inserted, 11);
		assert_eq!(v.out_of_bounds, 3);
		assert_eq!(v.fall_through, 2);
		assert_eq!(v.omitted, 0);
	}

	#[test]
	fn test_absorb_sums_per_point_counters_only() {
		let mut a = StatsValues {
			inserted: 5,
			out_of_bounds: 7,
			fall_through: 1,
			omitted: 2,
			errored: 1,
		};
		let b = StatsValues {
			inserted: 3,
			out_of_bounds: 7,
			fall_through: 2,
			omitted: 2,
			errored: 1,
		};
		a.absorb(&b);
		assert_eq!(a.inserted, 8);
		assert_eq!(a.fall_through, 3);
		// Every segment sees the same files and the same global bounds;
		// these repeat rather than add.
		assert_eq!(a.out_of_bounds, 7);
		assert_eq!(a.omitted, 2);
		assert_eq!(a.errored, 1);
	}
}
