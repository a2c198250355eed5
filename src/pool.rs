use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Sender};
use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

const WORK_TO_CLIP_RATIO: f64 = 0.47;

pub fn work_threads(total: usize) -> usize {
	((total as f64 * WORK_TO_CLIP_RATIO).round() as usize).max(1)
}

pub fn clip_threads(total: usize) -> usize {
	total.saturating_sub(work_threads(total)).max(4)
}

type Job = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

// A fixed set of worker threads fed from an unbounded queue.  join() is a
// barrier, not a shutdown: it waits for the queue to drain and surfaces the
// first fatal error, after which the pool keeps accepting work.
pub struct Pool {
	tx: Option<Sender<Job>>,
	inner: Arc<Inner>,
	handles: Vec<JoinHandle<()>>,
	size: usize,
}

struct Inner {
	pending: Mutex<usize>,
	done: Condvar,
	error: Mutex<Option<Error>>,
}

impl Pool {
	pub fn new(size: usize) -> Pool {
		let size = size.max(1);
		let (tx, rx) = channel::unbounded::<Job>();
		let inner = Arc::new(Inner {
			pending: Mutex::new(0),
			done: Condvar::new(),
			error: Mutex::new(None),
		});

		let handles = (0..size)
			.map(|_| {
				let rx = rx.clone();
				let inner = inner.clone();
				std::thread::spawn(move || {
					for job in rx.iter() {
						let result = panic::catch_unwind(AssertUnwindSafe(job))
							.unwrap_or_else(|_| Err(Error::Read("worker".to_string(), "panicked".to_string())));

						if let Err(e) = result {
							let mut error = inner.error.lock();
							if error.is_none() {
								*error = Some(e);
							}
						}

						let mut pending = inner.pending.lock();
						*pending -= 1;
						if *pending == 0 {
							inner.done.notify_all();
						}
					}
				})
			})
			.collect();

		Pool {
			tx: Some(tx),
			inner,
			handles,
			size,
		}
	}

	pub fn size(&self) -> usize {
		self.size
	}

	pub fn add<F>(&self, job: F)
	where
		F: FnOnce() -> Result<()> + Send + 'static,
	{
		*self.inner.pending.lock() += 1;
		self.tx
			.as_ref()
			.expect("pool closed")
			.send(Box::new(job))
			.expect("workers alive while pool exists");
	}

	pub fn join(&self) -> Result<()> {
		let mut pending = self.inner.pending.lock();
		while *pending > 0 {
			self.inner.done.wait(&mut pending);
		}
		drop(pending);

		match self.inner.error.lock().take() {
			Some(e) => Err(e),
			None => Ok(()),
		}
	}
}

impl Drop for Pool {
	fn drop(&mut self) {
		self.tx.take();
		for handle in self.handles.drain(..) {
			let _ = handle.join();
		}
	}
}
