//! Chunked, throttled batch consumption with bounded buffering.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::task::spawn;

/// Tuning for a [`ThrottledWorker`].
#[derive(Debug, Clone, Copy)]
pub struct ThrottledWorkerOptions {
	/// Most units handed to the handler per invocation.
	pub max_work_chunk_size: usize,
	/// Cap on buffered (not yet processed) units; `None` is unbounded.
	pub max_buffered_work: Option<usize>,
	/// Pause between handler invocations while a backlog remains.
	pub throttle_delay: Duration,
	/// Apply the pause to fresh work arriving after an idle period too.
	pub wait_throttle_delay_between_work_units: bool,
}

impl Default for ThrottledWorkerOptions {
	fn default() -> Self {
		Self {
			max_work_chunk_size: 100,
			max_buffered_work: None,
			throttle_delay: Duration::from_millis(16),
			wait_throttle_delay_between_work_units: false,
		}
	}
}

struct WorkerState<T> {
	pending: VecDeque<T>,
	// Invalidates scheduled ticks from earlier bursts.
	generation: u64,
	throttled: bool,
	last_run: Option<Instant>,
	disposed: bool,
}

struct WorkerInner<T> {
	options: ThrottledWorkerOptions,
	handler: Box<dyn Fn(Vec<T>) + Send + Sync>,
	state: Mutex<WorkerState<T>>,
}

/// Accepts bursts of units, processes what fits into the first chunk right
/// away, and drains the rest in throttled chunks.
///
/// `work` reports false, without buffering anything, when accepting the burst
/// would exceed the buffer cap or when the worker is disposed.
pub struct ThrottledWorker<T> {
	inner: Arc<WorkerInner<T>>,
}

impl<T> Clone for ThrottledWorker<T> {
	fn clone(&self) -> Self {
		Self { inner: Arc::clone(&self.inner) }
	}
}

impl<T: Send + 'static> ThrottledWorker<T> {
	/// Creates a worker delivering chunks to `handler`.
	pub fn new(options: ThrottledWorkerOptions, handler: impl Fn(Vec<T>) + Send + Sync + 'static) -> Self {
		assert!(options.max_work_chunk_size > 0, "chunks need at least one unit");
		Self {
			inner: Arc::new(WorkerInner {
				options,
				handler: Box::new(handler),
				state: Mutex::new(WorkerState {
					pending: VecDeque::new(),
					generation: 0,
					throttled: false,
					last_run: None,
					disposed: false,
				}),
			}),
		}
	}

	/// Units accepted but not yet handed to the handler.
	pub fn pending(&self) -> usize {
		self.inner
			.state
			.lock()
			.map(|state| state.pending.len())
			.unwrap_or(0)
	}

	/// Offers a burst of units. Returns whether they were accepted.
	pub fn work(&self, units: impl IntoIterator<Item = T>) -> bool {
		let units: Vec<T> = units.into_iter().collect();
		let chunk = {
			let Ok(mut state) = self.inner.state.lock() else {
				return false;
			};
			if state.disposed {
				return false;
			}
			if let Some(cap) = self.inner.options.max_buffered_work {
				let headroom = if state.throttled {
					// Everything would sit in the buffer.
					cap
				} else {
					// The first chunk is processed immediately and never
					// occupies the buffer.
					cap + self.inner.options.max_work_chunk_size
				};
				if state.pending.len() + units.len() > headroom {
					return false;
				}
			}
			state.pending.extend(units);
			if state.throttled {
				// The scheduled tick picks the new units up.
				return true;
			}
			if self.inner.options.wait_throttle_delay_between_work_units {
				let since_last = state.last_run.map(|at| at.elapsed());
				if let Some(elapsed) = since_last {
					if elapsed < self.inner.options.throttle_delay {
						let remaining = self.inner.options.throttle_delay - elapsed;
						Self::schedule(&self.inner, &mut state, remaining);
						return true;
					}
				}
			}
			Self::take_chunk(&self.inner, &mut state)
		};
		(self.inner.handler)(chunk);
		true
	}

	/// Drops buffered units and stops accepting work.
	pub fn dispose(&self) {
		let Ok(mut state) = self.inner.state.lock() else {
			return;
		};
		state.disposed = true;
		state.generation += 1;
		state.throttled = false;
		state.pending.clear();
	}

	// Splits off one chunk and schedules a tick for the remainder.
	fn take_chunk(inner: &Arc<WorkerInner<T>>, state: &mut WorkerState<T>) -> Vec<T> {
		state.last_run = Some(Instant::now());
		let take = inner.options.max_work_chunk_size.min(state.pending.len());
		let chunk: Vec<T> = state.pending.drain(..take).collect();
		if state.pending.is_empty() {
			state.throttled = false;
		} else {
			Self::schedule(inner, state, inner.options.throttle_delay);
		}
		chunk
	}

	fn schedule(inner: &Arc<WorkerInner<T>>, state: &mut WorkerState<T>, delay: Duration) {
		state.throttled = true;
		state.generation += 1;
		let generation = state.generation;
		let inner = Arc::clone(inner);
		spawn("throttled_worker.tick", async move {
			tokio::time::sleep(delay).await;
			let chunk = {
				let Ok(mut state) = inner.state.lock() else {
					return;
				};
				if state.disposed || state.generation != generation {
					return;
				}
				if state.pending.is_empty() {
					state.throttled = false;
					return;
				}
				Self::take_chunk(&inner, &mut state)
			};
			(inner.handler)(chunk);
		});
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	fn collecting_worker(options: ThrottledWorkerOptions) -> (ThrottledWorker<u32>, Arc<Mutex<Vec<Vec<u32>>>>) {
		let chunks: Arc<Mutex<Vec<Vec<u32>>>> = Arc::new(Mutex::new(Vec::new()));
		let sink = Arc::clone(&chunks);
		let worker = ThrottledWorker::new(options, move |chunk| {
			sink.lock().unwrap().push(chunk);
		});
		(worker, chunks)
	}

	// ── chunking ──

	#[tokio::test]
	async fn processes_the_first_chunk_synchronously() {
		let (worker, chunks) = collecting_worker(ThrottledWorkerOptions {
			max_work_chunk_size: 2,
			throttle_delay: Duration::from_millis(500),
			..Default::default()
		});
		assert!(worker.work([1, 2, 3, 4, 5]));
		assert_eq!(*chunks.lock().unwrap(), vec![vec![1, 2]]);
		assert_eq!(worker.pending(), 3);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn drains_the_backlog_in_throttled_chunks() {
		let (worker, chunks) = collecting_worker(ThrottledWorkerOptions {
			max_work_chunk_size: 2,
			throttle_delay: Duration::from_millis(10),
			..Default::default()
		});
		assert!(worker.work([1, 2, 3, 4, 5]));
		tokio::time::sleep(Duration::from_millis(300)).await;
		assert_eq!(worker.pending(), 0);
		assert_eq!(
			*chunks.lock().unwrap(),
			vec![vec![1, 2], vec![3, 4], vec![5]]
		);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn work_arriving_while_throttled_joins_the_backlog() {
		let (worker, chunks) = collecting_worker(ThrottledWorkerOptions {
			max_work_chunk_size: 2,
			throttle_delay: Duration::from_millis(20),
			..Default::default()
		});
		assert!(worker.work([1, 2, 3]));
		assert!(worker.work([4]));
		tokio::time::sleep(Duration::from_millis(300)).await;
		assert_eq!(
			*chunks.lock().unwrap(),
			vec![vec![1, 2], vec![3, 4]]
		);
	}

	// ── buffer cap ──

	#[tokio::test]
	async fn rejects_bursts_that_overflow_the_buffer() {
		let (worker, chunks) = collecting_worker(ThrottledWorkerOptions {
			max_work_chunk_size: 2,
			max_buffered_work: Some(2),
			throttle_delay: Duration::from_millis(500),
			..Default::default()
		});
		// 2 processed immediately + 2 buffered fits exactly.
		assert!(worker.work([1, 2, 3, 4]));
		// The worker is throttled now, so nothing more fits.
		assert!(!worker.work([5]));
		assert_eq!(worker.pending(), 2);
		assert_eq!(*chunks.lock().unwrap(), vec![vec![1, 2]]);
	}

	#[tokio::test]
	async fn rejects_oversized_bursts_when_idle() {
		let (worker, _) = collecting_worker(ThrottledWorkerOptions {
			max_work_chunk_size: 2,
			max_buffered_work: Some(1),
			throttle_delay: Duration::from_millis(500),
			..Default::default()
		});
		// 2 would run now, but 2 would need buffering with a cap of 1.
		assert!(!worker.work([1, 2, 3, 4]));
		assert_eq!(worker.pending(), 0);
	}

	// ── pacing fresh work ──

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn spaces_out_fresh_work_when_asked_to() {
		let handled = Arc::new(AtomicUsize::new(0));
		let sink = Arc::clone(&handled);
		let worker: ThrottledWorker<u32> = ThrottledWorker::new(
			ThrottledWorkerOptions {
				max_work_chunk_size: 10,
				throttle_delay: Duration::from_millis(60),
				wait_throttle_delay_between_work_units: true,
				..Default::default()
			},
			move |chunk| {
				sink.fetch_add(chunk.len(), Ordering::SeqCst);
			},
		);
		assert!(worker.work([1]));
		assert_eq!(handled.load(Ordering::SeqCst), 1);
		// Within the delay the second unit is deferred, not processed inline.
		assert!(worker.work([2]));
		assert_eq!(handled.load(Ordering::SeqCst), 1);
		tokio::time::sleep(Duration::from_millis(300)).await;
		assert_eq!(handled.load(Ordering::SeqCst), 2);
	}

	// ── dispose ──

	#[tokio::test]
	async fn dispose_drops_the_backlog_and_refuses_work() {
		let (worker, chunks) = collecting_worker(ThrottledWorkerOptions {
			max_work_chunk_size: 1,
			throttle_delay: Duration::from_millis(500),
			..Default::default()
		});
		assert!(worker.work([1, 2, 3]));
		worker.dispose();
		assert_eq!(worker.pending(), 0);
		assert!(!worker.work([4]));
		assert_eq!(*chunks.lock().unwrap(), vec![vec![1]]);
	}
}
