//! Races, retries, and rate accounting.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::cancel::CancelableTask;
use crate::error::Interrupt;
use crate::task::spawn;

/// Resolves with the future's value, or `None` once the token fires first.
///
/// The losing future is dropped. Callers that need it to keep running race a
/// spawned handle ([`CancelableTask`], `JoinHandle`) instead of a bare future.
pub async fn race_cancellation<T, F>(fut: F, token: &CancellationToken) -> Option<T>
where
	F: Future<Output = T>,
{
	tokio::select! {
		biased;
		() = token.cancelled() => None,
		value = fut => Some(value),
	}
}

/// Like [`race_cancellation`], resolving with `default` on cancellation.
pub async fn race_cancellation_with<T, F>(fut: F, token: &CancellationToken, default: T) -> T
where
	F: Future<Output = T>,
{
	race_cancellation(fut, token).await.unwrap_or(default)
}

/// Like [`race_cancellation`], rejecting on cancellation.
pub async fn race_cancellation_error<T, F>(fut: F, token: &CancellationToken) -> Result<T, Interrupt>
where
	F: Future<Output = T>,
{
	race_cancellation(fut, token).await.ok_or(Interrupt::Canceled)
}

/// Resolves with the future's value, or `None` after `window`.
pub async fn race_timeout<T, F>(fut: F, window: Duration) -> Option<T>
where
	F: Future<Output = T>,
{
	tokio::time::timeout(window, fut).await.ok()
}

/// Like [`race_timeout`], invoking `on_timeout` exactly when the window wins.
pub async fn race_timeout_with<T, F, C>(fut: F, window: Duration, on_timeout: C) -> Option<T>
where
	F: Future<Output = T>,
	C: FnOnce(),
{
	match tokio::time::timeout(window, fut).await {
		Ok(value) => Some(value),
		Err(_) => {
			on_timeout();
			None
		}
	}
}

/// Runs factories one at a time, returning the first value `matches` accepts.
/// Later factories never start once a match is found.
pub async fn first<T, I, F, Fut, M>(factories: I, mut matches: M, default: T) -> T
where
	I: IntoIterator<Item = F>,
	F: FnOnce() -> Fut,
	Fut: Future<Output = T>,
	M: FnMut(&T) -> bool,
{
	for factory in factories {
		let value = factory().await;
		if matches(&value) {
			return value;
		}
	}
	default
}

/// Races already-running tasks, resolving with the first value `matches`
/// accepts. Whatever ends the race, every remaining task is canceled: on a
/// match, when all tasks settle without one, and when a task rejects.
pub async fn first_parallel<T, M>(tasks: Vec<CancelableTask<T>>, matches: M, default: T) -> Result<T, Interrupt>
where
	T: Send + 'static,
	M: Fn(&T) -> bool,
{
	if tasks.is_empty() {
		return Ok(default);
	}
	let tokens: Vec<CancellationToken> = tasks.iter().map(|task| task.token().clone()).collect();
	let cancel_rest = |tokens: &[CancellationToken]| {
		for token in tokens {
			token.cancel();
		}
	};
	let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
	for task in tasks {
		let tx = tx.clone();
		spawn("first_parallel.entry", async move {
			let _ = tx.send(task.await);
		});
	}
	drop(tx);
	while let Some(outcome) = rx.recv().await {
		match outcome {
			Ok(value) if matches(&value) => {
				cancel_rest(&tokens);
				return Ok(value);
			}
			Ok(_) => {}
			Err(err) => {
				cancel_rest(&tokens);
				return Err(err);
			}
		}
	}
	cancel_rest(&tokens);
	Ok(default)
}

/// Retries `factory` up to `attempts` times, doubling the pause after each
/// failure. The last error is returned when every attempt fails.
pub async fn retry<T, E, F, Fut>(mut factory: F, initial_delay: Duration, attempts: usize) -> Result<T, E>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, E>>,
{
	let attempts = attempts.max(1);
	let mut delay = initial_delay;
	let mut last_err = None;
	for attempt in 0..attempts {
		match factory().await {
			Ok(value) => return Ok(value),
			Err(err) => {
				last_err = Some(err);
				if attempt + 1 < attempts {
					tokio::time::sleep(delay).await;
					delay = delay.saturating_mul(2);
				}
			}
		}
	}
	match last_err {
		Some(err) => Err(err),
		None => unreachable!("at least one attempt always runs"),
	}
}

/// Drives every future to completion, then yields all values in input order
/// or the first error encountered. No future is abandoned on failure.
pub async fn settled<T, E, I, Fut>(futures: I) -> Result<Vec<T>, E>
where
	T: Send + 'static,
	E: Send + 'static,
	I: IntoIterator<Item = Fut>,
	Fut: Future<Output = Result<T, E>> + Send + 'static,
{
	let mut handles = Vec::new();
	for fut in futures {
		handles.push(spawn("settled.entry", fut));
	}
	let mut values = Vec::with_capacity(handles.len());
	let mut first_err = None;
	for handle in handles {
		match handle.await {
			Ok(Ok(value)) => values.push(value),
			Ok(Err(err)) => {
				if first_err.is_none() {
					first_err = Some(err);
				}
			}
			Err(_) => {}
		}
	}
	match first_err {
		Some(err) => Err(err),
		None => Ok(values),
	}
}

struct CounterState {
	window_start: Option<Instant>,
	value: u64,
}

/// Counts increments within a sliding quiet window; the count restarts at 1
/// once a full window has passed since the window began.
pub struct IntervalCounter {
	interval: Duration,
	clock: Box<dyn Fn() -> Instant + Send + Sync>,
	state: Mutex<CounterState>,
}

impl IntervalCounter {
	/// Creates a counter over the given window using the system clock.
	pub fn new(interval: Duration) -> Self {
		Self::with_clock(interval, Instant::now)
	}

	/// Creates a counter reading time from `clock`, for deterministic tests.
	pub fn with_clock(interval: Duration, clock: impl Fn() -> Instant + Send + Sync + 'static) -> Self {
		Self {
			interval,
			clock: Box::new(clock),
			state: Mutex::new(CounterState { window_start: None, value: 0 }),
		}
	}

	/// Bumps and returns the count within the current window.
	pub fn increment(&self) -> u64 {
		let now = (self.clock)();
		let Ok(mut state) = self.state.lock() else {
			return 0;
		};
		let expired = state
			.window_start
			.is_none_or(|start| now.duration_since(start) > self.interval);
		if expired {
			state.window_start = Some(now);
			state.value = 0;
		}
		state.value += 1;
		state.value
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	// ── cancellation races ──

	#[tokio::test]
	async fn race_cancellation_yields_the_value_when_uncancelled() {
		let token = CancellationToken::new();
		assert_eq!(race_cancellation(async { 5 }, &token).await, Some(5));
	}

	#[tokio::test]
	async fn race_cancellation_yields_none_once_canceled() {
		let token = CancellationToken::new();
		token.cancel();
		assert_eq!(race_cancellation(std::future::pending::<u32>(), &token).await, None);
		assert_eq!(
			race_cancellation_with(std::future::pending::<u32>(), &token, 9).await,
			9
		);
		assert_eq!(
			race_cancellation_error(std::future::pending::<u32>(), &token).await,
			Err(Interrupt::Canceled)
		);
	}

	// ── timeout races ──

	#[tokio::test]
	async fn race_timeout_returns_none_on_expiry() {
		assert_eq!(
			race_timeout(std::future::pending::<u32>(), Duration::from_millis(10)).await,
			None
		);
		assert_eq!(race_timeout(async { 3 }, Duration::from_secs(1)).await, Some(3));
	}

	#[tokio::test]
	async fn race_timeout_with_invokes_the_callback_exactly_on_expiry() {
		let timeouts = Arc::new(AtomicUsize::new(0));

		let fired = Arc::clone(&timeouts);
		let lost = race_timeout_with(std::future::pending::<u32>(), Duration::from_millis(10), move || {
			fired.fetch_add(1, Ordering::SeqCst);
		})
		.await;
		assert_eq!(lost, None);

		let fired = Arc::clone(&timeouts);
		let won = race_timeout_with(async { 1 }, Duration::from_secs(1), move || {
			fired.fetch_add(1, Ordering::SeqCst);
		})
		.await;
		assert_eq!(won, Some(1));
		assert_eq!(timeouts.load(Ordering::SeqCst), 1);
	}

	// ── first ──

	#[tokio::test]
	async fn first_stops_launching_after_a_match() {
		let launched = Arc::new(AtomicUsize::new(0));
		let factories: Vec<_> = (0..4u32)
			.map(|i| {
				let launched = Arc::clone(&launched);
				move || {
					launched.fetch_add(1, Ordering::SeqCst);
					async move { i }
				}
			})
			.collect();
		let value = first(factories, |value| *value >= 1, 99).await;
		assert_eq!(value, 1);
		assert_eq!(launched.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn first_falls_back_to_the_default() {
		let factories: Vec<fn() -> std::future::Ready<u32>> =
			vec![|| std::future::ready(1), || std::future::ready(2)];
		assert_eq!(first(factories, |value| *value > 10, 42).await, 42);
	}

	// ── first_parallel ──

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn first_parallel_cancels_the_losers() {
		let slow = CancelableTask::spawn(|token| async move {
			token.cancelled().await;
			0u32
		});
		let slow_token = slow.token().clone();
		let fast = CancelableTask::spawn(|_token| async move {
			tokio::time::sleep(Duration::from_millis(10)).await;
			7u32
		});
		let value = first_parallel(vec![slow, fast], |value| *value == 7, 0).await;
		assert_eq!(value, Ok(7));
		assert!(slow_token.is_cancelled());
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn first_parallel_returns_the_default_without_a_match() {
		let a = CancelableTask::spawn(|_token| async { 1u32 });
		let b = CancelableTask::spawn(|_token| async { 2u32 });
		assert_eq!(first_parallel(vec![a, b], |value| *value > 10, 0).await, Ok(0));
	}

	#[tokio::test]
	async fn first_parallel_handles_an_empty_input() {
		assert_eq!(first_parallel(Vec::<CancelableTask<u32>>::new(), |_| true, 3).await, Ok(3));
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn first_parallel_propagates_a_rejection() {
		let canceled = CancelableTask::spawn(|token| async move {
			token.cancelled().await;
			1u32
		});
		canceled.cancel();
		let other = CancelableTask::spawn(|token| async move {
			token.cancelled().await;
			2u32
		});
		let other_token = other.token().clone();
		let outcome = first_parallel(vec![canceled, other], |_| false, 0).await;
		assert_eq!(outcome, Err(Interrupt::Canceled));
		assert!(other_token.is_cancelled());
	}

	// ── retry ──

	#[tokio::test]
	async fn retry_returns_the_first_success() {
		let attempts = Arc::new(AtomicUsize::new(0));
		let counter = Arc::clone(&attempts);
		let value = retry(
			move || {
				let counter = Arc::clone(&counter);
				async move {
					if counter.fetch_add(1, Ordering::SeqCst) < 2 {
						Err("not yet")
					} else {
						Ok(10u32)
					}
				}
			},
			Duration::from_millis(5),
			5,
		)
		.await;
		assert_eq!(value, Ok(10));
		assert_eq!(attempts.load(Ordering::SeqCst), 3);
	}

	#[tokio::test]
	async fn retry_doubles_the_pause_and_surfaces_the_last_error() {
		let attempts = Arc::new(AtomicUsize::new(0));
		let counter = Arc::clone(&attempts);
		let started = Instant::now();
		let outcome: Result<u32, usize> = retry(
			move || {
				let counter = Arc::clone(&counter);
				async move { Err(counter.fetch_add(1, Ordering::SeqCst)) }
			},
			Duration::from_millis(20),
			3,
		)
		.await;
		// Pauses of 20ms and 40ms separate the three attempts.
		assert!(started.elapsed() >= Duration::from_millis(60));
		assert_eq!(outcome, Err(2));
		assert_eq!(attempts.load(Ordering::SeqCst), 3);
	}

	// ── settled ──

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn settled_yields_values_in_input_order() {
		let futures: Vec<crate::BoxFuture<Result<u32, Interrupt>>> = vec![
			Box::pin(async {
				tokio::time::sleep(Duration::from_millis(20)).await;
				Ok(1)
			}),
			Box::pin(async { Ok(2) }),
		];
		assert_eq!(settled(futures).await, Ok(vec![1, 2]));
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn settled_drives_everything_despite_a_failure() {
		let finished = Arc::new(AtomicUsize::new(0));
		let mut futures = Vec::new();
		for i in 0..3u32 {
			let finished = Arc::clone(&finished);
			futures.push(async move {
				tokio::time::sleep(Duration::from_millis(10 * (i as u64 + 1))).await;
				finished.fetch_add(1, Ordering::SeqCst);
				if i == 0 { Err(Interrupt::Canceled) } else { Ok(i) }
			});
		}
		assert_eq!(settled(futures).await, Err(Interrupt::Canceled));
		assert_eq!(finished.load(Ordering::SeqCst), 3);
	}

	// ── interval counter ──

	#[test]
	fn interval_counter_counts_within_a_window() {
		let origin = Instant::now();
		let offset = Arc::new(Mutex::new(Duration::ZERO));
		let fake = Arc::clone(&offset);
		let counter = IntervalCounter::with_clock(Duration::from_millis(100), move || {
			origin + *fake.lock().unwrap()
		});

		assert_eq!(counter.increment(), 1);
		assert_eq!(counter.increment(), 2);
		assert_eq!(counter.increment(), 3);

		// Move past the window; the count restarts.
		*offset.lock().unwrap() = Duration::from_millis(150);
		assert_eq!(counter.increment(), 1);

		// Still inside the new window.
		*offset.lock().unwrap() = Duration::from_millis(200);
		assert_eq!(counter.increment(), 2);
	}
}
