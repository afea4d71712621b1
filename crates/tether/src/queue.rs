//! Strictly ordered task queues, flat and keyed.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::deferred::Deferred;
use crate::error::Interrupt;
use crate::limiter::{Limiter, Ticket};
use crate::sequentializer::TaskSequentializer;
use crate::task::{TaskFactory, spawn};

/// Runs admitted tasks one at a time, in admission order.
///
/// A failing task settles only its own [`Ticket`] and never halts the tasks
/// behind it.
pub struct Queue<T> {
	limiter: Limiter<T>,
}

impl<T> Clone for Queue<T> {
	fn clone(&self) -> Self {
		Self { limiter: self.limiter.clone() }
	}
}

impl<T> Default for Queue<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T> Queue<T> {
	/// Creates an empty queue.
	pub fn new() -> Self {
		Self { limiter: Limiter::new(1) }
	}

	/// Backlog plus in-flight count.
	pub fn size(&self) -> usize {
		self.limiter.size()
	}

	/// Subscribes to drain events (`size` transitions to zero).
	pub fn subscribe_drained(&self) -> broadcast::Receiver<()> {
		self.limiter.subscribe_drained()
	}

	/// Waits until the queue is empty and nothing is running.
	pub async fn when_idle(&self) {
		self.limiter.when_idle().await;
	}

	/// Cancels every backlogged task; the running one finishes.
	pub fn clear(&self) {
		self.limiter.clear();
	}

	/// Rejects the backlog and all future work as disposed.
	pub fn dispose(&self) {
		self.limiter.dispose();
	}
}

impl<T: Send + 'static> Queue<T> {
	/// Admits one task behind everything already queued.
	pub fn queue<F, Fut>(&self, factory: F) -> Ticket<T>
	where
		F: FnOnce() -> Fut + Send + 'static,
		Fut: Future<Output = T> + Send + 'static,
	{
		self.limiter.queue(factory)
	}

	fn queue_boxed(&self, factory: TaskFactory<T>) -> Ticket<T> {
		self.limiter.queue_boxed(factory)
	}
}

struct ResourceQueueState<K, T> {
	queues: HashMap<K, Queue<T>>,
	drainers: Vec<Deferred<(), Interrupt>>,
	disposed: bool,
}

struct ResourceQueueInner<K, T> {
	state: Mutex<ResourceQueueState<K, T>>,
}

/// One serial [`Queue`] per resource key, created on demand and removed when
/// it drains. Distinct keys run concurrently.
pub struct ResourceQueue<K, T> {
	inner: Arc<ResourceQueueInner<K, T>>,
}

impl<K, T> Clone for ResourceQueue<K, T> {
	fn clone(&self) -> Self {
		Self { inner: Arc::clone(&self.inner) }
	}
}

impl<K, T> Default for ResourceQueue<K, T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<K, T> ResourceQueue<K, T> {
	/// Creates an empty keyed queue.
	pub fn new() -> Self {
		Self {
			inner: Arc::new(ResourceQueueInner {
				state: Mutex::new(ResourceQueueState {
					queues: HashMap::new(),
					drainers: Vec::new(),
					disposed: false,
				}),
			}),
		}
	}

	/// Returns true when no key has pending or running work.
	pub fn is_drained(&self) -> bool {
		self.inner
			.state
			.lock()
			.map(|state| state.queues.values().all(|queue| queue.size() == 0))
			.unwrap_or(true)
	}
}

impl<K, T> ResourceQueue<K, T>
where
	K: Eq + Hash + Clone + Send + 'static,
	T: Send + 'static,
{
	/// Admits one task behind everything queued for the same key.
	pub fn queue_for<F, Fut>(&self, key: K, factory: F) -> Ticket<T>
	where
		F: FnOnce() -> Fut + Send + 'static,
		Fut: Future<Output = T> + Send + 'static,
	{
		let Ok(mut state) = self.inner.state.lock() else {
			return Ticket::settled(Err(Interrupt::Disposed));
		};
		if state.disposed {
			return Ticket::settled(Err(Interrupt::Disposed));
		}
		if let Some(queue) = state.queues.get(&key) {
			// Enqueue under the map lock so the drain watcher cannot remove
			// a queue that just accepted work.
			return queue.queue_boxed(Box::new(move || Box::pin(factory())));
		}
		let queue = Queue::new();
		let drained = queue.subscribe_drained();
		state.queues.insert(key.clone(), queue.clone());
		Self::watch_key(Arc::clone(&self.inner), key, drained);
		queue.queue_boxed(Box::new(move || Box::pin(factory())))
	}

	/// Backlog plus in-flight count for one key.
	pub fn queue_size(&self, key: &K) -> usize {
		self.inner
			.state
			.lock()
			.map(|state| state.queues.get(key).map_or(0, |queue| queue.size()))
			.unwrap_or(0)
	}

	/// Waits until every key has drained. Resolves immediately when already
	/// drained or once the queue is disposed.
	pub fn when_drained(&self) -> impl Future<Output = ()> + Send + use<K, T> {
		let waiter = {
			let Ok(mut state) = self.inner.state.lock() else {
				return wait_drained(None);
			};
			if state.disposed || state.queues.values().all(|queue| queue.size() == 0) {
				None
			} else {
				let done = Deferred::new();
				state.drainers.push(done.clone());
				Some(done)
			}
		};
		wait_drained(waiter)
	}

	/// Disposes every per-key queue and releases drain waiters.
	pub fn dispose(&self) {
		let (queues, drainers) = {
			let Ok(mut state) = self.inner.state.lock() else {
				return;
			};
			state.disposed = true;
			(
				std::mem::take(&mut state.queues),
				std::mem::take(&mut state.drainers),
			)
		};
		for queue in queues.values() {
			queue.dispose();
		}
		for drainer in drainers {
			drainer.complete(());
		}
	}

	fn watch_key(inner: Arc<ResourceQueueInner<K, T>>, key: K, mut drained: broadcast::Receiver<()>) {
		spawn("resource_queue.watch", async move {
			loop {
				let alive = match drained.recv().await {
					Ok(()) => true,
					Err(broadcast::error::RecvError::Lagged(_)) => continue,
					Err(broadcast::error::RecvError::Closed) => false,
				};
				let (removed, release) = {
					let Ok(mut state) = inner.state.lock() else {
						return;
					};
					if state.disposed {
						return;
					}
					let removed = match state.queues.get(&key) {
						Some(queue) if queue.size() == 0 => {
							state.queues.remove(&key);
							true
						}
						Some(_) => false,
						None => true,
					};
					let release = if removed && state.queues.values().all(|queue| queue.size() == 0) {
						std::mem::take(&mut state.drainers)
					} else {
						Vec::new()
					};
					(removed, release)
				};
				for drainer in release {
					drainer.complete(());
				}
				if removed || !alive {
					return;
				}
			}
		});
	}
}

fn wait_drained(waiter: Option<Deferred<(), Interrupt>>) -> impl Future<Output = ()> + Send {
	async move {
		if let Some(done) = waiter {
			let _ = done.wait().await;
		}
	}
}

/// One serial [`Queue`] per key, dropped once its work drains.
///
/// Unlike [`ResourceQueue`] there is no whole-structure drain tracking; this
/// is the lightweight per-key sequencing primitive.
pub struct SequencerByKey<K, T> {
	queues: Arc<Mutex<HashMap<K, Queue<T>>>>,
}

impl<K, T> Clone for SequencerByKey<K, T> {
	fn clone(&self) -> Self {
		Self { queues: Arc::clone(&self.queues) }
	}
}

impl<K, T> Default for SequencerByKey<K, T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<K, T> SequencerByKey<K, T> {
	/// Creates an empty sequencer.
	pub fn new() -> Self {
		Self { queues: Arc::new(Mutex::new(HashMap::new())) }
	}
}

impl<K, T> SequencerByKey<K, T>
where
	K: Eq + Hash + Clone + Send + 'static,
	T: Send + 'static,
{
	/// Admits one task behind everything queued for the same key.
	pub fn queue<F, Fut>(&self, key: K, factory: F) -> Ticket<T>
	where
		F: FnOnce() -> Fut + Send + 'static,
		Fut: Future<Output = T> + Send + 'static,
	{
		let Ok(mut queues) = self.queues.lock() else {
			return Ticket::settled(Err(Interrupt::Disposed));
		};
		if let Some(queue) = queues.get(&key) {
			return queue.queue_boxed(Box::new(move || Box::pin(factory())));
		}
		let queue = Queue::new();
		let drained = queue.subscribe_drained();
		queues.insert(key.clone(), queue.clone());
		Self::watch_key(Arc::clone(&self.queues), key, drained);
		queue.queue_boxed(Box::new(move || Box::pin(factory())))
	}

	/// Returns whether the key currently has pending or running work.
	pub fn has_pending(&self, key: &K) -> bool {
		self.queues
			.lock()
			.map(|queues| queues.get(key).is_some_and(|queue| queue.size() > 0))
			.unwrap_or(false)
	}

	/// Keys with a live queue.
	pub fn keys(&self) -> Vec<K> {
		self.queues
			.lock()
			.map(|queues| queues.keys().cloned().collect())
			.unwrap_or_default()
	}

	fn watch_key(queues: Arc<Mutex<HashMap<K, Queue<T>>>>, key: K, mut drained: broadcast::Receiver<()>) {
		spawn("sequencer_by_key.watch", async move {
			loop {
				match drained.recv().await {
					Ok(()) => {}
					Err(broadcast::error::RecvError::Lagged(_)) => continue,
					Err(broadcast::error::RecvError::Closed) => return,
				}
				let Ok(mut queues) = queues.lock() else {
					return;
				};
				match queues.get(&key) {
					Some(queue) if queue.size() == 0 => {
						queues.remove(&key);
						return;
					}
					Some(_) => {}
					None => return,
				}
			}
		});
	}
}

/// Runs at most one task with at most one pending follow-up; queueing while
/// busy replaces the follow-up, and all busy-time callers share the result of
/// the last task queued.
pub struct LimitedQueue<T> {
	sequentializer: TaskSequentializer<T>,
	versions: Arc<AtomicU64>,
}

impl<T> Clone for LimitedQueue<T> {
	fn clone(&self) -> Self {
		Self {
			sequentializer: self.sequentializer.clone(),
			versions: Arc::clone(&self.versions),
		}
	}
}

impl<T> Default for LimitedQueue<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T> LimitedQueue<T> {
	/// Creates an idle limited queue.
	pub fn new() -> Self {
		Self {
			sequentializer: TaskSequentializer::new(),
			versions: Arc::new(AtomicU64::new(1)),
		}
	}
}

impl<T: Clone + Send + 'static> LimitedQueue<T> {
	/// Runs `factory` now when idle; otherwise it becomes the follow-up,
	/// displacing any follow-up already held.
	pub fn queue<F, Fut>(&self, factory: F) -> impl Future<Output = Result<T, Interrupt>> + Send + use<T, F, Fut>
	where
		F: FnOnce() -> Fut + Send + 'static,
		Fut: Future<Output = T> + Send + 'static,
	{
		let done = self
			.sequentializer
			.run_latest(&self.versions, Box::new(move || Box::pin(factory())));
		async move { done.join().await }
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::Duration;

	use tokio::sync::Notify;

	use super::*;

	// ── queue ──

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn runs_strictly_in_admission_order() {
		let queue: Queue<usize> = Queue::new();
		let order = Arc::new(Mutex::new(Vec::new()));
		let mut tickets = Vec::new();
		for i in 0..6 {
			let order = Arc::clone(&order);
			tickets.push(queue.queue(move || async move {
				// Uneven latencies must not reorder completion.
				tokio::time::sleep(Duration::from_millis(((6 - i) % 3) as u64 * 10)).await;
				order.lock().unwrap().push(i);
				i
			}));
		}
		for (i, ticket) in tickets.into_iter().enumerate() {
			assert_eq!(ticket.await, Ok(i));
		}
		assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
	}

	#[tokio::test]
	async fn a_failing_task_does_not_halt_the_queue() {
		let queue: Queue<Result<u32, &'static str>> = Queue::new();
		let bad = queue.queue(|| async { Err("nope") });
		let good = queue.queue(|| async { Ok(4) });
		assert_eq!(bad.await, Ok(Err("nope")));
		assert_eq!(good.await, Ok(Ok(4)));
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn randomized_admissions_preserve_order() {
		// Deterministic xorshift so failures reproduce.
		struct Xorshift64(u64);
		impl Xorshift64 {
			fn next(&mut self) -> u64 {
				let mut x = self.0;
				x ^= x << 13;
				x ^= x >> 7;
				x ^= x << 17;
				self.0 = x;
				x
			}
		}

		let mut rng = Xorshift64(0x9e37_79b9_7f4a_7c15);
		let queue: Queue<usize> = Queue::new();
		let order = Arc::new(Mutex::new(Vec::new()));
		let mut tickets = Vec::new();
		for i in 0..40 {
			let order = Arc::clone(&order);
			let delay = rng.next() % 4;
			tickets.push(queue.queue(move || async move {
				if delay > 0 {
					tokio::time::sleep(Duration::from_millis(delay)).await;
				}
				order.lock().unwrap().push(i);
				i
			}));
			if rng.next() % 3 == 0 {
				tokio::task::yield_now().await;
			}
		}
		for (i, ticket) in tickets.into_iter().enumerate() {
			assert_eq!(ticket.await, Ok(i));
		}
		assert_eq!(*order.lock().unwrap(), (0..40).collect::<Vec<_>>());
	}

	// ── resource queue ──

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn keys_are_sequential_and_independent() {
		let queues: ResourceQueue<&'static str, usize> = ResourceQueue::new();
		let order = Arc::new(Mutex::new(Vec::new()));
		let mut tickets = Vec::new();
		for i in 0..4 {
			let order = Arc::clone(&order);
			tickets.push(queues.queue_for("a", move || async move {
				order.lock().unwrap().push(("a", i));
				i
			}));
		}
		for i in 0..4 {
			let order = Arc::clone(&order);
			tickets.push(queues.queue_for("b", move || async move {
				order.lock().unwrap().push(("b", i));
				i
			}));
		}
		for ticket in tickets {
			assert!(ticket.await.is_ok());
		}
		let order = order.lock().unwrap();
		let a: Vec<usize> = order.iter().filter(|(k, _)| *k == "a").map(|(_, i)| *i).collect();
		let b: Vec<usize> = order.iter().filter(|(k, _)| *k == "b").map(|(_, i)| *i).collect();
		assert_eq!(a, vec![0, 1, 2, 3]);
		assert_eq!(b, vec![0, 1, 2, 3]);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn when_drained_resolves_after_all_keys_finish() {
		let queues: ResourceQueue<u32, ()> = ResourceQueue::new();
		let _a = queues.queue_for(1, || async {
			tokio::time::sleep(Duration::from_millis(20)).await;
		});
		let _b = queues.queue_for(2, || async {
			tokio::time::sleep(Duration::from_millis(40)).await;
		});
		assert!(!queues.is_drained());
		assert_eq!(queues.queue_size(&1), 1);
		assert_eq!(queues.queue_size(&3), 0);
		tokio::time::timeout(Duration::from_secs(1), queues.when_drained())
			.await
			.expect("drain must resolve");
		assert!(queues.is_drained());
		assert_eq!(queues.queue_size(&1), 0);
	}

	#[tokio::test]
	async fn when_drained_resolves_immediately_when_empty() {
		let queues: ResourceQueue<u32, ()> = ResourceQueue::new();
		queues.when_drained().await;
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn dispose_releases_drain_waiters_and_rejects_work() {
		let queues: ResourceQueue<u32, u32> = ResourceQueue::new();
		let gate = Arc::new(Notify::new());
		let _held = {
			let gate = Arc::clone(&gate);
			queues.queue_for(1, move || async move {
				gate.notified().await;
				0
			})
		};
		let drained = queues.when_drained();
		queues.dispose();
		tokio::time::timeout(Duration::from_secs(1), drained)
			.await
			.expect("dispose must release drain waiters");
		assert_eq!(
			queues.queue_for(2, || async { 1 }).await,
			Err(Interrupt::Disposed)
		);
		gate.notify_one();
	}

	// ── sequencer by key ──

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn sequencer_orders_per_key() {
		let sequencer: SequencerByKey<u8, usize> = SequencerByKey::new();
		let order = Arc::new(Mutex::new(Vec::new()));
		let mut tickets = Vec::new();
		for i in 0..5 {
			let order = Arc::clone(&order);
			tickets.push(sequencer.queue(1, move || async move {
				tokio::time::sleep(Duration::from_millis((5 - i) as u64)).await;
				order.lock().unwrap().push(i);
				i
			}));
		}
		assert!(sequencer.has_pending(&1));
		for (i, ticket) in tickets.into_iter().enumerate() {
			assert_eq!(ticket.await, Ok(i));
		}
		assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
	}

	#[tokio::test]
	async fn sequencer_failure_does_not_poison_the_key() {
		let sequencer: SequencerByKey<u8, Result<u32, &'static str>> = SequencerByKey::new();
		let bad = sequencer.queue(1, || async { Err("bad") });
		let good = sequencer.queue(1, || async { Ok(2) });
		assert_eq!(bad.await, Ok(Err("bad")));
		assert_eq!(good.await, Ok(Ok(2)));
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn sequencer_drops_drained_keys() {
		let sequencer: SequencerByKey<u8, u32> = SequencerByKey::new();
		assert_eq!(sequencer.queue(7, || async { 1 }).await, Ok(1));
		tokio::time::sleep(Duration::from_millis(30)).await;
		assert!(sequencer.keys().is_empty());
		assert!(!sequencer.has_pending(&7));
	}

	// ── limited queue ──

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn limited_queue_keeps_only_the_last_follow_up() {
		let queue: LimitedQueue<u32> = LimitedQueue::new();
		let runs = Arc::new(AtomicUsize::new(0));
		let gate = Arc::new(Notify::new());

		let first = {
			let runs = Arc::clone(&runs);
			let gate = Arc::clone(&gate);
			queue.queue(move || async move {
				gate.notified().await;
				runs.fetch_add(1, Ordering::SeqCst);
				0
			})
		};
		tokio::time::sleep(Duration::from_millis(10)).await;

		let mut followers = Vec::new();
		for i in 1..=5u32 {
			let runs = Arc::clone(&runs);
			followers.push(queue.queue(move || async move {
				runs.fetch_add(1, Ordering::SeqCst);
				i
			}));
		}
		gate.notify_one();
		assert_eq!(first.await, Ok(0));
		for follower in followers {
			assert_eq!(follower.await, Ok(5));
		}
		assert_eq!(runs.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn limited_queue_runs_immediately_when_idle() {
		let queue: LimitedQueue<u32> = LimitedQueue::new();
		assert_eq!(queue.queue(|| async { 3 }).await, Ok(3));
		assert_eq!(queue.queue(|| async { 4 }).await, Ok(4));
	}
}
