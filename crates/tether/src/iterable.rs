//! Lazy asynchronous sequences bridging push-style producers to pull-style
//! consumers.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::Interrupt;
use crate::task::spawn;

enum Step<T, E> {
	Item(T),
	Done,
	Failed(E),
}

struct PcState<T, E> {
	values: VecDeque<T>,
	waiters: VecDeque<oneshot::Sender<Step<T, E>>>,
	finished: Option<Result<(), E>>,
}

struct PcInner<T, E> {
	state: Mutex<PcState<T, E>>,
}

fn finish<T, E: Clone>(inner: &Arc<PcInner<T, E>>, result: Result<(), E>) {
	let waiters = {
		let Ok(mut state) = inner.state.lock() else {
			return;
		};
		if state.finished.is_some() {
			return;
		}
		state.finished = Some(result.clone());
		std::mem::take(&mut state.waiters)
	};
	for waiter in waiters {
		let step = match &result {
			Ok(()) => Step::Done,
			Err(err) => Step::Failed(err.clone()),
		};
		let _ = waiter.send(step);
	}
}

/// Push side of an [`AsyncIterable`].
pub struct Emitter<T, E = Interrupt> {
	inner: Arc<PcInner<T, E>>,
}

impl<T, E> Clone for Emitter<T, E> {
	fn clone(&self) -> Self {
		Self { inner: Arc::clone(&self.inner) }
	}
}

impl<T, E: Clone> Emitter<T, E> {
	/// Pushes one value. Ignored once the sequence has finished.
	pub fn emit_one(&self, item: T) {
		let Ok(mut state) = self.inner.state.lock() else {
			return;
		};
		if state.finished.is_some() {
			return;
		}
		let mut item = item;
		// A waiter whose receiver was dropped hands the value back; keep it
		// for the next consumer instead of losing it.
		while let Some(waiter) = state.waiters.pop_front() {
			match waiter.send(Step::Item(item)) {
				Ok(()) => return,
				Err(Step::Item(returned)) => item = returned,
				Err(_) => return,
			}
		}
		state.values.push_back(item);
	}

	/// Pushes a batch of values in order.
	pub fn emit_many(&self, items: impl IntoIterator<Item = T>) {
		for item in items {
			self.emit_one(item);
		}
	}

	/// Ends the sequence successfully. Idempotent with `reject`.
	pub fn finish(&self) {
		finish(&self.inner, Ok(()));
	}

	/// Ends the sequence with an error that every further pull observes.
	pub fn reject(&self, err: E) {
		finish(&self.inner, Err(err));
	}
}

/// A single-pass asynchronous sequence of `T` that can fail with `E`.
///
/// Values emitted before anyone pulls are buffered; pulls past the buffered
/// values wait for the producer. After a rejection every pull yields the same
/// error.
pub struct AsyncIterable<T, E = Interrupt> {
	inner: Arc<PcInner<T, E>>,
	on_return: Option<Box<dyn FnOnce() + Send>>,
	exhausted: bool,
}

impl<T, E> AsyncIterable<T, E> {
	fn raw() -> (Emitter<T, E>, Self) {
		let inner = Arc::new(PcInner {
			state: Mutex::new(PcState {
				values: VecDeque::new(),
				waiters: VecDeque::new(),
				finished: None,
			}),
		});
		(
			Emitter { inner: Arc::clone(&inner) },
			Self { inner, on_return: None, exhausted: false },
		)
	}

	/// Creates a sequence fed manually through the returned [`Emitter`].
	pub fn pipe() -> (Emitter<T, E>, Self) {
		Self::raw()
	}

	/// Registers a teardown hook that fires when the consumer stops early.
	#[must_use]
	pub fn on_return(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
		self.on_return = Some(Box::new(hook));
		self
	}
}

impl<T, E> AsyncIterable<T, E>
where
	T: Send + 'static,
	E: Clone + Send + 'static,
{
	/// Spawns `executor` to produce the sequence. Returning `Ok` ends it;
	/// returning `Err` rejects it.
	pub fn new<F, Fut>(executor: F) -> Self
	where
		F: FnOnce(Emitter<T, E>) -> Fut + Send + 'static,
		Fut: Future<Output = Result<(), E>> + Send + 'static,
	{
		let (emitter, iterable) = Self::raw();
		let inner = Arc::clone(&iterable.inner);
		spawn("iterable.executor", async move {
			// Run the producer as its own task: a panicking producer ends
			// the sequence instead of wedging its consumers.
			let body = spawn("iterable.producer", executor(emitter));
			match body.await {
				Ok(Ok(())) => finish(&inner, Ok(())),
				Ok(Err(err)) => finish(&inner, Err(err)),
				Err(_) => finish(&inner, Ok(())),
			}
		});
		iterable
	}

	/// A finished sequence over the given items.
	pub fn from_items<I>(items: I) -> Self
	where
		I: IntoIterator<Item = T> + Send + 'static,
		I::IntoIter: Send,
	{
		Self::new(|emitter| async move {
			emitter.emit_many(items);
			Ok(())
		})
	}

	/// A sequence over the items a future eventually yields.
	pub fn from_future<Fut>(fut: Fut) -> Self
	where
		Fut: Future<Output = Vec<T>> + Send + 'static,
	{
		Self::new(|emitter| async move {
			emitter.emit_many(fut.await);
			Ok(())
		})
	}

	/// Pulls the next value; `Ok(None)` marks the end of the sequence.
	pub async fn next(&mut self) -> Result<Option<T>, E> {
		let rx = {
			let Ok(mut state) = self.inner.state.lock() else {
				self.exhausted = true;
				return Ok(None);
			};
			if let Some(value) = state.values.pop_front() {
				return Ok(Some(value));
			}
			if let Some(finished) = &state.finished {
				self.exhausted = true;
				return match finished {
					Ok(()) => Ok(None),
					Err(err) => Err(err.clone()),
				};
			}
			let (tx, rx) = oneshot::channel();
			state.waiters.push_back(tx);
			rx
		};
		match rx.await {
			Ok(Step::Item(value)) => Ok(Some(value)),
			Ok(Step::Done) | Err(_) => {
				self.exhausted = true;
				Ok(None)
			}
			Ok(Step::Failed(err)) => {
				self.exhausted = true;
				Err(err)
			}
		}
	}

	/// Drains the sequence into a vector.
	pub async fn collect(mut self) -> Result<Vec<T>, E> {
		let mut values = Vec::new();
		while let Some(value) = self.next().await? {
			values.push(value);
		}
		Ok(values)
	}

	/// Maps each value through `f`.
	pub fn map<U, F>(self, f: F) -> AsyncIterable<U, E>
	where
		U: Send + 'static,
		F: Fn(T) -> U + Send + 'static,
	{
		AsyncIterable::new(move |emitter| async move {
			let mut source = self;
			loop {
				match source.next().await {
					Ok(Some(value)) => emitter.emit_one(f(value)),
					Ok(None) => return Ok(()),
					Err(err) => return Err(err),
				}
			}
		})
	}

	/// Keeps only values matching `predicate`.
	pub fn filter<P>(self, predicate: P) -> Self
	where
		P: Fn(&T) -> bool + Send + 'static,
	{
		Self::new(move |emitter| async move {
			let mut source = self;
			loop {
				match source.next().await {
					Ok(Some(value)) => {
						if predicate(&value) {
							emitter.emit_one(value);
						}
					}
					Ok(None) => return Ok(()),
					Err(err) => return Err(err),
				}
			}
		})
	}

	/// Interleaves several sequences as their values arrive. The merged
	/// sequence ends when all inputs end and rejects on the first rejection.
	pub fn merge<I>(iterables: I) -> Self
	where
		I: IntoIterator<Item = Self> + Send + 'static,
		I::IntoIter: Send,
	{
		Self::new(|emitter| async move {
			let mut pumps = Vec::new();
			for mut source in iterables {
				let emitter = emitter.clone();
				pumps.push(spawn("iterable.merge", async move {
					loop {
						match source.next().await {
							Ok(Some(value)) => emitter.emit_one(value),
							Ok(None) => return Ok(()),
							Err(err) => return Err(err),
						}
					}
				}));
			}
			for pump in pumps {
				match pump.await {
					Ok(Ok(())) => {}
					Ok(Err(err)) => return Err(err),
					Err(_) => {}
				}
			}
			Ok(())
		})
	}
}

impl<T, E> AsyncIterable<T, E>
where
	T: Clone + Send + 'static,
	E: Clone + Send + 'static,
{
	/// Splits the sequence into two consumers, each receiving every value.
	/// The two sides may be consumed at independent paces.
	pub fn tee(self) -> (Self, Self) {
		let (left_emitter, left) = Self::raw();
		let (right_emitter, right) = Self::raw();
		spawn("iterable.tee", async move {
			let mut source = self;
			loop {
				match source.next().await {
					Ok(Some(value)) => {
						left_emitter.emit_one(value.clone());
						right_emitter.emit_one(value);
					}
					Ok(None) => {
						left_emitter.finish();
						right_emitter.finish();
						return;
					}
					Err(err) => {
						left_emitter.reject(err.clone());
						right_emitter.reject(err);
						return;
					}
				}
			}
		});
		(left, right)
	}
}

impl<T, E> Drop for AsyncIterable<T, E> {
	fn drop(&mut self) {
		if !self.exhausted {
			if let Some(hook) = self.on_return.take() {
				hook();
			}
		}
	}
}

/// An [`AsyncIterable`] whose production can be canceled by the consumer.
pub struct CancelableIterable<T, E = Interrupt> {
	iterable: AsyncIterable<T, E>,
	token: CancellationToken,
}

impl<T, E> CancelableIterable<T, E>
where
	T: Send + 'static,
	E: Clone + Send + 'static,
{
	/// Pulls the next value; after `cancel()` this rejects.
	pub async fn next(&mut self) -> Result<Option<T>, E> {
		self.iterable.next().await
	}

	/// Requests cancellation of the producer.
	pub fn cancel(&self) {
		self.token.cancel();
	}

	/// The token handed to the producer.
	pub fn token(&self) -> &CancellationToken {
		&self.token
	}
}

/// Wraps a token-aware sequence so the consumer can abandon it. Once the
/// token fires, pending and future pulls reject with a cancellation error.
pub fn cancelable_iterable<T, E, F>(make: F) -> CancelableIterable<T, E>
where
	T: Send + 'static,
	E: Clone + Send + From<Interrupt> + 'static,
	F: FnOnce(CancellationToken) -> AsyncIterable<T, E>,
{
	let token = CancellationToken::new();
	let mut source = make(token.clone());
	let guard = token.clone();
	let iterable = AsyncIterable::new(move |emitter| async move {
		loop {
			tokio::select! {
				() = guard.cancelled() => return Err(E::from(Interrupt::Canceled)),
				step = source.next() => match step {
					Ok(Some(value)) => {
						if guard.is_cancelled() {
							return Err(E::from(Interrupt::Canceled));
						}
						emitter.emit_one(value);
					}
					Ok(None) => return Ok(()),
					Err(err) => return Err(err),
				},
			}
		}
	});
	CancelableIterable { iterable, token }
}
