//! Request coalescing and trailing-edge debouncing.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::deferred::Deferred;
use crate::error::Interrupt;
use crate::task::{BoxFuture, TaskFactory, spawn};

type TokenFactory<T> = Box<dyn FnOnce(CancellationToken) -> BoxFuture<T> + Send>;

struct ThrottlerState<T> {
	active: bool,
	queued: Option<(TokenFactory<T>, Deferred<T, Interrupt>)>,
}

struct ThrottlerInner<T> {
	state: Mutex<ThrottlerState<T>>,
	token: CancellationToken,
}

/// Coalesces repeated requests while one is in flight.
///
/// At most one follow-up is held at a time. Requests arriving while a task
/// runs replace the held factory (last writer wins) but share a single
/// result: every caller that queued during the active run resolves with the
/// follow-up's output.
pub struct Throttler<T> {
	inner: Arc<ThrottlerInner<T>>,
}

impl<T> Clone for Throttler<T> {
	fn clone(&self) -> Self {
		Self { inner: Arc::clone(&self.inner) }
	}
}

impl<T> Default for Throttler<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T> Throttler<T> {
	/// Creates an idle throttler.
	pub fn new() -> Self {
		Self {
			inner: Arc::new(ThrottlerInner {
				state: Mutex::new(ThrottlerState { active: false, queued: None }),
				token: CancellationToken::new(),
			}),
		}
	}

	/// Stops accepting work. The active task finishes and settles its
	/// callers; a held follow-up is canceled instead of run.
	pub fn dispose(&self) {
		self.inner.token.cancel();
		let queued = {
			let Ok(mut state) = self.inner.state.lock() else {
				return;
			};
			state.queued.take()
		};
		if let Some((_, done)) = queued {
			done.cancel();
		}
	}
}

impl<T: Clone + Send + 'static> Throttler<T> {
	/// Runs `factory` now when idle, otherwise holds it as the follow-up.
	pub fn queue<F, Fut>(&self, factory: F) -> impl Future<Output = Result<T, Interrupt>> + Send + use<T, F, Fut>
	where
		F: FnOnce(CancellationToken) -> Fut + Send + 'static,
		Fut: Future<Output = T> + Send + 'static,
	{
		let done = self.queue_boxed(Box::new(move |token| Box::pin(factory(token)) as BoxFuture<T>));
		async move { done.join().await }
	}

	fn queue_boxed(&self, factory: TokenFactory<T>) -> Deferred<T, Interrupt> {
		if self.inner.token.is_cancelled() {
			let done = Deferred::new();
			done.error(Interrupt::Disposed);
			return done;
		}
		let started = {
			let Ok(mut state) = self.inner.state.lock() else {
				let done = Deferred::new();
				done.cancel();
				return done;
			};
			if state.active {
				let done = match state.queued.as_mut() {
					// Replace the factory; everyone shares the one follow-up.
					Some((held, done)) => {
						*held = factory;
						done.clone()
					}
					None => {
						let done = Deferred::new();
						state.queued = Some((factory, done.clone()));
						done
					}
				};
				return done;
			}
			state.active = true;
			let done = Deferred::new();
			(factory, done)
		};
		let done = started.1.clone();
		Self::run(Arc::clone(&self.inner), started);
		done
	}

	fn run(inner: Arc<ThrottlerInner<T>>, first: (TokenFactory<T>, Deferred<T, Interrupt>)) {
		spawn("throttler.run", async move {
			let mut current = first;
			loop {
				let fut = (current.0)(inner.token.clone());
				let value = fut.await;
				current.1.complete(value);
				let next = {
					let Ok(mut state) = inner.state.lock() else {
						return;
					};
					if inner.token.is_cancelled() {
						state.active = false;
						if let Some((_, done)) = state.queued.take() {
							done.cancel();
						}
						return;
					}
					match state.queued.take() {
						Some(next) => next,
						None => {
							state.active = false;
							return;
						}
					}
				};
				current = next;
			}
		});
	}
}

/// When a [`Delayer`] fires relative to its latest trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
	/// Fire after the given quiet period.
	Timeout(Duration),
	/// Fire as soon as the executor yields, still coalescing same-tick triggers.
	Microtask,
}

struct DelayerState<T> {
	generation: u64,
	timer_armed: bool,
	factory: Option<TaskFactory<T>>,
	pending: Option<Deferred<T, Interrupt>>,
	disposed: bool,
}

struct DelayerInner<T> {
	state: Mutex<DelayerState<T>>,
}

/// Trailing-edge debouncer: runs the latest task once triggers go quiet.
///
/// Every trigger during the quiet window replaces the held task and restarts
/// the window. All callers that triggered during one window share the result
/// of the task that eventually runs.
pub struct Delayer<T> {
	inner: Arc<DelayerInner<T>>,
	default_delay: Delay,
}

impl<T> Clone for Delayer<T> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
			default_delay: self.default_delay,
		}
	}
}

impl<T> Delayer<T> {
	/// Creates a delayer with a default quiet period.
	pub fn new(default_delay: Duration) -> Self {
		Self::with_delay(Delay::Timeout(default_delay))
	}

	/// Creates a delayer with an explicit default firing mode.
	pub fn with_delay(default_delay: Delay) -> Self {
		Self {
			inner: Arc::new(DelayerInner {
				state: Mutex::new(DelayerState {
					generation: 0,
					timer_armed: false,
					factory: None,
					pending: None,
					disposed: false,
				}),
			}),
			default_delay,
		}
	}

	/// Returns true while an unfired trigger is pending.
	pub fn is_triggered(&self) -> bool {
		self.inner
			.state
			.lock()
			.map(|state| state.timer_armed)
			.unwrap_or(false)
	}

	/// Drops the pending trigger, rejecting its waiters as canceled.
	pub fn cancel(&self) {
		let pending = {
			let Ok(mut state) = self.inner.state.lock() else {
				return;
			};
			state.generation += 1;
			state.timer_armed = false;
			state.factory = None;
			state.pending.take()
		};
		if let Some(done) = pending {
			done.cancel();
		}
	}

	/// Cancels any pending trigger and rejects all future triggers.
	pub fn dispose(&self) {
		let pending = {
			let Ok(mut state) = self.inner.state.lock() else {
				return;
			};
			state.disposed = true;
			state.generation += 1;
			state.timer_armed = false;
			state.factory = None;
			state.pending.take()
		};
		if let Some(done) = pending {
			done.cancel();
		}
	}
}

impl<T: Clone + Send + 'static> Delayer<T> {
	/// Schedules `factory` after the default quiet period.
	pub fn trigger<F, Fut>(&self, factory: F) -> impl Future<Output = Result<T, Interrupt>> + Send + use<T, F, Fut>
	where
		F: FnOnce() -> Fut + Send + 'static,
		Fut: Future<Output = T> + Send + 'static,
	{
		self.trigger_after(self.default_delay, factory)
	}

	/// Schedules `factory` after an explicit delay, restarting the window.
	pub fn trigger_after<F, Fut>(&self, delay: Delay, factory: F) -> impl Future<Output = Result<T, Interrupt>> + Send + use<T, F, Fut>
	where
		F: FnOnce() -> Fut + Send + 'static,
		Fut: Future<Output = T> + Send + 'static,
	{
		let done = self.trigger_boxed(delay, Box::new(move || Box::pin(factory()) as BoxFuture<T>));
		async move { done.join().await }
	}

	fn trigger_boxed(&self, delay: Delay, factory: TaskFactory<T>) -> Deferred<T, Interrupt> {
		let (done, generation) = {
			let Ok(mut state) = self.inner.state.lock() else {
				let done = Deferred::new();
				done.cancel();
				return done;
			};
			if state.disposed {
				let done = Deferred::new();
				done.error(Interrupt::Disposed);
				return done;
			}
			state.factory = Some(factory);
			state.generation += 1;
			state.timer_armed = true;
			let done = match &state.pending {
				Some(done) => done.clone(),
				None => {
					let done = Deferred::new();
					state.pending = Some(done.clone());
					done
				}
			};
			(done, state.generation)
		};
		let inner = Arc::clone(&self.inner);
		spawn("delayer.fire", async move {
			match delay {
				Delay::Timeout(duration) => tokio::time::sleep(duration).await,
				Delay::Microtask => tokio::task::yield_now().await,
			}
			let fired = {
				let Ok(mut state) = inner.state.lock() else {
					return;
				};
				// A later trigger, cancel, or dispose owns the window now.
				if state.disposed || state.generation != generation {
					return;
				}
				state.timer_armed = false;
				state.factory.take().zip(state.pending.take())
			};
			if let Some((factory, done)) = fired {
				let value = factory().await;
				done.complete(value);
			}
		});
		done
	}
}

/// A [`Delayer`] whose task runs through a [`Throttler`].
///
/// Debounces bursts and, when triggers keep arriving while a task is still
/// running, coalesces them into a single follow-up instead of stacking runs.
pub struct ThrottledDelayer<T> {
	delayer: Delayer<Result<T, Interrupt>>,
	throttler: Throttler<T>,
}

impl<T> Clone for ThrottledDelayer<T> {
	fn clone(&self) -> Self {
		Self {
			delayer: self.delayer.clone(),
			throttler: self.throttler.clone(),
		}
	}
}

impl<T: Clone + Send + 'static> ThrottledDelayer<T> {
	/// Creates a throttled delayer with a default quiet period.
	pub fn new(default_delay: Duration) -> Self {
		Self {
			delayer: Delayer::new(default_delay),
			throttler: Throttler::new(),
		}
	}

	/// Schedules `factory` after the default quiet period.
	pub fn trigger<F, Fut>(&self, factory: F) -> impl Future<Output = Result<T, Interrupt>> + Send + use<T, F, Fut>
	where
		F: FnOnce(CancellationToken) -> Fut + Send + 'static,
		Fut: Future<Output = T> + Send + 'static,
	{
		self.trigger_after(self.delayer.default_delay, factory)
	}

	/// Schedules `factory` after an explicit delay.
	pub fn trigger_after<F, Fut>(&self, delay: Delay, factory: F) -> impl Future<Output = Result<T, Interrupt>> + Send + use<T, F, Fut>
	where
		F: FnOnce(CancellationToken) -> Fut + Send + 'static,
		Fut: Future<Output = T> + Send + 'static,
	{
		let throttler = self.throttler.clone();
		let done = self
			.delayer
			.trigger_after(delay, move || throttler.queue(factory));
		async move { done.await.and_then(|inner| inner) }
	}

	/// Returns true while an unfired trigger is pending.
	pub fn is_triggered(&self) -> bool {
		self.delayer.is_triggered()
	}

	/// Drops the pending trigger, rejecting its waiters as canceled.
	pub fn cancel(&self) {
		self.delayer.cancel();
	}

	/// Cancels pending work and rejects all future triggers.
	pub fn dispose(&self) {
		self.delayer.dispose();
		self.throttler.dispose();
	}
}
