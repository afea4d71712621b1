//! Bounded-parallelism task admission.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::sync::{broadcast, oneshot};

use crate::error::Interrupt;
use crate::task::{TaskFactory, spawn};

/// Result handle for one unit of work admitted to a [`Limiter`].
pub struct Ticket<T> {
	rx: oneshot::Receiver<Result<T, Interrupt>>,
}

impl<T> Ticket<T> {
	pub(crate) fn settled(result: Result<T, Interrupt>) -> Self {
		let (tx, rx) = oneshot::channel();
		let _ = tx.send(result);
		Self { rx }
	}
}

impl<T> Future for Ticket<T> {
	type Output = Result<T, Interrupt>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		match Pin::new(&mut self.rx).poll(cx) {
			Poll::Ready(Ok(result)) => Poll::Ready(result),
			Poll::Ready(Err(_)) => Poll::Ready(Err(Interrupt::Canceled)),
			Poll::Pending => Poll::Pending,
		}
	}
}

struct Entry<T> {
	factory: TaskFactory<T>,
	tx: oneshot::Sender<Result<T, Interrupt>>,
}

struct LimiterState<T> {
	backlog: VecDeque<Entry<T>>,
	running: usize,
	size: usize,
	disposed: bool,
}

struct LimiterInner<T> {
	max_parallel: usize,
	state: Mutex<LimiterState<T>>,
	drained: broadcast::Sender<()>,
}

/// Runs admitted tasks with at most `max_parallel` in flight, FIFO.
///
/// Each task settles only its own [`Ticket`]; a failing or panicking task
/// never halts its siblings. `size()` counts backlog plus in-flight work, and
/// a drain event fires on every transition of `size` to zero.
pub struct Limiter<T> {
	inner: Arc<LimiterInner<T>>,
}

impl<T> Clone for Limiter<T> {
	fn clone(&self) -> Self {
		Self { inner: Arc::clone(&self.inner) }
	}
}

impl<T> Limiter<T> {
	/// Creates a limiter admitting at most `max_parallel` concurrent tasks.
	pub fn new(max_parallel: usize) -> Self {
		assert!(max_parallel > 0, "limiter needs at least one slot");
		Self {
			inner: Arc::new(LimiterInner {
				max_parallel,
				state: Mutex::new(LimiterState {
					backlog: VecDeque::new(),
					running: 0,
					size: 0,
					disposed: false,
				}),
				drained: broadcast::channel(16).0,
			}),
		}
	}

	/// Backlog plus in-flight count.
	pub fn size(&self) -> usize {
		self.inner.state.lock().map(|state| state.size).unwrap_or(0)
	}

	/// Subscribes to drain events (`size` transitions to zero).
	pub fn subscribe_drained(&self) -> broadcast::Receiver<()> {
		self.inner.drained.subscribe()
	}

	/// Waits until the limiter has no backlog and no in-flight work.
	pub async fn when_idle(&self) {
		// Subscribe before checking size so a drain landing in between
		// cannot be missed.
		let mut drained = self.inner.drained.subscribe();
		if self.size() == 0 {
			return;
		}
		loop {
			match drained.recv().await {
				Ok(()) | Err(broadcast::error::RecvError::Closed) => return,
				Err(broadcast::error::RecvError::Lagged(_)) => {
					if self.size() == 0 {
						return;
					}
				}
			}
		}
	}

	/// Cancels every backlogged task. In-flight tasks keep running and
	/// `size` stays at the in-flight count, so no drain event fires here.
	pub fn clear(&self) {
		let entries = {
			let Ok(mut state) = self.inner.state.lock() else {
				return;
			};
			state.size = state.running;
			std::mem::take(&mut state.backlog)
		};
		for entry in entries {
			let _ = entry.tx.send(Err(Interrupt::Canceled));
		}
	}

	/// Rejects the backlog and all future work as disposed. In-flight tasks
	/// finish and still deliver their values; idle waiters are released.
	pub fn dispose(&self) {
		let entries = {
			let Ok(mut state) = self.inner.state.lock() else {
				return;
			};
			state.disposed = true;
			state.size = 0;
			std::mem::take(&mut state.backlog)
		};
		for entry in entries {
			let _ = entry.tx.send(Err(Interrupt::Disposed));
		}
		let _ = self.inner.drained.send(());
	}
}

impl<T: Send + 'static> Limiter<T> {
	/// Admits one task. Order of admission is order of execution.
	pub fn queue<F, Fut>(&self, factory: F) -> Ticket<T>
	where
		F: FnOnce() -> Fut + Send + 'static,
		Fut: Future<Output = T> + Send + 'static,
	{
		self.queue_boxed(Box::new(move || Box::pin(factory())))
	}

	pub(crate) fn queue_boxed(&self, factory: TaskFactory<T>) -> Ticket<T> {
		let (tx, rx) = oneshot::channel();
		{
			let Ok(mut state) = self.inner.state.lock() else {
				return Ticket::settled(Err(Interrupt::Disposed));
			};
			if state.disposed {
				let _ = tx.send(Err(Interrupt::Disposed));
				return Ticket { rx };
			}
			state.size += 1;
			state.backlog.push_back(Entry { factory, tx });
		}
		Self::consume(&self.inner);
		Ticket { rx }
	}

	fn consume(inner: &Arc<LimiterInner<T>>) {
		loop {
			let entry = {
				let Ok(mut state) = inner.state.lock() else {
					return;
				};
				if state.disposed || state.running >= inner.max_parallel {
					return;
				}
				let Some(entry) = state.backlog.pop_front() else {
					return;
				};
				state.running += 1;
				entry
			};
			let inner = Arc::clone(inner);
			spawn("limiter.run", async move {
				// Run the body as its own task so a panic settles only this
				// ticket and leaves the pump alive.
				let body = spawn("limiter.task", (entry.factory)());
				let outcome = match body.await {
					Ok(value) => Ok(value),
					Err(_) => Err(Interrupt::Canceled),
				};
				let _ = entry.tx.send(outcome);
				Self::consumed(&inner);
			});
		}
	}

	fn consumed(inner: &Arc<LimiterInner<T>>) {
		let drained = {
			let Ok(mut state) = inner.state.lock() else {
				return;
			};
			if state.disposed {
				return;
			}
			state.running -= 1;
			state.size -= 1;
			state.size == 0
		};
		if drained {
			tracing::trace!("limiter.drained");
			let _ = inner.drained.send(());
		}
		Self::consume(inner);
	}
}
