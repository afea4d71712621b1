//! Single-flight sequencing with a replaceable follow-up slot.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::deferred::Deferred;
use crate::error::Interrupt;
use crate::task::{BoxFuture, TaskFactory, spawn};

type QueuedFactory<T> = Box<dyn FnOnce() -> BoxFuture<Result<T, Interrupt>> + Send>;
type CancelFn = Box<dyn FnOnce() + Send>;

struct Running<T> {
	version: u64,
	done: Deferred<T, Interrupt>,
	cancel: Option<CancelFn>,
}

struct Queued<T> {
	factory: QueuedFactory<T>,
	done: Deferred<T, Interrupt>,
}

struct SeqState<T> {
	running: Option<Running<T>>,
	queued: Option<Queued<T>>,
}

/// Tracks one running task plus at most one queued follow-up.
///
/// The follow-up slot holds a single factory; queueing again while one is
/// held replaces the factory but keeps the shared completion, so every caller
/// that queued during the run resolves with the task that finally executes.
pub struct TaskSequentializer<T> {
	state: Arc<Mutex<SeqState<T>>>,
}

impl<T> Clone for TaskSequentializer<T> {
	fn clone(&self) -> Self {
		Self { state: Arc::clone(&self.state) }
	}
}

impl<T> Default for TaskSequentializer<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T> TaskSequentializer<T> {
	/// Creates an idle sequentializer.
	pub fn new() -> Self {
		Self {
			state: Arc::new(Mutex::new(SeqState { running: None, queued: None })),
		}
	}

	/// Returns whether a task is running; with a version, whether that
	/// specific task is the one running.
	pub fn is_running(&self, version: Option<u64>) -> bool {
		self.state
			.lock()
			.map(|state| match (&state.running, version) {
				(Some(running), Some(version)) => running.version == version,
				(Some(_), None) => true,
				(None, _) => false,
			})
			.unwrap_or(false)
	}

	/// Returns whether a follow-up is currently held.
	pub fn has_queued(&self) -> bool {
		self.state
			.lock()
			.map(|state| state.queued.is_some())
			.unwrap_or(false)
	}

	/// Invokes the running task's cancel hook, when it registered one.
	pub fn cancel_running(&self) {
		let cancel = {
			let Ok(mut state) = self.state.lock() else {
				return;
			};
			state.running.as_mut().and_then(|running| running.cancel.take())
		};
		if let Some(cancel) = cancel {
			cancel();
		}
	}
}

impl<T: Clone + Send + 'static> TaskSequentializer<T> {
	/// Registers `fut` as the running task for `version` and starts it.
	pub fn run<Fut>(&self, version: u64, fut: Fut) -> impl Future<Output = Result<T, Interrupt>> + Send + use<T, Fut>
	where
		Fut: Future<Output = T> + Send + 'static,
	{
		let done = self.begin_run(version, Box::pin(fut), None);
		async move { done.join().await }
	}

	/// Like [`run`](Self::run), with a hook invoked by `cancel_running`.
	pub fn run_with_cancel<Fut, C>(&self, version: u64, fut: Fut, on_cancel: C) -> impl Future<Output = Result<T, Interrupt>> + Send + use<T, Fut, C>
	where
		Fut: Future<Output = T> + Send + 'static,
		C: FnOnce() + Send + 'static,
	{
		let done = self.begin_run(version, Box::pin(fut), Some(Box::new(on_cancel)));
		async move { done.join().await }
	}

	/// Holds `factory` as the follow-up, replacing any held one. It starts
	/// only after the running task settles.
	pub fn queue<F, Fut>(&self, factory: F) -> impl Future<Output = Result<T, Interrupt>> + Send + use<T, F, Fut>
	where
		F: FnOnce() -> Fut + Send + 'static,
		Fut: Future<Output = Result<T, Interrupt>> + Send + 'static,
	{
		let boxed: QueuedFactory<T> = Box::new(move || Box::pin(factory()));
		let done = self.queue_factory(boxed);
		async move { done.join().await }
	}

	/// Waits for pending work: the follow-up when one is held, otherwise the
	/// running task, otherwise returns immediately.
	pub fn join(&self) -> impl Future<Output = ()> + Send + use<T> {
		let done = {
			let pending = self.state.lock().ok().and_then(|state| {
				state
					.queued
					.as_ref()
					.map(|queued| queued.done.clone())
					.or_else(|| state.running.as_ref().map(|running| running.done.clone()))
			});
			pending
		};
		async move {
			if let Some(done) = done {
				let _ = done.wait().await;
			}
		}
	}

	fn queue_factory(&self, factory: QueuedFactory<T>) -> Deferred<T, Interrupt> {
		let Ok(mut state) = self.state.lock() else {
			let done = Deferred::new();
			done.cancel();
			return done;
		};
		match state.queued.as_mut() {
			Some(queued) => {
				queued.factory = factory;
				queued.done.clone()
			}
			None => {
				let done = Deferred::new();
				state.queued = Some(Queued { factory, done: done.clone() });
				done
			}
		}
	}

	/// Runs `factory` now when idle, otherwise replaces the held follow-up
	/// with a factory that re-enters `run` with a fresh version.
	pub(crate) fn run_latest(&self, versions: &Arc<AtomicU64>, factory: TaskFactory<T>) -> Deferred<T, Interrupt> {
		let started = {
			let Ok(mut state) = self.state.lock() else {
				let done = Deferred::new();
				done.cancel();
				return done;
			};
			if state.running.is_none() {
				let version = versions.fetch_add(1, Ordering::Relaxed);
				let done = Deferred::new();
				state.running = Some(Running {
					version,
					done: done.clone(),
					cancel: None,
				});
				Ok((version, done, factory))
			} else {
				let this = self.clone();
				let versions = Arc::clone(versions);
				let wrapped: QueuedFactory<T> = Box::new(move || {
					let version = versions.fetch_add(1, Ordering::Relaxed);
					let done = this.begin_run(version, factory(), None);
					Box::pin(async move { done.join().await })
				});
				Err(match state.queued.as_mut() {
					Some(queued) => {
						queued.factory = wrapped;
						queued.done.clone()
					}
					None => {
						let done = Deferred::new();
						state.queued = Some(Queued { factory: wrapped, done: done.clone() });
						done
					}
				})
			}
		};
		match started {
			Ok((version, done, factory)) => {
				self.spawn_running(version, factory(), done.clone());
				done
			}
			Err(done) => done,
		}
	}

	fn begin_run(&self, version: u64, fut: BoxFuture<T>, cancel: Option<CancelFn>) -> Deferred<T, Interrupt> {
		let done = Deferred::new();
		{
			let Ok(mut state) = self.state.lock() else {
				done.cancel();
				return done;
			};
			state.running = Some(Running {
				version,
				done: done.clone(),
				cancel,
			});
		}
		self.spawn_running(version, fut, done.clone());
		done
	}

	fn spawn_running(&self, version: u64, fut: BoxFuture<T>, done: Deferred<T, Interrupt>) {
		let this = self.clone();
		spawn("sequentializer.run", async move {
			let body = spawn("sequentializer.task", fut);
			match body.await {
				Ok(value) => {
					done.complete(value);
				}
				Err(_) => {
					done.cancel();
				}
			}
			this.done_running(version);
		});
	}

	fn done_running(&self, version: u64) {
		let queued = {
			let Ok(mut state) = self.state.lock() else {
				return;
			};
			if !state.running.as_ref().is_some_and(|running| running.version == version) {
				return;
			}
			state.running = None;
			state.queued.take()
		};
		if let Some(queued) = queued {
			// The factory's synchronous part registers the next running slot
			// before anyone can observe the sequentializer as idle.
			let fut = (queued.factory)();
			let done = queued.done;
			spawn("sequentializer.queued", async move {
				match fut.await {
					Ok(value) => {
						done.complete(value);
					}
					Err(err) => {
						done.error(err);
					}
				}
			});
		}
	}
}
