//! Externally settlable promise cell.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::error::{Interrupt, SettleError};

enum State<T, E> {
	Pending,
	Resolved(T),
	Rejected(E),
	Canceled,
}

struct Inner<T, E> {
	state: Mutex<State<T, E>>,
	notify: Notify,
}

/// A promise cell settled from the outside: `complete`, `error`, or `cancel`.
///
/// The first settle wins. Later settle attempts return false and leave the
/// retained outcome untouched. Any number of clones may `wait()` concurrently;
/// all of them observe the same outcome.
pub struct Deferred<T, E = Interrupt> {
	inner: Arc<Inner<T, E>>,
}

impl<T, E> Clone for Deferred<T, E> {
	fn clone(&self) -> Self {
		Self { inner: Arc::clone(&self.inner) }
	}
}

impl<T, E> Default for Deferred<T, E> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T, E> Deferred<T, E> {
	/// Creates an unsettled cell.
	pub fn new() -> Self {
		Self {
			inner: Arc::new(Inner {
				state: Mutex::new(State::Pending),
				notify: Notify::new(),
			}),
		}
	}

	fn settle(&self, next: State<T, E>) -> bool {
		{
			let Ok(mut state) = self.inner.state.lock() else {
				return false;
			};
			if !matches!(*state, State::Pending) {
				return false;
			}
			*state = next;
		}
		self.inner.notify.notify_waiters();
		true
	}

	/// Settles the cell with a value. Returns false when already settled.
	pub fn complete(&self, value: T) -> bool {
		self.settle(State::Resolved(value))
	}

	/// Settles the cell with an error. Returns false when already settled.
	pub fn error(&self, err: E) -> bool {
		self.settle(State::Rejected(err))
	}

	/// Settles the cell as canceled. Returns false when already settled.
	pub fn cancel(&self) -> bool {
		self.settle(State::Canceled)
	}

	/// Returns true once any settle call has landed.
	pub fn is_settled(&self) -> bool {
		self.inner
			.state
			.lock()
			.map(|state| !matches!(*state, State::Pending))
			.unwrap_or(true)
	}

	/// Returns true when settled with a value.
	pub fn is_resolved(&self) -> bool {
		self.inner
			.state
			.lock()
			.map(|state| matches!(*state, State::Resolved(_)))
			.unwrap_or(false)
	}

	/// Returns true when settled with an error.
	pub fn is_rejected(&self) -> bool {
		self.inner
			.state
			.lock()
			.map(|state| matches!(*state, State::Rejected(_)))
			.unwrap_or(false)
	}

	/// Returns true when settled by cancellation.
	pub fn is_canceled(&self) -> bool {
		self.inner
			.state
			.lock()
			.map(|state| matches!(*state, State::Canceled))
			.unwrap_or(false)
	}
}

impl<T: Clone, E: Clone> Deferred<T, E> {
	/// Returns the retained value when settled with one.
	pub fn value(&self) -> Option<T> {
		let Ok(state) = self.inner.state.lock() else {
			return None;
		};
		match &*state {
			State::Resolved(value) => Some(value.clone()),
			_ => None,
		}
	}

	/// Waits until the cell settles and returns the retained outcome.
	pub async fn wait(&self) -> Result<T, SettleError<E>> {
		loop {
			// Register the notification future before checking state so a
			// settle landing in between cannot be missed.
			let notified = self.inner.notify.notified();
			{
				let Ok(state) = self.inner.state.lock() else {
					return Err(SettleError::Canceled);
				};
				match &*state {
					State::Pending => {}
					State::Resolved(value) => return Ok(value.clone()),
					State::Rejected(err) => return Err(SettleError::Failed(err.clone())),
					State::Canceled => return Err(SettleError::Canceled),
				}
			}
			notified.await;
		}
	}
}

impl<T: Clone> Deferred<T, Interrupt> {
	/// Waits, flattening the settle error into the interrupt it carries.
	pub(crate) async fn join(&self) -> Result<T, Interrupt> {
		self.wait().await.map_err(Interrupt::from)
	}
}
