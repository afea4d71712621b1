//! Cancelable units of work.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
pub use tokio_util::sync::CancellationToken;

use crate::error::Interrupt;
use crate::task::spawn;

/// Handle to a spawned unit of work that can be cooperatively canceled.
///
/// The wrapped future starts running immediately. Cancellation always wins:
/// once `cancel()` has been called, awaiting the handle yields
/// `Err(Interrupt::Canceled)` even when the inner future had already produced
/// a value. The buffered value is dropped in that case, which releases any
/// resources it owned.
pub struct CancelableTask<T> {
	token: CancellationToken,
	rx: oneshot::Receiver<T>,
}

impl<T: Send + 'static> CancelableTask<T> {
	/// Spawns the future produced by `f`, handing it this task's token.
	pub fn spawn<F, Fut>(f: F) -> Self
	where
		F: FnOnce(CancellationToken) -> Fut,
		Fut: Future<Output = T> + Send + 'static,
	{
		let token = CancellationToken::new();
		let fut = f(token.clone());
		let (tx, rx) = oneshot::channel();
		let run_token = token.clone();
		spawn("cancelable_task", async move {
			tokio::select! {
				value = fut => {
					let _ = tx.send(value);
				}
				() = run_token.cancelled() => {}
			}
		});
		Self { token, rx }
	}
}

impl<T> CancelableTask<T> {
	/// Requests cooperative cancellation. Idempotent.
	pub fn cancel(&self) {
		self.token.cancel();
	}

	/// Returns the token observed by the wrapped future.
	pub fn token(&self) -> &CancellationToken {
		&self.token
	}

	/// Returns whether cancellation has been requested.
	pub fn is_canceled(&self) -> bool {
		self.token.is_cancelled()
	}
}

impl<T> Future for CancelableTask<T> {
	type Output = Result<T, Interrupt>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		match Pin::new(&mut self.rx).poll(cx) {
			Poll::Ready(Ok(value)) => {
				// A cancel that raced the value still wins.
				if self.token.is_cancelled() {
					Poll::Ready(Err(Interrupt::Canceled))
				} else {
					Poll::Ready(Ok(value))
				}
			}
			Poll::Ready(Err(_)) => Poll::Ready(Err(Interrupt::Canceled)),
			Poll::Pending => Poll::Pending,
		}
	}
}
