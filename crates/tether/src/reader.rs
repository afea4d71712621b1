//! Buffered pull-based reading with lookahead.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::NotBuffered;
use crate::iterable::AsyncIterable;
use crate::task::spawn;

/// Something elements can be pulled from, one at a time.
#[async_trait]
pub trait PullSource<T, E>: Send {
	/// Pulls the next element; `Ok(None)` signals the end of the source.
	async fn pull(&mut self) -> Result<Option<T>, E>;
}

#[async_trait]
impl<T, E> PullSource<T, E> for AsyncIterable<T, E>
where
	T: Send + 'static,
	E: Clone + Send + 'static,
{
	async fn pull(&mut self) -> Result<Option<T>, E> {
		self.next().await
	}
}

/// Outcome of a bounded peek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peeked<T> {
	/// The next element, left in place.
	Value(T),
	/// The source has ended.
	End,
	/// Nothing arrived within the given window.
	TimedOut,
}

struct ReaderState<T> {
	buffer: VecDeque<T>,
	at_end: bool,
}

struct ReaderInner<T, E> {
	// Serializes pulls: concurrent readers share one fetch instead of
	// issuing overlapping pulls against the source.
	source: tokio::sync::Mutex<Box<dyn PullSource<T, E>>>,
	state: Mutex<ReaderState<T>>,
}

/// Buffered reader over a [`PullSource`] with peeking and lookahead.
///
/// All methods take `&self`; clones share the buffer, and concurrent callers
/// that need the same next element trigger at most one underlying pull.
pub struct AsyncReader<T, E> {
	inner: Arc<ReaderInner<T, E>>,
}

impl<T, E> Clone for AsyncReader<T, E> {
	fn clone(&self) -> Self {
		Self { inner: Arc::clone(&self.inner) }
	}
}

impl<T, E> AsyncReader<T, E>
where
	T: Send + 'static,
	E: Send + 'static,
{
	/// Wraps a pull source.
	pub fn new(source: impl PullSource<T, E> + 'static) -> Self {
		Self {
			inner: Arc::new(ReaderInner {
				source: tokio::sync::Mutex::new(Box::new(source)),
				state: Mutex::new(ReaderState {
					buffer: VecDeque::new(),
					at_end: false,
				}),
			}),
		}
	}

	/// Returns true once the source ended and the buffer is empty.
	pub fn end_of_stream(&self) -> bool {
		self.inner
			.state
			.lock()
			.map(|state| state.at_end && state.buffer.is_empty())
			.unwrap_or(true)
	}

	/// Consumes the next element; `Ok(None)` at the end of the source.
	pub async fn read(&self) -> Result<Option<T>, E> {
		loop {
			{
				let Ok(mut state) = self.inner.state.lock() else {
					return Ok(None);
				};
				if let Some(value) = state.buffer.pop_front() {
					return Ok(Some(value));
				}
				if state.at_end {
					return Ok(None);
				}
			}
			self.extend_buffer().await?;
		}
	}

	/// Consumes buffered elements while `predicate` holds, feeding each to
	/// `on_value`. Stops without consuming the first non-matching element.
	pub async fn read_while<P, C, Fut>(&self, mut predicate: P, mut on_value: C) -> Result<(), E>
	where
		P: FnMut(&T) -> bool,
		C: FnMut(T) -> Fut,
		Fut: Future<Output = ()>,
	{
		loop {
			let matched = {
				let Ok(mut state) = self.inner.state.lock() else {
					return Ok(());
				};
				match state.buffer.front() {
					Some(value) => {
						if !predicate(value) {
							return Ok(());
						}
						state.buffer.pop_front()
					}
					None => {
						if state.at_end {
							return Ok(());
						}
						None
					}
				}
			};
			match matched {
				Some(value) => on_value(value).await,
				None => self.extend_buffer().await?,
			}
		}
	}

	/// Consumes and discards everything until the end of the source.
	pub async fn consume_to_end(&self) -> Result<(), E> {
		while self.read().await?.is_some() {}
		Ok(())
	}

	/// Consumes the next element only when one is already buffered.
	pub fn read_buffered(&self) -> Result<Option<T>, NotBuffered> {
		let Ok(mut state) = self.inner.state.lock() else {
			return Err(NotBuffered);
		};
		if let Some(value) = state.buffer.pop_front() {
			return Ok(Some(value));
		}
		if state.at_end {
			return Ok(None);
		}
		Err(NotBuffered)
	}

	// Detached so callers can stop waiting without aborting the pull; a
	// pulled element always lands in the buffer.
	fn start_fill(&self) -> tokio::task::JoinHandle<Result<(), E>> {
		let inner = Arc::clone(&self.inner);
		spawn("reader.fill", async move {
			let mut source = inner.source.lock().await;
			{
				// Another caller may have filled the buffer while this one
				// waited for the source.
				let Ok(state) = inner.state.lock() else {
					return Ok(());
				};
				if !state.buffer.is_empty() || state.at_end {
					return Ok(());
				}
			}
			let pulled = source.pull().await?;
			let Ok(mut state) = inner.state.lock() else {
				return Ok(());
			};
			match pulled {
				Some(value) => state.buffer.push_back(value),
				None => state.at_end = true,
			}
			Ok(())
		})
	}

	async fn extend_buffer(&self) -> Result<(), E> {
		match self.start_fill().await {
			Ok(result) => result,
			// A panicking source ends the stream.
			Err(_) => {
				if let Ok(mut state) = self.inner.state.lock() {
					state.at_end = true;
				}
				Ok(())
			}
		}
	}
}

impl<T, E> AsyncReader<T, E>
where
	T: Clone + Send + 'static,
	E: Send + 'static,
{
	/// Looks at the next element without consuming it.
	pub async fn peek(&self) -> Result<Option<T>, E> {
		loop {
			{
				let Ok(state) = self.inner.state.lock() else {
					return Ok(None);
				};
				if let Some(value) = state.buffer.front() {
					return Ok(Some(value.clone()));
				}
				if state.at_end {
					return Ok(None);
				}
			}
			self.extend_buffer().await?;
		}
	}

	/// Peeks, waiting at most `window` for an element to arrive. On timeout
	/// the pending pull keeps running and its element stays available to
	/// later calls.
	pub async fn peek_timeout(&self, window: Duration) -> Result<Peeked<T>, E> {
		let deadline = tokio::time::Instant::now() + window;
		loop {
			{
				let Ok(state) = self.inner.state.lock() else {
					return Ok(Peeked::End);
				};
				if let Some(value) = state.buffer.front() {
					return Ok(Peeked::Value(value.clone()));
				}
				if state.at_end {
					return Ok(Peeked::End);
				}
			}
			let fill = self.start_fill();
			match tokio::time::timeout_at(deadline, fill).await {
				Ok(Ok(result)) => result?,
				Ok(Err(_)) => {
					if let Ok(mut state) = self.inner.state.lock() {
						state.at_end = true;
					}
				}
				Err(_) => return Ok(Peeked::TimedOut),
			}
		}
	}

	/// Peeks only at an already buffered element.
	pub fn peek_buffered(&self) -> Result<Option<T>, NotBuffered> {
		let Ok(state) = self.inner.state.lock() else {
			return Err(NotBuffered);
		};
		if let Some(value) = state.buffer.front() {
			return Ok(Some(value.clone()));
		}
		if state.at_end {
			return Ok(None);
		}
		Err(NotBuffered)
	}
}
