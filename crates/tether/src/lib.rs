//! Composable coordination primitives for asynchronous work.
//!
//! The crate groups a handful of small, independently useful building blocks:
//!
//! - [`CancelableTask`] and [`Deferred`]: cancelable units of work and
//!   externally settled promise cells.
//! - [`Throttler`], [`Delayer`], [`ThrottledDelayer`]: request coalescing and
//!   trailing-edge debouncing.
//! - [`Queue`], [`Limiter`], [`ResourceQueue`], [`SequencerByKey`],
//!   [`LimitedQueue`], [`TaskSequentializer`]: ordered execution with bounded
//!   parallelism, flat or keyed.
//! - [`AsyncIterable`] and [`AsyncReader`]: lazy asynchronous sequences and
//!   buffered pull-based reading with lookahead.
//! - [`ThrottledWorker`]: chunked batch consumption with backpressure.
//! - [`race_cancellation`], [`race_timeout`], [`first`], [`first_parallel`],
//!   [`retry`], [`settled`], [`IntervalCounter`]: races and retries.
//!
//! A task admitted anywhere in this crate settles only its own caller; task
//! failures travel inside the task's output type, while the primitives inject
//! exactly one error of their own, [`Interrupt`].

mod cancel;
mod deferred;
mod error;
mod iterable;
mod limiter;
mod queue;
mod race;
mod reader;
mod sequentializer;
mod task;
mod throttle;
mod worker;

pub use cancel::{CancelableTask, CancellationToken};
pub use deferred::Deferred;
pub use error::{Interrupt, NotBuffered, SettleError};
pub use iterable::{AsyncIterable, CancelableIterable, Emitter, cancelable_iterable};
pub use limiter::{Limiter, Ticket};
pub use queue::{LimitedQueue, Queue, ResourceQueue, SequencerByKey};
pub use race::{
	IntervalCounter, first, first_parallel, race_cancellation, race_cancellation_error,
	race_cancellation_with, race_timeout, race_timeout_with, retry, settled,
};
pub use reader::{AsyncReader, Peeked, PullSource};
pub use sequentializer::TaskSequentializer;
pub use task::BoxFuture;
pub use throttle::{Delay, Delayer, ThrottledDelayer, Throttler};
pub use worker::{ThrottledWorker, ThrottledWorkerOptions};
