//! Failures injected by the coordination primitives themselves.
//!
//! Task-level failures are never wrapped: a fallible task carries its own
//! error inside its output type and that output reaches only its own caller.

use std::fmt;

use thiserror::Error;

/// Why a primitive refused or abandoned a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Interrupt {
	/// The unit of work stopped because cancellation was requested.
	#[error("operation canceled")]
	Canceled,
	/// The primitive was disposed and no longer accepts or produces work.
	#[error("primitive disposed")]
	Disposed,
}

impl Interrupt {
	/// Returns true for the cancellation variant.
	pub const fn is_canceled(self) -> bool {
		matches!(self, Self::Canceled)
	}

	/// Returns true for the disposed variant.
	pub const fn is_disposed(self) -> bool {
		matches!(self, Self::Disposed)
	}
}

/// Terminal failure of a [`Deferred`](crate::Deferred).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleError<E> {
	/// The cell was settled through `cancel()`.
	Canceled,
	/// The cell was settled through `error(..)`.
	Failed(E),
}

impl<E> SettleError<E> {
	/// Returns true when the cell was canceled rather than failed.
	pub const fn is_canceled(&self) -> bool {
		matches!(self, Self::Canceled)
	}
}

impl<E: fmt::Display> fmt::Display for SettleError<E> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Canceled => write!(f, "settled by cancellation"),
			Self::Failed(err) => write!(f, "settled with error: {err}"),
		}
	}
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for SettleError<E> {}

impl From<SettleError<Interrupt>> for Interrupt {
	fn from(err: SettleError<Interrupt>) -> Self {
		match err {
			SettleError::Canceled => Interrupt::Canceled,
			SettleError::Failed(interrupt) => interrupt,
		}
	}
}

/// The reader holds no fetched element to serve synchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Error)]
#[error("no buffered elements")]
pub struct NotBuffered;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn settle_error_flattens_into_interrupt() {
		assert_eq!(Interrupt::from(SettleError::<Interrupt>::Canceled), Interrupt::Canceled);
		assert_eq!(Interrupt::from(SettleError::Failed(Interrupt::Disposed)), Interrupt::Disposed);
	}

	#[test]
	fn interrupt_predicates() {
		assert!(Interrupt::Canceled.is_canceled());
		assert!(!Interrupt::Canceled.is_disposed());
		assert!(Interrupt::Disposed.is_disposed());
	}
}
