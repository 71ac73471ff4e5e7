// src/error.rs

//! The closed error surface shared by queues and channels.
//!
//! Immediate (`try_*`) operations report value-carrying errors so a failed
//! push hands the item back to the caller. Asynchronous operations complete
//! with a plain [`ErrorCode`]. Every code has a stable snake_case name and a
//! coarse [`ErrorKind`] classification that callers can branch on without
//! enumerating individual codes.

use core::fmt;

/// Every failure a queue or channel operation can report.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
#[non_exhaustive]
pub enum ErrorCode {
  /// The ring is at capacity (and, for the growable variant, cannot expand
  /// further). Transient; retry after a pop.
  QueueFull,
  /// The ring holds no value. Transient; retry after a push.
  QueueEmpty,
  /// The channel was closed; no further values will be accepted.
  ChannelClosed,
  /// The operation observed a stop request and gave up cooperatively.
  Canceled,
  /// A deadline variant ran out of time.
  Timeout,
  /// A required collaborator was not reachable.
  Unavailable,
  /// An argument was outside the documented domain.
  InvalidArgument,
  /// An API contract was broken by the caller.
  ContractViolation,
  /// A resource budget other than ring capacity was exhausted.
  ResourceExhausted,
  /// Reserved for unreachable paths.
  InternalError,
}

/// Coarse classification of an [`ErrorCode`].
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum ErrorKind {
  /// Caller must adjust usage; retrying the same call cannot succeed.
  Contract,
  /// Transient shortage; retriable.
  Resource,
  /// Cooperative cancellation; terminal for that operation.
  Cancellation,
  /// Deadline elapsed; terminal for that operation.
  Timeout,
  /// A collaborator was unreachable.
  Unavailable,
  /// Internal invariant failure.
  Internal,
}

impl ErrorCode {
  /// Stable machine-readable name for logs and metrics.
  pub const fn name(self) -> &'static str {
    match self {
      ErrorCode::QueueFull => "queue_full",
      ErrorCode::QueueEmpty => "queue_empty",
      ErrorCode::ChannelClosed => "channel_closed",
      ErrorCode::Canceled => "canceled",
      ErrorCode::Timeout => "timeout",
      ErrorCode::Unavailable => "unavailable",
      ErrorCode::InvalidArgument => "invalid_argument",
      ErrorCode::ContractViolation => "contract_violation",
      ErrorCode::ResourceExhausted => "resource_exhausted",
      ErrorCode::InternalError => "internal_error",
    }
  }

  /// Classifies this code.
  pub const fn kind(self) -> ErrorKind {
    match self {
      ErrorCode::QueueFull | ErrorCode::QueueEmpty | ErrorCode::ResourceExhausted => ErrorKind::Resource,
      ErrorCode::ChannelClosed | ErrorCode::InvalidArgument | ErrorCode::ContractViolation => ErrorKind::Contract,
      ErrorCode::Canceled => ErrorKind::Cancellation,
      ErrorCode::Timeout => ErrorKind::Timeout,
      ErrorCode::Unavailable => ErrorKind::Unavailable,
      ErrorCode::InternalError => ErrorKind::Internal,
    }
  }

  /// True for codes that a caller may reasonably retry.
  pub const fn is_retryable(self) -> bool {
    matches!(self.kind(), ErrorKind::Resource | ErrorKind::Unavailable)
  }
}

impl fmt::Display for ErrorCode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

impl std::error::Error for ErrorCode {}

/// Error returned by `try_push` operations when the value could not be
/// accepted immediately; the value being pushed is handed back.
#[derive(PartialEq, Eq, Clone)]
pub enum TryPushError<T> {
  /// The ring is at capacity. The value is returned.
  Full(T),
  /// The channel is closed. The value is returned.
  Closed(T),
}

impl<T> TryPushError<T> {
  /// Consumes the error, returning the value that failed to push.
  #[inline]
  pub fn into_inner(self) -> T {
    match self {
      TryPushError::Full(value) | TryPushError::Closed(value) => value,
    }
  }

  /// The [`ErrorCode`] this error maps onto.
  #[inline]
  pub fn code(&self) -> ErrorCode {
    match self {
      TryPushError::Full(_) => ErrorCode::QueueFull,
      TryPushError::Closed(_) => ErrorCode::ChannelClosed,
    }
  }

  /// True when the failure is a transient capacity shortage.
  #[inline]
  pub fn is_full(&self) -> bool {
    matches!(self, TryPushError::Full(_))
  }
}

impl<T> fmt::Debug for TryPushError<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TryPushError::Full(_) => write!(f, "TryPushError::Full(..)"),
      TryPushError::Closed(_) => write!(f, "TryPushError::Closed(..)"),
    }
  }
}

impl<T> fmt::Display for TryPushError<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.code().name())
  }
}

impl<T> std::error::Error for TryPushError<T> {}

/// Error returned by `try_pop` operations when no value could be taken
/// immediately.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TryPopError {
  /// The ring holds no value right now.
  Empty,
  /// The channel is closed and fully drained.
  Closed,
}

impl TryPopError {
  /// The [`ErrorCode`] this error maps onto.
  #[inline]
  pub fn code(&self) -> ErrorCode {
    match self {
      TryPopError::Empty => ErrorCode::QueueEmpty,
      TryPopError::Closed => ErrorCode::ChannelClosed,
    }
  }
}

impl fmt::Display for TryPopError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.code().name())
  }
}

impl std::error::Error for TryPopError {}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn names_are_stable() {
    let table = [
      (ErrorCode::QueueFull, "queue_full"),
      (ErrorCode::QueueEmpty, "queue_empty"),
      (ErrorCode::ChannelClosed, "channel_closed"),
      (ErrorCode::Canceled, "canceled"),
      (ErrorCode::Timeout, "timeout"),
      (ErrorCode::Unavailable, "unavailable"),
      (ErrorCode::InvalidArgument, "invalid_argument"),
      (ErrorCode::ContractViolation, "contract_violation"),
      (ErrorCode::ResourceExhausted, "resource_exhausted"),
      (ErrorCode::InternalError, "internal_error"),
    ];
    for (code, name) in table {
      assert_eq!(code.name(), name);
      assert_eq!(code.to_string(), name);
    }
  }

  #[test]
  fn classification() {
    assert_eq!(ErrorCode::QueueFull.kind(), ErrorKind::Resource);
    assert_eq!(ErrorCode::QueueEmpty.kind(), ErrorKind::Resource);
    assert_eq!(ErrorCode::ResourceExhausted.kind(), ErrorKind::Resource);
    assert_eq!(ErrorCode::ChannelClosed.kind(), ErrorKind::Contract);
    assert_eq!(ErrorCode::InvalidArgument.kind(), ErrorKind::Contract);
    assert_eq!(ErrorCode::ContractViolation.kind(), ErrorKind::Contract);
    assert_eq!(ErrorCode::Canceled.kind(), ErrorKind::Cancellation);
    assert_eq!(ErrorCode::Timeout.kind(), ErrorKind::Timeout);
    assert_eq!(ErrorCode::Unavailable.kind(), ErrorKind::Unavailable);
    assert_eq!(ErrorCode::InternalError.kind(), ErrorKind::Internal);
  }

  #[test]
  fn retryability_follows_kind() {
    assert!(ErrorCode::QueueFull.is_retryable());
    assert!(ErrorCode::Unavailable.is_retryable());
    assert!(!ErrorCode::Canceled.is_retryable());
    assert!(!ErrorCode::ChannelClosed.is_retryable());
  }

  #[test]
  fn try_errors_return_the_value() {
    let err = TryPushError::Full(41);
    assert_eq!(err.code(), ErrorCode::QueueFull);
    assert_eq!(err.into_inner(), 41);

    let err = TryPushError::Closed("v");
    assert!(!err.is_full());
    assert_eq!(err.into_inner(), "v");

    assert_eq!(TryPopError::Empty.code(), ErrorCode::QueueEmpty);
    assert_eq!(TryPopError::Closed.code(), ErrorCode::ChannelClosed);
  }
}
