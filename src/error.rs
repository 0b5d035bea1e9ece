//! Stable error taxonomy for `relay-core`.
//!
//! Fatal, non-data-flow conditions (double-settlement, mis-routed
//! `finished` calls, exceeding `max_connections`, ...) surface as
//! [`CoreError`] rather than as [`Failure`](crate::failure::Failure)
//! records, matching the split drawn in spec §7: failures are data that
//! flows through a callback chain, `CoreError` is raised immediately.

use std::fmt;

/// The crate's single error enum. Every fatal condition named in the
/// component design (§4) maps to exactly one variant here.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A [`Deferred`](crate::deferred::Deferred) was settled a second time
    /// (invariant I1).
    #[error("deferred `{description}` has already been called")]
    AlreadyCalled {
        /// The description of the offending deferred, if any was set.
        description: String,
    },

    /// A value that violates an API contract was supplied — e.g. a
    /// `Deferred` passed into `callback` (invariant I2), or `append` called
    /// on a sequence-mode `MultiDeferred` that is actually map-mode.
    #[error("programming error: {reason}")]
    ProgrammingError {
        /// Human-readable description of the violated contract.
        reason: String,
    },

    /// A [`ProtocolConsumer`](crate::pipeline::consumer::ProtocolConsumer)
    /// returned unconsumed bytes while still bound as the connection's
    /// current consumer.
    #[error("protocol error: consumer left {leftover} unconsumed byte(s) while still current")]
    ProtocolError {
        /// Number of bytes the consumer failed to consume.
        leftover: usize,
    },

    /// Raised by [`Failure::raise_all`](crate::failure::Failure::raise_all)
    /// when there is no single exception-shaped record to re-raise.
    #[error("deferred failure: {count} failure(s) occurred during callbacks")]
    DeferredFailure {
        /// Count of accumulated records at the time of the call.
        count: usize,
    },

    /// [`Producer::new_connection`](crate::pipeline::producer::Producer::new_connection)
    /// was called while at capacity.
    #[error("too many connections: received {received} >= max {max}")]
    TooManyConnections {
        /// Connections received so far (including this attempt).
        received: u64,
        /// The configured cap.
        max: u64,
    },

    /// A `finished(consumer, ...)` call was routed to a `Connection` that
    /// does not currently own `consumer`.
    #[error("finished() called with a consumer that is not the current consumer")]
    ConsumerMismatch,
}

impl CoreError {
    pub fn already_called(description: impl Into<String>) -> Self {
        CoreError::AlreadyCalled {
            description: description.into(),
        }
    }

    pub fn programming_error(reason: impl Into<String>) -> Self {
        CoreError::ProgrammingError {
            reason: reason.into(),
        }
    }
}

/// Convenience alias used throughout the crate for fallible, non-data-flow
/// operations.
pub type CoreResult<T> = Result<T, CoreError>;

impl fmt::Display for CoreErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CoreErrorCategory::Fatal => "fatal",
            CoreErrorCategory::Recoverable => "recoverable",
        };
        write!(f, "{label}")
    }
}

/// Rough triage used by callers deciding whether to log-and-continue or to
/// tear the connection down. `relay-core` itself never makes this decision
/// for the caller — only the application knows what "recoverable" means for
/// a given protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreErrorCategory {
    Fatal,
    Recoverable,
}

impl CoreError {
    /// Default triage for each variant. Applications are free to ignore
    /// this and apply their own policy.
    pub fn category(&self) -> CoreErrorCategory {
        match self {
            CoreError::AlreadyCalled { .. } => CoreErrorCategory::Fatal,
            CoreError::ProgrammingError { .. } => CoreErrorCategory::Fatal,
            CoreError::ProtocolError { .. } => CoreErrorCategory::Recoverable,
            CoreError::DeferredFailure { .. } => CoreErrorCategory::Recoverable,
            CoreError::TooManyConnections { .. } => CoreErrorCategory::Recoverable,
            CoreError::ConsumerMismatch => CoreErrorCategory::Fatal,
        }
    }
}
