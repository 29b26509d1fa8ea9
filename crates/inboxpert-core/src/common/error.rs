//! Error types for the categorization pipeline.
//!
//! This module defines the central `Error` enum shared by the connection pool,
//! the retrying invoker, the batch dispatcher and the service layer. It
//! implements `From<Error>` for `tonic::Status` so handlers can surface
//! failures to gRPC clients with an appropriate status code.
//!
//! ## Error Cases
//! - `InvalidRequest`: malformed or oversized input. Never retried.
//! - `Connection`: a transport handle could not be created or reused.
//! - `Backend`: a single call to the ML backend failed.
//! - `Invocation`: every configured attempt of a call failed.
//! - `Persistence`: a repository write or read failed.
//! - `DeadlineExceeded` / `RequestCancelled`: the request context ended.
//! - `ServiceShutdown`: work arrived while the service was shutting down.
//! - `ChannelError`: an internal task or channel failure.

use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the categorization pipeline.
#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// The client request was invalid or exceeded constraints.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// A connection to `address` could not be established or closed.
    #[error("Connection to {address} failed: {reason}")]
    Connection { address: String, reason: String },

    /// The ML backend rejected or failed a single call.
    #[error("Backend call failed: {}", .0.message())]
    Backend(#[from] Status),

    /// A call failed on every attempt. `source` is the last failure.
    #[error("Categorization failed after {attempts} attempts: {source}")]
    Invocation {
        attempts: usize,
        #[source]
        source: Box<Error>,
    },

    /// A persistence collaborator failed.
    #[error("Persistence error: {reason}")]
    Persistence { reason: String },

    /// The request deadline elapsed before the work finished.
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// The request was cancelled (client disconnect or shutdown).
    #[error("Request cancelled")]
    RequestCancelled,

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,

    /// Internal channel or task failure.
    #[error("Channel error: {context}")]
    ChannelError { context: String },
}

impl Error {
    /// Returns `true` for errors raised before any work was dispatched.
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::InvalidRequest { .. })
    }

    /// Returns `true` when the request context ended, as opposed to the
    /// work itself failing.
    pub const fn is_context_ended(&self) -> bool {
        matches!(self, Self::DeadlineExceeded | Self::RequestCancelled)
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::InvalidRequest { reason } => Status::invalid_argument(reason),
            e @ Error::Connection { .. } => Status::unavailable(e.to_string()),
            Error::Backend(status) => status,
            e @ Error::Invocation { .. } => Status::internal(e.to_string()),
            e @ Error::Persistence { .. } => Status::internal(e.to_string()),
            Error::DeadlineExceeded => Status::deadline_exceeded("Request deadline exceeded"),
            Error::RequestCancelled => Status::cancelled("Request was cancelled"),
            Error::ServiceShutdown => Status::unavailable("Service is shutting down"),
            Error::ChannelError { context } => {
                Status::internal(format!("Channel error: {context}"))
            }
        }
    }
}
