//! Request execution: deadlines, retries and bounded batch fan-out.
//!
//! - [`context`] - per-request deadline and cancellation (`RequestContext`).
//! - [`invoker`] - fixed-attempt retry around one backend call
//!   (`RetryingInvoker`).
//! - [`batch`] - concurrent batch processing under a worker ceiling
//!   (`BatchDispatcher`).

pub mod batch;
pub mod context;
pub mod invoker;

pub use batch::BatchDispatcher;
pub use context::RequestContext;
pub use invoker::RetryingInvoker;
