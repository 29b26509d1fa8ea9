//! gRPC service implementation and persistence seam.
//!
//! This module contains the client-facing side of the server: request
//! validation, connection acquisition, dispatch to the ML backend and the
//! best-effort persistence of results.
//!
//! ## Structure
//!
//! - [`handler`] - gRPC service entry point (`CategorizationService`).
//! - [`store`] - repository seam and the in-memory repository.

pub mod handler;
pub mod store;

pub use handler::CategorizationService;
pub use store::{CategoryRecord, EmailRepository, MemoryRepository, Persisted};
