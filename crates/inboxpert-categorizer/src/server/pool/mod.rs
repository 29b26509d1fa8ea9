//! Backend connection management.
//!
//! - [`connector`] - how handles are created and closed (`GrpcConnector`).
//! - [`manager`] - the shared, address-keyed cache (`ConnectionPool`).

pub mod connector;
pub mod manager;

pub use connector::{Connector, GrpcConnector};
pub use manager::ConnectionPool;
