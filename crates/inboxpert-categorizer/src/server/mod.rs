pub mod backend;
pub mod config;
pub mod dispatch;
pub mod pool;
pub mod service;
pub mod telemetry;
