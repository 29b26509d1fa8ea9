use anyhow::bail;
use clap::Parser;
use core::time::Duration;

/// Runtime configuration for the `inboxpert-categorizer` binary.
///
/// These settings control where the service listens, which ML backend it
/// talks to, and how batch work is bounded and retried. All values are parsed
/// from CLI arguments or environment variables (a `.env` file is loaded
/// first), with defaults matching a local development setup.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "inboxpert-categorizer",
    version,
    about = "A gRPC service that categorizes emails through an ML backend"
)]
pub struct CliArgs {
    /// Address the gRPC server listens on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:50051"))]
    pub server_addr: String,

    /// Address of the ML prediction backend. A missing scheme defaults to
    /// `http://` (or `https://` with `--ml-tls`).
    ///
    /// Environment variable: `ML_SERVER_ADDR`
    #[arg(long, env = "ML_SERVER_ADDR", default_value_t = String::from("http://localhost:50055"))]
    pub ml_server_addr: String,

    /// Maximum number of emails accepted in one batch request. Larger
    /// batches are rejected before any work is dispatched.
    ///
    /// Environment variable: `MAX_BATCH_SIZE`
    #[arg(long, env = "MAX_BATCH_SIZE", default_value_t = 1000)]
    pub max_batch_size: usize,

    /// Number of worker slots, i.e. the ceiling on concurrent in-flight
    /// backend calls across all batches.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS", default_value_t = 10)]
    pub num_workers: usize,

    /// Attempts per backend call. `0` behaves like `1`: try once, no retry.
    ///
    /// Environment variable: `RETRY_ATTEMPTS`
    #[arg(long, env = "RETRY_ATTEMPTS", default_value_t = 3)]
    pub retry_attempts: usize,

    /// Deadline applied to every request, measured from its arrival.
    ///
    /// Environment variable: `REQUEST_TIMEOUT_MS`
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value_t = 10_000)]
    pub request_timeout_ms: u64,

    /// Timeout for establishing the transport to the ML backend.
    ///
    /// Environment variable: `CONNECT_TIMEOUT_MS`
    #[arg(long, env = "CONNECT_TIMEOUT_MS", default_value_t = 5_000)]
    pub connect_timeout_ms: u64,

    /// Use TLS (native roots) for the ML backend connection.
    ///
    /// Environment variable: `ML_TLS`
    #[arg(long, env = "ML_TLS", default_value_t = false)]
    pub ml_tls: bool,

    /// Keep categorized emails in the in-process repository.
    ///
    /// Environment variable: `PERSIST_RESULTS`
    #[arg(long, env = "PERSIST_RESULTS", default_value_t = false)]
    pub persist_results: bool,

    /// Seconds to wait for pooled connections to close on shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 3)]
    pub shutdown_timeout: u64,
}

/// Validated, immutable service configuration.
///
/// Read once at startup and shared by reference (`Arc`) with every component.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub server_addr: String,
    pub ml_server_addr: String,
    pub max_batch_size: usize,
    pub num_workers: usize,
    pub retry_attempts: usize,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub ml_tls: bool,
    pub persist_results: bool,
    pub shutdown_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            server_addr: "0.0.0.0:50051".to_string(),
            ml_server_addr: "http://localhost:50055".to_string(),
            max_batch_size: 1000,
            num_workers: 10,
            retry_attempts: 3,
            request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            ml_tls: false,
            persist_results: false,
            shutdown_timeout: Duration::from_secs(3),
        }
    }
}

impl TryFrom<CliArgs> for ServiceConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.max_batch_size == 0 {
            bail!("MAX_BATCH_SIZE must be greater than 0");
        }

        if args.num_workers == 0 {
            bail!("NUM_WORKERS must be greater than 0");
        }

        if args.request_timeout_ms == 0 {
            bail!("REQUEST_TIMEOUT_MS must be greater than 0");
        }

        if args.connect_timeout_ms == 0 {
            bail!("CONNECT_TIMEOUT_MS must be greater than 0");
        }

        if args.ml_server_addr.trim().is_empty() {
            bail!("ML_SERVER_ADDR must not be empty");
        }

        Ok(Self {
            server_addr: args.server_addr,
            ml_server_addr: args.ml_server_addr,
            max_batch_size: args.max_batch_size,
            num_workers: args.num_workers,
            retry_attempts: args.retry_attempts,
            request_timeout: Duration::from_millis(args.request_timeout_ms),
            connect_timeout: Duration::from_millis(args.connect_timeout_ms),
            ml_tls: args.ml_tls,
            persist_results: args.persist_results,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
        })
    }
}
