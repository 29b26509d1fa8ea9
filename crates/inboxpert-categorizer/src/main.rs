use clap::Parser;
use inboxpert_categorizer::server::{
    config::{CliArgs, ServiceConfig},
    pool::{ConnectionPool, GrpcConnector},
    service::{CategorizationService, MemoryRepository},
    telemetry::{TelemetryProviders, init_telemetry},
};
use inboxpert_core::proto::{
    FILE_DESCRIPTOR_SET,
    categorization::email_categorization_service_server::EmailCategorizationServiceServer,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{codec::CompressionEncoding, transport::Server};
use tonic_health::server::HealthReporter;
use tonic_reflection::server::Builder;
use tonic_web::GrpcWebLayer;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};

type Service = CategorizationService<GrpcConnector>;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = Arc::new(ServiceConfig::try_from(args)?);

    let providers = init_telemetry()?;

    let listener = TcpListener::bind(&config.server_addr).await?;
    let incoming = TcpListenerStream::new(listener);
    log_startup_info(&config);

    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<EmailCategorizationServiceServer<Service>>()
        .await;

    let pool = Arc::new(ConnectionPool::new(GrpcConnector::new(&config)));
    let mut service = CategorizationService::new(Arc::clone(&config), pool);
    if config.persist_results {
        service = service.with_repository(Arc::new(MemoryRepository::new()));
    }

    let reflection = Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()?;

    Server::builder()
        .accept_http1(true)
        .http2_adaptive_window(Some(true))
        .layer(
            ServiceBuilder::new()
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                )
                .layer(GrpcWebLayer::new()),
        )
        .add_service(health_service)
        .add_service(reflection)
        .add_service(build_categorization_service(service.clone()))
        .serve_with_incoming_shutdown(
            incoming,
            shutdown_signal(service, health_reporter, providers),
        )
        .await?;

    tracing::info!("Service shut down successfully");
    Ok(())
}

fn log_startup_info(config: &ServiceConfig) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Starting categorization service on {} with full config: {:#?}",
            config.server_addr,
            config
        );
    } else {
        tracing::info!(
            "Starting categorization service on {} with {} workers, ML backend at {}",
            config.server_addr,
            config.num_workers,
            config.ml_server_addr
        );
    }
}

fn build_categorization_service(service: Service) -> EmailCategorizationServiceServer<Service> {
    EmailCategorizationServiceServer::new(service)
        .send_compressed(CompressionEncoding::Zstd)
        .send_compressed(CompressionEncoding::Gzip)
        .send_compressed(CompressionEncoding::Deflate)
        .accept_compressed(CompressionEncoding::Zstd)
        .accept_compressed(CompressionEncoding::Gzip)
        .accept_compressed(CompressionEncoding::Deflate)
}

async fn shutdown_signal(
    service: Service,
    health_reporter: HealthReporter,
    providers: TelemetryProviders,
) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, terminating gracefully...");

    // 1. Publish the status
    health_reporter
        .set_not_serving::<EmailCategorizationServiceServer<Service>>()
        .await;

    // 2. Cancel in-flight work and release backend connections
    let timeout = service.config().shutdown_timeout;
    match tokio::time::timeout(timeout, service.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("Error during service shutdown: {e}"),
        Err(_) => tracing::warn!("Service shutdown did not finish within {timeout:?}"),
    }

    // 3. Flush telemetry
    providers.shutdown();
}
