use crate::server::{
    backend::{MlConnection, TransportRetry},
    config::ServiceConfig,
};
use core::time::Duration;
use inboxpert_core::{Error, Result};
use tonic::transport::{ClientTlsConfig, Endpoint};

/// Creates and closes the connection handles cached by
/// [`ConnectionPool`](super::ConnectionPool).
///
/// Handles must be cheap to clone: every caller of `get_connection` receives
/// its own clone of the single canonical handle for an address.
#[tonic::async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Clone + Send + Sync + 'static;

    /// Establishes a new connection to `address`.
    async fn connect(&self, address: &str) -> Result<Self::Connection>;

    /// Releases a connection previously returned by `connect`.
    async fn close(&self, address: &str, connection: Self::Connection) -> Result<()>;
}

/// Connector for the ML backend over tonic/HTTP2.
///
/// - Plaintext by default, TLS with native roots when configured.
/// - HTTP/2 keepalive pings every 10s with a 3s timeout, also while idle, so
///   dead peers are detected rather than hanging calls.
/// - Channels are created lazily: the dial happens on first use and tonic
///   reconnects on its own after failures.
/// - Handles carry a [`TransportRetry`] policy for `UNAVAILABLE` responses.
#[derive(Debug, Clone)]
pub struct GrpcConnector {
    tls: bool,
    connect_timeout: Duration,
    keepalive_interval: Duration,
    keepalive_timeout: Duration,
    retry: TransportRetry,
}

impl GrpcConnector {
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            tls: config.ml_tls,
            connect_timeout: config.connect_timeout,
            keepalive_interval: Duration::from_secs(10),
            keepalive_timeout: Duration::from_secs(3),
            retry: TransportRetry::default(),
        }
    }

    #[must_use]
    pub const fn with_retry(mut self, retry: TransportRetry) -> Self {
        self.retry = retry;
        self
    }

    /// Builds the tonic endpoint for `address` with keepalive and TLS
    /// settings applied.
    pub fn endpoint(&self, address: &str) -> Result<Endpoint> {
        let connection_error = |reason: String| Error::Connection {
            address: address.to_string(),
            reason,
        };

        let uri = normalize_address(address, self.tls);
        let endpoint = Endpoint::from_shared(uri)
            .map_err(|e| connection_error(format!("invalid address: {e}")))?
            .connect_timeout(self.connect_timeout)
            .http2_keep_alive_interval(self.keepalive_interval)
            .keep_alive_timeout(self.keepalive_timeout)
            .keep_alive_while_idle(true)
            .tcp_nodelay(true);

        if self.tls {
            endpoint
                .tls_config(ClientTlsConfig::new().with_native_roots())
                .map_err(|e| connection_error(format!("invalid TLS configuration: {e}")))
        } else {
            Ok(endpoint)
        }
    }
}

#[tonic::async_trait]
impl Connector for GrpcConnector {
    type Connection = MlConnection;

    async fn connect(&self, address: &str) -> Result<MlConnection> {
        let channel = self.endpoint(address)?.connect_lazy();
        Ok(MlConnection::new(channel, self.retry))
    }

    async fn close(&self, _address: &str, connection: MlConnection) -> Result<()> {
        // The HTTP/2 connection is torn down once the last channel clone is
        // dropped.
        drop(connection);
        Ok(())
    }
}

/// Prefixes `address` with a scheme when it has none.
pub fn normalize_address(address: &str, tls: bool) -> String {
    let address = address.trim();
    if address.contains("://") {
        address.to_string()
    } else if tls {
        format!("https://{address}")
    } else {
        format!("http://{address}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adds_scheme_only_when_missing() {
        assert_eq!(
            normalize_address("localhost:50055", false),
            "http://localhost:50055"
        );
        assert_eq!(
            normalize_address("ml.internal:443", true),
            "https://ml.internal:443"
        );
        assert_eq!(
            normalize_address("http://10.0.0.2:50055", true),
            "http://10.0.0.2:50055"
        );
    }

    #[test]
    fn endpoint_uses_normalized_uri() {
        let connector = GrpcConnector::new(&ServiceConfig::default());
        let endpoint = connector.endpoint("localhost:50055").unwrap();
        let uri = endpoint.uri();
        assert_eq!(uri.scheme_str(), Some("http"));
        assert_eq!(uri.host(), Some("localhost"));
        assert_eq!(uri.port_u16(), Some(50055));
    }

    #[tokio::test]
    async fn invalid_address_is_a_connection_error() {
        let connector = GrpcConnector::new(&ServiceConfig::default());
        let err = connector.connect("not a valid uri").await.unwrap_err();
        match err {
            Error::Connection { address, .. } => assert_eq!(address, "not a valid uri"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn connect_is_lazy() {
        // Nothing listens on this port; a lazy channel is still handed out.
        let connector = GrpcConnector::new(&ServiceConfig::default());
        let conn = connector.connect("127.0.0.1:1").await;
        assert!(conn.is_ok());
    }
}
