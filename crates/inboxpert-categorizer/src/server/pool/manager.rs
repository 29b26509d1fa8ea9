//! Shared cache of backend connections keyed by service address.
//!
//! [`ConnectionPool`] hands out one canonical handle per address. Lookups
//! take the shared side of an async `RwLock`; creation takes the exclusive
//! side and re-checks the map before dialing, so concurrent first callers for
//! the same address never create two handles.
//!
//! The pool is an explicitly constructed object (wrap it in an `Arc` and pass
//! it to every component that needs it). Removing a live entry only happens
//! through [`ConnectionPool::close_connection`] or
//! [`ConnectionPool::close_all`]; callers must not close an address that a
//! concurrent fan-out is still using.

use super::connector::Connector;
use crate::server::telemetry::{decrement_connections_open, increment_connections_open};
use inboxpert_core::Result;
use std::collections::HashMap;
use tokio::sync::RwLock;

pub struct ConnectionPool<C: Connector> {
    connector: C,
    connections: RwLock<HashMap<String, C::Connection>>,
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub const fn connector(&self) -> &C {
        &self.connector
    }

    /// Returns the connection for `address`, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`](inboxpert_core::Error::Connection) when
    /// the connector cannot establish a handle. Nothing is cached in that
    /// case, so the next call tries again.
    pub async fn get_connection(&self, address: &str) -> Result<C::Connection> {
        {
            let connections = self.connections.read().await;
            if let Some(conn) = connections.get(address) {
                return Ok(conn.clone());
            }
        }

        let mut connections = self.connections.write().await;

        // Another caller may have created the entry while we waited for the
        // exclusive lock.
        if let Some(conn) = connections.get(address) {
            return Ok(conn.clone());
        }

        let conn = self.connector.connect(address).await?;
        connections.insert(address.to_string(), conn.clone());
        increment_connections_open();
        tracing::debug!("Created connection to {address}");

        Ok(conn)
    }

    /// Closes and removes the connection for `address`.
    ///
    /// Absent entries are a no-op. The entry is removed even when the
    /// connector fails to close it; the failure is still returned.
    pub async fn close_connection(&self, address: &str) -> Result<()> {
        let removed = self.connections.write().await.remove(address);

        match removed {
            Some(conn) => {
                decrement_connections_open();
                tracing::debug!("Closing connection to {address}");
                self.connector.close(address, conn).await
            }
            None => Ok(()),
        }
    }

    /// Closes every pooled connection.
    ///
    /// Best-effort: a failure to close one connection does not stop the
    /// others from being closed. The last failure encountered is returned.
    pub async fn close_all(&self) -> Result<()> {
        let drained: Vec<_> = self.connections.write().await.drain().collect();

        let mut last_err = None;
        for (address, conn) in drained {
            decrement_connections_open();
            if let Err(e) = self.connector.close(&address, conn).await {
                tracing::error!("Error closing connection to {address}: {e}");
                last_err = Some(e);
            }
        }

        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn contains(&self, address: &str) -> bool {
        self.connections.read().await.contains_key(address)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inboxpert_core::Error;
    use std::collections::HashSet;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };
    use std::time::Duration;
    use tokio::task::JoinSet;

    /// Hands out `Arc<usize>` handles numbered by creation order.
    #[derive(Default)]
    struct CountingConnector {
        created: AtomicUsize,
        closed: AtomicUsize,
        refuse: HashSet<String>,
        fail_close: HashSet<String>,
    }

    #[tonic::async_trait]
    impl Connector for CountingConnector {
        type Connection = Arc<usize>;

        async fn connect(&self, address: &str) -> Result<Arc<usize>> {
            // Widen the window for racing creators.
            tokio::time::sleep(Duration::from_millis(5)).await;
            if self.refuse.contains(address) {
                return Err(Error::Connection {
                    address: address.to_string(),
                    reason: "refused".into(),
                });
            }
            Ok(Arc::new(self.created.fetch_add(1, Ordering::SeqCst)))
        }

        async fn close(&self, address: &str, _connection: Arc<usize>) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            if self.fail_close.contains(address) {
                return Err(Error::Connection {
                    address: address.to_string(),
                    reason: "close failed".into(),
                });
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn sequential_calls_reuse_the_handle() {
        let pool = ConnectionPool::new(CountingConnector::default());

        let first = pool.get_connection("ml:50055").await.unwrap();
        let second = pool.get_connection("ml:50055").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.connector().created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn addresses_get_distinct_handles() {
        let pool = ConnectionPool::new(CountingConnector::default());

        let a = pool.get_connection("a:1").await.unwrap();
        let b = pool.get_connection("b:1").await.unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(pool.len().await, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_access_creates_one_handle() {
        let pool = Arc::new(ConnectionPool::new(CountingConnector::default()));
        let mut tasks = JoinSet::new();

        for _ in 0..32 {
            let pool = Arc::clone(&pool);
            tasks.spawn(async move { pool.get_connection("ml:50055").await.unwrap() });
        }

        let handles: Vec<_> = tasks.join_all().await;
        assert_eq!(pool.connector().created.load(Ordering::SeqCst), 1);
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
    }

    #[tokio::test]
    async fn failed_creation_is_not_cached() {
        let connector = CountingConnector {
            refuse: HashSet::from(["down:1".to_string()]),
            ..Default::default()
        };
        let pool = ConnectionPool::new(connector);

        let err = pool.get_connection("down:1").await.unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
        assert!(!pool.contains("down:1").await);
    }

    #[tokio::test]
    async fn closing_an_absent_address_is_a_no_op() {
        let pool = ConnectionPool::new(CountingConnector::default());

        pool.close_connection("nowhere:1").await.unwrap();
        assert_eq!(pool.connector().closed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn closing_twice_is_safe() {
        let pool = ConnectionPool::new(CountingConnector::default());
        pool.get_connection("ml:50055").await.unwrap();

        pool.close_connection("ml:50055").await.unwrap();
        pool.close_connection("ml:50055").await.unwrap();

        assert!(pool.is_empty().await);
        assert_eq!(pool.connector().closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reconnects_after_close() {
        let pool = ConnectionPool::new(CountingConnector::default());

        let first = pool.get_connection("ml:50055").await.unwrap();
        pool.close_connection("ml:50055").await.unwrap();
        let second = pool.get_connection("ml:50055").await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(pool.connector().created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_close_still_removes_the_entry() {
        let connector = CountingConnector {
            fail_close: HashSet::from(["ml:50055".to_string()]),
            ..Default::default()
        };
        let pool = ConnectionPool::new(connector);
        let first = pool.get_connection("ml:50055").await.unwrap();

        let err = pool.close_connection("ml:50055").await.unwrap_err();

        assert!(matches!(err, Error::Connection { ref address, .. } if address == "ml:50055"));
        assert!(!pool.contains("ml:50055").await);
        assert_eq!(pool.connector().closed.load(Ordering::SeqCst), 1);
        let second = pool.get_connection("ml:50055").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn close_all_continues_past_failures() {
        let connector = CountingConnector {
            fail_close: HashSet::from(["b:1".to_string()]),
            ..Default::default()
        };
        let pool = ConnectionPool::new(connector);
        for address in ["a:1", "b:1", "c:1"] {
            pool.get_connection(address).await.unwrap();
        }

        let err = pool.close_all().await.unwrap_err();

        match err {
            Error::Connection { address, .. } => assert_eq!(address, "b:1"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(pool.is_empty().await);
        assert_eq!(pool.connector().closed.load(Ordering::SeqCst), 3);
    }
}
