//! Connection pool with class-based selection.
//!
//! Connections are multiplexed, so the pool hands out shared handles
//! rather than exclusive checkouts. Each member is classified by the
//! writability its handshake reported; write commands must be routed to a
//! connection whose node currently accepts writes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::connection::{MongoConfig, MongoConnection};
use crate::error::{MongoError, MongoResult};

// ============================================================================
// Pool Configuration
// ============================================================================

/// The kind of connection a request needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionClass {
    /// Any healthy connection.
    Basic,
    /// A connection to a node currently accepting writes.
    Writable,
}

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct MongoPoolConfig {
    /// Server connection URL
    pub url: String,
    /// Minimum number of connections
    pub min_connections: u32,
    /// Maximum number of connections
    pub max_connections: u32,
}

impl MongoPoolConfig {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            min_connections: 1,
            max_connections: 10,
        }
    }

    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }
}

// ============================================================================
// Connection Pool
// ============================================================================

/// Internal pool state.
struct MongoPoolInner {
    config: MongoPoolConfig,
    members: Mutex<Vec<Arc<MongoConnection>>>,
    closed: AtomicBool,
}

/// A pool of multiplexed server connections.
#[derive(Clone)]
pub struct MongoPool {
    inner: Arc<MongoPoolInner>,
}

impl MongoPool {
    /// Create an empty pool. Members are added explicitly or created on
    /// demand up to `max_connections`.
    pub fn new(config: MongoPoolConfig) -> Self {
        Self {
            inner: Arc::new(MongoPoolInner {
                config,
                members: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Create a pool and pre-establish its minimum connections.
    pub async fn connect(config: MongoPoolConfig) -> MongoResult<Self> {
        let pool = Self::new(config);

        for _ in 0..pool.inner.config.min_connections {
            let connection = pool.create_connection().await?;
            pool.inner.members.lock().push(connection);
        }

        Ok(pool)
    }

    /// Register an externally established connection.
    pub fn add_connection(&self, connection: Arc<MongoConnection>) -> MongoResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(MongoError::PoolClosed);
        }

        self.inner.members.lock().push(connection);
        Ok(())
    }

    /// Select a connection eligible for the requested class.
    ///
    /// Prefers the least-loaded eligible member; grows the pool when none
    /// is eligible and room remains. Fails with
    /// [`MongoError::NoWritableConnection`] when connections exist but none
    /// accepts writes, and with [`MongoError::PoolExhausted`] when the pool
    /// can neither hand out nor create a connection.
    pub async fn next(&self, class: ConnectionClass) -> MongoResult<Arc<MongoConnection>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(MongoError::PoolClosed);
        }

        let (candidate, member_count) = {
            let mut members = self.inner.members.lock();
            members.retain(|connection| !connection.is_closed());

            let candidate = members
                .iter()
                .filter(|connection| eligible(connection, class))
                .min_by_key(|connection| connection.in_flight())
                .cloned();

            (candidate, members.len())
        };

        if let Some(connection) = candidate {
            return Ok(connection);
        }

        if member_count < self.inner.config.max_connections as usize
            && MongoConfig::from_url(&self.inner.config.url).is_ok()
        {
            let connection = self.create_connection().await?;
            debug!(writable = connection.is_writable(), "Pool grew by one connection");
            self.add_connection(Arc::clone(&connection))?;

            if eligible(&connection, class) {
                return Ok(connection);
            }
            // The new connection is healthy but its node does not accept
            // writes; it stays in the pool for basic requests.
            warn!("Newly established connection is not writable");
            return Err(MongoError::NoWritableConnection);
        }

        if class == ConnectionClass::Writable && member_count > 0 {
            return Err(MongoError::NoWritableConnection);
        }

        Err(MongoError::PoolExhausted)
    }

    /// Close the pool and all member connections.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);

        let members = {
            let mut members = self.inner.members.lock();
            std::mem::take(&mut *members)
        };

        for connection in members {
            connection.close().await;
        }
    }

    /// Current number of pooled connections.
    pub fn len(&self) -> usize {
        self.inner.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn config(&self) -> &MongoPoolConfig {
        &self.inner.config
    }

    async fn create_connection(&self) -> MongoResult<Arc<MongoConnection>> {
        let config = MongoConfig::from_url(&self.inner.config.url)?;
        MongoConnection::connect_with_config(config).await
    }
}

fn eligible(connection: &Arc<MongoConnection>, class: ConnectionClass) -> bool {
    match class {
        ConnectionClass::Basic => true,
        ConnectionClass::Writable => connection.is_writable(),
    }
}
