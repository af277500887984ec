//! A database client with a lazily established, shared connection.
//!
//! The connection is created on first use. Concurrent requests that arrive while it is being
//! established all wait for the same attempt. If connecting fails, every waiting request sees
//! the failure, and the next request starts a new attempt.
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use flightcache::{CacheConfig, EntryStatus, SingleFlightCache};
use thiserror::Error;

pub use crate::types::Record;

/// An error talking to the database.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DbError {
    /// Establishing the connection failed.
    #[error("failed to connect to database: {0}")]
    Connect(String),
    /// The requested record does not exist.
    #[error("record {0:?} not found")]
    NotFound(String),
    /// The connection was established, but the query failed.
    #[error("query failed: {0}")]
    Query(String),
}

/// An established database connection.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Reads the record with the given `id`.
    async fn get_record(&self, id: &str) -> Result<Record, DbError>;
}

/// Establishes [`Connection`]s.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connects to the database.
    async fn connect(&self) -> Result<Arc<dyn Connection>, DbError>;
}

/// A database client that connects on first use.
pub struct DbClient {
    connector: Arc<dyn Connector>,
    connection: SingleFlightCache<(), Arc<dyn Connection>, DbError>,
}

impl fmt::Debug for DbClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbClient")
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl DbClient {
    /// Creates a client that connects through `connector` once it is first used.
    ///
    /// The `config` controls the cached connection, e.g. its [`retention`](CacheConfig::retention)
    /// before the client reconnects.
    pub fn new(connector: impl Connector, config: CacheConfig) -> Self {
        Self {
            connector: Arc::new(connector),
            connection: SingleFlightCache::new(config),
        }
    }

    /// Returns the shared connection, establishing it if necessary.
    pub async fn connection(&self) -> Result<Arc<dyn Connection>, DbError> {
        let connector = Arc::clone(&self.connector);
        self.connection
            .get((), move |()| async move {
                tracing::debug!("Connecting to database");
                let connection = connector.connect().await;
                if let Err(err) = &connection {
                    tracing::warn!(
                        error = err as &dyn std::error::Error,
                        "Failed to connect to database"
                    );
                }
                connection
            })
            .await
    }

    /// Reads the record with the given `id`, connecting first if necessary.
    pub async fn get_record(&self, id: &str) -> Result<Record, DbError> {
        let connection = self.connection().await?;
        connection.get_record(id).await
    }

    /// Returns `true` if a connection has been established.
    pub fn is_connected(&self) -> bool {
        self.connection.status(&()) == Some(EntryStatus::Succeeded)
    }

    /// Drops the current connection, so that the next request reconnects.
    ///
    /// Returns `false` if there was no connection (attempt) to drop.
    pub fn reset(&self) -> bool {
        self.connection.invalidate(&())
    }
}

#[derive(Debug, Default)]
struct SimulatedState {
    latency: Duration,
    failing_connects: AtomicUsize,
    connects: AtomicUsize,
    queries: AtomicUsize,
}

/// An in-process database that synthesizes records from their id.
///
/// Cloning it gives another handle to the same database, which is useful to observe how a
/// [`DbClient`] uses it.
#[derive(Clone, Debug, Default)]
pub struct SimulatedDatabase {
    state: Arc<SimulatedState>,
}

impl SimulatedDatabase {
    /// Creates a database that takes `latency` to accept a connection.
    pub fn new(latency: Duration) -> Self {
        Self::with_failing_connects(latency, 0)
    }

    /// Creates a database that refuses the first `failing_connects` connection attempts.
    pub fn with_failing_connects(latency: Duration, failing_connects: usize) -> Self {
        Self {
            state: Arc::new(SimulatedState {
                latency,
                failing_connects: AtomicUsize::new(failing_connects),
                ..Default::default()
            }),
        }
    }

    /// The number of connection attempts so far, including failed ones.
    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::Relaxed)
    }

    /// The number of queries so far.
    pub fn queries(&self) -> usize {
        self.state.queries.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Connector for SimulatedDatabase {
    async fn connect(&self) -> Result<Arc<dyn Connection>, DbError> {
        let session = self.state.connects.fetch_add(1, Ordering::Relaxed) + 1;
        tokio::time::sleep(self.state.latency).await;

        let refused = self
            .state
            .failing_connects
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok();
        if refused {
            return Err(DbError::Connect(format!(
                "connection #{session} refused"
            )));
        }

        Ok(Arc::new(SimulatedConnection {
            state: Arc::clone(&self.state),
            session,
        }))
    }
}

struct SimulatedConnection {
    state: Arc<SimulatedState>,
    session: usize,
}

#[async_trait]
impl Connection for SimulatedConnection {
    async fn get_record(&self, id: &str) -> Result<Record, DbError> {
        self.state.queries.fetch_add(1, Ordering::Relaxed);
        if id.is_empty() {
            return Err(DbError::NotFound(id.to_owned()));
        }

        Ok(Record {
            id: id.to_owned(),
            payload: format!("record {id} via connection #{}", self.session),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connects_lazily() {
        let database = SimulatedDatabase::new(Duration::from_millis(10));
        let client = DbClient::new(database.clone(), CacheConfig::named("db"));

        assert!(!client.is_connected());
        assert_eq!(database.connects(), 0);

        let record = client.get_record("a").await.unwrap();
        assert_eq!(record.payload, "record a via connection #1");
        assert!(client.is_connected());
        assert_eq!(database.connects(), 1);
        assert_eq!(database.queries(), 1);
    }

    #[tokio::test]
    async fn test_missing_record() {
        let database = SimulatedDatabase::default();
        let client = DbClient::new(database.clone(), CacheConfig::named("db"));

        assert_eq!(
            client.get_record("").await,
            Err(DbError::NotFound(String::new()))
        );
        // a failing query does not drop the connection
        assert!(client.is_connected());
        assert!(client.get_record("b").await.is_ok());
        assert_eq!(database.connects(), 1);
    }
}
