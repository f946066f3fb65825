//! Lazily established, shared database handle.
//!
//! [`ConnectionManager`] owns the one [`Database`] the process talks to. It
//! connects on first use, and every caller that arrives while that first
//! attempt is still running subscribes to the same in-flight future instead
//! of dialing again. All of them see the same handle or the same
//! [`ConnectionFailure`].
//!
//! A failed attempt caches nothing; the next caller starts a fresh one. The
//! manager never retries by itself.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use parking_lot::Mutex;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{error::ConnectionFailure, Database, DatabaseConfig, DB_NAME, DB_SYSTEM};

/// Strategy used to open a new handle.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Credential-free description of the target, used in logs.
    fn target(&self) -> String;

    async fn connect(&self) -> Result<Database, ConnectionFailure>;
}

/// Opens a SQLite pool from a [`DatabaseConfig`].
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    config: DatabaseConfig,
}

impl SqliteConnector {
    pub fn new(config: DatabaseConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for SqliteConnector {
    fn target(&self) -> String {
        self.config.redacted_url()
    }

    async fn connect(&self) -> Result<Database, ConnectionFailure> {
        Database::connect(&self.config).await
    }
}

type ConnectAttempt = Shared<BoxFuture<'static, Result<Database, ConnectionFailure>>>;

enum Slot {
    Empty,
    Connecting { attempt: u64, future: ConnectAttempt },
    Ready(Database),
}

enum Reservation {
    Ready(Database),
    Pending { attempt: u64, future: ConnectAttempt },
}

/// Owner of the process-wide database handle.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    slot: Mutex<Slot>,
    attempts: AtomicU64,
}

impl ConnectionManager {
    pub fn new(connector: impl Connector) -> Self {
        Self {
            connector: Arc::new(connector),
            slot: Mutex::new(Slot::Empty),
            attempts: AtomicU64::new(0),
        }
    }

    pub fn sqlite(config: DatabaseConfig) -> Self {
        Self::new(SqliteConnector::new(config))
    }

    /// Returns the cached handle, connecting first if there is none.
    pub async fn get_handle(&self) -> Result<Database, ConnectionFailure> {
        let span = info_span!("get_database_handle", db.system = DB_SYSTEM, db.name = DB_NAME);
        async {
            match self.reserve(false).0 {
                Reservation::Ready(db) => {
                    debug!("using existing database handle");
                    Ok(db)
                }
                Reservation::Pending { attempt, future } => self.await_attempt(attempt, future).await,
            }
        }
        .instrument(span)
        .await
    }

    /// Opens a new handle and caches it. A cached handle is closed first.
    ///
    /// Joins the attempt already in flight if there is one.
    pub async fn connect(&self) -> Result<Database, ConnectionFailure> {
        let (reservation, replaced) = self.reserve(true);
        if let Some(previous) = replaced {
            info!(db.url = %self.connector.target(), "closing replaced database handle");
            previous.close().await;
        }
        match reservation {
            Reservation::Ready(db) => Ok(db),
            Reservation::Pending { attempt, future } => self.await_attempt(attempt, future).await,
        }
    }

    /// Drops the cached handle and closes its pool. The next
    /// [`get_handle`](Self::get_handle) reconnects. An attempt still in flight
    /// is abandoned: its handle is closed as soon as it arrives and its
    /// waiters get a [`ConnectionFailure`].
    pub async fn shutdown(&self) {
        let previous = std::mem::replace(&mut *self.slot.lock(), Slot::Empty);
        if let Slot::Ready(db) = previous {
            info!(db.url = %self.connector.target(), "closing database handle");
            db.close().await;
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.slot.lock(), Slot::Ready(_))
    }

    /// Number of connection attempts started so far.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Joins the attempt in flight or starts a new one. With `replace_ready`
    /// a cached handle is taken out of the slot and handed back for closing.
    fn reserve(&self, replace_ready: bool) -> (Reservation, Option<Database>) {
        let mut slot = self.slot.lock();
        match &*slot {
            Slot::Ready(db) if !replace_ready => return (Reservation::Ready(db.clone()), None),
            Slot::Connecting { attempt, future } => {
                let pending = Reservation::Pending {
                    attempt: *attempt,
                    future: future.clone(),
                };
                return (pending, None);
            }
            Slot::Ready(_) | Slot::Empty => {}
        }

        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let future = self.start_attempt(attempt);
        let previous = std::mem::replace(
            &mut *slot,
            Slot::Connecting {
                attempt,
                future: future.clone(),
            },
        );
        let replaced = match previous {
            Slot::Ready(db) => Some(db),
            _ => None,
        };
        (Reservation::Pending { attempt, future }, replaced)
    }

    fn start_attempt(&self, attempt: u64) -> ConnectAttempt {
        let connector = Arc::clone(&self.connector);
        let target = connector.target();
        let span = info_span!(
            "connect_database",
            attempt,
            db.url = %target,
            db.system = DB_SYSTEM,
            db.name = DB_NAME
        );

        async move {
            info!("connecting to database");
            match connector.connect().await {
                Ok(db) => {
                    info!("connected to database");
                    Ok(db)
                }
                Err(err) => {
                    error!(error = %err, "failed to connect to database");
                    Err(err)
                }
            }
        }
        .instrument(span)
        .boxed()
        .shared()
    }

    async fn await_attempt(&self, attempt: u64, future: ConnectAttempt) -> Result<Database, ConnectionFailure> {
        let outcome = future.await;
        match self.settle(attempt, &outcome) {
            Some(orphan) => {
                warn!(attempt, "connection attempt finished after shutdown; closing its handle");
                orphan.close().await;
                Err(ConnectionFailure::new(
                    self.connector.target(),
                    "connection manager was shut down while connecting",
                ))
            }
            None => outcome,
        }
    }

    /// Publishes the outcome of `attempt` if it still owns the slot.
    ///
    /// An attempt loses the slot when `shutdown` runs while it is in flight.
    /// A handle it produced anyway belongs to nobody and is returned so the
    /// caller can close it.
    fn settle(&self, attempt: u64, outcome: &Result<Database, ConnectionFailure>) -> Option<Database> {
        let mut slot = self.slot.lock();
        let current = matches!(&*slot, Slot::Connecting { attempt: pending, .. } if *pending == attempt);
        if !current {
            return outcome.as_ref().ok().cloned();
        }

        *slot = match outcome {
            Ok(db) => Slot::Ready(db.clone()),
            Err(_) => Slot::Empty,
        };
        None
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("target", &self.connector.target())
            .field("connected", &self.is_connected())
            .field("attempts", &self.attempts())
            .finish()
    }
}
