//! Durable session store -- SQLite schema, pool and the store trait.
//!
//! The durable store is the single source of truth for sessions and
//! impressions. Every status change goes through a conditional update keyed
//! on the expected prior status, so two racing writers cannot both win.

pub mod schema;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::ads::{AdImpression, ImpressionId};
use crate::mac::MacAddress;
use crate::session::{Session, SessionId, SessionStatus, Transition};

pub use sqlite::SqliteStore;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Fixed-width UTC timestamp so text comparison in SQL matches time order.
pub(crate) fn to_db_time(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn from_db_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

/// Outcome of [`AccessStore::create_or_reuse_session`].
#[derive(Debug, Clone)]
pub enum Admission {
    /// A live `active` session already exists for the MAC.
    Active(Session),
    /// A recent `pending` session for the MAC was reused.
    Pending(Session),
    /// A new `pending` row was inserted.
    Created(Session),
}

impl Admission {
    pub fn session(&self) -> &Session {
        match self {
            Admission::Active(s) | Admission::Pending(s) | Admission::Created(s) => s,
        }
    }
}

/// Row-level operations the access core needs from the durable store.
#[async_trait]
pub trait AccessStore: Send + Sync {
    /// Atomically: return the MAC's live active session (started after
    /// `active_after`), else its newest pending session created after
    /// `pending_after`, else insert `candidate`.
    async fn create_or_reuse_session(
        &self,
        candidate: Session,
        active_after: DateTime<Utc>,
        pending_after: DateTime<Utc>,
    ) -> Result<Admission>;

    async fn get_session(&self, id: SessionId) -> Result<Option<Session>>;

    /// Every row currently marked `active` for the MAC, live or not.
    async fn active_sessions_for_mac(&self, mac: MacAddress) -> Result<Vec<Session>>;

    /// Apply `transition` only if the row is still in `expected`.
    /// Returns `false` when another writer got there first.
    async fn apply_transition(
        &self,
        id: SessionId,
        expected: SessionStatus,
        transition: Transition,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Active sessions whose `session_start` is at or before `started_before`.
    async fn overdue_sessions(&self, started_before: DateTime<Utc>) -> Result<Vec<Session>>;

    async fn add_data_usage(&self, id: SessionId, megabytes: f64) -> Result<bool>;

    async fn insert_impression(&self, impression: &AdImpression) -> Result<()>;

    async fn get_impression(&self, id: ImpressionId) -> Result<Option<AdImpression>>;

    /// Raise the watched counter; refuses to lower it or touch a completed row.
    async fn record_watch(&self, id: ImpressionId, watched_seconds: u32) -> Result<bool>;

    /// Set `completed` (and the final counter) on a not-yet-completed row.
    async fn mark_completed(&self, id: ImpressionId, watched_seconds: u32) -> Result<bool>;

    async fn recent_ad_ids(&self, mac: MacAddress, since: DateTime<Utc>) -> Result<Vec<String>>;

    async fn purge_impressions_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}
