//! `AccessStore` on top of the r2d2 SQLite pool.
//!
//! rusqlite is blocking, so every call hops onto the blocking pool.

use std::net::IpAddr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use super::{from_db_time, to_db_time, AccessStore, Admission, Pool};
use crate::ads::{AdImpression, ImpressionId};
use crate::mac::MacAddress;
use crate::session::{Session, SessionId, SessionStatus, Transition};

const SESSION_COLUMNS: &str = "id, mac_address, ip_address, device_type, user_agent, status, \
     created_at, session_start, session_end, data_used_mb";

const IMPRESSION_COLUMNS: &str = "id, session_id, ad_id, mac_address, impression_time, \
     watched_duration_seconds, completed, ad_duration_seconds";

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn with_conn<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<T> {
            let mut conn = pool.get().context("failed to check out SQLite connection")?;
            f(&mut conn)
        })
        .await
        .with_context(|| format!("{} task panicked", op))?
        .with_context(|| format!("{} failed", op))
    }

    /// Move a session's start time into the past. Test-only clock control.
    #[cfg(test)]
    pub(crate) fn backdate_session_start(&self, id: SessionId, secs: i64) -> Result<()> {
        let conn = self.pool.get()?;
        let start = to_db_time(Utc::now() - chrono::Duration::seconds(secs));
        conn.execute(
            "UPDATE user_sessions SET session_start = ?2 WHERE id = ?1",
            params![id.to_string(), start],
        )?;
        Ok(())
    }
}

fn conversion_err<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
}

fn parse_time(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    from_db_time(s).map_err(|e| conversion_err(idx, e.to_string()))
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    let id: String = row.get(0)?;
    let mac: String = row.get(1)?;
    let ip: Option<String> = row.get(2)?;
    let status: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    let session_start: Option<String> = row.get(7)?;
    let session_end: Option<String> = row.get(8)?;

    Ok(Session {
        id: id.parse().map_err(|e: crate::error::AccessError| conversion_err(0, e.to_string()))?,
        mac_address: mac
            .parse::<MacAddress>()
            .map_err(|e| conversion_err(1, e.to_string()))?,
        ip_address: ip
            .map(|s| s.parse::<IpAddr>())
            .transpose()
            .map_err(|e| conversion_err(2, e))?,
        device_type: row.get(3)?,
        user_agent: row.get(4)?,
        status: status
            .parse::<SessionStatus>()
            .map_err(|e| conversion_err(5, e.to_string()))?,
        created_at: parse_time(6, &created_at)?,
        session_start: session_start.as_deref().map(|s| parse_time(7, s)).transpose()?,
        session_end: session_end.as_deref().map(|s| parse_time(8, s)).transpose()?,
        data_used_mb: row.get(9)?,
    })
}

fn impression_from_row(row: &Row<'_>) -> rusqlite::Result<AdImpression> {
    let id: String = row.get(0)?;
    let session_id: String = row.get(1)?;
    let mac: String = row.get(3)?;
    let impression_time: String = row.get(4)?;
    let watched: i64 = row.get(5)?;
    let completed: i64 = row.get(6)?;
    let ad_duration: i64 = row.get(7)?;

    Ok(AdImpression {
        id: id.parse().map_err(|e: crate::error::AccessError| conversion_err(0, e.to_string()))?,
        session_id: session_id
            .parse()
            .map_err(|e: crate::error::AccessError| conversion_err(1, e.to_string()))?,
        ad_id: row.get(2)?,
        ad_duration_seconds: u32::try_from(ad_duration).map_err(|e| conversion_err(7, e))?,
        mac_address: mac
            .parse::<MacAddress>()
            .map_err(|e| conversion_err(3, e.to_string()))?,
        impression_time: parse_time(4, &impression_time)?,
        watched_duration_seconds: u32::try_from(watched).map_err(|e| conversion_err(5, e))?,
        completed: completed != 0,
    })
}

fn insert_session(conn: &Connection, s: &Session) -> Result<()> {
    conn.execute(
        "INSERT INTO user_sessions
            (id, mac_address, ip_address, device_type, user_agent, status,
             created_at, session_start, session_end, data_used_mb)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            s.id.to_string(),
            s.mac_address.to_string(),
            s.ip_address.map(|ip| ip.to_string()),
            s.device_type,
            s.user_agent,
            s.status.as_str(),
            to_db_time(s.created_at),
            s.session_start.map(to_db_time),
            s.session_end.map(to_db_time),
            s.data_used_mb,
        ],
    )
    .context("failed to insert session")?;
    Ok(())
}

#[async_trait]
impl AccessStore for SqliteStore {
    async fn create_or_reuse_session(
        &self,
        candidate: Session,
        active_after: DateTime<Utc>,
        pending_after: DateTime<Utc>,
    ) -> Result<Admission> {
        self.with_conn("create_or_reuse_session", move |conn| {
            // IMMEDIATE takes the write lock up front so two requests for the
            // same MAC serialize on the lookup, not just on the insert.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mac = candidate.mac_address.to_string();

            let active = tx
                .query_row(
                    &format!(
                        "SELECT {} FROM user_sessions
                         WHERE mac_address = ?1 AND status = 'active' AND session_start > ?2
                         ORDER BY session_start DESC LIMIT 1",
                        SESSION_COLUMNS
                    ),
                    params![mac, to_db_time(active_after)],
                    session_from_row,
                )
                .optional()?;
            if let Some(session) = active {
                return Ok(Admission::Active(session));
            }

            let pending = tx
                .query_row(
                    &format!(
                        "SELECT {} FROM user_sessions
                         WHERE mac_address = ?1 AND status = 'pending' AND created_at > ?2
                         ORDER BY created_at DESC LIMIT 1",
                        SESSION_COLUMNS
                    ),
                    params![mac, to_db_time(pending_after)],
                    session_from_row,
                )
                .optional()?;
            if let Some(session) = pending {
                return Ok(Admission::Pending(session));
            }

            insert_session(&tx, &candidate)?;
            tx.commit()?;
            Ok(Admission::Created(candidate))
        })
        .await
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<Session>> {
        self.with_conn("get_session", move |conn| {
            let session = conn
                .query_row(
                    &format!("SELECT {} FROM user_sessions WHERE id = ?1", SESSION_COLUMNS),
                    params![id.to_string()],
                    session_from_row,
                )
                .optional()?;
            Ok(session)
        })
        .await
    }

    async fn active_sessions_for_mac(&self, mac: MacAddress) -> Result<Vec<Session>> {
        self.with_conn("active_sessions_for_mac", move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM user_sessions WHERE mac_address = ?1 AND status = 'active'",
                SESSION_COLUMNS
            ))?;
            let rows = stmt.query_map(params![mac.to_string()], session_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn apply_transition(
        &self,
        id: SessionId,
        expected: SessionStatus,
        transition: Transition,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        self.with_conn("apply_transition", move |conn| {
            let target = transition.target().as_str();
            let changed = match transition {
                Transition::Activate => conn.execute(
                    "UPDATE user_sessions SET status = ?3, session_start = ?4
                     WHERE id = ?1 AND status = ?2
                       AND NOT EXISTS (
                           SELECT 1 FROM user_sessions other
                           WHERE other.mac_address = user_sessions.mac_address
                             AND other.status = 'active'
                             AND other.id != user_sessions.id)",
                    params![id.to_string(), expected.as_str(), target, to_db_time(at)],
                )?,
                Transition::Expire | Transition::Terminate => conn.execute(
                    "UPDATE user_sessions SET status = ?3, session_end = ?4
                     WHERE id = ?1 AND status = ?2",
                    params![id.to_string(), expected.as_str(), target, to_db_time(at)],
                )?,
            };
            Ok(changed == 1)
        })
        .await
    }

    async fn overdue_sessions(&self, started_before: DateTime<Utc>) -> Result<Vec<Session>> {
        self.with_conn("overdue_sessions", move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM user_sessions
                 WHERE status = 'active' AND session_start <= ?1
                 ORDER BY session_start ASC",
                SESSION_COLUMNS
            ))?;
            let rows = stmt.query_map(params![to_db_time(started_before)], session_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn add_data_usage(&self, id: SessionId, megabytes: f64) -> Result<bool> {
        self.with_conn("add_data_usage", move |conn| {
            let changed = conn.execute(
                "UPDATE user_sessions SET data_used_mb = data_used_mb + ?2 WHERE id = ?1",
                params![id.to_string(), megabytes],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn insert_impression(&self, impression: &AdImpression) -> Result<()> {
        let imp = impression.clone();
        self.with_conn("insert_impression", move |conn| {
            conn.execute(
                "INSERT INTO ad_impressions
                    (id, session_id, ad_id, mac_address, impression_time,
                     watched_duration_seconds, completed, ad_duration_seconds)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    imp.id.to_string(),
                    imp.session_id.to_string(),
                    imp.ad_id,
                    imp.mac_address.to_string(),
                    to_db_time(imp.impression_time),
                    imp.watched_duration_seconds,
                    imp.completed as i64,
                    imp.ad_duration_seconds,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_impression(&self, id: ImpressionId) -> Result<Option<AdImpression>> {
        self.with_conn("get_impression", move |conn| {
            let imp = conn
                .query_row(
                    &format!("SELECT {} FROM ad_impressions WHERE id = ?1", IMPRESSION_COLUMNS),
                    params![id.to_string()],
                    impression_from_row,
                )
                .optional()?;
            Ok(imp)
        })
        .await
    }

    async fn record_watch(&self, id: ImpressionId, watched_seconds: u32) -> Result<bool> {
        self.with_conn("record_watch", move |conn| {
            let changed = conn.execute(
                "UPDATE ad_impressions SET watched_duration_seconds = ?2
                 WHERE id = ?1 AND completed = 0 AND watched_duration_seconds <= ?2",
                params![id.to_string(), watched_seconds],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn mark_completed(&self, id: ImpressionId, watched_seconds: u32) -> Result<bool> {
        self.with_conn("mark_completed", move |conn| {
            let changed = conn.execute(
                "UPDATE ad_impressions SET watched_duration_seconds = ?2, completed = 1
                 WHERE id = ?1 AND completed = 0 AND watched_duration_seconds <= ?2",
                params![id.to_string(), watched_seconds],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn recent_ad_ids(&self, mac: MacAddress, since: DateTime<Utc>) -> Result<Vec<String>> {
        self.with_conn("recent_ad_ids", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT ad_id, MAX(impression_time) AS last_seen FROM ad_impressions
                 WHERE mac_address = ?1 AND impression_time > ?2
                 GROUP BY ad_id ORDER BY last_seen DESC LIMIT 10",
            )?;
            let rows = stmt.query_map(params![mac.to_string(), to_db_time(since)], |row| {
                row.get::<_, String>(0)
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn purge_impressions_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.with_conn("purge_impressions_before", move |conn| {
            let removed = conn.execute(
                "DELETE FROM ad_impressions WHERE impression_time < ?1",
                params![to_db_time(cutoff)],
            )?;
            Ok(removed)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::DeviceMeta;
    use chrono::Duration;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, SqliteStore) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("portal.db");
        let pool = crate::storage::open_pool(path.to_str().unwrap()).unwrap();
        (dir, SqliteStore::new(pool))
    }

    fn mac(s: &str) -> MacAddress {
        s.parse().unwrap()
    }

    fn pending(m: &str) -> Session {
        Session::pending(mac(m), Some("10.0.0.7".parse().unwrap()), DeviceMeta::default())
    }

    fn windows() -> (DateTime<Utc>, DateTime<Utc>) {
        let now = Utc::now();
        (now - Duration::seconds(900), now - Duration::seconds(300))
    }

    #[tokio::test]
    async fn test_session_roundtrips_through_sqlite() {
        let (_dir, store) = open_store();
        let (a, p) = windows();
        let created = store.create_or_reuse_session(pending("aa:bb:cc:dd:ee:01"), a, p).await.unwrap();
        assert!(matches!(created, Admission::Created(_)));

        let loaded = store.get_session(created.session().id).await.unwrap().unwrap();
        assert_eq!(loaded.mac_address, mac("aa:bb:cc:dd:ee:01"));
        assert_eq!(loaded.status, SessionStatus::Pending);
        assert_eq!(loaded.ip_address, Some("10.0.0.7".parse().unwrap()));
        assert!(loaded.session_start.is_none());
    }

    #[tokio::test]
    async fn test_pending_session_is_reused() {
        let (_dir, store) = open_store();
        let (a, p) = windows();
        let first = store.create_or_reuse_session(pending("aa:bb:cc:dd:ee:02"), a, p).await.unwrap();
        let second = store.create_or_reuse_session(pending("aa:bb:cc:dd:ee:02"), a, p).await.unwrap();
        assert!(matches!(second, Admission::Pending(_)));
        assert_eq!(first.session().id, second.session().id);
    }

    #[tokio::test]
    async fn test_conditional_transition_has_one_winner() {
        let (_dir, store) = open_store();
        let (a, p) = windows();
        let id = store.create_or_reuse_session(pending("aa:bb:cc:dd:ee:03"), a, p).await.unwrap().session().id;

        let now = Utc::now();
        assert!(store.apply_transition(id, SessionStatus::Pending, Transition::Activate, now).await.unwrap());
        assert!(!store.apply_transition(id, SessionStatus::Pending, Transition::Activate, now).await.unwrap());

        let s = store.get_session(id).await.unwrap().unwrap();
        assert_eq!(s.status, SessionStatus::Active);
        assert!(s.session_start.is_some());
    }

    #[tokio::test]
    async fn test_activation_blocked_by_other_active_row() {
        let (_dir, store) = open_store();
        let (a, p) = windows();
        let first = store.create_or_reuse_session(pending("aa:bb:cc:dd:ee:04"), a, p).await.unwrap().session().id;
        // Force a second pending row by using an already-elapsed reuse window.
        let second = store
            .create_or_reuse_session(pending("aa:bb:cc:dd:ee:04"), a, Utc::now() + Duration::seconds(1))
            .await
            .unwrap()
            .session()
            .id;
        assert_ne!(first, second);

        let now = Utc::now();
        assert!(store.apply_transition(first, SessionStatus::Pending, Transition::Activate, now).await.unwrap());
        assert!(!store.apply_transition(second, SessionStatus::Pending, Transition::Activate, now).await.unwrap());
        assert_eq!(store.active_sessions_for_mac(mac("aa:bb:cc:dd:ee:04")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_overdue_sessions_filter() {
        let (_dir, store) = open_store();
        let (a, p) = windows();
        let id = store.create_or_reuse_session(pending("aa:bb:cc:dd:ee:05"), a, p).await.unwrap().session().id;
        store.apply_transition(id, SessionStatus::Pending, Transition::Activate, Utc::now()).await.unwrap();

        let cutoff = Utc::now() - Duration::seconds(900);
        assert!(store.overdue_sessions(cutoff).await.unwrap().is_empty());

        store.backdate_session_start(id, 901).unwrap();
        let overdue = store.overdue_sessions(cutoff).await.unwrap();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].id, id);
    }

    #[tokio::test]
    async fn test_watch_counter_is_monotonic_and_completion_sticks() {
        let (_dir, store) = open_store();
        let (a, p) = windows();
        let session = store.create_or_reuse_session(pending("aa:bb:cc:dd:ee:06"), a, p).await.unwrap();
        let imp = AdImpression::new(session.session().id, "ad-1", 30, mac("aa:bb:cc:dd:ee:06"));
        store.insert_impression(&imp).await.unwrap();

        assert!(store.record_watch(imp.id, 10).await.unwrap());
        assert!(!store.record_watch(imp.id, 5).await.unwrap());
        assert!(store.mark_completed(imp.id, 25).await.unwrap());
        assert!(!store.mark_completed(imp.id, 30).await.unwrap());
        assert!(!store.record_watch(imp.id, 30).await.unwrap());

        let loaded = store.get_impression(imp.id).await.unwrap().unwrap();
        assert_eq!(loaded.watched_duration_seconds, 25);
        assert!(loaded.completed);
    }

    #[tokio::test]
    async fn test_impression_requires_existing_session() {
        let (_dir, store) = open_store();
        let imp = AdImpression::new(SessionId::new(), "ad-1", 30, mac("aa:bb:cc:dd:ee:07"));
        assert!(store.insert_impression(&imp).await.is_err());
    }

    #[tokio::test]
    async fn test_recent_ads_and_purge() {
        let (_dir, store) = open_store();
        let (a, p) = windows();
        let m = mac("aa:bb:cc:dd:ee:08");
        let sid = store.create_or_reuse_session(pending("aa:bb:cc:dd:ee:08"), a, p).await.unwrap().session().id;

        let mut old = AdImpression::new(sid, "ad-old", 30, m);
        old.impression_time = Utc::now() - Duration::days(100);
        store.insert_impression(&old).await.unwrap();
        store.insert_impression(&AdImpression::new(sid, "ad-new", 30, m)).await.unwrap();

        let recent = store.recent_ad_ids(m, Utc::now() - Duration::hours(24)).await.unwrap();
        assert_eq!(recent, vec!["ad-new".to_string()]);

        let removed = store.purge_impressions_before(Utc::now() - Duration::days(90)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_impression(old.id).await.unwrap().is_none());
    }
}
