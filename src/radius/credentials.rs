//! FreeRADIUS-style credential tables (`radcheck` / `radreply`).
//!
//! The RADIUS server reads these rows to authenticate the device; the portal
//! only ever writes them. Writes are upserts keyed on `(username, attribute)`
//! so provisioning the same user twice leaves exactly one row per attribute.

use anyhow::{Context, Result};
use rusqlite::params;
use zeroize::Zeroizing;

use crate::storage::Pool;

#[derive(Clone)]
pub struct CredentialStore {
    pool: Pool,
}

impl CredentialStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Insert or refresh the user's password and reply attributes.
    pub async fn upsert(
        &self,
        username: &str,
        password: &str,
        session_timeout_secs: u32,
        idle_timeout_secs: u32,
    ) -> Result<()> {
        let pool = self.pool.clone();
        let username = username.to_string();
        let password = Zeroizing::new(password.to_string());

        let result = tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = pool.get()?;
            let tx = conn.transaction()?;
            let check = [
                ("Cleartext-Password", password.as_str()),
                ("Simultaneous-Use", "1"),
            ];
            for (attribute, value) in check {
                tx.execute(
                    "INSERT INTO radcheck (username, attribute, op, value)
                     VALUES (?1, ?2, ':=', ?3)
                     ON CONFLICT(username, attribute) DO UPDATE SET op = excluded.op, value = excluded.value",
                    params![username, attribute, value],
                )?;
            }
            let reply = [
                ("Session-Timeout", session_timeout_secs.to_string()),
                ("Idle-Timeout", idle_timeout_secs.to_string()),
            ];
            for (attribute, value) in reply {
                tx.execute(
                    "INSERT INTO radreply (username, attribute, op, value)
                     VALUES (?1, ?2, ':=', ?3)
                     ON CONFLICT(username, attribute) DO UPDATE SET op = excluded.op, value = excluded.value",
                    params![username, attribute, value],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
        .context("credential upsert task panicked")?;

        result.context("failed to provision RADIUS credentials")
    }

    /// Delete every check and reply row for the user. Returns rows removed.
    pub async fn remove(&self, username: &str) -> Result<usize> {
        let pool = self.pool.clone();
        let username = username.to_string();
        let result = tokio::task::spawn_blocking(move || -> Result<usize> {
            let mut conn = pool.get()?;
            let tx = conn.transaction()?;
            let mut removed = tx.execute("DELETE FROM radcheck WHERE username = ?1", params![username])?;
            removed += tx.execute("DELETE FROM radreply WHERE username = ?1", params![username])?;
            tx.commit()?;
            Ok(removed)
        })
        .await
        .context("credential removal task panicked")?;

        result.context("failed to remove RADIUS credentials")
    }
}
