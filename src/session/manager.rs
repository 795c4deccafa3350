//! Access Session Manager -- owns the session state machine.
//!
//! Writes go to the durable store first, through conditional updates keyed on
//! the expected prior status, and only then to the cache. Decisions that
//! matter (the active-session check, activation, expiry) always read the
//! store.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};
use zeroize::Zeroize;

use super::{DeviceMeta, Session, SessionId, SessionStatus, Transition};
use crate::cache::SessionCache;
use crate::config::SessionConfig;
use crate::error::{AccessError, AccessResult};
use crate::mac::MacAddress;
use crate::radius::NetworkAccessClient;
use crate::storage::{AccessStore, Admission};
use crate::token::TokenSigner;

const PASSWORD_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Returned by `request_access`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRef {
    pub session_id: SessionId,
    pub status: SessionStatus,
    /// `false` when an existing session was handed back.
    pub created: bool,
}

/// RADIUS credentials for one device. The password is wiped on drop.
#[derive(Clone, Serialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    fn generate(mac: MacAddress) -> Self {
        let password = OsRng
            .sample_iter(&Alphanumeric)
            .take(PASSWORD_LEN)
            .map(char::from)
            .collect();
        Self {
            username: mac.username(),
            password,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Drop for Credentials {
    fn drop(&mut self) {
        self.password.zeroize();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Activation {
    pub session_id: SessionId,
    pub credentials: Credentials,
    pub access_token: String,
    pub session_timeout_seconds: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub session_id: SessionId,
    pub mac_address: MacAddress,
    pub status: SessionStatus,
    /// Only for active sessions; never negative.
    pub remaining_seconds: Option<i64>,
    pub session_start: Option<DateTime<Utc>>,
    pub session_end: Option<DateTime<Utc>>,
    pub data_used_mb: f64,
}

// ---------------------------------------------------------------------------
// In-flight activation claims
// ---------------------------------------------------------------------------

/// Sessions with an activation currently talking to the NAS in this process.
/// A second activation of the same session is refused instead of racing the
/// first one's credential upsert.
#[derive(Default)]
struct InFlight(Mutex<HashSet<SessionId>>);

struct Claim<'a> {
    set: &'a InFlight,
    id: SessionId,
}

impl InFlight {
    fn claim(&self, id: SessionId) -> Option<Claim<'_>> {
        let inserted = self
            .0
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id);
        if inserted {
            Some(Claim { set: self, id })
        } else {
            None
        }
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        let mut set = self.set.0.lock().unwrap_or_else(|p| p.into_inner());
        set.remove(&self.id);
    }
}

// ---------------------------------------------------------------------------
// Per-device NAS lock
// ---------------------------------------------------------------------------

/// Serializes NAS traffic per MAC. An activation's provision and grant, and
/// an ending session's revoke, never interleave for the same device, so a
/// slow Disconnect cannot land after a newer grant.
#[derive(Default)]
struct DeviceLocks(Mutex<HashMap<MacAddress, Arc<AsyncMutex<()>>>>);

impl DeviceLocks {
    async fn lock(&self, mac: MacAddress) -> OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.0.lock().unwrap_or_else(|p| p.into_inner());
            // Drop slots nobody holds or waits on.
            map.retain(|_, m| Arc::strong_count(m) > 1);
            map.entry(mac).or_default().clone()
        };
        slot.lock_owned().await
    }
}

// ---------------------------------------------------------------------------
// AccessSessionManager
// ---------------------------------------------------------------------------

pub struct AccessSessionManager {
    store: Arc<dyn AccessStore>,
    cache: Arc<dyn SessionCache>,
    nac: Arc<dyn NetworkAccessClient>,
    signer: TokenSigner,
    policy: SessionConfig,
    activating: InFlight,
    devices: DeviceLocks,
}

impl AccessSessionManager {
    pub fn new(
        store: Arc<dyn AccessStore>,
        cache: Arc<dyn SessionCache>,
        nac: Arc<dyn NetworkAccessClient>,
        signer: TokenSigner,
        policy: SessionConfig,
    ) -> Self {
        Self {
            store,
            cache,
            nac,
            signer,
            policy,
            activating: InFlight::default(),
            devices: DeviceLocks::default(),
        }
    }

    pub fn policy(&self) -> &SessionConfig {
        &self.policy
    }

    fn session_timeout_secs(&self) -> u32 {
        self.policy.time_budget_secs.min(u32::MAX as u64) as u32
    }

    async fn load(&self, id: SessionId) -> AccessResult<Session> {
        self.store
            .get_session(id)
            .await?
            .ok_or_else(|| AccessError::session_not_found(id))
    }

    /// Best effort: a failed refresh drops the entry so readers fall through
    /// to the store instead of seeing a stale status.
    async fn refresh_cache(&self, session: &Session) {
        if let Err(e) = self.cache.set(session, self.policy.cache_ttl()).await {
            warn!(session_id = %session.id, error = %e, "cache refresh failed");
            self.evict_cache(session.id).await;
        }
    }

    async fn evict_cache(&self, id: SessionId) {
        if let Err(e) = self.cache.delete(id).await {
            warn!(session_id = %id, error = %e, "cache delete failed");
        }
    }

    async fn revoke_best_effort(&self, mac: MacAddress, session_id: SessionId) {
        if let Err(e) = self.nac.revoke(mac).await {
            warn!(session_id = %session_id, mac = %mac, error = %format!("{:#}", e), "revoke failed, access server may lag");
        }
    }

    /// Revoke for a session that just left `active`, unless the device has
    /// already been granted again through another session.
    async fn revoke_ended(&self, mac: MacAddress, session_id: SessionId) {
        let _device = self.devices.lock(mac).await;
        match self.store.active_sessions_for_mac(mac).await {
            Ok(active) if active.is_empty() => self.revoke_best_effort(mac, session_id).await,
            Ok(active) => {
                info!(session_id = %session_id, mac = %mac, active_session = %active[0].id, "device active again, skipping revoke");
            }
            // Unknown: revoking could cut off a newer grant, skipping could
            // leave the old one. The NAS Session-Timeout still bounds it.
            Err(e) => warn!(session_id = %session_id, mac = %mac, error = %e, "could not check device before revoke, skipping"),
        }
    }

    fn report(&self, s: &Session, now: DateTime<Utc>) -> StatusReport {
        StatusReport {
            session_id: s.id,
            mac_address: s.mac_address,
            status: s.status,
            remaining_seconds: s.remaining_secs(self.policy.time_budget(), now).map(|r| r.max(0)),
            session_start: s.session_start,
            session_end: s.session_end,
            data_used_mb: s.data_used_mb,
        }
    }

    // -----------------------------------------------------------------------
    // requestAccess
    // -----------------------------------------------------------------------

    /// Hand back the device's live active session, or a recent pending one,
    /// or create a new pending session.
    pub async fn request_access(
        &self,
        mac: MacAddress,
        ip: Option<IpAddr>,
        meta: DeviceMeta,
    ) -> AccessResult<SessionRef> {
        let now = Utc::now();
        let candidate = Session::pending(mac, ip, meta);
        let admission = self
            .store
            .create_or_reuse_session(
                candidate,
                now - self.policy.time_budget(),
                now - self.policy.pending_reuse(),
            )
            .await?;

        let created = matches!(admission, Admission::Created(_));
        match &admission {
            Admission::Active(s) => info!(session_id = %s.id, mac = %mac, "device already has an active session"),
            Admission::Pending(s) => debug!(session_id = %s.id, mac = %mac, "reusing pending session"),
            Admission::Created(s) => info!(session_id = %s.id, mac = %mac, "session created"),
        }

        let session = admission.session();
        if created {
            self.refresh_cache(session).await;
        }
        Ok(SessionRef {
            session_id: session.id,
            status: session.status,
            created,
        })
    }

    // -----------------------------------------------------------------------
    // activate
    // -----------------------------------------------------------------------

    /// Turn a pending session active. All-or-nothing: if provisioning or the
    /// CoA fails, the session stays pending.
    pub async fn activate(
        &self,
        session_id: SessionId,
        completion_token: Option<&str>,
    ) -> AccessResult<Activation> {
        let token = completion_token
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| AccessError::unauthorized("ad completion token required"))?;
        let grant = self.signer.verify_completion(token)?;
        if grant.session_id != session_id {
            return Err(AccessError::unauthorized("completion token belongs to another session"));
        }
        match self.store.get_impression(grant.impression_id).await? {
            Some(imp) if imp.completed && imp.session_id == session_id => {}
            _ => {
                return Err(AccessError::unauthorized(
                    "no completed ad impression for this session",
                ))
            }
        }

        let session = self.load(session_id).await?;
        Transition::Activate.apply(session.status)?;

        let _claim = self
            .activating
            .claim(session_id)
            .ok_or_else(|| AccessError::invalid_state("activation already in progress"))?;

        let mac = session.mac_address;
        let now = Utc::now();
        if self.expire_stale_for_mac(mac, now).await? {
            return Err(AccessError::invalid_state("device already has an active session"));
        }
        let _device = self.devices.lock(mac).await;

        let credentials = Credentials::generate(mac);
        let timeout = self.session_timeout_secs();
        let access_token = self.signer.issue_access(session_id, mac)?;

        if let Err(e) = self
            .nac
            .provision(&credentials.username, &credentials.password, timeout)
            .await
        {
            error!(session_id = %session_id, mac = %mac, error = %format!("{:#}", e), "credential provisioning failed");
            return Err(AccessError::Upstream(e));
        }
        if let Err(e) = self.nac.grant(mac, session.ip_address, timeout).await {
            error!(session_id = %session_id, mac = %mac, error = %format!("{:#}", e), "CoA grant failed, session stays pending");
            return Err(AccessError::Upstream(e));
        }

        let started = Utc::now();
        let applied = self
            .store
            .apply_transition(session_id, SessionStatus::Pending, Transition::Activate, started)
            .await?;
        if !applied {
            return Err(self.activation_lost(&session).await);
        }

        let mut active = session;
        active.status = SessionStatus::Active;
        active.session_start = Some(started);
        self.refresh_cache(&active).await;
        info!(session_id = %session_id, mac = %mac, timeout_secs = timeout, "session activated");

        Ok(Activation {
            session_id,
            credentials,
            access_token,
            session_timeout_seconds: timeout,
        })
    }

    /// The conditional update found the row changed after the NAS already
    /// admitted the device. Undo the grant unless the device is legitimately
    /// active through some session.
    async fn activation_lost(&self, session: &Session) -> AccessError {
        let current = match self.store.get_session(session.id).await {
            Ok(Some(s)) => s,
            Ok(None) => return AccessError::session_not_found(session.id),
            Err(e) => return AccessError::Upstream(e),
        };
        if current.status == SessionStatus::Active {
            return AccessError::invalid_state("session already active");
        }

        match self.store.active_sessions_for_mac(session.mac_address).await {
            Ok(others) if others.is_empty() => {
                self.revoke_best_effort(session.mac_address, session.id).await
            }
            Ok(_) => {}
            Err(e) => warn!(session_id = %session.id, error = %e, "could not check other sessions after lost activation"),
        }

        if current.status == SessionStatus::Pending {
            AccessError::invalid_state("device already has an active session")
        } else {
            AccessError::invalid_state(format!("session is no longer pending ({})", current.status))
        }
    }

    /// Expire `active` rows for the MAC whose budget has run out but which the
    /// sweeper has not reached yet. Returns `true` if a live one remains.
    async fn expire_stale_for_mac(&self, mac: MacAddress, now: DateTime<Utc>) -> AccessResult<bool> {
        let budget = self.policy.time_budget();
        let mut live = false;
        for active in self.store.active_sessions_for_mac(mac).await? {
            if active.is_live(budget, now) {
                live = true;
            } else {
                self.expire(active.id).await?;
            }
        }
        Ok(live)
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    /// Status and remaining budget. An active session past its budget is
    /// expired on the spot before answering.
    ///
    /// The store answers; another process (the CLI, a second node) may have
    /// ended the session behind this process's cache. The cached entry is
    /// only used when the store cannot be read, and is repaired otherwise.
    pub async fn check_status(&self, session_id: SessionId) -> AccessResult<StatusReport> {
        let now = Utc::now();
        let budget = self.policy.time_budget();

        let mut session = match self.store.get_session(session_id).await {
            Ok(Some(s)) => s,
            Ok(None) => {
                self.evict_cache(session_id).await;
                return Err(AccessError::session_not_found(session_id));
            }
            Err(e) => return self.status_from_cache(session_id, now, e).await,
        };
        if session.status == SessionStatus::Active && !session.is_live(budget, now) {
            self.expire(session_id).await?;
            session = self.load(session_id).await?;
        }

        match self.cache.get(session_id).await {
            Ok(Some(cached)) if cached.status == session.status => {}
            Ok(None) if session.status.is_terminal() => {}
            _ if session.status.is_terminal() => self.evict_cache(session_id).await,
            _ => self.refresh_cache(&session).await,
        }
        Ok(self.report(&session, now))
    }

    /// Degraded answer while the store is unreachable.
    async fn status_from_cache(
        &self,
        session_id: SessionId,
        now: DateTime<Utc>,
        store_err: anyhow::Error,
    ) -> AccessResult<StatusReport> {
        match self.cache.get(session_id).await {
            Ok(Some(s)) if s.status != SessionStatus::Active || s.is_live(self.policy.time_budget(), now) => {
                warn!(session_id = %session_id, error = %format!("{:#}", store_err), "store read failed, answering from cache");
                Ok(self.report(&s, now))
            }
            _ => Err(AccessError::Upstream(store_err)),
        }
    }

    /// `check_status` for the session bound into a signed access token.
    pub async fn check_status_by_token(&self, access_token: &str) -> AccessResult<StatusReport> {
        let claims = self.signer.verify_access(access_token)?;
        let session_id: SessionId = claims
            .sid
            .parse()
            .map_err(|_| AccessError::unauthorized("access token names no valid session"))?;
        let report = self.check_status(session_id).await?;
        if report.mac_address.to_string() != claims.mac {
            return Err(AccessError::unauthorized("access token does not match session"));
        }
        Ok(report)
    }

    /// Session id from a verified access token.
    pub fn session_for_token(&self, access_token: &str) -> AccessResult<SessionId> {
        let claims = self.signer.verify_access(access_token)?;
        claims
            .sid
            .parse()
            .map_err(|_| AccessError::unauthorized("access token names no valid session"))
    }

    // -----------------------------------------------------------------------
    // Termination
    // -----------------------------------------------------------------------

    /// User- or admin-initiated end of a pending or active session.
    ///
    /// Keyed on the status it read: if an activation or expiry changes the
    /// row first, this call loses with `InvalidState` and the caller re-reads.
    pub async fn disconnect_by_request(&self, session_id: SessionId) -> AccessResult<()> {
        let session = self.load(session_id).await?;
        Transition::Terminate.apply(session.status)?;

        let applied = self
            .store
            .apply_transition(session_id, session.status, Transition::Terminate, Utc::now())
            .await?;
        if !applied {
            debug!(session_id = %session_id, from = %session.status, "session changed during disconnect");
            return Err(AccessError::invalid_state("session changed concurrently, re-read and retry"));
        }

        self.evict_cache(session_id).await;
        if session.status == SessionStatus::Active {
            self.revoke_ended(session.mac_address, session_id).await;
        }
        info!(session_id = %session_id, mac = %session.mac_address, from = %session.status, "session terminated");
        Ok(())
    }

    /// `active -> expired`. Idempotent: returns `Ok(false)` when the session
    /// is already terminal or another caller expired it first, and only the
    /// caller that wins the update sends the Disconnect.
    pub async fn expire(&self, session_id: SessionId) -> AccessResult<bool> {
        let session = self.load(session_id).await?;
        if session.status.is_terminal() {
            return Ok(false);
        }
        Transition::Expire.apply(session.status)?;

        let applied = self
            .store
            .apply_transition(session_id, SessionStatus::Active, Transition::Expire, Utc::now())
            .await?;
        if !applied {
            debug!(session_id = %session_id, "session already left active state");
            return Ok(false);
        }

        self.evict_cache(session_id).await;
        self.revoke_ended(session.mac_address, session_id).await;
        info!(session_id = %session_id, mac = %session.mac_address, "session expired");
        Ok(true)
    }

    /// Active sessions whose budget ran out at or before `now`.
    pub async fn overdue_sessions(&self, now: DateTime<Utc>) -> AccessResult<Vec<Session>> {
        Ok(self
            .store
            .overdue_sessions(now - self.policy.time_budget())
            .await?)
    }

    // -----------------------------------------------------------------------
    // Accounting / housekeeping
    // -----------------------------------------------------------------------

    pub async fn record_data_usage(&self, session_id: SessionId, megabytes: f64) -> AccessResult<()> {
        if !megabytes.is_finite() || megabytes < 0.0 {
            return Err(AccessError::invalid_state("data usage must be a non-negative amount"));
        }
        if !self.store.add_data_usage(session_id, megabytes).await? {
            return Err(AccessError::session_not_found(session_id));
        }
        // Keep the cached projection from reporting a stale counter.
        self.evict_cache(session_id).await;
        Ok(())
    }

    /// Delete impressions older than `older_than_days`. Returns rows removed.
    pub async fn purge_impressions(&self, older_than_days: u32) -> AccessResult<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(older_than_days));
        let removed = self.store.purge_impressions_before(cutoff).await?;
        info!(removed, older_than_days, "purged old ad impressions");
        Ok(removed)
    }
}
