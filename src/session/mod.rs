//! Access session model and its state machine.
//!
//! `pending -> active -> {expired, terminated}`; a pending session may also be
//! abandoned (`pending -> terminated`). `expired` and `terminated` are terminal.
//! Every edge is a [`Transition`] value, and [`Transition::apply`] is the only
//! place that decides whether an edge is legal.

pub mod manager;

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AccessError;
use crate::mac::MacAddress;

pub use manager::{AccessSessionManager, Activation, Credentials, SessionRef, StatusReport};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        SessionId(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = AccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(SessionId)
            .map_err(|_| AccessError::session_not_found(s))
    }
}

// ---------------------------------------------------------------------------
// Status + transitions
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Active,
    Expired,
    Terminated,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Active => "active",
            SessionStatus::Expired => "expired",
            SessionStatus::Terminated => "terminated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Expired | SessionStatus::Terminated)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SessionStatus::Pending),
            "active" => Ok(SessionStatus::Active),
            "expired" => Ok(SessionStatus::Expired),
            "terminated" => Ok(SessionStatus::Terminated),
            other => anyhow::bail!("unknown session status '{}'", other),
        }
    }
}

/// One edge of the session state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// `pending -> active`, sets `session_start`.
    Activate,
    /// `active -> expired`, sets `session_end`.
    Expire,
    /// `pending | active -> terminated`, sets `session_end`.
    Terminate,
}

impl Transition {
    pub fn target(self) -> SessionStatus {
        match self {
            Transition::Activate => SessionStatus::Active,
            Transition::Expire => SessionStatus::Expired,
            Transition::Terminate => SessionStatus::Terminated,
        }
    }

    /// Validate this edge from `current`, returning the new status.
    pub fn apply(self, current: SessionStatus) -> Result<SessionStatus, AccessError> {
        use SessionStatus::*;
        let allowed = matches!(
            (self, current),
            (Transition::Activate, Pending)
                | (Transition::Expire, Active)
                | (Transition::Terminate, Pending)
                | (Transition::Terminate, Active)
        );
        if allowed {
            Ok(self.target())
        } else {
            Err(AccessError::invalid_state(format!(
                "cannot move session from {} to {}",
                current,
                self.target()
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Descriptive device metadata supplied by the routing layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceMeta {
    pub device_type: Option<String>,
    pub user_agent: Option<String>,
}

/// One device's access grant lifecycle. Rows are never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub mac_address: MacAddress,
    pub ip_address: Option<IpAddr>,
    pub device_type: Option<String>,
    pub user_agent: Option<String>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub session_start: Option<DateTime<Utc>>,
    pub session_end: Option<DateTime<Utc>>,
    pub data_used_mb: f64,
}

impl Session {
    /// A fresh `pending` session.
    pub fn pending(mac: MacAddress, ip: Option<IpAddr>, meta: DeviceMeta) -> Self {
        Self {
            id: SessionId::new(),
            mac_address: mac,
            ip_address: ip,
            device_type: meta.device_type,
            user_agent: meta.user_agent,
            status: SessionStatus::Pending,
            created_at: Utc::now(),
            session_start: None,
            session_end: None,
            data_used_mb: 0.0,
        }
    }

    /// Seconds of budget left at `now`, or `None` if the session is not active.
    /// Can be zero or negative once the budget is spent.
    pub fn remaining_secs(&self, budget: Duration, now: DateTime<Utc>) -> Option<i64> {
        if self.status != SessionStatus::Active {
            return None;
        }
        let start = self.session_start?;
        Some((budget - (now - start)).num_seconds())
    }

    /// Active and still inside the time budget.
    pub fn is_live(&self, budget: Duration, now: DateTime<Utc>) -> bool {
        self.remaining_secs(budget, now).is_some_and(|r| r > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac() -> MacAddress {
        "aa:bb:cc:dd:ee:ff".parse().unwrap()
    }

    #[test]
    fn test_legal_edges() {
        assert_eq!(Transition::Activate.apply(SessionStatus::Pending).unwrap(), SessionStatus::Active);
        assert_eq!(Transition::Expire.apply(SessionStatus::Active).unwrap(), SessionStatus::Expired);
        assert_eq!(Transition::Terminate.apply(SessionStatus::Active).unwrap(), SessionStatus::Terminated);
        assert_eq!(Transition::Terminate.apply(SessionStatus::Pending).unwrap(), SessionStatus::Terminated);
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for status in [SessionStatus::Expired, SessionStatus::Terminated] {
            for t in [Transition::Activate, Transition::Expire, Transition::Terminate] {
                let err = t.apply(status).unwrap_err();
                assert!(matches!(err, AccessError::InvalidState(_)));
            }
        }
    }

    #[test]
    fn test_illegal_shortcuts() {
        assert!(Transition::Expire.apply(SessionStatus::Pending).is_err());
        assert!(Transition::Activate.apply(SessionStatus::Active).is_err());
    }

    #[test]
    fn test_status_string_roundtrip() {
        for s in [SessionStatus::Pending, SessionStatus::Active, SessionStatus::Expired, SessionStatus::Terminated] {
            assert_eq!(s.as_str().parse::<SessionStatus>().unwrap(), s);
        }
        assert!("open".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn test_remaining_secs() {
        let now = Utc::now();
        let budget = Duration::seconds(900);
        let mut session = Session::pending(mac(), None, DeviceMeta::default());
        assert_eq!(session.remaining_secs(budget, now), None);

        session.status = SessionStatus::Active;
        session.session_start = Some(now - Duration::seconds(100));
        assert_eq!(session.remaining_secs(budget, now), Some(800));
        assert!(session.is_live(budget, now));

        session.session_start = Some(now - Duration::seconds(901));
        assert_eq!(session.remaining_secs(budget, now), Some(-1));
        assert!(!session.is_live(budget, now));
    }

    #[test]
    fn test_session_id_parse() {
        let id = SessionId::new();
        assert_eq!(id.to_string().parse::<SessionId>().unwrap(), id);
        assert!(matches!("not-a-uuid".parse::<SessionId>(), Err(AccessError::NotFound { .. })));
    }
}
