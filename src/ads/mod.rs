//! Gating ads: impression records, the ad-selection collaborator, and the gate
//! that decides whether a watch event unlocks activation.

pub mod gate;
pub mod selector;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AccessError;
use crate::mac::MacAddress;
use crate::session::SessionId;

pub use gate::{AdGate, Completion, DispatchedAd};
pub use selector::{CatalogAdSelector, FallbackAdSelector, HttpAdSelector};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImpressionId(Uuid);

impl ImpressionId {
    pub fn new() -> Self {
        ImpressionId(Uuid::new_v4())
    }
}

impl Default for ImpressionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ImpressionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ImpressionId {
    type Err = AccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(ImpressionId)
            .map_err(|_| AccessError::impression_not_found(s))
    }
}

/// One ad-viewing event tied to a session.
///
/// `watched_duration_seconds` only grows and `completed` never flips back;
/// the store's conditional updates enforce both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdImpression {
    pub id: ImpressionId,
    pub session_id: SessionId,
    pub ad_id: String,
    /// Length of the dispatched ad. Completion is judged against this, never
    /// against a length the device reports.
    pub ad_duration_seconds: u32,
    pub mac_address: MacAddress,
    pub impression_time: DateTime<Utc>,
    pub watched_duration_seconds: u32,
    pub completed: bool,
}

impl AdImpression {
    pub fn new(
        session_id: SessionId,
        ad_id: impl Into<String>,
        ad_duration_seconds: u32,
        mac: MacAddress,
    ) -> Self {
        Self {
            id: ImpressionId::new(),
            session_id,
            ad_id: ad_id.into(),
            ad_duration_seconds,
            mac_address: mac,
            impression_time: Utc::now(),
            watched_duration_seconds: 0,
            completed: false,
        }
    }
}

/// Handle returned to the caller after an impression is recorded.
#[derive(Debug, Clone, Serialize)]
pub struct ImpressionRef {
    pub impression_id: ImpressionId,
    pub session_id: SessionId,
    pub ad_id: String,
}

/// An ad as described by the selection service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ad {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub video_url: String,
    #[serde(alias = "duration")]
    pub duration_seconds: u32,
    #[serde(default, alias = "advertiser_name", skip_serializing_if = "Option::is_none")]
    pub advertiser: Option<String>,
}

/// The ad service keys ads by integer; configured catalogs use strings.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(u64),
    }
    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}

/// What the selector is told about the device asking for an ad.
#[derive(Debug, Clone)]
pub struct AdRequest {
    pub session_id: SessionId,
    pub mac_address: MacAddress,
    pub device_type: Option<String>,
    /// Ads shown to this MAC recently, most recent first.
    pub previous_ads: Vec<String>,
}

/// "Pick an ad for this device." Targeting internals live behind this trait.
#[async_trait]
pub trait AdSelector: Send + Sync {
    async fn pick(&self, request: &AdRequest) -> anyhow::Result<Option<Ad>>;
}
