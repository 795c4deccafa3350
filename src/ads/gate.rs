//! The ad gate: records impressions and decides whether a watch event
//! satisfies the minimum-watch policy.
//!
//! A satisfied impression yields a completion token. The session manager
//! refuses to activate without one.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{Ad, AdImpression, AdRequest, AdSelector, ImpressionId, ImpressionRef};
use crate::error::{AccessError, AccessResult};
use crate::mac::MacAddress;
use crate::session::{SessionId, SessionStatus};
use crate::storage::AccessStore;
use crate::token::TokenSigner;

pub const INSUFFICIENT_WATCH_TIME: &str = "insufficient watch time";

/// How far back "recently shown" reaches when asking for a new ad.
const RECENT_AD_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Completion {
    Accepted { token: String },
    Rejected { reason: String },
}

/// An ad handed to the device together with the impression tracking it.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchedAd {
    pub ad: Ad,
    pub impression_id: ImpressionId,
    pub min_watch_percentage: u8,
}

pub struct AdGate {
    store: Arc<dyn AccessStore>,
    selector: Arc<dyn AdSelector>,
    signer: TokenSigner,
    min_watch_percentage: u8,
}

/// Integer form of `watched / duration * 100 >= pct`.
fn meets_threshold(watched: u32, duration: u32, pct: u8) -> bool {
    u64::from(watched) * 100 >= u64::from(pct) * u64::from(duration)
}

impl AdGate {
    pub fn new(
        store: Arc<dyn AccessStore>,
        selector: Arc<dyn AdSelector>,
        signer: TokenSigner,
        min_watch_percentage: u8,
    ) -> Self {
        Self {
            store,
            selector,
            signer,
            min_watch_percentage,
        }
    }

    pub fn min_watch_percentage(&self) -> u8 {
        self.min_watch_percentage
    }

    async fn pending_session(&self, session_id: SessionId) -> AccessResult<crate::session::Session> {
        match self.store.get_session(session_id).await? {
            Some(s) if s.status == SessionStatus::Pending => Ok(s),
            _ => Err(AccessError::session_not_found(session_id)),
        }
    }

    async fn load(&self, id: ImpressionId) -> AccessResult<AdImpression> {
        self.store
            .get_impression(id)
            .await?
            .ok_or_else(|| AccessError::impression_not_found(id))
    }

    /// Record that `ad_id`, `ad_duration_seconds` long, is being shown for a
    /// pending session.
    pub async fn create_impression(
        &self,
        session_id: SessionId,
        ad_id: &str,
        ad_duration_seconds: u32,
        mac: MacAddress,
    ) -> AccessResult<ImpressionRef> {
        if ad_duration_seconds == 0 {
            return Err(AccessError::invalid_state("ad duration must be positive"));
        }
        self.pending_session(session_id).await?;

        let impression = AdImpression::new(session_id, ad_id, ad_duration_seconds, mac);
        self.store.insert_impression(&impression).await?;
        debug!(session_id = %session_id, impression_id = %impression.id, ad_id, "impression created");

        Ok(ImpressionRef {
            impression_id: impression.id,
            session_id,
            ad_id: impression.ad_id,
        })
    }

    /// Pick an ad for the session's device and open an impression for it.
    pub async fn dispatch_ad(&self, session_id: SessionId) -> AccessResult<DispatchedAd> {
        let session = self.pending_session(session_id).await?;

        let since = Utc::now() - Duration::hours(RECENT_AD_WINDOW_HOURS);
        let previous_ads = self.store.recent_ad_ids(session.mac_address, since).await?;
        let request = AdRequest {
            session_id,
            mac_address: session.mac_address,
            device_type: session.device_type.clone(),
            previous_ads,
        };

        let ad = self
            .selector
            .pick(&request)
            .await?
            .ok_or_else(|| AccessError::NotFound {
                entity: "ad",
                id: "no ads available".into(),
            })?;

        let imp = self
            .create_impression(session_id, &ad.id, ad.duration_seconds, session.mac_address)
            .await?;
        Ok(DispatchedAd {
            ad,
            impression_id: imp.impression_id,
            min_watch_percentage: self.min_watch_percentage,
        })
    }

    /// Raise the watched counter. Lowering it, or touching a completed
    /// impression, is `InvalidState`.
    pub async fn report_progress(&self, id: ImpressionId, watched_seconds: u32) -> AccessResult<()> {
        let current = self.load(id).await?;
        if current.completed {
            return Err(AccessError::invalid_state("impression already completed"));
        }
        if watched_seconds < current.watched_duration_seconds {
            return Err(AccessError::invalid_state(format!(
                "watched time cannot decrease ({} < {})",
                watched_seconds, current.watched_duration_seconds
            )));
        }

        if !self.store.record_watch(id, watched_seconds).await? {
            // Lost a race with a higher report or a completion.
            return Err(AccessError::invalid_state("impression changed concurrently"));
        }
        Ok(())
    }

    /// Decide whether the watch satisfies `min_watch_percentage`.
    ///
    /// `ad_duration_seconds` must be the length recorded when the ad was
    /// dispatched. Accepting sets `completed` and returns a token. Rejecting
    /// changes nothing. An impression that is already completed gets its
    /// token again.
    pub async fn evaluate_completion(
        &self,
        id: ImpressionId,
        watched_seconds: u32,
        ad_duration_seconds: u32,
        min_watch_percentage: u8,
    ) -> AccessResult<Completion> {
        if ad_duration_seconds == 0 {
            return Err(AccessError::invalid_state("ad duration must be positive"));
        }
        if min_watch_percentage > 100 {
            return Err(AccessError::invalid_state("minimum watch percentage must be 0-100"));
        }

        let current = self.load(id).await?;
        if ad_duration_seconds != current.ad_duration_seconds {
            warn!(
                impression_id = %id,
                claimed = ad_duration_seconds,
                dispatched = current.ad_duration_seconds,
                "completion claimed a different ad length"
            );
            return Err(AccessError::invalid_state(
                "ad duration does not match the dispatched ad",
            ));
        }
        let accepted = || Completion::Accepted {
            token: self.signer.issue_completion(current.id, current.session_id),
        };

        if current.completed {
            return Ok(accepted());
        }
        if watched_seconds < current.watched_duration_seconds {
            return Err(AccessError::invalid_state(format!(
                "watched time cannot decrease ({} < {})",
                watched_seconds, current.watched_duration_seconds
            )));
        }
        if !meets_threshold(watched_seconds, ad_duration_seconds, min_watch_percentage) {
            debug!(impression_id = %id, watched_seconds, ad_duration_seconds, "watch below threshold");
            return Ok(Completion::Rejected {
                reason: INSUFFICIENT_WATCH_TIME.into(),
            });
        }

        if !self.store.mark_completed(id, watched_seconds).await? {
            let now = self.load(id).await?;
            if !now.completed {
                return Err(AccessError::invalid_state("impression changed concurrently"));
            }
        }
        info!(
            impression_id = %id,
            session_id = %current.session_id,
            watched_seconds,
            ad_duration_seconds,
            "ad completed"
        );
        Ok(accepted())
    }

    /// [`Self::evaluate_completion`] against the dispatched ad's length and
    /// the configured threshold.
    pub async fn evaluate(&self, id: ImpressionId, watched_seconds: u32) -> AccessResult<Completion> {
        let duration = self.load(id).await?.ad_duration_seconds;
        self.evaluate_completion(id, watched_seconds, duration, self.min_watch_percentage)
            .await
    }
}
