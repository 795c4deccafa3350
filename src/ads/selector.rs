//! Ad-selection collaborators.
//!
//! Targeting is somebody else's problem: the HTTP selector defers to the ad
//! service, the catalog selector rotates through a configured list, and the
//! fallback selector chains the two.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{Ad, AdRequest, AdSelector};

// ---------------------------------------------------------------------------
// HttpAdSelector
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SelectResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    ad: Option<Ad>,
    #[serde(default)]
    message: Option<String>,
}

/// `GET {base}/api/ads/select` against the ad service.
pub struct HttpAdSelector {
    client: Client,
    endpoint: String,
}

impl HttpAdSelector {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/ads/select", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl AdSelector for HttpAdSelector {
    async fn pick(&self, request: &AdRequest) -> Result<Option<Ad>> {
        let session_id = request.session_id.to_string();
        let mac = request.mac_address.to_string();
        let mut query: Vec<(&str, &str)> = vec![
            ("sessionId", session_id.as_str()),
            ("macAddress", mac.as_str()),
        ];
        // Repeated `previousAds[]` keys, the array form the service's other
        // clients send. The service may ignore it; the catalog fallback does not.
        query.extend(request.previous_ads.iter().map(|id| ("previousAds[]", id.as_str())));
        if let Some(device_type) = request.device_type.as_deref() {
            query.push(("deviceType", device_type));
        }

        let resp = self
            .client
            .get(&self.endpoint)
            .query(&query)
            .send()
            .await
            .with_context(|| format!("ad service request to {} failed", self.endpoint))?;

        // The service answers 404 when it has nothing to show.
        if resp.status() == StatusCode::NOT_FOUND {
            debug!(session_id = %request.session_id, "ad service has no ad for this device");
            return Ok(None);
        }
        if !resp.status().is_success() {
            bail!("ad service returned HTTP {}", resp.status());
        }

        let body: SelectResponse = resp.json().await.context("malformed ad service response")?;
        if !body.success {
            bail!(
                "ad service declined: {}",
                body.message.unwrap_or_else(|| "no reason given".into())
            );
        }
        Ok(body.ad)
    }
}

// ---------------------------------------------------------------------------
// CatalogAdSelector
// ---------------------------------------------------------------------------

/// Rotates through a fixed list, preferring ads the device has not seen
/// recently.
#[derive(Debug, Clone, Default)]
pub struct CatalogAdSelector {
    ads: Vec<Ad>,
}

impl CatalogAdSelector {
    pub fn new(ads: Vec<Ad>) -> Self {
        Self { ads }
    }

    pub fn is_empty(&self) -> bool {
        self.ads.is_empty()
    }
}

#[async_trait]
impl AdSelector for CatalogAdSelector {
    async fn pick(&self, request: &AdRequest) -> Result<Option<Ad>> {
        let fresh = self
            .ads
            .iter()
            .find(|ad| !request.previous_ads.contains(&ad.id));
        Ok(fresh.or_else(|| self.ads.first()).cloned())
    }
}

// ---------------------------------------------------------------------------
// FallbackAdSelector
// ---------------------------------------------------------------------------

/// Try `primary`; if it fails or has nothing to show, ask `fallback`.
pub struct FallbackAdSelector<P, F> {
    primary: P,
    fallback: F,
}

impl<P, F> FallbackAdSelector<P, F> {
    pub fn new(primary: P, fallback: F) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl<P, F> AdSelector for FallbackAdSelector<P, F>
where
    P: AdSelector,
    F: AdSelector,
{
    async fn pick(&self, request: &AdRequest) -> Result<Option<Ad>> {
        match self.primary.pick(request).await {
            Ok(Some(ad)) => Ok(Some(ad)),
            Ok(None) => {
                debug!(session_id = %request.session_id, "primary selector had no ad, using fallback");
                self.fallback.pick(request).await
            }
            Err(e) => {
                warn!(session_id = %request.session_id, error = %format!("{:#}", e), "ad service failed, using fallback");
                self.fallback.pick(request).await
            }
        }
    }
}
