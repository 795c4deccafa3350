//! Network Access Client -- the only code that talks to the NAS.
//!
//! `provision` writes credentials the RADIUS server authenticates against,
//! `grant` sends a CoA-Request, `revoke` sends a Disconnect-Request and then
//! drops the credentials. Every datagram exchange runs under [`RetryPolicy`].

pub mod credentials;
pub mod packet;

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU8, Ordering};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::mac::MacAddress;
use crate::retry::RetryPolicy;

pub use credentials::CredentialStore;
use packet::{Attribute, Code, Packet, AUTHENTICATOR_LEN, MAX_PACKET_LEN};

/// Outbound access-control operations the session manager depends on.
#[async_trait]
pub trait NetworkAccessClient: Send + Sync {
    /// Idempotent upsert of credential and reply attributes.
    async fn provision(&self, username: &str, password: &str, session_timeout_secs: u32) -> Result<()>;

    /// Tell the NAS to admit the device, bounded by `session_timeout_secs`.
    async fn grant(&self, mac: MacAddress, ip: Option<IpAddr>, session_timeout_secs: u32) -> Result<()>;

    /// Tell the NAS to drop the device's session.
    async fn revoke(&self, mac: MacAddress) -> Result<()>;
}

// ---------------------------------------------------------------------------
// RadiusClient
// ---------------------------------------------------------------------------

pub struct RadiusClient {
    nas: SocketAddr,
    secret: Vec<u8>,
    nas_identifier: String,
    idle_timeout_secs: u32,
    retry: RetryPolicy,
    credentials: CredentialStore,
    next_identifier: AtomicU8,
}

impl RadiusClient {
    pub fn new(
        nas: SocketAddr,
        secret: impl AsRef<[u8]>,
        nas_identifier: impl Into<String>,
        idle_timeout_secs: u32,
        retry: RetryPolicy,
        credentials: CredentialStore,
    ) -> Self {
        Self {
            nas,
            secret: secret.as_ref().to_vec(),
            nas_identifier: nas_identifier.into(),
            idle_timeout_secs,
            retry,
            credentials,
            next_identifier: AtomicU8::new(rand::random()),
        }
    }

    fn event_timestamp() -> u32 {
        chrono::Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32
    }

    /// Send one request and wait for the matching ACK. A NAK is an error.
    ///
    /// Retransmissions reuse the same identifier and authenticator so the NAS
    /// can recognise duplicates.
    async fn exchange(&self, code: Code, attributes: Vec<Attribute>) -> Result<Packet> {
        let (ack, nak) = match code.replies() {
            Some(pair) => pair,
            None => bail!("{:?} is not a request code", code),
        };

        let identifier = self.next_identifier.fetch_add(1, Ordering::Relaxed);
        let mut request = Packet::new(code, identifier, attributes);
        let wire = request.encode(&[0; AUTHENTICATOR_LEN], &self.secret)?;
        let request_auth = request.authenticator;

        let local: SocketAddr = if self.nas.is_ipv4() {
            ([0u8; 4], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local).await.context("failed to bind RADIUS socket")?;
        socket
            .connect(self.nas)
            .await
            .with_context(|| format!("failed to connect to NAS {}", self.nas))?;

        let socket = &socket;
        let wire = &wire;
        let secret = self.secret.as_slice();
        let what = format!("{:?} to {}", code, self.nas);

        let reply = self
            .retry
            .run(&what, |attempt| async move {
                if attempt > 1 {
                    debug!(identifier, attempt, "retransmitting RADIUS request");
                }
                socket.send(wire).await.context("send failed")?;

                let mut buf = vec![0u8; MAX_PACKET_LEN];
                loop {
                    let n = socket.recv(&mut buf).await.context("recv failed")?;
                    let raw = &buf[..n];
                    if n < packet::HEADER_LEN || raw[1] != identifier {
                        debug!(len = n, "ignoring unrelated datagram");
                        continue;
                    }
                    if !packet::verify_authenticator(raw, &request_auth, secret) {
                        warn!(identifier, "dropping reply with bad authenticator");
                        continue;
                    }
                    return Packet::decode(raw);
                }
            })
            .await?;

        if reply.code == ack {
            Ok(reply)
        } else if reply.code == nak {
            match reply.error_cause() {
                Some(cause) => bail!(
                    "NAS answered {:?} (Error-Cause {} {})",
                    nak,
                    cause,
                    packet::error_cause_text(cause)
                ),
                None => bail!("NAS answered {:?}", nak),
            }
        } else {
            bail!("unexpected reply {:?} to {:?}", reply.code, code)
        }
    }
}

#[async_trait]
impl NetworkAccessClient for RadiusClient {
    async fn provision(&self, username: &str, password: &str, session_timeout_secs: u32) -> Result<()> {
        self.credentials
            .upsert(username, password, session_timeout_secs, self.idle_timeout_secs)
            .await?;
        debug!(username, session_timeout_secs, "credentials provisioned");
        Ok(())
    }

    async fn grant(&self, mac: MacAddress, ip: Option<IpAddr>, session_timeout_secs: u32) -> Result<()> {
        let mut attributes = vec![
            Attribute::NasIdentifier(self.nas_identifier.clone()),
            Attribute::UserName(mac.username()),
            Attribute::CallingStationId(mac.calling_station_id()),
        ];
        if let Some(IpAddr::V4(v4)) = ip {
            attributes.push(Attribute::FramedIpAddress(v4));
        }
        attributes.push(Attribute::SessionTimeout(session_timeout_secs));
        attributes.push(Attribute::EventTimestamp(Self::event_timestamp()));

        self.exchange(Code::CoaRequest, attributes)
            .await
            .with_context(|| format!("CoA for {} rejected or unanswered", mac))?;
        info!(mac = %mac, session_timeout_secs, "CoA acknowledged");
        Ok(())
    }

    async fn revoke(&self, mac: MacAddress) -> Result<()> {
        let attributes = vec![
            Attribute::NasIdentifier(self.nas_identifier.clone()),
            Attribute::UserName(mac.username()),
            Attribute::CallingStationId(mac.calling_station_id()),
            Attribute::EventTimestamp(Self::event_timestamp()),
        ];

        // Credentials go even if the NAS never answers, so the device cannot
        // re-authenticate after the session ended.
        let disconnect = self.exchange(Code::DisconnectRequest, attributes).await;
        let removal = self.credentials.remove(&mac.username()).await;

        disconnect.with_context(|| format!("Disconnect for {} rejected or unanswered", mac))?;
        removal?;
        info!(mac = %mac, "Disconnect acknowledged");
        Ok(())
    }
}
