//! Controller RPCs consumed by a tunnel.
//!
//! The controller owns the remote half of a tunnel: it tells the device to
//! start a session, relays the device's offer and our answer, and tears the
//! session down. [`TunnelController`] is the seam; [`HttpController`] talks
//! to a real controller over its REST API.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tunnel_protocol::Descriptor;

use crate::error::{Result, TunnelError};
use crate::network::IceServer;

/// Default number of offer polls before giving up.
pub const DEFAULT_OFFER_POLL_ATTEMPTS: u32 = 10;

/// Default delay between offer polls.
pub const DEFAULT_OFFER_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// STUN/TURN hints forwarded to the device when the tunnel is created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportHints {
    /// STUN host without the `stun:` scheme.
    pub stun: Option<String>,
    /// TURN host without the `turn:` scheme.
    pub turn: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl TransportHints {
    /// Derives hints from the first STUN and first TURN server.
    pub fn from_ice_servers(servers: &[IceServer]) -> Self {
        let mut hints = TransportHints::default();
        for server in servers {
            for url in &server.urls {
                if let Some(host) = url.strip_prefix("stun:") {
                    hints.stun.get_or_insert_with(|| host.to_string());
                } else if let Some(host) = url.strip_prefix("turn:") {
                    if hints.turn.is_none() {
                        hints.turn = Some(host.to_string());
                        hints.username = server.username.clone();
                        hints.password = server.credential.clone();
                    }
                }
            }
        }
        hints
    }
}

/// TURN credentials issued by the controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TurnCredentials {
    #[serde(default)]
    pub uris: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl TurnCredentials {
    /// Splits the issued URIs into STUN and TURN servers, dropping `?transport=` style suffixes.
    pub fn ice_servers(&self) -> Vec<IceServer> {
        let strip = |uri: &str| uri.split('?').next().unwrap_or(uri).to_string();
        let mut servers = Vec::new();
        for uri in &self.uris {
            if uri.starts_with("stun:") {
                servers.push(IceServer::stun(strip(uri)));
            } else if uri.starts_with("turn:") {
                servers.push(IceServer::turn(
                    strip(uri),
                    self.username.clone(),
                    self.password.clone(),
                ));
            }
        }
        servers
    }
}

/// Remote-side tunnel operations.
#[async_trait]
pub trait TunnelController: Send + Sync {
    /// Asks the device to start a tunnel session.
    async fn create_tunnel(
        &self,
        device: &str,
        session_id: &str,
        ttl: &str,
        hints: &TransportHints,
    ) -> Result<()>;

    /// Returns the device's offer, or `None` while it has not produced one yet.
    async fn poll_offer_descriptor(&self, device: &str, session_id: &str) -> Result<Option<Descriptor>>;

    async fn submit_answer_descriptor(
        &self,
        device: &str,
        session_id: &str,
        descriptor: &Descriptor,
    ) -> Result<()>;

    async fn teardown_tunnel(&self, device: &str, session_id: &str) -> Result<()>;

    /// TURN credentials for sessions without configured ICE servers.
    async fn turn_credentials(&self) -> Result<Option<TurnCredentials>> {
        Ok(None)
    }
}

/// Bounded retry for the offer poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_OFFER_POLL_ATTEMPTS,
            interval: DEFAULT_OFFER_POLL_INTERVAL,
        }
    }
}

/// Polls for the device's offer until one arrives or the policy is exhausted.
///
/// Sleeps `interval` between polls only; never polls more than `attempts`
/// times. Errors from the controller end the loop immediately.
pub async fn poll_offer(
    controller: &dyn TunnelController,
    device: &str,
    session_id: &str,
    policy: PollPolicy,
) -> Result<Descriptor> {
    for attempt in 1..=policy.attempts {
        if let Some(offer) = controller.poll_offer_descriptor(device, session_id).await? {
            tracing::debug!(attempt, session_id, "received offer descriptor");
            return Ok(offer);
        }

        if attempt < policy.attempts {
            tracing::debug!(attempt, session_id, "offer not ready, retrying");
            tokio::time::sleep(policy.interval).await;
        }
    }

    Err(TunnelError::DescriptorTimeout {
        attempts: policy.attempts,
    })
}

/// Envelope returned by every controller endpoint.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    meta: ApiMeta,
    #[serde(default)]
    data: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiMeta {
    #[serde(default)]
    rc: String,
    #[serde(default)]
    msg: Option<String>,
}

/// [`TunnelController`] over the controller's REST API.
///
/// Authentication is out of scope: the client carries a pre-established
/// session cookie.
pub struct HttpController {
    client: reqwest::Client,
    base_url: String,
    site: String,
    cookie: Option<String>,
}

impl HttpController {
    pub fn new(
        base_url: impl Into<String>,
        site: impl Into<String>,
        cookie: Option<String>,
        accept_invalid_certs: bool,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            site: site.into(),
            cookie,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/s/{}{}", self.base_url, self.site, path)
    }

    /// Posts a `cmd` body and returns the `data` array of a successful reply.
    async fn command(&self, path: &str, body: Value) -> Result<Vec<Value>> {
        let url = self.endpoint(path);
        tracing::debug!(url = %url, cmd = %body["cmd"], "controller command");

        let mut request = self.client.post(&url).json(&body);
        if let Some(cookie) = &self.cookie {
            request = request.header(reqwest::header::COOKIE, cookie);
        }

        let response: ApiResponse = request.send().await?.error_for_status()?.json().await?;
        check_meta(&response.meta)?;
        Ok(response.data)
    }
}

fn check_meta(meta: &ApiMeta) -> Result<()> {
    if meta.rc == "ok" {
        Ok(())
    } else {
        Err(TunnelError::Controller(
            meta.msg
                .clone()
                .unwrap_or_else(|| format!("unexpected rc '{}'", meta.rc)),
        ))
    }
}

fn offer_from_data(data: &[Value]) -> Option<Descriptor> {
    data.first()
        .and_then(|entry| entry.get("ssh_sdp_offer"))
        .and_then(Value::as_str)
        .filter(|sdp| !sdp.is_empty())
        .map(Descriptor::offer)
}

#[async_trait]
impl TunnelController for HttpController {
    async fn create_tunnel(
        &self,
        device: &str,
        session_id: &str,
        ttl: &str,
        hints: &TransportHints,
    ) -> Result<()> {
        self.command(
            "/cmd/devmgr",
            json!({
                "cmd": "build-ssh-session",
                "mac": device,
                "uuid": session_id,
                "ttl": ttl,
                "stun": hints.stun,
                "turn": hints.turn,
                "username": hints.username.clone().unwrap_or_default(),
                "password": hints.password.clone().unwrap_or_default(),
            }),
        )
        .await?;
        Ok(())
    }

    async fn poll_offer_descriptor(&self, device: &str, session_id: &str) -> Result<Option<Descriptor>> {
        let data = self
            .command(
                "/cmd/devmgr",
                json!({"cmd": "get-sdp-offer", "mac": device, "uuid": session_id}),
            )
            .await?;
        Ok(offer_from_data(&data))
    }

    async fn submit_answer_descriptor(
        &self,
        device: &str,
        session_id: &str,
        descriptor: &Descriptor,
    ) -> Result<()> {
        self.command(
            "/cmd/devmgr",
            json!({
                "cmd": "ssh-sdp-answer",
                "mac": device,
                "uuid": session_id,
                "sdpanswer": descriptor.body,
            }),
        )
        .await?;
        Ok(())
    }

    async fn teardown_tunnel(&self, device: &str, session_id: &str) -> Result<()> {
        self.command(
            "/cmd/devmgr",
            json!({"cmd": "close-ssh-session", "mac": device, "uuid": session_id}),
        )
        .await?;
        Ok(())
    }

    async fn turn_credentials(&self) -> Result<Option<TurnCredentials>> {
        let data = self
            .command("/cmd/sdn", json!({"cmd": "get-turn-credentials"}))
            .await?;
        match data.into_iter().next() {
            Some(entry) => serde_json::from_value(entry)
                .map(Some)
                .map_err(|e| TunnelError::Controller(format!("invalid turn credentials: {}", e))),
            None => Ok(None),
        }
    }
}
