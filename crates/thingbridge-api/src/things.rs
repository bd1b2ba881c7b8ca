//! WebThings gateway client: thing listing and property-change streams.
//!
//! Things are listed over REST (`GET /things`, bearer token). Property
//! changes arrive over a per-thing WebSocket at `/things/{id}?jwt={token}`
//! as `propertyStatus` messages; each entry of the message's `data` object
//! becomes one [`PropertyChange`].
//!
//! # Example
//!
//! ```rust,ignore
//! let client = ThingsClient::new(gateway_url, token, &TransportConfig::default())?;
//! for thing in client.list_things().await? {
//!     let Some(id) = thing.thing_id() else { continue };
//!     let mut watch = client
//!         .watch_properties(id, ReconnectConfig::default(), cancel.child_token())
//!         .await?;
//!     while let Some(change) = watch.recv().await {
//!         println!("{}.{} = {}", change.thing_id, change.property, change.value);
//!     }
//! }
//! ```

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::Error;
use crate::transport::TransportConfig;

const PROPERTY_CHANNEL_CAPACITY: usize = 256;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

// ── Wire types ───────────────────────────────────────────────────────

/// A thing description as listed by the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct ThingDescription {
    /// Absolute thing URL (newer gateways).
    #[serde(default)]
    pub id: Option<String>,
    /// Gateway-relative thing path, e.g. `/things/virtual-things-0`.
    #[serde(default)]
    pub href: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl ThingDescription {
    /// The gateway-local thing id: the last path segment of `href`
    /// (falling back to `id`).
    pub fn thing_id(&self) -> Option<&str> {
        self.href
            .as_deref()
            .or(self.id.as_deref())
            .and_then(|s| s.trim_end_matches('/').rsplit('/').next())
            .filter(|s| !s.is_empty())
    }

    /// Display title, falling back to the thing id.
    pub fn display_title(&self) -> &str {
        self.title
            .as_deref()
            .or_else(|| self.thing_id())
            .unwrap_or("<untitled>")
    }
}

/// One property value change observed on a thing.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyChange {
    pub thing_id: String,
    pub property: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WsMessage {
    message_type: String,
    #[serde(default)]
    data: serde_json::Value,
}

// ── ReconnectConfig ──────────────────────────────────────────────────

/// Exponential backoff configuration for WebSocket reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Maximum reconnection attempts before giving up.
    /// `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

// ── ThingsClient ─────────────────────────────────────────────────────

/// HTTP + WebSocket client for a WebThings gateway.
pub struct ThingsClient {
    http: reqwest::Client,
    base_url: Url,
    token: SecretString,
}

impl ThingsClient {
    /// Create a gateway client authenticating with `token`.
    pub fn new(base_url: Url, token: SecretString, transport: &TransportConfig) -> Result<Self, Error> {
        let mut headers = HeaderMap::new();
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
            .map_err(|_| Error::Authentication {
                message: "access token contains invalid header characters".into(),
            })?;
        bearer.set_sensitive(true);
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let http = transport.build_client_with_headers(headers)?;
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    /// The gateway base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// List every thing known to the gateway.
    pub async fn list_things(&self) -> Result<Vec<ThingDescription>, Error> {
        let url = self.base_url.join("things")?;
        debug!("GET {}", url);

        let resp = self.http.get(url).send().await?;
        let status = resp.status();

        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::Authentication {
                message: "gateway rejected access token".into(),
            });
        }

        let body = resp.text().await?;
        if !status.is_success() {
            return Err(Error::Gateway {
                message: body.chars().take(200).collect(),
                status: status.as_u16(),
            });
        }

        serde_json::from_str(&body).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body,
        })
    }

    /// WebSocket URL for a thing's property stream.
    pub fn thing_ws_url(&self, thing_id: &str) -> Result<Url, Error> {
        let mut url = self.base_url.clone();
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|()| Error::WebSocketConnect(format!("cannot derive ws URL from {url}")))?;
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(["things", thing_id]);
        }
        url.query_pairs_mut()
            .clear()
            .append_pair("jwt", self.token.expose_secret());
        Ok(url)
    }

    /// Connect to a thing's property stream.
    ///
    /// The first connection is made before returning, so an unreachable
    /// thing fails here. After that, drops are retried in the background
    /// with exponential backoff until `cancel` fires or `max_retries` is hit,
    /// at which point the receiver yields `None`.
    pub async fn watch_properties(
        &self,
        thing_id: &str,
        reconnect: ReconnectConfig,
        cancel: CancellationToken,
    ) -> Result<PropertyWatch, Error> {
        let url = self.thing_ws_url(thing_id)?;
        let stream = connect(&url).await?;
        info!(thing_id, "property stream connected");

        let (tx, rx) = mpsc::channel(PROPERTY_CHANNEL_CAPACITY);
        let task_cancel = cancel.clone();
        let thing = thing_id.to_owned();
        tokio::spawn(async move {
            ws_loop(url, thing, stream, tx, reconnect, task_cancel).await;
        });

        Ok(PropertyWatch { rx, cancel })
    }
}

// ── PropertyWatch ────────────────────────────────────────────────────

/// Receiving end of a thing's property stream.
pub struct PropertyWatch {
    rx: mpsc::Receiver<PropertyChange>,
    cancel: CancellationToken,
}

impl PropertyWatch {
    /// Next property change, or `None` once the stream has ended for good.
    pub async fn recv(&mut self) -> Option<PropertyChange> {
        self.rx.recv().await
    }

    /// Split into the raw receiver and its cancellation token.
    pub fn into_parts(self) -> (mpsc::Receiver<PropertyChange>, CancellationToken) {
        (self.rx, self.cancel)
    }

    /// Stop the background task.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

// ── Background reconnection loop ─────────────────────────────────────

/// Read from `stream`; on drop, back off and reconnect.
async fn ws_loop(
    url: Url,
    thing_id: String,
    initial: WsStream,
    tx: mpsc::Sender<PropertyChange>,
    reconnect: ReconnectConfig,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;
    let mut stream = Some(initial);

    loop {
        let current = match stream.take() {
            Some(s) => s,
            None => {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    result = connect(&url) => match result {
                        Ok(s) => {
                            info!(thing_id = %thing_id, "property stream reconnected");
                            attempt = 0;
                            s
                        }
                        Err(e) => {
                            warn!(thing_id = %thing_id, error = %e, attempt, "property stream error");
                            if reconnect.max_retries.is_some_and(|max| attempt >= max) {
                                warn!(thing_id = %thing_id, "reconnection limit reached, giving up");
                                break;
                            }
                            let delay = calculate_backoff(attempt, &reconnect);
                            tokio::select! {
                                biased;
                                () = cancel.cancelled() => break,
                                () = tokio::time::sleep(delay) => {}
                            }
                            attempt += 1;
                            continue;
                        }
                    }
                }
            }
        };

        match read_stream(current, &thing_id, &tx, &cancel).await {
            ReadOutcome::Cancelled | ReadOutcome::ReceiverGone => break,
            ReadOutcome::Dropped => {
                debug!(thing_id = %thing_id, "property stream dropped, reconnecting");
            }
        }
    }

    debug!(thing_id = %thing_id, "property stream loop exiting");
}

enum ReadOutcome {
    Cancelled,
    ReceiverGone,
    Dropped,
}

async fn read_stream(
    stream: WsStream,
    thing_id: &str,
    tx: &mpsc::Sender<PropertyChange>,
    cancel: &CancellationToken,
) -> ReadOutcome {
    let (_write, mut read) = stream.split();

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return ReadOutcome::Cancelled,
            frame = read.next() => match frame {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    for change in parse_property_status(thing_id, &text) {
                        if tx.send(change).await.is_err() {
                            return ReadOutcome::ReceiverGone;
                        }
                    }
                }
                Some(Ok(tungstenite::Message::Close(_))) | None => return ReadOutcome::Dropped,
                Some(Err(e)) => {
                    warn!(thing_id, error = %e, "property stream read failed");
                    return ReadOutcome::Dropped;
                }
                // Ping/Pong/Binary -- tungstenite answers pings itself.
                Some(Ok(_)) => {}
            }
        }
    }
}

async fn connect(url: &Url) -> Result<WsStream, Error> {
    let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|e| Error::WebSocketConnect(e.to_string()))?;
    Ok(stream)
}

// ── Message parsing ──────────────────────────────────────────────────

/// Parse a text frame into property changes. Anything other than a
/// well-formed `propertyStatus` message yields nothing.
fn parse_property_status(thing_id: &str, text: &str) -> Vec<PropertyChange> {
    let msg: WsMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            debug!(error = %e, "failed to parse thing message");
            return Vec::new();
        }
    };

    if msg.message_type != "propertyStatus" {
        return Vec::new();
    }

    let serde_json::Value::Object(data) = msg.data else {
        return Vec::new();
    };

    data.into_iter()
        .map(|(property, value)| PropertyChange {
            thing_id: thing_id.to_owned(),
            property,
            value,
        })
        .collect()
}

// ── Backoff calculation ──────────────────────────────────────────────

/// Exponential backoff with jitter.
///
/// `delay = min(initial * 2^attempt, max) + jitter`, jitter +-25%.
#[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let exponent = attempt.min(30) as i32;
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(exponent);
    let capped = base.min(config.max_delay.as_secs_f64());

    // Deterministic "jitter" seeded from the attempt number.
    let jitter_factor = 1.0 + 0.25 * (f64::from(attempt) * 7.3).sin();
    Duration::from_secs_f64((capped * jitter_factor).max(0.0))
}
