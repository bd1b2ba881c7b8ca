//! Hub device transport over MQTT.
//!
//! One [`DeviceClient`] is one authenticated MQTT session for a single
//! device identity. Telemetry goes to `devices/{id}/messages/events/`;
//! twin operations are request/response pairs correlated by `$rid`:
//!
//! - `$iothub/twin/GET/?$rid={n}` fetches the twin document
//! - `$iothub/twin/PATCH/properties/reported/?$rid={n}` patches reported state
//! - answers arrive on `$iothub/twin/res/{status}/?$rid={n}`
//!
//! A background task drives the `rumqttc` event loop. Once the session
//! drops, the client is dead: every later call fails with
//! [`Error::ConnectionClosed`] and the owner is expected to open a new one.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS,
    Transport,
};
use secrecy::SecretString;
use serde::Deserialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::Error;
use crate::sas;

/// API version carried in the MQTT username.
pub const DEVICE_API_VERSION: &str = "2021-04-12";

const TWIN_RESPONSE_TOPIC: &str = "$iothub/twin/res/#";
const REQUEST_CHANNEL_CAPACITY: usize = 64;

// ── Options ──────────────────────────────────────────────────────────

/// Tuning for device sessions.
#[derive(Debug, Clone)]
pub struct DeviceClientOptions {
    /// Broker port. Default: 8883 (MQTT over TLS).
    pub port: u16,
    /// Wrap the session in TLS. Default: `true`.
    pub tls: bool,
    /// MQTT keep-alive. Default: 60s.
    pub keep_alive: Duration,
    /// Bound on CONNACK and on each twin round-trip. Default: 30s.
    pub request_timeout: Duration,
    /// Lifetime of the SAS token used as the MQTT password. Default: 1h.
    pub token_ttl: Duration,
}

impl Default for DeviceClientOptions {
    fn default() -> Self {
        Self {
            port: 8883,
            tls: true,
            keep_alive: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            token_ttl: sas::DEFAULT_TOKEN_TTL,
        }
    }
}

// ── Twin types ───────────────────────────────────────────────────────

/// Raw answer to a twin request.
#[derive(Debug, Clone)]
pub struct TwinResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Twin document as returned by a twin GET.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TwinDocument {
    #[serde(default)]
    pub desired: serde_json::Value,
    #[serde(default)]
    pub reported: serde_json::Value,
}

// ── DeviceClient ─────────────────────────────────────────────────────

/// An open MQTT session for one device identity.
///
/// Cheaply cloneable. The background event loop stops when the last
/// clone is dropped or [`close`](Self::close) is called.
#[derive(Clone)]
pub struct DeviceClient {
    inner: Arc<Inner>,
}

struct Inner {
    device_id: String,
    client: AsyncClient,
    shared: Arc<Shared>,
    next_rid: AtomicU64,
    request_timeout: Duration,
    cancel: CancellationToken,
}

/// State shared between the client handle and its event loop task.
struct Shared {
    pending: DashMap<u64, oneshot::Sender<TwinResponse>>,
    closed: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl DeviceClient {
    /// Open an authenticated session for `device_id` on `host`.
    ///
    /// Resolves once the broker has accepted the connection. A CONNACK
    /// refusal for bad credentials maps to [`Error::Authentication`].
    pub async fn open(
        host: &str,
        device_id: &str,
        key: &SecretString,
        options: &DeviceClientOptions,
    ) -> Result<Self, Error> {
        let token = sas::generate_token(
            &format!("{host}/devices/{device_id}"),
            key,
            None,
            options.token_ttl,
        )?;

        let mut mqtt = MqttOptions::new(device_id, host, options.port);
        mqtt.set_credentials(
            format!("{host}/{device_id}/?api-version={DEVICE_API_VERSION}"),
            token,
        );
        mqtt.set_keep_alive(options.keep_alive);
        if options.tls {
            mqtt.set_transport(Transport::tls_with_default_config());
        }

        let (client, mut eventloop) = AsyncClient::new(mqtt, REQUEST_CHANNEL_CAPACITY);

        debug!(device_id, host, "opening device session");
        tokio::time::timeout(options.request_timeout, wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| Error::Timeout {
                timeout_secs: options.request_timeout.as_secs(),
            })??;

        client
            .subscribe(TWIN_RESPONSE_TOPIC, QoS::AtMostOnce)
            .await
            .map_err(|e| Error::Mqtt(e.to_string()))?;

        let shared = Arc::new(Shared {
            pending: DashMap::new(),
            closed: AtomicBool::new(false),
        });
        let cancel = CancellationToken::new();

        tokio::spawn(event_loop(
            eventloop,
            device_id.to_owned(),
            Arc::clone(&shared),
            cancel.clone(),
        ));

        info!(device_id, "device session open");

        Ok(Self {
            inner: Arc::new(Inner {
                device_id: device_id.to_owned(),
                client,
                shared,
                next_rid: AtomicU64::new(1),
                request_timeout: options.request_timeout,
                cancel,
            }),
        })
    }

    /// The device identity this session authenticates as.
    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    /// Whether the underlying session has dropped.
    pub fn is_closed(&self) -> bool {
        self.inner.shared.closed.load(Ordering::Acquire)
    }

    /// Publish a JSON telemetry event.
    pub async fn send_event(&self, payload: Vec<u8>) -> Result<(), Error> {
        self.ensure_open()?;
        let topic = format!(
            "devices/{}/messages/events/$.ct=application%2Fjson&$.ce=utf-8",
            self.inner.device_id
        );
        trace!(topic = %topic, bytes = payload.len(), "publishing telemetry");
        self.inner
            .client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| Error::Mqtt(e.to_string()))
    }

    /// Fetch the device twin.
    pub async fn get_twin(&self) -> Result<Twin, Error> {
        let resp = self
            .request(|rid| format!("$iothub/twin/GET/?$rid={rid}"), Vec::new())
            .await?;
        if resp.status != 200 {
            return Err(Error::Twin {
                status: resp.status,
            });
        }

        let document: TwinDocument =
            serde_json::from_slice(&resp.body).map_err(|e| Error::Deserialization {
                message: e.to_string(),
                body: String::from_utf8_lossy(&resp.body).into_owned(),
            })?;

        Ok(Twin {
            client: self.clone(),
            document,
        })
    }

    /// Stop the event loop and disconnect.
    pub async fn close(&self) {
        // Disconnect may fail if the loop already died -- nothing left to do then.
        let _ = self.inner.client.disconnect().await;
        self.inner.cancel.cancel();
    }

    // ── Request/response plumbing ────────────────────────────────────

    fn ensure_open(&self) -> Result<(), Error> {
        if self.is_closed() {
            Err(Error::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    async fn request(
        &self,
        topic: impl FnOnce(u64) -> String,
        body: Vec<u8>,
    ) -> Result<TwinResponse, Error> {
        self.ensure_open()?;

        let rid = self.inner.next_rid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.shared.pending.insert(rid, tx);

        if let Err(e) = self
            .inner
            .client
            .publish(topic(rid), QoS::AtMostOnce, false, body)
            .await
        {
            self.inner.shared.pending.remove(&rid);
            return Err(Error::Mqtt(e.to_string()));
        }

        match tokio::time::timeout(self.inner.request_timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            // Sender dropped: the event loop exited and cleared pending requests.
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                self.inner.shared.pending.remove(&rid);
                Err(Error::Timeout {
                    timeout_secs: self.inner.request_timeout.as_secs(),
                })
            }
        }
    }
}

// ── Twin ─────────────────────────────────────────────────────────────

/// A fetched twin, bound to the session it was fetched through.
#[derive(Clone)]
pub struct Twin {
    client: DeviceClient,
    document: TwinDocument,
}

impl Twin {
    /// The document as of the fetch.
    pub fn document(&self) -> &TwinDocument {
        &self.document
    }

    /// Merge-patch the reported properties.
    pub async fn update_reported(&self, patch: &serde_json::Value) -> Result<(), Error> {
        let body = serde_json::to_vec(patch).map_err(|e| Error::Mqtt(e.to_string()))?;
        let resp = self
            .client
            .request(
                |rid| format!("$iothub/twin/PATCH/properties/reported/?$rid={rid}"),
                body,
            )
            .await?;

        match resp.status {
            200 | 204 => Ok(()),
            status => Err(Error::Twin { status }),
        }
    }
}

// ── Event loop ───────────────────────────────────────────────────────

/// Drive the event loop until the broker answers the CONNECT.
async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), Error> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(refused(code)),
                };
            }
            Ok(_) => {}
            Err(ConnectionError::ConnectionRefused(code)) => return Err(refused(code)),
            Err(e) => return Err(Error::Mqtt(e.to_string())),
        }
    }
}

fn refused(code: ConnectReturnCode) -> Error {
    match code {
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
            Error::Authentication {
                message: format!("broker refused connection: {code:?}"),
            }
        }
        other => Error::Mqtt(format!("broker refused connection: {other:?}")),
    }
}

async fn event_loop(
    mut eventloop: EventLoop,
    device_id: String,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    dispatch_twin_response(&shared, &publish.topic, &publish.payload);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(device_id = %device_id, error = %e, "device session lost");
                    break;
                }
            }
        }
    }

    shared.closed.store(true, Ordering::Release);
    // Dropping the senders wakes every waiter with ConnectionClosed.
    shared.pending.clear();
    debug!(device_id = %device_id, "device event loop exiting");
}

fn dispatch_twin_response(shared: &Shared, topic: &str, payload: &[u8]) {
    let Some((status, rid)) = parse_twin_response_topic(topic) else {
        trace!(topic, "ignoring unsolicited publish");
        return;
    };

    if let Some((_, tx)) = shared.pending.remove(&rid) {
        // Receiver may have timed out already.
        let _ = tx.send(TwinResponse {
            status,
            body: payload.to_vec(),
        });
    } else {
        trace!(rid, "twin response for unknown request");
    }
}

/// Parse `$iothub/twin/res/{status}/?$rid={rid}[&...]`.
fn parse_twin_response_topic(topic: &str) -> Option<(u16, u64)> {
    let rest = topic.strip_prefix("$iothub/twin/res/")?;
    let (status, query) = rest.split_once("/?")?;
    let status = status.parse().ok()?;
    let rid = query
        .split('&')
        .find_map(|kv| kv.strip_prefix("$rid="))?
        .parse()
        .ok()?;
    Some((status, rid))
}
