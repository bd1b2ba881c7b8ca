#![allow(clippy::unwrap_used)]
// End-to-end engine tests against an in-memory hub and gateway.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::sync::{Notify, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use thingbridge_core::{
    Admission, Batch, BatchSink, Bridge, BridgeConfig, Collaborators, ConnectionCache, CoreError,
    Credential, CredentialStore, DeviceConnection, DeviceId, DeviceTwin, HubSink, HubTransport,
    IdentityRecord, IdentityRegistry, IdentityStatus, KeyPair, MemoryCredentialStore,
    PropertyChange, PropertySubscription, Provisioner, ThingHandle, ThingSource,
};

// ── Fake hub ────────────────────────────────────────────────────────

/// Registry and transport in one: an open succeeds only with the key
/// most recently registered for the device.
#[derive(Default)]
struct FakeHub {
    keys: Mutex<HashMap<DeviceId, String>>,
    statuses: Mutex<HashMap<DeviceId, IdentityStatus>>,
    creates: Mutex<Vec<(DeviceId, IdentityStatus)>>,
    opens: Mutex<Vec<(DeviceId, bool)>>,
    events: Mutex<Vec<(DeviceId, String, Value)>>,
    patches: Mutex<Vec<(DeviceId, Value)>>,
    twin_fetches: AtomicUsize,
    list_calls: AtomicUsize,
    reject_all_opens: AtomicBool,
    close_next_send: AtomicBool,
    fail_sends: AtomicBool,
    /// Remaining twin fetches to refuse; `usize::MAX` refuses all.
    twin_failures: AtomicUsize,
    hold_opens: Option<Semaphore>,
    open_entered: Notify,
}

impl FakeHub {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every open waits for a permit from `release_opens`.
    fn holding_opens() -> Arc<Self> {
        Arc::new(Self {
            hold_opens: Some(Semaphore::new(0)),
            ..Self::default()
        })
    }

    fn release_opens(&self, n: usize) {
        if let Some(gate) = &self.hold_opens {
            gate.add_permits(n);
        }
    }

    fn register(&self, device_id: &str, key: &str) {
        self.keys
            .lock()
            .unwrap()
            .insert(DeviceId::new(device_id), key.to_owned());
    }

    fn set_status(&self, device_id: &str, status: IdentityStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert(DeviceId::new(device_id), status);
    }

    fn key_of(&self, device_id: &str) -> Option<String> {
        self.keys.lock().unwrap().get(&DeviceId::new(device_id)).cloned()
    }

    fn creates(&self) -> Vec<(DeviceId, IdentityStatus)> {
        self.creates.lock().unwrap().clone()
    }

    fn opens(&self) -> Vec<(DeviceId, bool)> {
        self.opens.lock().unwrap().clone()
    }

    fn events(&self) -> Vec<(DeviceId, String, Value)> {
        self.events.lock().unwrap().clone()
    }

    fn event_bodies(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .map(|(_, _, body)| serde_json::to_string(&body).unwrap())
            .collect()
    }

    fn patches(&self) -> Vec<(DeviceId, Value)> {
        self.patches.lock().unwrap().clone()
    }

    fn twin_fetches(&self) -> usize {
        self.twin_fetches.load(Ordering::SeqCst)
    }

    fn refuse_twin_fetch(&self) -> bool {
        self.twin_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok()
    }
}

#[async_trait]
impl IdentityRegistry for FakeHub {
    async fn list_identities(&self) -> Result<Vec<IdentityRecord>, CoreError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .iter()
            .map(|(id, status)| IdentityRecord::new(id.clone(), *status))
            .collect())
    }

    async fn create_identity(
        &self,
        device_id: &DeviceId,
        status: IdentityStatus,
        keys: &KeyPair,
    ) -> Result<(), CoreError> {
        self.creates.lock().unwrap().push((device_id.clone(), status));
        self.keys
            .lock()
            .unwrap()
            .insert(device_id.clone(), keys.primary.expose().to_owned());
        Ok(())
    }
}

struct HubHandle(Arc<FakeHub>);

#[async_trait]
impl HubTransport for HubHandle {
    async fn open(
        &self,
        host: &str,
        device_id: &DeviceId,
        credential: &Credential,
    ) -> Result<Arc<dyn DeviceConnection>, CoreError> {
        assert_eq!(host, "testhub.example.net");
        self.0.open_entered.notify_one();
        if let Some(gate) = &self.0.hold_opens {
            gate.acquire().await.unwrap().forget();
        }

        let valid = !self.0.reject_all_opens.load(Ordering::SeqCst)
            && self.0.key_of(device_id.as_str()).as_deref() == Some(credential.expose());
        self.0.opens.lock().unwrap().push((device_id.clone(), valid));

        if !valid {
            return Err(CoreError::AuthenticationFailed {
                message: "broker refused connection: NotAuthorized".into(),
            });
        }
        Ok(Arc::new(FakeConnection {
            hub: Arc::clone(&self.0),
            device_id: device_id.clone(),
            key: credential.expose().to_owned(),
        }))
    }
}

struct FakeConnection {
    hub: Arc<FakeHub>,
    device_id: DeviceId,
    key: String,
}

#[async_trait]
impl DeviceConnection for FakeConnection {
    async fn send_event(&self, payload: Vec<u8>) -> Result<(), CoreError> {
        if self.hub.close_next_send.swap(false, Ordering::SeqCst) {
            return Err(CoreError::SessionClosed);
        }
        if self.hub.fail_sends.load(Ordering::SeqCst) {
            return Err(CoreError::Transport {
                message: "publish timed out".into(),
            });
        }
        let body: Value = serde_json::from_slice(&payload).unwrap();
        self.hub
            .events
            .lock()
            .unwrap()
            .push((self.device_id.clone(), self.key.clone(), body));
        Ok(())
    }

    async fn get_twin(&self) -> Result<Arc<dyn DeviceTwin>, CoreError> {
        self.hub.twin_fetches.fetch_add(1, Ordering::SeqCst);
        if self.hub.refuse_twin_fetch() {
            return Err(CoreError::AuthenticationFailed {
                message: "twin request rejected (401)".into(),
            });
        }
        Ok(Arc::new(FakeTwin {
            hub: Arc::clone(&self.hub),
            device_id: self.device_id.clone(),
        }))
    }
}

struct FakeTwin {
    hub: Arc<FakeHub>,
    device_id: DeviceId,
}

#[async_trait]
impl DeviceTwin for FakeTwin {
    async fn update_reported(&self, patch: &Value) -> Result<(), CoreError> {
        self.hub
            .patches
            .lock()
            .unwrap()
            .push((self.device_id.clone(), patch.clone()));
        Ok(())
    }
}

// ── Fake gateway ────────────────────────────────────────────────────

struct FakeThing {
    id: String,
    subscription: Mutex<Option<PropertySubscription>>,
}

#[async_trait]
impl ThingHandle for FakeThing {
    fn id(&self) -> &str {
        &self.id
    }

    fn title(&self) -> &str {
        &self.id
    }

    async fn connect(&self, _cancel: CancellationToken) -> Result<PropertySubscription, CoreError> {
        self.subscription
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| CoreError::ThingSource {
                message: format!("{} is unreachable", self.id),
            })
    }
}

#[derive(Default)]
struct FakeGateway {
    things: Vec<Arc<dyn ThingHandle>>,
}

impl FakeGateway {
    /// Add a thing; returns the sender feeding its property stream.
    fn with_thing(mut self, id: &str) -> (Self, mpsc::Sender<PropertyChange>) {
        let (tx, rx) = mpsc::channel(16);
        self.things.push(Arc::new(FakeThing {
            id: id.to_owned(),
            subscription: Mutex::new(Some(rx)),
        }));
        (self, tx)
    }

    fn with_unreachable_thing(mut self, id: &str) -> Self {
        self.things.push(Arc::new(FakeThing {
            id: id.to_owned(),
            subscription: Mutex::new(None),
        }));
        self
    }
}

#[async_trait]
impl ThingSource for FakeGateway {
    async fn list_things(&self) -> Result<Vec<Arc<dyn ThingHandle>>, CoreError> {
        Ok(self.things.clone())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn config() -> BridgeConfig {
    BridgeConfig::new("testhub.example.net")
}

fn bridge_with(
    hub: &Arc<FakeHub>,
    store: &Arc<MemoryCredentialStore>,
    gateway: FakeGateway,
    config: &BridgeConfig,
) -> Bridge {
    Bridge::new(
        config,
        Collaborators {
            registry: Arc::clone(hub) as Arc<dyn IdentityRegistry>,
            transport: Arc::new(HubHandle(Arc::clone(hub))),
            credentials: Arc::clone(store) as Arc<dyn CredentialStore>,
            things: Arc::new(gateway),
        },
    )
}

fn bridge(hub: &Arc<FakeHub>, store: &Arc<MemoryCredentialStore>) -> Bridge {
    bridge_with(hub, store, FakeGateway::default(), &config())
}

fn change(property: &str, value: Value) -> PropertyChange {
    PropertyChange::new(property, value)
}

fn twin_sync_config() -> BridgeConfig {
    let mut config = config();
    config.sync_twin = true;
    config
}

/// A twin-syncing sink over a fresh connection cache.
fn hub_sink(hub: &Arc<FakeHub>, store: &Arc<MemoryCredentialStore>) -> HubSink {
    let provisioner = Provisioner::new(
        Arc::clone(hub) as Arc<dyn IdentityRegistry>,
        Arc::clone(store) as Arc<dyn CredentialStore>,
        IdentityStatus::Enabled,
    );
    let cache = ConnectionCache::new(
        "testhub.example.net",
        Arc::new(HubHandle(Arc::clone(hub))),
        provisioner,
        Duration::from_secs(30),
    );
    HubSink::new(Arc::new(cache), true)
}

/// Wait for all spawned flushes to finish.
async fn settle(bridge: &Bridge) {
    bridge.coalescer().shutdown().await;
}

async fn stored_key(store: &MemoryCredentialStore, device_id: &str) -> Option<String> {
    store
        .get(&DeviceId::new(device_id))
        .await
        .unwrap()
        .map(|c| c.expose().to_owned())
}

// ── Provisioning and flushing ───────────────────────────────────────

#[tokio::test]
async fn first_contact_provisions_and_sends() {
    let hub = FakeHub::new();
    let store = Arc::new(MemoryCredentialStore::new());
    let bridge = bridge(&hub, &store);
    let lamp = DeviceId::new("lamp");

    let admission = bridge.deliver(&lamp, change("temperature", json!(21))).await;
    assert_eq!(admission, Some(Admission::Started));
    settle(&bridge).await;

    assert_eq!(hub.creates(), vec![(lamp.clone(), IdentityStatus::Enabled)]);
    assert_eq!(stored_key(&store, "lamp").await, hub.key_of("lamp"));
    assert_eq!(hub.opens(), vec![(lamp, true)]);
    assert_eq!(hub.event_bodies(), vec![r#"{"temperature":21}"#]);
    assert!(hub.patches().is_empty());
}

#[tokio::test]
async fn revoked_credential_is_recreated_once() {
    let hub = FakeHub::new();
    hub.register("lamp", "revoked-elsewhere");
    let store = Arc::new(MemoryCredentialStore::with_credentials([(
        DeviceId::new("lamp"),
        Credential::new("stale-key"),
    )]));
    let bridge = bridge(&hub, &store);
    let lamp = DeviceId::new("lamp");

    bridge.deliver(&lamp, change("on", json!(true))).await;
    settle(&bridge).await;

    assert_eq!(hub.opens(), vec![(lamp.clone(), false), (lamp, true)]);
    assert_eq!(hub.creates().len(), 1);

    let new_key = stored_key(&store, "lamp").await.unwrap();
    assert_ne!(new_key, "stale-key");
    assert_eq!(Some(new_key.clone()), hub.key_of("lamp"));

    let events = hub.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].1, new_key);
}

#[tokio::test]
async fn second_open_failure_is_not_retried() {
    let hub = FakeHub::new();
    hub.reject_all_opens.store(true, Ordering::SeqCst);
    let store = Arc::new(MemoryCredentialStore::new());
    let bridge = bridge(&hub, &store);
    let lamp = DeviceId::new("lamp");

    bridge.deliver(&lamp, change("on", json!(true))).await;
    settle(&bridge).await;

    // ensure_identity creates once, recreation creates once more.
    assert_eq!(hub.creates().len(), 2);
    assert_eq!(hub.opens().len(), 2);
    assert!(hub.events().is_empty());

    // The batch is gone; a later update starts over.
    assert!(bridge.coalescer().pending(&lamp).is_none());
}

#[tokio::test]
async fn stored_credential_is_reused() {
    let hub = FakeHub::new();
    let store = Arc::new(MemoryCredentialStore::new());
    let provisioner = Provisioner::new(
        Arc::clone(&hub) as Arc<dyn IdentityRegistry>,
        Arc::clone(&store) as Arc<dyn CredentialStore>,
        IdentityStatus::Enabled,
    );
    let lamp = DeviceId::new("lamp");

    let first = provisioner.ensure_identity(&lamp).await.unwrap();
    let again = provisioner.ensure_identity(&lamp).await.unwrap();
    assert_eq!(first.expose(), again.expose());
    assert_eq!(hub.creates().len(), 1);

    let recreated = provisioner.recreate_identity(&lamp).await.unwrap();
    assert_ne!(recreated.expose(), first.expose());
    assert_eq!(stored_key(&store, "lamp").await.as_deref(), Some(recreated.expose()));
}

#[tokio::test]
async fn new_identities_use_configured_status() {
    let hub = FakeHub::new();
    let store = Arc::new(MemoryCredentialStore::new());
    let mut config = config();
    config.new_identity_status = IdentityStatus::Disabled;
    let bridge = bridge_with(&hub, &store, FakeGateway::default(), &config);

    bridge.deliver(&DeviceId::new("lamp"), change("on", json!(1))).await;
    settle(&bridge).await;

    assert_eq!(hub.creates()[0].1, IdentityStatus::Disabled);
}

// ── Coalescing ──────────────────────────────────────────────────────

#[tokio::test]
async fn update_during_connect_starts_second_batch() {
    let hub = FakeHub::holding_opens();
    let store = Arc::new(MemoryCredentialStore::new());
    let bridge = bridge(&hub, &store);
    let lamp = DeviceId::new("lamp");

    let first = bridge.deliver(&lamp, change("a", json!(1))).await;
    hub.open_entered.notified().await;
    let second = bridge.deliver(&lamp, change("b", json!(2))).await;

    assert_eq!(first, Some(Admission::Started));
    assert_eq!(second, Some(Admission::Started));

    hub.release_opens(1);
    settle(&bridge).await;

    assert_eq!(hub.event_bodies(), vec![r#"{"a":1}"#, r#"{"b":2}"#]);
    // The second flush found the session the first one opened.
    assert_eq!(hub.opens().len(), 1);
    assert_eq!(hub.creates().len(), 1);
}

#[tokio::test]
async fn burst_collapses_into_one_event() {
    let hub = FakeHub::new();
    let store = Arc::new(MemoryCredentialStore::new());
    let bridge = bridge(&hub, &store);
    let lamp = DeviceId::new("lamp");

    let coalescer = bridge.coalescer();
    assert_eq!(coalescer.on_property_changed(&lamp, "level", json!(10)), Admission::Started);
    assert_eq!(coalescer.on_property_changed(&lamp, "on", json!(true)), Admission::Merged);
    assert_eq!(coalescer.on_property_changed(&lamp, "level", json!(80)), Admission::Merged);
    settle(&bridge).await;

    assert_eq!(hub.event_bodies(), vec![r#"{"on":true,"level":80}"#]);
}

#[tokio::test]
async fn back_to_back_updates_share_the_pending_batch() {
    // Single-threaded runtime: the first flush task cannot start until
    // this task yields, so the second update lands in the pending batch.
    let hub = FakeHub::holding_opens();
    let store = Arc::new(MemoryCredentialStore::new());
    let bridge = bridge(&hub, &store);
    let lamp = DeviceId::new("lamp");

    let first = bridge.deliver(&lamp, change("a", json!(1))).await;
    let second = bridge.deliver(&lamp, change("b", json!(2))).await;
    assert_eq!(first, Some(Admission::Started));
    assert_eq!(second, Some(Admission::Merged));

    // Once the flush has started the table is empty again.
    hub.open_entered.notified().await;
    assert!(bridge.coalescer().pending(&lamp).is_none());
    let third = bridge.deliver(&lamp, change("c", json!(3))).await;
    assert_eq!(third, Some(Admission::Started));

    hub.release_opens(1);
    settle(&bridge).await;

    assert_eq!(hub.event_bodies(), vec![r#"{"a":1,"b":2}"#, r#"{"c":3}"#]);
}

// ── Twin sync ───────────────────────────────────────────────────────

#[tokio::test]
async fn twin_is_fetched_once_and_patched_per_batch() {
    let hub = FakeHub::new();
    let store = Arc::new(MemoryCredentialStore::new());
    let mut config = config();
    config.sync_twin = true;
    let bridge = bridge_with(&hub, &store, FakeGateway::default(), &config);
    let lamp = DeviceId::new("lamp");

    bridge.deliver(&lamp, change("temperature", json!(21))).await;
    settle(&bridge).await;
    bridge.deliver(&lamp, change("temperature", json!(22))).await;
    settle(&bridge).await;

    assert_eq!(hub.twin_fetches(), 1);
    assert_eq!(
        hub.patches(),
        vec![
            (lamp.clone(), json!({"temperature": 21})),
            (lamp, json!({"temperature": 22})),
        ]
    );
    assert_eq!(hub.events().len(), 2);
}

#[tokio::test]
async fn failed_twin_fetch_recreates_identity_once() {
    let hub = FakeHub::new();
    hub.twin_failures.store(1, Ordering::SeqCst);
    let store = Arc::new(MemoryCredentialStore::new());
    let bridge = bridge_with(&hub, &store, FakeGateway::default(), &twin_sync_config());
    let lamp = DeviceId::new("lamp");

    bridge.deliver(&lamp, change("temperature", json!(21))).await;
    settle(&bridge).await;

    assert_eq!(hub.creates().len(), 2);
    assert_eq!(hub.opens(), vec![(lamp.clone(), true), (lamp.clone(), true)]);
    assert_eq!(hub.twin_fetches(), 2);
    assert_eq!(hub.patches(), vec![(lamp, json!({"temperature": 21}))]);

    let new_key = stored_key(&store, "lamp").await.unwrap();
    assert_eq!(Some(new_key.clone()), hub.key_of("lamp"));

    // The next batch goes out on the replacement session.
    bridge.deliver(&DeviceId::new("lamp"), change("temperature", json!(22))).await;
    settle(&bridge).await;
    let events = hub.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].1, new_key);
    assert_eq!(hub.opens().len(), 2);
}

#[tokio::test]
async fn second_twin_fetch_failure_is_not_retried() {
    let hub = FakeHub::new();
    hub.twin_failures.store(usize::MAX, Ordering::SeqCst);
    let store = Arc::new(MemoryCredentialStore::new());
    let sink = hub_sink(&hub, &store);
    let lamp = DeviceId::new("lamp");

    let report = sink
        .flush(&lamp, Batch::single("temperature", json!(21)))
        .await;

    assert!(report.telemetry.is_ok());
    assert!(matches!(
        report.twin,
        Some(Err(CoreError::ProvisioningFailed { .. }))
    ));
    assert_eq!(hub.creates().len(), 2);
    assert_eq!(hub.opens().len(), 2);
    assert_eq!(hub.twin_fetches(), 2);
    assert!(hub.patches().is_empty());
    assert_eq!(stored_key(&store, "lamp").await, hub.key_of("lamp"));
}

#[tokio::test]
async fn twin_is_patched_when_telemetry_fails() {
    let hub = FakeHub::new();
    hub.fail_sends.store(true, Ordering::SeqCst);
    let store = Arc::new(MemoryCredentialStore::new());
    let sink = hub_sink(&hub, &store);
    let lamp = DeviceId::new("lamp");

    let report = sink.flush(&lamp, Batch::single("on", json!(true))).await;

    assert!(matches!(report.telemetry, Err(CoreError::Transport { .. })));
    assert!(matches!(report.twin, Some(Ok(()))));
    assert!(hub.events().is_empty());
    assert_eq!(hub.patches(), vec![(lamp, json!({"on": true}))]);
}

#[tokio::test]
async fn closed_session_skips_twin_without_rotating_keys() {
    let hub = FakeHub::new();
    hub.close_next_send.store(true, Ordering::SeqCst);
    let store = Arc::new(MemoryCredentialStore::new());
    let bridge = bridge_with(&hub, &store, FakeGateway::default(), &twin_sync_config());
    let lamp = DeviceId::new("lamp");

    bridge.deliver(&lamp, change("on", json!(true))).await;
    settle(&bridge).await;

    assert_eq!(hub.twin_fetches(), 0);
    assert!(hub.patches().is_empty());
    assert_eq!(hub.creates().len(), 1);
    assert_eq!(hub.opens().len(), 1);

    bridge.deliver(&lamp, change("on", json!(false))).await;
    settle(&bridge).await;

    assert_eq!(hub.creates().len(), 1);
    assert_eq!(hub.opens().len(), 2);
    assert_eq!(hub.twin_fetches(), 1);
    assert_eq!(hub.patches(), vec![(lamp, json!({"on": false}))]);
}

#[tokio::test]
async fn closed_session_is_rebuilt_on_next_flush() {
    let hub = FakeHub::new();
    let store = Arc::new(MemoryCredentialStore::new());
    let bridge = bridge(&hub, &store);
    let lamp = DeviceId::new("lamp");

    hub.close_next_send.store(true, Ordering::SeqCst);
    bridge.deliver(&lamp, change("on", json!(true))).await;
    settle(&bridge).await;
    assert!(hub.events().is_empty());

    bridge.deliver(&lamp, change("on", json!(false))).await;
    settle(&bridge).await;

    assert_eq!(hub.opens().len(), 2);
    assert_eq!(hub.creates().len(), 1);
    assert_eq!(hub.event_bodies(), vec![r#"{"on":false}"#]);
}

// ── Status gating ───────────────────────────────────────────────────

#[tokio::test]
async fn disabled_device_has_no_side_effects() {
    let hub = FakeHub::new();
    hub.set_status("lamp", IdentityStatus::Disabled);
    let store = Arc::new(MemoryCredentialStore::new());
    let bridge = bridge(&hub, &store);
    let lamp = DeviceId::new("lamp");

    let admission = bridge.deliver(&lamp, change("on", json!(true))).await;
    settle(&bridge).await;

    assert_eq!(admission, None);
    assert!(bridge.coalescer().pending(&lamp).is_none());
    assert!(hub.creates().is_empty());
    assert!(hub.opens().is_empty());
    assert!(store.is_empty());
}

#[tokio::test(start_paused = true)]
async fn status_is_checked_at_most_once_per_interval() {
    let hub = FakeHub::new();
    let store = Arc::new(MemoryCredentialStore::new());
    let mut config = config();
    config.min_status_check_interval = Some(Duration::from_secs(60));
    let bridge = bridge_with(&hub, &store, FakeGateway::default(), &config);
    let lamp = DeviceId::new("lamp");

    bridge.deliver(&lamp, change("a", json!(1))).await;
    tokio::time::advance(Duration::from_secs(10)).await;
    bridge.deliver(&lamp, change("b", json!(2))).await;
    settle(&bridge).await;

    assert_eq!(hub.list_calls.load(Ordering::SeqCst), 1);
}

// ── Orchestration ───────────────────────────────────────────────────

#[tokio::test]
async fn start_attaches_things_and_skips_unreachable_ones() {
    let hub = FakeHub::new();
    let store = Arc::new(MemoryCredentialStore::new());
    let (gateway, lamp_tx) = FakeGateway::default().with_thing("living room/lamp");
    let gateway = gateway.with_unreachable_thing("broken");
    let bridge = bridge_with(&hub, &store, gateway, &config());

    let report = bridge.start().await.unwrap();
    assert_eq!(report.attached, vec![DeviceId::new("living_room_lamp")]);
    assert_eq!(report.failed, vec![DeviceId::new("broken")]);
    assert_eq!(hub.list_calls.load(Ordering::SeqCst), 1);

    lamp_tx.send(change("on", json!(true))).await.unwrap();
    for _ in 0..200 {
        if !hub.events().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    bridge.shutdown().await;

    let events = hub.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, DeviceId::new("living_room_lamp"));
    assert_eq!(events[0].2, json!({"on": true}));
}

#[tokio::test]
async fn run_returns_after_cancellation() {
    let hub = FakeHub::new();
    let store = Arc::new(MemoryCredentialStore::new());
    let (gateway, _tx) = FakeGateway::default().with_thing("lamp");
    let bridge = bridge_with(&hub, &store, gateway, &config());

    let token = bridge.cancellation_token();
    let runner = tokio::spawn({
        let bridge = bridge.clone();
        async move { bridge.run().await }
    });
    token.cancel();

    runner.await.unwrap().unwrap();
}
