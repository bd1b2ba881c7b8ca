// ── Bridge orchestrator ──
//
// Wires every thing's property stream through the status gate into the
// coalescer. One dispatch task per thing keeps that thing's updates in
// arrival order.

use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::coalescer::{Admission, BatchSink, HubSink, UpdateCoalescer};
use crate::config::BridgeConfig;
use crate::connection::ConnectionCache;
use crate::error::CoreError;
use crate::hub::{
    CredentialStore, HubTransport, IdentityRegistry, PropertyChange, PropertySubscription,
    ThingHandle, ThingSource,
};
use crate::model::DeviceId;
use crate::provision::Provisioner;
use crate::status::StatusGate;

/// The outside world as seen by a bridge.
#[derive(Clone)]
pub struct Collaborators {
    pub registry: Arc<dyn IdentityRegistry>,
    pub transport: Arc<dyn HubTransport>,
    pub credentials: Arc<dyn CredentialStore>,
    pub things: Arc<dyn ThingSource>,
}

/// Summary of [`Bridge::start`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartReport {
    /// Things whose property stream is being dispatched.
    pub attached: Vec<DeviceId>,
    /// Things that could not be subscribed to.
    pub failed: Vec<DeviceId>,
}

/// Forwards thing property changes to the hub.
///
/// Cheaply cloneable via `Arc<BridgeInner>`.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    things: Arc<dyn ThingSource>,
    gate: StatusGate,
    coalescer: UpdateCoalescer,
    cache: Option<Arc<ConnectionCache>>,
    cancel: CancellationToken,
    dispatchers: TaskTracker,
}

impl Bridge {
    /// Assemble the engine from its collaborators.
    pub fn new(config: &BridgeConfig, collaborators: Collaborators) -> Self {
        let provisioner = Provisioner::new(
            Arc::clone(&collaborators.registry),
            collaborators.credentials,
            config.new_identity_status,
        );
        let cache = Arc::new(ConnectionCache::new(
            config.hub_host.clone(),
            collaborators.transport,
            provisioner,
            config.operation_timeout,
        ));
        let sink = Arc::new(HubSink::new(Arc::clone(&cache), config.sync_twin));
        let gate = StatusGate::new(
            collaborators.registry,
            config.min_status_check_interval,
            config.operation_timeout,
        );

        Self::assemble(collaborators.things, gate, UpdateCoalescer::new(sink), Some(cache))
    }

    /// Assemble around a custom batch sink.
    pub fn with_sink(
        things: Arc<dyn ThingSource>,
        gate: StatusGate,
        sink: Arc<dyn BatchSink>,
    ) -> Self {
        Self::assemble(things, gate, UpdateCoalescer::new(sink), None)
    }

    fn assemble(
        things: Arc<dyn ThingSource>,
        gate: StatusGate,
        coalescer: UpdateCoalescer,
        cache: Option<Arc<ConnectionCache>>,
    ) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                things,
                gate,
                coalescer,
                cache,
                cancel: CancellationToken::new(),
                dispatchers: TaskTracker::new(),
            }),
        }
    }

    pub fn status_gate(&self) -> &StatusGate {
        &self.inner.gate
    }

    pub fn coalescer(&self) -> &UpdateCoalescer {
        &self.inner.coalescer
    }

    /// Token that stops the bridge when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Refresh device status, list things, and start one dispatch task
    /// per thing. Failing things are logged and skipped.
    pub async fn start(&self) -> Result<StartReport, CoreError> {
        if let Err(e) = self.inner.gate.refresh(Instant::now()).await {
            warn!(error = %e, "initial device status check failed");
        }

        let things = self.inner.things.list_things().await?;
        info!(count = things.len(), "discovered things");

        let mut report = StartReport::default();
        for thing in things {
            let device_id = DeviceId::from_thing_id(thing.id());
            match self.attach(&device_id, thing.as_ref()).await {
                Ok(()) => report.attached.push(device_id),
                Err(e) => {
                    warn!(thing_id = thing.id(), error = %e, "could not connect to thing");
                    report.failed.push(device_id);
                }
            }
        }
        Ok(report)
    }

    /// Start, then run until cancelled.
    pub async fn run(&self) -> Result<(), CoreError> {
        self.start().await?;
        self.inner.cancel.cancelled().await;
        self.shutdown().await;
        Ok(())
    }

    /// Stop dispatching, drain in-flight flushes, and close sessions.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.dispatchers.close();
        self.inner.dispatchers.wait().await;
        self.inner.coalescer.shutdown().await;
        if let Some(cache) = &self.inner.cache {
            cache.close_all().await;
        }
        debug!("bridge stopped");
    }

    /// Route one property change: refresh the status snapshot if stale,
    /// drop it for a disabled device, otherwise hand it to the coalescer.
    ///
    /// Returns `None` when the update was dropped.
    pub async fn deliver(&self, device_id: &DeviceId, change: PropertyChange) -> Option<Admission> {
        deliver(&self.inner, device_id, change).await
    }

    async fn attach(&self, device_id: &DeviceId, thing: &dyn ThingHandle) -> Result<(), CoreError> {
        let subscription = thing.connect(self.inner.cancel.child_token()).await?;
        info!(thing = thing.title(), device_id = %device_id, "connected to thing");

        let inner = Arc::clone(&self.inner);
        let device_id = device_id.clone();
        self.inner
            .dispatchers
            .spawn(dispatch(inner, device_id, subscription));
        Ok(())
    }
}

async fn dispatch(inner: Arc<BridgeInner>, device_id: DeviceId, mut subscription: PropertySubscription) {
    let cancel = inner.cancel.clone();
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            change = subscription.recv() => {
                let Some(change) = change else { break };
                deliver(&inner, &device_id, change).await;
            }
        }
    }
    debug!(device_id = %device_id, "dispatch stopped");
}

async fn deliver(inner: &BridgeInner, device_id: &DeviceId, change: PropertyChange) -> Option<Admission> {
    if let Err(e) = inner.gate.refresh_if_stale(Instant::now()).await {
        warn!(error = %e, "device status check failed, keeping previous snapshot");
    }

    debug!(device_id = %device_id, property = %change.property, value = %change.value, "property changed");
    if inner.gate.is_disabled(device_id) {
        debug!(device_id = %device_id, "device is not enabled, ignoring update");
        return None;
    }

    Some(
        inner
            .coalescer
            .on_property_changed(device_id, &change.property, change.value),
    )
}
