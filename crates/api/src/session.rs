//! One connected client: cluster credentials, orchestrator and event buffer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use meshd_apply::Applier;
use meshd_core::Event;
use meshd_kubehub::{KubeResourceClient, ResourceClient};
use meshd_ops::{Collaborators, OpsConfig, Orchestrator};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::buffer::{EventBuffer, DEFAULT_CAPACITY};
use crate::{EventSender, MeshError, MeshResult};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub queue_cap: usize,
    pub ops: OpsConfig,
}

impl Default for SessionConfig {
    fn default() -> Self { Self { queue_cap: DEFAULT_CAPACITY, ops: OpsConfig::default() } }
}

impl SessionConfig {
    pub fn from_env() -> Self {
        Self {
            queue_cap: std::env::var("MESHD_EVENT_QUEUE_CAP")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_CAPACITY),
            ops: OpsConfig::from_env(),
        }
    }
}

pub struct Session {
    orchestrator: Orchestrator,
    events: Arc<EventBuffer>,
    streaming: AtomicBool,
    cancel: CancellationToken,
    context: Option<String>,
}

/// Clears the single-consumer flag when a delivery loop ends.
struct ConsumerGuard<'a>(&'a AtomicBool);

impl Drop for ConsumerGuard<'_> {
    fn drop(&mut self) { self.0.store(false, Ordering::Release); }
}

/// An event taken from the buffer but not yet confirmed by the sender.
/// Goes back to the head of the buffer on drop, including when the delivery
/// future itself is dropped mid-send.
struct Unacked<'a> {
    events: &'a EventBuffer,
    event: Event,
    acked: bool,
}

impl<'a> Unacked<'a> {
    fn new(events: &'a EventBuffer, event: Event) -> Self { Self { events, event, acked: false } }

    fn event(&self) -> &Event { &self.event }

    fn acked(mut self) { self.acked = true; }
}

impl Drop for Unacked<'_> {
    fn drop(&mut self) {
        if !self.acked {
            debug!(op_id = %self.event.operation_id, "requeueing undelivered event");
            counter!("events_redelivered_total", 1u64);
            self.events.requeue_front(self.event.clone());
        }
    }
}

impl Session {
    /// Connect using raw kubeconfig bytes; empty bytes use the ambient configuration.
    pub async fn connect(kubeconfig: &[u8], context: Option<&str>, cfg: &SessionConfig) -> anyhow::Result<Self> {
        let client = meshd_kubehub::connect(kubeconfig, context).await?;
        let context = context.filter(|c| !c.is_empty()).map(str::to_string);
        let parts = Collaborators::from_config(&cfg.ops, kubeconfig.to_vec(), context.clone()).context("building manifest sources")?;
        let mut session = Self::with_parts(Arc::new(KubeResourceClient::new(client)), parts, cfg);
        session.context = context;
        Ok(session)
    }

    /// Session over any cluster seam and manifest sources.
    pub fn with_parts(client: Arc<dyn ResourceClient>, parts: Collaborators, cfg: &SessionConfig) -> Self {
        let events = Arc::new(EventBuffer::with_capacity(cfg.queue_cap));
        let cancel = CancellationToken::new();
        let orchestrator = Orchestrator::new(Applier::new(client), parts, events.clone(), cfg.ops.max_inflight, cancel.child_token());
        Self { orchestrator, events, streaming: AtomicBool::new(false), cancel, context: None }
    }

    pub fn orchestrator(&self) -> &Orchestrator { &self.orchestrator }

    pub fn events(&self) -> &Arc<EventBuffer> { &self.events }

    pub fn context(&self) -> Option<&str> { self.context.as_deref() }

    /// Stop background operations and any delivery loop.
    pub fn shutdown(&self) {
        info!(inflight = self.orchestrator.inflight(), pending_events = self.events.len(), "session shutting down");
        self.cancel.cancel();
    }

    pub fn is_shut_down(&self) -> bool { self.cancel.is_cancelled() }

    /// Deliver buffered events to `out` until a send fails or the session shuts down.
    /// An event whose send fails or is abandoned goes back to the head of the buffer
    /// for the next consumer.
    pub async fn deliver(&self, out: &mut dyn EventSender) -> MeshResult<()> {
        if self.streaming.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Err(MeshError::Unavailable("another consumer is already streaming events".into()));
        }
        let _guard = ConsumerGuard(&self.streaming);
        debug!("waiting on event stream");
        while let Some(ev) = self.events.next(&self.cancel).await {
            debug!(op_id = %ev.operation_id, severity = %ev.severity, "sending event");
            let pending = Unacked::new(&self.events, ev);
            if let Err(e) = out.send(pending.event()).await {
                drop(pending);
                error!(error = %e, "unable to send event");
                return Err(MeshError::Stream(format!("unable to send event: {:#}", e)));
            }
            pending.acked();
        }
        info!("event stream closed by shutdown");
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) { self.cancel.cancel(); }
}
