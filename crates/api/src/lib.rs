//! meshd public API façade (in-process).
//!
//! [`MeshApi`] is the surface a transport exposes to remote clients: create an instance
//! from kubeconfig bytes, run operations, list them, stream outcome events and report
//! the mesh name. [`Adapter`] implements it over a [`Session`].

#![forbid(unsafe_code)]

use std::sync::{Arc, RwLock};
use std::time::Instant;

use meshd_core::{Event, OperationAck, OperationRequest, SupportedOperation, MESH_NAME};
use meshd_ops::OpsError;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

pub mod buffer;
pub mod session;

pub use buffer::EventBuffer;
pub use meshd_ops::EventSink;
pub use session::{Session, SessionConfig};

/// API errors suitable for transport over RPC.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum MeshError {
    #[error("mesh client has not been created")]
    NotInitialized,
    #[error("validation: {0}")]
    Validation(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("internal: {0}")]
    Internal(String),
    #[error("stream: {0}")]
    Stream(String),
}

pub type MeshResult<T> = Result<T, MeshError>;

impl From<OpsError> for MeshError {
    fn from(e: OpsError) -> Self {
        match e {
            OpsError::Validation(m) => MeshError::Validation(m),
            OpsError::Busy(m) => MeshError::Unavailable(m),
            other => MeshError::Internal(other.to_string()),
        }
    }
}

/// Outbound half of an event stream, implemented by the transport.
#[async_trait::async_trait]
pub trait EventSender: Send {
    async fn send(&mut self, event: &Event) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
impl EventSender for tokio::sync::mpsc::Sender<Event> {
    async fn send(&mut self, event: &Event) -> anyhow::Result<()> {
        tokio::sync::mpsc::Sender::send(self, event.clone()).await.map_err(|_| anyhow::anyhow!("event receiver closed"))
    }
}

#[async_trait::async_trait]
pub trait MeshApi: Send + Sync {
    /// Establish cluster credentials and a fresh event buffer. Replaces any previous session.
    async fn create_instance(&self, kubeconfig: &[u8], context: Option<&str>) -> MeshResult<()>;

    /// Validate and run an operation. Background operations return at once; their
    /// outcome arrives through [`MeshApi::stream_events`].
    async fn apply_operation(&self, req: OperationRequest) -> MeshResult<OperationAck>;

    async fn supported_operations(&self) -> MeshResult<Vec<SupportedOperation>>;

    /// Deliver events until a send fails (the event is kept for the next stream) or the
    /// session shuts down.
    async fn stream_events(&self, out: &mut dyn EventSender) -> MeshResult<()>;

    fn mesh_name(&self) -> &'static str { MESH_NAME }
}

/// In-process implementation holding at most one live session.
pub struct Adapter {
    session: RwLock<Option<Arc<Session>>>,
    config: SessionConfig,
}

impl Default for Adapter {
    fn default() -> Self { Self::new(SessionConfig::from_env()) }
}

impl Adapter {
    pub fn new(config: SessionConfig) -> Self { Self { session: RwLock::new(None), config } }

    pub fn config(&self) -> &SessionConfig { &self.config }

    /// Install a prebuilt session, shutting down the one it replaces.
    pub fn install(&self, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        let previous = match self.session.write() {
            Ok(mut slot) => slot.replace(session.clone()),
            Err(poisoned) => poisoned.into_inner().replace(session.clone()),
        };
        if let Some(old) = previous {
            old.shutdown();
        }
        session
    }

    pub fn session(&self) -> MeshResult<Arc<Session>> {
        let slot = self.session.read().map_err(|_| MeshError::Internal("session lock poisoned".into()))?;
        slot.clone().ok_or(MeshError::NotInitialized)
    }

    pub fn shutdown(&self) {
        if let Ok(slot) = self.session.read() {
            if let Some(s) = slot.as_ref() {
                s.shutdown();
            }
        }
    }
}

#[async_trait::async_trait]
impl MeshApi for Adapter {
    async fn create_instance(&self, kubeconfig: &[u8], context: Option<&str>) -> MeshResult<()> {
        let t0 = Instant::now();
        info!(context = ?context, "api: create_instance start");
        let session = Session::connect(kubeconfig, context, &self.config).await.map_err(|e| {
            error!(error = %format!("{:#}", e), "api: create_instance failed");
            MeshError::Unavailable(format!("unable to create a new {} client: {:#}", MESH_NAME.to_lowercase(), e))
        })?;
        self.install(session);
        info!(took_ms = %t0.elapsed().as_millis(), "api: create_instance ok");
        Ok(())
    }

    async fn apply_operation(&self, req: OperationRequest) -> MeshResult<OperationAck> {
        let t0 = Instant::now();
        let session = self.session()?;
        info!(op_id = %req.operation_id, op = %req.op_name, ns = %req.namespace, delete = req.delete_op, "api: apply_operation start");
        let ack = session.orchestrator().apply_operation(req).await.map_err(|e| {
            error!(error = %e, "api: apply_operation failed");
            MeshError::from(e)
        })?;
        info!(op_id = %ack.operation_id, took_ms = %t0.elapsed().as_millis(), "api: apply_operation ok");
        Ok(ack)
    }

    async fn supported_operations(&self) -> MeshResult<Vec<SupportedOperation>> { Ok(meshd_ops::supported_operations()) }

    async fn stream_events(&self, out: &mut dyn EventSender) -> MeshResult<()> {
        let session = self.session()?;
        session.deliver(out).await
    }
}
