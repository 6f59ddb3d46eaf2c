//! meshd ops: the operation orchestrator.
//!
//! Maps a named operation to a manifest source and a post-apply action. The custom
//! operation applies synchronously; install and sample-application operations return an
//! acknowledgment at once and report their outcome as an [`Event`] through an
//! [`EventSink`]. Background work is bounded by a permit pool and a per-operation-id guard.

#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use meshd_apply::{ports, Applier, ApplyError};
use meshd_core::{Event, OperationAck, OperationRequest, SupportedOperation, DEFAULT_NAMESPACE, MESH_NAME};
use metrics::counter;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod fetch;
pub mod inject;
pub mod installer;
pub mod registry;
pub mod templates;

pub use fetch::{HttpFetcher, ManifestFetcher};
pub use installer::{Installer, LinkerdCli};
pub use registry::{Descriptor, ManifestSource, SampleApp};
pub use templates::{TemplateVars, Templates};

#[derive(Debug, thiserror::Error)]
pub enum OpsError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Busy(String),
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error("{0:#}")]
    Manifest(anyhow::Error),
}

/// Receives operation outcome events. Must not block.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: Event);
}

/// Orchestrator settings read from the environment.
#[derive(Debug, Clone)]
pub struct OpsConfig {
    pub max_inflight: usize,
    pub installer_bin: String,
    pub installer_ns_flag: String,
    pub template_dir: Option<PathBuf>,
    pub cache_dir: PathBuf,
}

impl Default for OpsConfig {
    fn default() -> Self {
        Self {
            max_inflight: 4,
            installer_bin: "linkerd".into(),
            installer_ns_flag: "--namespace".into(),
            template_dir: None,
            cache_dir: std::env::temp_dir().join("meshd-manifests"),
        }
    }
}

impl OpsConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_inflight: std::env::var("MESHD_MAX_INFLIGHT_OPS")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(d.max_inflight),
            installer_bin: std::env::var("MESHD_INSTALLER_BIN").ok().filter(|s| !s.is_empty()).unwrap_or(d.installer_bin),
            installer_ns_flag: std::env::var("MESHD_INSTALLER_NS_FLAG").ok().filter(|s| !s.is_empty()).unwrap_or(d.installer_ns_flag),
            template_dir: std::env::var("MESHD_TEMPLATE_DIR").ok().filter(|s| !s.is_empty()).map(PathBuf::from),
            cache_dir: std::env::var("MESHD_MANIFEST_CACHE_DIR").ok().filter(|s| !s.is_empty()).map(PathBuf::from).unwrap_or(d.cache_dir),
        }
    }
}

/// Manifest producers used by the orchestrator.
#[derive(Clone)]
pub struct Collaborators {
    pub installer: Arc<dyn Installer>,
    pub fetcher: Arc<dyn ManifestFetcher>,
    pub templates: Templates,
}

impl Collaborators {
    /// Real collaborators; `kubeconfig` and `context` are handed to the installer.
    pub fn from_config(cfg: &OpsConfig, kubeconfig: Vec<u8>, context: Option<String>) -> anyhow::Result<Self> {
        Ok(Self {
            installer: Arc::new(LinkerdCli::new(cfg.installer_bin.clone(), cfg.installer_ns_flag.clone(), kubeconfig, context)),
            fetcher: Arc::new(HttpFetcher::new(cfg.cache_dir.clone())?),
            templates: Templates::new(cfg.template_dir.clone()),
        })
    }
}

pub fn supported_operations() -> Vec<SupportedOperation> { registry::supported_operations() }

/// Held by a background operation; frees its permit and operation id on drop.
struct InFlight {
    id: String,
    ids: Arc<Mutex<HashSet<String>>>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Ok(mut ids) = self.ids.lock() {
            ids.remove(&self.id);
        }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    applier: Applier,
    parts: Collaborators,
    sink: Arc<dyn EventSink>,
    permits: Arc<Semaphore>,
    inflight: Arc<Mutex<HashSet<String>>>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(applier: Applier, parts: Collaborators, sink: Arc<dyn EventSink>, max_inflight: usize, cancel: CancellationToken) -> Self {
        Self {
            applier,
            parts,
            sink,
            permits: Arc::new(Semaphore::new(max_inflight.max(1))),
            inflight: Arc::new(Mutex::new(HashSet::new())),
            cancel,
        }
    }

    /// Number of background operations currently running.
    pub fn inflight(&self) -> usize { self.inflight.lock().map(|ids| ids.len()).unwrap_or(0) }

    pub async fn apply_operation(&self, mut req: OperationRequest) -> Result<OperationAck, OpsError> {
        let Some(desc) = registry::descriptor(&req.op_name) else {
            counter!("ops_rejected_total", 1u64, "reason" => "unknown_op");
            return Err(OpsError::Validation(format!(
                "operation id: {}, error: {} is not a valid operation name",
                req.operation_id, req.op_name
            )));
        };
        if req.namespace.trim().is_empty() {
            req.namespace = DEFAULT_NAMESPACE.to_string();
        }
        let ack = OperationAck { operation_id: req.operation_id.clone() };

        match desc.source {
            ManifestSource::RequestBody => {
                let body = req.custom_body.as_deref().unwrap_or("");
                if body.trim().is_empty() {
                    counter!("ops_rejected_total", 1u64, "reason" => "empty_body");
                    return Err(OpsError::Validation(format!(
                        "operation id: {}, error: yaml body is empty for {} operation",
                        req.operation_id, req.op_name
                    )));
                }
                counter!("ops_started_total", 1u64, "op" => desc.key);
                let t0 = Instant::now();
                let report = self.applier.apply_manifest(body, &req.namespace, req.delete_op, &self.cancel).await?;
                info!(op_id = %req.operation_id, op = desc.key, summary = %report.summary(), took_ms = %t0.elapsed().as_millis(), "custom manifest applied");
                Ok(ack)
            }
            ManifestSource::Installer => {
                let guard = self.admit(&req.operation_id)?;
                counter!("ops_started_total", 1u64, "op" => desc.key);
                let this = self.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    this.run_install(req).await;
                });
                Ok(ack)
            }
            ManifestSource::Template(name) => {
                let vars = TemplateVars { namespace: &req.namespace, user_name: req.username.as_deref().unwrap_or("") };
                let yaml = self.parts.templates.render(name, &vars).await.map_err(OpsError::Manifest)?;
                self.spawn_sample(desc, req, yaml)?;
                Ok(ack)
            }
            ManifestSource::Remote { url, cache_name } => {
                let yaml = self.parts.fetcher.fetch(url, cache_name).await.map_err(OpsError::Manifest)?;
                self.spawn_sample(desc, req, yaml)?;
                Ok(ack)
            }
        }
    }

    fn admit(&self, operation_id: &str) -> Result<InFlight, OpsError> {
        let mut ids = self.inflight.lock().map_err(|_| OpsError::Busy("operation registry unavailable".into()))?;
        if ids.contains(operation_id) {
            counter!("ops_rejected_total", 1u64, "reason" => "duplicate");
            return Err(OpsError::Validation(format!("operation id: {} is already running", operation_id)));
        }
        let permit = self.permits.clone().try_acquire_owned().map_err(|_| {
            counter!("ops_rejected_total", 1u64, "reason" => "busy");
            warn!(op_id = %operation_id, "too many operations in flight");
            OpsError::Busy(format!("operation id: {}, error: too many operations in flight, retry later", operation_id))
        })?;
        ids.insert(operation_id.to_string());
        Ok(InFlight { id: operation_id.to_string(), ids: self.inflight.clone(), _permit: permit })
    }

    fn spawn_sample(&self, desc: &'static Descriptor, req: OperationRequest, yaml: String) -> Result<(), OpsError> {
        let Some(app) = desc.sample else {
            return Err(OpsError::Validation(format!("operation {} has no sample application", desc.key)));
        };
        let guard = self.admit(&req.operation_id)?;
        counter!("ops_started_total", 1u64, "op" => desc.key);
        let this = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            this.run_sample(app, req, yaml).await;
        });
        Ok(())
    }

    async fn run_install(&self, req: OperationRequest) {
        let t0 = Instant::now();
        let work = async {
            let yaml = self.parts.installer.manifest(&req.namespace, req.delete_op).await.map_err(OpsError::Manifest)?;
            self.applier.apply_manifest(&yaml, &req.namespace, req.delete_op, &self.cancel).await?;
            Ok::<_, OpsError>(())
        };
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(OpsError::Apply(ApplyError::Cancelled)),
            r = work => r,
        };
        match result {
            Ok(()) => {
                info!(op_id = %req.operation_id, delete = req.delete_op, took_ms = %t0.elapsed().as_millis(), "{} {}", MESH_NAME, req.past());
                self.sink.publish(Event::info(
                    &req.operation_id,
                    format!("{} {} successfully", MESH_NAME, req.past()),
                    format!("The latest version of {} is now {}.", MESH_NAME, req.past()),
                ));
            }
            Err(OpsError::Apply(ApplyError::Cancelled)) => info!(op_id = %req.operation_id, "install cancelled"),
            Err(e) => {
                error!(op_id = %req.operation_id, error = %e, "install failed");
                self.sink.publish(Event::error(&req.operation_id, format!("Error while {} {}", req.progressive(), MESH_NAME), e.to_string()));
            }
        }
    }

    async fn run_sample(&self, app: SampleApp, req: OperationRequest, yaml: String) {
        let t0 = Instant::now();
        let work = async {
            if !req.delete_op {
                inject::label_for_injection(&self.applier, &self.parts.templates, &req.namespace, &self.cancel).await?;
            }
            self.applier.apply_manifest(&yaml, &req.namespace, req.delete_op, &self.cancel).await?;
            Ok::<_, OpsError>(())
        };
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(OpsError::Apply(ApplyError::Cancelled)),
            r = work => r,
        };
        match result {
            Ok(()) => {}
            Err(OpsError::Apply(ApplyError::Cancelled)) => {
                info!(op_id = %req.operation_id, app = app.app_name, "operation cancelled");
                return;
            }
            Err(e) => {
                error!(op_id = %req.operation_id, app = app.app_name, error = %e, "sample application failed");
                self.sink.publish(Event::error(
                    &req.operation_id,
                    format!("Error while {} the canonical {}", req.progressive(), app.app_name),
                    e.to_string(),
                ));
                return;
            }
        }

        let ports = if req.delete_op {
            Vec::new()
        } else {
            match ports::service_ports(&self.applier, app.service, &req.namespace).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(op_id = %req.operation_id, service = app.service, error = %e, "port lookup failed");
                    self.sink.publish(Event::warn(
                        &req.operation_id,
                        format!("{} is deployed but unable to retrieve the port info for the service at the moment", app.app_name),
                        e.to_string(),
                    ));
                    return;
                }
            }
        };
        let details = format!("{} is now {}. {}", app.app_name, req.past(), ports::port_message(&ports));
        debug!(op_id = %req.operation_id, ports = ?ports, "sample application ports");
        info!(op_id = %req.operation_id, app = app.app_name, took_ms = %t0.elapsed().as_millis(), "sample application {}", req.past());
        self.sink.publish(Event::info(&req.operation_id, format!("{} {} successfully", app.app_name, req.past()), details.trim_end()));
    }
}
