//! meshd apply: decode multi-document manifests and create or cascade-delete them in order.
//!
//! Each allow-listed document is resolved through live discovery, then created
//! (AlreadyExists counts as success) or deleted with foreground propagation (NotFound
//! counts as success). Namespace deletes are deferred to the end of the batch and the
//! `default` namespace is never deleted. Any other failure aborts the rest of the batch;
//! objects applied before it stay applied.

#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use kube::api::{DeleteParams, PropagationPolicy};
use kube::core::{DynamicObject, GroupVersionKind};
use meshd_core::{AllowedKind, DEFAULT_NAMESPACE};
use meshd_kubehub::{gvk_key, ResourceClient, ResourceMapping};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod decode;
pub mod ports;

pub use decode::{DecodedDocument, SkipReason, Skipped};

/// Grace period for cluster-scoped deletes.
const CLUSTER_DELETE_GRACE_SECS: u32 = 1;

fn max_batch_bytes() -> usize {
    std::env::var("MESHD_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(8 * 1024 * 1024)
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("resource mapping for {gvk} could not be resolved: {source:#}")]
    Discovery {
        gvk: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("{verb} {target} failed: {source}")]
    Mutation {
        verb: &'static str,
        target: String,
        #[source]
        source: kube::Error,
    },
    #[error("unable to retrieve {target}: {source}")]
    Lookup {
        target: String,
        #[source]
        source: kube::Error,
    },
    #[error("unable to read {target}: {message}")]
    Convert { target: String, message: String },
    #[error("manifest too large ({bytes} bytes, max {max})")]
    Oversized { bytes: usize, max: usize },
    #[error("operation cancelled")]
    Cancelled,
}

impl ApplyError {
    pub fn is_not_found(&self) -> bool {
        match self {
            ApplyError::Mutation { source, .. } | ApplyError::Lookup { source, .. } => is_not_found(source),
            _ => false,
        }
    }
}

pub fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 404)
}

pub fn is_already_exists(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Created,
    AlreadyExists,
    Deleted,
    AlreadyAbsent,
    /// The `default` namespace in a delete batch.
    Retained,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedDoc {
    pub index: usize,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    pub outcome: Outcome,
}

/// What happened to each document of a batch that did not abort.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub applied: Vec<AppliedDoc>,
    pub skipped: Vec<Skipped>,
}

impl BatchReport {
    pub fn summary(&self) -> String {
        let count = |o: Outcome| self.applied.iter().filter(|d| d.outcome == o).count();
        let mut parts = Vec::new();
        for (label, n) in [
            ("created", count(Outcome::Created)),
            ("already present", count(Outcome::AlreadyExists)),
            ("deleted", count(Outcome::Deleted)),
            ("already absent", count(Outcome::AlreadyAbsent)),
            ("retained", count(Outcome::Retained)),
            ("skipped", self.skipped.len()),
        ] {
            if n > 0 {
                parts.push(format!("{} {}", n, label));
            }
        }
        if parts.is_empty() { "no documents".to_string() } else { parts.join(", ") }
    }
}

fn describe(kind: &str, name: &str, namespace: Option<&str>) -> String {
    match namespace {
        Some(ns) => format!("{} {}/{}", kind, ns, name),
        None => format!("{} {}", kind, name),
    }
}

async fn guarded<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, ApplyError>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ApplyError::Cancelled),
        out = fut => Ok(out),
    }
}

/// Resource operator over any [`ResourceClient`].
#[derive(Clone)]
pub struct Applier {
    client: Arc<dyn ResourceClient>,
}

impl Applier {
    pub fn new(client: Arc<dyn ResourceClient>) -> Self { Self { client } }

    pub fn client(&self) -> &Arc<dyn ResourceClient> { &self.client }

    /// Apply every document of `yaml` in textual order.
    ///
    /// `namespace` is used for namespaced documents that carry no `metadata.namespace`.
    pub async fn apply_manifest(&self, yaml: &str, namespace: &str, delete: bool, cancel: &CancellationToken) -> Result<BatchReport, ApplyError> {
        let t0 = Instant::now();
        let max = max_batch_bytes();
        if yaml.len() > max {
            return Err(ApplyError::Oversized { bytes: yaml.len(), max });
        }
        let mut report = BatchReport::default();
        let mut deferred: Vec<(ResourceMapping, DecodedDocument)> = Vec::new();

        for result in decode::decode_manifest(yaml) {
            if cancel.is_cancelled() {
                return Err(ApplyError::Cancelled);
            }
            let doc = match result {
                Ok(doc) => doc,
                Err(skip) => {
                    match &skip.reason {
                        SkipReason::UnsupportedKind(kind) => warn!(index = skip.index, kind = %kind, "skipping object of unsupported kind"),
                        SkipReason::Decode(msg) => debug!(index = skip.index, error = %msg, "skipping undecodable document"),
                    }
                    counter!("apply_documents_total", 1u64, "outcome" => "skipped");
                    report.skipped.push(skip);
                    continue;
                }
            };
            let mapping = self.resolve(&doc.gvk, cancel).await?;

            if delete && !mapping.namespaced() && doc.kind == AllowedKind::Namespace {
                debug!(name = %doc.name(), "deferring namespace delete to end of batch");
                deferred.push((mapping, doc));
                continue;
            }
            let applied = self.apply_document(&mapping, &doc, namespace, delete, cancel).await?;
            counter!("apply_documents_total", 1u64, "outcome" => "applied");
            report.applied.push(applied);
        }

        if delete {
            for (mapping, doc) in deferred {
                let applied = self.delete_deferred_namespace(&mapping, &doc, cancel).await?;
                report.applied.push(applied);
            }
        }
        histogram!("apply_batch_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(delete, summary = %report.summary(), took_ms = %t0.elapsed().as_millis(), "manifest batch applied");
        Ok(report)
    }

    async fn resolve(&self, gvk: &GroupVersionKind, cancel: &CancellationToken) -> Result<ResourceMapping, ApplyError> {
        guarded(cancel, self.client.resolve(gvk)).await?.map_err(|source| {
            error!(gvk = %gvk_key(gvk), error = %source, "discovery failed; aborting batch");
            ApplyError::Discovery { gvk: gvk_key(gvk), source }
        })
    }

    async fn apply_document(&self, mapping: &ResourceMapping, doc: &DecodedDocument, default_ns: &str, delete: bool, cancel: &CancellationToken) -> Result<AppliedDoc, ApplyError> {
        let kind = doc.gvk.kind.as_str();
        let name = doc.name();
        let namespace = if mapping.namespaced() {
            Some(doc.namespace().map(str::to_string).unwrap_or_else(|| fallback_namespace(default_ns)))
        } else {
            None
        };
        let ns = namespace.as_deref();
        let target = describe(kind, name, ns);

        let outcome = if delete {
            let dp = if mapping.namespaced() { foreground() } else { DeleteParams { grace_period_seconds: Some(CLUSTER_DELETE_GRACE_SECS), ..foreground() } };
            match guarded(cancel, self.client.delete(mapping, ns, name, &dp)).await? {
                Ok(()) => Outcome::Deleted,
                Err(e) if is_not_found(&e) => Outcome::AlreadyAbsent,
                Err(source) => {
                    error!(target = %target, error = %source, "delete failed");
                    return Err(ApplyError::Mutation { verb: "delete", target, source });
                }
            }
        } else {
            let mut obj = doc.object.clone();
            if let Some(ns) = ns {
                obj.metadata.namespace = Some(ns.to_string());
            }
            match guarded(cancel, self.client.create(mapping, ns, &obj)).await? {
                Ok(_) => Outcome::Created,
                Err(e) if is_already_exists(&e) => Outcome::AlreadyExists,
                Err(source) => {
                    error!(target = %target, error = %source, "create failed");
                    return Err(ApplyError::Mutation { verb: "create", target, source });
                }
            }
        };
        info!(target = %target, outcome = ?outcome, "document applied");
        Ok(AppliedDoc { index: doc.index, kind: kind.to_string(), name: name.to_string(), namespace, outcome })
    }

    async fn delete_deferred_namespace(&self, mapping: &ResourceMapping, doc: &DecodedDocument, cancel: &CancellationToken) -> Result<AppliedDoc, ApplyError> {
        let name = doc.name();
        let mut applied = AppliedDoc { index: doc.index, kind: doc.gvk.kind.clone(), name: name.to_string(), namespace: None, outcome: Outcome::Retained };
        if name == DEFAULT_NAMESPACE {
            info!("not deleting the default namespace");
            return Ok(applied);
        }
        let target = describe(&doc.gvk.kind, name, None);
        applied.outcome = match guarded(cancel, self.client.delete(mapping, None, name, &foreground())).await? {
            Ok(()) => Outcome::Deleted,
            Err(e) if is_not_found(&e) => Outcome::AlreadyAbsent,
            Err(source) => {
                error!(target = %target, error = %source, "namespace delete failed");
                return Err(ApplyError::Mutation { verb: "delete", target, source });
            }
        };
        info!(target = %target, outcome = ?applied.outcome, "namespace delete done");
        Ok(applied)
    }

    /// Read an object without knowing its scope: namespaced first, then cluster-wide.
    pub async fn lookup(&self, mapping: &ResourceMapping, namespace: Option<&str>, name: &str) -> Result<DynamicObject, ApplyError> {
        let target = describe(&mapping.resource.kind, name, namespace);
        if let Some(ns) = namespace.filter(|s| !s.is_empty()) {
            match self.client.get(mapping, Some(ns), name).await {
                Ok(obj) => {
                    debug!(target = %target, "retrieved");
                    return Ok(obj);
                }
                Err(e) => warn!(target = %target, error = %e, "namespaced lookup failed; retrying without namespace"),
            }
        }
        let obj = self.client.get(mapping, None, name).await.map_err(|source| ApplyError::Lookup { target: target.clone(), source })?;
        debug!(target = %target, "retrieved");
        Ok(obj)
    }

    /// Replace an object with the same namespaced-then-cluster fallback as [`Applier::lookup`].
    pub async fn update(&self, mapping: &ResourceMapping, obj: &DynamicObject) -> Result<(), ApplyError> {
        let name = obj.metadata.name.clone().unwrap_or_default();
        let namespace = obj.metadata.namespace.as_deref().filter(|s| !s.is_empty());
        let target = describe(&mapping.resource.kind, &name, namespace);
        if let Some(ns) = namespace {
            match self.client.replace(mapping, Some(ns), obj).await {
                Ok(_) => {
                    info!(target = %target, "updated");
                    return Ok(());
                }
                Err(e) => warn!(target = %target, error = %e, "namespaced update failed; retrying without namespace"),
            }
        }
        self.client.replace(mapping, None, obj).await.map_err(|source| ApplyError::Mutation { verb: "update", target: target.clone(), source })?;
        info!(target = %target, "updated");
        Ok(())
    }
}

fn foreground() -> DeleteParams {
    DeleteParams { propagation_policy: Some(PropagationPolicy::Foreground), ..Default::default() }
}

fn fallback_namespace(default_ns: &str) -> String {
    if default_ns.is_empty() { DEFAULT_NAMESPACE.to_string() } else { default_ns.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshd_kubehub::mock::{MockCluster, Verb};

    fn applier() -> (Arc<MockCluster>, Applier) {
        let m = Arc::new(MockCluster::new());
        (m.clone(), Applier::new(m))
    }

    #[tokio::test]
    async fn namespaced_document_without_namespace_uses_operation_namespace() {
        let (m, a) = applier();
        let yaml = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm1\n";
        let r = a.apply_manifest(yaml, "emojivoto", false, &CancellationToken::new()).await.unwrap();
        assert_eq!(r.applied[0].namespace.as_deref(), Some("emojivoto"));
        let stored = m.object("configmaps", Some("emojivoto"), "cm1").unwrap();
        assert_eq!(stored.metadata.namespace.as_deref(), Some("emojivoto"));
    }

    #[tokio::test]
    async fn cluster_scoped_delete_uses_short_grace_and_foreground() {
        let (m, a) = applier();
        let yaml = "apiVersion: rbac.authorization.k8s.io/v1\nkind: ClusterRole\nmetadata:\n  name: linkerd-cr\n";
        a.apply_manifest(yaml, "linkerd", false, &CancellationToken::new()).await.unwrap();
        a.apply_manifest(yaml, "linkerd", true, &CancellationToken::new()).await.unwrap();
        let del = m.mutations().into_iter().find(|c| c.verb == Verb::Delete).unwrap();
        assert_eq!(del.namespace, None);
        assert_eq!(del.grace_seconds, Some(1));
        assert_eq!(del.propagation.as_deref(), Some("Foreground"));
    }

    #[tokio::test]
    async fn lookup_falls_back_to_cluster_scope() {
        let (m, a) = applier();
        let ns_yaml = "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: books\n";
        a.apply_manifest(ns_yaml, "", false, &CancellationToken::new()).await.unwrap();
        m.clear_calls();
        let obj = a.lookup(&ResourceMapping::namespaces(), Some("books"), "books").await.unwrap();
        assert_eq!(obj.metadata.name.as_deref(), Some("books"));
        let gets: Vec<_> = m.calls().into_iter().filter(|c| c.verb == Verb::Get).map(|c| c.namespace).collect();
        assert_eq!(gets, vec![Some("books".to_string()), None]);
    }

    #[tokio::test]
    async fn lookup_miss_is_not_found() {
        let (_m, a) = applier();
        let err = a.lookup(&ResourceMapping::namespaces(), None, "ghost").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn cancelled_batch_stops_before_mutating() {
        let (m, a) = applier();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let yaml = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm1\n";
        assert!(matches!(a.apply_manifest(yaml, "ns", false, &cancel).await, Err(ApplyError::Cancelled)));
        assert!(m.mutations().is_empty());
    }

    #[tokio::test]
    async fn oversized_batch_is_rejected() {
        let (_m, a) = applier();
        let huge = "#".repeat(max_batch_bytes() + 1);
        assert!(matches!(a.apply_manifest(&huge, "ns", false, &CancellationToken::new()).await, Err(ApplyError::Oversized { .. })));
    }

    #[test]
    fn summary_lists_only_nonzero_outcomes() {
        let mut r = BatchReport::default();
        assert_eq!(r.summary(), "no documents");
        r.applied.push(AppliedDoc { index: 0, kind: "ConfigMap".into(), name: "a".into(), namespace: None, outcome: Outcome::Created });
        r.skipped.push(Skipped { index: 1, reason: SkipReason::UnsupportedKind("Pod".into()) });
        assert_eq!(r.summary(), "1 created, 1 skipped");
    }
}
