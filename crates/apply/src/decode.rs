//! Manifest decoder: split a multi-document blob and decode each fragment.
//!
//! A fragment that fails to decode, or whose kind is outside [`AllowedKind`], becomes a
//! [`Skipped`] entry; it never aborts the remaining documents.

use k8s_openapi::api::admissionregistration::v1::{MutatingWebhookConfiguration, ValidatingWebhookConfiguration};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIService;
use kube::core::{DynamicObject, GroupVersionKind};
use meshd_core::AllowedKind;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Document separator: a line consisting exactly of `---`.
pub const SEPARATOR: &str = "---";

fn max_yaml_nodes() -> usize {
    std::env::var("MESHD_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

/// A decoded, allow-listed document. Lives for one apply pass.
#[derive(Debug, Clone)]
pub struct DecodedDocument {
    /// Position among the non-blank fragments of the batch.
    pub index: usize,
    pub gvk: GroupVersionKind,
    pub kind: AllowedKind,
    pub object: DynamicObject,
}

impl DecodedDocument {
    pub fn name(&self) -> &str { self.object.metadata.name.as_deref().unwrap_or("") }

    pub fn namespace(&self) -> Option<&str> { self.object.metadata.namespace.as_deref().filter(|s| !s.is_empty()) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// Malformed document.
    Decode(String),
    /// Decoded, but the kind is not allow-listed.
    UnsupportedKind(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Skipped {
    pub index: usize,
    pub reason: SkipReason,
}

impl std::fmt::Display for Skipped {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.reason {
            SkipReason::Decode(msg) => write!(f, "document {}: decode failed: {}", self.index, msg),
            SkipReason::UnsupportedKind(kind) => write!(f, "document {}: unsupported kind {}", self.index, kind),
        }
    }
}

/// Split on separator lines and drop blank or comment-only fragments.
pub fn split_documents(blob: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    for line in blob.lines() {
        if line == SEPARATOR {
            out.push(std::mem::take(&mut cur));
            continue;
        }
        cur.push_str(line);
        cur.push('\n');
    }
    out.push(cur);
    out.retain(|f| !is_blank(f));
    out
}

fn is_blank(fragment: &str) -> bool {
    fragment.lines().map(str::trim).all(|l| l.is_empty() || l.starts_with('#'))
}

/// Decode every fragment of `blob` in textual order.
pub fn decode_manifest(blob: &str) -> Vec<Result<DecodedDocument, Skipped>> {
    split_documents(blob)
        .iter()
        .enumerate()
        .map(|(index, text)| decode_document(index, text).map_err(|reason| Skipped { index, reason }))
        .collect()
}

/// Decode one fragment into its kind identity and generic content.
pub fn decode_document(index: usize, text: &str) -> Result<DecodedDocument, SkipReason> {
    let val: serde_yaml::Value = serde_yaml::from_str(text).map_err(|e| SkipReason::Decode(format!("invalid YAML: {}", e)))?;
    let json = serde_json::to_value(val).map_err(|e| SkipReason::Decode(format!("converting YAML to JSON: {}", e)))?;
    if json_node_budget_exceeded(&json, max_yaml_nodes()) {
        return Err(SkipReason::Decode(format!("document too complex (>{} nodes)", max_yaml_nodes())));
    }
    let api_version = json
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .ok_or_else(|| SkipReason::Decode("missing apiVersion".into()))?
        .to_string();
    let kind_s = json
        .get("kind")
        .and_then(|v| v.as_str())
        .ok_or_else(|| SkipReason::Decode("missing kind".into()))?
        .to_string();
    let kind = AllowedKind::from_kind(&kind_s).ok_or_else(|| SkipReason::UnsupportedKind(kind_s.clone()))?;
    match json.get("metadata").and_then(|m| m.get("name")).and_then(|v| v.as_str()) {
        Some(n) if !n.is_empty() => {}
        _ => return Err(SkipReason::Decode("missing metadata.name".into())),
    }
    check_typed(kind, &api_version, &json).map_err(SkipReason::Decode)?;
    let object: DynamicObject = serde_json::from_value(json).map_err(|e| SkipReason::Decode(e.to_string()))?;
    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version),
    };
    Ok(DecodedDocument { index, gvk: GroupVersionKind { group, version, kind: kind_s }, kind, object })
}

/// Validate against the typed schema when the document uses the version k8s-openapi models.
fn check_typed(kind: AllowedKind, api_version: &str, json: &Json) -> Result<(), String> {
    match kind {
        AllowedKind::Namespace => typed::<Namespace>(api_version, json),
        AllowedKind::Role => typed::<Role>(api_version, json),
        AllowedKind::ClusterRole => typed::<ClusterRole>(api_version, json),
        AllowedKind::RoleBinding => typed::<RoleBinding>(api_version, json),
        AllowedKind::ClusterRoleBinding => typed::<ClusterRoleBinding>(api_version, json),
        AllowedKind::ServiceAccount => typed::<ServiceAccount>(api_version, json),
        AllowedKind::MutatingWebhookConfiguration => typed::<MutatingWebhookConfiguration>(api_version, json),
        AllowedKind::ValidatingWebhookConfiguration => typed::<ValidatingWebhookConfiguration>(api_version, json),
        AllowedKind::Secret => typed::<Secret>(api_version, json),
        AllowedKind::APIService => typed::<APIService>(api_version, json),
        // policy/v1beta1 is gone from current schemas; decoded generically
        AllowedKind::PodSecurityPolicy => Ok(()),
        AllowedKind::ConfigMap => typed::<ConfigMap>(api_version, json),
        AllowedKind::Service => typed::<Service>(api_version, json),
        AllowedKind::Deployment => typed::<Deployment>(api_version, json),
        AllowedKind::CronJob => typed::<CronJob>(api_version, json),
        AllowedKind::CustomResourceDefinition => typed::<CustomResourceDefinition>(api_version, json),
    }
}

fn typed<K: k8s_openapi::Resource + DeserializeOwned>(api_version: &str, json: &Json) -> Result<(), String> {
    if api_version != K::API_VERSION {
        return Ok(());
    }
    K::deserialize(json).map(|_| ()).map_err(|e| format!("invalid {}: {}", K::KIND, e))
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}
