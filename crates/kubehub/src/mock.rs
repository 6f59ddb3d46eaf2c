//! In-memory [`ResourceClient`] for tests.
//!
//! Holds a discovery table, stored objects keyed by (plural, namespace, name), injected
//! failures and an ordered call log. Create/delete/get follow API server semantics for
//! 409 AlreadyExists and 404 NotFound.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use kube::{
    api::DeleteParams,
    core::{DynamicObject, ErrorResponse, GroupVersionKind},
    discovery::{ApiResource, Scope},
};

use crate::{gvk_key, ResourceClient, ResourceMapping};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Resolve,
    Create,
    Delete,
    Get,
    Replace,
}

/// One recorded call against the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub verb: Verb,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    /// Foreground propagation / grace period for deletes.
    pub propagation: Option<String>,
    pub grace_seconds: Option<u32>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(|p| p.into_inner()) }

type ObjKey = (String, Option<String>, String);

const BUILTIN_KINDS: &[(&str, &str, &str, &str, bool)] = &[
    ("", "v1", "Namespace", "namespaces", false),
    ("", "v1", "ServiceAccount", "serviceaccounts", true),
    ("", "v1", "Secret", "secrets", true),
    ("", "v1", "ConfigMap", "configmaps", true),
    ("", "v1", "Service", "services", true),
    ("", "v1", "Pod", "pods", true),
    ("rbac.authorization.k8s.io", "v1", "Role", "roles", true),
    ("rbac.authorization.k8s.io", "v1", "ClusterRole", "clusterroles", false),
    ("rbac.authorization.k8s.io", "v1", "RoleBinding", "rolebindings", true),
    ("rbac.authorization.k8s.io", "v1", "ClusterRoleBinding", "clusterrolebindings", false),
    ("admissionregistration.k8s.io", "v1", "MutatingWebhookConfiguration", "mutatingwebhookconfigurations", false),
    ("admissionregistration.k8s.io", "v1", "ValidatingWebhookConfiguration", "validatingwebhookconfigurations", false),
    ("apiregistration.k8s.io", "v1", "APIService", "apiservices", false),
    ("policy", "v1beta1", "PodSecurityPolicy", "podsecuritypolicies", false),
    ("apps", "v1", "Deployment", "deployments", true),
    ("batch", "v1", "CronJob", "cronjobs", true),
    ("apiextensions.k8s.io", "v1", "CustomResourceDefinition", "customresourcedefinitions", false),
];

/// Build a `kube::Error::Api` the way the API server reports it.
pub fn api_error(code: u16, reason: &str, message: &str) -> kube::Error {
    kube::Error::Api(ErrorResponse { status: "Failure".into(), message: message.into(), reason: reason.into(), code })
}

pub struct MockCluster {
    kinds: Mutex<HashMap<(String, String, String), ResourceMapping>>,
    objects: Mutex<BTreeMap<ObjKey, DynamicObject>>,
    failures: Mutex<HashMap<(Verb, String), ErrorResponse>>,
    broken_discovery: Mutex<HashSet<String>>,
    calls: Mutex<Vec<Call>>,
}

impl Default for MockCluster {
    fn default() -> Self { Self::new() }
}

impl MockCluster {
    /// Cluster serving the common built-in kinds (plus `Pod`, which is not allow-listed).
    pub fn new() -> Self {
        let me = Self {
            kinds: Mutex::new(HashMap::new()),
            objects: Mutex::new(BTreeMap::new()),
            failures: Mutex::new(HashMap::new()),
            broken_discovery: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
        };
        for (g, v, k, plural, namespaced) in BUILTIN_KINDS {
            me.serve(g, v, k, plural, *namespaced);
        }
        me
    }

    /// Register (or replace) a served kind, e.g. a CRD installed mid-session.
    pub fn serve(&self, group: &str, version: &str, kind: &str, plural: &str, namespaced: bool) {
        let api_version = if group.is_empty() { version.to_string() } else { format!("{}/{}", group, version) };
        let resource = ApiResource { group: group.into(), version: version.into(), api_version, kind: kind.into(), plural: plural.into() };
        let scope = if namespaced { Scope::Namespaced } else { Scope::Cluster };
        lock(&self.kinds).insert((group.into(), version.into(), kind.into()), ResourceMapping { resource, scope });
    }

    /// Make every discovery round trip for `kind` fail.
    pub fn break_discovery(&self, kind: &str) {
        lock(&self.broken_discovery).insert(kind.to_string());
    }

    /// Fail `verb` on the object called `name` with the given API error.
    pub fn fail_on(&self, verb: Verb, name: &str, code: u16, reason: &str) {
        let resp = ErrorResponse { status: "Failure".into(), message: format!("injected {} failure", reason), reason: reason.into(), code };
        lock(&self.failures).insert((verb, name.to_string()), resp);
    }

    /// Seed an object directly into the store.
    pub fn insert(&self, plural: &str, namespace: Option<&str>, obj: DynamicObject) {
        let name = obj.metadata.name.clone().unwrap_or_default();
        lock(&self.objects).insert((plural.into(), namespace.map(str::to_string), name), obj);
    }

    pub fn object(&self, plural: &str, namespace: Option<&str>, name: &str) -> Option<DynamicObject> {
        lock(&self.objects).get(&(plural.to_string(), namespace.map(str::to_string), name.to_string())).cloned()
    }

    pub fn object_count(&self) -> usize { lock(&self.objects).len() }

    pub fn calls(&self) -> Vec<Call> { lock(&self.calls).clone() }

    /// Calls excluding discovery round trips.
    pub fn mutations(&self) -> Vec<Call> {
        self.calls().into_iter().filter(|c| matches!(c.verb, Verb::Create | Verb::Delete | Verb::Replace)).collect()
    }

    pub fn clear_calls(&self) { lock(&self.calls).clear(); }

    fn record(&self, verb: Verb, kind: &str, namespace: Option<&str>, name: &str, dp: Option<&DeleteParams>) {
        let propagation = dp.and_then(|d| d.propagation_policy.as_ref()).map(|p| format!("{:?}", p));
        let grace_seconds = dp.and_then(|d| d.grace_period_seconds);
        lock(&self.calls).push(Call {
            verb,
            kind: kind.to_string(),
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
            propagation,
            grace_seconds,
        });
    }

    fn injected(&self, verb: Verb, name: &str) -> Option<kube::Error> {
        lock(&self.failures).get(&(verb, name.to_string())).cloned().map(kube::Error::Api)
    }

    fn key(mapping: &ResourceMapping, namespace: Option<&str>, name: &str) -> ObjKey {
        (mapping.resource.plural.clone(), namespace.map(str::to_string), name.to_string())
    }
}

#[async_trait::async_trait]
impl ResourceClient for MockCluster {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ResourceMapping> {
        self.record(Verb::Resolve, &gvk.kind, None, "", None);
        if lock(&self.broken_discovery).contains(&gvk.kind) {
            return Err(anyhow!("discovery unavailable for {}", gvk_key(gvk)));
        }
        lock(&self.kinds)
            .get(&(gvk.group.clone(), gvk.version.clone(), gvk.kind.clone()))
            .cloned()
            .ok_or_else(|| anyhow!("GVK not served: {}", gvk_key(gvk)))
    }

    async fn create(&self, mapping: &ResourceMapping, namespace: Option<&str>, obj: &DynamicObject) -> Result<DynamicObject, kube::Error> {
        let name = obj.metadata.name.clone().unwrap_or_default();
        self.record(Verb::Create, &mapping.resource.kind, namespace, &name, None);
        if let Some(e) = self.injected(Verb::Create, &name) {
            return Err(e);
        }
        let key = Self::key(mapping, namespace, &name);
        let mut objects = lock(&self.objects);
        if objects.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists", &format!("{} \"{}\" already exists", mapping.resource.plural, name)));
        }
        let mut stored = obj.clone();
        if let Some(ns) = namespace {
            stored.metadata.namespace = Some(ns.to_string());
        }
        objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, mapping: &ResourceMapping, namespace: Option<&str>, name: &str, dp: &DeleteParams) -> Result<(), kube::Error> {
        self.record(Verb::Delete, &mapping.resource.kind, namespace, name, Some(dp));
        if let Some(e) = self.injected(Verb::Delete, name) {
            return Err(e);
        }
        match lock(&self.objects).remove(&Self::key(mapping, namespace, name)) {
            Some(_) => Ok(()),
            None => Err(api_error(404, "NotFound", &format!("{} \"{}\" not found", mapping.resource.plural, name))),
        }
    }

    async fn get(&self, mapping: &ResourceMapping, namespace: Option<&str>, name: &str) -> Result<DynamicObject, kube::Error> {
        self.record(Verb::Get, &mapping.resource.kind, namespace, name, None);
        if let Some(e) = self.injected(Verb::Get, name) {
            return Err(e);
        }
        lock(&self.objects)
            .get(&Self::key(mapping, namespace, name))
            .cloned()
            .ok_or_else(|| api_error(404, "NotFound", &format!("{} \"{}\" not found", mapping.resource.plural, name)))
    }

    async fn replace(&self, mapping: &ResourceMapping, namespace: Option<&str>, obj: &DynamicObject) -> Result<DynamicObject, kube::Error> {
        let name = obj.metadata.name.clone().unwrap_or_default();
        self.record(Verb::Replace, &mapping.resource.kind, namespace, &name, None);
        if let Some(e) = self.injected(Verb::Replace, &name) {
            return Err(e);
        }
        let key = Self::key(mapping, namespace, &name);
        let mut objects = lock(&self.objects);
        if !objects.contains_key(&key) {
            return Err(api_error(404, "NotFound", &format!("{} \"{}\" not found", mapping.resource.plural, name)));
        }
        objects.insert(key, obj.clone());
        Ok(obj.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cm(name: &str) -> DynamicObject {
        let ar = ApiResource::erase::<k8s_openapi::api::core::v1::ConfigMap>(&());
        DynamicObject::new(name, &ar)
    }

    #[tokio::test]
    async fn create_twice_reports_already_exists() {
        let m = MockCluster::new();
        let mapping = m.resolve(&GroupVersionKind::gvk("", "v1", "ConfigMap")).await.unwrap();
        m.create(&mapping, Some("ns"), &cm("a")).await.unwrap();
        match m.create(&mapping, Some("ns"), &cm("a")).await {
            Err(kube::Error::Api(ae)) => assert_eq!((ae.code, ae.reason.as_str()), (409, "AlreadyExists")),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
        assert!(m.object("configmaps", Some("ns"), "a").is_some());
    }

    #[tokio::test]
    async fn namespaced_object_is_invisible_cluster_wide() {
        let m = MockCluster::new();
        let mapping = m.resolve(&GroupVersionKind::gvk("", "v1", "ConfigMap")).await.unwrap();
        m.create(&mapping, Some("ns"), &cm("a")).await.unwrap();
        assert!(m.get(&mapping, None, "a").await.is_err());
        assert!(m.get(&mapping, Some("ns"), "a").await.is_ok());
    }

    #[tokio::test]
    async fn unknown_or_broken_discovery_fails() {
        let m = MockCluster::new();
        assert!(m.resolve(&GroupVersionKind::gvk("example.com", "v1", "Widget")).await.is_err());
        m.serve("example.com", "v1", "Widget", "widgets", true);
        assert!(m.resolve(&GroupVersionKind::gvk("example.com", "v1", "Widget")).await.is_ok());
        m.break_discovery("Widget");
        assert!(m.resolve(&GroupVersionKind::gvk("example.com", "v1", "Widget")).await.is_err());
    }
}
