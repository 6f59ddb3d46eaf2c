//! meshd kubehub: cluster connection, discovery resolver and the dynamic resource seam.
//!
//! Everything that talks to the API server goes through [`ResourceClient`], so the
//! apply and orchestration layers can run against [`mock::MockCluster`] in tests.

#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use k8s_openapi::api::core::v1::{Namespace, Service};
use kube::{
    api::{Api, DeleteParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{DynamicObject, GroupVersionKind},
    discovery::{ApiResource, Discovery, Scope},
    Client, Config,
};
use metrics::histogram;
use tracing::{debug, info};

pub mod mock;

/// Resolved endpoint for a kind identity: plural resource name plus scope.
///
/// Recomputed for every document; never cached across calls since CRDs may be
/// registered in the middle of a session.
#[derive(Debug, Clone)]
pub struct ResourceMapping {
    pub resource: ApiResource,
    pub scope: Scope,
}

impl ResourceMapping {
    pub fn namespaced(&self) -> bool { matches!(self.scope, Scope::Namespaced) }

    /// Static mapping for core/v1 Namespace (used by injection labelling).
    pub fn namespaces() -> Self {
        Self { resource: ApiResource::erase::<Namespace>(&()), scope: Scope::Cluster }
    }

    /// Static mapping for core/v1 Service (used by the port extractor).
    pub fn services() -> Self {
        Self { resource: ApiResource::erase::<Service>(&()), scope: Scope::Namespaced }
    }
}

/// `v1/Kind` or `group/v1/Kind`.
pub fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

/// Cluster operations needed by the apply engine.
///
/// `namespace: Some(ns)` addresses the namespaced endpoint, `None` the cluster-wide one.
/// Mutations return the raw `kube::Error` so callers can classify 404/409 themselves.
#[async_trait::async_trait]
pub trait ResourceClient: Send + Sync {
    /// Live discovery round trip for a kind identity.
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ResourceMapping>;

    async fn create(&self, mapping: &ResourceMapping, namespace: Option<&str>, obj: &DynamicObject) -> Result<DynamicObject, kube::Error>;

    async fn delete(&self, mapping: &ResourceMapping, namespace: Option<&str>, name: &str, dp: &DeleteParams) -> Result<(), kube::Error>;

    async fn get(&self, mapping: &ResourceMapping, namespace: Option<&str>, name: &str) -> Result<DynamicObject, kube::Error>;

    async fn replace(&self, mapping: &ResourceMapping, namespace: Option<&str>, obj: &DynamicObject) -> Result<DynamicObject, kube::Error>;
}

fn api_timeout() -> Duration {
    let secs = std::env::var("MESHD_API_TIMEOUT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(30);
    Duration::from_secs(secs)
}

/// Build a client from raw kubeconfig bytes and an optional context name.
/// Empty bytes fall back to the ambient configuration (in-cluster or `KUBECONFIG`);
/// a requested context is still honoured there.
pub async fn connect(kubeconfig: &[u8], context: Option<&str>) -> Result<Client> {
    let t0 = Instant::now();
    let context = context.filter(|c| !c.is_empty());
    let opts = KubeConfigOptions { context: context.map(str::to_string), ..Default::default() };
    let mut config = if kubeconfig.is_empty() {
        debug!(context = ?context, "no kubeconfig supplied; using ambient configuration");
        match context {
            Some(ctx) => Config::from_kubeconfig(&opts)
                .await
                .with_context(|| format!("loading ambient kubeconfig for context {:?}", ctx))?,
            None => Config::infer().await.context("inferring kube client configuration")?,
        }
    } else {
        let text = std::str::from_utf8(kubeconfig).context("kubeconfig is not valid UTF-8")?;
        let kc = Kubeconfig::from_yaml(text).context("parsing kubeconfig")?;
        Config::from_custom_kubeconfig(kc, &opts)
            .await
            .with_context(|| format!("loading kubeconfig for context {:?}", context.unwrap_or("(current)")))?
    };
    config.read_timeout = Some(api_timeout());
    let client = Client::try_from(config).context("building kube client")?;
    info!(context = ?context, took_ms = %t0.elapsed().as_millis(), "kube client ready");
    Ok(client)
}

/// Find the mapping for `gvk` in a discovery result, matching the exact served version.
pub fn find_mapping(discovery: &Discovery, gvk: &GroupVersionKind) -> Option<ResourceMapping> {
    for group in discovery.groups() {
        if group.name() != gvk.group {
            continue;
        }
        for (ar, caps) in group.versioned_resources(&gvk.version) {
            if ar.kind == gvk.kind {
                return Some(ResourceMapping { resource: ar, scope: caps.scope });
            }
        }
    }
    None
}

/// Live kube-rs implementation of [`ResourceClient`].
#[derive(Clone)]
pub struct KubeResourceClient {
    client: Client,
}

impl KubeResourceClient {
    pub fn new(client: Client) -> Self { Self { client } }

    pub fn client(&self) -> &Client { &self.client }

    fn api(&self, mapping: &ResourceMapping, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &mapping.resource),
            None => Api::all_with(self.client.clone(), &mapping.resource),
        }
    }
}

#[async_trait::async_trait]
impl ResourceClient for KubeResourceClient {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ResourceMapping> {
        let t0 = Instant::now();
        let discovery = Discovery::new(self.client.clone())
            .filter(&[gvk.group.as_str()])
            .run()
            .await
            .with_context(|| format!("discovering API group {:?}", gvk.group))?;
        histogram!("discovery_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        let mapping = find_mapping(&discovery, gvk).ok_or_else(|| anyhow!("GVK not served: {}", gvk_key(gvk)))?;
        debug!(gvk = %gvk_key(gvk), plural = %mapping.resource.plural, namespaced = mapping.namespaced(), "resolved mapping");
        Ok(mapping)
    }

    async fn create(&self, mapping: &ResourceMapping, namespace: Option<&str>, obj: &DynamicObject) -> Result<DynamicObject, kube::Error> {
        self.api(mapping, namespace).create(&PostParams::default(), obj).await
    }

    async fn delete(&self, mapping: &ResourceMapping, namespace: Option<&str>, name: &str, dp: &DeleteParams) -> Result<(), kube::Error> {
        self.api(mapping, namespace).delete(name, dp).await.map(|_| ())
    }

    async fn get(&self, mapping: &ResourceMapping, namespace: Option<&str>, name: &str) -> Result<DynamicObject, kube::Error> {
        self.api(mapping, namespace).get(name).await
    }

    async fn replace(&self, mapping: &ResourceMapping, namespace: Option<&str>, obj: &DynamicObject) -> Result<DynamicObject, kube::Error> {
        let name = obj.metadata.name.clone().unwrap_or_default();
        self.api(mapping, namespace).replace(&name, &PostParams::default(), obj).await
    }
}
