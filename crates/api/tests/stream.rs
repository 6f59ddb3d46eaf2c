use std::sync::Arc;
use std::time::Duration;

use meshd_api::{Adapter, EventSender, MeshApi, MeshError, Session, SessionConfig};
use meshd_core::{Event, OperationRequest, Severity};
use meshd_kubehub::mock::MockCluster;
use meshd_ops::{Collaborators, Installer, ManifestFetcher, Templates};
use tokio::sync::mpsc;

struct NoInstaller;

#[async_trait::async_trait]
impl Installer for NoInstaller {
    async fn manifest(&self, _namespace: &str, _delete: bool) -> anyhow::Result<String> { anyhow::bail!("installer not available") }
}

struct NoFetch;

#[async_trait::async_trait]
impl ManifestFetcher for NoFetch {
    async fn fetch(&self, url: &str, _cache_name: &str) -> anyhow::Result<String> { anyhow::bail!("offline: {}", url) }
}

/// Fails every send.
struct BrokenPipe;

#[async_trait::async_trait]
impl EventSender for BrokenPipe {
    async fn send(&mut self, _event: &Event) -> anyhow::Result<()> { anyhow::bail!("transport is closing") }
}

fn adapter() -> (Arc<MockCluster>, Adapter) {
    let cluster = Arc::new(MockCluster::new());
    let parts = Collaborators { installer: Arc::new(NoInstaller), fetcher: Arc::new(NoFetch), templates: Templates::new(None) };
    let cfg = SessionConfig::default();
    let api = Adapter::new(cfg.clone());
    api.install(Session::with_parts(cluster.clone(), parts, &cfg));
    (cluster, api)
}

async fn recv(rx: &mut mpsc::Receiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.expect("event in time").expect("stream open")
}

#[tokio::test]
async fn failed_delivery_is_redelivered_on_reconnect() {
    let (_cluster, api) = adapter();
    let api = Arc::new(api);
    let events = api.session().unwrap().events().clone();
    events.push(Event::info("op-1", "first", ""));
    events.push(Event::info("op-2", "second", ""));

    let err = api.stream_events(&mut BrokenPipe).await.unwrap_err();
    assert!(matches!(err, MeshError::Stream(_)), "err={}", err);
    assert_eq!(events.len(), 2);

    let (mut tx, mut rx) = mpsc::channel::<Event>(8);
    let streaming = {
        let api = api.clone();
        tokio::spawn(async move { api.stream_events(&mut tx).await })
    };
    assert_eq!(recv(&mut rx).await.operation_id, "op-1");
    assert_eq!(recv(&mut rx).await.operation_id, "op-2");

    api.shutdown();
    let res = tokio::time::timeout(Duration::from_secs(5), streaming).await.unwrap().unwrap();
    assert_eq!(res, Ok(()));
}

#[tokio::test]
async fn only_one_consumer_at_a_time() {
    let (_cluster, api) = adapter();
    let api = Arc::new(api);
    let (mut tx, _rx) = mpsc::channel::<Event>(8);
    let first = {
        let api = api.clone();
        tokio::spawn(async move { api.stream_events(&mut tx).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (mut tx2, _rx2) = mpsc::channel::<Event>(8);
    assert!(matches!(api.stream_events(&mut tx2).await, Err(MeshError::Unavailable(_))));

    api.shutdown();
    assert_eq!(tokio::time::timeout(Duration::from_secs(5), first).await.unwrap().unwrap(), Ok(()));
}

#[tokio::test]
async fn operation_outcome_arrives_on_the_stream() {
    let (cluster, api) = adapter();
    let api = Arc::new(api);
    let req = OperationRequest {
        operation_id: "op-9".into(),
        op_name: "install_http_bin".into(),
        namespace: "samples".into(),
        username: Some("ada".into()),
        ..Default::default()
    };
    assert_eq!(api.apply_operation(req).await.unwrap().operation_id, "op-9");

    let (mut tx, mut rx) = mpsc::channel::<Event>(8);
    let streaming = {
        let api = api.clone();
        tokio::spawn(async move { api.stream_events(&mut tx).await })
    };
    let ev = recv(&mut rx).await;
    assert_eq!((ev.operation_id.as_str(), ev.severity), ("op-9", Severity::Info));
    assert!(cluster.object("services", Some("samples"), "httpbin").is_some());
    api.shutdown();
    let _ = tokio::time::timeout(Duration::from_secs(5), streaming).await;
}

#[tokio::test]
async fn background_failure_is_an_error_event_not_a_call_error() {
    let (_cluster, api) = adapter();
    let req = OperationRequest { operation_id: "op-1".into(), op_name: "linkerd_install".into(), namespace: "linkerd".into(), ..Default::default() };
    api.apply_operation(req).await.unwrap();
    let (mut tx, mut rx) = mpsc::channel::<Event>(8);
    let api = Arc::new(api);
    let streaming = {
        let api = api.clone();
        tokio::spawn(async move { api.stream_events(&mut tx).await })
    };
    let ev = recv(&mut rx).await;
    assert_eq!(ev.severity, Severity::Error);
    assert_eq!(ev.summary, "Error while deploying Linkerd");
    assert!(ev.details.contains("installer not available"));
    api.shutdown();
    let _ = tokio::time::timeout(Duration::from_secs(5), streaming).await;
}

#[tokio::test]
async fn remote_source_failure_is_returned_synchronously() {
    let (cluster, api) = adapter();
    let req = OperationRequest { operation_id: "op-1".into(), op_name: "install_emojivoto".into(), namespace: "emojivoto".into(), ..Default::default() };
    let err = api.apply_operation(req).await.unwrap_err();
    assert!(matches!(err, MeshError::Internal(ref m) if m.contains("offline")), "err={}", err);
    assert!(cluster.calls().is_empty());
}

#[tokio::test]
async fn bad_kubeconfig_leaves_adapter_uninitialised() {
    let api = Adapter::new(SessionConfig::default());
    let err = api.create_instance(b"clusters: [nope", None).await.unwrap_err();
    assert!(matches!(err, MeshError::Unavailable(_)), "err={}", err);
    assert_eq!(api.session().err(), Some(MeshError::NotInitialized));
}

#[tokio::test]
async fn event_survives_a_stream_dropped_mid_send() {
    let (_cluster, api) = adapter();
    let api = Arc::new(api);
    let events = api.session().unwrap().events().clone();
    events.push(Event::info("op-1", "first", ""));

    // full channel: the send parks until the consumer reads
    let (mut tx, mut rx) = mpsc::channel::<Event>(1);
    tx.send(Event::info("filler", "", "")).await.unwrap();
    let abandoned = tokio::time::timeout(Duration::from_millis(100), api.stream_events(&mut tx)).await;
    assert!(abandoned.is_err(), "stream should still be parked on send");
    assert_eq!(events.len(), 1);

    assert_eq!(recv(&mut rx).await.operation_id, "filler");
    let streaming = {
        let api = api.clone();
        tokio::spawn(async move { api.stream_events(&mut tx).await })
    };
    assert_eq!(recv(&mut rx).await.operation_id, "op-1");
    api.shutdown();
    assert_eq!(tokio::time::timeout(Duration::from_secs(5), streaming).await.unwrap().unwrap(), Ok(()));
}
