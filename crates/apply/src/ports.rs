//! Port extractor: read back a Service and report its node ports.

use k8s_openapi::api::core::v1::Service;
use meshd_kubehub::ResourceMapping;
use tracing::debug;

use crate::{Applier, ApplyError};

/// Node ports declared by Service `name`, in declaration order. Ports without a
/// `nodePort` are not externally reachable and are left out.
pub async fn service_ports(applier: &Applier, name: &str, namespace: &str) -> Result<Vec<i32>, ApplyError> {
    let obj = applier.lookup(&ResourceMapping::services(), Some(namespace), name).await?;
    let target = format!("Service {}/{}", namespace, name);
    let json = serde_json::to_value(&obj).map_err(|e| ApplyError::Convert { target: target.clone(), message: e.to_string() })?;
    let svc: Service = serde_json::from_value(json).map_err(|e| ApplyError::Convert { target: target.clone(), message: e.to_string() })?;
    let ports: Vec<i32> = svc
        .spec
        .and_then(|s| s.ports)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|p| p.node_port)
        .collect();
    debug!(target = %target, ports = ?ports, "service ports retrieved");
    Ok(ports)
}

/// Human-readable sentence for a port list; empty when there are no ports.
pub fn port_message(ports: &[i32]) -> String {
    let list = ports.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(", ");
    match ports.len() {
        0 => String::new(),
        1 => format!("The service is possibly available on port: [{}]", list),
        _ => format!("The service is possibly available on one of the following ports: [{}]", list),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::DynamicObject;
    use meshd_kubehub::mock::MockCluster;
    use std::sync::Arc;

    fn svc(name: &str, ports: serde_json::Value) -> DynamicObject {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": { "name": name, "namespace": "books" },
            "spec": { "type": "NodePort", "ports": ports }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn node_ports_in_declaration_order() {
        let m = Arc::new(MockCluster::new());
        m.insert("services", Some("books"), svc("webapp", serde_json::json!([
            { "name": "http", "port": 80, "nodePort": 31002 },
            { "name": "admin", "port": 9990 },
            { "name": "grpc", "port": 81, "nodePort": 30001 }
        ])));
        let a = Applier::new(m);
        assert_eq!(service_ports(&a, "webapp", "books").await.unwrap(), vec![31002, 30001]);
    }

    #[tokio::test]
    async fn wrongly_shaped_port_is_a_convert_error() {
        let m = Arc::new(MockCluster::new());
        m.insert("services", Some("books"), svc("webapp", serde_json::json!([{ "port": 80, "nodePort": "high" }])));
        let a = Applier::new(m);
        match service_ports(&a, "webapp", "books").await {
            Err(ApplyError::Convert { target, .. }) => assert_eq!(target, "Service books/webapp"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn missing_service_is_lookup_error() {
        let a = Applier::new(Arc::new(MockCluster::new()));
        let err = service_ports(&a, "webapp", "books").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn message_varies_with_port_count() {
        assert_eq!(port_message(&[]), "");
        assert_eq!(port_message(&[30080]), "The service is possibly available on port: [30080]");
        assert_eq!(port_message(&[1, 2]), "The service is possibly available on one of the following ports: [1, 2]");
    }
}
