//! meshd core types: operation requests, progress events and the manifest kind allow-list.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub mod kinds;

pub use kinds::AllowedKind;

/// Identifier of the managed mesh technology.
pub const MESH_NAME: &str = "Linkerd";

/// Annotation used to opt a namespace into proxy auto-injection.
pub const INJECT_ANNOTATION: &str = "linkerd.io/inject";
pub const INJECT_ENABLED: &str = "enabled";

/// Namespace that is never deleted by a delete batch.
pub const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self { Severity::Info => "INFO", Severity::Warn => "WARN", Severity::Error => "ERROR" };
        f.write_str(s)
    }
}

/// Progress/outcome event produced by operation tasks and consumed by the stream loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub operation_id: String,
    pub severity: Severity,
    pub summary: String,
    pub details: String,
}

impl Event {
    pub fn info(operation_id: &str, summary: impl Into<String>, details: impl Into<String>) -> Self {
        Self { operation_id: operation_id.to_string(), severity: Severity::Info, summary: summary.into(), details: details.into() }
    }

    pub fn warn(operation_id: &str, summary: impl Into<String>, details: impl Into<String>) -> Self {
        Self { operation_id: operation_id.to_string(), severity: Severity::Warn, summary: summary.into(), details: details.into() }
    }

    pub fn error(operation_id: &str, summary: impl Into<String>, details: impl Into<String>) -> Self {
        Self { operation_id: operation_id.to_string(), severity: Severity::Error, summary: summary.into(), details: details.into() }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OpCategory {
    Install,
    SampleApplication,
    Custom,
}

/// Registry entry exposed through `SupportedOperations`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SupportedOperation {
    pub key: String,
    pub display_name: String,
    pub category: OpCategory,
}

/// A single ApplyOperation request. Immutable once dispatched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationRequest {
    pub operation_id: String,
    pub op_name: String,
    pub namespace: String,
    pub delete_op: bool,
    pub custom_body: Option<String>,
    /// Requester identity, substituted into sample templates.
    pub username: Option<String>,
}

impl OperationRequest {
    /// Verb used in progress messages ("deploying" / "removing").
    pub fn progressive(&self) -> &'static str { if self.delete_op { "removing" } else { "deploying" } }

    /// Verb used in completion messages ("deployed" / "removed").
    pub fn past(&self) -> &'static str { if self.delete_op { "removed" } else { "deployed" } }
}

/// Acknowledgment returned by ApplyOperation; echoes the operation id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationAck {
    pub operation_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_serializes_uppercase() {
        let v = serde_json::to_value(Severity::Warn).unwrap();
        assert_eq!(v, serde_json::json!("WARN"));
        assert_eq!(Severity::Error.to_string(), "ERROR");
    }

    #[test]
    fn request_verbs_follow_delete_flag() {
        let mut r = OperationRequest { op_name: "custom".into(), ..Default::default() };
        assert_eq!((r.progressive(), r.past()), ("deploying", "deployed"));
        r.delete_op = true;
        assert_eq!((r.progressive(), r.past()), ("removing", "removed"));
    }
}
