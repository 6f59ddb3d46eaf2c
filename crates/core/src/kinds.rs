//! Closed set of object kinds a manifest batch may provision.
//!
//! Manifests are partially caller supplied (the custom YAML operation), so only these
//! kinds are ever acted upon. Membership is an exact match on `kind`; there is no
//! substring or pattern matching.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AllowedKind {
    Namespace,
    Role,
    ClusterRole,
    RoleBinding,
    ClusterRoleBinding,
    ServiceAccount,
    MutatingWebhookConfiguration,
    ValidatingWebhookConfiguration,
    Secret,
    APIService,
    PodSecurityPolicy,
    ConfigMap,
    Service,
    Deployment,
    CronJob,
    CustomResourceDefinition,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("kind {0} is not in the supported set")]
pub struct UnsupportedKind(pub String);

impl AllowedKind {
    pub const ALL: [AllowedKind; 16] = [
        AllowedKind::Namespace,
        AllowedKind::Role,
        AllowedKind::ClusterRole,
        AllowedKind::RoleBinding,
        AllowedKind::ClusterRoleBinding,
        AllowedKind::ServiceAccount,
        AllowedKind::MutatingWebhookConfiguration,
        AllowedKind::ValidatingWebhookConfiguration,
        AllowedKind::Secret,
        AllowedKind::APIService,
        AllowedKind::PodSecurityPolicy,
        AllowedKind::ConfigMap,
        AllowedKind::Service,
        AllowedKind::Deployment,
        AllowedKind::CronJob,
        AllowedKind::CustomResourceDefinition,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AllowedKind::Namespace => "Namespace",
            AllowedKind::Role => "Role",
            AllowedKind::ClusterRole => "ClusterRole",
            AllowedKind::RoleBinding => "RoleBinding",
            AllowedKind::ClusterRoleBinding => "ClusterRoleBinding",
            AllowedKind::ServiceAccount => "ServiceAccount",
            AllowedKind::MutatingWebhookConfiguration => "MutatingWebhookConfiguration",
            AllowedKind::ValidatingWebhookConfiguration => "ValidatingWebhookConfiguration",
            AllowedKind::Secret => "Secret",
            AllowedKind::APIService => "APIService",
            AllowedKind::PodSecurityPolicy => "PodSecurityPolicy",
            AllowedKind::ConfigMap => "ConfigMap",
            AllowedKind::Service => "Service",
            AllowedKind::Deployment => "Deployment",
            AllowedKind::CronJob => "CronJob",
            AllowedKind::CustomResourceDefinition => "CustomResourceDefinition",
        }
    }

    /// Exact membership test on a manifest `kind` value.
    pub fn from_kind(kind: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == kind)
    }
}

impl FromStr for AllowedKind {
    type Err = UnsupportedKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_kind(s).ok_or_else(|| UnsupportedKind(s.to_string()))
    }
}

impl std::fmt::Display for AllowedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_round_trips_through_its_name() {
        for k in AllowedKind::ALL {
            assert_eq!(AllowedKind::from_kind(k.as_str()), Some(k));
        }
    }

    #[test]
    fn membership_is_exact_not_substring() {
        // "ServiceMonitor" contains "Service", "PodSecurityPolicyReview" contains a full entry
        assert!(AllowedKind::from_kind("ServiceMonitor").is_none());
        assert!(AllowedKind::from_kind("PodSecurityPolicyReview").is_none());
        assert!(AllowedKind::from_kind("service").is_none());
        assert!(AllowedKind::from_kind("Pod").is_none());
    }

    #[test]
    fn parse_reports_offending_kind() {
        let err = "StatefulSet".parse::<AllowedKind>().unwrap_err();
        assert_eq!(err, UnsupportedKind("StatefulSet".into()));
        assert!(err.to_string().contains("StatefulSet"));
    }
}
