//! Built-in scope table for core Kubernetes kinds.
//!
//! Used when no discovery is available (offline/in-memory stores) or when a
//! discovery lookup fails for a non-fatal reason. Anything not listed here is
//! assumed to be namespaced.

use crate::Scope;

/// `(group, kind)` pairs of well-known cluster-scoped kinds.
const CLUSTER_SCOPED: &[(&str, &str)] = &[
    ("", "Namespace"),
    ("", "Node"),
    ("", "PersistentVolume"),
    ("", "ComponentStatus"),
    ("rbac.authorization.k8s.io", "ClusterRole"),
    ("rbac.authorization.k8s.io", "ClusterRoleBinding"),
    ("apiextensions.k8s.io", "CustomResourceDefinition"),
    ("apiregistration.k8s.io", "APIService"),
    ("storage.k8s.io", "StorageClass"),
    ("storage.k8s.io", "CSIDriver"),
    ("storage.k8s.io", "CSINode"),
    ("storage.k8s.io", "VolumeAttachment"),
    ("scheduling.k8s.io", "PriorityClass"),
    ("node.k8s.io", "RuntimeClass"),
    ("admissionregistration.k8s.io", "ValidatingWebhookConfiguration"),
    ("admissionregistration.k8s.io", "MutatingWebhookConfiguration"),
    ("networking.k8s.io", "IngressClass"),
    ("certificates.k8s.io", "CertificateSigningRequest"),
];

/// Scope of a kind according to the built-in table.
pub fn builtin_scope(group: &str, kind: &str) -> Scope {
    if CLUSTER_SCOPED.iter().any(|(g, k)| *g == group && *k == kind) {
        Scope::Cluster
    } else {
        Scope::Namespaced
    }
}
