//! ConfigMap classification: policy, data, or ignored.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Policy,
    Data,
    Ignored,
}

impl Classification {
    pub fn matches(&self) -> bool {
        !matches!(self, Classification::Ignored)
    }

    pub fn is_policy(&self) -> bool {
        matches!(self, Classification::Policy)
    }
}

/// Matching rules for policy and data ConfigMaps.
///
/// Data wins over policy when both labels are present. Policy matching is
/// namespace-or-label; `require_label` narrows it to the label alone.
/// `"*"` in the namespace list matches every namespace.
#[derive(Debug, Clone)]
pub struct MatcherConfig {
    pub namespaces: Vec<String>,
    pub enable_policies: bool,
    pub enable_data: bool,
    pub require_label: bool,
    /// `(key, value)` pair marking policy ConfigMaps.
    pub policy_label: (String, String),
    /// `(key, value)` pair marking data ConfigMaps.
    pub data_label: (String, String),
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            namespaces: vec!["opa".to_string()],
            enable_policies: true,
            enable_data: false,
            require_label: false,
            policy_label: ("kopa.dev/policy".to_string(), "rego".to_string()),
            data_label: ("kopa.dev/data".to_string(), "json".to_string()),
        }
    }
}

impl MatcherConfig {
    pub fn classify(&self, cm: &ConfigMap) -> Classification {
        if self.enable_data && self.matches_namespace(cm) && self.matches_label(cm, &self.data_label)
        {
            return Classification::Data;
        }
        if self.enable_policies {
            let matched = if self.require_label {
                self.matches_label(cm, &self.policy_label)
            } else {
                self.matches_namespace(cm) || self.matches_label(cm, &self.policy_label)
            };
            if matched {
                return Classification::Policy;
            }
        }
        Classification::Ignored
    }

    fn matches_namespace(&self, cm: &ConfigMap) -> bool {
        let ns = cm.metadata.namespace.as_deref().unwrap_or("");
        self.namespaces.iter().any(|n| n == "*" || n == ns)
    }

    fn matches_label(&self, cm: &ConfigMap, (key, value): &(String, String)) -> bool {
        cm.metadata
            .labels
            .as_ref()
            .map_or(false, |labels| labels.get(key) == Some(value))
    }
}

struct Fnv64(u64);

impl Fnv64 {
    fn new() -> Self {
        Fnv64(0xcbf2_9ce4_8422_2325)
    }

    fn update(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.0 ^= u64::from(*b);
            self.0 = self.0.wrapping_mul(0x100_0000_01b3);
        }
    }
}

/// FNV-1a fingerprint over labels and data; an unchanged fingerprint means
/// republication would be a no-op.
pub fn fingerprint(labels: &BTreeMap<String, String>, data: &BTreeMap<String, String>) -> u64 {
    let mut hash = Fnv64::new();
    for (k, v) in labels {
        hash.update(k.as_bytes());
        hash.update(b"=");
        hash.update(v.as_bytes());
        hash.update(b"\n");
    }
    hash.update(b"\0");
    for (k, v) in data {
        hash.update(k.as_bytes());
        hash.update(b"=");
        hash.update(v.as_bytes());
        hash.update(b"\n");
    }
    hash.0
}
