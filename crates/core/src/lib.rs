//! Kopa core types: resource descriptors, keys and backoff policy.

#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A watchable Kubernetes resource kind and its position in the remote
/// document tree (the `resource` segment).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceDescriptor {
    pub group: String,
    pub version: String,
    /// Plural resource name, e.g. `pods`.
    pub resource: String,
    pub namespaced: bool,
}

impl ResourceDescriptor {
    pub fn new(group: &str, version: &str, resource: &str, namespaced: bool) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            resource: resource.to_string(),
            namespaced,
        }
    }

    /// Parse a `group/version/resource` or `version/resource` key, e.g.
    /// `"v1/pods"` or `"apps/v1/deployments"`.
    pub fn parse(key: &str, namespaced: bool) -> Result<Self, ParseDescriptorError> {
        let parts: Vec<_> = key.split('/').filter(|s| !s.is_empty()).collect();
        match parts.as_slice() {
            [version, resource] => Ok(Self::new("", version, resource, namespaced)),
            [group, version, resource] => Ok(Self::new(group, version, resource, namespaced)),
            _ => Err(ParseDescriptorError(key.to_string())),
        }
    }
}

impl fmt::Display for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.resource)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid resource key: {0} (expect version/resource or group/version/resource)")]
pub struct ParseDescriptorError(pub String);

/// Path of one object below its descriptor's root: `namespace/name` for
/// namespaced kinds, `name` otherwise. Path depth is uniform per kind, so
/// payload construction can assume it.
pub fn resource_key(namespace: Option<&str>, name: &str, namespaced: bool) -> String {
    match (namespaced, namespace) {
        (true, Some(ns)) => format!("{}/{}", ns, name),
        _ => name.to_string(),
    }
}

/// Backoff configuration for the sync reset loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BackoffPolicy {
    pub min: Duration,
    pub max: Duration,
    /// Fractional jitter applied to each delay, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            current: self.min,
        }
    }
}

/// Mutable backoff state: doubles up to the cap, resets to the minimum after
/// a successful reload.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
}

impl Backoff {
    /// Next delay to wait before retrying; advances the state.
    pub fn next(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.policy.max);
        jittered(base, self.policy.jitter)
    }

    pub fn reset(&mut self) {
        self.current = self.policy.min;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

fn jittered(base: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return base;
    }
    let spread = base.as_secs_f64() * jitter;
    let offset = rand::random::<f64>() * 2.0 * spread - spread;
    Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
}
