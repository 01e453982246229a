//! Recording OPA client double for tests.
//!
//! Records every call with its fully-resolved path and lets tests inject a
//! bounded number of failures per (operation, path) pair. Shared state
//! survives `prefix`, so assertions can be made on the root handle after
//! handing prefixed copies to the code under test.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use crate::{Data, Error, Policies, RemoteError};

/// One recorded operation against the mock.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    PutData { path: String, value: Value },
    PatchData { path: String, op: String },
    PostData { path: String },
    InsertPolicy { id: String, module: String },
    DeletePolicy { id: String },
}

impl Call {
    fn kind(&self) -> &'static str {
        match self {
            Call::PutData { .. } => "put",
            Call::PatchData { .. } => "patch",
            Call::PostData { .. } => "post",
            Call::InsertPolicy { .. } => "insert_policy",
            Call::DeletePolicy { .. } => "delete_policy",
        }
    }

    fn path(&self) -> &str {
        match self {
            Call::PutData { path, .. } | Call::PatchData { path, .. } | Call::PostData { path } => {
                path
            }
            Call::InsertPolicy { id, .. } | Call::DeletePolicy { id } => id,
        }
    }
}

#[derive(Default)]
struct MockState {
    calls: Vec<Call>,
    failures: VecDeque<(String, String)>,
}

/// Scripted client double; clones and prefixed copies share one state.
#[derive(Clone, Default)]
pub struct MockClient {
    state: Arc<Mutex<MockState>>,
    prefix: String,
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls matching `kind` (`"put"`, `"patch"`,
    /// `"insert_policy"`, ...) at the resolved `path`.
    pub fn fail(&self, kind: &str, path: &str, times: usize) {
        let mut state = self.lock();
        for _ in 0..times {
            state
                .failures
                .push_back((kind.to_string(), path.to_string()));
        }
    }

    /// All calls recorded so far, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Drain recorded calls, resetting the log.
    pub fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut self.lock().calls)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, path: &str) -> String {
        let path = path.trim_matches('/');
        match (self.prefix.is_empty(), path.is_empty()) {
            (true, _) => path.to_string(),
            (_, true) => self.prefix.clone(),
            _ => format!("{}/{}", self.prefix, path),
        }
    }

    fn record(&self, call: Call) -> Result<(), Error> {
        let mut state = self.lock();
        let injected = state
            .failures
            .iter()
            .position(|(kind, path)| kind == call.kind() && path == call.path());
        state.calls.push(call);
        match injected {
            Some(i) => {
                state.failures.remove(i);
                Err(Error::Remote(RemoteError {
                    code: "internal_error".to_string(),
                    message: "injected failure".to_string(),
                }))
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Data for MockClient {
    fn prefix(&self, path: &str) -> Box<dyn Data> {
        let mut cpy = self.clone();
        cpy.prefix = self.resolve(path);
        Box::new(cpy)
    }

    async fn put_data(&self, path: &str, value: &Value) -> Result<(), Error> {
        self.record(Call::PutData {
            path: self.resolve(path),
            value: value.clone(),
        })
    }

    async fn patch_data(&self, path: &str, op: &str, _value: Option<&Value>) -> Result<(), Error> {
        self.record(Call::PatchData {
            path: self.resolve(path),
            op: op.to_string(),
        })
    }

    async fn post_data(&self, path: &str, _input: &Value) -> Result<Option<Value>, Error> {
        self.record(Call::PostData {
            path: self.resolve(path),
        })?;
        Ok(None)
    }
}

#[async_trait]
impl Policies for MockClient {
    async fn insert_policy(&self, id: &str, module: &[u8]) -> Result<(), Error> {
        self.record(Call::InsertPolicy {
            id: id.to_string(),
            module: String::from_utf8_lossy(module).to_string(),
        })
    }

    async fn delete_policy(&self, id: &str) -> Result<(), Error> {
        self.record(Call::DeletePolicy { id: id.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn records_resolved_paths() {
        let mock = MockClient::new();
        let scoped = Data::prefix(&mock, "kubernetes").prefix("nodes");
        scoped.put_data("node1", &json!({"a": 1})).await.unwrap();
        assert_eq!(
            mock.calls(),
            vec![Call::PutData {
                path: "kubernetes/nodes/node1".to_string(),
                value: json!({"a": 1}),
            }]
        );
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let mock = MockClient::new();
        mock.fail("put", "x", 1);
        assert!(mock.put_data("x", &json!(1)).await.is_err());
        assert!(mock.put_data("x", &json!(1)).await.is_ok());
    }
}
