//! OPA REST client: path-scoped data writes and policy module management.
//!
//! `Data` and `Policies` are the capability seams the sync loops depend on;
//! `HttpClient` is the real implementation, `mock::MockClient` a scripted
//! double for tests. Prefixing a `Data` handle returns an independent copy,
//! so one root client can be fanned out across concurrent sync tasks.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

pub mod mock;

/// Standard error body returned by the OPA API.
#[derive(Debug, Clone, Deserialize, thiserror::Error)]
#[error("code {code}: {message}")]
pub struct RemoteError {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Non-2xx response with a decoded `{code, message}` body.
    #[error("remote: {0}")]
    Remote(#[from] RemoteError),
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Pushing and querying data documents.
#[async_trait]
pub trait Data: Send + Sync {
    /// Independent copy whose paths are scoped under `path`. An empty path
    /// yields a plain copy.
    fn prefix(&self, path: &str) -> Box<dyn Data>;

    /// Unconditionally replace the subtree at `path`. Idempotent.
    async fn put_data(&self, path: &str, value: &Value) -> Result<(), Error>;

    /// Apply a single JSON-patch operation at `path`. For `"remove"`,
    /// absence of the path is not an error.
    async fn patch_data(&self, path: &str, op: &str, value: Option<&Value>) -> Result<(), Error>;

    /// Evaluate the document at `path` with `input`; `None` means the
    /// query was undefined.
    async fn post_data(&self, path: &str, input: &Value) -> Result<Option<Value>, Error>;
}

/// Managing named policy modules.
#[async_trait]
pub trait Policies: Send + Sync {
    async fn insert_policy(&self, id: &str, module: &[u8]) -> Result<(), Error>;
    async fn delete_policy(&self, id: &str) -> Result<(), Error>;
}

/// Full client capability: policies and data.
pub trait Client: Data + Policies {}
impl<T: Data + Policies> Client for T {}

/// HTTP implementation against the OPA REST API (`<url>/data`,
/// `<url>/policies`).
#[derive(Debug, Clone)]
pub struct HttpClient {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
    prefix: String,
}

impl HttpClient {
    pub fn new(url: &str, token: Option<&str>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: url.trim_end_matches('/').to_string(),
            token: token.map(str::to_string),
            prefix: String::new(),
        }
    }

    fn child(&self, path: &str) -> Self {
        let mut cpy = self.clone();
        cpy.prefix = join(&self.prefix, path);
        cpy
    }

    /// URL path for data requests: `/data[/<prefix>][/<path>]`.
    fn data_url(&self, path: &str) -> String {
        let joined = join(&self.prefix, path);
        if joined.is_empty() {
            format!("{}/data", self.base)
        } else {
            format!("{}/data/{}", self.base, joined)
        }
    }

    /// Document pointer used inside a JSON-patch body: `/<prefix>/<path>`.
    fn patch_pointer(&self, path: &str) -> String {
        format!("/{}", join(&self.prefix, path))
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let rb = self.http.request(method, url);
        match &self.token {
            Some(token) => rb.bearer_auth(token),
            None => rb,
        }
    }
}

/// Join prefix and path segments, trimming surplus slashes.
fn join(prefix: &str, path: &str) -> String {
    let path = path.trim_matches('/');
    match (prefix.is_empty(), path.is_empty()) {
        (true, _) => path.to_string(),
        (_, true) => prefix.to_string(),
        _ => format!("{}/{}", prefix, path),
    }
}

async fn handle_errors(resp: reqwest::Response) -> Result<(), Error> {
    if resp.status().is_success() {
        return Ok(());
    }
    let err: RemoteError = resp.json().await?;
    Err(Error::Remote(err))
}

#[derive(serde::Serialize)]
struct PatchOperation<'a> {
    path: String,
    op: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<&'a Value>,
}

#[async_trait]
impl Data for HttpClient {
    fn prefix(&self, path: &str) -> Box<dyn Data> {
        Box::new(self.child(path))
    }

    async fn put_data(&self, path: &str, value: &Value) -> Result<(), Error> {
        let url = self.data_url(path);
        debug!(url = %url, "put data");
        let resp = self
            .request(reqwest::Method::PUT, url)
            .json(value)
            .send()
            .await?;
        handle_errors(resp).await
    }

    async fn patch_data(&self, path: &str, op: &str, value: Option<&Value>) -> Result<(), Error> {
        let body = vec![PatchOperation {
            path: self.patch_pointer(path),
            op,
            value,
        }];
        let resp = self
            .request(reqwest::Method::PATCH, format!("{}/data", self.base))
            .json(&body)
            .send()
            .await?;
        // Removing an already-absent path is a success per the store contract.
        if op == "remove" && resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        handle_errors(resp).await
    }

    async fn post_data(&self, path: &str, input: &Value) -> Result<Option<Value>, Error> {
        #[derive(serde::Serialize)]
        struct Input<'a> {
            input: &'a Value,
        }
        #[derive(Deserialize)]
        struct Output {
            result: Option<Value>,
        }
        let resp = self
            .request(reqwest::Method::POST, self.data_url(path))
            .json(&Input { input })
            .send()
            .await?;
        if !resp.status().is_success() {
            let err: RemoteError = resp.json().await?;
            return Err(Error::Remote(err));
        }
        let out: Output = resp.json().await?;
        Ok(out.result)
    }
}

#[async_trait]
impl Policies for HttpClient {
    async fn insert_policy(&self, id: &str, module: &[u8]) -> Result<(), Error> {
        let id = id.trim_matches('/');
        let resp = self
            .request(reqwest::Method::PUT, format!("{}/policies/{}", self.base, id))
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(module.to_vec())
            .send()
            .await?;
        handle_errors(resp).await
    }

    async fn delete_policy(&self, id: &str) -> Result<(), Error> {
        let id = id.trim_matches('/');
        let resp = self
            .request(
                reqwest::Method::DELETE,
                format!("{}/policies/{}", self.base, id),
            )
            .send()
            .await?;
        handle_errors(resp).await
    }
}
