//! Transports between a client and the chain server.
//!
//! [`Remote`] is the request/response contract of the four server
//! operations. [`HttpRemote`] speaks the JSON protocol over HTTP;
//! [`LocalRemote`] calls a [`ServerState`] in the same process.

use std::future::Future;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::chain::{Patch, PatchRef};
use crate::error::{PatchupError, Result};
use crate::hash::ContentHash;
use crate::protocol::{
    Ack, ChainRequest, Envelope, HashBody, PatchBody, PatchList, PatchRefRequest,
    PostPatchRequest, GET_PATCH_PATH, HASH_PATH, LIST_PATH, POST_PATCH_PATH,
};
use crate::server::ServerState;

/// Timeout applied to every HTTP request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The server operations a client relies on.
pub trait Remote: Send + Sync {
    /// Ordered patch metadata of a chain.
    fn list(&self, request: ChainRequest) -> impl Future<Output = Result<Vec<PatchRef>>> + Send;

    /// One patch with its payload.
    fn get_patch(&self, request: PatchRefRequest) -> impl Future<Output = Result<Patch>> + Send;

    /// Append a patch to a chain.
    fn post_patch(&self, request: PostPatchRequest) -> impl Future<Output = Result<()>> + Send;

    /// Hash of the server's reconstruction of a chain.
    fn hash(&self, request: ChainRequest) -> impl Future<Output = Result<ContentHash>> + Send;
}

/// JSON-over-HTTP client for a chain server.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    base: String,
    http: reqwest::Client,
}

impl HttpRemote {
    /// Create a remote for `address`, e.g. `http://host:8002` or `host:8002`.
    ///
    /// # Errors
    ///
    /// Returns `Network` if the HTTP client cannot be built.
    pub fn new(address: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PatchupError::Network(e.to_string()))?;
        Ok(Self {
            base: normalize_address(address),
            http,
        })
    }

    /// Base URL requests are sent to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base
    }

    async fn call<Req, T>(&self, path: &str, request: &Req) -> Result<T>
    where
        Req: Serialize + Sync,
        T: DeserializeOwned + Default,
    {
        let url = format!("{}{path}", self.base);
        debug!(%url, "request");
        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| PatchupError::Network(format!("{url}: {e}")))?;
        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| PatchupError::Network(format!("{url}: malformed response: {e}")))?;
        envelope.into_result()
    }
}

impl Remote for HttpRemote {
    async fn list(&self, request: ChainRequest) -> Result<Vec<PatchRef>> {
        let body: PatchList = self.call(LIST_PATH, &request).await?;
        Ok(body.patches)
    }

    async fn get_patch(&self, request: PatchRefRequest) -> Result<Patch> {
        let body: PatchBody = self.call(GET_PATCH_PATH, &request).await?;
        body.patch
            .ok_or_else(|| PatchupError::Remote("response carries no patch".to_string()))
    }

    async fn post_patch(&self, request: PostPatchRequest) -> Result<()> {
        let _: Ack = self.call(POST_PATCH_PATH, &request).await?;
        Ok(())
    }

    async fn hash(&self, request: ChainRequest) -> Result<ContentHash> {
        let body: HashBody = self.call(HASH_PATH, &request).await?;
        body.hash
            .ok_or_else(|| PatchupError::Remote("response carries no hash".to_string()))
    }
}

/// In-process remote backed directly by server state.
#[derive(Debug, Clone)]
pub struct LocalRemote {
    state: ServerState,
}

impl LocalRemote {
    /// Wrap server state.
    #[must_use]
    pub const fn new(state: ServerState) -> Self {
        Self { state }
    }

    /// The wrapped server state.
    #[must_use]
    pub const fn state(&self) -> &ServerState {
        &self.state
    }
}

impl Remote for LocalRemote {
    async fn list(&self, request: ChainRequest) -> Result<Vec<PatchRef>> {
        self.state.list(request).await
    }

    async fn get_patch(&self, request: PatchRefRequest) -> Result<Patch> {
        self.state.get_patch(request).await
    }

    async fn post_patch(&self, request: PostPatchRequest) -> Result<()> {
        self.state.post_patch(request).await.map(|_| ())
    }

    async fn hash(&self, request: ChainRequest) -> Result<ContentHash> {
        self.state.hash(request).await
    }
}

/// Add a scheme if missing and drop trailing slashes.
fn normalize_address(address: &str) -> String {
    let address = address.trim().trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}
