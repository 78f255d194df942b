//! Chain server.
//!
//! [`ServerState`] implements the four chain operations against a
//! [`ChainStore`]; [`router`] exposes them as JSON endpoints. Every
//! operation authenticates the caller before touching any chain, and
//! appends to one chain are serialized by a per-chain lock.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::Method;
use axum::routing::{get, post};
use axum::{Json, Router};
use rustc_hash::FxHashMap;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::{self, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::chain::{validate_filename, Appended, ChainStore, Patch, PatchRef};
use crate::config::Config;
use crate::error::{PatchupError, Result};
use crate::hash::ContentHash;
use crate::identity::{Credentials, IdentityId, TrustRoot};
use crate::protocol::{
    Ack, ChainRequest, Envelope, HashBody, PatchBody, PatchList, PatchRefRequest,
    PostPatchRequest, GET_PATCH_PATH, HASH_PATH, LIST_PATH, POST_PATCH_PATH,
};
use crate::rebuild::Rebuilder;

type ChainKey = (IdentityId, String);

/// Shared state behind every request.
#[derive(Debug, Clone)]
pub struct ServerState {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    store: ChainStore,
    trust: TrustRoot,
    rebuilder: Rebuilder,
    locks: Mutex<FxHashMap<ChainKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl ServerState {
    /// Create state over `store`.
    #[must_use]
    pub fn new(store: ChainStore, trust: TrustRoot, rebuilder: Rebuilder) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                trust,
                rebuilder,
                locks: Mutex::new(FxHashMap::default()),
            }),
        }
    }

    /// State for the configured server store, trust root and policies.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            ChainStore::new(config.server_store_dir()),
            config.trust_root(),
            config.rebuilder(),
        )
    }

    /// The underlying chain store.
    #[must_use]
    pub fn store(&self) -> &ChainStore {
        &self.inner.store
    }

    /// Ordered patch metadata of the caller's chain.
    ///
    /// # Errors
    ///
    /// Returns `Authentication` for bad credentials, or an I/O error.
    pub async fn list(&self, request: ChainRequest) -> Result<Vec<PatchRef>> {
        let owner = self.authenticate(&request.credentials, &request.filename)?;
        let store = self.inner.store.clone();
        blocking(move || store.list(&owner, &request.filename)).await
    }

    /// One patch of the caller's chain.
    ///
    /// # Errors
    ///
    /// Returns `Authentication` for bad credentials, or an I/O error if the
    /// patch does not exist.
    pub async fn get_patch(&self, request: PatchRefRequest) -> Result<Patch> {
        let owner = self.authenticate(&request.credentials, &request.filename)?;
        let store = self.inner.store.clone();
        blocking(move || store.load(&owner, &request.filename, &request.patch)).await
    }

    /// Append a patch to the caller's chain.
    ///
    /// # Errors
    ///
    /// Returns `Authentication` for bad credentials, `EmptyPayload`,
    /// `DuplicateTimestamp`, or an I/O error.
    pub async fn post_patch(&self, request: PostPatchRequest) -> Result<Appended> {
        let owner = self.authenticate(&request.credentials, &request.filename)?;
        if request.patch.payload.trim().is_empty() {
            return Err(PatchupError::EmptyPayload);
        }

        let lease = self.lease((owner.clone(), request.filename.clone()));
        let _guard = lease.lock.lock().await;
        let store = self.inner.store.clone();
        let appended =
            blocking(move || store.append(&owner, &request.filename, &request.patch)).await?;
        Ok(appended)
    }

    /// Hash of the server's reconstruction of the caller's chain.
    ///
    /// # Errors
    ///
    /// Returns `Authentication` for bad credentials, an I/O error, or
    /// `Integrity` under a strict integrity policy.
    pub async fn hash(&self, request: ChainRequest) -> Result<ContentHash> {
        let owner = self.authenticate(&request.credentials, &request.filename)?;
        let inner = Arc::clone(&self.inner);
        let rebuilt =
            blocking(move || inner.rebuilder.rebuild(&inner.store, &owner, &request.filename))
                .await?;
        if !rebuilt.is_clean() {
            warn!(
                mismatches = rebuilt.mismatches.len(),
                "server reconstruction has integrity problems"
            );
        }
        Ok(rebuilt.hash)
    }

    fn authenticate(&self, credentials: &Credentials, filename: &str) -> Result<IdentityId> {
        let owner = self.inner.trust.verify(credentials)?;
        validate_filename(filename)?;
        debug!(owner = %owner, filename, "authenticated");
        Ok(owner)
    }

    fn lease(&self, key: ChainKey) -> ChainLease<'_> {
        let mut locks = self.inner.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let lock = Arc::clone(locks.entry(key.clone()).or_default());
        ChainLease {
            locks: &self.inner.locks,
            key,
            lock,
        }
    }
}

/// A handle on one chain's append lock. The map entry is removed when the
/// last lease on it is dropped.
struct ChainLease<'a> {
    locks: &'a Mutex<FxHashMap<ChainKey, Arc<tokio::sync::Mutex<()>>>>,
    key: ChainKey,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for ChainLease<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one held here.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.key);
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PatchupError::Io(std::io::Error::other(e)))?
}

/// HTTP routes for the chain operations plus an uptime probe at `/`.
///
/// Request bodies up to `max_body_bytes` are accepted.
pub fn router(state: ServerState, max_body_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::HEAD, Method::POST])
        .allow_origin(cors::Any);

    Router::new()
        .route("/", get(|| async { "OK" }))
        .route(LIST_PATH, post(list))
        .route(GET_PATCH_PATH, post(get_patch))
        .route(POST_PATCH_PATH, post(post_patch))
        .route(HASH_PATH, post(hash))
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn respond<T: Default>(operation: &str, result: Result<T>, message: &str) -> Json<Envelope<T>> {
    if let Err(e) = &result {
        warn!(operation, error = %e, "request failed");
    }
    Json(Envelope::from_result(result, message))
}

fn body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(request)| request)
        .map_err(|e| PatchupError::Serialization(e.body_text()))
}

async fn list(
    State(state): State<ServerState>,
    payload: std::result::Result<Json<ChainRequest>, JsonRejection>,
) -> Json<Envelope<PatchList>> {
    let result = match body(payload) {
        Ok(request) => state.list(request).await.map(|patches| PatchList { patches }),
        Err(e) => Err(e),
    };
    respond("list", result, "got patches")
}

async fn get_patch(
    State(state): State<ServerState>,
    payload: std::result::Result<Json<PatchRefRequest>, JsonRejection>,
) -> Json<Envelope<PatchBody>> {
    let result = match body(payload) {
        Ok(request) => state
            .get_patch(request)
            .await
            .map(|patch| PatchBody { patch: Some(patch) }),
        Err(e) => Err(e),
    };
    respond("get-patch", result, "got patch")
}

async fn post_patch(
    State(state): State<ServerState>,
    payload: std::result::Result<Json<PostPatchRequest>, JsonRejection>,
) -> Json<Envelope<Ack>> {
    let result = match body(payload) {
        Ok(request) => state.post_patch(request).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(Appended::Stored) => Json(Envelope::ok("stored patch", Ack {})),
        Ok(Appended::AlreadyPresent) => Json(Envelope::ok("patch already present", Ack {})),
        Err(e) => respond("post-patch", Err(e), ""),
    }
}

async fn hash(
    State(state): State<ServerState>,
    payload: std::result::Result<Json<ChainRequest>, JsonRejection>,
) -> Json<Envelope<HashBody>> {
    let result = match body(payload) {
        Ok(request) => state.hash(request).await.map(|hash| HashBody { hash: Some(hash) }),
        Err(e) => Err(e),
    };
    respond("hash", result, "got hash")
}

/// Bind `addr` and serve `state` in a background task.
///
/// Returns the bound address, useful when `addr` has port 0.
///
/// # Errors
///
/// Returns an I/O error if the address cannot be bound.
pub async fn spawn(
    state: ServerState,
    addr: SocketAddr,
    max_body_bytes: usize,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;
    let app = router(state, max_body_bytes);
    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("server stopped: {e}");
        }
    });
    info!("listening on {bound}");
    Ok((bound, task))
}

/// Run the server described by `config` until it fails.
///
/// # Errors
///
/// Returns an I/O error if the address cannot be bound or serving fails.
pub async fn serve(config: &Config) -> Result<()> {
    let state = ServerState::from_config(config);
    let listener = TcpListener::bind(config.server.socket_addr()).await?;
    info!(
        "serving chains from {} on {}",
        state.store().root().display(),
        listener.local_addr()?
    );
    axum::serve(listener, router(state, config.server.max_body_bytes)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PatchCodec;
    use crate::config::DEFAULT_MAX_BODY_BYTES;
    use crate::diff::TextPatch;
    use crate::hash::text_hash;
    use crate::identity::Identity;

    const SEED: &str = "server tests";

    fn state(dir: &std::path::Path) -> ServerState {
        ServerState::new(
            ChainStore::new(dir),
            TrustRoot::from_seed(SEED),
            Rebuilder::new(codec()),
        )
    }

    fn codec() -> PatchCodec {
        PatchCodec::from_passphrase("server tests")
    }

    fn credentials(identity: &Identity) -> Credentials {
        identity
            .credentials(&TrustRoot::from_seed(SEED).public_key())
            .unwrap()
    }

    fn patch(timestamp: u64, old: &str, new: &str) -> Patch {
        let diff = TextPatch::compute(old, new);
        Patch {
            timestamp,
            hash: text_hash(new),
            payload: codec().encode(&diff.to_bytes().unwrap()).unwrap(),
        }
    }

    fn post(identity: &Identity, patch: Patch) -> PostPatchRequest {
        PostPatchRequest {
            credentials: credentials(identity),
            filename: "f".to_string(),
            patch,
        }
    }

    fn chain(identity: &Identity) -> ChainRequest {
        ChainRequest {
            credentials: credentials(identity),
            filename: "f".to_string(),
        }
    }

    // ==========================================================================
    // OPERATIONS
    // ==========================================================================

    #[tokio::test]
    async fn post_list_get_hash() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let alice = Identity::generate("alice");

        let first = patch(1, "", "line1");
        let second = patch(2, "line1", "line1\nline2");
        state.post_patch(post(&alice, first.clone())).await.unwrap();
        state.post_patch(post(&alice, second)).await.unwrap();

        let listed = state.list(chain(&alice)).await.unwrap();
        assert_eq!(listed.len(), 2);

        let fetched = state
            .get_patch(PatchRefRequest {
                credentials: credentials(&alice),
                filename: "f".to_string(),
                patch: listed[0],
            })
            .await
            .unwrap();
        assert_eq!(fetched, first);

        let hash = state.hash(chain(&alice)).await.unwrap();
        assert_eq!(hash, text_hash("line1\nline2"));
    }

    #[tokio::test]
    async fn empty_chain_hash_is_empty_text_hash() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let hash = state.hash(chain(&Identity::generate("a"))).await.unwrap();
        assert_eq!(hash, text_hash(""));
    }

    #[tokio::test]
    async fn rejects_empty_payload() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let alice = Identity::generate("alice");
        let mut empty = patch(1, "", "x");
        empty.payload = String::new();
        assert!(matches!(
            state.post_patch(post(&alice, empty)).await,
            Err(PatchupError::EmptyPayload)
        ));
    }

    #[tokio::test]
    async fn rejects_foreign_credentials_before_touching_store() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let alice = Identity::generate("alice");
        let mut request = post(&alice, patch(1, "", "x"));
        request.credentials = alice
            .credentials(&TrustRoot::from_seed("elsewhere").public_key())
            .unwrap();

        assert!(matches!(
            state.post_patch(request).await,
            Err(PatchupError::Authentication(_))
        ));
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn rejects_path_like_filename() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let alice = Identity::generate("alice");
        let request = ChainRequest {
            credentials: credentials(&alice),
            filename: "../escape".to_string(),
        };
        assert!(matches!(
            state.list(request).await,
            Err(PatchupError::InvalidFilename(_))
        ));
    }

    #[tokio::test]
    async fn chains_are_isolated_per_identity() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let alice = Identity::generate("alice");
        let bob = Identity::generate("bob");
        state.post_patch(post(&alice, patch(1, "", "a"))).await.unwrap();
        assert!(state.list(chain(&bob)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_appends_keep_timestamps_unique() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let alice = Identity::generate("alice");

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let state = state.clone();
                let request = post(&alice, patch(42, "", &format!("v{i}")));
                tokio::spawn(async move { state.post_patch(request).await })
            })
            .collect();

        let mut stored = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(Appended::Stored) => stored += 1,
                Err(PatchupError::DuplicateTimestamp { .. }) => {}
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert_eq!(stored, 1);
        assert_eq!(state.list(chain(&alice)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn append_locks_are_released() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let alice = Identity::generate("alice");

        state.post_patch(post(&alice, patch(1, "", "a"))).await.unwrap();
        let mut other = post(&alice, patch(1, "", "b"));
        other.filename = "g".to_string();
        state.post_patch(other).await.unwrap();
        let rejected = state.post_patch(post(&alice, patch(1, "", "c"))).await;
        assert!(matches!(rejected, Err(PatchupError::DuplicateTimestamp { .. })));

        assert!(state.inner.locks.lock().unwrap().is_empty());
    }

    #[test]
    fn held_lease_keeps_its_entry() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let key: ChainKey = (Identity::generate("alice").id(), "f".to_string());

        let first = state.lease(key.clone());
        let second = state.lease(key.clone());
        assert!(Arc::ptr_eq(&first.lock, &second.lock));
        drop(first);
        assert!(state.inner.locks.lock().unwrap().contains_key(&key));
        drop(second);
        assert!(state.inner.locks.lock().unwrap().is_empty());
    }

    // ==========================================================================
    // HTTP
    // ==========================================================================

    #[tokio::test]
    async fn http_envelopes() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, task) = spawn(
            state(dir.path()),
            "127.0.0.1:0".parse().unwrap(),
            DEFAULT_MAX_BODY_BYTES,
        )
        .await
        .unwrap();
        let http = reqwest::Client::new();
        let base = format!("http://{addr}");

        let uptime = http.get(&base).send().await.unwrap();
        assert!(uptime.status().is_success());
        assert_eq!(uptime.text().await.unwrap(), "OK");
        let head = http.head(&base).send().await.unwrap();
        assert!(head.status().is_success());

        let alice = Identity::generate("alice");
        let ok: Envelope<PatchList> = http
            .post(format!("{base}{LIST_PATH}"))
            .json(&chain(&alice))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(ok.success);

        let malformed = http
            .post(format!("{base}{LIST_PATH}"))
            .header("content-type", "application/json")
            .body("{\"filename\": 3}")
            .send()
            .await
            .unwrap();
        assert!(malformed.status().is_success());
        let failure: Envelope<PatchList> = malformed.json().await.unwrap();
        assert!(!failure.success);
        assert!(!failure.message.is_empty());

        task.abort();
    }

    #[tokio::test]
    async fn body_limit_follows_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let alice = Identity::generate("alice");
        let big: String = (0..200).map(|i| format!("{}\n", text_hash(&i.to_string()).to_hex())).collect();
        let request = post(&alice, patch(1, "", &big));
        assert!(request.patch.payload.len() > 1024);

        let http = reqwest::Client::new();
        for (limit, accepted) in [(1024, false), (DEFAULT_MAX_BODY_BYTES, true)] {
            let (addr, task) = spawn(state(dir.path()), "127.0.0.1:0".parse().unwrap(), limit)
                .await
                .unwrap();
            let envelope: Envelope<Ack> = http
                .post(format!("http://{addr}{POST_PATCH_PATH}"))
                .json(&request)
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            assert_eq!(envelope.success, accepted, "limit {limit}: {}", envelope.message);
            task.abort();
        }
        assert_eq!(state(dir.path()).list(chain(&alice)).await.unwrap().len(), 1);
    }
}
