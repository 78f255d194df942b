//! Client side: turning edits of a live file into patches on the server.
//!
//! The client keeps its own copy of every chain it has touched under
//! `<store>/<identity>/`. [`Client::patch_up`] brings that copy in sync with
//! the server, records the difference between the live file and the chain's
//! reconstruction as a new patch, and pushes it.

use std::fs::{File, OpenOptions};
use std::path::Path;

use crypto_box::PublicKey;
use fs2::FileExt;
use tracing::{debug, info, warn};

use crate::chain::{chain_filename, validate_filename, ChainStore, Patch, PatchRef};
use crate::config::Config;
use crate::diff::{ApplyMode, PatchStats, TextPatch};
use crate::error::{PatchupError, Result};
use crate::hash::{file_hash, read_text, text_hash, ContentHash};
use crate::identity::{random_username, Identity};
use crate::protocol::ChainRequest;
use crate::rebuild::{Rebuilder, Rebuilt};
use crate::remote::{HttpRemote, Remote};
use crate::sync::{SyncReport, Synchronizer};

const LOCK_FILE_NAME: &str = ".lock";

/// Outcome of [`Client::patch_up`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchUpReport {
    /// Chain filename.
    pub filename: String,
    /// Hash of the live file.
    pub hash: ContentHash,
    /// The patch created, if the file had changed.
    pub created: Option<PatchRef>,
    /// Size of the created patch.
    pub stats: Option<PatchStats>,
    /// Synchronization before creating the patch.
    pub pulled: SyncReport,
    /// Synchronization after creating the patch.
    pub pushed: SyncReport,
}

impl PatchUpReport {
    /// True when the file was already represented by the chain.
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        self.created.is_none()
    }
}

/// Live file hash against the server's reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    /// Hash of the live file.
    pub local: ContentHash,
    /// Hash of the server's reconstruction.
    pub remote: ContentHash,
}

impl Status {
    /// Whether the server already holds the live content.
    #[must_use]
    pub fn up_to_date(&self) -> bool {
        self.local == self.remote
    }
}

/// Exclusive hold on an identity's cache folder.
#[derive(Debug)]
struct CacheLock {
    file: File,
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("failed to release cache lock: {e}");
        }
    }
}

/// A client bound to one identity and one remote.
#[derive(Debug)]
pub struct Client<R> {
    remote: R,
    store: ChainStore,
    identity: Identity,
    synchronizer: Synchronizer,
    rebuilder: Rebuilder,
}

impl Client<HttpRemote> {
    /// Client for the configured server, loading or creating the identity.
    ///
    /// # Errors
    ///
    /// Returns `Config` if no server address is configured, or an error if
    /// the identity cannot be loaded or created.
    pub fn connect(config: &Config) -> Result<Self> {
        let address = config
            .client
            .server_address
            .as_deref()
            .ok_or_else(|| PatchupError::Config("no server address configured".to_string()))?;
        let username = config
            .client
            .username
            .clone()
            .unwrap_or_else(random_username);
        let identity = Identity::load_or_generate(&config.identity_path(), &username)?;
        Self::new(
            HttpRemote::new(address)?,
            ChainStore::new(config.client_store_dir()),
            identity,
            &config.trust_root().public_key(),
            config.rebuilder(),
        )
    }
}

impl<R: Remote> Client<R> {
    /// Create a client.
    ///
    /// # Errors
    ///
    /// Returns `Authentication` if credentials cannot be sealed for `trust`.
    pub fn new(
        remote: R,
        store: ChainStore,
        identity: Identity,
        trust: &PublicKey,
        rebuilder: Rebuilder,
    ) -> Result<Self> {
        let credentials = identity.credentials(trust)?;
        let synchronizer = Synchronizer::new(store.clone(), identity.id(), credentials);
        Ok(Self {
            remote,
            store,
            identity,
            synchronizer,
            rebuilder,
        })
    }

    /// The client's identity.
    #[must_use]
    pub const fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The local chain store.
    #[must_use]
    pub const fn store(&self) -> &ChainStore {
        &self.store
    }

    /// Record the current content of `path` in its chain and push it.
    ///
    /// # Errors
    ///
    /// Returns `FileNotFound` if `path` is not a file, `CacheLocked` if
    /// another process is working on the same cache, or an error if the
    /// remote chain cannot be listed or the new patch cannot be built.
    pub async fn patch_up(&self, path: &Path) -> Result<PatchUpReport> {
        let filename = chain_filename(path)?;
        if !path.is_file() {
            return Err(PatchupError::FileNotFound(path.display().to_string()));
        }
        let _lock = self.lock()?;

        let pulled = self.synchronizer.sync(&self.remote, &filename).await?;

        let live = snapshot_text(path)?;
        let hash = text_hash(&live);
        let rebuilt = self.rebuild(&filename)?;
        if rebuilt.hash == hash {
            info!(filename, hash = %hash.short(), "already up to date");
            return Ok(PatchUpReport {
                filename,
                hash,
                created: None,
                stats: None,
                pulled,
                pushed: SyncReport::default(),
            });
        }

        let diff = TextPatch::compute(&rebuilt.text, &live);
        let check = diff.apply_with(&rebuilt.text, ApplyMode::Strict)?;
        let actual = text_hash(&check.text);
        if actual != hash {
            return Err(PatchupError::Integrity {
                expected: hash.to_hex(),
                actual: actual.to_hex(),
            });
        }

        let plain = diff.to_bytes()?;
        let payload = self.rebuilder.codec().encode(&plain)?;
        let stats = diff.stats();
        let owner = self.identity.id();
        let patch = Patch {
            timestamp: self.store.next_timestamp(&owner, &filename)?,
            hash,
            payload,
        };
        self.store.append(&owner, &filename, &patch)?;
        info!(
            filename,
            hunks = stats.hunks,
            inserted = stats.inserted,
            deleted = stats.deleted,
            encoded = patch.payload.len(),
            ratio = format_args!("{:.3}", ratio(patch.payload.len(), live.len())),
            "created patch"
        );

        let pushed = self.synchronizer.sync(&self.remote, &filename).await?;
        if pushed.failed.contains(&patch.reference()) {
            warn!(filename, "new patch is stored locally but did not reach the server");
        }

        Ok(PatchUpReport {
            filename,
            hash,
            created: Some(patch.reference()),
            stats: Some(stats),
            pulled,
            pushed,
        })
    }

    /// Synchronize the local chain for `filename` with the server.
    ///
    /// # Errors
    ///
    /// Returns `CacheLocked` if the cache is busy, or an error if the
    /// remote chain cannot be listed.
    pub async fn sync(&self, filename: &str) -> Result<SyncReport> {
        validate_filename(filename)?;
        let _lock = self.lock()?;
        self.synchronizer.sync(&self.remote, filename).await
    }

    /// Reconstruct `filename` from the local chain without contacting the
    /// server.
    ///
    /// # Errors
    ///
    /// Returns an I/O error, or `Integrity` under a strict policy.
    pub fn rebuild(&self, filename: &str) -> Result<Rebuilt> {
        let rebuilt = self
            .rebuilder
            .rebuild(&self.store, &self.identity.id(), filename)?;
        if !rebuilt.is_clean() {
            warn!(
                filename,
                mismatches = rebuilt.mismatches.len(),
                "local reconstruction has integrity problems"
            );
        }
        Ok(rebuilt)
    }

    /// Hash of the server's reconstruction of `filename`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn remote_hash(&self, filename: &str) -> Result<ContentHash> {
        validate_filename(filename)?;
        self.remote
            .hash(ChainRequest {
                credentials: self.synchronizer.credentials().clone(),
                filename: filename.to_string(),
            })
            .await
    }

    /// Compare `path` with the server's reconstruction.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be hashed or the request fails.
    pub async fn status(&self, path: &Path) -> Result<Status> {
        let filename = chain_filename(path)?;
        let local = file_hash(path)?;
        let remote = self.remote_hash(&filename).await?;
        Ok(Status { local, remote })
    }

    fn lock(&self) -> Result<CacheLock> {
        let dir = self.store.identity_dir(&self.identity.id());
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        file.try_lock_exclusive()
            .map_err(|_| PatchupError::CacheLocked(dir.display().to_string()))?;
        debug!(path = %path.display(), "acquired cache lock");
        Ok(CacheLock { file })
    }
}

/// Read `path` through a temporary copy so a concurrent writer cannot
/// change it mid-read.
fn snapshot_text(path: &Path) -> Result<String> {
    let snapshot = tempfile::NamedTempFile::new()?;
    std::fs::copy(path, snapshot.path())?;
    let text = read_text(snapshot.path())?;
    snapshot.close()?;
    Ok(text)
}

#[allow(clippy::cast_precision_loss)]
fn ratio(encoded: usize, original: usize) -> f64 {
    if original == 0 {
        return 0.0;
    }
    encoded as f64 / original as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PatchCodec;
    use crate::identity::TrustRoot;
    use crate::remote::LocalRemote;
    use crate::server::ServerState;

    const SEED: &str = "client tests";

    struct Fixture {
        dir: tempfile::TempDir,
        client: Client<LocalRemote>,
    }

    fn rebuilder() -> Rebuilder {
        Rebuilder::new(PatchCodec::from_passphrase("client tests"))
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let trust = TrustRoot::from_seed(SEED);
        let state = ServerState::new(
            ChainStore::new(dir.path().join("server")),
            trust.clone(),
            rebuilder(),
        );
        let client = Client::new(
            LocalRemote::new(state),
            ChainStore::new(dir.path().join("client")),
            Identity::generate("alice"),
            &trust.public_key(),
            rebuilder(),
        )
        .unwrap();
        Fixture { dir, client }
    }

    fn write(fx: &Fixture, name: &str, text: &str) -> std::path::PathBuf {
        let path = fx.dir.path().join(name);
        std::fs::write(&path, text).unwrap();
        path
    }

    #[tokio::test]
    async fn first_patch_up_creates_patch() {
        let fx = fixture();
        let path = write(&fx, "f", "line1");
        let report = fx.client.patch_up(&path).await.unwrap();
        assert!(!report.is_noop());
        assert_eq!(report.hash, text_hash("line1"));
        assert_eq!(report.pushed.uploaded, vec![report.created.unwrap()]);
    }

    #[tokio::test]
    async fn unchanged_file_is_noop() {
        let fx = fixture();
        let path = write(&fx, "f", "line1\n");
        fx.client.patch_up(&path).await.unwrap();
        let again = fx.client.patch_up(&path).await.unwrap();
        assert!(again.is_noop());
        assert!(again.pulled.is_noop());
    }

    #[tokio::test]
    async fn line_endings_do_not_create_patches() {
        let fx = fixture();
        let path = write(&fx, "f", "a\nb\n");
        fx.client.patch_up(&path).await.unwrap();
        std::fs::write(&path, "a\r\nb\r\n").unwrap();
        assert!(fx.client.patch_up(&path).await.unwrap().is_noop());
    }

    #[tokio::test]
    async fn empty_file_on_empty_chain_is_noop() {
        let fx = fixture();
        let path = write(&fx, "f", "");
        assert!(fx.client.patch_up(&path).await.unwrap().is_noop());
    }

    #[tokio::test]
    async fn edits_accumulate_and_rebuild() {
        let fx = fixture();
        let path = write(&fx, "f", "line1");
        fx.client.patch_up(&path).await.unwrap();
        std::fs::write(&path, "line1\nline2").unwrap();
        let report = fx.client.patch_up(&path).await.unwrap();
        assert_eq!(report.stats.unwrap().inserted, 2);

        let rebuilt = fx.client.rebuild("f").unwrap();
        assert_eq!(rebuilt.text, "line1\nline2");
        assert_eq!(rebuilt.patches, 2);

        let status = fx.client.status(&path).await.unwrap();
        assert!(status.up_to_date());
    }

    #[tokio::test]
    async fn status_reports_unsynced_edit() {
        let fx = fixture();
        let path = write(&fx, "f", "v1\n");
        fx.client.patch_up(&path).await.unwrap();
        std::fs::write(&path, "v2\n").unwrap();
        let status = fx.client.status(&path).await.unwrap();
        assert!(!status.up_to_date());
        assert_eq!(status.remote, text_hash("v1\n"));
    }

    #[tokio::test]
    async fn missing_file_is_reported() {
        let fx = fixture();
        let err = fx.client.patch_up(&fx.dir.path().join("nope")).await.unwrap_err();
        assert!(matches!(err, PatchupError::FileNotFound(_)));
    }

    #[tokio::test]
    async fn held_lock_rejects_patch_up() {
        let fx = fixture();
        let path = write(&fx, "f", "x");
        let _held = fx.client.lock().unwrap();
        let err = fx.client.patch_up(&path).await.unwrap_err();
        assert!(matches!(err, PatchupError::CacheLocked(_)));
    }

    #[test]
    fn snapshot_reads_normalized_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc");
        std::fs::write(&path, "a\r\nb").unwrap();
        assert_eq!(snapshot_text(&path).unwrap(), "a\nb");
    }
}
