//! Reconciliation of a local chain with the server's copy.
//!
//! Both sides are append-only, so reconciling is a set difference in each
//! direction: patches only the client has are uploaded, patches only the
//! server has are downloaded with their original timestamps. A patch is
//! identified by its timestamp and hash together, so a later patch that
//! returns the text to an earlier state is still transferred.

use rustc_hash::FxHashSet;
use tracing::{debug, info, warn};

use crate::chain::{Appended, ChainStore, PatchRef};
use crate::error::{PatchupError, Result};
use crate::identity::{Credentials, IdentityId};
use crate::protocol::{ChainRequest, PatchRefRequest, PostPatchRequest};
use crate::remote::Remote;

/// What a synchronization transferred.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Patches sent to the server.
    pub uploaded: Vec<PatchRef>,
    /// Patches fetched from the server.
    pub downloaded: Vec<PatchRef>,
    /// Patches whose transfer failed and was skipped.
    pub failed: Vec<PatchRef>,
}

impl SyncReport {
    /// Number of successful transfers.
    #[must_use]
    pub fn transfers(&self) -> usize {
        self.uploaded.len() + self.downloaded.len()
    }

    /// True when nothing was transferred or attempted.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.transfers() == 0 && self.failed.is_empty()
    }
}

/// Synchronizes one identity's local chains with a remote.
#[derive(Debug, Clone)]
pub struct Synchronizer {
    store: ChainStore,
    owner: IdentityId,
    credentials: Credentials,
}

impl Synchronizer {
    /// Synchronizer for the chains of `owner` in `store`.
    #[must_use]
    pub const fn new(store: ChainStore, owner: IdentityId, credentials: Credentials) -> Self {
        Self {
            store,
            owner,
            credentials,
        }
    }

    /// Credentials attached to every request.
    #[must_use]
    pub const fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Exchange the patches each side lacks for `filename`.
    ///
    /// Failing to transfer an individual patch is logged and recorded in
    /// [`SyncReport::failed`]; the remaining patches are still exchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote chain cannot be listed or the local
    /// chain cannot be read.
    pub async fn sync<R: Remote>(&self, remote: &R, filename: &str) -> Result<SyncReport> {
        let remote_refs = remote.list(self.chain_request(filename)).await?;
        let local_refs = self.store.list(&self.owner, filename)?;

        let remote_has: FxHashSet<PatchRef> = remote_refs.iter().copied().collect();
        let local_has: FxHashSet<PatchRef> = local_refs.iter().copied().collect();

        let mut report = SyncReport::default();

        for reference in local_refs.iter().filter(|r| !remote_has.contains(*r)) {
            match self.upload(remote, filename, reference).await {
                Ok(()) => report.uploaded.push(*reference),
                Err(e) => {
                    warn!(filename, timestamp = reference.timestamp, error = %e, "upload failed");
                    report.failed.push(*reference);
                }
            }
        }

        for reference in remote_refs.iter().filter(|r| !local_has.contains(*r)) {
            match self.download(remote, filename, reference).await {
                Ok(()) => report.downloaded.push(*reference),
                Err(e) => {
                    warn!(filename, timestamp = reference.timestamp, error = %e, "download failed");
                    report.failed.push(*reference);
                }
            }
        }

        if report.is_noop() {
            debug!(filename, "chains already in sync");
        } else {
            info!(
                filename,
                uploaded = report.uploaded.len(),
                downloaded = report.downloaded.len(),
                failed = report.failed.len(),
                "synchronized"
            );
        }
        Ok(report)
    }

    async fn upload<R: Remote>(&self, remote: &R, filename: &str, reference: &PatchRef) -> Result<()> {
        let patch = self.store.load(&self.owner, filename, reference)?;
        remote
            .post_patch(PostPatchRequest {
                credentials: self.credentials.clone(),
                filename: filename.to_string(),
                patch,
            })
            .await
    }

    async fn download<R: Remote>(&self, remote: &R, filename: &str, reference: &PatchRef) -> Result<()> {
        let patch = remote
            .get_patch(PatchRefRequest {
                credentials: self.credentials.clone(),
                filename: filename.to_string(),
                patch: *reference,
            })
            .await?;
        if patch.reference() != *reference {
            return Err(PatchupError::Remote(format!(
                "asked for patch {} but received {}",
                reference.timestamp, patch.timestamp
            )));
        }
        match self.store.append(&self.owner, filename, &patch)? {
            Appended::Stored | Appended::AlreadyPresent => Ok(()),
        }
    }

    fn chain_request(&self, filename: &str) -> ChainRequest {
        ChainRequest {
            credentials: self.credentials.clone(),
            filename: filename.to_string(),
        }
    }
}
