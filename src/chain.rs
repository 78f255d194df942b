//! Append-only patch chains on disk.
//!
//! A chain is the ordered history of patches for one file under one
//! identity. Each patch is one file inside the identity's folder, named
//! `<filename>.<timestamp>.<hash>`, so a directory listing alone recovers
//! the chain's metadata without opening any payload.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{PatchupError, Result};
use crate::hash::{ContentHash, HASH_HEX_LEN};
use crate::identity::IdentityId;

/// Metadata identifying one patch in a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PatchRef {
    /// Ordering key, strictly increasing along the chain.
    pub timestamp: u64,
    /// Hash of the text this patch produces when replayed.
    pub hash: ContentHash,
}

/// A stored patch: metadata plus the codec-encoded payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    /// Ordering key, strictly increasing along the chain.
    pub timestamp: u64,
    /// Hash of the text this patch produces when replayed.
    pub hash: ContentHash,
    /// Encoded diff from the previous reconstruction.
    pub payload: String,
}

impl Patch {
    /// Metadata of this patch.
    #[must_use]
    pub const fn reference(&self) -> PatchRef {
        PatchRef {
            timestamp: self.timestamp,
            hash: self.hash,
        }
    }
}

/// Outcome of [`ChainStore::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appended {
    /// The patch was written.
    Stored,
    /// An identical patch was already in the chain.
    AlreadyPresent,
}

/// How a directory entry relates to a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EntryName {
    /// A patch of this chain.
    Patch(PatchRef),
    /// Unrelated file.
    Foreign,
    /// Looks like a patch of this chain but cannot be parsed.
    Malformed(String),
}

/// Check that `filename` is a single plain path component.
///
/// # Errors
///
/// Returns `InvalidFilename` for empty names, `.`/`..`, names containing a
/// path separator or NUL, and names longer than 255 bytes.
pub fn validate_filename(filename: &str) -> Result<()> {
    let bad = filename.is_empty()
        || filename == "."
        || filename == ".."
        || filename.len() > 255
        || filename.contains(['/', '\\', '\0']);
    if bad {
        return Err(PatchupError::InvalidFilename(filename.to_string()));
    }
    Ok(())
}

/// Chain filename for a path on disk (its final component).
///
/// # Errors
///
/// Returns `InvalidFilename` if the path has no usable file name.
pub fn chain_filename(path: &Path) -> Result<String> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| PatchupError::InvalidFilename(path.display().to_string()))?;
    validate_filename(name)?;
    Ok(name.to_string())
}

/// Name of the file holding `patch` in the chain for `filename`.
#[must_use]
pub fn patch_file_name(filename: &str, patch: &PatchRef) -> String {
    format!("{filename}.{}.{}", patch.timestamp, patch.hash)
}

pub(crate) fn parse_entry_name(filename: &str, entry: &str) -> EntryName {
    let Some(rest) = entry
        .strip_prefix(filename)
        .and_then(|r| r.strip_prefix('.'))
    else {
        return EntryName::Foreign;
    };
    let Some((stamp, hash)) = rest.split_once('.') else {
        return EntryName::Foreign;
    };
    if hash.contains('.') || hash.len() != HASH_HEX_LEN {
        return EntryName::Foreign;
    }
    let Ok(hash) = ContentHash::from_hex(hash) else {
        return EntryName::Foreign;
    };
    match stamp.parse::<u64>() {
        Ok(timestamp) => EntryName::Patch(PatchRef { timestamp, hash }),
        Err(e) => EntryName::Malformed(format!("bad timestamp {stamp:?}: {e}")),
    }
}

/// Current time in milliseconds since the epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Filesystem-backed store of patch chains, one folder per identity.
#[derive(Debug, Clone)]
pub struct ChainStore {
    root: PathBuf,
}

impl ChainStore {
    /// Create a store rooted at `root`. Folders are created on first append.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root folder of the store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Folder holding every chain of `owner`.
    #[must_use]
    pub fn identity_dir(&self, owner: &IdentityId) -> PathBuf {
        self.root.join(owner.as_str())
    }

    /// Ordered patch metadata of a chain; empty if the chain does not exist.
    ///
    /// Entries that do not follow the chain's naming convention are ignored;
    /// entries that match it but carry an unparsable timestamp are skipped
    /// with a warning.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the folder exists but cannot be read.
    pub fn list(&self, owner: &IdentityId, filename: &str) -> Result<Vec<PatchRef>> {
        validate_filename(filename)?;
        let dir = self.identity_dir(owner);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut patches = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            match parse_entry_name(filename, name) {
                EntryName::Patch(patch) => patches.push(patch),
                EntryName::Foreign => {}
                EntryName::Malformed(reason) => {
                    warn!(entry = name, %reason, "skipping malformed patch file");
                }
            }
        }
        patches.sort_unstable_by_key(|p| (p.timestamp, p.hash));
        Ok(patches)
    }

    /// Whether the chain holds exactly this patch.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFilename` for a bad chain name.
    pub fn contains(&self, owner: &IdentityId, filename: &str, patch: &PatchRef) -> Result<bool> {
        validate_filename(filename)?;
        Ok(self.patch_path(owner, filename, patch).is_file())
    }

    /// Load one patch's payload.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the patch file is missing or unreadable.
    pub fn load(&self, owner: &IdentityId, filename: &str, patch: &PatchRef) -> Result<Patch> {
        validate_filename(filename)?;
        let payload = std::fs::read_to_string(self.patch_path(owner, filename, patch))?;
        Ok(Patch {
            timestamp: patch.timestamp,
            hash: patch.hash,
            payload,
        })
    }

    /// Append a patch to a chain.
    ///
    /// The payload is written to a temporary file and renamed into place, so
    /// readers never observe a partially written patch.
    ///
    /// # Errors
    ///
    /// Returns `EmptyPayload` for an empty payload, `DuplicateTimestamp` if a
    /// different patch already uses the timestamp, or an I/O error.
    pub fn append(&self, owner: &IdentityId, filename: &str, patch: &Patch) -> Result<Appended> {
        validate_filename(filename)?;
        if patch.payload.trim().is_empty() {
            return Err(PatchupError::EmptyPayload);
        }

        let existing = self.list(owner, filename)?;
        let reference = patch.reference();
        if existing.contains(&reference) {
            debug!(filename, timestamp = patch.timestamp, "patch already present");
            return Ok(Appended::AlreadyPresent);
        }
        if existing.iter().any(|p| p.timestamp == patch.timestamp) {
            return Err(PatchupError::DuplicateTimestamp {
                filename: filename.to_string(),
                timestamp: patch.timestamp,
            });
        }

        let dir = self.identity_dir(owner);
        std::fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::Builder::new()
            .prefix(".incoming-")
            .tempfile_in(&dir)?;
        std::io::Write::write_all(&mut tmp, patch.payload.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.patch_path(owner, filename, &reference))
            .map_err(|e| PatchupError::Io(e.error))?;

        debug!(
            filename,
            timestamp = patch.timestamp,
            hash = %patch.hash.short(),
            "appended patch"
        );
        Ok(Appended::Stored)
    }

    /// Timestamp for a new patch: the current time, or one past the newest
    /// patch if the clock has not moved beyond it.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the chain cannot be listed.
    pub fn next_timestamp(&self, owner: &IdentityId, filename: &str) -> Result<u64> {
        let last = self.list(owner, filename)?.last().map(|p| p.timestamp);
        Ok(match last {
            Some(last) => now_millis().max(last.saturating_add(1)),
            None => now_millis(),
        })
    }

    fn patch_path(&self, owner: &IdentityId, filename: &str, patch: &PatchRef) -> PathBuf {
        self.identity_dir(owner).join(patch_file_name(filename, patch))
    }
}
