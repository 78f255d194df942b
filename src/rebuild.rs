//! Chain replay.
//!
//! Rebuilding starts from empty text and applies every patch of a chain in
//! order, checking each intermediate text against the hash recorded for the
//! patch. Payloads are loaded and decoded in parallel since they are
//! independent of each other; application is inherently sequential.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::chain::{ChainStore, Patch, PatchRef};
use crate::codec::PatchCodec;
use crate::diff::{ApplyMode, TextPatch};
use crate::error::{PatchupError, Result};
use crate::hash::{text_hash, ContentHash};
use crate::identity::IdentityId;

/// What to do when a replayed patch does not reproduce its recorded hash.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IntegrityPolicy {
    /// Record the mismatch and keep replaying.
    #[default]
    BestEffort,
    /// Stop at the first mismatch.
    Strict,
}

/// A patch whose replay did not match its recorded hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    /// The offending patch.
    pub patch: PatchRef,
    /// Hash of the text after applying it, or `None` if it could not be decoded.
    pub actual: Option<ContentHash>,
    /// Why the patch is considered bad.
    pub reason: String,
}

/// Outcome of a rebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rebuilt {
    /// Reconstructed text.
    pub text: String,
    /// Hash of the reconstructed text.
    pub hash: ContentHash,
    /// Number of patches replayed.
    pub patches: usize,
    /// Integrity problems met along the way.
    pub mismatches: Vec<Mismatch>,
}

impl Rebuilt {
    /// Reconstruction of an empty chain.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            text: String::new(),
            hash: text_hash(""),
            patches: 0,
            mismatches: Vec::new(),
        }
    }

    /// True when every patch reproduced its recorded hash.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Replays patch chains.
#[derive(Debug, Clone)]
pub struct Rebuilder {
    codec: PatchCodec,
    integrity: IntegrityPolicy,
    apply_mode: ApplyMode,
}

impl Rebuilder {
    /// Create a rebuilder with best-effort integrity and lenient application.
    #[must_use]
    pub fn new(codec: PatchCodec) -> Self {
        Self {
            codec,
            integrity: IntegrityPolicy::default(),
            apply_mode: ApplyMode::default(),
        }
    }

    /// Set the integrity policy.
    #[must_use]
    pub const fn with_integrity(mut self, integrity: IntegrityPolicy) -> Self {
        self.integrity = integrity;
        self
    }

    /// Set how unlocated hunks are treated.
    #[must_use]
    pub const fn with_apply_mode(mut self, apply_mode: ApplyMode) -> Self {
        self.apply_mode = apply_mode;
        self
    }

    /// The codec used to decode payloads.
    #[must_use]
    pub const fn codec(&self) -> &PatchCodec {
        &self.codec
    }

    /// Rebuild a stored chain.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the chain cannot be listed or a patch cannot
    /// be read, or `Integrity` under [`IntegrityPolicy::Strict`].
    pub fn rebuild(&self, store: &ChainStore, owner: &IdentityId, filename: &str) -> Result<Rebuilt> {
        let refs = store.list(owner, filename)?;
        let patches = refs
            .par_iter()
            .map(|r| store.load(owner, filename, r))
            .collect::<Result<Vec<_>>>()?;
        self.rebuild_patches(&patches)
    }

    /// Replay patches already in memory, in the given order.
    ///
    /// # Errors
    ///
    /// Returns `Integrity` under [`IntegrityPolicy::Strict`] at the first
    /// patch that fails to decode, apply or match its hash.
    pub fn rebuild_patches(&self, patches: &[Patch]) -> Result<Rebuilt> {
        let decoded: Vec<Result<TextPatch>> = patches
            .par_iter()
            .map(|p| {
                let bytes = self.codec.decode(&p.payload)?;
                TextPatch::from_bytes(&bytes)
            })
            .collect();

        let mut rebuilt = Rebuilt::empty();
        for (patch, diff) in patches.iter().zip(decoded) {
            let reference = patch.reference();
            let step = diff.and_then(|d| d.apply_with(&rebuilt.text, self.apply_mode));
            let mismatch = match step {
                Ok(applied) => {
                    rebuilt.text = applied.text;
                    let actual = text_hash(&rebuilt.text);
                    if actual == patch.hash {
                        None
                    } else if applied.failed_hunks.is_empty() {
                        Some(Mismatch {
                            patch: reference,
                            actual: Some(actual),
                            reason: "hash mismatch".to_string(),
                        })
                    } else {
                        Some(Mismatch {
                            patch: reference,
                            actual: Some(actual),
                            reason: format!("hunks {:?} not applied", applied.failed_hunks),
                        })
                    }
                }
                Err(e) => Some(Mismatch {
                    patch: reference,
                    actual: None,
                    reason: e.to_string(),
                }),
            };
            rebuilt.patches += 1;

            if let Some(mismatch) = mismatch {
                warn!(
                    timestamp = reference.timestamp,
                    expected = %reference.hash.short(),
                    reason = %mismatch.reason,
                    "patch does not reproduce its recorded hash"
                );
                if self.integrity == IntegrityPolicy::Strict {
                    return Err(PatchupError::Integrity {
                        expected: reference.hash.to_hex(),
                        actual: mismatch
                            .actual
                            .map_or_else(|| mismatch.reason.clone(), |h| h.to_hex()),
                    });
                }
                rebuilt.mismatches.push(mismatch);
            }
        }

        rebuilt.hash = text_hash(&rebuilt.text);
        debug!(
            patches = rebuilt.patches,
            mismatches = rebuilt.mismatches.len(),
            hash = %rebuilt.hash.short(),
            "rebuilt chain"
        );
        Ok(rebuilt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> PatchCodec {
        PatchCodec::from_passphrase("rebuild tests")
    }

    /// Build an honest chain through the given versions.
    fn chain(codec: &PatchCodec, versions: &[&str]) -> Vec<Patch> {
        let mut prev = "";
        versions
            .iter()
            .enumerate()
            .map(|(i, text)| {
                let diff = TextPatch::compute(prev, text);
                prev = text;
                Patch {
                    timestamp: i as u64 + 1,
                    hash: text_hash(text),
                    payload: codec.encode(&diff.to_bytes().unwrap()).unwrap(),
                }
            })
            .collect()
    }

    // ==========================================================================
    // REPLAY
    // ==========================================================================

    #[test]
    fn empty_chain() {
        let rebuilt = Rebuilder::new(codec()).rebuild_patches(&[]).unwrap();
        assert_eq!(rebuilt, Rebuilt::empty());
        assert_eq!(rebuilt.hash, text_hash(""));
    }

    #[test]
    fn replays_versions() {
        let codec = codec();
        let patches = chain(&codec, &["line1", "line1\nline2", "line0\nline1\nline2\n"]);
        let rebuilt = Rebuilder::new(codec).rebuild_patches(&patches).unwrap();
        assert_eq!(rebuilt.text, "line0\nline1\nline2\n");
        assert_eq!(rebuilt.patches, 3);
        assert!(rebuilt.is_clean());
    }

    #[test]
    fn replay_is_deterministic() {
        let codec = codec();
        let patches = chain(&codec, &["a\nb\n", "a\nc\n", "x\na\nc\n"]);
        let rebuilder = Rebuilder::new(codec);
        let first = rebuilder.rebuild_patches(&patches).unwrap();
        let second = rebuilder.rebuild_patches(&patches).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn rebuild_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChainStore::new(dir.path());
        let owner = crate::identity::Identity::generate("t").id();
        let codec = codec();
        for patch in chain(&codec, &["one\n", "one\ntwo\n"]) {
            store.append(&owner, "doc", &patch).unwrap();
        }
        let rebuilt = Rebuilder::new(codec).rebuild(&store, &owner, "doc").unwrap();
        assert_eq!(rebuilt.text, "one\ntwo\n");
    }

    // ==========================================================================
    // INTEGRITY
    // ==========================================================================

    #[test]
    fn best_effort_continues_past_bad_hash() {
        let codec = codec();
        let mut patches = chain(&codec, &["a\n", "a\nb\n", "a\nb\nc\n"]);
        patches[1].hash = text_hash("something else");

        let rebuilt = Rebuilder::new(codec).rebuild_patches(&patches).unwrap();
        assert_eq!(rebuilt.text, "a\nb\nc\n");
        assert_eq!(rebuilt.mismatches.len(), 1);
        assert_eq!(rebuilt.mismatches[0].patch.timestamp, 2);
        assert_eq!(rebuilt.mismatches[0].actual, Some(text_hash("a\nb\n")));
    }

    #[test]
    fn strict_stops_at_bad_hash() {
        let codec = codec();
        let mut patches = chain(&codec, &["a\n", "a\nb\n"]);
        patches[0].hash = text_hash("nope");

        let err = Rebuilder::new(codec)
            .with_integrity(IntegrityPolicy::Strict)
            .rebuild_patches(&patches)
            .unwrap_err();
        assert!(matches!(err, PatchupError::Integrity { .. }));
    }

    #[test]
    fn undecodable_patch_is_integrity_problem() {
        let codec = codec();
        let mut patches = chain(&codec, &["a\n", "a\nb\n", "a\nb\nc\n"]);
        patches[1].payload = "garbage".to_string();

        let rebuilt = Rebuilder::new(codec.clone()).rebuild_patches(&patches).unwrap();
        assert_eq!(rebuilt.mismatches.len(), 2);
        assert_eq!(rebuilt.mismatches[0].actual, None);

        let strict = Rebuilder::new(codec).with_integrity(IntegrityPolicy::Strict);
        assert!(matches!(
            strict.rebuild_patches(&patches),
            Err(PatchupError::Integrity { .. })
        ));
    }

    #[test]
    fn wrong_key_flags_every_patch() {
        let patches = chain(&codec(), &["a\n", "b\n"]);
        let rebuilt = Rebuilder::new(PatchCodec::from_passphrase("other"))
            .rebuild_patches(&patches)
            .unwrap();
        assert_eq!(rebuilt.mismatches.len(), 2);
        assert_eq!(rebuilt.text, "");
    }

    #[test]
    fn policy_serde_names() {
        let json = serde_json::to_string(&IntegrityPolicy::BestEffort).unwrap();
        assert_eq!(json, "\"best-effort\"");
    }
}
