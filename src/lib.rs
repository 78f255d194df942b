//! # Patchup
//!
//! Keep a text file synchronized with a remote store by exchanging only
//! what changed.
//!
//! Every version of a file is recorded as a patch against the previous one.
//! The ordered patches form a chain that any party holding it can replay
//! from empty text to recover the latest content, checking each step
//! against the hash recorded with the patch.
//!
//! ## Features
//!
//! - **Line diff**: Myers diff with context-tolerant (fuzzy) application
//! - **Sealed patches**: zstd compression and XChaCha20-Poly1305 encryption
//! - **Verifiable replay**: BLAKE3 hash of the text after every patch
//! - **Chain reconciliation**: client and server exchange the patches each lacks
//! - **Keypair identities**: requests vouched for by a shared root of trust
//!
//! ## Example
//!
//! ```rust
//! use patchup::{text_hash, Patch, PatchCodec, Rebuilder, TextPatch};
//!
//! let codec = PatchCodec::from_passphrase("correct horse");
//!
//! // Record two versions of a document as a chain
//! let mut chain = Vec::new();
//! let mut previous = String::new();
//! for (timestamp, version) in [(1, "line1"), (2, "line1\nline2")] {
//!     let diff = TextPatch::compute(&previous, version);
//!     chain.push(Patch {
//!         timestamp,
//!         hash: text_hash(version),
//!         payload: codec.encode(&diff.to_bytes().unwrap()).unwrap(),
//!     });
//!     previous = version.to_string();
//! }
//!
//! // Replay it
//! let rebuilt = Rebuilder::new(codec).rebuild_patches(&chain).unwrap();
//! assert_eq!(rebuilt.text, "line1\nline2");
//! assert!(rebuilt.is_clean());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod chain;
pub mod client;
mod codec;
pub mod config;
mod diff;
mod error;
mod hash;
pub mod identity;
pub mod protocol;
mod rebuild;
pub mod remote;
pub mod server;
mod sync;

pub use chain::{Appended, ChainStore, Patch, PatchRef};
pub use client::{Client, PatchUpReport, Status};
pub use codec::PatchCodec;
pub use config::Config;
pub use diff::{ApplyMode, Applied, Hunk, HunkLine, PatchStats, TextPatch, CONTEXT_LINES, MAX_FUZZ};
pub use error::{PatchupError, Result};
pub use hash::{file_hash, normalize_line_endings, read_text, text_hash, ContentHash, HASH_HEX_LEN};
pub use identity::{Credentials, Identity, IdentityId, TrustRoot};
pub use rebuild::{IntegrityPolicy, Mismatch, Rebuilder, Rebuilt};
pub use remote::{HttpRemote, LocalRemote, Remote};
pub use server::ServerState;
pub use sync::{SyncReport, Synchronizer};
