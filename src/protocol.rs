//! JSON wire format between client and server.
//!
//! Every endpoint takes a POST body carrying the caller's credentials and a
//! chain filename, and answers HTTP 200 with an [`Envelope`]:
//!
//! ```text
//! { "message": "...", "success": true|false, <operation field> }
//! ```
//!
//! Failures are signalled only by `success=false`; callers must check the
//! envelope, not the status code.

use serde::{Deserialize, Serialize};

use crate::chain::{Patch, PatchRef};
use crate::error::{PatchupError, Result};
use crate::hash::ContentHash;
use crate::identity::Credentials;

/// Lists a chain's patch metadata.
pub const LIST_PATH: &str = "/list";
/// Fetches one patch.
pub const GET_PATCH_PATH: &str = "/get-patch";
/// Appends one patch.
pub const POST_PATCH_PATH: &str = "/post-patch";
/// Reports the hash of the server's reconstruction.
pub const HASH_PATH: &str = "/hash";

/// Request scoped to one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRequest {
    /// Caller's credentials.
    #[serde(flatten)]
    pub credentials: Credentials,
    /// Chain filename.
    pub filename: String,
}

/// Request naming one patch of a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchRefRequest {
    /// Caller's credentials.
    #[serde(flatten)]
    pub credentials: Credentials,
    /// Chain filename.
    pub filename: String,
    /// The wanted patch.
    pub patch: PatchRef,
}

/// Request carrying a patch to append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostPatchRequest {
    /// Caller's credentials.
    #[serde(flatten)]
    pub credentials: Credentials,
    /// Chain filename.
    pub filename: String,
    /// The patch to append.
    pub patch: Patch,
}

/// Response envelope shared by every endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Human-readable outcome.
    pub message: String,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Operation-specific fields.
    #[serde(flatten)]
    pub body: T,
}

impl<T: Default> Envelope<T> {
    /// Successful response.
    pub fn ok(message: impl Into<String>, body: T) -> Self {
        Self {
            message: message.into(),
            success: true,
            body,
        }
    }

    /// Failed response with an empty body.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            success: false,
            body: T::default(),
        }
    }

    /// Envelope for an operation result.
    pub fn from_result(result: Result<T>, message: &str) -> Self {
        match result {
            Ok(body) => Self::ok(message, body),
            Err(e) => Self::failure(e.to_string()),
        }
    }

    /// The body, or `Remote` with the server's message on failure.
    ///
    /// # Errors
    ///
    /// Returns `Remote` when `success` is false.
    pub fn into_result(self) -> Result<T> {
        if self.success {
            Ok(self.body)
        } else {
            Err(PatchupError::Remote(self.message))
        }
    }
}

/// Body of a `list` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchList {
    /// Patch metadata in chain order.
    pub patches: Vec<PatchRef>,
}

/// Body of a `get-patch` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchBody {
    /// The requested patch.
    pub patch: Option<Patch>,
}

/// Body of a `hash` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HashBody {
    /// Hash of the server's reconstruction.
    pub hash: Option<ContentHash>,
}

/// Body of a `post-patch` response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {}
