//! Content hashing with line-ending normalization.
//!
//! Every hash recorded in a patch chain is a BLAKE3 digest of text whose line
//! terminators have been folded to `\n`, so the same document hashes the same
//! on every platform.

use std::borrow::Cow;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{PatchupError, Result};

/// Length of a hash rendered as hex.
pub const HASH_HEX_LEN: usize = 64;

/// Integrity hash of a reconstructed text.
///
/// # Example
///
/// ```rust
/// use patchup::ContentHash;
///
/// let unix = ContentHash::of_text("a\nb");
/// let dos = ContentHash::of_text("a\r\nb");
/// assert_eq!(unix, dos);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hash raw bytes without normalization.
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Hash text after normalizing its line endings.
    #[must_use]
    pub fn of_text(text: &str) -> Self {
        Self::compute(normalize_line_endings(text).as_bytes())
    }

    /// Create a `ContentHash` from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes of the hash.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Render as lowercase hex.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64 character hex string.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHash` if the string is not exactly 64 hex digits.
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != HASH_HEX_LEN {
            return Err(PatchupError::InvalidHash(s.to_string()));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| PatchupError::InvalidHash(s.to_string()))?;
        Ok(Self(bytes))
    }

    /// Short prefix for log lines.
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({}...)", self.short())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = PatchupError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl AsRef<[u8]> for ContentHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Fold `\r\n` and lone `\r` into `\n`.
///
/// Borrows the input when it contains no carriage returns.
#[must_use]
pub fn normalize_line_endings(text: &str) -> Cow<'_, str> {
    if !text.contains('\r') {
        return Cow::Borrowed(text);
    }
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\r' {
            if chars.peek() == Some(&'\n') {
                chars.next();
            }
            out.push('\n');
        } else {
            out.push(c);
        }
    }
    Cow::Owned(out)
}

/// Hash of text content, line endings normalized.
#[must_use]
pub fn text_hash(text: &str) -> ContentHash {
    ContentHash::of_text(text)
}

/// Read a file as UTF-8 text with normalized line endings.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be read in full, or `NotText`
/// if it is not valid UTF-8.
pub fn read_text(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    let text = String::from_utf8(bytes).map_err(|_| PatchupError::NotText(path.display().to_string()))?;
    Ok(normalize_line_endings(&text).into_owned())
}

/// Hash of a file's text content, line endings normalized.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be read, or `NotText` if it is
/// not valid UTF-8.
pub fn file_hash(path: &Path) -> Result<ContentHash> {
    Ok(ContentHash::compute(read_text(path)?.as_bytes()))
}
