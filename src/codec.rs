//! Patch blob codec: compress, encrypt, then base64.
//!
//! Stored and transmitted patches are text blobs produced by
//! [`PatchCodec::encode`]. The pipeline is zstd compression, XChaCha20-Poly1305
//! sealing under a key derived from the configured passphrase, and standard
//! base64. Decoding runs the stages in reverse and fails as a whole: a bad
//! base64 alphabet, a failed authentication tag or a corrupt zstd frame never
//! yield partial plaintext.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};

use crate::error::{PatchupError, Result};

/// Size of the XChaCha20-Poly1305 nonce prefixed to every sealed blob.
pub const NONCE_SIZE: usize = 24;

/// Size of the Poly1305 authentication tag.
pub const TAG_SIZE: usize = 16;

/// zstd level used for patch compression.
pub const COMPRESSION_LEVEL: i32 = 3;

const KEY_CONTEXT: &str = "patchup 2024 patch codec key";

/// Encoder/decoder for patch payloads.
#[derive(Clone)]
pub struct PatchCodec {
    key: [u8; 32],
}

impl PatchCodec {
    /// Build a codec whose key is derived from `passphrase`.
    #[must_use]
    pub fn from_passphrase(passphrase: &str) -> Self {
        Self {
            key: blake3::derive_key(KEY_CONTEXT, passphrase.as_bytes()),
        }
    }

    /// Build a codec from a raw 256-bit key.
    #[must_use]
    pub const fn from_key(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Compress, seal and base64 encode `plain`.
    ///
    /// # Errors
    ///
    /// Returns `Codec` if compression or sealing fails.
    pub fn encode(&self, plain: &[u8]) -> Result<String> {
        let compressed = zstd::encode_all(plain, COMPRESSION_LEVEL)
            .map_err(|e| PatchupError::Codec(format!("compression failed: {e}")))?;

        let cipher = XChaCha20Poly1305::new((&self.key).into());
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let sealed = cipher
            .encrypt(&nonce, compressed.as_slice())
            .map_err(|_| PatchupError::Codec("encryption failed".to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + sealed.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&sealed);
        Ok(STANDARD.encode(blob))
    }

    /// Reverse [`encode`](Self::encode).
    ///
    /// # Errors
    ///
    /// Returns `Codec` if any stage fails.
    pub fn decode(&self, blob: &str) -> Result<Vec<u8>> {
        let raw = STANDARD
            .decode(blob.trim())
            .map_err(|e| PatchupError::Codec(format!("invalid base64: {e}")))?;
        if raw.len() < NONCE_SIZE + TAG_SIZE {
            return Err(PatchupError::Codec(format!(
                "blob too short: {} bytes",
                raw.len()
            )));
        }

        let (nonce, sealed) = raw.split_at(NONCE_SIZE);
        let cipher = XChaCha20Poly1305::new((&self.key).into());
        let compressed = cipher
            .decrypt(XNonce::from_slice(nonce), sealed)
            .map_err(|_| PatchupError::Codec("authentication failed".to_string()))?;

        zstd::decode_all(compressed.as_slice())
            .map_err(|e| PatchupError::Codec(format!("decompression failed: {e}")))
    }
}

impl std::fmt::Debug for PatchCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PatchCodec(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> PatchCodec {
        PatchCodec::from_passphrase("test passphrase")
    }

    #[test]
    fn roundtrip_text() {
        let codec = codec();
        let blob = codec.encode(b"@@ -1 +1 @@\n-old\n+new\n").unwrap();
        assert_eq!(codec.decode(&blob).unwrap(), b"@@ -1 +1 @@\n-old\n+new\n");
    }

    #[test]
    fn roundtrip_empty() {
        let codec = codec();
        let blob = codec.encode(b"").unwrap();
        assert!(!blob.is_empty());
        assert!(codec.decode(&blob).unwrap().is_empty());
    }

    #[test]
    fn encode_is_randomized() {
        let codec = codec();
        assert_ne!(codec.encode(b"same").unwrap(), codec.encode(b"same").unwrap());
    }

    #[test]
    fn blob_is_transport_safe() {
        let blob = codec().encode(&[0u8, 1, 2, 255, 254]).unwrap();
        assert!(blob
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '='));
    }

    #[test]
    fn wrong_passphrase_fails() {
        let blob = codec().encode(b"secret patch").unwrap();
        let other = PatchCodec::from_passphrase("another passphrase");
        assert!(matches!(other.decode(&blob), Err(PatchupError::Codec(_))));
    }

    #[test]
    fn truncated_blob_fails() {
        let blob = codec().encode(b"secret patch").unwrap();
        assert!(codec().decode(&blob[..blob.len() / 2]).is_err());
    }

    #[test]
    fn invalid_base64_fails() {
        assert!(codec().decode("not base64 at all!").is_err());
    }

    #[test]
    fn short_blob_fails() {
        assert!(codec().decode(&STANDARD.encode([0u8; 10])).is_err());
    }

    #[test]
    fn compresses_repetitive_input() {
        let plain = "the same line over and over\n".repeat(500);
        let blob = codec().encode(plain.as_bytes()).unwrap();
        assert!(blob.len() < plain.len() / 4);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// decode(encode(p)) == p
        #[test]
        fn roundtrip(payload in prop::collection::vec(any::<u8>(), 0..2000)) {
            let codec = PatchCodec::from_passphrase("prop");
            let blob = codec.encode(&payload).unwrap();
            prop_assert_eq!(codec.decode(&blob).unwrap(), payload);
        }

        /// Changing any single character of the blob makes decode fail
        #[test]
        fn single_character_corruption_detected(
            payload in prop::collection::vec(any::<u8>(), 0..500),
            index in any::<prop::sample::Index>(),
            replacement in prop::sample::select(vec!['A', 'b', '7', '+', '/']),
        ) {
            let codec = PatchCodec::from_passphrase("prop");
            let blob = codec.encode(&payload).unwrap();
            let pos = index.index(blob.len());
            let mut chars: Vec<char> = blob.chars().collect();
            let original = chars[pos];
            chars[pos] = if original == replacement { '-' } else { replacement };
            let corrupted: String = chars.into_iter().collect();
            prop_assert!(codec.decode(&corrupted).is_err());
        }
    }
}
