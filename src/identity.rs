//! Identities, credentials and the deployment root of trust.
//!
//! A client identity is an X25519 keypair. To prove its key was generated by
//! a legitimate client, the client seals its own public key in a NaCl box
//! addressed to the trust root's public key. The server, which holds the
//! trust root secret, opens the box and checks the plaintext equals the
//! presented key. Requests that fail this check are rejected before any
//! chain is touched.
//!
//! Every holder of the trust seed can mint credentials, and credentials do
//! not expire; the scheme gates access to a deployment, it does not provide
//! per-request freshness.

use std::fmt;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use crypto_box::aead::generic_array::GenericArray;
use crypto_box::aead::{Aead, AeadCore, OsRng};
use crypto_box::{ChaChaBox, PublicKey, SecretKey};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{PatchupError, Result};

/// Length of the box nonce appended to a signature.
pub const NONCE_LEN: usize = 24;

/// Length of generated usernames.
pub const USERNAME_LEN: usize = 10;

const TRUST_CONTEXT: &str = "patchup 2024 trust root key";

/// Hex-encoded public key naming an identity and its cache folder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(String);

impl IdentityId {
    /// Identity of a public key.
    #[must_use]
    pub fn from_public_key(key: &PublicKey) -> Self {
        Self(hex::encode(key.as_bytes()))
    }

    /// The hex string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Proof of identity attached to every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Hex-encoded client public key.
    pub public_key: String,
    /// Base64 box of the public key, nonce appended.
    pub signature: String,
}

/// A client's keypair and display name.
#[derive(Clone)]
pub struct Identity {
    username: String,
    secret: SecretKey,
}

#[derive(Serialize, Deserialize)]
struct IdentityFile {
    username: String,
    public_key: String,
    secret_key: String,
}

impl Identity {
    /// Generate a fresh keypair.
    #[must_use]
    pub fn generate(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: SecretKey::generate(&mut OsRng),
        }
    }

    /// Display name.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Public half of the keypair.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.secret.public_key()
    }

    /// Identity id used for cache folders.
    #[must_use]
    pub fn id(&self) -> IdentityId {
        IdentityId::from_public_key(&self.public_key())
    }

    /// Credentials sealed for `trust`.
    ///
    /// # Errors
    ///
    /// Returns `Authentication` if sealing fails.
    pub fn credentials(&self, trust: &PublicKey) -> Result<Credentials> {
        let public = self.public_key();
        let sealer = ChaChaBox::new(trust, &self.secret);
        let nonce = ChaChaBox::generate_nonce(&mut OsRng);
        let mut sealed = sealer
            .encrypt(&nonce, public.as_bytes().as_slice())
            .map_err(|_| PatchupError::Authentication("sealing failed".to_string()))?;
        sealed.extend_from_slice(&nonce);
        Ok(Credentials {
            public_key: hex::encode(public.as_bytes()),
            signature: STANDARD.encode(sealed),
        })
    }

    /// Load an identity file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be read, or `Config` if it is
    /// malformed or its public key does not match its secret key.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let file: IdentityFile = serde_json::from_str(&raw)
            .map_err(|e| PatchupError::Config(format!("{}: {e}", path.display())))?;
        let secret = SecretKey::from(decode_key(&file.secret_key)?);
        let identity = Self {
            username: file.username,
            secret,
        };
        if hex::encode(identity.public_key().as_bytes()) != file.public_key {
            return Err(PatchupError::Config(format!(
                "{}: public key does not match secret key",
                path.display()
            )));
        }
        Ok(identity)
    }

    /// Write the identity file, creating parent folders.
    ///
    /// # Errors
    ///
    /// Returns an I/O or serialization error.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = IdentityFile {
            username: self.username.clone(),
            public_key: hex::encode(self.public_key().as_bytes()),
            secret_key: hex::encode(self.secret.to_bytes()),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| PatchupError::Serialization(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load the identity at `path`, generating and saving one if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file is unreadable or a new one cannot
    /// be written.
    pub fn load_or_generate(path: &Path, username: &str) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        let identity = Self::generate(username);
        identity.save(path)?;
        info!(username, id = %identity.id(), "generated new identity");
        Ok(identity)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("username", &self.username)
            .field("id", &self.id())
            .finish_non_exhaustive()
    }
}

/// Shared keypair that vouches for client identities.
#[derive(Clone)]
pub struct TrustRoot {
    secret: SecretKey,
}

impl TrustRoot {
    /// Derive the trust keypair from a deployment seed.
    #[must_use]
    pub fn from_seed(seed: &str) -> Self {
        Self {
            secret: SecretKey::from(blake3::derive_key(TRUST_CONTEXT, seed.as_bytes())),
        }
    }

    /// Public key clients seal their credentials to.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.secret.public_key()
    }

    /// Check credentials and return the identity they prove.
    ///
    /// # Errors
    ///
    /// Returns `Authentication` if the key or signature is malformed or the
    /// sealed key does not match the presented one.
    pub fn verify(&self, credentials: &Credentials) -> Result<IdentityId> {
        let public = PublicKey::from(decode_key(&credentials.public_key).map_err(|_| {
            PatchupError::Authentication("malformed public key".to_string())
        })?);
        let sealed = STANDARD
            .decode(credentials.signature.trim())
            .map_err(|_| PatchupError::Authentication("malformed signature".to_string()))?;
        if sealed.len() <= NONCE_LEN {
            return Err(PatchupError::Authentication("signature too short".to_string()));
        }

        let (ciphertext, nonce) = sealed.split_at(sealed.len() - NONCE_LEN);
        let opener = ChaChaBox::new(&public, &self.secret);
        let plain = opener
            .decrypt(GenericArray::from_slice(nonce), ciphertext)
            .map_err(|_| PatchupError::Authentication("signature does not verify".to_string()))?;
        if plain.as_slice() != public.as_bytes().as_slice() {
            return Err(PatchupError::Authentication(
                "signature is for a different key".to_string(),
            ));
        }
        Ok(IdentityId::from_public_key(&public))
    }
}

impl fmt::Debug for TrustRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TrustRoot({})", hex::encode(self.public_key().as_bytes()))
    }
}

/// Random lowercase username of [`USERNAME_LEN`] letters.
#[must_use]
pub fn random_username() -> String {
    let mut rng = rand::thread_rng();
    (0..USERNAME_LEN)
        .map(|_| char::from(rng.gen_range(b'a'..=b'z')))
        .collect()
}

fn decode_key(s: &str) -> Result<[u8; 32]> {
    let mut bytes = [0u8; 32];
    hex::decode_to_slice(s, &mut bytes)
        .map_err(|e| PatchupError::Config(format!("bad key {s:?}: {e}")))?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trust() -> TrustRoot {
        TrustRoot::from_seed("test deployment")
    }

    // ==========================================================================
    // CREDENTIALS
    // ==========================================================================

    #[test]
    fn credentials_verify() {
        let trust = trust();
        let alice = Identity::generate("alice");
        let creds = alice.credentials(&trust.public_key()).unwrap();
        assert_eq!(trust.verify(&creds).unwrap(), alice.id());
    }

    #[test]
    fn other_trust_root_rejects() {
        let alice = Identity::generate("alice");
        let creds = alice.credentials(&trust().public_key()).unwrap();
        let other = TrustRoot::from_seed("another deployment");
        assert!(matches!(other.verify(&creds), Err(PatchupError::Authentication(_))));
    }

    #[test]
    fn swapped_public_key_rejects() {
        let trust = trust();
        let alice = Identity::generate("alice");
        let mallory = Identity::generate("mallory");
        let mut creds = alice.credentials(&trust.public_key()).unwrap();
        creds.public_key = hex::encode(mallory.public_key().as_bytes());
        assert!(trust.verify(&creds).is_err());
    }

    #[test]
    fn garbage_rejects() {
        let trust = trust();
        let alice = Identity::generate("alice");
        let good = alice.credentials(&trust.public_key()).unwrap();

        let bad_key = Credentials {
            public_key: "zz".to_string(),
            ..good.clone()
        };
        let bad_sig = Credentials {
            signature: "!!!".to_string(),
            ..good.clone()
        };
        let short_sig = Credentials {
            signature: STANDARD.encode([1u8; 8]),
            ..good
        };
        for creds in [bad_key, bad_sig, short_sig] {
            assert!(matches!(trust.verify(&creds), Err(PatchupError::Authentication(_))));
        }
    }

    #[test]
    fn trust_root_is_deterministic() {
        assert_eq!(
            TrustRoot::from_seed("x").public_key(),
            TrustRoot::from_seed("x").public_key()
        );
        assert_ne!(
            TrustRoot::from_seed("x").public_key(),
            TrustRoot::from_seed("y").public_key()
        );
    }

    // ==========================================================================
    // PERSISTENCE
    // ==========================================================================

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("identity.json");
        let alice = Identity::generate("alice");
        alice.save(&path).unwrap();

        let loaded = Identity::load(&path).unwrap();
        assert_eq!(loaded.username(), "alice");
        assert_eq!(loaded.id(), alice.id());
    }

    #[test]
    fn load_or_generate_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        let first = Identity::load_or_generate(&path, "bob").unwrap();
        let second = Identity::load_or_generate(&path, "ignored").unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(second.username(), "bob");
    }

    #[test]
    fn load_rejects_mismatched_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        let alice = Identity::generate("alice");
        let bob = Identity::generate("bob");
        let json = format!(
            r#"{{"username":"alice","public_key":"{}","secret_key":"{}"}}"#,
            hex::encode(bob.public_key().as_bytes()),
            hex::encode(alice.secret.to_bytes()),
        );
        std::fs::write(&path, json).unwrap();
        assert!(matches!(Identity::load(&path), Err(PatchupError::Config(_))));
    }

    #[test]
    fn debug_hides_secret() {
        let alice = Identity::generate("alice");
        let secret_hex = hex::encode(alice.secret.to_bytes());
        assert!(!format!("{alice:?}").contains(&secret_hex));
    }

    #[test]
    fn random_username_shape() {
        let name = random_username();
        assert_eq!(name.len(), USERNAME_LEN);
        assert!(name.chars().all(|c| c.is_ascii_lowercase()));
    }
}
