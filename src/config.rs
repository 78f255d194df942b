//! Configuration shared by the client and the server.
//!
//! A [`Config`] is loaded from `<data_dir>/config.toml` and passed explicitly
//! to everything that needs it. Missing files and missing keys fall back to
//! defaults.

use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::codec::PatchCodec;
use crate::diff::ApplyMode;
use crate::error::{PatchupError, Result};
use crate::identity::TrustRoot;
use crate::rebuild::{IntegrityPolicy, Rebuilder};

/// Environment variable overriding the data directory.
pub const ENV_DATA_DIR: &str = "PATCHUP_DATA_DIR";

/// Name of the config file inside the data directory.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Name of the identity file inside the data directory.
pub const IDENTITY_FILE_NAME: &str = "identity.json";

/// Default server port.
pub const DEFAULT_PORT: u16 = 8002;

/// Seed used when a deployment does not configure its own.
pub const DEFAULT_TRUST_SEED: &str = "patchup default trust root";

/// Passphrase used when a deployment does not configure its own.
pub const DEFAULT_PASSPHRASE: &str = "patchup default passphrase";

/// Largest request body the server accepts. Bounds a single patch upload.
pub const DEFAULT_MAX_BODY_BYTES: usize = 512 * 1024 * 1024;

const APP_DIR: &str = "patchup";

/// Client settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientSection {
    /// Base URL of the server, e.g. `http://localhost:8002`.
    pub server_address: Option<String>,
    /// Display name stored in a newly generated identity.
    pub username: Option<String>,
}

/// Server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    /// Address to bind.
    pub bind_addr: IpAddr,
    /// Port to listen on.
    pub port: u16,
    /// Largest accepted request body in bytes.
    pub max_body_bytes: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl ServerSection {
    /// Socket address to listen on.
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }
}

/// Complete configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory holding the config, identity and chain stores.
    #[serde(skip)]
    pub data_dir: PathBuf,
    /// Seed of the shared keypair vouching for identities.
    pub trust_seed: String,
    /// Key material for patch encryption.
    pub passphrase: String,
    /// Rebuild policy on hash mismatches.
    pub integrity: IntegrityPolicy,
    /// Policy for hunks that cannot be located.
    pub apply_mode: ApplyMode,
    /// Client settings.
    pub client: ClientSection,
    /// Server settings.
    pub server: ServerSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::new(),
            trust_seed: DEFAULT_TRUST_SEED.to_string(),
            passphrase: DEFAULT_PASSPHRASE.to_string(),
            integrity: IntegrityPolicy::default(),
            apply_mode: ApplyMode::default(),
            client: ClientSection::default(),
            server: ServerSection::default(),
        }
    }
}

impl Config {
    /// Default configuration rooted at `data_dir`.
    #[must_use]
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Load `<data_dir>/config.toml`, or defaults if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file exists but cannot be read, or
    /// `Config` if it is not valid TOML for this schema.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(CONFIG_FILE_NAME);
        let mut config = match std::fs::read_to_string(&path) {
            Ok(raw) => toml::from_str::<Self>(&raw)
                .map_err(|e| PatchupError::Config(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(e.into()),
        };
        config.data_dir = data_dir.to_path_buf();
        Ok(config)
    }

    /// Write `<data_dir>/config.toml`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error or `Serialization` if the config cannot be encoded.
    pub fn save(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        let raw = toml::to_string_pretty(self)
            .map_err(|e| PatchupError::Serialization(format!("config: {e}")))?;
        std::fs::write(self.data_dir.join(CONFIG_FILE_NAME), raw)?;
        Ok(())
    }

    /// Data directory from `PATCHUP_DATA_DIR`, or the platform data directory.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the platform has no data directory.
    pub fn default_data_dir() -> Result<PathBuf> {
        let path = match env::var_os(ENV_DATA_DIR) {
            Some(val) => PathBuf::from(val),
            None => dirs_next::data_dir()
                .ok_or_else(|| {
                    PatchupError::Config(
                        "operating environment provides no directory for application data"
                            .to_string(),
                    )
                })?
                .join(APP_DIR),
        };
        if path.is_absolute() {
            Ok(path)
        } else {
            Ok(env::current_dir()?.join(path))
        }
    }

    /// Root of the client's local chain store.
    #[must_use]
    pub fn client_store_dir(&self) -> PathBuf {
        self.data_dir.join("client")
    }

    /// Root of the server's chain store.
    #[must_use]
    pub fn server_store_dir(&self) -> PathBuf {
        self.data_dir.join("server")
    }

    /// Location of the identity file.
    #[must_use]
    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.join(IDENTITY_FILE_NAME)
    }

    /// Patch codec for the configured passphrase.
    #[must_use]
    pub fn codec(&self) -> PatchCodec {
        if self.passphrase == DEFAULT_PASSPHRASE {
            warn!("using the default passphrase; set `passphrase` in {CONFIG_FILE_NAME}");
        }
        PatchCodec::from_passphrase(&self.passphrase)
    }

    /// Trust root for the configured seed.
    #[must_use]
    pub fn trust_root(&self) -> TrustRoot {
        if self.trust_seed == DEFAULT_TRUST_SEED {
            warn!("using the default trust seed; set `trust_seed` in {CONFIG_FILE_NAME}");
        }
        TrustRoot::from_seed(&self.trust_seed)
    }

    /// Rebuilder honoring the configured policies.
    #[must_use]
    pub fn rebuilder(&self) -> Rebuilder {
        Rebuilder::new(self.codec())
            .with_integrity(self.integrity)
            .with_apply_mode(self.apply_mode)
    }
}
