//! Configuration for a tunnel session.
//!
//! Flag parsing happens in `main`; the core consumes one immutable
//! [`TunnelConfig`] value built at startup. A small optional config file at
//! the platform config dir supplies defaults for the relay URL and headers.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::crypto::CipherKind;
use crate::relay::HeaderEntry;

/// Which end of the tunnel this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Listen on a local TCP port and forward accepted connections through
    /// the relay.
    Client,
    /// Forward relay traffic into a local TCP service.
    Server,
}

/// Immutable per-session configuration, fixed at startup.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub role: Role,
    /// Local bind address (client) or target service address (server).
    pub host: String,
    /// Listen port for the client (0 = ephemeral), target port for the server.
    pub port: u16,
    /// URL this end uploads (POSTs) on.
    pub upload_url: String,
    /// URL this end downloads (GETs) on.
    pub download_url: String,
    /// Extra headers attached to both relay exchanges.
    pub headers: Vec<HeaderEntry>,
    /// Copy-loop buffer size for the non-multiplexed channel.
    pub buf_size: usize,
    /// Multiplex many connections over the one physical channel.
    pub multiplex: bool,
    /// Chunk size used when relaying bytes into the multiplexer.
    pub mux_buf_size: usize,
    /// Symmetric encryption on/off.
    pub encrypt: bool,
    /// Passphrase; resolved (prompted if needed) before the core starts.
    pub passphrase: Option<String>,
    pub cipher: CipherKind,
}

/// Optional defaults loaded from the config file.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub relay: RelayDefaults,
}

#[derive(Debug, Default, Deserialize)]
pub struct RelayDefaults {
    /// Relay server base URL.
    pub server: Option<String>,
    /// Headers in "Key: Value" form, prepended to the ones given on the CLI.
    #[serde(default)]
    pub headers: Vec<String>,
}

impl FileConfig {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn config_path() -> Result<PathBuf> {
        let proj_dirs =
            ProjectDirs::from("", "", "sluice").context("Could not determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }
}
