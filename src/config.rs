//! Application configuration
//!
//! A single immutable [`AppConfig`] value is deserialized from a TOML file at
//! startup and passed by reference into each component constructor. There is
//! no global configuration registry.

use crate::error::{PipelineError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Universal timeout for blocking network operations (VPN commands, FTP
/// session, SMTP session).
pub const NETWORK_TIMEOUT: Duration = Duration::from_secs(20);

/// VPN tunnel settings
#[derive(Debug, Clone, Deserialize)]
pub struct VpnConfig {
    /// Name of the preconfigured system VPN connection
    pub name: String,
    pub username: String,
    pub password: String,
}

/// FTP mailbox settings
#[derive(Debug, Clone, Deserialize)]
pub struct FtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Remote directory the exports are deposited in
    pub remote_dir: String,
}

/// SMTP relay settings
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

/// Notification message settings
#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    pub sender: String,
    pub recipient: String,
    #[serde(default)]
    pub bcc: Option<String>,
    pub subject: String,
    pub body: String,
}

/// Working-area layout, resolved against the base directory at startup
#[derive(Debug, Clone, Deserialize)]
pub struct FolderConfig {
    /// Directory freshly downloaded exports land in
    pub download_dir: String,
    /// Directory per-run archives are written to
    pub backup_dir: String,
    /// File name of the consolidated summary CSV
    pub summary_file: String,
    /// File name of the SQLite database
    pub database_file: String,
}

/// Immutable application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub vpn: VpnConfig,
    pub ftp: FtpConfig,
    pub smtp: SmtpConfig,
    pub mail: MailConfig,
    pub folders: FolderConfig,
}

impl AppConfig {
    /// Load and validate the configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        toml::from_str(&text).map_err(|e| {
            PipelineError::Config(format!("cannot parse {}: {e}", path.display()))
        })
    }

    pub fn download_dir(&self, base: &Path) -> PathBuf {
        base.join(&self.folders.download_dir)
    }

    pub fn backup_dir(&self, base: &Path) -> PathBuf {
        base.join(&self.folders.backup_dir)
    }

    pub fn summary_path(&self, base: &Path) -> PathBuf {
        base.join(&self.folders.summary_file)
    }

    pub fn database_path(&self, base: &Path) -> PathBuf {
        base.join(&self.folders.database_file)
    }
}
