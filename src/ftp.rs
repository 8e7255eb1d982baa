//! FTP mailbox retrieval
//!
//! Exports are picked up from a remote FTP directory. A file is deleted on
//! the server only after its transfer finished with the protocol's
//! transfer-complete reply (226) and the local copy is durable; anything
//! less leaves the remote copy in place so the next run can retry.

use crate::config::{FtpConfig, NETWORK_TIMEOUT};
use crate::error::{PipelineError, Result};
use std::fs::{self, File};
use std::io;
use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};
use suppaftp::FtpStream;
use tracing::{debug, error, info};

/// Outcome of a single file transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    /// The server confirmed completion (226); the local copy is whole.
    Complete,
    /// Transfer ended without the completion reply; reason attached.
    Incomplete(String),
}

/// Protocol seam over the remote directory holding the exports.
pub trait Mailbox {
    /// Names of the entries in the remote directory.
    fn list(&mut self) -> Result<Vec<String>>;
    /// Stream one remote file into `dest` and report the completion status.
    fn fetch(&mut self, name: &str, dest: &Path) -> Result<TransferStatus>;
    /// Remove one remote file.
    fn delete(&mut self, name: &str) -> Result<()>;
}

/// Live FTP session against the configured mailbox.
pub struct FtpMailbox {
    stream: FtpStream,
    remote_dir: String,
}

impl FtpMailbox {
    /// Connect and authenticate with the universal network timeout.
    pub fn connect(cfg: &FtpConfig) -> Result<Self> {
        let addr = format!("{}:{}", cfg.host, cfg.port)
            .to_socket_addrs()
            .map_err(|e| {
                PipelineError::Transfer(format!("cannot resolve {}:{}: {e}", cfg.host, cfg.port))
            })?
            .next()
            .ok_or_else(|| {
                PipelineError::Transfer(format!("no address for {}:{}", cfg.host, cfg.port))
            })?;

        let mut stream = FtpStream::connect_timeout(addr, NETWORK_TIMEOUT).map_err(|e| {
            PipelineError::Transfer(format!("cannot connect to {}:{}: {e}", cfg.host, cfg.port))
        })?;
        stream
            .login(&cfg.user, &cfg.password)
            .map_err(|e| PipelineError::Transfer(format!("ftp login failed: {e}")))?;

        info!(host = %cfg.host, port = cfg.port, "connected to ftp server");
        Ok(FtpMailbox {
            stream,
            remote_dir: cfg.remote_dir.clone(),
        })
    }

    fn remote_path(&self, name: &str) -> String {
        format!("{}/{}", self.remote_dir.trim_end_matches('/'), name)
    }
}

impl Mailbox for FtpMailbox {
    fn list(&mut self) -> Result<Vec<String>> {
        self.stream
            .nlst(Some(&self.remote_dir))
            .map_err(|e| PipelineError::Transfer(format!("cannot list mailbox: {e}")))
    }

    fn fetch(&mut self, name: &str, dest: &Path) -> Result<TransferStatus> {
        let remote = self.remote_path(name);
        let mut local = File::create(dest).map_err(|e| {
            PipelineError::Transfer(format!("cannot create {}: {e}", dest.display()))
        })?;

        let mut data = self
            .stream
            .retr_as_stream(&remote)
            .map_err(|e| PipelineError::Transfer(format!("cannot retrieve {remote}: {e}")))?;
        io::copy(&mut data, &mut local)
            .map_err(|e| PipelineError::Transfer(format!("cannot write {}: {e}", dest.display())))?;

        // finalize reads the closing reply; anything but 226 is incomplete.
        match self.stream.finalize_retr_stream(data) {
            Ok(()) => Ok(TransferStatus::Complete),
            Err(e) => Ok(TransferStatus::Incomplete(e.to_string())),
        }
    }

    fn delete(&mut self, name: &str) -> Result<()> {
        let remote = self.remote_path(name);
        self.stream
            .rm(&remote)
            .map_err(|e| PipelineError::Transfer(format!("cannot delete {remote}: {e}")))
    }
}

/// Pull every export out of the mailbox into `target_dir`.
///
/// Non-`.csv` entries are ignored. A file whose transfer did not complete is
/// logged and left on the server (the local partial copy is overwritten on
/// the next run); only verified transfers are deleted remotely and included
/// in the returned list. An empty list is the normal "nothing to do"
/// outcome, distinct from a session error, which propagates.
pub fn drain_mailbox(mailbox: &mut dyn Mailbox, target_dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(target_dir).map_err(|e| {
        PipelineError::Transfer(format!("cannot create {}: {e}", target_dir.display()))
    })?;

    let mut downloaded = Vec::new();
    for name in mailbox.list()? {
        if !name.to_lowercase().ends_with(".csv") {
            debug!(file = %name, "not an export; ignoring");
            continue;
        }

        // Some servers list entries with a directory prefix.
        let file_name = Path::new(&name)
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.clone());
        let local_path = target_dir.join(&file_name);

        match mailbox.fetch(&name, &local_path)? {
            TransferStatus::Complete => {
                mailbox.delete(&name)?;
                info!(file = %name, "downloaded and removed from mailbox");
                downloaded.push(local_path);
            }
            TransferStatus::Incomplete(reason) => {
                error!(
                    file = %name,
                    %reason,
                    "transfer did not complete; remote copy kept for retry"
                );
            }
        }
    }

    Ok(downloaded)
}

/// Remote side of the pipeline as the orchestrator sees it.
pub trait RemoteSource {
    /// Download all pending exports into `target_dir` and return their
    /// local paths.
    fn download_all(&mut self, target_dir: &Path) -> Result<Vec<PathBuf>>;
}

/// Connects a fresh FTP session per run and drains the mailbox.
pub struct FtpSource {
    cfg: FtpConfig,
}

impl FtpSource {
    pub fn new(cfg: &FtpConfig) -> Self {
        FtpSource { cfg: cfg.clone() }
    }
}

impl RemoteSource for FtpSource {
    fn download_all(&mut self, target_dir: &Path) -> Result<Vec<PathBuf>> {
        let mut mailbox = FtpMailbox::connect(&self.cfg)?;
        drain_mailbox(&mut mailbox, target_dir)
    }
}
