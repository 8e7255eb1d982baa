// Meter Harvest - Core Library
// Exposes all pipeline components for use in the binary and in tests

pub mod archive;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod ftp;
pub mod notify;
pub mod parser;
pub mod pipeline;
pub mod store;
pub mod tunnel;

// Re-export commonly used types
pub use archive::archive_batch;
pub use config::{
    AppConfig, FolderConfig, FtpConfig, MailConfig, SmtpConfig, VpnConfig, NETWORK_TIMEOUT,
};
pub use error::{PipelineError, Result};
pub use ftp::{drain_mailbox, FtpMailbox, FtpSource, Mailbox, RemoteSource, TransferStatus};
pub use notify::{Mailer, SmtpNotifier};
pub use parser::{has_export_files, is_export_file, ExportParser, MeterReading, EXPORT_MARKER};
pub use pipeline::{Pipeline, RunReport, Stage};
pub use store::MeterStore;
pub use tunnel::{
    platform_driver, CommandRunner, SystemRunner, Tunnel, TunnelDriver, TunnelState, VpnGateway,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
