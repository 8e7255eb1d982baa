//! Completion notification
//!
//! Sends the run summary by email over an authenticated, STARTTLS-upgraded
//! relay. Notification is strictly best-effort: [`Mailer::send`] returns
//! false on any failure and never raises, so a broken relay can never fail
//! an otherwise successful run.

use crate::config::{MailConfig, SmtpConfig, NETWORK_TIMEOUT};
use crate::error::{PipelineError, Result};
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox as EmailAddress, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use std::fs;
use std::path::PathBuf;
use tracing::{error, info};

/// Last pipeline stage as the orchestrator sees it.
pub trait Mailer {
    /// Send the completion message with the given attachments. Missing
    /// attachment files are skipped, not fatal.
    fn send(&self, attachments: &[PathBuf]) -> bool;
}

pub struct SmtpNotifier {
    mail: MailConfig,
    smtp: SmtpConfig,
}

impl SmtpNotifier {
    pub fn new(mail: &MailConfig, smtp: &SmtpConfig) -> Self {
        SmtpNotifier {
            mail: mail.clone(),
            smtp: smtp.clone(),
        }
    }

    fn compose(&self, attachments: &[PathBuf]) -> Result<Message> {
        let mut parts = MultiPart::mixed().singlepart(
            SinglePart::builder()
                .header(ContentType::TEXT_PLAIN)
                .body(self.mail.body.clone()),
        );

        for (file_name, bytes) in load_attachments(attachments) {
            let content_type = ContentType::parse("application/octet-stream")
                .map_err(|e| PipelineError::Notification(e.to_string()))?;
            parts = parts.singlepart(Attachment::new(file_name).body(bytes, content_type));
        }

        let mut builder = Message::builder()
            .from(parse_address(&self.mail.sender)?)
            .to(parse_address(&self.mail.recipient)?)
            .subject(self.mail.subject.clone());
        if let Some(bcc) = &self.mail.bcc {
            builder = builder.bcc(parse_address(bcc)?);
        }

        builder
            .multipart(parts)
            .map_err(|e| PipelineError::Notification(format!("cannot compose message: {e}")))
    }

    fn try_send(&self, attachments: &[PathBuf]) -> Result<()> {
        let message = self.compose(attachments)?;

        let transport = SmtpTransport::starttls_relay(&self.smtp.host)
            .map_err(|e| PipelineError::Notification(format!("relay setup failed: {e}")))?
            .port(self.smtp.port)
            .credentials(Credentials::new(
                self.smtp.username.clone(),
                self.smtp.password.clone(),
            ))
            .timeout(Some(NETWORK_TIMEOUT))
            .build();

        transport
            .send(&message)
            .map_err(|e| PipelineError::Notification(format!("send failed: {e}")))?;
        Ok(())
    }
}

impl Mailer for SmtpNotifier {
    fn send(&self, attachments: &[PathBuf]) -> bool {
        match self.try_send(attachments) {
            Ok(()) => {
                info!(recipient = %self.mail.recipient, "notification sent");
                true
            }
            Err(e) => {
                error!(error = %e, "notification failed");
                false
            }
        }
    }
}

fn parse_address(raw: &str) -> Result<EmailAddress> {
    raw.parse()
        .map_err(|e| PipelineError::Notification(format!("bad address {raw:?}: {e}")))
}

/// Read attachment files, skipping (and logging) the ones that are missing.
fn load_attachments(paths: &[PathBuf]) -> Vec<(String, Vec<u8>)> {
    let mut loaded = Vec::new();
    for path in paths {
        match fs::read(path) {
            Ok(bytes) => {
                let file_name = path
                    .file_name()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                loaded.push((file_name, bytes));
            }
            Err(e) => {
                error!(file = %path.display(), error = %e, "attachment unreadable; skipping");
            }
        }
    }
    loaded
}
