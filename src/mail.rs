//! Report mail delivery.
//!
//! Delivery itself belongs to an external mail system. The crate only needs
//! something implementing [`MailTransport`]; [`SpoolMailTransport`] drops
//! complete MIME messages into a directory a local MTA can pick up.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use rand::RngCore;

pub const REPORT_SUBJECT: &str = "PPE Violations Report";
pub const REPORT_ATTACHMENT_NAME: &str = "violations.csv";

pub trait MailTransport: Send + Sync {
    fn send_mail(&self, html_body: &str, csv_attachment: &str, recipient: &str) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct SpoolMailTransport {
    spool_dir: PathBuf,
    sender: String,
}

impl SpoolMailTransport {
    pub fn new(spool_dir: impl Into<PathBuf>, sender: impl Into<String>) -> Self {
        Self {
            spool_dir: spool_dir.into(),
            sender: sender.into(),
        }
    }

    pub fn spool_dir(&self) -> &Path {
        &self.spool_dir
    }

    /// Write one message into the spool and return its path.
    pub fn spool(&self, html_body: &str, csv_attachment: &str, recipient: &str) -> Result<PathBuf> {
        validate_address(recipient)?;
        validate_address(&self.sender)?;
        std::fs::create_dir_all(&self.spool_dir)
            .with_context(|| format!("create mail spool {}", self.spool_dir.display()))?;

        let mut nonce = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut nonce);
        let nonce = hex::encode(nonce);
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();

        let message = compose_message(
            &self.sender,
            recipient,
            &format!("report-{}", nonce),
            html_body,
            csv_attachment,
        );

        let final_path = self.spool_dir.join(format!("{}-{}.eml", now, nonce));
        let tmp_path = self.spool_dir.join(format!(".{}-{}.tmp", now, nonce));
        std::fs::write(&tmp_path, message)
            .with_context(|| format!("write mail spool file {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &final_path)
            .with_context(|| format!("publish mail spool file {}", final_path.display()))?;
        Ok(final_path)
    }
}

impl MailTransport for SpoolMailTransport {
    fn send_mail(&self, html_body: &str, csv_attachment: &str, recipient: &str) -> Result<()> {
        let path = self.spool(html_body, csv_attachment, recipient)?;
        log::info!("report mail for {} spooled to {}", recipient, path.display());
        Ok(())
    }
}

fn validate_address(address: &str) -> Result<()> {
    let trimmed = address.trim();
    let valid = trimmed.len() == address.len()
        && !trimmed.contains(['\r', '\n', ' ', ',', '<', '>'])
        && trimmed
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && !domain.is_empty());
    if !valid {
        return Err(anyhow!("invalid mail address '{}'", address));
    }
    Ok(())
}

fn compose_message(
    sender: &str,
    recipient: &str,
    boundary: &str,
    html_body: &str,
    csv_attachment: &str,
) -> String {
    let mut msg = String::new();
    msg.push_str(&format!("From: {}\r\n", sender));
    msg.push_str(&format!("To: {}\r\n", recipient));
    msg.push_str(&format!("Subject: {}\r\n", REPORT_SUBJECT));
    msg.push_str("MIME-Version: 1.0\r\n");
    msg.push_str(&format!(
        "Content-Type: multipart/mixed; boundary=\"{}\"\r\n\r\n",
        boundary
    ));

    msg.push_str(&format!("--{}\r\n", boundary));
    msg.push_str("Content-Type: text/html; charset=utf-8\r\n");
    msg.push_str("Content-Transfer-Encoding: 8bit\r\n\r\n");
    msg.push_str(&crlf(html_body));
    msg.push_str("\r\n");

    msg.push_str(&format!("--{}\r\n", boundary));
    msg.push_str("Content-Type: text/csv; charset=utf-8\r\n");
    msg.push_str("Content-Transfer-Encoding: 8bit\r\n");
    msg.push_str(&format!(
        "Content-Disposition: attachment; filename={}\r\n\r\n",
        REPORT_ATTACHMENT_NAME
    ));
    msg.push_str(&crlf(csv_attachment));
    msg.push_str("\r\n");

    msg.push_str(&format!("--{}--\r\n", boundary));
    msg
}

fn crlf(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\n', "\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spool_writes_multipart_message() {
        let dir = tempfile::tempdir().unwrap();
        let transport = SpoolMailTransport::new(dir.path().join("outbox"), "monitor@example.com");
        let path = transport
            .spool("<p>hi</p>\n", "id,ppe_type\n1,no_glove\n", "safety@example.com")
            .unwrap();

        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("eml"));
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.contains("To: safety@example.com\r\n"));
        assert!(body.contains("Subject: PPE Violations Report\r\n"));
        assert!(body.contains("Content-Disposition: attachment; filename=violations.csv"));
        assert!(body.contains("id,ppe_type\r\n1,no_glove\r\n"));
        assert!(body.trim_end().ends_with("--"));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("outbox"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn rejects_header_injection_in_recipient() {
        let dir = tempfile::tempdir().unwrap();
        let transport = SpoolMailTransport::new(dir.path(), "monitor@example.com");
        assert!(transport
            .send_mail("<p/>", "", "a@example.com\r\nBcc: b@example.com")
            .is_err());
        assert!(transport.send_mail("<p/>", "", "nobody").is_err());
    }
}
