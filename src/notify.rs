//! Incoming-message notification.
//!
//! The gateway calls the notifier once per successfully persisted incoming
//! message. The contract is fire-and-forget: invocations are spawned off the
//! polling path and errors are logged, never propagated.

use async_trait::async_trait;
use base64::Engine;
use log::{debug, info};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::config::SmtpConfig;
use crate::storage::IncomingMessage;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("smtp reply {code}: {text}")]
    UnexpectedReply { code: u16, text: String },

    #[error("malformed smtp reply {0:?}")]
    MalformedReply(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &IncomingMessage) -> Result<(), NotifyError>;
}

/// Notifier that does nothing. Used when forwarding is not configured.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, _message: &IncomingMessage) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Forwards each incoming message as one plain-text email over SMTP.
///
/// The envelope is fixed by configuration (one sender, one recipient); the
/// body is the decoded message, base64-encoded so arbitrary UTF-8 survives
/// 7-bit transports.
pub struct SmtpNotifier {
    settings: SmtpConfig,
}

impl SmtpNotifier {
    pub fn new(settings: SmtpConfig) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn notify(&self, message: &IncomingMessage) -> Result<(), NotifyError> {
        if !self.settings.enabled {
            return Ok(());
        }

        info!(
            "forwarding incoming message {} to {} via {}:{}",
            message.id, self.settings.recipient, self.settings.host, self.settings.port
        );

        let stream =
            TcpStream::connect((self.settings.host.as_str(), self.settings.port)).await?;
        let mut smtp = SmtpExchange {
            stream: BufReader::new(stream),
        };

        let (code, text) = smtp.read_reply().await?;
        if code != 220 {
            return Err(NotifyError::UnexpectedReply { code, text });
        }

        smtp.require("EHLO smsgate", 250).await?;

        if self.settings.auth {
            let payload = format!(
                "\0{}\0{}",
                self.settings.username, self.settings.password
            );
            let encoded = base64::engine::general_purpose::STANDARD.encode(payload.as_bytes());
            smtp.require(&format!("AUTH PLAIN {}", encoded), 235).await?;
        }

        smtp.require(&format!("MAIL FROM:<{}>", self.settings.sender), 250)
            .await?;
        smtp.require(&format!("RCPT TO:<{}>", self.settings.recipient), 250)
            .await?;
        smtp.require("DATA", 354).await?;

        let mail = render_mail(&self.settings, message);
        smtp.stream.get_mut().write_all(mail.as_bytes()).await?;
        smtp.stream.get_mut().write_all(b"\r\n.\r\n").await?;
        smtp.stream.get_mut().flush().await?;
        let (code, text) = smtp.read_reply().await?;
        if code != 250 {
            return Err(NotifyError::UnexpectedReply { code, text });
        }

        // Best effort; the mail is already accepted.
        let _ = smtp.command("QUIT").await;
        Ok(())
    }
}

/// Minimal command/reply engine over one TCP connection.
struct SmtpExchange {
    stream: BufReader<TcpStream>,
}

impl SmtpExchange {
    /// Read one (possibly multiline) reply, returning the code and the
    /// concatenated text.
    async fn read_reply(&mut self) -> Result<(u16, String), NotifyError> {
        let mut text = String::new();
        loop {
            let mut line = String::new();
            let n = self.stream.read_line(&mut line).await?;
            if n == 0 {
                return Err(NotifyError::MalformedReply("connection closed".to_string()));
            }
            if line.len() < 4 || !line.is_char_boundary(3) || !line.is_char_boundary(4) {
                return Err(NotifyError::MalformedReply(line));
            }
            let code: u16 = line[..3]
                .parse()
                .map_err(|_| NotifyError::MalformedReply(line.clone()))?;
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(line[4..].trim_end());
            if line.as_bytes()[3] == b'-' {
                continue;
            }
            debug!("smtp << {} {}", code, text);
            return Ok((code, text));
        }
    }

    async fn command(&mut self, line: &str) -> Result<(u16, String), NotifyError> {
        if line.starts_with("AUTH PLAIN") {
            debug!("smtp >> AUTH PLAIN ****");
        } else {
            debug!("smtp >> {}", line);
        }
        self.stream.get_mut().write_all(line.as_bytes()).await?;
        self.stream.get_mut().write_all(b"\r\n").await?;
        self.stream.get_mut().flush().await?;
        self.read_reply().await
    }

    async fn require(&mut self, line: &str, expected: u16) -> Result<(), NotifyError> {
        let (code, text) = self.command(line).await?;
        if code != expected {
            return Err(NotifyError::UnexpectedReply { code, text });
        }
        Ok(())
    }
}

/// RFC 5322 headers plus the base64-encoded message body.
fn render_mail(settings: &SmtpConfig, message: &IncomingMessage) -> String {
    format!(
        "From: {}\r\n\
         To: {}\r\n\
         Content-Type: text/plain; charset=\"utf-8\"\r\n\
         Content-Transfer-Encoding: base64\r\n\
         Subject: SMS message from {}\r\n\
         \r\n\
         {}",
        settings.sender,
        settings.recipient,
        message.mobile,
        base64::engine::general_purpose::STANDARD.encode(message.body.as_bytes())
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> IncomingMessage {
        IncomingMessage {
            id: 1,
            mobile: "+15551234567".to_string(),
            body: "olá mundo".to_string(),
            device: Some("modem0".to_string()),
            created_at: 0,
        }
    }

    #[test]
    fn mail_carries_base64_body() {
        let mut settings = SmtpConfig::default();
        settings.sender = "gw@example.com".to_string();
        settings.recipient = "ops@example.com".to_string();

        let mail = render_mail(&settings, &sample());
        assert!(mail.contains("Subject: SMS message from +15551234567\r\n"));
        assert!(mail.contains("Content-Transfer-Encoding: base64\r\n"));

        let body = mail.rsplit("\r\n\r\n").next().unwrap();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(body)
            .unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), "olá mundo");
    }

    #[tokio::test]
    async fn disabled_notifier_is_a_noop() {
        let notifier = SmtpNotifier::new(SmtpConfig::default());
        assert!(notifier.notify(&sample()).await.is_ok());
    }
}
