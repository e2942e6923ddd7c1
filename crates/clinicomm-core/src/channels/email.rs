//! Email channel - SMTP submission through lettre

use super::{ChannelAdapter, ChannelCheck, OutboundMessage, SendOutcome};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use clinicomm_common::config::{SmtpProviderConfig, SmtpSecurity};
use clinicomm_common::Channel;
use lettre::{
    message::{header::ContentType, Attachment, Mailbox, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::time::Duration;
use tracing::{debug, warn};

/// SMTP adapter for the email channel
pub struct SmtpAdapter {
    config: SmtpProviderConfig,
}

impl SmtpAdapter {
    pub fn new(config: SmtpProviderConfig) -> Self {
        Self { config }
    }

    fn transport(
        &self,
    ) -> Result<AsyncSmtpTransport<Tokio1Executor>, lettre::transport::smtp::Error> {
        let builder = match self.config.security {
            SmtpSecurity::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&self.config.host)?,
            SmtpSecurity::Starttls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.config.host)?
            }
            SmtpSecurity::None => {
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&self.config.host)
            }
        };

        let mut builder = builder
            .port(self.config.port)
            .timeout(Some(Duration::from_secs(self.config.timeout_secs)));

        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(builder.build())
    }
}

/// Tracking id stored for an email; also used as the Message-ID
pub fn tracking_id(message: &OutboundMessage) -> String {
    format!("{}@clinicomm", message.id)
}

/// Body text with the unsubscribe footer, and whether it is HTML
pub(crate) fn compose_body(message: &OutboundMessage) -> (String, bool) {
    let is_html = message.content.contains("</");
    let mut body = message.content.clone();
    if let Some(url) = &message.unsubscribe_url {
        if is_html {
            body.push_str(&format!(
                "<p style=\"font-size:12px\"><a href=\"{}\">Cancelar inscrição</a></p>",
                url
            ));
        } else {
            body.push_str(&format!("\n\nCancelar inscrição: {}", url));
        }
    }
    (body, is_html)
}

/// Build the MIME message. Errors are reasons the provider would refuse it.
pub(crate) fn build_email(message: &OutboundMessage) -> Result<Message, String> {
    let from_address = message
        .sender
        .email
        .parse()
        .map_err(|e| format!("Invalid sender address: {}", e))?;
    let to_address = message
        .address
        .parse()
        .map_err(|e| format!("Invalid recipient address: {}", e))?;

    let mut builder = Message::builder()
        .from(Mailbox::new(Some(message.sender.name.clone()), from_address))
        .to(Mailbox::new(
            Some(message.recipient_name.clone()).filter(|name| !name.is_empty()),
            to_address,
        ))
        .subject(message.subject.clone().unwrap_or_default())
        .message_id(Some(format!("<{}>", tracking_id(message))));

    if let Some(reply_to) = &message.reply_to {
        let mailbox: Mailbox = reply_to
            .parse()
            .map_err(|e| format!("Invalid reply-to address: {}", e))?;
        builder = builder.reply_to(mailbox);
    }

    let (body, is_html) = compose_body(message);
    let body_part = if is_html {
        SinglePart::html(body)
    } else {
        SinglePart::plain(body)
    };

    let built = if message.attachments.is_empty() {
        builder.singlepart(body_part)
    } else {
        let mut parts = MultiPart::mixed().singlepart(body_part);
        for attachment in &message.attachments {
            let bytes = STANDARD
                .decode(&attachment.content_base64)
                .map_err(|e| format!("Attachment {} is not base64: {}", attachment.filename, e))?;
            let content_type = ContentType::parse(&attachment.content_type).map_err(|e| {
                format!("Attachment {} has invalid type: {}", attachment.filename, e)
            })?;
            parts = parts.singlepart(
                Attachment::new(attachment.filename.clone()).body(bytes, content_type),
            );
        }
        builder.multipart(parts)
    };

    built.map_err(|e| format!("Failed to build email: {}", e))
}

#[async_trait]
impl ChannelAdapter for SmtpAdapter {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, message: &OutboundMessage) -> SendOutcome {
        let email = match build_email(message) {
            Ok(email) => email,
            Err(reason) => return SendOutcome::Rejected { reason },
        };

        let mailer = match self.transport() {
            Ok(mailer) => mailer,
            Err(e) => {
                return SendOutcome::TransientError {
                    reason: format!("Failed to create SMTP transport: {}", e),
                }
            }
        };

        match mailer.send(email).await {
            Ok(response) => {
                debug!(message_id = %message.id, code = %response.code(), "Email accepted");
                SendOutcome::Accepted {
                    provider_message_id: Some(tracking_id(message)),
                    response: serde_json::json!({
                        "code": response.code().to_string(),
                        "message": response.first_line().unwrap_or_default(),
                    }),
                }
            }
            Err(e) if e.is_permanent() => SendOutcome::Rejected {
                reason: e.to_string(),
            },
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "SMTP submission failed");
                SendOutcome::TransientError {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn check(&self) -> ChannelCheck {
        let mailer = match self.transport() {
            Ok(mailer) => mailer,
            Err(e) => return ChannelCheck::failed(Channel::Email, e.to_string()),
        };

        match mailer.test_connection().await {
            Ok(true) => ChannelCheck::ok(
                Channel::Email,
                format!("Connected to {}:{}", self.config.host, self.config.port),
            ),
            Ok(false) => ChannelCheck::failed(
                Channel::Email,
                format!("{}:{} refused the connection", self.config.host, self.config.port),
            ),
            Err(e) => ChannelCheck::failed(Channel::Email, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clinicomm_common::types::SenderIdentity;
    use clinicomm_storage::models::Attachment as StoredAttachment;

    fn outbound() -> OutboundMessage {
        OutboundMessage {
            id: uuid::Uuid::now_v7(),
            channel: Channel::Email,
            recipient_name: "Carlos".to_string(),
            address: "carlos@example.com".to_string(),
            subject: Some("Lembrete".to_string()),
            content: "Olá Carlos".to_string(),
            attachments: vec![],
            sender: SenderIdentity {
                name: "Clínica Bem Estar".to_string(),
                email: "contato@bemestar.com.br".to_string(),
                sms_sender_id: None,
            },
            reply_to: Some("recepcao@bemestar.com.br".to_string()),
            unsubscribe_url: Some("https://clinic.example.com/u/abc".to_string()),
        }
    }

    #[test]
    fn test_build_email_headers() {
        let message = outbound();
        let email = build_email(&message).unwrap();
        let raw = String::from_utf8(email.formatted()).unwrap();

        assert!(raw.contains("Reply-To: recepcao@bemestar.com.br"));
        assert!(raw.contains(&format!("Message-ID: <{}>", tracking_id(&message))));
    }

    #[test]
    fn test_unsubscribe_footer_follows_body_format() {
        let mut message = outbound();
        let (plain, is_html) = compose_body(&message);
        assert!(!is_html);
        assert!(plain.ends_with("Cancelar inscrição: https://clinic.example.com/u/abc"));

        message.content = "<p>Olá Carlos</p>".to_string();
        let (html, is_html) = compose_body(&message);
        assert!(is_html);
        assert!(html.contains("<a href=\"https://clinic.example.com/u/abc\">"));

        message.unsubscribe_url = None;
        assert_eq!(compose_body(&message).0, "<p>Olá Carlos</p>");
    }

    #[test]
    fn test_build_email_rejects_bad_attachment() {
        let mut message = outbound();
        message.attachments.push(StoredAttachment {
            filename: "recibo.pdf".to_string(),
            content_type: "application/pdf".to_string(),
            content_base64: "not base64!!".to_string(),
        });

        let err = build_email(&message).unwrap_err();
        assert!(err.contains("recibo.pdf"));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        let adapter = SmtpAdapter::new(SmtpProviderConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            security: SmtpSecurity::None,
            timeout_secs: 2,
            ..Default::default()
        });

        let outcome = adapter.send(&outbound()).await;
        assert!(matches!(outcome, SendOutcome::TransientError { .. }));

        let check = adapter.check().await;
        assert!(!check.success);
    }
}
