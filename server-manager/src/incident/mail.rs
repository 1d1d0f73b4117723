//! Mail delivery for incident reports over SMTP.

use crate::config::MailConfig;
use crate::utils::errors::{ManagerError, Result};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::future::Future;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub subject: String,
    pub body: String,
}

/// Delivers a composed message to the configured contacts.
pub trait Notifier: Send + Sync + 'static {
    fn send(&self, message: &MailMessage) -> impl Future<Output = Result<()>> + Send;
}

pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: Mailbox,
    contacts: Vec<Mailbox>,
}

impl SmtpNotifier {
    pub fn new(config: &MailConfig) -> Result<Self> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_server)
            .map_err(|e| ManagerError::Mail(format!("invalid SMTP relay {}: {}", config.smtp_server, e)))?
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ))
            .build();

        Ok(Self {
            transport,
            sender: config.sender_mailbox()?,
            contacts: config.contact_mailboxes()?,
        })
    }

    fn build(&self, message: &MailMessage) -> Result<Message> {
        let mut builder = Message::builder()
            .from(self.sender.clone())
            .subject(message.subject.clone())
            .header(ContentType::TEXT_PLAIN);

        for contact in &self.contacts {
            builder = builder.to(contact.clone());
        }

        builder
            .body(message.body.clone())
            .map_err(|e| ManagerError::Mail(e.to_string()))
    }
}

impl Notifier for SmtpNotifier {
    async fn send(&self, message: &MailMessage) -> Result<()> {
        let email = self.build(message)?;
        self.transport
            .send(email)
            .await
            .map_err(|e| ManagerError::Mail(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Contact;

    fn mail_config() -> MailConfig {
        MailConfig {
            contacts: vec![
                Contact {
                    name: Some("Ops".into()),
                    address: "ops@example.org".into(),
                },
                Contact {
                    name: None,
                    address: "oncall@example.org".into(),
                },
            ],
            smtp_server: "smtp.example.org".into(),
            sender: "Server Manager <manager@example.org>".into(),
            username: "manager".into(),
            password: "pw".into(),
            batch_window_secs: 10,
            startup_mail: false,
        }
    }

    #[tokio::test]
    async fn test_message_addresses_every_contact() {
        let notifier = SmtpNotifier::new(&mail_config()).unwrap();
        let email = notifier
            .build(&MailMessage {
                subject: "[Survival] 1 incident(s)".into(),
                body: "server crashed".into(),
            })
            .unwrap();

        let recipients = email.envelope().to();
        assert_eq!(recipients.len(), 2);
        assert_eq!(
            email.envelope().from().map(|a| a.to_string()),
            Some("manager@example.org".to_string())
        );
    }
}
