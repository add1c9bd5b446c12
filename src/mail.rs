//! SMTP notifications. `lettre` is the conventional ecosystem crate for
//! this (no repo in this codebase's lineage sends mail itself), wired
//! the same "build a transport once, reuse it, return errors instead of
//! panicking" way the teacher wires its own `reqwest::Client`.

use anyhow::{Context, Result};
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use time::OffsetDateTime;
use tracing::warn;

use crate::config::{MailEncryption, MailSettings};

pub struct Mailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: Mailbox,
}

impl Mailer {
    pub fn new(settings: &MailSettings) -> Result<Self> {
        let builder = match settings.encryption {
            MailEncryption::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.host)
                .context("failed to configure SMTP TLS relay")?,
            MailEncryption::StartTls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
                    .context("failed to configure SMTP STARTTLS relay")?
            }
            MailEncryption::Plain => {
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.host)
            }
        };
        let builder = builder.port(settings.port);
        let builder = match (&settings.username, &settings.password) {
            (Some(user), Some(pass)) => {
                builder.credentials(Credentials::new(user.clone(), pass.clone()))
            }
            _ => builder,
        };
        let sender: Mailbox = settings
            .sender
            .parse()
            .context("mail.sender is not a valid address")?;

        Ok(Self {
            transport: builder.build(),
            sender,
        })
    }

    async fn send(&self, to: &str, subject: &str, body: String) -> Result<()> {
        let mailbox: Mailbox = to.parse().context("recipient is not a valid address")?;
        let message = Message::builder()
            .from(self.sender.clone())
            .to(mailbox)
            .subject(subject)
            .body(body)
            .context("failed to build mail message")?;
        self.transport
            .send(message)
            .await
            .context("failed to send mail")?;
        Ok(())
    }

    pub async fn send_cert_will_expire(&self, to: &str, domain: &str, not_after: OffsetDateTime) {
        let body = format!(
            "Your certificate for {domain} expires at {not_after}. A new order must be \
             finalized before then to avoid an interruption.",
        );
        self.send_and_log(to, "Certificate expiring soon", body).await;
    }

    pub async fn send_cert_has_expired(&self, to: &str, domain: &str, not_after: OffsetDateTime) {
        let body = format!(
            "Your certificate for {domain} expired at {not_after}. Issue a replacement as \
             soon as possible.",
        );
        self.send_and_log(to, "Certificate expired", body).await;
    }

    pub async fn send_new_account_info(&self, to: &str) {
        let body = "An ACME account has been registered (or its contact updated) with this \
                     address on this certificate authority."
            .to_string();
        self.send_and_log(to, "ACME account registered", body).await;
    }

    /// Notifier and account-registration call sites treat mail failures
    /// as best-effort: log and move on, never fail the surrounding
    /// request or loop iteration.
    async fn send_and_log(&self, to: &str, subject: &str, body: String) {
        if let Err(err) = self.send(to, subject, body).await {
            warn!("failed to send mail to {to}: {err}");
        }
    }
}
