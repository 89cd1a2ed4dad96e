//! SMTP delivery over STARTTLS.
use anyhow::{anyhow, Context, Result};
use lettre::message::{Mailbox, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use log::debug;

use crate::config::EmailConfig;

pub fn build_message(cfg: &EmailConfig, subject: &str, body: &str) -> Result<Message> {
    let from: Mailbox = cfg
        .from
        .parse()
        .map_err(|e| anyhow!("invalid from address '{}': {}", cfg.from, e))?;
    let mut builder = Message::builder().from(from).subject(subject);
    for to in &cfg.to {
        let mailbox: Mailbox = to
            .parse()
            .map_err(|e| anyhow!("invalid recipient '{}': {}", to, e))?;
        builder = builder.to(mailbox);
    }
    builder
        .singlepart(SinglePart::plain(body.to_string()))
        .context("failed to build email")
}

pub async fn send(cfg: &EmailConfig, subject: &str, body: &str) -> Result<()> {
    let message = build_message(cfg, subject, body)?;
    let mut transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.smtp_host)
        .with_context(|| format!("invalid SMTP host {}", cfg.smtp_host))?
        .port(cfg.smtp_port)
        .timeout(Some(super::NOTIFY_TIMEOUT));
    if !cfg.username.is_empty() {
        transport = transport.credentials(Credentials::new(cfg.username.clone(), cfg.password.clone()));
    }
    transport
        .build()
        .send(message)
        .await
        .context("SMTP send failed")?;
    debug!("Email sent to {} recipient(s)", cfg.to.len());
    Ok(())
}
