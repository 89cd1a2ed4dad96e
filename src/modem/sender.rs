//! Outbound commands: SMS sends with persisted tracking, plus the fixed
//! maintenance commands.
use async_trait::async_trait;
use log::{error, info, warn};
use std::sync::Arc;

use super::frame::Command;
use super::link::SerialLink;
use super::ModemError;
use crate::logutil::mask_phone;
use crate::metrics;
use crate::storage::{MessageStatus, MessageStore, TextMessage};
use crate::validation::{sanitize_sms_content, validate_phone_number};

/// The one capability the task scheduler needs from the modem.
#[async_trait]
pub trait SmsSender: Send + Sync {
    /// Returns the tracking ID of the persisted outgoing record.
    async fn send_sms(&self, to: &str, content: &str) -> Result<String, ModemError>;
}

pub struct CommandSender {
    link: Arc<SerialLink>,
    store: Arc<dyn MessageStore>,
    max_content_bytes: usize,
}

impl CommandSender {
    pub fn new(link: Arc<SerialLink>, store: Arc<dyn MessageStore>, max_content_bytes: usize) -> Self {
        Self {
            link,
            store,
            max_content_bytes,
        }
    }

    pub async fn send_command(&self, cmd: &Command) -> Result<(), ModemError> {
        self.link.write_command(cmd).await
    }

    /// Persist a `sending` record, then write the command with the record ID as
    /// `request_id`. Returns as soon as the bytes are written; the device's
    /// `sms_send_result` settles the record later.
    pub async fn send_sms(&self, to: &str, content: &str) -> Result<String, ModemError> {
        let to = validate_phone_number(to)?;
        let content = sanitize_sms_content(content, self.max_content_bytes)?;

        let record = TextMessage::outgoing(&to, &content);
        self.store
            .save_message(&record)
            .await
            .map_err(ModemError::Storage)?;

        let cmd = Command::SendSms {
            to,
            content,
            request_id: record.id.clone(),
        };
        if let Err(e) = self.send_command(&cmd).await {
            metrics::inc_sms_failed();
            error!("Failed to send SMS command for {}: {}", record.id, e);
            if let Err(se) = self
                .store
                .update_message_status(&record.id, MessageStatus::Failed)
                .await
            {
                warn!("Failed to mark {} as failed: {:#}", record.id, se);
            }
            return Err(e);
        }

        metrics::inc_sms_sent();
        info!(
            "SMS to {} handed to modem (request_id={})",
            mask_phone(&record.to),
            record.id
        );
        Ok(record.id)
    }

    pub async fn reset_stack(&self) -> Result<(), ModemError> {
        self.send_command(&Command::ResetStack).await
    }

    pub async fn reboot_mcu(&self) -> Result<(), ModemError> {
        self.send_command(&Command::RebootMcu).await
    }

    pub async fn request_status(&self) -> Result<(), ModemError> {
        metrics::inc_status_polls();
        self.send_command(&Command::GetStatus).await
    }
}

#[async_trait]
impl SmsSender for CommandSender {
    async fn send_sms(&self, to: &str, content: &str) -> Result<String, ModemError> {
        CommandSender::send_sms(self, to, content).await
    }
}
