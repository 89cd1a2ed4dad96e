//! # Storage Module - Data Persistence Layer
//!
//! File-backed persistence for SMS/call records and scheduled send tasks.
//!
//! ```text
//! data/
//! ├── messages/   ← one JSON file per TextMessage, named <uuid>.json
//! └── tasks/      ← one JSON file per ScheduledTask, named <uuid>.json
//! ```
//!
//! Every write goes through [`write_file_locked`]: exclusive `fs2` lock on the
//! destination, full write into a sibling temp file, fsync, then rename. A
//! crash mid-write leaves either the old record or the new one, never half.
//!
//! Read-modify-write sequences (status updates, task run bookkeeping) are
//! serialized by an in-process mutex so concurrent handlers cannot interleave
//! and lose an update.
//!
//! The serial link only needs [`MessageStore`]; the HTTP API and CLI use the
//! richer inherent methods on [`Storage`].

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{Local, TimeZone, Utc};
use fs2::FileExt;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::validation::{
    sanitize_sms_content, secure_json_parse, secure_record_path, validate_file_size,
    validate_peer, validate_phone_number, validate_record_id, ValidationError,
};

const MESSAGES_DIR: &str = "messages";
const TASKS_DIR: &str = "tasks";
/// Per-record file cap; anything bigger is skipped as corrupt.
const MAX_RECORD_FILE_BYTES: u64 = 256 * 1024;

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    #[default]
    Sms,
    Call,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Received,
    Sending,
    Sent,
    Failed,
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageStatus::Received => "received",
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A persisted SMS or call record. Timestamps are Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextMessage {
    pub id: String,
    /// Sender; empty for outgoing messages (the modem itself).
    #[serde(default)]
    pub from: String,
    /// Recipient; empty for incoming messages.
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub content: String,
    pub direction: Direction,
    #[serde(default)]
    pub kind: RecordKind,
    pub status: MessageStatus,
    pub timestamp: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TextMessage {
    pub fn incoming(kind: RecordKind, from: &str, content: &str, timestamp: i64) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4().to_string(),
            from: from.to_string(),
            to: String::new(),
            content: content.to_string(),
            direction: Direction::Incoming,
            kind,
            status: MessageStatus::Received,
            timestamp,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn outgoing(to: &str, content: &str) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4().to_string(),
            from: String::new(),
            to: to.to_string(),
            content: content.to_string(),
            direction: Direction::Outgoing,
            kind: RecordKind::Sms,
            status: MessageStatus::Sending,
            timestamp: now,
            created_at: now,
            updated_at: now,
        }
    }

    /// The other party of the conversation this record belongs to.
    pub fn peer(&self) -> &str {
        match self.direction {
            Direction::Incoming => &self.from,
            Direction::Outgoing => &self.to,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageStats {
    pub total: usize,
    pub incoming: usize,
    pub outgoing: usize,
    /// Records stamped since local midnight.
    pub today: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub peer: String,
    pub last_message: TextMessage,
    pub message_count: usize,
}

/// A recurring "send this SMS every N days" job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub interval_days: u32,
    pub phone_number: String,
    pub content: String,
    pub created_at: i64,
    pub updated_at: i64,
    /// 0 = never run
    #[serde(default)]
    pub last_run_at: i64,
    /// Tracking ID of the last send this task triggered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_id: Option<String>,
    /// Outcome of that send, updated when the device confirms it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_status: Option<MessageStatus>,
}

/// Fields a client supplies when creating or replacing a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInput {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub interval_days: u32,
    pub phone_number: String,
    pub content: String,
}

fn default_true() -> bool {
    true
}

/// The persistence capability the serial link depends on.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn save_message(&self, msg: &TextMessage) -> Result<()>;

    async fn get_message(&self, id: &str) -> Result<Option<TextMessage>>;

    /// Returns `false` when no record with that ID exists.
    async fn update_message_status(&self, id: &str, status: MessageStatus) -> Result<bool>;

    /// Propagate a send outcome to whichever scheduled task triggered it, if any.
    async fn update_task_run_status(&self, _message_id: &str, _status: MessageStatus) -> Result<()> {
        Ok(())
    }
}

/// Main storage interface
pub struct Storage {
    data_dir: PathBuf,
    max_message_bytes: usize,
    write_lock: Mutex<()>,
}

impl Storage {
    /// Initialize storage with the given data directory
    pub async fn new(data_dir: &str) -> Result<Self> {
        fs::create_dir_all(data_dir)
            .await
            .map_err(|e| anyhow!("Failed to create data directory {}: {}", data_dir, e))?;

        let base = PathBuf::from(data_dir);
        fs::create_dir_all(base.join(MESSAGES_DIR)).await?;
        fs::create_dir_all(base.join(TASKS_DIR)).await?;

        Ok(Storage {
            data_dir: base,
            max_message_bytes: 1024,
            write_lock: Mutex::new(()),
        })
    }

    pub fn with_max_message_bytes(mut self, max: usize) -> Self {
        self.max_message_bytes = max;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn max_message_bytes(&self) -> usize {
        self.max_message_bytes
    }

    fn message_path(&self, id: &str) -> Result<PathBuf> {
        secure_record_path(&self.data_dir, MESSAGES_DIR, id)
            .context("Message path validation failed")
    }

    fn task_path(&self, id: &str) -> Result<PathBuf> {
        secure_record_path(&self.data_dir, TASKS_DIR, id)
            .context("Task path validation failed")
    }

    async fn read_record<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        let content = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(anyhow!("Failed to read {:?}: {}", path, e)),
        };
        let record = secure_json_parse(&content, MAX_RECORD_FILE_BYTES as usize)
            .map_err(|e| anyhow!("Failed to parse {:?}: {}", path, e))?;
        Ok(Some(record))
    }

    async fn write_record<T: Serialize>(path: &Path, record: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(record)?;
        write_file_locked(path, &json)
    }

    async fn remove_record(path: &Path) -> Result<bool> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(anyhow!("Failed to delete {:?}: {}", path, e)),
        }
    }

    /// Load every parseable record in a collection directory. Files whose name
    /// does not match the embedded ID are skipped.
    async fn scan<T, F>(&self, collection: &str, id_of: F) -> Result<Vec<T>>
    where
        T: serde::de::DeserializeOwned,
        F: Fn(&T) -> &str,
    {
        let dir = self.data_dir.join(collection);
        let mut out = Vec::new();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let metadata = entry.metadata().await?;
            if validate_file_size(metadata.len(), MAX_RECORD_FILE_BYTES).is_err() {
                warn!("Skipping oversized record file: {:?}", path);
                continue;
            }
            let content = match fs::read_to_string(&path).await {
                Ok(c) => c,
                Err(e) => {
                    warn!("Failed to read record file {:?}: {}", path, e);
                    continue;
                }
            };
            let record: T = match secure_json_parse(&content, MAX_RECORD_FILE_BYTES as usize) {
                Ok(r) => r,
                Err(_) => {
                    warn!("Failed to parse record file: {:?}", path);
                    continue;
                }
            };
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
            if id_of(&record) != stem {
                warn!("Record ID mismatch in file: {:?}", path);
                continue;
            }
            out.push(record);
        }
        Ok(out)
    }

    async fn all_messages(&self) -> Result<Vec<TextMessage>> {
        let mut messages = self.scan(MESSAGES_DIR, |m: &TextMessage| m.id.as_str()).await?;
        messages.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(messages)
    }

    /// Newest first.
    pub async fn list_messages(&self, limit: usize) -> Result<Vec<TextMessage>> {
        let mut messages = self.all_messages().await?;
        messages.truncate(limit);
        Ok(messages)
    }

    pub async fn delete_message(&self, id: &str) -> Result<bool> {
        let path = self.message_path(id)?;
        let _guard = self.write_lock.lock().await;
        Self::remove_record(&path).await
    }

    /// Remove every message record. Returns how many were deleted.
    pub async fn clear_messages(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let messages = self.scan(MESSAGES_DIR, |m: &TextMessage| m.id.as_str()).await?;
        let mut removed = 0;
        for m in messages {
            if Self::remove_record(&self.message_path(&m.id)?).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub async fn message_stats(&self) -> Result<MessageStats> {
        let messages = self.all_messages().await?;
        let midnight = Local::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .and_then(|naive| Local.from_local_datetime(&naive).earliest())
            .map(|dt| dt.timestamp_millis())
            .unwrap_or(0);

        let mut stats = MessageStats {
            total: messages.len(),
            ..Default::default()
        };
        for m in &messages {
            match m.direction {
                Direction::Incoming => stats.incoming += 1,
                Direction::Outgoing => stats.outgoing += 1,
            }
            if m.timestamp >= midnight {
                stats.today += 1;
            }
        }
        Ok(stats)
    }

    /// One entry per peer, most recently active first.
    pub async fn conversations(&self) -> Result<Vec<Conversation>> {
        let messages = self.all_messages().await?;
        let mut by_peer: HashMap<String, Conversation> = HashMap::new();
        // `messages` is newest first, so the first record seen per peer is the latest.
        for m in messages {
            let peer = m.peer().to_string();
            if peer.is_empty() {
                continue;
            }
            by_peer
                .entry(peer.clone())
                .and_modify(|c| c.message_count += 1)
                .or_insert(Conversation {
                    peer,
                    last_message: m,
                    message_count: 1,
                });
        }
        let mut out: Vec<Conversation> = by_peer.into_values().collect();
        out.sort_by(|a, b| b.last_message.timestamp.cmp(&a.last_message.timestamp));
        Ok(out)
    }

    /// All messages exchanged with `peer`, oldest first. `peer` is matched
    /// exactly as [`conversations`](Self::conversations) reports it.
    pub async fn conversation_messages(&self, peer: &str) -> Result<Vec<TextMessage>> {
        let peer = validate_peer(peer)?;
        let mut messages: Vec<TextMessage> = self
            .all_messages()
            .await?
            .into_iter()
            .filter(|m| m.peer() == peer)
            .collect();
        messages.reverse();
        Ok(messages)
    }

    pub async fn delete_conversation(&self, peer: &str) -> Result<usize> {
        let messages = self.conversation_messages(peer).await?;
        let _guard = self.write_lock.lock().await;
        let mut removed = 0;
        for m in messages {
            if Self::remove_record(&self.message_path(&m.id)?).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Mark outgoing records still `sending` after `max_age` as `failed`.
    /// Returns the IDs that were changed.
    pub async fn sweep_stale_sending(&self, max_age: Duration) -> Result<Vec<String>> {
        let cutoff = now_millis() - max_age.as_millis() as i64;
        let stale: Vec<TextMessage> = self
            .all_messages()
            .await?
            .into_iter()
            .filter(|m| m.status == MessageStatus::Sending && m.created_at < cutoff)
            .collect();

        let mut changed = Vec::with_capacity(stale.len());
        for m in stale {
            if self.set_status_if(&m.id, MessageStatus::Failed, Some(MessageStatus::Sending)).await? {
                self.update_task_run_status(&m.id, MessageStatus::Failed).await?;
                changed.push(m.id);
            }
        }
        Ok(changed)
    }

    /// Status update under the write lock. With `only_from`, the record is left
    /// alone unless it currently has that status.
    async fn set_status_if(
        &self,
        id: &str,
        status: MessageStatus,
        only_from: Option<MessageStatus>,
    ) -> Result<bool> {
        let path = self.message_path(id)?;
        let _guard = self.write_lock.lock().await;
        let Some(mut msg) = Self::read_record::<TextMessage>(&path).await? else {
            return Ok(false);
        };
        if let Some(expected) = only_from {
            if msg.status != expected {
                return Ok(false);
            }
        }
        msg.status = status;
        msg.updated_at = now_millis();
        Self::write_record(&path, &msg).await?;
        Ok(true)
    }

    // ----- scheduled tasks -----

    fn validate_task_input(&self, input: &TaskInput) -> Result<TaskInput> {
        let name = input.name.trim();
        if name.is_empty() {
            return Err(ValidationError::InvalidField {
                field: "name",
                reason: "required".to_string(),
            }
            .into());
        }
        if input.interval_days == 0 {
            return Err(ValidationError::InvalidField {
                field: "interval_days",
                reason: "must be at least 1".to_string(),
            }
            .into());
        }
        let phone_number = validate_phone_number(&input.phone_number)?;
        let content = sanitize_sms_content(&input.content, self.max_message_bytes)?;
        Ok(TaskInput {
            name: name.to_string(),
            enabled: input.enabled,
            interval_days: input.interval_days,
            phone_number,
            content,
        })
    }

    pub async fn list_tasks(&self) -> Result<Vec<ScheduledTask>> {
        let mut tasks = self.scan(TASKS_DIR, |t: &ScheduledTask| t.id.as_str()).await?;
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    pub async fn list_enabled_tasks(&self) -> Result<Vec<ScheduledTask>> {
        Ok(self.list_tasks().await?.into_iter().filter(|t| t.enabled).collect())
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<ScheduledTask>> {
        Self::read_record(&self.task_path(id)?).await
    }

    pub async fn create_task(&self, input: &TaskInput) -> Result<ScheduledTask> {
        let input = self.validate_task_input(input)?;
        let now = now_millis();
        let task = ScheduledTask {
            id: Uuid::new_v4().to_string(),
            name: input.name,
            enabled: input.enabled,
            interval_days: input.interval_days,
            phone_number: input.phone_number,
            content: input.content,
            created_at: now,
            updated_at: now,
            last_run_at: 0,
            last_message_id: None,
            last_run_status: None,
        };
        let path = self.task_path(&task.id)?;
        let _guard = self.write_lock.lock().await;
        Self::write_record(&path, &task).await?;
        Ok(task)
    }

    /// Replace the user-editable fields; run history is preserved.
    pub async fn update_task(&self, id: &str, input: &TaskInput) -> Result<Option<ScheduledTask>> {
        let input = self.validate_task_input(input)?;
        let path = self.task_path(id)?;
        let _guard = self.write_lock.lock().await;
        let Some(mut task) = Self::read_record::<ScheduledTask>(&path).await? else {
            return Ok(None);
        };
        task.name = input.name;
        task.enabled = input.enabled;
        task.interval_days = input.interval_days;
        task.phone_number = input.phone_number;
        task.content = input.content;
        task.updated_at = now_millis();
        Self::write_record(&path, &task).await?;
        Ok(Some(task))
    }

    pub async fn delete_task(&self, id: &str) -> Result<bool> {
        let path = self.task_path(id)?;
        let _guard = self.write_lock.lock().await;
        Self::remove_record(&path).await
    }

    /// Bookkeeping after a task fired: when it ran and which send it produced.
    pub async fn record_task_run(&self, id: &str, ran_at: i64, message_id: &str) -> Result<bool> {
        let path = self.task_path(id)?;
        let _guard = self.write_lock.lock().await;
        let Some(mut task) = Self::read_record::<ScheduledTask>(&path).await? else {
            return Ok(false);
        };
        task.last_run_at = ran_at;
        task.last_message_id = Some(message_id.to_string());
        task.last_run_status = Some(MessageStatus::Sending);
        task.updated_at = now_millis();
        Self::write_record(&path, &task).await?;
        Ok(true)
    }
}

#[async_trait]
impl MessageStore for Storage {
    async fn save_message(&self, msg: &TextMessage) -> Result<()> {
        let path = self.message_path(&msg.id)?;
        let _guard = self.write_lock.lock().await;
        Self::write_record(&path, msg).await
    }

    async fn get_message(&self, id: &str) -> Result<Option<TextMessage>> {
        Self::read_record(&self.message_path(id)?).await
    }

    async fn update_message_status(&self, id: &str, status: MessageStatus) -> Result<bool> {
        self.set_status_if(id, status, None).await
    }

    async fn update_task_run_status(&self, message_id: &str, status: MessageStatus) -> Result<()> {
        let message_id = validate_record_id(message_id)?;
        let tasks = self.list_tasks().await?;
        let Some(task) = tasks
            .into_iter()
            .find(|t| t.last_message_id.as_deref() == Some(message_id.as_str()))
        else {
            return Ok(());
        };

        let path = self.task_path(&task.id)?;
        let _guard = self.write_lock.lock().await;
        if let Some(mut current) = Self::read_record::<ScheduledTask>(&path).await? {
            if current.last_message_id.as_deref() == Some(message_id.as_str()) {
                current.last_run_status = Some(status);
                current.updated_at = now_millis();
                Self::write_record(&path, &current).await?;
                debug!("Task {} last run marked {}", current.id, status);
            }
        }
        Ok(())
    }
}

/// Write `content` to `path` atomically under an exclusive file lock.
///
/// Synchronous I/O: `fs2` has no async API.
pub fn write_file_locked(path: &Path, content: &str) -> Result<()> {
    use std::fs::{File, OpenOptions};
    use std::io::Write;

    let lock_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)?;
    lock_file.lock_exclusive()?;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let base = path.file_name().and_then(|s| s.to_str()).unwrap_or("record.json");
    let mut counter = 0u32;
    let tmp_path = loop {
        let candidate = dir.join(format!(".{}.tmp-{}-{}", base, std::process::id(), counter));
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(mut tmp) => {
                tmp.write_all(content.as_bytes())?;
                tmp.flush()?;
                let _ = tmp.sync_all();
                break candidate;
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                counter = counter.saturating_add(1);
            }
            Err(e) => return Err(anyhow!("Failed to create temp file for atomic write: {}", e)),
        }
    };

    std::fs::rename(&tmp_path, path)?;
    if let Ok(dir_file) = File::open(dir) {
        let _ = dir_file.sync_all();
    }
    drop(lock_file);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn storage() -> (TempDir, Storage) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path().to_str().unwrap()).await.unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn save_get_update_roundtrip() {
        let (_dir, storage) = storage().await;
        let msg = TextMessage::outgoing("10086", "hello");
        storage.save_message(&msg).await.unwrap();

        let loaded = storage.get_message(&msg.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, MessageStatus::Sending);

        assert!(storage.update_message_status(&msg.id, MessageStatus::Sent).await.unwrap());
        let loaded = storage.get_message(&msg.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, MessageStatus::Sent);
        assert!(loaded.updated_at >= msg.updated_at);
    }

    #[tokio::test]
    async fn unknown_id_update_is_false_and_bad_id_is_error() {
        let (_dir, storage) = storage().await;
        let id = Uuid::new_v4().to_string();
        assert!(!storage.update_message_status(&id, MessageStatus::Sent).await.unwrap());
        assert!(storage.update_message_status("../x", MessageStatus::Sent).await.is_err());
        assert!(storage.get_message(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_sending_records_are_failed() {
        let (_dir, storage) = storage().await;
        let mut old = TextMessage::outgoing("10086", "old");
        old.created_at -= 3_600_000;
        let fresh = TextMessage::outgoing("10086", "fresh");
        storage.save_message(&old).await.unwrap();
        storage.save_message(&fresh).await.unwrap();

        let changed = storage.sweep_stale_sending(Duration::from_secs(600)).await.unwrap();
        assert_eq!(changed, vec![old.id.clone()]);
        assert_eq!(
            storage.get_message(&old.id).await.unwrap().unwrap().status,
            MessageStatus::Failed
        );
        assert_eq!(
            storage.get_message(&fresh.id).await.unwrap().unwrap().status,
            MessageStatus::Sending
        );
    }

    #[tokio::test]
    async fn write_leaves_no_temp_files() {
        let (dir, storage) = storage().await;
        let msg = TextMessage::incoming(RecordKind::Sms, "10086", "hi", now_millis());
        storage.save_message(&msg).await.unwrap();
        storage.save_message(&msg).await.unwrap();
        let names: Vec<String> = std::fs::read_dir(dir.path().join("messages"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec![format!("{}.json", msg.id)]);
    }
}
