//! Group transfer progress — per-recipient state, the aggregate view derived
//! from it, and the observer callbacks.

use std::time::Duration;

use serde::Serialize;

use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recipient {
    pub id: String,
    pub name: String,
}

impl Recipient {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientStatus {
    Pending,
    Transferring,
    Succeeded,
    Failed,
}

impl RecipientStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecipientTransferState {
    pub id: String,
    pub name: String,
    pub status: RecipientStatus,
    /// 0..=100
    pub progress: u8,
    /// Bytes/sec averaged since the recipient's stream started.
    pub speed: u64,
    pub bytes_sent: u64,
    pub error: Option<String>,
}

impl RecipientTransferState {
    pub fn pending(recipient: &Recipient) -> Self {
        Self {
            id: recipient.id.clone(),
            name: recipient.name.clone(),
            status: RecipientStatus::Pending,
            progress: 0,
            speed: 0,
            bytes_sent: 0,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    Preparing,
    Transferring,
    Completed,
    Partial,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupTransferState {
    pub transfer_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub recipients: Vec<RecipientTransferState>,
}

impl GroupTransferState {
    /// Aggregate status. Terminal only once every recipient is.
    pub fn status(&self) -> GroupStatus {
        let all_terminal = self.recipients.iter().all(|r| r.status.is_terminal());
        if all_terminal && !self.recipients.is_empty() {
            let ok = self
                .recipients
                .iter()
                .filter(|r| r.status == RecipientStatus::Succeeded)
                .count();
            return match ok {
                0 => GroupStatus::Failed,
                n if n == self.recipients.len() => GroupStatus::Completed,
                _ => GroupStatus::Partial,
            };
        }
        if self
            .recipients
            .iter()
            .any(|r| r.status != RecipientStatus::Pending)
        {
            GroupStatus::Transferring
        } else {
            GroupStatus::Preparing
        }
    }

    /// Mean progress over recipients still in play. Failed recipients drop
    /// out so they don't pin the aggregate below 100.
    pub fn progress(&self) -> u8 {
        let live: Vec<u32> = self
            .recipients
            .iter()
            .filter(|r| r.status != RecipientStatus::Failed)
            .map(|r| r.progress as u32)
            .collect();
        if live.is_empty() {
            return 0;
        }
        (live.iter().sum::<u32>() / live.len() as u32) as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedRecipient {
    pub id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupTransferResult {
    pub transfer_id: String,
    pub successful_recipients: Vec<String>,
    pub failed_recipients: Vec<FailedRecipient>,
    pub status: GroupStatus,
    #[serde(serialize_with = "as_millis")]
    pub duration: Duration,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Callbacks fired while a group transfer runs. All default to no-ops.
///
/// Called from the per-recipient send tasks; implementations must not block.
pub trait TransferObserver: Send + Sync {
    fn on_recipient_progress(&self, _recipient: &str, _progress: u8, _speed: u64) {}
    fn on_recipient_complete(&self, _recipient: &str) {}
    fn on_recipient_error(&self, _recipient: &str, _error: &Error) {}
    fn on_overall_progress(&self, _progress: u8) {}
    /// Fires exactly once per transfer.
    fn on_complete(&self, _result: &GroupTransferResult) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl TransferObserver for NoopObserver {}
