//! Call records and the knowledge-base type.
//!
//! A `Call` is one conversation session: an ordered transcript of messages
//! plus lifecycle metadata. The orchestrator is the only component that
//! mutates these records; everything else sees clones or borrows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a call. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Scheduled,
    Active,
    Completed,
    Failed,
}

impl CallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallStatus::Completed | CallStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One utterance in a call transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Set on assistant messages; equals the call's `assistant_name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
            agent_name: None,
        }
    }

    pub fn assistant(content: impl Into<String>, agent_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
            agent_name: Some(agent_name.into()),
        }
    }
}

/// One conversation session, from greeting to hang-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    pub id: String,
    pub status: CallStatus,
    pub start_time: DateTime<Utc>,
    /// Present exactly when `status` is terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub messages: Vec<Message>,
    pub assistant_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl Call {
    /// Creates an `Active` call seeded with the opening greeting, so the
    /// transcript is never empty while the call is live.
    pub fn new(greeting: impl Into<String>, assistant_name: impl Into<String>) -> Self {
        let assistant_name = assistant_name.into();
        Self {
            id: Uuid::new_v4().to_string(),
            status: CallStatus::Active,
            start_time: Utc::now(),
            end_time: None,
            messages: vec![Message::assistant(greeting, assistant_name.clone())],
            assistant_name,
            summary: None,
        }
    }

    /// Appends a message, clamping its timestamp so the sequence stays
    /// monotonically non-decreasing even if the wall clock steps backwards.
    pub fn push_message(&mut self, mut message: Message) {
        debug_assert!(!self.status.is_terminal(), "append to a terminal call");
        if let Some(last) = self.messages.last() {
            if message.timestamp < last.timestamp {
                message.timestamp = last.timestamp;
            }
        }
        self.messages.push(message);
    }

    /// Moves the call to a terminal state. `end_time` is set on the first
    /// close only; closing an already-terminal call changes nothing.
    pub fn close(&mut self, status: CallStatus, summary: Option<String>) {
        debug_assert!(status.is_terminal());
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.end_time = Some(Utc::now());
        if summary.is_some() {
            self.summary = summary;
        }
    }
}

/// A named bundle of persona instructions and reference content used to
/// build generation prompts. Selected per call turn by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub id: String,
    pub name: String,
    pub description: String,
    pub content: String,
    pub prompt: String,
}
