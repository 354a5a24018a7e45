//! Domain types shared across the store, adapter, and session layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status is monotone: it only ever advances
/// OPEN -> IN_PROGRESS -> AWAITING_VERIFICATION under normal operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(i64)]
pub enum TaskStatus {
    Open = 0,
    InProgress = 1,
    AwaitingVerification = 2,
}

impl TaskStatus {
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Open),
            1 => Some(Self::InProgress),
            2 => Some(Self::AwaitingVerification),
            _ => None,
        }
    }
}

/// Tri-state answer: distinct from `Option<bool>` so that "no answer yet"
/// (`Unknown`) can't be confused with a parsed "no". Persisted as a plain
/// bool in `user_responses.performed` (defaulting to `false` until a real
/// answer lands), per the storage schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Performed {
    Unknown,
    Yes,
    No,
}

impl Performed {
    pub fn as_bool(self) -> bool {
        matches!(self, Performed::Yes)
    }
}

/// A persisted alert, the join of the `alerts`, `user_responses`, and
/// `alert_status` tables (the full alert view).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub hash: String,
    pub title: String,
    pub username: String,
    pub description: String,
    pub reason: String,
    pub url: Option<String>,
    pub event_time: DateTime<Utc>,
    pub status: TaskStatus,
    pub performed: Performed,
    pub comment: String,
    pub authenticated: bool,
}

/// Fields needed to create a new alert; `hash` defaults to a random 32-byte
/// value if not supplied (`TaskStore::create`).
#[derive(Debug, Clone)]
pub struct NewTask {
    pub title: String,
    pub username: String,
    pub description: String,
    pub reason: String,
    pub url: Option<String>,
    pub hash: Option<String>,
}

/// Tri-state last answer a session has received (`UserSession::last_message`).
/// A tagged value rather than `Option<bool>` plus a separate text field:
/// `Unset` means no answer has arrived this turn, and is never conflated
/// with an empty-text `Yes`/`No`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    Unset,
    Yes(String),
    No(String),
}

impl Answer {
    pub fn is_set(&self) -> bool {
        !matches!(self, Answer::Unset)
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Answer::Unset => None,
            Answer::Yes(text) | Answer::No(text) => Some(text),
        }
    }
}

/// A chat-platform identity, as returned by `ChatAdapter::get_users`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatUser {
    pub id: String,
    pub username: String,
    pub first_name: Option<String>,
    pub real_name: Option<String>,
}

impl ChatUser {
    /// Best available display name: first name, then real name, then the
    /// bare username.
    pub fn display_name(&self) -> &str {
        self.first_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.real_name.as_deref().filter(|s| !s.is_empty()))
            .unwrap_or(&self.username)
    }
}

/// An inbound chat message, as returned by `ChatAdapter::get_messages`.
#[derive(Debug, Clone)]
pub struct Message {
    pub user_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    None,
    Pending,
    Authorized,
    Denied,
}
