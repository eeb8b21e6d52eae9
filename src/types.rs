use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TicketStatus {
    Open,
    Pending,
    OnHold,
    Resolved,
    Closed,
}

impl TicketStatus {
    /// Statuses during which SLA clocks are suspended.
    pub fn is_paused(self) -> bool {
        matches!(self, TicketStatus::Pending | TicketStatus::OnHold)
    }

    pub fn is_resolution(self) -> bool {
        matches!(self, TicketStatus::Resolved | TicketStatus::Closed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TicketStatus::Open => "open",
            TicketStatus::Pending => "pending",
            TicketStatus::OnHold => "on_hold",
            TicketStatus::Resolved => "resolved",
            TicketStatus::Closed => "closed",
        }
    }
}

impl FromStr for TicketStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "open" => Ok(TicketStatus::Open),
            "pending" => Ok(TicketStatus::Pending),
            "on_hold" => Ok(TicketStatus::OnHold),
            "resolved" => Ok(TicketStatus::Resolved),
            "closed" => Ok(TicketStatus::Closed),
            other => Err(format!("unknown ticket status {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(format!("unknown priority {other}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Ticket {
    pub id: i64,
    pub subject: String,
    pub status: TicketStatus,
    pub priority: Priority,
    pub customer_id: i64,
    pub assignee_id: Option<i64>,
    pub mailbox_id: Option<i64>,
    pub created_at: i64,
    pub last_activity_at: i64,
}

/// Who authored a message: an agent (`User`) or a `Customer`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sender {
    User(i64),
    Customer(i64),
}

impl Sender {
    pub fn kind(&self) -> &'static str {
        match self {
            Sender::User(_) => "user",
            Sender::Customer(_) => "customer",
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            Sender::User(id) | Sender::Customer(id) => *id,
        }
    }

    pub fn from_parts(kind: &str, id: i64) -> Option<Self> {
        match kind {
            "user" => Some(Sender::User(id)),
            "customer" => Some(Sender::Customer(id)),
            _ => None,
        }
    }

    pub fn is_agent(&self) -> bool {
        matches!(self, Sender::User(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Reply,
    InternalNote,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Reply => "reply",
            MessageKind::InternalNote => "internal_note",
        }
    }

    pub fn from_str_lossy(raw: &str) -> Self {
        match raw {
            "internal_note" => MessageKind::InternalNote,
            _ => MessageKind::Reply,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

impl Attachment {
    pub fn size_bytes(&self) -> usize {
        self.content.len()
    }
}

#[derive(Clone, Debug)]
pub struct Message {
    pub id: i64,
    pub ticket_id: i64,
    pub sender: Sender,
    pub kind: MessageKind,
    pub body_text: String,
    pub body_html: Option<String>,
    pub created_at: i64,
    pub attachments: Vec<Attachment>,
}

/// A message about to be written; ids are assigned by the store.
#[derive(Clone, Debug)]
pub struct NewMessage {
    pub sender: Sender,
    pub kind: MessageKind,
    pub body_text: String,
    pub body_html: Option<String>,
    pub created_at: i64,
    pub attachments: Vec<Attachment>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MailboxKind {
    Imap,
    Gmail,
    Microsoft,
}

impl MailboxKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MailboxKind::Imap => "imap",
            MailboxKind::Gmail => "gmail",
            MailboxKind::Microsoft => "microsoft",
        }
    }
}

impl fmt::Display for MailboxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MailboxKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "imap" => Ok(MailboxKind::Imap),
            "gmail" => Ok(MailboxKind::Gmail),
            "microsoft" => Ok(MailboxKind::Microsoft),
            other => Err(format!("unknown mailbox kind {other}")),
        }
    }
}

/// Provider-specific opaque ingestion marker. Only the owning adapter
/// interprets the contents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cursor(pub String);

impl Cursor {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Clone, Debug)]
pub struct Mailbox {
    pub id: i64,
    pub kind: MailboxKind,
    pub address: String,
    pub polling_interval_secs: i64,
    pub active: bool,
    pub last_checked_at: Option<i64>,
    pub cursor: Option<Cursor>,
    /// Provider settings as JSON; each adapter owns its schema.
    pub settings: serde_json::Value,
    pub deactivated_reason: Option<String>,
}

#[derive(Clone, Debug)]
pub struct SlaPolicy {
    pub id: i64,
    pub name: String,
    pub priority: Priority,
    pub first_response_hours: i64,
    pub resolution_hours: i64,
    pub active: bool,
}

/// Provider-agnostic inbound email.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NormalizedMessage {
    pub external_id: String,
    pub message_id: Option<String>,
    pub from_address: String,
    pub from_name: Option<String>,
    pub subject: String,
    pub body_text: String,
    pub body_html: Option<String>,
    pub received_at: i64,
    pub attachments: Vec<Attachment>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
}

impl NormalizedMessage {
    /// The key later replies will reference this message by.
    pub fn thread_key(&self) -> &str {
        self.message_id.as_deref().unwrap_or(&self.external_id)
    }

    /// Candidate thread keys of the conversation this message replies to,
    /// most specific first.
    pub fn parent_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = Vec::new();
        if let Some(parent) = self.in_reply_to.as_deref() {
            keys.push(parent);
        }
        for reference in self.references.iter().rev() {
            if !keys.contains(&reference.as_str()) {
                keys.push(reference);
            }
        }
        keys
    }
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}
