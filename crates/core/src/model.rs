use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualifiedId {
    pub id: String,
    pub domain: String,
}

impl QualifiedId {
    pub fn new(id: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            domain: domain.into(),
        }
    }
}

impl fmt::Display for QualifiedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.domain.is_empty() {
            write!(f, "{}", self.id)
        } else {
            write!(f, "{}@{}", self.id, self.domain)
        }
    }
}

impl FromStr for QualifiedId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidConfig {
                message: "qualified id must not be empty".to_string(),
            });
        }
        match s.rsplit_once('@') {
            Some((id, domain)) if !id.is_empty() => Ok(Self::new(id, domain)),
            _ => Ok(Self::new(s, "")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: QualifiedId,
    pub name: Option<String>,
    pub handle: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    OneOnOne,
    Group,
    SelfConversation,
}

impl ConversationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OneOnOne => "one_on_one",
            Self::Group => "group",
            Self::SelfConversation => "self",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "one_on_one" => Self::OneOnOne,
            "self" => Self::SelfConversation,
            _ => Self::Group,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: QualifiedId,
    pub name: Option<String>,
    pub kind: ConversationKind,
    pub last_modified_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

impl Direction {
    pub fn for_sender(sender: &QualifiedId, self_user_id: &QualifiedId) -> Self {
        if sender == self_user_id {
            Self::Outgoing
        } else {
            Self::Incoming
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Outgoing => "outgoing",
            Self::Incoming => "incoming",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "outgoing" {
            Self::Outgoing
        } else {
            Self::Incoming
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageContent {
    Text {
        text: String,
        #[serde(default, rename = "quotedMessageId", skip_serializing_if = "Option::is_none")]
        quoted_message_id: Option<String>,
    },
    Asset {
        #[serde(rename = "mimeType")]
        mime_type: String,
        size: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(rename = "otrKey")]
        otr_key: String,
        sha256: String,
        #[serde(rename = "assetId")]
        asset_id: String,
    },
    Location {
        longitude: f64,
        latitude: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        zoom: Option<i32>,
    },
    Knock {
        #[serde(default, rename = "hotKnock")]
        hot_knock: bool,
    },
}

impl MessageContent {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Asset { .. } => "asset",
            Self::Location { .. } => "location",
            Self::Knock { .. } => "knock",
        }
    }
}

/// Content types that bump a conversation's "last modified" timestamp.
pub const LAST_MODIFIED_CONTENT_TYPES: &[&str] = &["text", "asset", "location", "knock"];

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub conversation_id: QualifiedId,
    pub sender_user_id: QualifiedId,
    pub sender_client_id: Option<String>,
    pub creation_ms: i64,
    pub last_edit_ms: Option<i64>,
    pub direction: Direction,
    pub content: MessageContent,
}

/// Call history entry. Only restored from backups made by the same client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub conversation_id: QualifiedId,
    pub caller_id: QualifiedId,
    pub status: String,
    pub created_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupUser {
    pub id: QualifiedId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

impl From<&User> for BackupUser {
    fn from(u: &User) -> Self {
        Self {
            id: u.id.clone(),
            name: u.name.clone(),
            handle: u.handle.clone(),
        }
    }
}

impl From<BackupUser> for User {
    fn from(u: BackupUser) -> Self {
        Self {
            id: u.id,
            name: u.name,
            handle: u.handle,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupConversation {
    pub id: QualifiedId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub kind: ConversationKind,
    #[serde(default)]
    pub last_modified: i64,
}

impl From<&Conversation> for BackupConversation {
    fn from(c: &Conversation) -> Self {
        Self {
            id: c.id.clone(),
            name: c.name.clone(),
            kind: c.kind,
            last_modified: c.last_modified_ms,
        }
    }
}

impl From<BackupConversation> for Conversation {
    fn from(c: BackupConversation) -> Self {
        Self {
            id: c.id,
            name: c.name,
            kind: c.kind,
            last_modified_ms: c.last_modified,
        }
    }
}

/// Portable message form shared by multiplatform pages and remote message payloads.
/// It carries no direction; that is resolved against the restoring account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMessage {
    pub id: String,
    pub conversation_id: QualifiedId,
    pub sender_user_id: QualifiedId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_client_id: Option<String>,
    pub creation_date: i64,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_edit_time: Option<i64>,
}

impl BackupMessage {
    pub fn into_message(self, self_user_id: &QualifiedId) -> Message {
        let direction = Direction::for_sender(&self.sender_user_id, self_user_id);
        Message {
            id: self.id,
            conversation_id: self.conversation_id,
            sender_user_id: self.sender_user_id,
            sender_client_id: self.sender_client_id,
            creation_ms: self.creation_date,
            last_edit_ms: self.last_edit_time,
            direction,
            content: self.content,
        }
    }
}

impl From<&Message> for BackupMessage {
    fn from(m: &Message) -> Self {
        Self {
            id: m.id.clone(),
            conversation_id: m.conversation_id.clone(),
            sender_user_id: m.sender_user_id.clone(),
            sender_client_id: m.sender_client_id.clone(),
            creation_date: m.creation_ms,
            content: m.content.clone(),
            last_edit_time: m.last_edit_ms,
        }
    }
}
