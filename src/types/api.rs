use serde::{Deserialize, Serialize};
use std::fmt;

/// Placeholder title the backend assigns to a freshly created conversation.
pub const DEFAULT_CONVERSATION_TITLE: &str = "新对话";
/// Placeholder title for a work created without an explicit title.
pub const DEFAULT_WORK_TITLE: &str = "未命名创作";

const METADATA_VERSION: u32 = 1;

/// Server-issued identifier of a conversation or a work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(String);

impl ContextId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server-issued identifier of a persisted message document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    Conversation,
    Work,
}

impl ContextKind {
    pub fn default_title(self) -> &'static str {
        match self {
            ContextKind::Conversation => DEFAULT_CONVERSATION_TITLE,
            ContextKind::Work => DEFAULT_WORK_TITLE,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ContextKind::Conversation => "conversation",
            ContextKind::Work => "work",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "conversation" | "conv" | "chat" => Some(ContextKind::Conversation),
            "work" | "story" => Some(ContextKind::Work),
            _ => None,
        }
    }
}

/// A conversation or work as the client knows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextRecord {
    pub id: ContextId,
    pub kind: ContextKind,
    #[serde(default)]
    pub title: String,
}

impl ContextRecord {
    pub fn new(id: ContextId, kind: ContextKind, title: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            title: title.into(),
        }
    }

    /// An empty title counts as the placeholder; the backend renders it as one.
    pub fn has_default_title(&self) -> bool {
        self.title.is_empty() || self.title == self.kind.default_title()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Body of one persisted message as returned by get-message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentBody {
    pub id: DocumentId,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// One user turn to stream a reply for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRequest {
    pub kind: ContextKind,
    pub context_id: Option<ContextId>,
    pub model: String,
    pub user_text: String,
}

/// Structured record carried inside the sentinel span of a reply stream.
///
/// Only `documentId` is required; unknown fields are ignored so the server
/// can grow the record without breaking older clients.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMetadata {
    #[serde(default = "default_metadata_version")]
    pub version: u32,
    pub document_id: DocumentId,
    #[serde(default)]
    pub conversation_id: Option<ContextId>,
    #[serde(default)]
    pub work_id: Option<ContextId>,
}

fn default_metadata_version() -> u32 {
    METADATA_VERSION
}
