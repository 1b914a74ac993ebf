use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The semantic role of a memory. Recall and eviction policies branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Conversation,
    Fact,
    Preference,
    Summary,
}

impl Default for MemoryKind {
    fn default() -> Self {
        Self::Conversation
    }
}

impl MemoryKind {
    /// `fact` and `preference` are protected from budget eviction.
    pub fn is_budget_protected(&self) -> bool {
        matches!(self, Self::Fact | Self::Preference)
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Conversation => "conversation",
            Self::Fact => "fact",
            Self::Preference => "preference",
            Self::Summary => "summary",
        };
        write!(f, "{s}")
    }
}

impl FromStr for MemoryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conversation" => Ok(Self::Conversation),
            "fact" => Ok(Self::Fact),
            "preference" => Ok(Self::Preference),
            "summary" => Ok(Self::Summary),
            other => Err(format!("unknown memory kind: {other}")),
        }
    }
}

/// Lifecycle tag for a memory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStatus {
    Active,
    Consolidated,
    Dream,
}

impl Default for MemoryStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl fmt::Display for MemoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Consolidated => "consolidated",
            Self::Dream => "dream",
        };
        write!(f, "{s}")
    }
}

impl FromStr for MemoryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "consolidated" => Ok(Self::Consolidated),
            "dream" => Ok(Self::Dream),
            other => Err(format!("unknown memory status: {other}")),
        }
    }
}

/// The unit of storage and retrieval: a durable record representing
/// something an agent should remember.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    pub user_id: String,
    pub session_id: Option<String>,
    pub content: String,
    pub summary: String,
    pub kind: MemoryKind,
    pub source: Option<String>,
    pub tags: Vec<String>,
    pub embed_provider: Option<String>,
    pub status: MemoryStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: i64,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Memory {
    pub fn new(id: String, user_id: String, content: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id,
            session_id: None,
            content,
            summary: String::new(),
            kind: MemoryKind::default(),
            source: None,
            tags: Vec::new(),
            embed_provider: None,
            status: MemoryStatus::default(),
            created_at: now,
            updated_at: now,
            last_accessed_at: now,
            access_count: 0,
            deleted_at: None,
        }
    }

    pub fn is_visible(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// The text the embedding manager should embed: the summary if one was
    /// produced, otherwise the raw content.
    pub fn embedding_source(&self) -> &str {
        if self.summary.is_empty() {
            &self.content
        } else {
            &self.summary
        }
    }
}

/// `(memory, score)` — higher score means higher recall priority.
pub type ScoredMemory = (Memory, f32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_memory_defaults() {
        let m = Memory::new("id1".into(), "u1".into(), "hello".into());
        assert_eq!(m.kind, MemoryKind::Conversation);
        assert_eq!(m.status, MemoryStatus::Active);
        assert_eq!(m.access_count, 0);
        assert!(m.is_visible());
        assert!(m.deleted_at.is_none());
    }

    #[test]
    fn embedding_source_prefers_summary() {
        let mut m = Memory::new("id1".into(), "u1".into(), "raw content".into());
        assert_eq!(m.embedding_source(), "raw content");
        m.summary = "short summary".into();
        assert_eq!(m.embedding_source(), "short summary");
    }

    #[test]
    fn kind_round_trips_through_display_and_from_str() {
        for kind in [
            MemoryKind::Conversation,
            MemoryKind::Fact,
            MemoryKind::Preference,
            MemoryKind::Summary,
        ] {
            let s = kind.to_string();
            assert_eq!(s.parse::<MemoryKind>().unwrap(), kind);
        }
    }

    #[test]
    fn status_round_trips_through_display_and_from_str() {
        for status in [
            MemoryStatus::Active,
            MemoryStatus::Consolidated,
            MemoryStatus::Dream,
        ] {
            let s = status.to_string();
            assert_eq!(s.parse::<MemoryStatus>().unwrap(), status);
        }
    }

    #[test]
    fn fact_and_preference_are_budget_protected() {
        assert!(MemoryKind::Fact.is_budget_protected());
        assert!(MemoryKind::Preference.is_budget_protected());
        assert!(!MemoryKind::Conversation.is_budget_protected());
        assert!(!MemoryKind::Summary.is_budget_protected());
    }
}
