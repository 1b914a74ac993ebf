use chrono::{DateTime, Utc};
use libsql::{params, params::IntoParams, params::Params, Row};

use crate::error::{EngineError, Result};
use crate::models::{Memory, MemoryKind, MemoryStatus};

pub(crate) const INSERT_SQL: &str = r#"
    INSERT INTO memories (
        id, user_id, session_id, content, summary, kind, source, tags,
        embed_provider, status, created_at, updated_at, last_accessed_at,
        access_count, deleted_at
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
"#;

pub(crate) const SELECT_COLUMNS: &str = "id, user_id, session_id, content, summary, kind, \
    source, tags, embed_provider, status, created_at, updated_at, last_accessed_at, \
    access_count, deleted_at";

pub(crate) fn insert_params(memory: &Memory) -> Result<Params> {
    let tags = serde_json::to_string(&memory.tags)?;
    Ok(params![
        memory.id.clone(),
        memory.user_id.clone(),
        memory.session_id.clone(),
        memory.content.clone(),
        memory.summary.clone(),
        memory.kind.to_string(),
        memory.source.clone(),
        tags,
        memory.embed_provider.clone(),
        memory.status.to_string(),
        memory.created_at.to_rfc3339(),
        memory.updated_at.to_rfc3339(),
        memory.last_accessed_at.to_rfc3339(),
        memory.access_count,
        memory.deleted_at.map(|d| d.to_rfc3339()),
    ]
    .into_params()?)
}

/// Reconstructs a [`Memory`] from a row produced by a `SELECT {SELECT_COLUMNS}`
/// query, in that column order.
pub(crate) fn memory_from_row(row: &Row) -> Result<Memory> {
    let tags_json: String = row.get(7)?;
    let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();

    let kind_str: String = row.get(5)?;
    let kind = kind_str
        .parse::<MemoryKind>()
        .map_err(|_| EngineError::BadInput(format!("invalid memory kind '{kind_str}'")))?;

    let status_str: String = row.get(9)?;
    let status = status_str
        .parse::<MemoryStatus>()
        .map_err(|_| EngineError::BadInput(format!("invalid memory status '{status_str}'")))?;

    Ok(Memory {
        id: row.get(0)?,
        user_id: row.get(1)?,
        session_id: row.get::<Option<String>>(2)?,
        content: row.get(3)?,
        summary: row.get(4)?,
        kind,
        source: row.get::<Option<String>>(6)?,
        tags,
        embed_provider: row.get::<Option<String>>(8)?,
        status,
        created_at: parse_timestamp(&row.get::<String>(10)?)?,
        updated_at: parse_timestamp(&row.get::<String>(11)?)?,
        last_accessed_at: parse_timestamp(&row.get::<String>(12)?)?,
        access_count: row.get(13)?,
        deleted_at: row
            .get::<Option<String>>(14)?
            .map(|s| parse_timestamp(&s))
            .transpose()?,
    })
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EngineError::BadInput(format!("invalid timestamp '{value}': {e}")))
}
