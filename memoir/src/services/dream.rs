use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;

use crate::config::{DreamConfig, MemoryConfig};
use crate::db::MetadataStore;
use crate::error::Result;
use crate::llm::LlmProvider;
use crate::models::{Memory, MemoryKind, MemoryStatus};

use super::memory::{AddInput, MemoryService, SetInput};

const DEFAULT_FACT_SUPERSEDE_THRESHOLD: f32 = 0.75;
const NOTHING_TO_CONSOLIDATE: &str = "NOTHING_TO_CONSOLIDATE";

const SYSTEM_PROMPT: &str = r#"You consolidate an AI agent's raw memory fragments into durable knowledge.
You will be given a chronological list of fragments for one user. Decide whether any of them
describe the same underlying fact, preference, or topic thread worth compressing.

Reply with EITHER:
- the exact literal string NOTHING_TO_CONSOLIDATE, if nothing is worth consolidating, OR
- a single JSON object with this exact shape:
{
  "consolidated": [string, ...],
  "preferences": [{"text": string}, ...],
  "facts": [{"text": string, "supersedes": string or null}, ...]
}

"supersedes" should contain the exact text of an earlier fragment this fact corrects or replaces,
or be omitted/null if it does not correct anything. Do not wrap the JSON in commentary."#;

/// A parsed Dream LLM reply, already degraded if the raw text wasn't valid JSON.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct DreamReply {
    #[serde(default)]
    pub consolidated: Vec<String>,
    #[serde(default)]
    pub preferences: Vec<PreferenceEntry>,
    #[serde(default)]
    pub facts: Vec<FactEntry>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PreferenceEntry {
    pub text: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FactEntry {
    pub text: String,
    #[serde(default)]
    pub supersedes: Option<String>,
}

/// Strips a single pair of surrounding Markdown code fences (```` ``` ```` or
/// ` ```json `), then attempts a JSON parse. On failure, degrades to a
/// line-oriented parser: every non-empty line that isn't a bare JSON bracket
/// becomes a `consolidated` entry. Pure and unit-testable per the design
/// note that this boundary must tolerate noisy LLM output.
pub fn parse_dream_reply(raw: &str) -> DreamReply {
    let trimmed = raw.trim();
    if trimmed == NOTHING_TO_CONSOLIDATE {
        return DreamReply::default();
    }

    let unfenced = strip_fences(trimmed);
    if let Ok(reply) = serde_json::from_str::<DreamReply>(unfenced) {
        return reply;
    }

    let consolidated = unfenced
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !(line.starts_with('{') || line.starts_with('[')))
        .map(str::to_string)
        .collect();

    DreamReply { consolidated, preferences: Vec::new(), facts: Vec::new() }
}

fn strip_fences(text: &str) -> &str {
    let text = text
        .strip_prefix("```json")
        .or_else(|| text.strip_prefix("```"))
        .unwrap_or(text)
        .trim_start();
    text.strip_suffix("```").unwrap_or(text).trim()
}

#[derive(Debug, Clone)]
pub struct DreamRunSummary {
    pub ran: bool,
    pub input_count: usize,
    pub output_count: i64,
    pub status: String,
}

impl DreamRunSummary {
    fn skipped(reason: &str) -> Self {
        tracing::info!(reason, "dream run skipped");
        Self { ran: false, input_count: 0, output_count: 0, status: reason.to_string() }
    }
}

/// Periodic job that compresses noisy fragments into facts/preferences via
/// an LLM, with per-tenant error isolation (§4.7). Shares the budget/decay
/// sweep with every tick regardless of whether Dream itself is enabled.
#[derive(Clone)]
pub struct DreamConsolidator {
    db: Arc<dyn MetadataStore>,
    memory: MemoryService,
    llm: Arc<LlmProvider>,
    config: DreamConfig,
    budget: MemoryConfig,
}

impl DreamConsolidator {
    pub fn new(
        db: Arc<dyn MetadataStore>,
        memory: MemoryService,
        llm: Arc<LlmProvider>,
        config: DreamConfig,
        budget: MemoryConfig,
    ) -> Self {
        Self { db, memory, llm, config, budget }
    }

    pub fn interval_secs(&self) -> u64 {
        self.config.interval_secs
    }

    pub async fn run_once(&self) -> Result<DreamRunSummary> {
        let evicted = self.db.enforce_budget(self.budget.max_memory_count as i64).await?;
        let expired = self
            .db
            .clean_expired_conversations(
                self.budget.conversation_expiry_days,
                self.budget.conversation_expiry_max_access_count,
            )
            .await?;
        tracing::info!(evicted, expired, "dream budget and decay sweep complete");

        if !self.config.enabled {
            return Ok(DreamRunSummary::skipped("dream disabled by configuration"));
        }

        let since = Utc::now() - ChronoDuration::seconds(self.config.window_secs);
        let records = self.db.get_recent_active(since, self.config.max_items as i64).await?;
        if records.len() < self.config.min_count {
            return Ok(DreamRunSummary::skipped("fewer than min_count recent records"));
        }
        let input_count = records.len();

        let log_id = self.db.log_dream_start(input_count as i64).await?;

        let mut groups: HashMap<String, Vec<Memory>> = HashMap::new();
        for record in records {
            groups.entry(record.user_id.clone()).or_default().push(record);
        }

        let mut output_count: i64 = 0;
        let mut had_errors = false;

        for (user_id, mut group) in groups {
            group.sort_by_key(|m| m.created_at);
            match self.consolidate_tenant(&user_id, &group).await {
                Ok(created) => output_count += created as i64,
                Err(e) => {
                    had_errors = true;
                    tracing::error!(user_id = %user_id, error = %e, "dream consolidation failed for tenant");
                }
            }
        }

        let status = if had_errors { "completed_with_errors" } else { "ok" };
        self.db.log_dream_finish(&log_id, output_count, status, None).await?;

        Ok(DreamRunSummary { ran: true, input_count, output_count, status: status.to_string() })
    }

    async fn consolidate_tenant(&self, user_id: &str, fragments: &[Memory]) -> Result<usize> {
        let prompt = build_prompt(fragments);
        let system_prompt = self.config.system_prompt.as_deref().unwrap_or(SYSTEM_PROMPT);
        let raw = self.llm.complete_with_system(system_prompt, &prompt).await?;
        let reply = parse_dream_reply(&raw);

        let today = Utc::now().date_naive().to_string();
        let mut created = 0usize;

        for text in &reply.consolidated {
            self.memory
                .add(AddInput {
                    user_id: user_id.to_string(),
                    content: text.clone(),
                    kind: MemoryKind::Summary,
                    source: Some("dream".to_string()),
                    tags: vec!["dream".to_string(), "consolidated".to_string(), today.clone()],
                    status: MemoryStatus::Dream,
                    ..Default::default()
                })
                .await?;
            created += 1;
        }

        for preference in &reply.preferences {
            self.memory
                .add(AddInput {
                    user_id: user_id.to_string(),
                    content: preference.text.clone(),
                    kind: MemoryKind::Preference,
                    source: Some("dream".to_string()),
                    tags: vec!["dream".to_string(), "consolidated".to_string(), today.clone()],
                    status: MemoryStatus::Dream,
                    ..Default::default()
                })
                .await?;
            created += 1;
        }

        for fact in &reply.facts {
            match &fact.supersedes {
                Some(supersedes) => {
                    self.memory
                        .set(SetInput {
                            user_id: user_id.to_string(),
                            content: fact.text.clone(),
                            kind: MemoryKind::Fact,
                            source: Some("dream".to_string()),
                            tags: vec!["dream".to_string(), "conflict_resolved".to_string()],
                            match_query: Some(supersedes.clone()),
                            match_threshold: Some(DEFAULT_FACT_SUPERSEDE_THRESHOLD),
                            ..Default::default()
                        })
                        .await?;
                }
                None => {
                    self.memory
                        .add(AddInput {
                            user_id: user_id.to_string(),
                            content: fact.text.clone(),
                            kind: MemoryKind::Fact,
                            source: Some("dream".to_string()),
                            tags: vec!["dream".to_string()],
                            status: MemoryStatus::Dream,
                            ..Default::default()
                        })
                        .await?;
                }
            }
            created += 1;
        }

        let ids: Vec<String> = fragments.iter().map(|m| m.id.clone()).collect();
        self.db.mark_consolidated(&ids).await?;

        Ok(created)
    }
}

fn build_prompt(fragments: &[Memory]) -> String {
    let lines: Vec<String> = fragments
        .iter()
        .map(|m| format!("[{}] {}", m.created_at.to_rfc3339(), m.content))
        .collect();
    format!("Fragments, oldest first:\n{}", lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nothing_to_consolidate_yields_empty_reply() {
        let reply = parse_dream_reply("NOTHING_TO_CONSOLIDATE");
        assert_eq!(reply, DreamReply::default());
    }

    #[test]
    fn nothing_to_consolidate_tolerates_surrounding_whitespace() {
        let reply = parse_dream_reply("  NOTHING_TO_CONSOLIDATE\n");
        assert_eq!(reply, DreamReply::default());
    }

    #[test]
    fn parses_well_formed_json() {
        let raw = r#"{"consolidated": ["a"], "preferences": [], "facts": [{"text": "IP is 5.6.7.8", "supersedes": "IP is 1.2.3.4"}]}"#;
        let reply = parse_dream_reply(raw);
        assert_eq!(reply.consolidated, vec!["a".to_string()]);
        assert_eq!(reply.facts.len(), 1);
        assert_eq!(reply.facts[0].supersedes.as_deref(), Some("IP is 1.2.3.4"));
    }

    #[test]
    fn strips_markdown_fences_before_parsing() {
        let raw = "```json\n{\"consolidated\": [\"x\"], \"preferences\": [], \"facts\": []}\n```";
        let reply = parse_dream_reply(raw);
        assert_eq!(reply.consolidated, vec!["x".to_string()]);
    }

    #[test]
    fn strips_bare_fences_without_json_tag() {
        let raw = "```\n{\"consolidated\": [\"y\"], \"preferences\": [], \"facts\": []}\n```";
        let reply = parse_dream_reply(raw);
        assert_eq!(reply.consolidated, vec!["y".to_string()]);
    }

    #[test]
    fn degrades_to_line_split_on_malformed_json() {
        let raw = "User likes Go\nUser is building a CLI tool\n{not quite json";
        let reply = parse_dream_reply(raw);
        assert_eq!(reply.consolidated, vec!["User likes Go".to_string(), "User is building a CLI tool".to_string()]);
        assert!(reply.preferences.is_empty());
        assert!(reply.facts.is_empty());
    }

    #[test]
    fn line_split_skips_blank_lines_and_bracket_lines() {
        let raw = "\n\nfirst fact\n[\n]\n\nsecond fact\n";
        let reply = parse_dream_reply(raw);
        assert_eq!(reply.consolidated, vec!["first fact".to_string(), "second fact".to_string()]);
    }

    #[test]
    fn build_prompt_lists_fragments_chronologically_with_timestamps() {
        let fragments = vec![
            Memory::new("a".into(), "u1".into(), "first".into()),
            Memory::new("b".into(), "u1".into(), "second".into()),
        ];
        let prompt = build_prompt(&fragments);
        assert!(prompt.contains("first"));
        assert!(prompt.contains("second"));
        assert!(prompt.find("first").unwrap() < prompt.find("second").unwrap());
    }
}
