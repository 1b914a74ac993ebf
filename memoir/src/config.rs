use std::env;

/// Parses an env var into `T`, falling back to `default` and logging on a
/// malformed value. Used only by the demo binary to build a [`Config`] for
/// local runs — this module does not own a configuration-loading subsystem;
/// the engine itself always receives an already-populated [`Config`].
pub fn parse_env_or<T: std::str::FromStr>(var: &str, default: T) -> T
where
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(val) => match val.parse() {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("invalid value '{}' for {}: {}. using default", val, var, e);
                default
            }
        },
        Err(_) => default,
    }
}

pub fn parse_env_opt<T: std::str::FromStr>(var: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(val) => match val.parse() {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::warn!("invalid value '{}' for {}: {}. ignoring", val, var, e);
                None
            }
        },
        Err(_) => None,
    }
}

/// Top-level configuration the engine receives, already parsed.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub data: DataConfig,
    pub embeddings: EmbeddingsConfig,
    pub llm: Option<LlmConfig>,
    pub dream: DreamConfig,
    pub memory: MemoryConfig,
}

/// Carried through from the external interface contract even though this
/// crate owns no transport; the out-of-scope HTTP/MCP layer reads `port`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct DataConfig {
    /// Path to the single-file metadata store, e.g. `file:memoir.db`.
    pub metadata_db_path: String,
    /// Directory the vector index is persisted under. Reattached on open.
    pub vector_index_dir: std::path::PathBuf,
}

/// Which provider chain `EmbeddingManager` builds for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingStrategy {
    CloudFirst,
    AccuracyFirst,
    LocalOnly,
}

#[derive(Debug, Clone)]
pub struct ProviderCredentials {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct EmbeddingsConfig {
    pub strategy: EmbeddingStrategy,
    pub dimensions: usize,
    pub primary_cloud: Option<ProviderCredentials>,
    pub alternate_cloud: Option<ProviderCredentials>,
    /// `add`'s LLM summarization step is skipped when this is set, even if
    /// `llm` is configured.
    pub disable_summarizer: bool,
}

/// LLM credentials shared by Dream consolidation and ingest-path
/// summarization, unless overridden per-job.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Debug, Clone)]
pub struct DreamConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub window_secs: i64,
    pub min_count: usize,
    pub max_items: usize,
    pub llm_override: Option<LlmConfig>,
    pub system_prompt: Option<String>,
}

impl Default for DreamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 24 * 3600,
            window_secs: 24 * 3600,
            min_count: 10,
            max_items: 200,
            llm_override: None,
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub max_memory_count: usize,
    pub conversation_expiry_days: i64,
    pub conversation_expiry_max_access_count: i64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_memory_count: 10_000,
            conversation_expiry_days: 30,
            conversation_expiry_max_access_count: 3,
        }
    }
}

impl Config {
    /// Builds a [`Config`] from environment variables for local/demo runs.
    /// Not a general configuration loader: every field has an explicit,
    /// documented default and there is no file-based or remote source.
    pub fn from_env() -> Self {
        let primary_cloud = env::var("EMBEDDING_PRIMARY_URL").ok().map(|base_url| {
            ProviderCredentials {
                base_url,
                api_key: env::var("EMBEDDING_PRIMARY_API_KEY").ok(),
                model: env::var("EMBEDDING_PRIMARY_MODEL")
                    .unwrap_or_else(|_| "text-embedding-3-small".to_string()),
            }
        });
        let alternate_cloud = env::var("EMBEDDING_ALTERNATE_URL").ok().map(|base_url| {
            ProviderCredentials {
                base_url,
                api_key: env::var("EMBEDDING_ALTERNATE_API_KEY").ok(),
                model: env::var("EMBEDDING_ALTERNATE_MODEL")
                    .unwrap_or_else(|_| "text-embedding-3-small".to_string()),
            }
        });

        Self {
            server: ServerConfig {
                port: parse_env_or("MEMOIR_PORT", 3000),
            },
            data: DataConfig {
                metadata_db_path: env::var("MEMOIR_DATABASE_URL")
                    .unwrap_or_else(|_| "file:memoir.db".to_string()),
                vector_index_dir: env::var("MEMOIR_VECTOR_DIR")
                    .unwrap_or_else(|_| "./memoir-vectors".to_string())
                    .into(),
            },
            embeddings: EmbeddingsConfig {
                strategy: match env::var("EMBEDDING_STRATEGY").as_deref() {
                    Ok("accuracy_first") => EmbeddingStrategy::AccuracyFirst,
                    Ok("local_only") => EmbeddingStrategy::LocalOnly,
                    _ => EmbeddingStrategy::CloudFirst,
                },
                dimensions: parse_env_or("EMBEDDING_DIMENSIONS", 384),
                primary_cloud,
                alternate_cloud,
                disable_summarizer: parse_env_or("DISABLE_SUMMARIZER", false),
            },
            llm: env::var("LLM_MODEL").ok().map(|model| LlmConfig {
                model,
                api_key: env::var("LLM_API_KEY").ok(),
                base_url: env::var("LLM_BASE_URL").ok(),
                timeout_secs: parse_env_or("LLM_TIMEOUT", 30),
                max_retries: parse_env_or("LLM_MAX_RETRIES", 3),
            }),
            dream: DreamConfig {
                enabled: parse_env_or("DREAM_ENABLED", true),
                interval_secs: parse_env_or("DREAM_INTERVAL_SECS", 24 * 3600),
                window_secs: parse_env_or("DREAM_WINDOW_SECS", 24 * 3600),
                min_count: parse_env_or("DREAM_MIN_COUNT", 10),
                max_items: parse_env_or("DREAM_MAX_ITEMS", 200),
                llm_override: None,
                system_prompt: env::var("DREAM_SYSTEM_PROMPT").ok(),
            },
            memory: MemoryConfig {
                max_memory_count: parse_env_or("MAX_MEMORY_COUNT", 10_000),
                conversation_expiry_days: parse_env_or("CONVERSATION_EXPIRY_DAYS", 30),
                conversation_expiry_max_access_count: parse_env_or(
                    "CONVERSATION_EXPIRY_MAX_ACCESS_COUNT",
                    3,
                ),
            },
        }
    }
}

/// Known LLM providers that use OpenAI-compatible APIs.
pub const KNOWN_LLM_PROVIDERS: &[&str] = &["openai", "openrouter", "ollama", "lmstudio"];

/// Parses a model name of the form `provider/model` into its two halves,
/// defaulting to `local` when the prefix isn't a known provider.
pub fn parse_llm_provider_model(model: &str) -> (&str, &str) {
    if let Some((prefix, rest)) = model.split_once('/') {
        if KNOWN_LLM_PROVIDERS.contains(&prefix.to_lowercase().as_str()) {
            return (prefix, rest);
        }
    }
    ("local", model)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_env_or_falls_back_on_missing() {
        std::env::remove_var("__MEMOIR_TEST_MISSING");
        let v: u16 = parse_env_or("__MEMOIR_TEST_MISSING", 42);
        assert_eq!(v, 42);
    }

    #[test]
    fn parse_env_or_falls_back_on_malformed() {
        std::env::set_var("__MEMOIR_TEST_BAD", "not-a-number");
        let v: u16 = parse_env_or("__MEMOIR_TEST_BAD", 7);
        assert_eq!(v, 7);
        std::env::remove_var("__MEMOIR_TEST_BAD");
    }

    #[test]
    fn dream_config_defaults_match_spec() {
        let d = DreamConfig::default();
        assert_eq!(d.interval_secs, 24 * 3600);
        assert_eq!(d.min_count, 10);
        assert_eq!(d.max_items, 200);
    }
}
