use std::time::Duration;

use serde_json::Value;

use async_openai::{
    config::OpenAIConfig,
    error::{ApiError, OpenAIError},
    types::{
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequest, CreateChatCompletionRequestArgs, CreateChatCompletionResponse,
        Stop,
    },
    Client,
};

use crate::{
    config::{parse_llm_provider_model, LlmConfig},
    error::{EngineError, Result},
    llm::provider::CompletionOptions,
};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";
const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";

#[derive(Debug, Clone)]
struct ApiConfig {
    base_url: String,
    api_key: Option<String>,
    model: String,
    timeout_secs: u64,
    max_retries: u32,
}

#[derive(Clone)]
pub struct LlmApiClient {
    client: Client<OpenAIConfig>,
    config: ApiConfig,
}

impl LlmApiClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_config = ApiConfig::from_llm_config(config);

        let (provider, _) = parse_llm_provider_model(&config.model);
        let needs_api_key = !matches!(
            provider.to_lowercase().as_str(),
            "ollama" | "local" | "lmstudio"
        );

        if needs_api_key && api_config.api_key.is_none() {
            return Err(EngineError::LLMError(
                "API key required for this provider".to_string(),
            ));
        }

        let openai_config = OpenAIConfig::new()
            .with_api_base(api_config.base_url.clone())
            .with_api_key(api_config.api_key.clone().unwrap_or_default());

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(api_config.timeout_secs))
            .build()
            .map_err(|error| {
                EngineError::LLMError(format!("failed to create LLM HTTP client: {error}"))
            })?;

        // Without this, async-openai retries 500 errors with its own exponential
        // backoff for up to 15 minutes, independent of the retry loop below.
        let backoff = backoff::ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(api_config.timeout_secs)),
            ..Default::default()
        };

        let client = Client::with_config(openai_config)
            .with_http_client(http_client)
            .with_backoff(backoff);

        Ok(Self {
            client,
            config: api_config,
        })
    }

    pub async fn complete(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        options: Option<&CompletionOptions>,
    ) -> Result<String> {
        if prompt.trim().is_empty() {
            return Err(EngineError::BadInput("prompt cannot be empty".to_string()));
        }

        let mut last_error: Option<EngineError> = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay_ms = 100 * 2_u64.pow(attempt - 1);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }

            let request = self.build_request(prompt, system_prompt, options)?;

            match self.client.chat().create(request).await {
                Ok(response) => return Self::extract_content(response),
                Err(error) => {
                    if let Some(rate_limit_error) = Self::rate_limit_error(&error) {
                        return Err(rate_limit_error);
                    }
                    if let Some(auth_error) = Self::auth_error(&error) {
                        return Err(auth_error);
                    }

                    let retryable = Self::is_retryable(&error);
                    let mapped_error = Self::map_openai_error(error);

                    if retryable && attempt < self.config.max_retries {
                        last_error = Some(mapped_error);
                        continue;
                    }
                    return Err(mapped_error);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| EngineError::LLMError("LLM completion failed after retries".into())))
    }

    pub async fn complete_json(
        &self,
        prompt: &str,
        options: Option<&CompletionOptions>,
    ) -> Result<Value> {
        if prompt.trim().is_empty() {
            return Err(EngineError::BadInput("prompt cannot be empty".to_string()));
        }

        let mut last_error: Option<EngineError> = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay_ms = 100 * 2_u64.pow(attempt - 1);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }

            let request = self.build_json_request(prompt, options)?;

            match self.client.chat().create(request).await {
                Ok(response) => {
                    let content = Self::extract_content(response)?;
                    tracing::debug!(response_len = content.len(), "LLM JSON response received");
                    return serde_json::from_str(&content).map_err(|e| {
                        tracing::warn!(error = %e, "raw LLM JSON parse failed, caller should degrade");
                        EngineError::LLMError(format!("failed to parse JSON response: {e}"))
                    });
                }
                Err(error) => {
                    if let Some(rate_limit_error) = Self::rate_limit_error(&error) {
                        return Err(rate_limit_error);
                    }
                    if let Some(auth_error) = Self::auth_error(&error) {
                        return Err(auth_error);
                    }

                    let retryable = Self::is_retryable(&error);
                    let mapped_error = Self::map_openai_error(error);

                    if retryable && attempt < self.config.max_retries {
                        last_error = Some(mapped_error);
                        continue;
                    }
                    return Err(mapped_error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            EngineError::LLMError("LLM JSON completion failed after retries".into())
        }))
    }

    /// Returns the raw reply text without attempting a JSON parse — used by
    /// the Dream consolidator, which applies its own fence-stripping and
    /// line-split degradation on top of whatever the model returns.
    pub async fn complete_raw(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String> {
        self.complete(user_prompt, Some(system_prompt), None).await
    }

    fn build_request(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        options: Option<&CompletionOptions>,
    ) -> Result<CreateChatCompletionRequest> {
        let mut messages = Vec::new();

        if let Some(system_prompt) = system_prompt.filter(|value| !value.trim().is_empty()) {
            messages.push(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system_prompt)
                    .build()
                    .map_err(|error| {
                        EngineError::BadInput(format!("invalid system prompt: {error}"))
                    })?
                    .into(),
            );
        }

        messages.push(
            ChatCompletionRequestUserMessageArgs::default()
                .content(prompt)
                .build()
                .map_err(|error| EngineError::BadInput(format!("invalid user prompt: {error}")))?
                .into(),
        );

        let mut request = CreateChatCompletionRequestArgs::default();
        request.model(self.config.model.clone()).messages(messages);
        Self::apply_completion_options(&mut request, options);

        request
            .build()
            .map_err(|error| EngineError::BadInput(format!("invalid LLM request: {error}")))
    }

    fn build_json_request(
        &self,
        prompt: &str,
        options: Option<&CompletionOptions>,
    ) -> Result<CreateChatCompletionRequest> {
        let messages = vec![ChatCompletionRequestUserMessageArgs::default()
            .content(prompt)
            .build()
            .map_err(|error| EngineError::BadInput(format!("invalid user prompt: {error}")))?
            .into()];

        let mut request = CreateChatCompletionRequestArgs::default();
        request.model(self.config.model.clone()).messages(messages);
        Self::apply_completion_options(&mut request, options);

        request
            .build()
            .map_err(|error| EngineError::BadInput(format!("invalid LLM JSON request: {error}")))
    }

    fn apply_completion_options(
        request: &mut CreateChatCompletionRequestArgs,
        options: Option<&CompletionOptions>,
    ) {
        let Some(options) = options else {
            return;
        };

        if let Some(temperature) = options.temperature {
            request.temperature(temperature);
        }
        if let Some(max_tokens) = options.max_tokens {
            request.max_tokens(max_tokens);
        }
        if let Some(top_p) = options.top_p {
            request.top_p(top_p);
        }
        if let Some(stop) = options.stop.as_ref().filter(|values| !values.is_empty()) {
            request.stop(Stop::StringArray(stop.clone()));
        }
    }

    fn extract_content(response: CreateChatCompletionResponse) -> Result<String> {
        let message = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::LLMError("LLM response contained no choices".into()))?
            .message
            .content
            .unwrap_or_default();

        if message.trim().is_empty() {
            return Err(EngineError::LLMError(
                "LLM response contained empty content".into(),
            ));
        }

        Ok(message)
    }

    fn is_retryable(error: &OpenAIError) -> bool {
        match error {
            OpenAIError::ApiError(api_error) => {
                api_error.r#type.is_none() && api_error.code.is_none()
            }
            OpenAIError::Reqwest(reqwest_error) => reqwest_error
                .status()
                .map(|status| status.is_server_error())
                .unwrap_or(true),
            _ => false,
        }
    }

    fn rate_limit_error(error: &OpenAIError) -> Option<EngineError> {
        match error {
            OpenAIError::Reqwest(reqwest_error)
                if reqwest_error.status() == Some(reqwest::StatusCode::TOO_MANY_REQUESTS) =>
            {
                Some(EngineError::ProviderError("LLM rate limit exceeded".into()))
            }
            OpenAIError::ApiError(api_error) if Self::is_rate_limit_api_error(api_error) => Some(
                EngineError::ProviderError("LLM rate limit exceeded".into()),
            ),
            _ => None,
        }
    }

    fn auth_error(error: &OpenAIError) -> Option<EngineError> {
        match error {
            OpenAIError::Reqwest(reqwest_error)
                if reqwest_error.status() == Some(reqwest::StatusCode::UNAUTHORIZED)
                    || reqwest_error.status() == Some(reqwest::StatusCode::FORBIDDEN) =>
            {
                Some(EngineError::LLMError(format!(
                    "LLM authentication failed: {reqwest_error}"
                )))
            }
            OpenAIError::ApiError(api_error) if Self::is_auth_api_error(api_error) => Some(
                EngineError::LLMError(format!("LLM authentication failed: {api_error}")),
            ),
            _ => None,
        }
    }

    fn is_rate_limit_api_error(api_error: &ApiError) -> bool {
        let message = api_error.message.to_lowercase();
        let error_type = api_error.r#type.clone().unwrap_or_default().to_lowercase();
        let code = api_error.code.clone().unwrap_or_default().to_lowercase();

        message.contains("rate limit")
            || message.contains("too many requests")
            || error_type.contains("rate_limit")
            || code.contains("rate_limit")
            || code == "insufficient_quota"
    }

    fn is_auth_api_error(api_error: &ApiError) -> bool {
        let message = api_error.message.to_lowercase();
        let error_type = api_error.r#type.clone().unwrap_or_default().to_lowercase();
        let code = api_error.code.clone().unwrap_or_default().to_lowercase();

        message.contains("unauthorized")
            || message.contains("forbidden")
            || message.contains("authentication")
            || message.contains("invalid api key")
            || code.contains("invalid_api_key")
            || code.contains("authentication")
            || error_type.contains("authentication")
    }

    fn map_openai_error(error: OpenAIError) -> EngineError {
        match error {
            OpenAIError::Reqwest(reqwest_error) => {
                EngineError::LLMError(format!("LLM request failed: {reqwest_error}"))
            }
            OpenAIError::ApiError(api_error) => {
                EngineError::LLMError(format!("LLM API error: {api_error}"))
            }
            OpenAIError::JSONDeserialize(err) => {
                EngineError::LLMError(format!("failed to parse LLM response: {err}"))
            }
            OpenAIError::InvalidArgument(message) => EngineError::BadInput(message),
            other => EngineError::LLMError(other.to_string()),
        }
    }
}

impl ApiConfig {
    fn from_llm_config(config: &LlmConfig) -> Self {
        let (provider, model) = parse_llm_provider_model(&config.model);

        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| default_base_url(provider).to_string());

        let normalized_model = if provider.eq_ignore_ascii_case("local") {
            config.model.clone()
        } else {
            model.to_string()
        };

        Self {
            base_url,
            api_key: config.api_key.clone(),
            model: normalized_model,
            timeout_secs: config.timeout_secs,
            max_retries: config.max_retries,
        }
    }
}

fn default_base_url(provider: &str) -> &'static str {
    match provider.to_lowercase().as_str() {
        "openai" => OPENAI_BASE_URL,
        "openrouter" => OPENROUTER_BASE_URL,
        "ollama" => OLLAMA_BASE_URL,
        "lmstudio" => "http://localhost:1234/v1",
        _ => OPENAI_BASE_URL,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn mock_llm_config(base_url: String, max_retries: u32) -> LlmConfig {
        LlmConfig {
            model: "openai/gpt-4o-mini".to_string(),
            api_key: Some("test-key".to_string()),
            base_url: Some(format!("{base_url}/v1")),
            timeout_secs: 5,
            max_retries,
        }
    }

    fn completion_body(content: &str) -> Value {
        serde_json::json!({
            "id": "chatcmpl-test",
            "object": "chat.completion",
            "created": 1,
            "model": "gpt-4o-mini",
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": content },
                "finish_reason": "stop",
            }],
            "usage": { "prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2 },
        })
    }

    fn api_error_body(message: &str, error_type: &str, code: &str) -> Value {
        serde_json::json!({
            "error": { "message": message, "type": error_type, "param": Value::Null, "code": code }
        })
    }

    #[tokio::test]
    async fn retries_on_server_error_and_recovers() {
        let server = MockServer::start().await;
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_for_mock = Arc::clone(&attempts);

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(move |_: &Request| {
                if attempts_for_mock.fetch_add(1, Ordering::SeqCst) == 0 {
                    ResponseTemplate::new(503).set_body_string("upstream temporary failure")
                } else {
                    ResponseTemplate::new(200).set_body_json(completion_body("recovered"))
                }
            })
            .mount(&server)
            .await;

        let client = LlmApiClient::new(&mock_llm_config(server.uri(), 2)).expect("client should build");
        let result = client.complete("retry test", None, None).await;

        match result {
            Ok(value) => assert_eq!(value, "recovered"),
            Err(error) => panic!("expected retry to recover, got: {error}"),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 2, "should have retried once after the 503");
    }

    #[tokio::test]
    async fn short_circuits_on_rate_limit_without_retrying() {
        let server = MockServer::start().await;
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_for_mock = Arc::clone(&attempts);

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(move |_: &Request| {
                attempts_for_mock.fetch_add(1, Ordering::SeqCst);
                ResponseTemplate::new(429).insert_header("retry-after", "7").set_body_json(
                    api_error_body("Rate limit exceeded", "insufficient_quota", "insufficient_quota"),
                )
            })
            .mount(&server)
            .await;

        let client = LlmApiClient::new(&mock_llm_config(server.uri(), 3)).expect("client should build");
        let result = client.complete("rate limit test", None, None).await;

        assert!(matches!(result, Err(EngineError::ProviderError(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1, "a rate limit must not burn retry attempts");
    }

    #[tokio::test]
    async fn short_circuits_on_auth_error_without_retrying() {
        let server = MockServer::start().await;
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_for_mock = Arc::clone(&attempts);

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(move |_: &Request| {
                attempts_for_mock.fetch_add(1, Ordering::SeqCst);
                ResponseTemplate::new(401).set_body_json(api_error_body(
                    "Invalid API key",
                    "invalid_request_error",
                    "invalid_api_key",
                ))
            })
            .mount(&server)
            .await;

        let client = LlmApiClient::new(&mock_llm_config(server.uri(), 3)).expect("client should build");
        let result = client.complete("auth test", None, None).await;

        match result {
            Err(EngineError::LLMError(message)) => {
                assert!(message.to_lowercase().contains("authentication"));
            }
            other => panic!("expected an authentication LLMError, got: {other:?}"),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 1, "an auth failure must not burn retry attempts");
    }

    fn test_llm_config() -> LlmConfig {
        LlmConfig {
            model: "ollama/llama3".to_string(),
            api_key: None,
            base_url: None,
            timeout_secs: 30,
            max_retries: 0,
        }
    }

    #[test]
    fn build_json_request_does_not_force_json_object_format() {
        let config = test_llm_config();
        let client = LlmApiClient::new(&config).expect("client should be created");

        let request = client
            .build_json_request("test prompt", None)
            .expect("request should build");

        assert!(
            request.response_format.is_none(),
            "array-shaped replies must still parse, so no forced json_object format"
        );
    }

    #[test]
    fn ollama_client_does_not_require_api_key() {
        let config = test_llm_config();
        assert!(LlmApiClient::new(&config).is_ok());
    }

    #[test]
    fn openai_client_requires_api_key() {
        let config = LlmConfig {
            model: "openai/gpt-4o-mini".to_string(),
            api_key: None,
            base_url: None,
            timeout_secs: 30,
            max_retries: 0,
        };
        assert!(LlmApiClient::new(&config).is_err());
    }
}
