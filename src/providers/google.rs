use crate::config::{AiConfig, DEFAULT_MODEL};
use crate::error::{HealError, Result};
use crate::providers::{
    CompletionRequest, CompletionResponse, Message, Provider, ProviderInfo, Usage,
};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Gemini `generateContent` over HTTPS, authenticated with an API key.
pub struct GoogleProvider {
    api_key: String,
    base_url: String,
    client: Client,
    default_model: String,
}

impl GoogleProvider {
    pub fn new(api_key: String, config: &AiConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS));
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            HealError::ProviderUnavailable(format!("HTTP client construction failed: {}", e))
        })?;

        Ok(Self {
            api_key,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            client,
            default_model: config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        })
    }

    pub fn static_info() -> ProviderInfo {
        ProviderInfo {
            name: "google".to_string(),
            display_name: "Google Gemini".to_string(),
            default_model: DEFAULT_MODEL.to_string(),
        }
    }

    fn convert_messages(&self, messages: &[Message]) -> Vec<serde_json::Value> {
        messages
            .iter()
            .map(|msg| {
                serde_json::json!({
                    "role": "user",
                    "parts": [{"text": msg.content}]
                })
            })
            .collect()
    }

    fn endpoint(&self, model: &str) -> String {
        let model_name = model.strip_prefix("models/").unwrap_or(model);
        format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, model_name, self.api_key
        )
    }
}

/// All text parts of all candidates, newline-joined.
fn collect_text(data: &serde_json::Value) -> String {
    data["candidates"]
        .as_array()
        .map(|candidates| {
            candidates
                .iter()
                .filter_map(|c| c["content"]["parts"].as_array())
                .flatten()
                .filter_map(|part| part["text"].as_str())
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

#[async_trait]
impl Provider for GoogleProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            default_model: self.default_model.clone(),
            ..Self::static_info()
        }
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let contents = self.convert_messages(&request.messages);

        let mut generation_config = serde_json::Map::new();
        if let Some(temperature) = request.temperature {
            generation_config.insert("temperature".into(), serde_json::json!(temperature));
        }

        let mut body = serde_json::json!({ "contents": contents });
        if !generation_config.is_empty() {
            body["generationConfig"] = serde_json::Value::Object(generation_config);
        }

        let response = self
            .client
            .post(self.endpoint(&request.model))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(HealError::GenerationFailure(format!(
                "Google API error ({}): {}",
                status, error_text
            )));
        }

        let data: serde_json::Value = response.json().await?;

        let finish_reason = data["candidates"][0]["finishReason"]
            .as_str()
            .map(|s| s.to_string());

        let usage = data.get("usageMetadata").map(|usage| Usage {
            prompt_tokens: usage["promptTokenCount"].as_u64().unwrap_or(0) as u32,
            completion_tokens: usage["candidatesTokenCount"].as_u64().unwrap_or(0) as u32,
            total_tokens: usage["totalTokenCount"].as_u64().unwrap_or(0) as u32,
        });

        Ok(CompletionResponse {
            model: request.model,
            content: collect_text(&data),
            finish_reason,
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::Uri;
    use axum::{Json, Router};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Seen {
        uri: Arc<Mutex<Option<String>>>,
        body: Arc<Mutex<Option<serde_json::Value>>>,
    }

    async fn fake_generate(
        State(seen): State<Seen>,
        uri: Uri,
        Json(body): Json<serde_json::Value>,
    ) -> Json<serde_json::Value> {
        *seen.uri.lock().unwrap() = Some(uri.to_string());
        *seen.body.lock().unwrap() = Some(body);
        Json(serde_json::json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "first"}, {"text": "second"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 3, "totalTokenCount": 15}
        }))
    }

    async fn serve(seen: Seen) -> String {
        let app = Router::new().fallback(fake_generate).with_state(seen);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/v1beta", addr)
    }

    #[tokio::test]
    async fn test_complete_posts_to_generate_content() {
        let seen = Seen::default();
        let base_url = serve(seen.clone()).await;
        let config = AiConfig {
            base_url: Some(base_url),
            ..AiConfig::default()
        };
        let provider = GoogleProvider::new("test-key".to_string(), &config).unwrap();

        let response = provider
            .complete(CompletionRequest::prompt("gemini-test", "fix it"))
            .await
            .unwrap();

        assert_eq!(response.content, "first\nsecond");
        assert_eq!(response.finish_reason.as_deref(), Some("STOP"));
        assert_eq!(response.usage.unwrap().total_tokens, 15);

        let uri = seen.uri.lock().unwrap().clone().unwrap();
        assert_eq!(uri, "/v1beta/models/gemini-test:generateContent?key=test-key");
        let body = seen.body.lock().unwrap().clone().unwrap();
        assert_eq!(body["contents"][0]["parts"][0]["text"], "fix it");
        assert_eq!(body["contents"][0]["role"], "user");
        assert!(body.get("generationConfig").is_none());
    }

    #[test]
    fn test_collect_text_without_candidates() {
        assert_eq!(collect_text(&serde_json::json!({"promptFeedback": {}})), "");
    }
}
