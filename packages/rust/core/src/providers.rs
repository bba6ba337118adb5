//! HTTP adapters for the supported model families.
//!
//! Each adapter maps the provider's wire format onto [`InferenceRequest`] /
//! [`InferenceResponse`] and classifies failures into [`ModelCallKind`]s so
//! [`GuardedModel`](crate::model::GuardedModel) knows what to retry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use legisflow_shared::{LegisflowError, ModelCallKind, ModelFamily, ProviderConfig, Result};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::model::{InferenceRequest, InferenceResponse, ModelClient, ModelSpec, finish_response};

/// Build the adapter for `spec.family`, reading its API key from the
/// environment variable named in `provider`.
pub fn build_client(
    spec: ModelSpec,
    provider: &ProviderConfig,
    timeout: Duration,
) -> Result<Arc<dyn ModelClient>> {
    let api_key = match &provider.api_key_env {
        Some(var) => match std::env::var(var) {
            Ok(key) if !key.is_empty() => Some(key),
            _ => {
                return Err(LegisflowError::config(format!(
                    "{} API key not found. Set the {var} environment variable.",
                    spec.family
                )));
            }
        },
        None => None,
    };

    let http = Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| LegisflowError::config(format!("failed to build HTTP client: {e}")))?;
    let base_url = provider.base_url.trim_end_matches('/').to_string();

    Ok(match spec.family {
        ModelFamily::Gemini => Arc::new(GeminiClient {
            http,
            base_url,
            api_key: api_key.unwrap_or_default(),
            spec,
        }),
        ModelFamily::Gpt => Arc::new(OpenAiClient {
            http,
            base_url,
            api_key,
            spec,
        }),
        ModelFamily::Ollama => Arc::new(OllamaClient {
            http,
            base_url,
            spec,
        }),
    })
}

// ---------------------------------------------------------------------------
// Shared HTTP plumbing
// ---------------------------------------------------------------------------

/// Send a JSON request and decode the JSON reply, classifying failures.
async fn send_json<T: DeserializeOwned>(builder: RequestBuilder, provider: &str) -> Result<T> {
    let response = builder.send().await.map_err(|e| {
        let kind = if e.is_timeout() {
            ModelCallKind::Timeout
        } else {
            ModelCallKind::Network
        };
        LegisflowError::model(kind, format!("{provider}: {e}"))
    })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let snippet: String = body.chars().take(300).collect();
        return Err(LegisflowError::model(
            classify_status(status),
            format!("{provider}: HTTP {status}: {snippet}"),
        ));
    }

    response.json::<T>().await.map_err(|e| {
        LegisflowError::model(
            ModelCallKind::Validation,
            format!("{provider}: unexpected response shape: {e}"),
        )
    })
}

fn classify_status(status: StatusCode) -> ModelCallKind {
    if status == StatusCode::TOO_MANY_REQUESTS {
        ModelCallKind::Quota
    } else if status == StatusCode::REQUEST_TIMEOUT || status.is_server_error() {
        ModelCallKind::Network
    } else {
        ModelCallKind::Config
    }
}

// ---------------------------------------------------------------------------
// Gemini (generateContent)
// ---------------------------------------------------------------------------

pub struct GeminiClient {
    http: Client,
    base_url: String,
    api_key: String,
    spec: ModelSpec,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest<'a> {
    system_instruction: GeminiContent<'a>,
    contents: Vec<GeminiContent<'a>>,
    generation_config: GeminiGenerationConfig<'a>,
}

#[derive(Serialize)]
struct GeminiContent<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
    parts: Vec<GeminiPartOut<'a>>,
}

#[derive(Serialize)]
struct GeminiPartOut<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig<'a> {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_json_schema: Option<&'a Value>,
}

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContentIn>,
}

#[derive(Deserialize)]
struct GeminiContentIn {
    #[serde(default)]
    parts: Vec<GeminiPartIn>,
}

#[derive(Deserialize)]
struct GeminiPartIn {
    #[serde(default)]
    text: String,
}

#[async_trait]
impl ModelClient for GeminiClient {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    async fn infer(&self, request: &InferenceRequest) -> Result<InferenceResponse> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.spec.model
        );
        let body = GeminiRequest {
            system_instruction: GeminiContent {
                role: None,
                parts: vec![GeminiPartOut {
                    text: &request.system,
                }],
            },
            contents: vec![GeminiContent {
                role: Some("user"),
                parts: vec![GeminiPartOut {
                    text: &request.user,
                }],
            }],
            generation_config: GeminiGenerationConfig {
                temperature: self.spec.temperature,
                response_mime_type: request.schema.as_ref().map(|_| "application/json"),
                response_json_schema: request.schema.as_ref().map(|s| &s.schema),
            },
        };

        debug!(model = %self.spec, "gemini generateContent");
        let reply: GeminiResponse = send_json(
            self.http
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .json(&body),
            "gemini",
        )
        .await?;

        let text = reply
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().map(|p| p.text).collect::<String>())
            .unwrap_or_default();
        finish_response(request, text)
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible chat completions (gpt family)
// ---------------------------------------------------------------------------

pub struct OpenAiClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    spec: ModelSpec,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: Option<String>,
}

#[async_trait]
impl ModelClient for OpenAiClient {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    async fn infer(&self, request: &InferenceRequest) -> Result<InferenceResponse> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.spec.model,
            temperature: self.spec.temperature,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user,
                },
            ],
            response_format: request.schema.as_ref().map(|s| {
                serde_json::json!({
                    "type": "json_schema",
                    "json_schema": {"name": s.name, "schema": s.schema, "strict": false},
                })
            }),
        };

        debug!(model = %self.spec, "chat completion");
        let mut builder = self.http.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let reply: ChatResponse = send_json(builder, "openai").await?;

        let text = reply
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        finish_response(request, text)
    }
}

// ---------------------------------------------------------------------------
// Ollama (/api/chat)
// ---------------------------------------------------------------------------

pub struct OllamaClient {
    http: Client,
    base_url: String,
    spec: ModelSpec,
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a Value>,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: Option<OllamaMessage>,
}

#[derive(Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
}

#[async_trait]
impl ModelClient for OllamaClient {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    async fn infer(&self, request: &InferenceRequest) -> Result<InferenceResponse> {
        let url = format!("{}/api/chat", self.base_url);
        let body = OllamaRequest {
            model: &self.spec.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user,
                },
            ],
            stream: false,
            format: request.schema.as_ref().map(|s| &s.schema),
            options: OllamaOptions {
                temperature: self.spec.temperature,
            },
        };

        debug!(model = %self.spec, "ollama chat");
        let reply: OllamaResponse = send_json(self.http.post(&url).json(&body), "ollama").await?;
        let text = reply.message.map(|m| m.content).unwrap_or_default();
        finish_response(request, text)
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::model::ResponseSchema;

    fn spec(family: ModelFamily, model: &str) -> ModelSpec {
        ModelSpec {
            family,
            model: model.into(),
            temperature: 0.2,
        }
    }

    fn structured() -> InferenceRequest {
        InferenceRequest {
            system: "Answer the questions.".into(),
            user: "<bill>text</bill>".into(),
            schema: Some(ResponseSchema {
                name: "answers".into(),
                schema: serde_json::json!({"type": "object"}),
            }),
        }
    }

    fn provider(server: &MockServer) -> ProviderConfig {
        ProviderConfig {
            default_model: "unused".into(),
            base_url: format!("{}/", server.uri()),
            api_key_env: None,
        }
    }

    #[tokio::test]
    async fn gemini_generate_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-3-flash-preview:generateContent"))
            .and(header("x-goog-api-key", "test-key"))
            .and(body_partial_json(serde_json::json!({
                "generationConfig": {"responseMimeType": "application/json"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{"content": {"parts": [{"text": "{\"bill_summary\":"}, {"text": " \"x\"}"}]}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = GeminiClient {
            http: Client::new(),
            base_url: server.uri(),
            api_key: "test-key".into(),
            spec: spec(ModelFamily::Gemini, "gemini-3-flash-preview"),
        };
        let reply = client.infer(&structured()).await.unwrap();
        assert_eq!(reply.json.unwrap()["bill_summary"], "x");
    }

    #[tokio::test]
    async fn openai_chat_completion_via_builder() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(serde_json::json!({
                "model": "gpt-4o-mini",
                "response_format": {"type": "json_schema"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "{\"ok\": 1}"}}]
            })))
            .mount(&server)
            .await;

        let client = build_client(
            spec(ModelFamily::Gpt, "gpt-4o-mini"),
            &provider(&server),
            Duration::from_secs(5),
        )
        .unwrap();
        let reply = client.infer(&structured()).await.unwrap();
        assert_eq!(reply.json.unwrap()["ok"], 1);
    }

    #[tokio::test]
    async fn ollama_plain_text_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(serde_json::json!({"stream": false, "model": "llama3.1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": {"role": "assistant", "content": "# Amended bill\n"}
            })))
            .mount(&server)
            .await;

        let client = build_client(
            spec(ModelFamily::Ollama, "llama3.1"),
            &provider(&server),
            Duration::from_secs(5),
        )
        .unwrap();
        let request = InferenceRequest {
            system: "Apply the amendment.".into(),
            user: "<bill>a</bill>".into(),
            schema: None,
        };
        let reply = client.infer(&request).await.unwrap();
        assert_eq!(reply.text, "# Amended bill\n");
        assert!(reply.json.is_none());
    }

    #[tokio::test]
    async fn http_failures_are_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;
        let client = build_client(
            spec(ModelFamily::Ollama, "llama3.1"),
            &provider(&server),
            Duration::from_secs(5),
        )
        .unwrap();
        let err = client.infer(&structured()).await.unwrap_err();
        assert!(matches!(
            err,
            LegisflowError::ModelCall {
                kind: ModelCallKind::Quota,
                ..
            }
        ));

        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), ModelCallKind::Network);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), ModelCallKind::Config);
    }

    #[test]
    fn missing_api_key_is_config_error() {
        let provider = ProviderConfig {
            default_model: "gpt-4o-mini".into(),
            base_url: "https://api.openai.com".into(),
            api_key_env: Some("LF_TEST_NONEXISTENT_OPENAI_KEY".into()),
        };
        let err = build_client(
            spec(ModelFamily::Gpt, "gpt-4o-mini"),
            &provider,
            Duration::from_secs(5),
        )
        .err()
        .unwrap();
        assert!(matches!(err, LegisflowError::Config { .. }));
    }
}
