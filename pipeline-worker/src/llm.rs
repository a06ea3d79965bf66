//! Client for an OpenAI-compatible inference backend.
//!
//! Both the embedding and the summarization stages go through this: bearer
//! auth, JSON bodies, explicit per-call timeouts. Chat completions against a
//! CPU-bound backend can legitimately take minutes, so the caller picks the
//! timeout; a timeout maps to a transient error and flows into the retry
//! policy like any other.

use std::time::Duration;

use async_trait::async_trait;
use pipeline_common::error::{ErrorKind, ProcessingError};
use serde::{Deserialize, Serialize};
use url::Url;

/// The seam the embedding and summarization stages program against. The
/// concrete model and backend are interchangeable; stages only see vectors
/// and markdown.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ProcessingError>;
    async fn summarize(&self, system: &str, user: &str) -> Result<String, ProcessingError>;
    fn embedding_model(&self) -> &str;
    fn summary_model(&self) -> &str;
}

/// `InferenceBackend` over an OpenAI-compatible HTTP API.
pub struct OpenAiBackend {
    client: LlmClient,
    embedding_model: String,
    summary_model: String,
    embed_timeout: Duration,
    summary_timeout: Duration,
}

impl OpenAiBackend {
    pub fn new(
        client: LlmClient,
        embedding_model: &str,
        summary_model: &str,
        embed_timeout: Duration,
        summary_timeout: Duration,
    ) -> Self {
        Self {
            client,
            embedding_model: embedding_model.to_owned(),
            summary_model: summary_model.to_owned(),
            embed_timeout,
            summary_timeout,
        }
    }
}

#[async_trait]
impl InferenceBackend for OpenAiBackend {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ProcessingError> {
        self.client
            .embed(&self.embedding_model, inputs, self.embed_timeout)
            .await
    }

    async fn summarize(&self, system: &str, user: &str) -> Result<String, ProcessingError> {
        self.client
            .chat(&self.summary_model, system, user, self.summary_timeout)
            .await
    }

    fn embedding_model(&self) -> &str {
        &self.embedding_model
    }

    fn summary_model(&self) -> &str {
        &self.summary_model
    }
}

pub struct LlmClient {
    client: reqwest::Client,
    base_url: Url,
    api_key: String,
}

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

impl LlmClient {
    pub fn new(base_url: &str, api_key: &str) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url)?;
        let client = reqwest::Client::builder()
            .user_agent("mail-pipeline-worker")
            .build()?;

        Ok(Self {
            client,
            base_url,
            api_key: api_key.to_owned(),
        })
    }

    /// Embed a batch of inputs. Vectors come back in input order.
    pub async fn embed(
        &self,
        model: &str,
        inputs: &[String],
        timeout: Duration,
    ) -> Result<Vec<Vec<f32>>, ProcessingError> {
        let response: EmbeddingsResponse = self
            .post_json(
                "embeddings",
                &EmbeddingsRequest {
                    model,
                    input: inputs,
                },
                timeout,
            )
            .await?;

        let mut data = response.data;
        data.sort_by_key(|entry| entry.index);
        if data.len() != inputs.len() {
            return Err(ProcessingError::new(
                ErrorKind::InvalidInput,
                format!(
                    "embedding backend returned {} vectors for {} inputs",
                    data.len(),
                    inputs.len()
                ),
            ));
        }
        Ok(data.into_iter().map(|entry| entry.embedding).collect())
    }

    /// One chat completion, system + user message, first choice's content.
    pub async fn chat(
        &self,
        model: &str,
        system: &str,
        user: &str,
        timeout: Duration,
    ) -> Result<String, ProcessingError> {
        let response: ChatResponse = self
            .post_json(
                "chat/completions",
                &ChatRequest {
                    model,
                    messages: vec![
                        ChatMessage {
                            role: "system",
                            content: system,
                        },
                        ChatMessage {
                            role: "user",
                            content: user,
                        },
                    ],
                    temperature: 0.2,
                },
                timeout,
            )
            .await?;

        response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| {
                ProcessingError::new(ErrorKind::InvalidInput, "backend returned no choices")
            })
    }

    async fn post_json<Req: Serialize, Resp: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &Req,
        timeout: Duration,
    ) -> Result<Resp, ProcessingError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|err| ProcessingError::invalid_input(err.to_string()))?;

        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let kind = classify_status(status);
            return Err(ProcessingError::new(
                kind,
                format!("backend returned {}: {}", status, truncate(&body, 300)),
            ));
        }

        response
            .json::<Resp>()
            .await
            .map_err(|err| ProcessingError::parse(err.to_string()))
    }
}

fn classify_request_error(error: reqwest::Error) -> ProcessingError {
    if error.is_timeout() {
        ProcessingError::timeout(error.to_string())
    } else {
        ProcessingError::connection(error.to_string())
    }
}

fn classify_status(status: reqwest::StatusCode) -> ErrorKind {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        ErrorKind::ResourceExhausted
    } else if status.is_server_error() {
        ErrorKind::Connection
    } else {
        ErrorKind::InvalidInput
    }
}

fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((i, _)) => &text[..i],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn embeddings_request_matches_the_wire_format() {
        let inputs = vec!["first chunk".to_owned(), "second chunk".to_owned()];
        let request = EmbeddingsRequest {
            model: "text-embedding-3-small",
            input: &inputs,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "model": "text-embedding-3-small",
                "input": ["first chunk", "second chunk"],
            })
        );
    }

    #[test]
    fn embeddings_response_parses_and_sorts_by_index() {
        let raw = json!({
            "object": "list",
            "data": [
                {"object": "embedding", "index": 1, "embedding": [0.25, 0.5]},
                {"object": "embedding", "index": 0, "embedding": [1.0, 2.0]},
            ],
            "model": "text-embedding-3-small",
        });
        let mut response: EmbeddingsResponse = serde_json::from_value(raw).unwrap();
        response.data.sort_by_key(|entry| entry.index);
        assert_eq!(response.data[0].embedding, vec![1.0, 2.0]);
        assert_eq!(response.data[1].embedding, vec![0.25, 0.5]);
    }

    #[test]
    fn chat_response_yields_first_choice_content() {
        let raw = json!({
            "choices": [
                {"index": 0, "message": {"role": "assistant", "content": "## Summary"}},
            ],
        });
        let response: ChatResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(response.choices[0].message.content, "## Summary");
    }

    #[test]
    fn status_classification_feeds_the_retry_policy() {
        assert_eq!(
            classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS),
            ErrorKind::ResourceExhausted
        );
        assert_eq!(
            classify_status(reqwest::StatusCode::BAD_GATEWAY),
            ErrorKind::Connection
        );
        assert_eq!(
            classify_status(reqwest::StatusCode::BAD_REQUEST),
            ErrorKind::InvalidInput
        );
        assert!(ErrorKind::ResourceExhausted.is_transient());
        assert!(!ErrorKind::InvalidInput.is_transient());
    }
}
