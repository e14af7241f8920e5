// Remote poem generation against an OpenAI-compatible chat completions
// endpoint. One request per attempt: the image as a base64 data URL plus
// the fixed style directive.

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::artifact::CaptureArtifact;
use crate::config::GeneratorConfig;
use crate::errors::GenerationError;
use crate::style::StyleDirective;

const MAX_LOGGED_BODY: usize = 500;

/// Poem generation collaborator. Must not mutate the artifact; safe to
/// call repeatedly on retry since every call is independent generation.
#[async_trait]
pub trait PoemGenerator: Send + Sync {
    async fn generate(
        &self,
        artifact: &CaptureArtifact,
        style: &StyleDirective,
    ) -> Result<String, GenerationError>;

    fn type_name(&self) -> &'static str;
}

pub struct OpenAiGenerator {
    client: Client,
    api_key: String,
    endpoint: String,
    model: String,
    max_tokens: u32,
}

impl OpenAiGenerator {
    pub fn new(config: &GeneratorConfig) -> Self {
        Self {
            client: Client::new(),
            api_key: config.api_key.clone(),
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        }
    }
}

#[async_trait]
impl PoemGenerator for OpenAiGenerator {
    async fn generate(
        &self,
        artifact: &CaptureArtifact,
        style: &StyleDirective,
    ) -> Result<String, GenerationError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(artifact.data());
        debug!(
            cycle_id = %artifact.cycle_id(),
            image_bytes = artifact.len(),
            model = %self.model,
            "requesting poem generation"
        );

        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [
                {
                    "role": "system",
                    "content": style.prompt(),
                },
                {
                    "role": "user",
                    "content": [
                        {
                            "type": "text",
                            "text": style.user_instruction(),
                        },
                        {
                            "type": "image_url",
                            "image_url": {
                                "url": format!("data:image/jpeg;base64,{encoded}"),
                            }
                        }
                    ]
                }
            ],
        });

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::Network(e.to_string()))?;

        let status = response.status();
        let response_text = response
            .text()
            .await
            .map_err(|e| GenerationError::Network(e.to_string()))?;

        if !status.is_success() {
            return Err(GenerationError::Rejected {
                status: status.as_u16(),
                message: truncate(&response_text, MAX_LOGGED_BODY),
            });
        }

        extract_poem(&response_text)
    }

    fn type_name(&self) -> &'static str {
        "OpenAI chat completions"
    }
}

fn extract_poem(body: &str) -> Result<String, GenerationError> {
    let parsed: ChatResponse = serde_json::from_str(body).map_err(|e| {
        GenerationError::MalformedResponse(format!(
            "failed to parse response: {e}; body: {}",
            truncate(body, MAX_LOGGED_BODY)
        ))
    })?;

    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| GenerationError::MalformedResponse("no choices in response".to_string()))?;

    match choice.message.content {
        Some(text) if !text.trim().is_empty() => Ok(text),
        _ => Err(GenerationError::MalformedResponse(
            "empty poem text".to_string(),
        )),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() > max {
        let end = (0..=max).rev().find(|i| text.is_char_boundary(*i)).unwrap_or(0);
        format!("{}...", &text[..end])
    } else {
        text.to_string()
    }
}

// --- Chat completions response types ---

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}
