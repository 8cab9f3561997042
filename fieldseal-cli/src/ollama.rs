//! Card number extraction through a local Ollama chat model.

use async_trait::async_trait;
use clap::ValueEnum;
use fieldseal::extract::{Extractor, ExtractorError};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const PRIMARY_PROMPT: &str = "\
Read the input and reply with the payment card number it contains, exactly as \
written, and nothing else.
Example:
Input: My credit card number is 1234-5678-9999-9999
Output: 1234-5678-9999-9999";

const BACKUP_PROMPT: &str = "\
You extract numbers. Reply only with the number from the input, keeping its \
dashes, with no other words.
Examples:
Input: My credit card number is 1234-5678-9999-9999
Output: 1234-5678-9999-9999
Input: you can charge 4321-0000-1111-2222 for the pizza
Output: 4321-0000-1111-2222";

/// System prompt variant. The backup prompt works better with models that
/// refuse to repeat card numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum PromptStyle {
    #[default]
    Primary,
    Backup,
}

impl PromptStyle {
    const fn system_prompt(self) -> &'static str {
        match self {
            Self::Primary => PRIMARY_PROMPT,
            Self::Backup => BACKUP_PROMPT,
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    stream: bool,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: String,
}

/// [`Extractor`] backed by the Ollama `/api/chat` endpoint.
#[derive(Debug, Clone)]
pub struct OllamaExtractor {
    client: Client,
    endpoint: String,
    model: String,
    prompt: PromptStyle,
}

impl OllamaExtractor {
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        prompt: PromptStyle,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/chat", base_url.trim_end_matches('/')),
            model: model.into(),
            prompt,
        })
    }
}

#[async_trait]
impl Extractor for OllamaExtractor {
    async fn extract(&self, input: &str) -> Result<String, ExtractorError> {
        let user = format!("Input: {input}\nOutput:");
        let request = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage { role: "system", content: self.prompt.system_prompt() },
                ChatMessage { role: "user", content: &user },
            ],
            stream: false,
            options: ChatOptions { temperature: 0.0 },
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| ExtractorError::Unavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| ExtractorError::Unavailable(e.to_string()))?;

        let body: ChatResponse =
            response.json().await.map_err(|e| ExtractorError::InvalidResponse(e.to_string()))?;
        debug!(model = %self.model, len = body.message.content.len(), "model answered");
        Ok(body.message.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_normalized() {
        let extractor =
            OllamaExtractor::new("http://localhost:11434/", "llama3.1", PromptStyle::Primary, Duration::from_secs(1))
                .unwrap();
        assert_eq!(extractor.endpoint, "http://localhost:11434/api/chat");
    }

    #[test]
    fn test_request_shape() {
        let request = ChatRequest {
            model: "llama3.1",
            messages: [
                ChatMessage { role: "system", content: PromptStyle::Backup.system_prompt() },
                ChatMessage { role: "user", content: "Input: x\nOutput:" },
            ],
            stream: false,
            options: ChatOptions { temperature: 0.0 },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "Input: x\nOutput:");
        assert_eq!(json["stream"], false);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        let extractor =
            OllamaExtractor::new("http://127.0.0.1:9", "llama3.1", PromptStyle::Primary, Duration::from_millis(500))
                .unwrap();
        let result = extractor.extract("My credit card number is 1111-1111-1111-1111").await;
        assert!(matches!(result, Err(ExtractorError::Unavailable(_))));
    }
}
