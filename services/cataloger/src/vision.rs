//! Vision adapter: asks an Azure OpenAI vision deployment to identify a comic
//! from its cover.
//!
//! The adapter never retries and never returns an error. Whatever goes wrong
//! comes back as [`VisionOutcome::Failed`], which the ingestion worker turns
//! into an `error` record.

use crate::config::VisionConfig;
use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

const SYSTEM_PROMPT: &str = r#"You are an expert comic book archivist. Identify the comic shown in the image and return a single JSON object with these keys:
"title", "series_name", "issue_number", "publication_year", "publisher", "format_type" (Issue, TPB, Hardcover, Manga or Bonellide), "plot" (30 to 50 words), "writers", "artists", "colorists", "letterers", "editors", "cover_artists", "characters", "teams", "locations", "genres" (lists of strings), "rating" and "original_us_info" (an object with "title", "publisher" and "year").
When the cover shows a translated edition, catalogue that edition and fill "original_us_info" with the original one.
If the image is not a comic or cannot be identified, return {"identified": false, "reason": "<short explanation>"}."#;

const USER_PROMPT: &str = "Identify this comic.";

/// Why an analysis produced no metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// Connection error or timeout
    Transport,
    /// Non-success HTTP status
    HttpStatus(u16),
    /// Response did not carry a JSON object
    Malformed,
    /// The model answered but could not identify the comic
    NotIdentified,
    ResponseTooLarge,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VisionFailure {
    pub kind: FailureKind,
    pub detail: String,
    /// Model payload, when the model did answer
    pub raw: Option<Value>,
}

impl VisionFailure {
    fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            raw: None,
        }
    }
}

impl fmt::Display for VisionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.detail)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VisionOutcome {
    /// Raw metadata object returned by the model
    Identified(Value),
    Failed(VisionFailure),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VisionClient: Send + Sync {
    /// Analyze the image reachable at `image_url`
    async fn analyze(&self, image_url: &str) -> VisionOutcome;
}

#[derive(Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// Interpret a chat-completions response body
pub fn parse_completion(body: &[u8]) -> VisionOutcome {
    let completion: ChatCompletion = match serde_json::from_slice(body) {
        Ok(completion) => completion,
        Err(e) => {
            return VisionOutcome::Failed(VisionFailure::new(
                FailureKind::Malformed,
                format!("response is not a chat completion: {e}"),
            ))
        }
    };

    let Some(content) = completion
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .filter(|content| !content.trim().is_empty())
    else {
        return VisionOutcome::Failed(VisionFailure::new(
            FailureKind::Malformed,
            "completion has no content",
        ));
    };

    let payload: Value = match serde_json::from_str(&content) {
        Ok(payload) => payload,
        Err(e) => {
            return VisionOutcome::Failed(VisionFailure::new(
                FailureKind::Malformed,
                format!("content is not JSON: {e}"),
            ))
        }
    };

    if !payload.is_object() {
        return VisionOutcome::Failed(VisionFailure {
            kind: FailureKind::Malformed,
            detail: "content is not a JSON object".to_string(),
            raw: Some(payload),
        });
    }

    if payload.get("identified") == Some(&Value::Bool(false)) || payload.get("error").is_some() {
        let detail = payload
            .get("reason")
            .or_else(|| payload.get("error"))
            .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
            .unwrap_or_else(|| "comic not identified".to_string());

        return VisionOutcome::Failed(VisionFailure {
            kind: FailureKind::NotIdentified,
            detail,
            raw: Some(payload),
        });
    }

    VisionOutcome::Identified(payload)
}

/// Azure OpenAI chat-completions client
pub struct AzureOpenAiVisionClient {
    http: reqwest::Client,
    url: Url,
    api_key: String,
    max_tokens: u32,
    temperature: f32,
    max_response_bytes: usize,
}

impl AzureOpenAiVisionClient {
    pub fn new(config: &VisionConfig, timeout: Duration) -> anyhow::Result<Self> {
        let url = completions_url(config)?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            url,
            api_key: config.api_key.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            max_response_bytes: config.max_response_bytes,
        })
    }

    fn request_body(&self, image_url: &str) -> Value {
        json!({
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": [
                    { "type": "text", "text": USER_PROMPT },
                    { "type": "image_url", "image_url": { "url": image_url, "detail": "auto" } }
                ]}
            ],
            "response_format": { "type": "json_object" },
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        })
    }

    /// Read the body, giving up once it exceeds the size limit
    async fn read_limited(&self, mut response: reqwest::Response) -> Result<Vec<u8>, VisionFailure> {
        let too_large = || {
            VisionFailure::new(
                FailureKind::ResponseTooLarge,
                format!("response exceeds {} bytes", self.max_response_bytes),
            )
        };

        if response
            .content_length()
            .is_some_and(|len| len > self.max_response_bytes as u64)
        {
            return Err(too_large());
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| VisionFailure::new(FailureKind::Transport, e.to_string()))?
        {
            if body.len() + chunk.len() > self.max_response_bytes {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }

        Ok(body)
    }
}

fn completions_url(config: &VisionConfig) -> anyhow::Result<Url> {
    let mut url = Url::parse(&config.endpoint)?.join(&format!(
        "openai/deployments/{}/chat/completions",
        config.deployment
    ))?;
    url.query_pairs_mut()
        .append_pair("api-version", &config.api_version);
    Ok(url)
}

#[async_trait]
impl VisionClient for AzureOpenAiVisionClient {
    async fn analyze(&self, image_url: &str) -> VisionOutcome {
        let response = match self
            .http
            .post(self.url.clone())
            .header("api-key", &self.api_key)
            .json(&self.request_body(image_url))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, timeout = e.is_timeout(), "Vision request failed");
                return VisionOutcome::Failed(VisionFailure::new(
                    FailureKind::Transport,
                    e.to_string(),
                ));
            }
        };

        let status = response.status();
        let body = match self.read_limited(response).await {
            Ok(body) => body,
            Err(failure) => return VisionOutcome::Failed(failure),
        };

        if !status.is_success() {
            let detail = String::from_utf8_lossy(&body).chars().take(512).collect::<String>();
            warn!(status = status.as_u16(), body = %detail, "Vision service returned an error");
            return VisionOutcome::Failed(VisionFailure::new(
                FailureKind::HttpStatus(status.as_u16()),
                detail,
            ));
        }

        debug!(size_bytes = body.len(), "Vision response received");
        parse_completion(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completion(content: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": "chatcmpl-1",
            "choices": [{ "index": 0, "message": { "role": "assistant", "content": content } }]
        }))
        .unwrap()
    }

    #[test]
    fn test_identified_payload() {
        let outcome = parse_completion(&completion(r#"{"title":"Watchmen #1","publisher":"DC"}"#));
        assert_eq!(
            outcome,
            VisionOutcome::Identified(json!({ "title": "Watchmen #1", "publisher": "DC" }))
        );
    }

    #[test]
    fn test_explicit_not_identified() {
        let outcome = parse_completion(&completion(r#"{"identified":false,"reason":"a cat"}"#));
        match outcome {
            VisionOutcome::Failed(failure) => {
                assert_eq!(failure.kind, FailureKind::NotIdentified);
                assert_eq!(failure.detail, "a cat");
                assert!(failure.raw.is_some());
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_error_key_means_not_identified() {
        let outcome = parse_completion(&completion(r#"{"error":"blurry"}"#));
        assert!(matches!(
            outcome,
            VisionOutcome::Failed(VisionFailure { kind: FailureKind::NotIdentified, .. })
        ));
    }

    #[test]
    fn test_malformed_responses() {
        for body in [
            b"<html>".to_vec(),
            serde_json::to_vec(&json!({ "choices": [] })).unwrap(),
            completion(""),
            completion("the cover shows Batman"),
            completion("[1, 2]"),
        ] {
            match parse_completion(&body) {
                VisionOutcome::Failed(failure) => assert_eq!(failure.kind, FailureKind::Malformed),
                other => panic!("expected malformed, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_completions_url() {
        let config = VisionConfig {
            endpoint: "https://vision.openai.azure.com/".to_string(),
            api_key: "k".to_string(),
            deployment: "gpt-4o".to_string(),
            api_version: "2024-02-15-preview".to_string(),
            timeout_secs: 60,
            max_response_bytes: 1024,
            max_tokens: 500,
            temperature: 0.1,
        };

        assert_eq!(
            completions_url(&config).unwrap().as_str(),
            "https://vision.openai.azure.com/openai/deployments/gpt-4o/chat/completions?api-version=2024-02-15-preview"
        );
    }
}
