/// Code Synthesis Client
///
/// Turns question text into generated code through an LLM. The orchestrator
/// only sees the `CodeSynthesizer` trait; `GeminiSynthesizer` is the
/// production implementation.

use crate::prompts;
use async_trait::async_trait;
use indexmap::IndexMap;
use quarry_common::config::GeminiSettings;
use quarry_common::types::{AnswerSynthesis, SynthesisResult};
use quarry_common::workspace::StagedItem;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SynthesisError {
    /// The LLM service could not be reached or rejected the request
    #[error("Synthesis request failed: {0}")]
    Transport(String),

    /// The LLM answered, but not with `{code, libraries, ...}`
    #[error("Synthesis response did not follow the expected structure: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait CodeSynthesizer: Send + Sync {
    /// Acquisition phase: code that gathers the data plus normalized questions
    async fn synthesize(
        &self,
        question: &str,
        staged: &IndexMap<String, StagedItem>,
        workspace: &Path,
    ) -> Result<SynthesisResult, SynthesisError>;

    /// Answer phase: code that writes `result.json`
    async fn synthesize_answer(
        &self,
        questions: &str,
        workspace: &Path,
    ) -> Result<AnswerSynthesis, SynthesisError>;
}

pub struct GeminiSynthesizer {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiSynthesizer {
    pub fn new(settings: &GeminiSettings) -> anyhow::Result<Self> {
        let api_key = settings
            .api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("GEMINI_API_KEY is not set"))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_key,
            model: settings.model.clone(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn generate(&self, system: &str, prompt: &str) -> Result<String, SynthesisError> {
        let url = format!("{}/v1beta/models/{}:generateContent", self.base_url, self.model);
        let body = json!({
            "systemInstruction": {"parts": [{"text": system}]},
            "contents": [{"role": "user", "parts": [{"text": prompt}]}],
            "generationConfig": {
                "responseMimeType": "application/json",
                "temperature": 0.2,
            },
        });

        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| SynthesisError::Transport(e.to_string()))?;

        let status = response.status();
        let value: Value = response
            .json()
            .await
            .map_err(|e| SynthesisError::Transport(e.to_string()))?;

        if !status.is_success() {
            let detail = value["error"]["message"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| format!("provider request failed with status {}", status));
            return Err(SynthesisError::Transport(detail));
        }

        extract_gemini_text(&value).ok_or_else(|| {
            SynthesisError::Malformed(format!(
                "no candidate text for model `{}` (response: {})",
                self.model,
                truncate_for_error(&value.to_string(), 300)
            ))
        })
    }
}

#[async_trait]
impl CodeSynthesizer for GeminiSynthesizer {
    async fn synthesize(
        &self,
        question: &str,
        staged: &IndexMap<String, StagedItem>,
        _workspace: &Path,
    ) -> Result<SynthesisResult, SynthesisError> {
        let prompt = prompts::acquisition_prompt(question, staged);
        let text = self.generate(prompts::ACQUISITION_SYSTEM, &prompt).await?;
        debug!(model = %self.model, chars = text.len(), "Acquisition synthesis received");

        let mut result: SynthesisResult = parse_payload(&text)?;
        if result.questions.trim().is_empty() {
            result.questions = question.to_string();
        }
        Ok(result)
    }

    async fn synthesize_answer(
        &self,
        questions: &str,
        workspace: &Path,
    ) -> Result<AnswerSynthesis, SynthesisError> {
        let files = prompts::describe_workspace(workspace)
            .await
            .map_err(|e| SynthesisError::Transport(format!("cannot list workspace: {}", e)))?;
        let prompt = prompts::answer_prompt(questions, &files);
        let text = self.generate(prompts::ANSWER_SYSTEM, &prompt).await?;
        debug!(model = %self.model, chars = text.len(), "Answer synthesis received");

        parse_payload(&text)
    }
}

/// Join the text parts of the first candidate
fn extract_gemini_text(value: &Value) -> Option<String> {
    let parts = value["candidates"][0]["content"]["parts"].as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|part| part["text"].as_str())
        .collect::<Vec<_>>()
        .join("");
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Strip Markdown fences and any prose around the outermost JSON object
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}

fn parse_payload<T>(text: &str) -> Result<T, SynthesisError>
where
    T: DeserializeOwned + HasCode,
{
    let object = extract_json_object(text).ok_or_else(|| {
        SynthesisError::Malformed(format!("no JSON object in: {}", truncate_for_error(text, 200)))
    })?;

    let payload: T =
        serde_json::from_str(object).map_err(|e| SynthesisError::Malformed(e.to_string()))?;

    if payload.code().trim().is_empty() {
        return Err(SynthesisError::Malformed("empty code".to_string()));
    }
    Ok(payload)
}

trait HasCode {
    fn code(&self) -> &str;
}

impl HasCode for SynthesisResult {
    fn code(&self) -> &str {
        &self.code
    }
}

impl HasCode for AnswerSynthesis {
    fn code(&self) -> &str {
        &self.code
    }
}

fn truncate_for_error(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let head: String = text.chars().take(max_chars).collect();
        format!("{}...", head)
    }
}
