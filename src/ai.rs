use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use thiserror::Error;

use crate::models::LlmResponse;

pub const SYSTEM_INSTRUCTION: &str = "You're a helpful assistant that extracts job application data from emails. Always respond with only JSON, no explanation.";

// --- Provider trait ---

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// One chat turn at temperature 0; returns the raw model text.
    async fn complete(&self, system: &str, prompt: &str) -> Result<String>;

    fn model_name(&self) -> &str;

    async fn parse(&self, prompt: &str) -> Result<LlmResponse> {
        let output = self.complete(SYSTEM_INSTRUCTION, prompt).await?;
        Ok(recover_json(&output)?)
    }
}

#[derive(Debug, Clone)]
pub enum LlmConfig {
    OpenAi { api_key: String },
    Gemini { api_key: String },
}

pub fn create_provider(config: &LlmConfig, client: reqwest::Client) -> Box<dyn LlmProvider> {
    match config {
        LlmConfig::OpenAi { api_key } => Box::new(OpenAiProvider::new(api_key.clone(), client)),
        LlmConfig::Gemini { api_key } => Box::new(GeminiProvider::new(api_key.clone(), client)),
    }
}

// --- JSON recovery ---

#[derive(Debug, Error)]
pub enum RecoverError {
    #[error("no valid JSON block found in LLM output")]
    NoJsonBlock,
    #[error("failed to parse JSON: {0}")]
    Decode(#[from] serde_json::Error),
}

static FENCED_JSON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("valid regex"));
static BARE_JSON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("valid regex"));

/// Pull the JSON object out of model output, with or without a code fence.
pub fn recover_json(output: &str) -> Result<LlmResponse, RecoverError> {
    let raw = output.trim();

    let candidate = FENCED_JSON
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .or_else(|| BARE_JSON.find(raw))
        .map(|m| m.as_str())
        .ok_or(RecoverError::NoJsonBlock)?;

    Ok(serde_json::from_str(candidate)?)
}

// --- OpenAI provider ---

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";
const OPENAI_MODEL: &str = "gpt-4o";

#[derive(Debug, Serialize)]
struct OpenAiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<OpenAiMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

impl OpenAiResponse {
    fn into_text(self) -> Result<String> {
        self.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("No choices in OpenAI API response"))
    }
}

#[derive(Debug)]
pub struct OpenAiProvider {
    api_key: String,
    model_id: String,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(api_key: String, client: reqwest::Client) -> Self {
        Self {
            api_key,
            model_id: OPENAI_MODEL.to_string(),
            client,
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        let request = OpenAiRequest {
            model: &self.model_id,
            temperature: 0.0,
            messages: vec![
                OpenAiMessage { role: "system", content: system },
                OpenAiMessage { role: "user", content: prompt },
            ],
        };

        let response = self
            .client
            .post(OPENAI_API_URL)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .context("Failed to send request to OpenAI API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "OpenAI API request failed with status {}: {}",
                status,
                error_text
            ));
        }

        let api_response: OpenAiResponse = response
            .json()
            .await
            .context("Failed to parse OpenAI API response")?;

        api_response.into_text()
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- Gemini provider ---

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const GEMINI_MODEL: &str = "gemini-2.0-flash-lite";

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    temperature: f32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    system_instruction: GeminiContent,
    contents: Vec<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

impl GeminiResponse {
    fn into_text(self) -> Result<String> {
        let candidate = self
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Gemini returned no candidates"))?;

        let text: String = candidate
            .content
            .map(|content| content.parts)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|part| part.text)
            .collect();

        if text.is_empty() {
            return Err(anyhow!("Gemini response contained no text parts"));
        }
        Ok(text)
    }
}

fn text_content(text: &str) -> GeminiContent {
    GeminiContent {
        parts: vec![GeminiPart {
            text: Some(text.to_string()),
        }],
    }
}

#[derive(Debug)]
pub struct GeminiProvider {
    api_key: String,
    model_id: String,
    client: reqwest::Client,
}

impl GeminiProvider {
    pub fn new(api_key: String, client: reqwest::Client) -> Self {
        Self {
            api_key,
            model_id: GEMINI_MODEL.to_string(),
            client,
        }
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        let request = GeminiRequest {
            system_instruction: text_content(system),
            contents: vec![text_content(prompt)],
            generation_config: GeminiGenerationConfig { temperature: 0.0 },
        };

        let url = format!("{}/{}:generateContent", GEMINI_API_BASE, self.model_id);
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .context("Failed to send request to Gemini API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "Gemini API request failed with status {}: {}",
                status,
                error_text
            ));
        }

        let api_response: GeminiResponse = response
            .json()
            .await
            .context("Failed to parse Gemini API response")?;

        api_response.into_text()
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Stage;

    #[test]
    fn test_recover_json_code_fenced() {
        let output = "```json\n{\"company\":\"Acme\",\"position\":\"SWE\",\"stage\":\"Interview\",\"referral\":false}\n```";
        let parsed = recover_json(output).unwrap();
        assert_eq!(parsed.company, "Acme");
        assert_eq!(parsed.position, "SWE");
        assert_eq!(parsed.stage, Stage::Interview);
        assert!(!parsed.referral);
    }

    #[test]
    fn test_recover_json_fence_without_language() {
        let output = "Here you go:\n```\n{\"company\": \"Globex\", \"referral\": true}\n```\nThanks";
        let parsed = recover_json(output).unwrap();
        assert_eq!(parsed.company, "Globex");
        assert!(parsed.referral);
    }

    #[test]
    fn test_recover_json_bare_object_with_prose() {
        let output = "  Sure! {\"company\":\"Initech\",\"position\":\"QA\",\"stage\":\"Rejected\"} hope that helps ";
        let parsed = recover_json(output).unwrap();
        assert_eq!(parsed.company, "Initech");
        assert_eq!(parsed.stage, Stage::Rejected);
    }

    #[test]
    fn test_recover_json_is_idempotent_on_clean_json() {
        let clean = r#"{"company":"Acme","position":"SWE","stage":"Applied","referral":true,"job_url":"https://acme.com/j/1"}"#;
        let once = recover_json(clean).unwrap();
        let fenced = format!("```json\n{}\n```", clean);
        assert_eq!(recover_json(&fenced).unwrap(), once);
        assert_eq!(recover_json(clean).unwrap(), once);
    }

    #[test]
    fn test_recover_json_no_block() {
        let err = recover_json("I could not find anything").unwrap_err();
        assert!(matches!(err, RecoverError::NoJsonBlock));
        assert_eq!(err.to_string(), "no valid JSON block found in LLM output");
    }

    #[test]
    fn test_recover_json_bad_json() {
        let err = recover_json("{company: Acme}").unwrap_err();
        assert!(matches!(err, RecoverError::Decode(_)));
    }

    #[test]
    fn test_openai_request_shape() {
        let request = OpenAiRequest {
            model: OPENAI_MODEL,
            temperature: 0.0,
            messages: vec![
                OpenAiMessage { role: "system", content: SYSTEM_INSTRUCTION },
                OpenAiMessage { role: "user", content: "prompt" },
            ],
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["model"], "gpt-4o");
        assert_eq!(value["temperature"], 0.0);
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][1]["content"], "prompt");
    }

    #[test]
    fn test_openai_response_text() {
        let body = r#"{"choices":[{"index":0,"message":{"role":"assistant","content":"{\"company\":\"Acme\"}"}}]}"#;
        let response: OpenAiResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.into_text().unwrap(), "{\"company\":\"Acme\"}");

        let empty: OpenAiResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(empty.into_text().is_err());
    }

    #[test]
    fn test_gemini_request_shape() {
        let request = GeminiRequest {
            system_instruction: text_content(SYSTEM_INSTRUCTION),
            contents: vec![text_content("prompt")],
            generation_config: GeminiGenerationConfig { temperature: 0.0 },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["contents"][0]["parts"][0]["text"], "prompt");
        assert_eq!(value["systemInstruction"]["parts"][0]["text"], SYSTEM_INSTRUCTION);
        assert_eq!(value["generationConfig"]["temperature"], 0.0);
    }

    #[test]
    fn test_gemini_response_concatenates_parts() {
        let body = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"{\"company\":"},{"text":"\"Acme\"}"}]}}]}"#;
        let response: GeminiResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.into_text().unwrap(), "{\"company\":\"Acme\"}");
    }

    #[test]
    fn test_gemini_response_errors() {
        let none: GeminiResponse = serde_json::from_str(r#"{"candidates":[]}"#).unwrap();
        assert!(none.into_text().unwrap_err().to_string().contains("no candidates"));

        let no_text: GeminiResponse =
            serde_json::from_str(r#"{"candidates":[{"content":{"parts":[]}}]}"#).unwrap();
        assert!(no_text.into_text().unwrap_err().to_string().contains("no text parts"));
    }

    #[test]
    fn test_create_provider_selects_model() {
        let client = reqwest::Client::new();
        let openai = create_provider(&LlmConfig::OpenAi { api_key: "k".into() }, client.clone());
        assert_eq!(openai.model_name(), "gpt-4o");
        let gemini = create_provider(&LlmConfig::Gemini { api_key: "k".into() }, client);
        assert_eq!(gemini.model_name(), "gemini-2.0-flash-lite");
    }
}
