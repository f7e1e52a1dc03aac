//! Email-to-record extraction: prompt rendering, the model call, and the
//! keyword/regex fallback used whenever the model path fails.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use minijinja::{context, Environment, UndefinedBehavior};
use regex::Regex;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use tokio_util::sync::CancellationToken;

use crate::ai::LlmProvider;
use crate::models::{Job, LlmResponse, RawEmail, Stage};

// --- Prompt template ---

/// Prompt file with `{{ SUBJECT }}`, `{{ BODY }}` and `{{ EMAIL }}` placeholders.
/// Undefined variables are render errors.
#[derive(Debug)]
pub struct PromptTemplate {
    env: Environment<'static>,
    source: String,
}

impl PromptTemplate {
    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read prompt template: {}", path.display()))?;
        Self::from_source(source)
    }

    pub fn from_source(source: String) -> Result<Self> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        let template = Self { env, source };

        // Surface typos in the template before any mail is fetched
        template
            .render("", "", "")
            .context("Prompt template does not render")?;
        Ok(template)
    }

    pub fn render(&self, subject: &str, body: &str, email: &str) -> Result<String> {
        let rendered = self.env.render_str(
            &self.source,
            context! { SUBJECT => subject, BODY => body, EMAIL => email },
        )?;
        Ok(rendered)
    }
}

// --- Fallback parser ---

const REJECTED_KEYWORDS: &[&str] = &["rejected", "not selected", "unfortunately", "declined"];

const INTERVIEW_KEYWORDS: &[&str] = &[
    "interview",
    "phone screen",
    "zoom",
    "call scheduled",
    "recruiter will reach out",
];

const REFERRAL_KEYWORDS: &[&str] = &["referred", "referral"];

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://[^\s]+").expect("valid regex"));
static POSITION_AT_COMPANY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)application.*?for (.+?) position at (.+)").expect("valid regex")
});
static APPLICATION_TO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)application (?:at|to) ([\w\s-]+)").expect("valid regex"));
// Careers pages usually live on a subdomain; the company is the label after it.
static URL_COMPANY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)https?://(?:(?:www|jobs|careers|apply|recruiting|boards)\.)?([a-zA-Z0-9-]+)\.")
        .expect("valid regex")
});

fn contains_any(text: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| text.contains(needle))
}

/// Deterministic extraction from subject and body alone.
pub fn fallback_parse(subject: &str, body: &str) -> LlmResponse {
    let full_text = format!("{} {}", subject, body).to_lowercase();

    let stage = if contains_any(&full_text, REJECTED_KEYWORDS) {
        Stage::Rejected
    } else if contains_any(&full_text, INTERVIEW_KEYWORDS) {
        Stage::Interview
    } else {
        Stage::Applied
    };

    let job_url = URL_RE
        .find(body)
        .map(|m| m.as_str().to_string())
        .unwrap_or_default();

    let mut position = String::new();
    let mut company = String::new();

    if let Some(caps) = POSITION_AT_COMPANY_RE.captures(subject) {
        position = caps[1].trim().to_string();
        company = caps[2].trim().to_string();
    }

    if company.is_empty() {
        if let Some(caps) = APPLICATION_TO_RE.captures(subject) {
            company = caps[1].trim().to_string();
        }
    }

    if company.is_empty() && !job_url.is_empty() {
        if let Some(caps) = URL_COMPANY_RE.captures(&job_url) {
            company = caps[1].trim().to_string();
        }
    }

    LlmResponse {
        company,
        position,
        stage,
        referral: contains_any(&full_text, REFERRAL_KEYWORDS),
        job_url,
    }
}

// --- Extractor ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractSource {
    Llm,
    Fallback,
}

pub struct Extractor {
    provider: Arc<dyn LlmProvider>,
    template: PromptTemplate,
}

impl Extractor {
    pub fn new(provider: Arc<dyn LlmProvider>, template: PromptTemplate) -> Self {
        Self { provider, template }
    }

    async fn parse_with_llm(&self, email: &RawEmail, cancel: &CancellationToken) -> Result<LlmResponse> {
        let prompt = self
            .template
            .render(&email.subject, &email.body, &email.sender_email)
            .context("prompt render failed")?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(anyhow!("cancelled before the model answered")),
            result = self.provider.parse(&prompt) => result,
        }
    }

    /// Model first, fallback on any failure. Always yields a job.
    pub async fn extract(&self, email: &RawEmail, cancel: &CancellationToken) -> (Job, ExtractSource) {
        let (response, source) = match self.parse_with_llm(email, cancel).await {
            Ok(response) => (response, ExtractSource::Llm),
            Err(e) => {
                tracing::warn!(
                    subject = %email.subject,
                    model = self.provider.model_name(),
                    error = %format!("{:#}", e),
                    "LLM parse failed, using fallback"
                );
                (fallback_parse(&email.subject, &email.body), ExtractSource::Fallback)
            }
        };

        (Job::from_response(response, email.date, Utc::now()), source)
    }
}
