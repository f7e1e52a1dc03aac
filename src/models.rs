use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use std::fmt;

/// Lifecycle phase of an application. Closed set; anything else coerces to `Applied`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stage {
    #[default]
    Applied,
    Interview,
    Rejected,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Applied, Stage::Interview, Stage::Rejected];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Applied => "Applied",
            Stage::Interview => "Interview",
            Stage::Rejected => "Rejected",
        }
    }

    /// Exact name match, as the remote store's status options are named.
    pub fn from_name(name: &str) -> Option<Stage> {
        Self::ALL.into_iter().find(|s| s.as_str() == name)
    }

    /// Lenient match for model output: trimmed, case-insensitive.
    pub fn coerce(raw: &str) -> Stage {
        let raw = raw.trim();
        match Self::ALL
            .into_iter()
            .find(|s| s.as_str().eq_ignore_ascii_case(raw))
        {
            Some(stage) => stage,
            None => {
                if !raw.is_empty() {
                    tracing::warn!(stage = raw, "unknown stage, defaulting to Applied");
                }
                Stage::Applied
            }
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Stage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        Ok(raw.map(|s| Stage::coerce(&s)).unwrap_or_default())
    }
}

/// A job-looking email after triage and body extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEmail {
    pub subject: String,
    pub body: String,
    pub sender_email: String,
    pub date: DateTime<Utc>,
}

/// Structured extraction result, from the model or the fallback parser.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LlmResponse {
    #[serde(default, deserialize_with = "null_as_default")]
    pub company: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub position: String,
    #[serde(default)]
    pub stage: Stage,
    #[serde(default, deserialize_with = "null_as_default")]
    pub referral: bool,
    #[serde(default, alias = "jobUrl", deserialize_with = "null_as_default")]
    pub job_url: String,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub company: String,
    pub position: String,
    pub job_url: String,
    pub apply_date: DateTime<Utc>,
    pub referral: bool,
    pub response_date: Option<DateTime<Utc>>,
    pub stage: Stage,
}

impl Job {
    /// `response_date` is stamped with `now` for any stage past `Applied`.
    pub fn from_response(llm: LlmResponse, email_date: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let response_date = (llm.stage != Stage::Applied).then_some(now);
        Self {
            company: llm.company,
            position: llm.position,
            job_url: llm.job_url,
            apply_date: email_date,
            referral: llm.referral,
            response_date,
            stage: llm.stage,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.company.is_empty() && self.position.is_empty()
    }

    /// Case-insensitive (company, position) identity.
    pub fn matches(&self, company: &str, position: &str) -> bool {
        self.company.to_lowercase() == company.to_lowercase()
            && self.position.to_lowercase() == position.to_lowercase()
    }
}

/// A job on its way to the store, with the email it came from.
#[derive(Debug, Clone)]
pub struct JobCandidate {
    pub email: RawEmail,
    pub job: Job,
}

#[derive(Debug, Clone)]
pub struct FailedJob {
    pub subject: String,
    pub body: String,
    pub sender_email: String,
    pub date: DateTime<Utc>,
    pub job: Job,
    pub reason: String,
}

impl FailedJob {
    pub fn new(candidate: JobCandidate, reason: impl Into<String>) -> Self {
        let JobCandidate { email, job } = candidate;
        Self {
            subject: email.subject,
            body: email.body,
            sender_email: email.sender_email,
            date: email.date,
            job,
            reason: reason.into(),
        }
    }
}
