use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::models::{FailedJob, Job, JobCandidate, Stage};
use crate::notion::{
    Properties, PropertyValue, Row, RowStore, COL_APPLY_DATE, COL_COMPANY, COL_JOB_URL,
    COL_POSITION, COL_REFERRAL, COL_RESPONSE_DATE, COL_STAGE,
};

pub const REFERRED_OPTION: &str = "Referred!";
pub const NOT_REFERRED_OPTION: &str = "No";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

pub fn referral_option(referral: bool) -> &'static str {
    if referral {
        REFERRED_OPTION
    } else {
        NOT_REFERRED_OPTION
    }
}

/// Status option for a stage name; the status column only knows the three stages.
pub fn stage_status(name: &str) -> &'static str {
    match Stage::from_name(name) {
        Some(stage) => stage.as_str(),
        None => {
            tracing::warn!(stage = name, "unknown stage, defaulting to Applied");
            Stage::Applied.as_str()
        }
    }
}

/// Columns written on both update and create.
pub fn build_properties(job: &Job) -> Properties {
    let mut props = Properties::new();
    props.insert(
        COL_STAGE.to_string(),
        PropertyValue::Status(stage_status(job.stage.as_str()).to_string()),
    );
    props.insert(
        COL_REFERRAL.to_string(),
        PropertyValue::Select(referral_option(job.referral).to_string()),
    );

    if !job.job_url.is_empty() {
        props.insert(COL_JOB_URL.to_string(), PropertyValue::Url(job.job_url.clone()));
    }
    if job.apply_date != DateTime::<Utc>::default() {
        props.insert(COL_APPLY_DATE.to_string(), PropertyValue::Date(job.apply_date));
    }
    if let Some(response_date) = job.response_date {
        props.insert(COL_RESPONSE_DATE.to_string(), PropertyValue::Date(response_date));
    }
    props
}

/// First row, in query order, whose identity matches the job's.
pub fn find_match<'a>(rows: &'a [Row], job: &Job) -> Option<&'a Row> {
    rows.iter().find(|row| job.matches(&row.company, &row.position))
}

async fn cancellable<T>(cancel: &CancellationToken, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(anyhow!("cancelled")),
        result = fut => result,
    }
}

/// Writes jobs into the row store one at a time, keeping the ones it could not place.
pub struct Upserter {
    store: Arc<dyn RowStore>,
    failures: Vec<FailedJob>,
}

impl Upserter {
    pub fn new(store: Arc<dyn RowStore>) -> Self {
        Self {
            store,
            failures: Vec::new(),
        }
    }

    /// Update-if-exists-else-create keyed by (company, position). Errors
    /// land in the failure list and yield `None`.
    pub async fn upsert(&mut self, candidate: JobCandidate, cancel: &CancellationToken) -> Option<UpsertOutcome> {
        match self.try_upsert(&candidate.job, cancel).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                let reason = format!("{:#}", e);
                tracing::error!(
                    company = %candidate.job.company,
                    position = %candidate.job.position,
                    error = %reason,
                    "upsert failed"
                );
                self.failures.push(FailedJob::new(candidate, reason));
                None
            }
        }
    }

    async fn try_upsert(&self, job: &Job, cancel: &CancellationToken) -> Result<UpsertOutcome> {
        let rows = cancellable(cancel, self.store.query_all())
            .await
            .map_err(|e| e.context("lookup failed"))?;
        let existing = find_match(&rows, job);

        let mut props = build_properties(job);

        if let Some(row) = existing {
            tracing::info!(company = %job.company, position = %job.position, stage = %job.stage, "updating existing entry");
            cancellable(cancel, self.store.update(&row.id, &props))
                .await
                .map_err(|e| e.context("update failed"))?;
            return Ok(UpsertOutcome::Updated);
        }

        tracing::info!(company = %job.company, position = %job.position, stage = %job.stage, "creating new entry");
        props.insert(COL_COMPANY.to_string(), PropertyValue::Title(job.company.clone()));
        props.insert(COL_POSITION.to_string(), PropertyValue::RichText(job.position.clone()));
        cancellable(cancel, self.store.create(&props))
            .await
            .map_err(|e| e.context("create failed"))?;
        Ok(UpsertOutcome::Created)
    }

    #[allow(dead_code)]
    pub fn failures(&self) -> &[FailedJob] {
        &self.failures
    }

    pub fn into_failures(self) -> Vec<FailedJob> {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LlmResponse, RawEmail};
    use crate::notion::tests::MemoryStore;
    use chrono::TimeZone;

    fn candidate(company: &str, position: &str, stage: Stage) -> JobCandidate {
        let date = Utc.with_ymd_and_hms(2026, 10, 13, 9, 15, 0).unwrap();
        let llm = LlmResponse {
            company: company.to_string(),
            position: position.to_string(),
            stage,
            ..Default::default()
        };
        JobCandidate {
            email: RawEmail {
                subject: "Application update".to_string(),
                body: "body".to_string(),
                sender_email: "jobs@acme.com".to_string(),
                date,
            },
            job: Job::from_response(llm, date, Utc::now()),
        }
    }

    fn seeded_row(company: &str, position: &str, stage: &str) -> Properties {
        let mut props = Properties::new();
        props.insert(COL_COMPANY.to_string(), PropertyValue::Title(company.to_string()));
        props.insert(COL_POSITION.to_string(), PropertyValue::RichText(position.to_string()));
        props.insert(COL_STAGE.to_string(), PropertyValue::Status(stage.to_string()));
        props
    }

    #[test]
    fn test_build_properties_applied() {
        let job = candidate("Acme", "SWE", Stage::Applied).job;
        let props = build_properties(&job);
        assert_eq!(props[COL_STAGE], PropertyValue::Status("Applied".into()));
        assert_eq!(props[COL_REFERRAL], PropertyValue::Select("No".into()));
        assert_eq!(props[COL_APPLY_DATE], PropertyValue::Date(job.apply_date));
        assert!(!props.contains_key(COL_JOB_URL));
        assert!(!props.contains_key(COL_RESPONSE_DATE));
        assert!(!props.contains_key(COL_COMPANY));
        assert!(!props.contains_key(COL_POSITION));
    }

    #[test]
    fn test_build_properties_optional_columns() {
        let mut job = candidate("Acme", "SWE", Stage::Rejected).job;
        job.referral = true;
        job.job_url = "https://jobs.acme.com/42".to_string();
        let props = build_properties(&job);
        assert_eq!(props[COL_REFERRAL], PropertyValue::Select("Referred!".into()));
        assert_eq!(props[COL_JOB_URL], PropertyValue::Url("https://jobs.acme.com/42".into()));
        assert!(props.contains_key(COL_RESPONSE_DATE));
    }

    #[test]
    fn test_build_properties_skips_zero_apply_date() {
        let mut job = candidate("Acme", "SWE", Stage::Applied).job;
        job.apply_date = DateTime::<Utc>::default();
        assert!(!build_properties(&job).contains_key(COL_APPLY_DATE));
    }

    #[test]
    fn test_stage_status() {
        assert_eq!(stage_status("Interview"), "Interview");
        assert_eq!(stage_status("Offer"), "Applied");
    }

    #[test]
    fn test_find_match_first_wins() {
        let rows = vec![
            Row { id: "1".into(), company: "Globex".into(), position: "SWE".into() },
            Row { id: "2".into(), company: "ACME".into(), position: "swe".into() },
            Row { id: "3".into(), company: "acme".into(), position: "SWE".into() },
        ];
        let job = candidate("Acme", "SWE", Stage::Applied).job;
        assert_eq!(find_match(&rows, &job).unwrap().id, "2");
    }

    #[tokio::test]
    async fn test_upsert_creates_then_updates() {
        let store = Arc::new(MemoryStore::default());
        let mut upserter = Upserter::new(store.clone());
        let cancel = CancellationToken::new();

        let first = upserter.upsert(candidate("Acme", "SWE", Stage::Applied), &cancel).await;
        let second = upserter.upsert(candidate("Acme", "SWE", Stage::Applied), &cancel).await;

        assert_eq!(first, Some(UpsertOutcome::Created));
        assert_eq!(second, Some(UpsertOutcome::Updated));
        assert_eq!(store.len(), 1);
        assert_eq!(*store.creates.lock().unwrap(), 1);
        assert_eq!(*store.updates.lock().unwrap(), 1);
        assert!(upserter.failures().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_identity_is_case_insensitive() {
        let store = Arc::new(MemoryStore::default());
        store.seed(seeded_row("Acme", "SWE", "Applied"));
        let mut upserter = Upserter::new(store.clone());

        let outcome = upserter
            .upsert(candidate("acme", "swe", Stage::Interview), &CancellationToken::new())
            .await;

        assert_eq!(outcome, Some(UpsertOutcome::Updated));
        assert_eq!(store.len(), 1);
        let props = store.props(0);
        assert_eq!(props[COL_COMPANY], PropertyValue::Title("Acme".into()));
        assert_eq!(props[COL_STAGE], PropertyValue::Status("Interview".into()));
        assert!(props.contains_key(COL_RESPONSE_DATE));
    }

    #[tokio::test]
    async fn test_upsert_failure_is_recorded() {
        let store = Arc::new(MemoryStore {
            fail_writes: true,
            ..Default::default()
        });
        let mut upserter = Upserter::new(store.clone());

        let outcome = upserter
            .upsert(candidate("Acme", "SWE", Stage::Applied), &CancellationToken::new())
            .await;

        assert_eq!(outcome, None);
        let failures = upserter.into_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].subject, "Application update");
        assert_eq!(failures[0].sender_email, "jobs@acme.com");
        assert!(failures[0].reason.contains("create failed"));
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_upsert_cancelled_is_recorded() {
        let store = Arc::new(MemoryStore::default());
        let mut upserter = Upserter::new(store.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = upserter.upsert(candidate("Acme", "SWE", Stage::Applied), &cancel).await;
        assert_eq!(outcome, None);
        assert_eq!(upserter.failures().len(), 1);
    }
}
