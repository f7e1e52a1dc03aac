//! Fetch -> triage -> extract -> upsert, one task per stage.
//!
//! Stages are joined by single-slot channels, so a slow stage holds back the
//! ones before it. Each stage drops its sender when its input runs dry (or on
//! cancellation), which is how end-of-stream reaches the next stage.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::email::{triage, FetchedMessage};
use crate::extract::{ExtractSource, Extractor};
use crate::models::{FailedJob, JobCandidate, RawEmail};
use crate::upsert::{UpsertOutcome, Upserter};

pub const CHANNEL_CAPACITY: usize = 1;

pub fn channel<T>() -> (mpsc::Sender<T>, mpsc::Receiver<T>) {
    mpsc::channel(CHANNEL_CAPACITY)
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct IngestStats {
    pub messages_fetched: usize,
    pub job_emails: usize,
    pub parsed_by_llm: usize,
    pub parsed_by_fallback: usize,
    pub dropped_empty: usize,
    pub rows_created: usize,
    pub rows_updated: usize,
    pub failed: usize,
}

#[derive(Debug)]
pub struct IngestReport {
    pub stats: IngestStats,
    pub failures: Vec<FailedJob>,
}

async fn recv_or_cancel<T>(rx: &mut mpsc::Receiver<T>, cancel: &CancellationToken) -> Option<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        item = rx.recv() => item,
    }
}

#[derive(Debug, Default)]
struct TriageCounts {
    fetched: usize,
    matched: usize,
}

async fn run_triage(
    mut messages: mpsc::Receiver<FetchedMessage>,
    raw_tx: mpsc::Sender<RawEmail>,
    cancel: CancellationToken,
) -> TriageCounts {
    let mut counts = TriageCounts::default();
    while let Some(message) = recv_or_cancel(&mut messages, &cancel).await {
        counts.fetched += 1;
        let Some(raw) = triage(&message) else {
            continue;
        };
        counts.matched += 1;
        if raw_tx.send(raw).await.is_err() {
            break;
        }
    }
    counts
}

#[derive(Debug, Default)]
struct StructureCounts {
    llm: usize,
    fallback: usize,
    dropped: usize,
}

async fn run_structurer(
    mut raw_rx: mpsc::Receiver<RawEmail>,
    job_tx: mpsc::Sender<JobCandidate>,
    extractor: Arc<Extractor>,
    cancel: CancellationToken,
) -> StructureCounts {
    let mut counts = StructureCounts::default();
    while let Some(email) = recv_or_cancel(&mut raw_rx, &cancel).await {
        let (job, source) = extractor.extract(&email, &cancel).await;
        match source {
            ExtractSource::Llm => counts.llm += 1,
            ExtractSource::Fallback => counts.fallback += 1,
        }

        tracing::info!(
            company = %job.company,
            position = %job.position,
            stage = %job.stage,
            referral = job.referral,
            source = ?source,
            "parsed job email"
        );

        if job.is_empty() {
            tracing::debug!(subject = %email.subject, "no company or position, dropping");
            counts.dropped += 1;
            continue;
        }

        if job_tx.send(JobCandidate { email, job }).await.is_err() {
            break;
        }
    }
    counts
}

pub struct Pipeline {
    extractor: Arc<Extractor>,
    upserter: Upserter,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(extractor: Arc<Extractor>, upserter: Upserter, cancel: CancellationToken) -> Self {
        Self {
            extractor,
            upserter,
            cancel,
        }
    }

    /// Drains `messages` through every stage. Upserts run on the calling
    /// task; returns once the job channel closes.
    pub async fn run(self, messages: mpsc::Receiver<FetchedMessage>) -> Result<IngestReport> {
        let Pipeline {
            extractor,
            mut upserter,
            cancel,
        } = self;

        let (raw_tx, raw_rx) = channel::<RawEmail>();
        let (job_tx, mut job_rx) = channel::<JobCandidate>();

        let triage = tokio::spawn(run_triage(messages, raw_tx, cancel.clone()));
        let structurer = tokio::spawn(run_structurer(raw_rx, job_tx, extractor, cancel.clone()));

        let mut stats = IngestStats::default();
        while let Some(candidate) = recv_or_cancel(&mut job_rx, &cancel).await {
            match upserter.upsert(candidate, &cancel).await {
                Some(UpsertOutcome::Created) => stats.rows_created += 1,
                Some(UpsertOutcome::Updated) => stats.rows_updated += 1,
                None => stats.failed += 1,
            }
        }
        drop(job_rx);

        let triage = triage.await.context("triage task failed")?;
        let structure = structurer.await.context("structurer task failed")?;

        stats.messages_fetched = triage.fetched;
        stats.job_emails = triage.matched;
        stats.parsed_by_llm = structure.llm;
        stats.parsed_by_fallback = structure.fallback;
        stats.dropped_empty = structure.dropped;

        Ok(IngestReport {
            stats,
            failures: upserter.into_failures(),
        })
    }
}
