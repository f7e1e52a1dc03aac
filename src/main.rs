mod ai;
mod config;
mod email;
mod extract;
mod models;
mod notion;
mod pipeline;
mod upsert;

use anyhow::{Context, Result};
use clap::Parser;
use config::Config;
use email::MailFetcher;
use extract::{Extractor, PromptTemplate};
use notion::NotionStore;
use pipeline::{IngestReport, Pipeline};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upsert::Upserter;

#[derive(Parser)]
#[command(name = "apptrack", version)]
#[command(about = "Track job applications from your inbox in a Notion database")]
#[command(long_about = "Reads the last week of mail over IMAP, picks out job-application \
    emails, extracts company/position/stage with an LLM (or a keyword fallback), and \
    creates or updates the matching Notion rows.\n\n\
    Configured entirely through the environment (or a .env file): GMAIL_USER, \
    GMAIL_APP_PASSWORD, NOTION_TOKEN, NOTION_DB_ID, OPENAI_API_KEY, or USE_GEMINI=true \
    with GEMINI_API_KEY.")]
struct Cli {}

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;

    let template = PromptTemplate::load(&config.prompt_path)?;

    let http = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")?;
    let provider: Arc<dyn ai::LlmProvider> = Arc::from(ai::create_provider(&config.llm, http.clone()));
    tracing::info!(model = provider.model_name(), "LLM provider ready");
    let store = Arc::new(NotionStore::new(&config.notion, http));

    let email_config = config.email.clone();
    let lookback_days = config.lookback_days;
    tracing::info!(user = %email_config.username, server = %email_config.server, "Connecting to mailbox");
    let (fetcher, ids) = tokio::task::spawn_blocking(move || -> Result<_> {
        let mut fetcher = MailFetcher::connect(&email_config)?;
        let ids = fetcher.search_recent(lookback_days)?;
        Ok((fetcher, ids))
    })
    .await
    .context("mailbox task panicked")??;

    tracing::info!(count = ids.len(), days = lookback_days, "Found messages");
    if ids.is_empty() {
        tokio::task::spawn_blocking(move || fetcher.logout())
            .await
            .context("mailbox task panicked")?;
        return Ok(());
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, finishing up");
                cancel.cancel();
            }
        }
    });

    let (msg_tx, msg_rx) = pipeline::channel();
    let fetch = tokio::task::spawn_blocking({
        let cancel = cancel.clone();
        move || fetcher.stream(ids, msg_tx, cancel)
    });

    let extractor = Arc::new(Extractor::new(provider, template));
    let report = Pipeline::new(extractor, Upserter::new(store), cancel)
        .run(msg_rx)
        .await?;

    let fetch_result = fetch.await.context("fetch task panicked")?;
    print_report(&report);
    fetch_result.context("Fetch failed")?;

    Ok(())
}

fn print_report(report: &IngestReport) {
    let stats = &report.stats;
    println!("\nResults:");
    println!("  Messages fetched: {}", stats.messages_fetched);
    println!("  Job emails:       {}", stats.job_emails);
    println!(
        "  Parsed:           {} by LLM, {} by fallback",
        stats.parsed_by_llm, stats.parsed_by_fallback
    );
    if stats.dropped_empty > 0 {
        println!("  Unparsed:         {}", stats.dropped_empty);
    }
    println!("  Rows created:     {}", stats.rows_created);
    println!("  Rows updated:     {}", stats.rows_updated);

    if !report.failures.is_empty() {
        println!("  Failed:           {}", stats.failed);
        println!("\nNot saved:");
        for failed in &report.failures {
            println!(
                "  {} {} - {} / {} ({}): {}",
                failed.date.format("%Y-%m-%d"),
                truncate(&failed.subject, 40),
                failed.job.company,
                failed.job.position,
                failed.sender_email,
                failed.reason
            );
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
