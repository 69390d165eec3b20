use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use sitecheck_core::{CandidatePage, CheckEvent, ComparisonRecord, Outcome, OutcomeSummary};
use sitecheck_storage::ResultCaches;
use sitecheck_sync::{RunStatus, SiteCheckConfig, SiteChecker};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sitecheck")]
#[command(about = "Check that a source site's pages survived migration to a target site")]
struct Cli {
    /// Where result sets are persisted.
    #[arg(long, value_enum, default_value_t = CacheMedium::Disk, global = true)]
    cache: CacheMedium,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CacheMedium {
    Disk,
    Memory,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API.
    Serve,
    /// Compare every source sitemap page against the target site.
    Check {
        /// Ignore any cached result set and compare afresh.
        #[arg(long)]
        no_cache: bool,
    },
    /// Compare only sitemap pages not yet in the cached result set.
    CheckNew,
    /// Find target pages with no counterpart on the source site.
    CheckReverse {
        #[arg(long)]
        no_cache: bool,
    },
    /// Re-compare one page and update it in the cached result set.
    Recheck {
        url: String,
        /// Sitemap `lastmod` to record; otherwise the cached one is kept.
        #[arg(long, value_parser = lastmod_arg)]
        last_modified: Option<DateTime<Utc>>,
    },
    /// Print a cached result set as JSON.
    Cached {
        /// Show the reverse-check result set instead of the main one.
        #[arg(long)]
        new_pages: bool,
    },
    /// Remove both cached result sets.
    ClearCache,
}

fn lastmod_arg(value: &str) -> Result<DateTime<Utc>, String> {
    sitecheck_adapters::parse_lastmod(value).ok_or_else(|| format!("not a W3C datetime: {value}"))
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = SiteCheckConfig::from_env()?;
    let caches = match cli.cache {
        CacheMedium::Disk => ResultCaches::on_disk(config.cache_dir.clone()),
        CacheMedium::Memory => ResultCaches::in_memory(),
    };

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => sitecheck_web::serve(config, caches).await?,
        Commands::Check { no_cache } => {
            let checker = Arc::new(SiteChecker::from_config(&config, caches)?);
            stream_run(move |mut tx| async move { checker.run_check(!no_cache, &mut tx).await }).await?;
        }
        Commands::CheckNew => {
            let checker = Arc::new(SiteChecker::from_config(&config, caches)?);
            stream_run(move |mut tx| async move { checker.run_incremental_check(&mut tx).await }).await?;
        }
        Commands::CheckReverse { no_cache } => {
            let checker = Arc::new(SiteChecker::from_config(&config, caches)?);
            stream_run(move |mut tx| async move { checker.run_reverse_check(!no_cache, &mut tx).await })
                .await?;
        }
        Commands::Recheck { url, last_modified } => {
            let checker = SiteChecker::from_config(&config, caches)?;
            let page = CandidatePage::new(url).with_last_modified(last_modified);
            let (record, splice) = checker.recheck(page).await;
            eprintln!("cache update: {splice:?}");
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::Cached { new_pages } => {
            let cache = if new_pages { &caches.new_pages } else { &caches.main };
            match cache.load().await {
                Some(set) => println!("{}", serde_json::to_string_pretty(&set)?),
                None => println!("no cached results under {}", cache.key()),
            }
        }
        Commands::ClearCache => {
            caches.clear_all().await;
            println!("cache cleared");
        }
    }

    Ok(())
}

/// Runs a check on its own task and prints progress as events arrive.
async fn stream_run<F, Fut>(run: F) -> Result<()>
where
    F: FnOnce(mpsc::Sender<CheckEvent>) -> Fut,
    Fut: std::future::Future<Output = RunStatus> + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel(32);
    let handle = tokio::spawn(run(tx));

    let mut records: Vec<ComparisonRecord> = Vec::new();
    while let Some(event) = rx.recv().await {
        match event {
            CheckEvent::Progress(progress) => {
                if let Some(record) = progress.current_result {
                    let total = if progress.total_pages < 0 {
                        "?".to_string()
                    } else {
                        progress.total_pages.to_string()
                    };
                    println!(
                        "[{}/{}] {:<24} {} -> {}",
                        progress.processed_pages,
                        total,
                        record.outcome,
                        record.source_relative_path,
                        record.target_relative_path
                    );
                    records.push(record);
                }
            }
            CheckEvent::Failed { error } => eprintln!("error: {error}"),
        }
    }

    match handle.await? {
        RunStatus::Completed { processed } => {
            let summary = OutcomeSummary::from_records(&records);
            println!("check complete: processed={processed}");
            for outcome in Outcome::ALL {
                println!("  {:<24} {}", outcome, summary.count(outcome));
            }
            Ok(())
        }
        RunStatus::ConsumerGone => bail!("progress output closed before the run finished"),
        RunStatus::Failed { error } => bail!("check failed: {error}"),
    }
}
