use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use feedflow::adapters::{FeedFetcher, HttpHook, HttpProcessor};
use feedflow::config::{AppConfig, RetryPolicy};
use feedflow::orchestrator::Orchestrator;
use feedflow::queue::{Processor, QueueName, WorkQueue, WorkerLoop};
use feedflow::runner::SequentialRunner;
use feedflow::scheduler::{MAX_FETCH_INTERVAL_MINUTES, NewSource};
use feedflow::store::{Database, LibSqlBackend};

#[derive(Parser)]
#[command(name = "feedflow")]
#[command(about = "Source polling, work queues and processing workers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Run the source scheduler and every configured worker until Ctrl-C
    Serve,

    /// Drain the queues one item per worker per cycle, with a pause between cycles
    Sequential,

    /// Register a polling source
    AddSource {
        name: String,
        url: String,

        /// Polling interval in minutes (default 60)
        #[arg(value_parser = clap::value_parser!(i64).range(1..=MAX_FETCH_INTERVAL_MINUTES))]
        minutes: Option<i64>,
    },

    /// Print queue counts and sources
    Stats,
}

/// Keeps the non-blocking file writer flushing until process exit.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let (file_layer, guard) = match std::env::var("FEEDFLOW_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir.trim(), "feedflow.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    guard
}

fn processor(
    name: &str,
    url: Option<&String>,
    config: &AppConfig,
    policy: &RetryPolicy,
) -> anyhow::Result<Option<Arc<dyn Processor>>> {
    let Some(url) = url else {
        tracing::warn!("No endpoint configured for {name}; its queue will not be drained");
        return Ok(None);
    };
    let processor = HttpProcessor::new(name, url, config.api_key.clone(), policy.process_timeout)
        .with_context(|| format!("Invalid {name} endpoint"))?;
    Ok(Some(Arc::new(processor)))
}

async fn serve(config: AppConfig, db: Arc<dyn Database>) -> anyhow::Result<()> {
    let fetcher = FeedFetcher::new(Arc::clone(&db), config.fetch_timeout)
        .context("Failed to build feed fetcher")?;

    let mut orchestrator = Orchestrator::new(Arc::clone(&db), config.scheduler.clone(), Arc::new(fetcher));

    if let Some(url) = &config.maintenance_url {
        let hook = HttpHook::new(url, config.api_key.clone(), config.fetch_timeout)
            .context("Invalid maintenance endpoint")?;
        orchestrator = orchestrator.with_maintenance(Arc::new(hook));
    }
    if let Some(p) = processor("summarizer", config.summarizer_url.as_ref(), &config, &config.summarize)? {
        orchestrator = orchestrator.with_worker(QueueName::SUMMARIZE, p, config.summarize.clone());
    }
    if let Some(p) = processor("vision", config.vision_url.as_ref(), &config, &config.vision)? {
        orchestrator = orchestrator.with_worker(QueueName::ANALYZE_IMAGE, p, config.vision.clone());
    }

    orchestrator.start().await;
    tracing::info!("Running; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutdown requested");
    orchestrator.shutdown().await;
    Ok(())
}

async fn sequential(config: AppConfig, db: Arc<dyn Database>) -> anyhow::Result<()> {
    // Vision first, then summarization, as one cycle.
    let mut steps = Vec::new();
    if let Some(p) = processor("vision", config.vision_url.as_ref(), &config, &config.vision)? {
        let queue = WorkQueue::new(Arc::clone(&db), QueueName::ANALYZE_IMAGE);
        steps.push(Arc::new(WorkerLoop::new(queue, p, config.vision.clone())));
    }
    if let Some(p) = processor("summarizer", config.summarizer_url.as_ref(), &config, &config.summarize)? {
        let queue = WorkQueue::new(Arc::clone(&db), QueueName::SUMMARIZE);
        steps.push(Arc::new(WorkerLoop::new(queue, p, config.summarize.clone())));
    }
    if steps.is_empty() {
        bail!("sequential mode needs FEEDFLOW_VISION_URL or FEEDFLOW_SUMMARIZER_URL");
    }

    let runner = SequentialRunner::new(steps, config.sequential_pause);
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
        }
        let _ = tx.send(true);
    });

    runner.run(rx).await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let command = Cli::parse().command.unwrap_or(Command::Serve);
    let _log_guard = init_tracing();

    let config = AppConfig::from_env();

    // The store is the only hard dependency; without it there is nothing to do.
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.database_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {e}",
                    config.database_path.display()
                );
                std::process::exit(1);
            }),
    );

    match command {
        Command::Serve => serve(config, db).await,
        Command::Sequential => sequential(config, db).await,
        Command::AddSource { name, url, minutes } => {
            let mut source = NewSource::new(name, url);
            if let Some(minutes) = minutes {
                source = source.with_interval_minutes(minutes);
            }
            let created = db.create_source(&source).await.context("Failed to add source")?;
            println!(
                "Added source {} ({}) every {} min",
                created.id, created.name, created.fetch_interval_minutes
            );
            Ok(())
        }
        Command::Stats => {
            for queue in [QueueName::SUMMARIZE, QueueName::ANALYZE_IMAGE] {
                let s = db.work_stats(&queue).await.context("Failed to read stats")?;
                println!(
                    "{:<14} pending={} processing={} failed={} completed={}",
                    queue.as_str(),
                    s.pending, s.processing, s.failed, s.completed
                );
            }
            for source in db.list_sources().await.context("Failed to list sources")? {
                println!(
                    "source {:>4} {:<24} active={} every={}m last={}",
                    source.id,
                    source.name,
                    source.is_active,
                    source.fetch_interval_minutes,
                    source
                        .last_fetch_time
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".into())
                );
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Option<Command>, clap::Error> {
        Cli::try_parse_from(std::iter::once("feedflow").chain(args.iter().copied())).map(|cli| cli.command)
    }

    #[test]
    fn serve_is_the_default() {
        assert_eq!(parse(&[]).unwrap(), None);
        assert_eq!(parse(&["serve"]).unwrap(), Some(Command::Serve));
    }

    #[test]
    fn add_source_arguments() {
        assert_eq!(
            parse(&["add-source", "wire", "https://wire.example/rss", "15"]).unwrap(),
            Some(Command::AddSource {
                name: "wire".into(),
                url: "https://wire.example/rss".into(),
                minutes: Some(15),
            })
        );
        assert!(matches!(
            parse(&["add-source", "wire", "https://wire.example/rss"]).unwrap(),
            Some(Command::AddSource { minutes: None, .. })
        ));
        assert!(parse(&["add-source", "wire"]).is_err());
    }

    #[test]
    fn interval_out_of_range_is_rejected() {
        for bad in ["0", "-3", "9223372036854775807", "soon"] {
            assert!(
                parse(&["add-source", "wire", "https://wire.example/rss", bad]).is_err(),
                "{bad} accepted"
            );
        }
        let max = MAX_FETCH_INTERVAL_MINUTES.to_string();
        assert!(parse(&["add-source", "wire", "https://wire.example/rss", &max]).is_ok());
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert!(parse(&["explode"]).is_err());
    }
}
