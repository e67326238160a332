use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use taskchat_sync::cli::{Cli, Command, DeliveryArgs, MentionArgs};
use taskchat_sync::mention::{self, DirectoryEntry};
use taskchat_sync::proto::Action;
use taskchat_sync::queue::OutboundQueue;
use taskchat_sync::reconcile::Route;
use taskchat_sync::rest::RestClient;
use taskchat_sync::store::{FileStore, LocalStore};
use taskchat_sync::telemetry::logging;
use taskchat_sync::{metrics, SyncConfig, SyncSession};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config()).context("failed to initialise logging")?;
    let config = cli.sync_config();

    match cli.command {
        Command::Run(args) => run(config, args.metrics).await,
        Command::Send(args) => {
            let mentions = resolve_mentions(&args.content, &args.delivery)?;
            let action = Action::channel_message(args.channel, args.content).with_mentions(mentions);
            deliver(config, action, &args.delivery).await
        }
        Command::Edit(args) => {
            let mentions = resolve_mentions(&args.content, &args.delivery)?;
            let action = Action::edit_message(args.channel, args.message, args.content)
                .with_mentions(mentions);
            deliver(config, action, &args.delivery).await
        }
        Command::Dm(args) => {
            let mentions = resolve_mentions(&args.content, &args.delivery)?;
            let action = Action::direct_message(args.user, args.content).with_mentions(mentions);
            deliver(config, action, &args.delivery).await
        }
        Command::Queue => print_queue(&config),
        Command::Health => probe_health(&config).await,
        Command::Mentions(args) => resolve_picker(&args),
    }
}

async fn run(config: SyncConfig, print_metrics: bool) -> Result<()> {
    let (session, handle) = SyncSession::from_config(config).context("failed to start session")?;
    let task = session.spawn();
    let mut views = handle.subscribe();
    let mut status = handle.watch_status();
    println!("client {}", handle.client_id());

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                println!("status {}", serde_json::to_string(&current)?);
            }
            event = views.recv() => match event {
                Ok(event) => println!("event {event:?}"),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target = "taskchat::cli", skipped, "view events dropped");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    handle.shutdown().await.ok();
    task.await.context("session task failed")?;
    if print_metrics {
        print!("{}", metrics::export_prometheus());
    }
    Ok(())
}

async fn deliver(config: SyncConfig, action: Action, delivery: &DeliveryArgs) -> Result<()> {
    let (session, handle) = SyncSession::from_config(config).context("failed to start session")?;
    let task = session.spawn();

    let submitted = handle.submit(action).await?;
    match submitted.route {
        Route::Send => println!("sent {}", submitted.local_id),
        Route::Enqueue => {
            println!("queued {}", submitted.local_id);
            let flushed = tokio::time::timeout(
                Duration::from_secs(delivery.wait_secs),
                handle.wait_for(|status| status.pending == 0),
            )
            .await;
            match flushed {
                Ok(Ok(_)) => println!("queue flushed"),
                _ => println!(
                    "{} action(s) still queued; they will be replayed on the next run",
                    handle.status().pending
                ),
            }
        }
    }

    handle.shutdown().await.ok();
    task.await.context("session task failed")?;
    Ok(())
}

fn open_store(config: &SyncConfig) -> Result<Arc<dyn LocalStore>> {
    let path = match &config.store_path {
        Some(path) => path.clone(),
        None => FileStore::default_path()?,
    };
    let store = FileStore::open(&path)
        .with_context(|| format!("failed to open store at {}", path.display()))?;
    Ok(Arc::new(store))
}

fn print_queue(config: &SyncConfig) -> Result<()> {
    let queue = OutboundQueue::open(open_store(config)?, config.retry.clone())?;
    if queue.is_empty() {
        println!("queue empty");
        return Ok(());
    }
    for item in queue.snapshot() {
        println!("{}", serde_json::to_string(&item)?);
    }
    Ok(())
}

async fn probe_health(config: &SyncConfig) -> Result<()> {
    let client = RestClient::new(config.server_url()?, None)?;
    let report = client
        .health()
        .await
        .context("health endpoint unreachable")?;
    println!("databaseConnected={}", report.database_connected);
    Ok(())
}

fn load_directory(path: &Path) -> Result<Vec<DirectoryEntry>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read directory {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid directory {}", path.display()))
}

fn resolve_mentions(content: &str, delivery: &DeliveryArgs) -> Result<Vec<i64>> {
    match &delivery.directory {
        Some(path) => Ok(mention::extract_mentions(content, &load_directory(path)?)),
        None => Ok(Vec::new()),
    }
}

fn resolve_picker(args: &MentionArgs) -> Result<()> {
    let directory = load_directory(&args.directory)?;
    let cursor = args.cursor.unwrap_or(args.text.len());
    let Some(query) = mention::active_query(&args.text, cursor) else {
        println!("no mention under the cursor");
        return Ok(());
    };
    let ranked = mention::rank(&directory, &query.query);
    for (index, candidate) in ranked.iter().enumerate() {
        println!(
            "{index}\t{}\t@{}\t{}",
            candidate.score, candidate.entry.handle, candidate.entry.display_name
        );
    }
    if let Some(pick) = args.pick {
        let candidate = ranked
            .get(pick)
            .ok_or_else(|| anyhow!("no candidate at position {pick}"))?;
        let completion = mention::complete(&args.text, cursor, &query, &candidate.entry);
        println!("{}", completion.text);
        println!("cursor={}", completion.cursor);
    }
    Ok(())
}
