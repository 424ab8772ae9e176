//! Operator CLI for the job queues: queue counts and dead-letter inspection,
//! replay and cleanup against the configured Redis.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;

use caseflow_infra::Settings;
use caseflow_infra::redis::{KeySpace, RedisDeadLetterStore, RedisJobStore, connect};
use caseflow_jobs::{AdminService, DeadLetterRouter, QueueRegistry};

#[derive(Parser, Debug)]
#[command(name = "caseflow-admin")]
#[command(about = "Inspect and repair caseflow job queues")]
#[command(version)]
struct Args {
    /// Print JSON instead of plain text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Job counts per queue
    Stats,
    /// Dead-letter operations
    DeadLetter {
        #[command(subcommand)]
        action: DeadLetterAction,
    },
}

#[derive(Subcommand, Debug)]
enum DeadLetterAction {
    /// Totals by queue and tenant
    Stats,
    /// Most recent failures first
    List {
        /// Only this queue (e.g. court-sync)
        #[arg(long, short = 'q')]
        queue: Option<String>,
        #[arg(long, short = 'l')]
        limit: Option<usize>,
    },
    /// Re-enqueue a failed job on its original queue
    Retry { id: String },
    /// Drop a record without replaying it
    Delete { id: String },
    /// Remove records older than the retention window
    Cleanup {
        /// Overrides the configured retention
        #[arg(long)]
        days: Option<u32>,
    },
}

async fn admin(settings: &Settings) -> anyhow::Result<AdminService> {
    let conn = connect(&settings.redis.url)
        .await
        .with_context(|| format!("failed to connect to redis at {}", settings.redis.url))?;
    let keys = KeySpace::new(settings.redis.key_prefix.clone());

    let router = DeadLetterRouter::new(Arc::new(RedisDeadLetterStore::new(conn.clone(), &keys)));
    let registry = QueueRegistry::new(
        Arc::new(RedisJobStore::new(conn, keys)),
        router,
        settings.queue_configs()?,
    );
    Ok(AdminService::new(
        Arc::new(registry),
        settings.dead_letter.retention_days,
    ))
}

fn print<T: Serialize + std::fmt::Debug>(json: bool, value: &T) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{value:#?}");
    }
    Ok(())
}

async fn run(args: Args) -> anyhow::Result<()> {
    let settings = Settings::load()?;
    let admin = admin(&settings).await?;

    match args.command {
        Command::Stats => {
            let stats = admin.queue_stats().await?;
            if args.json {
                return print(true, &stats);
            }
            println!(
                "{:<22}{:>9}{:>9}{:>9}{:>11}{:>9}{:>13}",
                "QUEUE", "WAITING", "DELAYED", "ACTIVE", "COMPLETED", "FAILED", "QUARANTINED"
            );
            for row in stats {
                let c = row.counts;
                println!(
                    "{:<22}{:>9}{:>9}{:>9}{:>11}{:>9}{:>13}",
                    row.queue.as_str(),
                    c.waiting,
                    c.delayed,
                    c.active,
                    c.completed,
                    c.failed,
                    c.quarantined
                );
            }
            Ok(())
        }
        Command::DeadLetter { action } => match action {
            DeadLetterAction::Stats => print(args.json, &admin.dead_letter_stats().await?),
            DeadLetterAction::List { queue, limit } => {
                let records = admin.dead_letter_jobs(queue.as_deref(), limit).await?;
                if args.json {
                    return print(true, &records);
                }
                for r in records {
                    println!(
                        "{}  {}  {}  {}  attempts={}  {}",
                        r.id,
                        r.failed_at.to_rfc3339(),
                        r.original_queue,
                        r.original_job_name,
                        r.attempts_made,
                        r.failure_reason
                    );
                }
                Ok(())
            }
            DeadLetterAction::Retry { id } => {
                let handle = admin.retry_dead_letter(&id).await?;
                if handle.created {
                    println!("re-enqueued {} as {} on {}", id, handle.id, handle.queue);
                } else {
                    println!("kept {id}: job {} is still pending on {}", handle.id, handle.queue);
                }
                Ok(())
            }
            DeadLetterAction::Delete { id } => {
                admin.delete_dead_letter(&id).await?;
                println!("deleted {id}");
                Ok(())
            }
            DeadLetterAction::Cleanup { days } => {
                let removed = admin.cleanup_dead_letters(days).await?;
                println!("removed {removed} dead letters");
                Ok(())
            }
        },
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    caseflow_observability::init();
    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
