// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Moves dead-lettered ballot messages back to their work queue.

use anyhow::Context;
use ballot_broker::{
    configs::BrokerConfigs, connection::ConnectionManager, dead_letter::DeadLetterReprocessor,
};
use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dlq-replay")]
#[command(about = "Republish dead-lettered messages to their original queue", long_about = None)]
struct Args {
    /// Dead-letter queue to drain, e.g. `ocr_processing_queue.dlq`
    #[arg(long)]
    dlq: String,

    /// Queue receiving the messages again
    #[arg(long)]
    target: String,

    /// Maximum number of messages to move
    #[arg(long, default_value_t = 10)]
    count: usize,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let args = Args::parse();

    match run(args).await {
        Ok(moved) => {
            println!("{moved}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("dlq replay failed: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<usize> {
    let cfg = BrokerConfigs::from_env().context("loading broker configuration")?;
    let manager = ConnectionManager::from_configs(&cfg);

    manager
        .connect()
        .await
        .with_context(|| format!("connecting to {}", cfg.app_name))?;

    let moved = DeadLetterReprocessor::new(manager.clone())
        .retry_dead_letter_messages(&args.dlq, &args.target, args.count)
        .await
        .context("replaying dead-lettered messages");

    manager.disconnect().await;

    let moved = moved?;
    info!(dlq = args.dlq, target = args.target, moved, "replay finished");
    Ok(moved)
}
