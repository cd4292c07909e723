//! dex_mirror - chain event mirror
//!
//! ```text
//! ┌──────────┐    ┌───────────┐    ┌──────────────┐    ┌─────────────────┐
//! │  Source  │───▶│ Ingestor  │───▶│  Processor   │───▶│ Buffers / Push  │
//! │ (stream) │    │ (per sub) │    │ (depth sync) │    │ (PG / TD / pub) │
//! └──────────┘    └───────────┘    └──────────────┘    └─────────────────┘
//! ```
//!
//! `--env <name>` selects `config/<name>.yaml`. With `ingest.backend: channel`
//! chain actions are read from stdin, one JSON object per line.

use std::sync::Arc;

use futures::future::join_all;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use dex_mirror::app::Services;
use dex_mirror::config::{AppConfig, IngestBackend};
use dex_mirror::events::ChainAction;
use dex_mirror::ingest::redis_stream::stream_key;
use dex_mirror::ingest::{ChannelSource, Ingestor, RedisStreamSource};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

/// Forward newline-delimited chain actions from stdin until EOF
async fn forward_stdin(tx: mpsc::Sender<ChainAction>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<ChainAction>(&line) {
                    Ok(action) => {
                        if tx.send(action).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Skipping stdin line that is not a chain action"),
                }
            }
            Ok(None) => {
                info!("stdin closed");
                break;
            }
            Err(e) => {
                error!(error = %e, "stdin read failed");
                break;
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env)?;
    let _log_guard = dex_mirror::logging::init_logging(&config);

    info!(
        "Starting dex_mirror {} ({}) in {} mode",
        env!("CARGO_PKG_VERSION"),
        env!("DEX_MIRROR_BUILD"),
        env
    );

    let services = Services::build(&config).await?;
    let ingestor = Arc::new(Ingestor::new(
        services.processor.clone(),
        services.shutdown.clone(),
    ));

    let mut ingest_tasks = Vec::new();
    let mut stdin_task = None;
    match config.ingest.backend {
        IngestBackend::Redis => {
            for subscription in &config.ingest.subscriptions {
                let source = RedisStreamSource::connect(
                    &config.ingest.redis_url,
                    stream_key(&config.ingest.stream_prefix, subscription),
                    &config.ingest.group,
                    &config.ingest.consumer,
                    config.ingest.batch,
                    config.ingest.block_ms,
                )
                .await?;
                let ingestor = ingestor.clone();
                ingest_tasks.push(tokio::spawn(async move { ingestor.run(source).await }));
            }
        }
        IngestBackend::Channel => {
            let (tx, source) = ChannelSource::new("stdin", 1024, config.ingest.batch);
            let ingestor = ingestor.clone();
            ingest_tasks.push(tokio::spawn(async move { ingestor.run(source).await }));
            stdin_task = Some(tokio::spawn(forward_stdin(tx)));
        }
    }
    info!(loops = ingest_tasks.len(), "Ingestion running");

    let mut all_done = Box::pin(join_all(ingest_tasks));
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, finishing in-flight events");
            services.shutdown.request_shutdown();
            all_done.as_mut().await;
        }
        _ = all_done.as_mut() => {
            info!("All sources exhausted");
        }
    }
    if let Some(task) = stdin_task {
        task.abort();
    }

    services.shutdown().await;
    info!("{}", ingestor.stats().snapshot());
    info!("dex_mirror stopped");
    Ok(())
}
