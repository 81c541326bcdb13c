// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! mongofluxd daemon.
//!
//! Startup order: parse flags, load the config file (flags override),
//! apply defaults, resolve transforms, connect to MongoDB (the wait is
//! signal-interruptible), build the InfluxDB client, compute the resume
//! position, start the ingestion source, spawn the workers, and
//! optionally watch for backfill completion. SIGINT/SIGTERM (or
//! backfill completion with `--exit-after-direct-reads`) triggers a
//! graceful teardown: the source drains and closes, every worker
//! performs a final flush and checkpoint, and the process exits with
//! the sticky run status.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mongoflux_influx::{InfluxClient, InfluxClientConfig, InfluxWrite};
use mongofluxd::config::{redact_url, Args, Config};
use mongofluxd::measurement::MeasurementSet;
use mongofluxd::mongo::{MongoSourceClient, SourceClient};
use mongofluxd::resume::{ResumeCommitter, ResumeStore, ResumeStrategy};
use mongofluxd::source::{IngestionSource, SourceOptions};
use mongofluxd::transform::TransformRegistry;
use mongofluxd::worker::{spawn_workers, PipelineContext};
use mongofluxd::{RunStatus, NAME, VERSION};

/// Compiled-in user transforms, predicates, and coercions are
/// registered here; measurements reference them by name.
fn transform_registry() -> TransformRegistry {
    TransformRegistry::new()
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if args.version {
        println!("{}", VERSION);
        return;
    }

    let config = match Config::resolve(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: configuration error: {}", NAME, e);
            std::process::exit(1);
        }
    };

    let filter = if config.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let status = RunStatus::new();
    match run(config, status.clone()).await {
        Ok(()) => std::process::exit(status.exit_code()),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    }
}

async fn run(config: Config, status: RunStatus) -> Result<()> {
    let registry = transform_registry();
    if config.verbose && registry.is_empty() {
        info!("no transforms registered");
    }
    let measurements = MeasurementSet::build(&config.measurements, &registry)
        .context("configuration error")?;

    let mut shutdown = shutdown_signals()?;

    // Connect and ping; a signal during the wait aborts the process.
    let source_client = tokio::select! {
        connected = MongoSourceClient::connect(
            &config.mongo_url,
            config.oplog_namespace(),
            config.resume && config.resume_write_unsafe,
        ) => connected.with_context(|| {
            format!("unable to connect to MongoDB using URL {}", redact_url(&config.mongo_url))
        })?,
        _ = shutdown.recv() => return Ok(()),
    };
    let source_client: Arc<dyn SourceClient> = Arc::new(source_client);
    tokio::select! {
        pinged = source_client.ping() => pinged.with_context(|| {
            format!("unable to reach MongoDB using URL {}", redact_url(&config.mongo_url))
        })?,
        _ = shutdown.recv() => return Ok(()),
    }

    let influx = InfluxClient::new(InfluxClientConfig {
        url: config.influx_url.clone(),
        username: config.influx_user.clone(),
        password: config.influx_password.clone(),
        skip_verify: config.influx_skip_verify,
        pem_file: config.influx_pem_file.clone(),
        user_agent: format!("{} v{}", NAME, VERSION),
    })
    .context("unable to create InfluxDB client")?;
    let influx: Arc<dyn InfluxWrite> = Arc::new(influx);

    // Resume position: a timestamp for the tail, tokens per stream for
    // change streams.
    let resume_store = ResumeStore::new(Arc::clone(&source_client), config.resume_name.clone());
    let start_at = match config.resume_strategy {
        ResumeStrategy::Timestamp => {
            resume_store
                .starting_timestamp(config.resume, config.replay, config.resume_from_timestamp)
                .await
                .context("unable to compute resume position")?
        }
        ResumeStrategy::Token => source_client
            .head_timestamp()
            .await
            .context("unable to read source head")?,
    };
    let mut stream_tokens = HashMap::new();
    if config.change_streams && config.resume && config.resume_strategy == ResumeStrategy::Token {
        for ns in measurements.tail_namespaces() {
            if let Some(token) = resume_store
                .token_for(&ns.to_string())
                .await
                .context("unable to load resume tokens")?
            {
                stream_tokens.insert(ns.to_string(), token);
            }
        }
    }

    let mut source = IngestionSource::start(
        Arc::clone(&source_client),
        SourceOptions {
            direct_reads: config.direct_reads,
            change_streams: config.change_streams,
            channel_size: config.channel_size,
            buffer_size: config.buffer_size,
            buffer_duration: config.buffer_duration,
            oplog_ns: config.oplog_namespace(),
            start_at,
            stream_tokens,
            scan_namespaces: measurements.scan_namespaces(),
            tail_namespaces: measurements.tail_namespaces().to_vec(),
            measured: measurements.measured_namespaces(),
        },
    );

    let ctx = Arc::new(PipelineContext {
        measurements,
        influx,
        source: Arc::clone(&source_client),
        status: status.clone(),
        committer: ResumeCommitter::new(config.influx_clients),
        resume_store,
        resume: config.resume,
        resume_strategy: config.resume_strategy,
        auto_create_db: config.influx_auto_create_db,
        batch_size: config.influx_buffer_size,
        verbose: config.verbose,
    });
    let workers = spawn_workers(config.influx_clients, ctx, source.ops(), source.errors());
    info!(
        workers = config.influx_clients,
        direct_reads = config.direct_reads,
        change_streams = config.change_streams,
        "pipeline started"
    );

    // Backfill completion: persist a post-backfill resume position and
    // optionally shut the pipeline down. A sender stays in scope so the
    // channel only yields when completion actually requests an exit.
    let (backfill_stop_tx, mut backfill_stop_rx) = mpsc::channel::<()>(1);
    let _backfill_stop_keepalive = backfill_stop_tx.clone();
    if config.direct_reads {
        let mut done = source.backfill_done();
        let client = Arc::clone(&source_client);
        let resume_name = config.resume_name.clone();
        let save_position = config.resume && config.resume_strategy == ResumeStrategy::Timestamp;
        let exit_after = config.exit_after_direct_reads;
        tokio::spawn(async move {
            while !*done.borrow() {
                if done.changed().await.is_err() {
                    return;
                }
            }
            if save_position {
                match client.committed_timestamp().await {
                    Ok(ts) => {
                        if let Err(e) = client.save_resume_timestamp(&resume_name, ts).await {
                            error!("unable to save post-backfill resume position: {}", e);
                        }
                    }
                    Err(e) => error!("unable to read replication status: {}", e),
                }
            }
            if exit_after {
                let _ = backfill_stop_tx.send(()).await;
            }
        });
    }

    tokio::select! {
        _ = shutdown.recv() => info!("signal received"),
        _ = backfill_stop_rx.recv() => info!("direct reads complete"),
    }

    info!("stopping all workers and shutting down");
    source.stop().await;
    for worker in workers {
        let _ = worker.await;
    }
    Ok(())
}

/// One-shot shutdown notification on SIGINT or SIGTERM.
fn shutdown_signals() -> Result<mpsc::Receiver<()>> {
    let (tx, rx) = mpsc::channel(1);
    let mut interrupt = signal(SignalKind::interrupt()).context("signal handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("signal handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        let _ = tx.send(()).await;
    });
    Ok(rx)
}
