// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fused ingestion stream.
//!
//! Two producer families feed one internal channel: backfill scans over
//! the configured namespaces, and the change tail (an oplog tail or one
//! change stream per namespace). A pump task filters operations,
//! buffers them briefly to amortize channel wakeups, and forwards them
//! into a bounded multi-consumer queue the worker pool drains.
//!
//! ```text
//! scan xN ----\
//!              +--> pump (filter + buffer) --> ops queue --> workers
//! tail x1|xN -/                               errors queue -/
//! ```
//!
//! Backfill completion is observable separately; `stop()` halts the
//! producers and closes the ops queue after the pump drains its buffer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bson::{Bson, Timestamp};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::mongo::{SourceClient, SourceError, TailOptions};
use crate::op::{Namespace, Operation};
use crate::NAME;

/// Ingestion settings, resolved from configuration and the resume plan.
pub struct SourceOptions {
    /// Run backfill scans.
    pub direct_reads: bool,
    /// Use change streams instead of the oplog tail.
    pub change_streams: bool,
    /// Capacity of the fused operation queue.
    pub channel_size: usize,
    /// Operations buffered in the pump before forwarding.
    pub buffer_size: usize,
    /// Maximum time an operation sits in the pump buffer.
    pub buffer_duration: Duration,
    /// Oplog location (oplog tail mode).
    pub oplog_ns: Namespace,
    /// Inclusive change-tail start position.
    pub start_at: Timestamp,
    /// Stored change-stream tokens by stream identity.
    pub stream_tokens: HashMap<String, Bson>,
    /// Namespaces scanned by backfill.
    pub scan_namespaces: Vec<Namespace>,
    /// Namespaces watched by change streams.
    pub tail_namespaces: Vec<Namespace>,
    /// Every namespace carrying a measurement (views included).
    pub measured: HashSet<String>,
}

/// The operation-level filter chain. Only passing operations reach the
/// worker pool.
pub fn passes_filters(op: &Operation, measured: &HashSet<String>, change_streams: bool) -> bool {
    // Never re-ingest the pipeline's own bookkeeping writes.
    if op.namespace.database == NAME {
        return false;
    }
    // Change streams are already constrained server-side.
    if !change_streams && !measured.contains(&op.namespace.to_string()) {
        return false;
    }
    op.kind.is_insert_or_update()
}

/// The running ingestion source.
pub struct IngestionSource {
    ops: async_channel::Receiver<Operation>,
    errors: async_channel::Receiver<SourceError>,
    backfill_done: watch::Receiver<bool>,
    stop_tx: watch::Sender<bool>,
    pump: Option<JoinHandle<()>>,
}

impl IngestionSource {
    /// Spawn the producers and the pump.
    pub fn start(client: Arc<dyn SourceClient>, opts: SourceOptions) -> Self {
        let (raw_tx, raw_rx) = mpsc::channel::<Operation>(opts.channel_size.max(1));
        let (op_tx, op_rx) = async_channel::bounded(opts.channel_size.max(1));
        let (err_tx, err_rx) = async_channel::bounded(64);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (backfill_tx, backfill_rx) = watch::channel(false);

        if opts.direct_reads {
            let mut scans = Vec::new();
            for ns in opts.scan_namespaces.clone() {
                let client = Arc::clone(&client);
                let raw_tx = raw_tx.clone();
                let err_tx = err_tx.clone();
                scans.push(tokio::spawn(async move {
                    debug!(namespace = %ns, "starting direct read");
                    if let Err(e) = client.scan(&ns, raw_tx).await {
                        let _ = err_tx.send(e).await;
                    }
                }));
            }
            tokio::spawn(async move {
                for scan in scans {
                    let _ = scan.await;
                }
                info!("direct reads completed");
                let _ = backfill_tx.send(true);
            });
        }

        if opts.change_streams {
            for ns in opts.tail_namespaces.clone() {
                let client = Arc::clone(&client);
                let raw_tx = raw_tx.clone();
                let err_tx = err_tx.clone();
                let stop_rx = stop_rx.clone();
                let token = opts.stream_tokens.get(&ns.to_string()).cloned();
                let start_at = token.is_none().then_some(opts.start_at);
                tokio::spawn(async move {
                    if let Err(e) = client
                        .watch_namespace(&ns, token, start_at, raw_tx, stop_rx)
                        .await
                    {
                        let _ = err_tx.send(e).await;
                    }
                });
            }
        } else {
            let client = Arc::clone(&client);
            let raw_tx = raw_tx.clone();
            let err_tx = err_tx.clone();
            let stop_rx = stop_rx.clone();
            let tail = TailOptions {
                oplog_ns: opts.oplog_ns.clone(),
                start_at: opts.start_at,
            };
            tokio::spawn(async move {
                if let Err(e) = client.tail_oplog(&tail, raw_tx, stop_rx).await {
                    let _ = err_tx.send(e).await;
                }
            });
        }
        drop(raw_tx);

        let pump = tokio::spawn(pump(
            raw_rx,
            op_tx,
            stop_rx,
            opts.measured,
            opts.change_streams,
            opts.buffer_size.max(1),
            opts.buffer_duration,
        ));

        Self {
            ops: op_rx,
            errors: err_rx,
            backfill_done: backfill_rx,
            stop_tx,
            pump: Some(pump),
        }
    }

    /// The fused operation queue; clone one receiver per worker.
    pub fn ops(&self) -> async_channel::Receiver<Operation> {
        self.ops.clone()
    }

    /// The producer error queue.
    pub fn errors(&self) -> async_channel::Receiver<SourceError> {
        self.errors.clone()
    }

    /// Flips to `true` when every backfill scan has finished.
    pub fn backfill_done(&self) -> watch::Receiver<bool> {
        self.backfill_done.clone()
    }

    /// Stop the producers; the ops queue closes once the pump drains
    /// its buffer.
    pub async fn stop(&mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn pump(
    mut raw_rx: mpsc::Receiver<Operation>,
    op_tx: async_channel::Sender<Operation>,
    mut stop_rx: watch::Receiver<bool>,
    measured: HashSet<String>,
    change_streams: bool,
    buffer_size: usize,
    buffer_duration: Duration,
) {
    let mut buffer: Vec<Operation> = Vec::with_capacity(buffer_size);
    let mut ticker = interval(buffer_duration);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            _ = ticker.tick() => {
                if !forward(&mut buffer, &op_tx).await {
                    return;
                }
            }
            next = raw_rx.recv() => match next {
                Some(op) => {
                    if passes_filters(&op, &measured, change_streams) {
                        buffer.push(op);
                        if buffer.len() >= buffer_size && !forward(&mut buffer, &op_tx).await {
                            return;
                        }
                    }
                }
                None => break,
            }
        }
    }

    // Drain the internal buffer, then close the queue so workers exit.
    forward(&mut buffer, &op_tx).await;
    op_tx.close();
}

async fn forward(buffer: &mut Vec<Operation>, op_tx: &async_channel::Sender<Operation>) -> bool {
    for op in buffer.drain(..) {
        if op_tx.send(op).await.is_err() {
            return false;
        }
    }
    true
}
