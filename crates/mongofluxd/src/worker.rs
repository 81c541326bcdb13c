// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The worker pool.
//!
//! N symmetric workers drain the fused operation queue. Each worker is
//! a single-threaded select loop over four events: an operation
//! arriving (project, batch, flush on size), the 1 s flush tick, the
//! 10 s checkpoint tick (flush, then commit the resume position), and
//! producer errors (logged, sticky exit status). When the queue closes
//! the worker performs a final flush and checkpoint and returns.
//!
//! Worker state is deliberately unshared: batches, the known-database
//! set, and pending tokens belong to one worker. Only the resume
//! committer and the sticky run status cross workers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bson::Bson;
use mongoflux_influx::{InfluxError, InfluxWrite, PointBatch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::measurement::MeasurementSet;
use crate::mongo::{SourceClient, SourceError};
use crate::op::{OpOrigin, Operation};
use crate::projection::project;
use crate::resume::{ResumeCommitter, ResumeStore, ResumeStrategy};
use crate::RunStatus;

/// Period of the flush tick.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
/// Period of the checkpoint tick.
pub const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(10);

/// Shared dependencies of every worker.
pub struct PipelineContext {
    pub measurements: MeasurementSet,
    pub influx: Arc<dyn InfluxWrite>,
    pub source: Arc<dyn SourceClient>,
    pub status: RunStatus,
    pub committer: ResumeCommitter,
    pub resume_store: ResumeStore,
    pub resume: bool,
    pub resume_strategy: ResumeStrategy,
    pub auto_create_db: bool,
    /// Flush a batch once it holds this many points.
    pub batch_size: usize,
    pub verbose: bool,
}

/// Spawn `count` workers over the given queues.
pub fn spawn_workers(
    count: usize,
    ctx: Arc<PipelineContext>,
    ops: async_channel::Receiver<Operation>,
    errors: async_channel::Receiver<SourceError>,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|id| {
            let ctx = Arc::clone(&ctx);
            let ops = ops.clone();
            let errors = errors.clone();
            tokio::spawn(run_worker(id, ctx, ops, errors))
        })
        .collect()
}

/// One worker's event loop.
pub async fn run_worker(
    id: usize,
    ctx: Arc<PipelineContext>,
    ops: async_channel::Receiver<Operation>,
    errors: async_channel::Receiver<SourceError>,
) {
    let mut worker = Worker {
        id,
        ctx,
        batches: HashMap::new(),
        known_dbs: HashSet::new(),
        pending_tokens: HashMap::new(),
    };

    let mut flush_tick = interval_at(Instant::now() + FLUSH_INTERVAL, FLUSH_INTERVAL);
    flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut checkpoint_tick =
        interval_at(Instant::now() + CHECKPOINT_INTERVAL, CHECKPOINT_INTERVAL);
    checkpoint_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut errors_open = true;

    loop {
        tokio::select! {
            _ = checkpoint_tick.tick() => {
                worker.flush_all().await;
                worker.checkpoint().await;
            }
            _ = flush_tick.tick() => {
                worker.flush_all().await;
            }
            err = errors.recv(), if errors_open => match err {
                Ok(e) => {
                    error!(worker = id, "source error: {}", e);
                    worker.ctx.status.fail();
                }
                Err(_) => errors_open = false,
            },
            op = ops.recv() => match op {
                Ok(op) => worker.handle_op(op).await,
                Err(_) => {
                    worker.flush_all().await;
                    worker.checkpoint().await;
                    debug!(worker = id, "operation queue closed, exiting");
                    return;
                }
            }
        }
    }
}

struct Worker {
    id: usize,
    ctx: Arc<PipelineContext>,
    /// Pending batches keyed by source namespace.
    batches: HashMap<String, PointBatch>,
    /// Databases this worker has already ensured on the sink.
    known_dbs: HashSet<String>,
    /// Change-stream tokens observed since the last checkpoint.
    pending_tokens: HashMap<String, Bson>,
}

impl Worker {
    async fn handle_op(&mut self, mut op: Operation) {
        let ns_key = op.namespace.to_string();
        let Some(measurement) = self.ctx.measurements.get(&ns_key) else {
            return;
        };
        let measurement = Arc::clone(measurement);

        if let Some(predicate) = measurement.predicate {
            if !predicate(&op) {
                return;
            }
        }
        if let Some(coerce) = measurement.coerce {
            coerce(&mut op.doc);
        }

        // A change-tail event on a measurement with a view is only a
        // notification; the view holds the document.
        if let Some(view) = &measurement.view {
            if op.is_change_tail() {
                match self.ctx.source.find_by_id(view, &op.id).await {
                    Ok(Some(doc)) => {
                        op.doc = doc;
                        op.namespace = view.clone();
                        op.origin = OpOrigin::Backfill;
                        op.cursor = None;
                    }
                    Ok(None) => {
                        debug!(namespace = %view, "document missing from view, operation dropped");
                        return;
                    }
                    Err(e) => {
                        error!(namespace = %view, "view lookup failed: {}", e);
                        self.ctx.status.fail();
                        return;
                    }
                }
            }
        }

        let points = match project(&op, &measurement) {
            Ok(points) => points,
            Err(e) => {
                error!(namespace = %op.namespace, "projection failed: {}", e);
                self.ctx.status.fail();
                return;
            }
        };

        let ns_key = op.namespace.to_string();
        if !self.batches.contains_key(&ns_key) {
            if let Err(e) = self.ensure_database(&measurement.database).await {
                error!(database = %measurement.database, "database create failed: {}", e);
                self.ctx.status.fail();
                return;
            }
            self.batches.insert(
                ns_key.clone(),
                PointBatch::new(
                    measurement.database.clone(),
                    measurement.retention.clone(),
                    measurement.precision,
                ),
            );
        }
        let batch = self.batches.get_mut(&ns_key).expect("batch just inserted");
        for point in points {
            batch.add(point);
        }
        let batch_full = batch.len() >= self.ctx.batch_size;

        if op.origin == OpOrigin::ChangeTail {
            self.ctx.committer.note_pending(self.id, op.timestamp);
            if self.ctx.resume_strategy == ResumeStrategy::Token {
                if let Some(cursor) = op.cursor {
                    self.pending_tokens.insert(cursor.stream_id, cursor.token);
                }
            }
        }

        if batch_full {
            self.flush_all().await;
        }
    }

    /// Memoized database creation, guarded by the auto-create setting.
    async fn ensure_database(&mut self, db: &str) -> Result<(), InfluxError> {
        if !self.ctx.auto_create_db || self.known_dbs.contains(db) {
            return Ok(());
        }
        self.ctx.influx.create_database(db).await?;
        self.known_dbs.insert(db.to_string());
        Ok(())
    }

    /// Write out and discard every pending batch.
    async fn flush_all(&mut self) {
        if self.batches.is_empty() {
            return;
        }
        let mut flushed = 0;
        let mut all_ok = true;
        for (_, batch) in self.batches.drain() {
            if batch.is_empty() {
                continue;
            }
            match self.ctx.influx.write(&batch).await {
                Ok(()) => flushed += batch.len(),
                Err(e) => {
                    error!(worker = self.id, database = %batch.database, "batch write failed: {}", e);
                    self.ctx.status.fail();
                    all_ok = false;
                }
            }
        }
        self.ctx.committer.note_flush(self.id, all_ok);
        if self.ctx.verbose && flushed > 0 {
            info!(worker = self.id, "{} points flushed", flushed);
        }
    }

    /// Commit the resume position. Batches must already be flushed.
    async fn checkpoint(&mut self) {
        if !self.ctx.resume {
            return;
        }
        match self.ctx.resume_strategy {
            ResumeStrategy::Timestamp => {
                match self.ctx.committer.commit(&self.ctx.resume_store).await {
                    Ok(Some(ts)) => {
                        debug!(worker = self.id, "resume position {}.{} committed", ts.time, ts.increment);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!(worker = self.id, "checkpoint write failed: {}", e);
                        self.ctx.status.fail();
                    }
                }
            }
            ResumeStrategy::Token => {
                if self.pending_tokens.is_empty() {
                    return;
                }
                match self.ctx.resume_store.save_tokens(&self.pending_tokens).await {
                    Ok(()) => self.pending_tokens.clear(),
                    Err(e) => {
                        // Tokens are retained for the next tick.
                        error!(worker = self.id, "token checkpoint failed: {}", e);
                        self.ctx.status.fail();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{doc, Timestamp};
    use mongoflux_influx::MockInfluxClient;

    use crate::config::MeasurementConfig;
    use crate::mongo::MockSourceClient;
    use crate::op::{Namespace, OpKind, ResumeCursor};
    use crate::transform::TransformRegistry;

    fn measurement_config(ns: &str) -> MeasurementConfig {
        MeasurementConfig {
            namespace: ns.to_string(),
            fields: vec!["v".into()],
            ..Default::default()
        }
    }

    struct Rig {
        ctx: Arc<PipelineContext>,
        influx: Arc<MockInfluxClient>,
        mongo: Arc<MockSourceClient>,
        ops_tx: async_channel::Sender<Operation>,
        ops_rx: async_channel::Receiver<Operation>,
        errors_tx: async_channel::Sender<SourceError>,
        errors_rx: async_channel::Receiver<SourceError>,
    }

    fn rig(configs: &[MeasurementConfig], batch_size: usize, resume: bool) -> Rig {
        let influx = Arc::new(MockInfluxClient::new());
        let mongo = Arc::new(MockSourceClient::new());
        let measurements =
            MeasurementSet::build(configs, &TransformRegistry::new()).unwrap();
        let (ops_tx, ops_rx) = async_channel::bounded(256);
        let (errors_tx, errors_rx) = async_channel::bounded(16);

        let ctx = Arc::new(PipelineContext {
            measurements,
            influx: Arc::clone(&influx) as Arc<dyn InfluxWrite>,
            source: Arc::clone(&mongo) as Arc<dyn SourceClient>,
            status: RunStatus::new(),
            committer: ResumeCommitter::new(1),
            resume_store: ResumeStore::new(
                Arc::clone(&mongo) as Arc<dyn SourceClient>,
                "default",
            ),
            resume,
            resume_strategy: ResumeStrategy::Timestamp,
            auto_create_db: true,
            batch_size,
            verbose: false,
        });

        Rig {
            ctx,
            influx,
            mongo,
            ops_tx,
            ops_rx,
            errors_tx,
            errors_rx,
        }
    }

    fn insert_op(ns: &str, id: i32, v: f64, time: u32) -> Operation {
        Operation {
            id: Bson::Int32(id),
            namespace: ns.parse().unwrap(),
            kind: OpKind::Insert,
            timestamp: Timestamp { time, increment: 1 },
            doc: doc! { "_id": id, "v": v },
            origin: OpOrigin::ChangeTail,
            cursor: None,
        }
    }

    async fn run_to_completion(rig: &Rig) {
        rig.ops_tx.close();
        rig.errors_tx.close();
        run_worker(
            0,
            Arc::clone(&rig.ctx),
            rig.ops_rx.clone(),
            rig.errors_rx.clone(),
        )
        .await;
    }

    #[tokio::test]
    async fn test_batch_flushes_at_size_threshold() {
        let rig = rig(&[measurement_config("db.c")], 2, false);

        rig.ops_tx.send(insert_op("db.c", 1, 1.0, 10)).await.unwrap();
        rig.ops_tx.send(insert_op("db.c", 2, 2.0, 11)).await.unwrap();
        run_to_completion(&rig).await;

        // Exactly one write carrying both points.
        let writes = rig.influx.written();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].len(), 2);
        assert_eq!(writes[0].database, "db");
    }

    #[tokio::test]
    async fn test_database_created_once_per_worker() {
        let rig = rig(&[measurement_config("db.c")], 100, false);

        for i in 0..5 {
            rig.ops_tx
                .send(insert_op("db.c", i, f64::from(i), 10 + i as u32))
                .await
                .unwrap();
        }
        run_to_completion(&rig).await;

        assert_eq!(rig.influx.created_databases(), vec!["db"]);
        assert_eq!(rig.influx.written_points(), 5);
    }

    #[tokio::test]
    async fn test_auto_create_disabled_skips_database_create() {
        let mut r = rig(&[measurement_config("db.c")], 100, false);
        let ctx = Arc::get_mut(&mut r.ctx).unwrap();
        ctx.auto_create_db = false;

        r.ops_tx.send(insert_op("db.c", 1, 1.0, 10)).await.unwrap();
        run_to_completion(&r).await;

        assert!(r.influx.created_databases().is_empty());
        assert_eq!(r.influx.written_points(), 1);
    }

    #[tokio::test]
    async fn test_write_failure_sets_sticky_status_and_discards_batch() {
        let rig = rig(&[measurement_config("db.c")], 100, false);
        rig.influx.fail_writes(true);

        rig.ops_tx.send(insert_op("db.c", 1, 1.0, 10)).await.unwrap();
        run_to_completion(&rig).await;

        assert!(rig.ctx.status.has_failed());
        assert_eq!(rig.influx.written_points(), 0);
    }

    #[tokio::test]
    async fn test_source_error_sets_sticky_status() {
        let rig = rig(&[measurement_config("db.c")], 100, false);
        rig.errors_tx
            .send(SourceError::Stream("tail broke".into()))
            .await
            .unwrap();

        rig.ops_tx.send(insert_op("db.c", 1, 1.0, 10)).await.unwrap();
        run_to_completion(&rig).await;

        assert!(rig.ctx.status.has_failed());
        // The pipeline kept going.
        assert_eq!(rig.influx.written_points(), 1);
    }

    #[tokio::test]
    async fn test_final_checkpoint_commits_flushed_timestamp() {
        let rig = rig(&[measurement_config("db.c")], 100, true);

        rig.ops_tx.send(insert_op("db.c", 1, 1.0, 40)).await.unwrap();
        rig.ops_tx.send(insert_op("db.c", 2, 2.0, 41)).await.unwrap();
        run_to_completion(&rig).await;

        assert_eq!(
            rig.mongo.stored_timestamp("default"),
            Some(Timestamp { time: 41, increment: 1 })
        );
    }

    #[tokio::test]
    async fn test_backfill_ops_do_not_advance_resume() {
        let rig = rig(&[measurement_config("db.c")], 100, true);

        let mut op = insert_op("db.c", 1, 1.0, 40);
        op.origin = OpOrigin::Backfill;
        rig.ops_tx.send(op).await.unwrap();
        run_to_completion(&rig).await;

        assert_eq!(rig.influx.written_points(), 1);
        assert_eq!(rig.mongo.stored_timestamp("default"), None);
    }

    #[tokio::test]
    async fn test_view_resolution_replaces_document() {
        let mut config = measurement_config("db.c");
        config.view = Some("db.c_view".into());
        let rig = rig(&[config], 100, true);

        let view_ns = Namespace::new("db", "c_view");
        rig.mongo
            .insert_document(&view_ns, doc! { "_id": 1, "v": 99.0 });

        // The change-tail document carries a stale value; the view wins.
        rig.ops_tx.send(insert_op("db.c", 1, 1.0, 50)).await.unwrap();
        run_to_completion(&rig).await;

        let writes = rig.influx.written();
        assert_eq!(writes.len(), 1);
        assert_eq!(
            writes[0].points()[0].fields[0],
            ("v".to_string(), mongoflux_influx::FieldValue::Float(99.0))
        );
        // View-resolved operations are backfill-tagged: no resume advance.
        assert_eq!(rig.mongo.stored_timestamp("default"), None);
    }

    #[tokio::test]
    async fn test_view_lookup_miss_drops_operation() {
        let mut config = measurement_config("db.c");
        config.view = Some("db.c_view".into());
        let rig = rig(&[config], 100, false);

        rig.ops_tx.send(insert_op("db.c", 1, 1.0, 50)).await.unwrap();
        run_to_completion(&rig).await;

        assert_eq!(rig.influx.written_points(), 0);
        assert!(!rig.ctx.status.has_failed());
    }

    #[tokio::test]
    async fn test_token_checkpoint_saves_pending_tokens() {
        let mut r = rig(&[measurement_config("db.c")], 100, true);
        let ctx = Arc::get_mut(&mut r.ctx).unwrap();
        ctx.resume_strategy = ResumeStrategy::Token;

        let mut op = insert_op("db.c", 1, 1.0, 60);
        op.cursor = Some(ResumeCursor {
            stream_id: "db.c".into(),
            token: Bson::String("tok-60".into()),
        });
        r.ops_tx.send(op).await.unwrap();
        run_to_completion(&r).await;

        assert_eq!(
            r.mongo.stored_token("default", "db.c"),
            Some(Bson::String("tok-60".into()))
        );
        // Timestamp strategy storage untouched.
        assert_eq!(r.mongo.stored_timestamp("default"), None);
    }

    #[tokio::test]
    async fn test_invalid_document_drops_op_and_sets_status() {
        let mut config = measurement_config("db.c");
        config.timefield = Some("at".into());
        let rig = rig(&[config], 100, false);

        rig.ops_tx.send(insert_op("db.c", 1, 1.0, 10)).await.unwrap();
        run_to_completion(&rig).await;

        assert_eq!(rig.influx.written_points(), 0);
        assert!(rig.ctx.status.has_failed());
    }

    fn drop_even_ids(op: &Operation) -> bool {
        match op.doc.get_i32("_id") {
            Ok(id) => id % 2 != 0,
            Err(_) => true,
        }
    }

    fn double_v(doc: &mut bson::Document) {
        if let Ok(v) = doc.get_f64("v") {
            doc.insert("v", v * 2.0);
        }
    }

    #[tokio::test]
    async fn test_predicate_and_coercion_hooks() {
        let mut registry = TransformRegistry::new();
        registry.register_predicate("odd-only", drop_even_ids);
        registry.register_coercion("double-v", double_v);

        let mut config = measurement_config("db.c");
        config.filter = Some("odd-only".into());
        config.coerce = Some("double-v".into());

        let influx = Arc::new(MockInfluxClient::new());
        let mongo = Arc::new(MockSourceClient::new());
        let measurements = MeasurementSet::build(&[config], &registry).unwrap();
        let (ops_tx, ops_rx) = async_channel::bounded(16);
        let (errors_tx, errors_rx) = async_channel::bounded(4);

        let ctx = Arc::new(PipelineContext {
            measurements,
            influx: Arc::clone(&influx) as Arc<dyn InfluxWrite>,
            source: Arc::clone(&mongo) as Arc<dyn SourceClient>,
            status: RunStatus::new(),
            committer: ResumeCommitter::new(1),
            resume_store: ResumeStore::new(
                Arc::clone(&mongo) as Arc<dyn SourceClient>,
                "default",
            ),
            resume: false,
            resume_strategy: ResumeStrategy::Timestamp,
            auto_create_db: true,
            batch_size: 100,
            verbose: false,
        });

        ops_tx.send(insert_op("db.c", 1, 3.0, 10)).await.unwrap();
        ops_tx.send(insert_op("db.c", 2, 5.0, 11)).await.unwrap(); // dropped
        ops_tx.close();
        errors_tx.close();
        run_worker(0, ctx, ops_rx, errors_rx).await;

        let writes = influx.written();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].len(), 1);
        assert_eq!(
            writes[0].points()[0].fields[0],
            ("v".to_string(), mongoflux_influx::FieldValue::Float(6.0))
        );
    }
}
