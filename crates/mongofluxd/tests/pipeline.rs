// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end pipeline tests over the mock source and sink clients:
//! ingestion, filtering, projection, batching, and resume.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bson::{doc, Bson, Timestamp};
use mongoflux_influx::{InfluxWrite, MockInfluxClient};

use mongofluxd::config::MeasurementConfig;
use mongofluxd::measurement::MeasurementSet;
use mongofluxd::mongo::{MockSourceClient, SourceClient};
use mongofluxd::op::{Namespace, OpKind, OpOrigin, Operation, ResumeCursor};
use mongofluxd::resume::{ResumeCommitter, ResumeStore, ResumeStrategy};
use mongofluxd::source::{IngestionSource, SourceOptions};
use mongofluxd::transform::TransformRegistry;
use mongofluxd::worker::{spawn_workers, PipelineContext};
use mongofluxd::{RunStatus, NAME};

fn measurement(ns: &str) -> MeasurementConfig {
    MeasurementConfig {
        namespace: ns.to_string(),
        fields: vec!["v".into()],
        ..Default::default()
    }
}

fn tail_op(ns: &str, id: i32, v: f64, time: u32, increment: u32) -> Operation {
    Operation {
        id: Bson::Int32(id),
        namespace: ns.parse().unwrap(),
        kind: OpKind::Insert,
        timestamp: Timestamp { time, increment },
        doc: doc! { "_id": id, "v": v },
        origin: OpOrigin::ChangeTail,
        cursor: None,
    }
}

struct Pipeline {
    source: IngestionSource,
    workers: Vec<tokio::task::JoinHandle<()>>,
    status: RunStatus,
}

fn start_pipeline(
    mongo: &Arc<MockSourceClient>,
    influx: &Arc<MockInfluxClient>,
    configs: &[MeasurementConfig],
    workers: usize,
    batch_size: usize,
    resume: bool,
    direct_reads: bool,
) -> Pipeline {
    let registry = TransformRegistry::new();
    let measurements = MeasurementSet::build(configs, &registry).unwrap();
    let status = RunStatus::new();

    let source = IngestionSource::start(
        Arc::clone(mongo) as Arc<dyn SourceClient>,
        SourceOptions {
            direct_reads,
            change_streams: false,
            channel_size: 64,
            buffer_size: 4,
            buffer_duration: Duration::from_millis(5),
            oplog_ns: Namespace::new("local", "oplog.rs"),
            start_at: Timestamp { time: 0, increment: 0 },
            stream_tokens: HashMap::new(),
            scan_namespaces: measurements.scan_namespaces(),
            tail_namespaces: measurements.tail_namespaces().to_vec(),
            measured: measurements.measured_namespaces(),
        },
    );

    let ctx = Arc::new(PipelineContext {
        measurements,
        influx: Arc::clone(influx) as Arc<dyn InfluxWrite>,
        source: Arc::clone(mongo) as Arc<dyn SourceClient>,
        status: status.clone(),
        committer: ResumeCommitter::new(workers),
        resume_store: ResumeStore::new(
            Arc::clone(mongo) as Arc<dyn SourceClient>,
            "default",
        ),
        resume,
        resume_strategy: ResumeStrategy::Timestamp,
        auto_create_db: true,
        batch_size,
        verbose: false,
    });

    let handles = spawn_workers(workers, ctx, source.ops(), source.errors());
    Pipeline {
        source,
        workers: handles,
        status,
    }
}

async fn shut_down(mut pipeline: Pipeline) -> RunStatus {
    pipeline.source.stop().await;
    for worker in pipeline.workers {
        worker.await.unwrap();
    }
    pipeline.status
}

/// Poll until `check` passes or the timeout elapses.
async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within timeout");
}

#[tokio::test]
async fn test_tail_events_become_points() {
    let mongo = Arc::new(MockSourceClient::new());
    let influx = Arc::new(MockInfluxClient::new());

    mongo.push_tail_op(tail_op("db.c", 1, 1.5, 100, 1));
    mongo.push_tail_op(tail_op("db.c", 2, 2.5, 101, 1));
    mongo.push_tail_op(tail_op("db.c", 3, 3.5, 102, 1));

    let pipeline = start_pipeline(&mongo, &influx, &[measurement("db.c")], 2, 1000, false, false);
    wait_for(|| influx.written_points() == 3).await;
    let status = shut_down(pipeline).await;

    assert!(!status.has_failed());
    let writes = influx.written();
    let all_points: Vec<_> = writes.iter().flat_map(|b| b.points().to_vec()).collect();
    assert_eq!(all_points.len(), 3);
    assert!(all_points.iter().all(|p| p.name == "c"));
    assert!(writes.iter().all(|b| b.database == "db"));
}

#[tokio::test]
async fn test_size_trigger_flushes_before_ticks() {
    let mongo = Arc::new(MockSourceClient::new());
    let influx = Arc::new(MockInfluxClient::new());

    mongo.push_tail_op(tail_op("db.c", 1, 1.0, 100, 1));
    mongo.push_tail_op(tail_op("db.c", 2, 2.0, 100, 2));

    // One worker, batch size 2: both points must leave in a single
    // write well before the 1 s flush tick.
    let pipeline = start_pipeline(&mongo, &influx, &[measurement("db.c")], 1, 2, false, false);
    wait_for(|| !influx.written().is_empty()).await;

    let writes = influx.written();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].len(), 2);

    shut_down(pipeline).await;
}

#[tokio::test]
async fn test_internal_database_never_projected() {
    let mongo = Arc::new(MockSourceClient::new());
    let influx = Arc::new(MockInfluxClient::new());

    let internal_ns = format!("{}.resume", NAME);
    mongo.push_tail_op(tail_op(&internal_ns, 1, 1.0, 100, 1));
    mongo.push_tail_op(tail_op("db.c", 2, 2.0, 101, 1));

    // Even with the internal namespace measured, its events are dropped.
    let configs = vec![measurement("db.c"), measurement(&internal_ns)];
    let pipeline = start_pipeline(&mongo, &influx, &configs, 2, 1000, false, false);
    wait_for(|| influx.written_points() == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    shut_down(pipeline).await;

    assert_eq!(influx.written_points(), 1);
}

#[tokio::test]
async fn test_backfill_and_tail_interleave() {
    let mongo = Arc::new(MockSourceClient::new());
    let influx = Arc::new(MockInfluxClient::new());

    let ns: Namespace = "db.c".parse().unwrap();
    mongo.set_head(Timestamp { time: 200, increment: 0 });
    mongo.insert_document(&ns, doc! { "_id": 1, "v": 1.0 });
    mongo.insert_document(&ns, doc! { "_id": 2, "v": 2.0 });
    mongo.push_tail_op(tail_op("db.c", 3, 3.0, 201, 1));

    let pipeline = start_pipeline(&mongo, &influx, &[measurement("db.c")], 2, 1000, false, true);
    wait_for(|| influx.written_points() == 3).await;
    shut_down(pipeline).await;

    assert_eq!(influx.written_points(), 3);
}

#[tokio::test]
async fn test_resume_position_survives_restart() {
    let mongo = Arc::new(MockSourceClient::new());
    let influx = Arc::new(MockInfluxClient::new());

    // Run 1: three change-tail events, shut down cleanly.
    mongo.push_tail_op(tail_op("db.c", 1, 1.0, 300, 1));
    mongo.push_tail_op(tail_op("db.c", 2, 2.0, 301, 1));
    mongo.push_tail_op(tail_op("db.c", 3, 3.0, 302, 1));

    let pipeline = start_pipeline(&mongo, &influx, &[measurement("db.c")], 2, 1000, true, false);
    wait_for(|| influx.written_points() == 3).await;
    shut_down(pipeline).await;

    // The final checkpoint committed the highest flushed timestamp.
    let committed = mongo.stored_timestamp("default").unwrap();
    assert_eq!(committed, Timestamp { time: 302, increment: 1 });

    // Run 2 resumes one ordinal past the stored position.
    let store = ResumeStore::new(Arc::clone(&mongo) as Arc<dyn SourceClient>, "default");
    let start = store.starting_timestamp(true, false, 0).await.unwrap();
    assert_eq!(start, Timestamp { time: 302, increment: 2 });
}

#[tokio::test]
async fn test_token_checkpoint_round_trip() {
    let mongo = Arc::new(MockSourceClient::new());
    let influx = Arc::new(MockInfluxClient::new());

    let mut op = tail_op("db.c", 1, 1.0, 400, 1);
    op.cursor = Some(ResumeCursor {
        stream_id: "db.c".into(),
        token: Bson::String("tok-400".into()),
    });
    mongo.push_tail_op(op);

    let registry = TransformRegistry::new();
    let measurements = MeasurementSet::build(&[measurement("db.c")], &registry).unwrap();
    let status = RunStatus::new();
    let source = IngestionSource::start(
        Arc::clone(&mongo) as Arc<dyn SourceClient>,
        SourceOptions {
            direct_reads: false,
            change_streams: true,
            channel_size: 64,
            buffer_size: 1,
            buffer_duration: Duration::from_millis(5),
            oplog_ns: Namespace::new("local", "oplog.rs"),
            start_at: Timestamp { time: 0, increment: 0 },
            stream_tokens: HashMap::new(),
            scan_namespaces: vec![],
            tail_namespaces: measurements.tail_namespaces().to_vec(),
            measured: measurements.measured_namespaces(),
        },
    );
    let ctx = Arc::new(PipelineContext {
        measurements,
        influx: Arc::clone(&influx) as Arc<dyn InfluxWrite>,
        source: Arc::clone(&mongo) as Arc<dyn SourceClient>,
        status: status.clone(),
        committer: ResumeCommitter::new(1),
        resume_store: ResumeStore::new(
            Arc::clone(&mongo) as Arc<dyn SourceClient>,
            "default",
        ),
        resume: true,
        resume_strategy: ResumeStrategy::Token,
        auto_create_db: true,
        batch_size: 1000,
        verbose: false,
    });
    let workers = spawn_workers(1, ctx, source.ops(), source.errors());
    let mut pipeline = Pipeline {
        source,
        workers,
        status,
    };

    wait_for(|| influx.written_points() == 1).await;
    pipeline.source.stop().await;
    for worker in pipeline.workers {
        worker.await.unwrap();
    }

    assert_eq!(
        mongo.stored_token("default", "db.c"),
        Some(Bson::String("tok-400".into()))
    );

    let store = ResumeStore::new(Arc::clone(&mongo) as Arc<dyn SourceClient>, "default");
    assert_eq!(
        store.token_for("db.c").await.unwrap(),
        Some(Bson::String("tok-400".into()))
    );
}

#[tokio::test]
async fn test_namespace_ordering_preserved_within_worker() {
    let mongo = Arc::new(MockSourceClient::new());
    let influx = Arc::new(MockInfluxClient::new());

    for i in 0..8 {
        mongo.push_tail_op(tail_op("db.c", i, f64::from(i), 500 + i as u32, 1));
    }

    // A single worker must observe and batch events in tail order.
    let pipeline = start_pipeline(&mongo, &influx, &[measurement("db.c")], 1, 1000, false, false);
    wait_for(|| influx.written_points() == 8).await;
    shut_down(pipeline).await;

    let times: Vec<i64> = influx
        .written()
        .iter()
        .flat_map(|b| b.points().to_vec())
        .map(|p| p.time_ns)
        .collect();
    let mut sorted = times.clone();
    sorted.sort_unstable();
    assert_eq!(times, sorted);
}
