// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! mongofluxd
//!
//! Continuous replication from MongoDB into InfluxDB. The pipeline
//! fuses a backfill scan and the change tail into one operation stream,
//! projects documents into tagged time-series points per configured
//! measurement, batches and flushes them to the sink, and durably
//! checkpoints a resume position so a restart neither loses nor
//! re-delivers committed events.
//!
//! # Architecture
//!
//! ```text
//! MongoDB --> IngestionSource --> worker pool --> projection --> batches
//!                 |                   |                             |
//!                 '-- resume store <--'                   InfluxDB /write
//! ```
//!
//! See the `mongofluxd` binary for the lifecycle controller.

pub mod config;
pub mod measurement;
pub mod mongo;
pub mod op;
pub mod projection;
pub mod resume;
pub mod source;
pub mod template;
pub mod transform;
pub mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Product name; also the internal bookkeeping database on the source.
pub const NAME: &str = "mongofluxd";

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Process-wide sticky failure flag.
///
/// Recoverable errors (failed batch writes, failed checkpoints, source
/// stream errors) mark the run as failed without stopping it; the
/// process then exits non-zero at shutdown.
#[derive(Debug, Clone, Default)]
pub struct RunStatus {
    failed: Arc<AtomicBool>,
}

impl RunStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the run as failed. Irreversible.
    pub fn fail(&self) {
        self.failed.store(true, Ordering::Relaxed);
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    /// The process exit code for this run.
    pub fn exit_code(&self) -> i32 {
        i32::from(self.has_failed())
    }
}
