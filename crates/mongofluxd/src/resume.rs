// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Resume positions.
//!
//! Two exclusive strategies: a single source timestamp, or a set of
//! opaque change-stream tokens keyed by stream identity. Positions are
//! stored in the pipeline's internal database through the source client.
//!
//! Timestamp commits are funneled through [`ResumeCommitter`], which
//! tracks per-worker watermarks and only ever persists the minimum
//! position any worker could still need. A restart therefore never
//! skips an operation that a slower worker had not flushed, at the cost
//! of replaying a little more of the change log.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use bson::{Bson, Timestamp};
use serde::{Deserialize, Deserializer};
use tracing::info;

use crate::mongo::{SourceClient, SourceError};
use crate::op::{ts_key, ts_next, ts_prev};

/// Which kind of position a run checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResumeStrategy {
    /// Persist the highest flushed source timestamp.
    #[default]
    Timestamp,
    /// Persist change-stream tokens per stream identity.
    Token,
}

impl FromStr for ResumeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "0" => Ok(ResumeStrategy::Timestamp),
            "1" => Ok(ResumeStrategy::Token),
            other => Err(format!("invalid resume strategy: {} (expected 0 or 1)", other)),
        }
    }
}

impl<'de> Deserialize<'de> for ResumeStrategy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            0 => Ok(ResumeStrategy::Timestamp),
            1 => Ok(ResumeStrategy::Token),
            other => Err(serde::de::Error::custom(format!(
                "invalid resume strategy: {} (expected 0 or 1)",
                other
            ))),
        }
    }
}

/// Loads and saves resume positions under a resume name.
pub struct ResumeStore {
    client: Arc<dyn SourceClient>,
    name: String,
}

impl ResumeStore {
    pub fn new(client: Arc<dyn SourceClient>, name: impl Into<String>) -> Self {
        Self {
            client,
            name: name.into(),
        }
    }

    /// The timestamp the change tail starts at (inclusive).
    ///
    /// Replay restarts from the beginning; an explicit
    /// `resume-from-timestamp` wins next; then a stored position resumes
    /// one ordinal past it; otherwise the tail starts at the source head.
    pub async fn starting_timestamp(
        &self,
        resume: bool,
        replay: bool,
        resume_from: i64,
    ) -> Result<Timestamp, SourceError> {
        if replay {
            return Ok(Timestamp { time: 0, increment: 0 });
        }
        if resume_from != 0 {
            return Ok(Timestamp {
                time: resume_from as u32,
                increment: 1,
            });
        }
        if resume {
            if let Some(stored) = self.client.load_resume_timestamp(&self.name).await? {
                let ts = ts_next(stored);
                info!(resume_name = %self.name, "resuming from timestamp {}.{}", ts.time, ts.increment);
                return Ok(ts);
            }
        }
        self.client.head_timestamp().await
    }

    /// The stored change-stream token for a stream identity, if any.
    pub async fn token_for(&self, stream_id: &str) -> Result<Option<Bson>, SourceError> {
        let token = self.client.load_resume_token(&self.name, stream_id).await?;
        if token.is_some() {
            info!(resume_name = %self.name, stream_id, "resuming stream from stored token");
        }
        Ok(token)
    }

    pub async fn save_timestamp(&self, ts: Timestamp) -> Result<(), SourceError> {
        self.client.save_resume_timestamp(&self.name, ts).await
    }

    pub async fn save_tokens(
        &self,
        tokens: &HashMap<String, Bson>,
    ) -> Result<(), SourceError> {
        if tokens.is_empty() {
            return Ok(());
        }
        self.client.save_resume_tokens(&self.name, tokens).await
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct WorkerSlot {
    /// Highest change-tail timestamp accepted by a successful flush and
    /// not yet folded into a saved position.
    flushed: Option<Timestamp>,
    /// Lowest change-tail timestamp sitting in unflushed batches.
    pending_low: Option<Timestamp>,
    /// Highest change-tail timestamp sitting in unflushed batches.
    pending_high: Option<Timestamp>,
}

#[derive(Debug)]
struct CommitterState {
    slots: Vec<WorkerSlot>,
    last_saved: Option<Timestamp>,
}

/// Aggregates per-worker watermarks into one monotonic resume position.
pub struct ResumeCommitter {
    state: parking_lot::Mutex<CommitterState>,
    /// Serializes commit decisions across workers.
    gate: tokio::sync::Mutex<()>,
}

impl ResumeCommitter {
    pub fn new(workers: usize) -> Self {
        Self {
            state: parking_lot::Mutex::new(CommitterState {
                slots: vec![WorkerSlot::default(); workers],
                last_saved: None,
            }),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Record a change-tail operation added to a worker's batches.
    pub fn note_pending(&self, worker: usize, ts: Timestamp) {
        let mut state = self.state.lock();
        let slot = &mut state.slots[worker];
        slot.pending_low = Some(match slot.pending_low {
            Some(low) if ts_key(low) <= ts_key(ts) => low,
            _ => ts,
        });
        slot.pending_high = Some(match slot.pending_high {
            Some(high) if ts_key(high) >= ts_key(ts) => high,
            _ => ts,
        });
    }

    /// Record the outcome of a worker's flush. A successful flush folds
    /// the pending range into the flushed watermark; a failed flush
    /// discards the pending range without advancing it.
    pub fn note_flush(&self, worker: usize, success: bool) {
        let mut state = self.state.lock();
        let slot = &mut state.slots[worker];
        if success {
            if let Some(high) = slot.pending_high {
                slot.flushed = Some(match slot.flushed {
                    Some(f) if ts_key(f) >= ts_key(high) => f,
                    _ => high,
                });
            }
        }
        slot.pending_low = None;
        slot.pending_high = None;
    }

    /// The position that would be committed right now, if any.
    fn committable(state: &CommitterState) -> Option<Timestamp> {
        let mut candidate: Option<Timestamp> = None;
        for slot in &state.slots {
            let bound = match (slot.pending_low, slot.flushed) {
                // A worker with unflushed operations caps the commit
                // just below its oldest pending timestamp.
                (Some(pending), _) => Some(ts_prev(pending)),
                (None, Some(flushed)) => Some(flushed),
                (None, None) => None,
            };
            if let Some(bound) = bound {
                candidate = Some(match candidate {
                    Some(c) if ts_key(c) <= ts_key(bound) => c,
                    _ => bound,
                });
            }
        }

        let candidate = candidate?;
        if candidate.time == 0 {
            return None;
        }
        if let Some(last) = state.last_saved {
            if ts_key(candidate) <= ts_key(last) {
                return None;
            }
        }
        Some(candidate)
    }

    /// Persist the committable position through `store`, if it advanced.
    pub async fn commit(
        &self,
        store: &ResumeStore,
    ) -> Result<Option<Timestamp>, SourceError> {
        let _gate = self.gate.lock().await;

        let candidate = match Self::committable(&self.state.lock()) {
            Some(c) => c,
            None => return Ok(None),
        };

        store.save_timestamp(candidate).await?;

        let mut state = self.state.lock();
        state.last_saved = Some(candidate);
        // Committed watermarks are spent; an idle worker must not pin
        // the position forever.
        for slot in &mut state.slots {
            if let Some(flushed) = slot.flushed {
                if ts_key(flushed) <= ts_key(candidate) {
                    slot.flushed = None;
                }
            }
        }
        Ok(Some(candidate))
    }
}
