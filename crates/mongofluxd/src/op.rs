// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ingested change events.
//!
//! An [`Operation`] is one event from the source: a document with its
//! namespace, kind, source timestamp, origin (backfill scan or change
//! tail), and, for change-stream events, a resume cursor.

use std::fmt;
use std::str::FromStr;

use bson::{Bson, Document, Timestamp};

/// A two-part `database.collection` source namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }
}

impl FromStr for Namespace {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => {
                Ok(Self::new(db, coll))
            }
            _ => Err(format!("namespace is not of the form database.collection: {}", s)),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// Kind of change the source reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Insert,
    Update,
    Delete,
    Other,
}

impl OpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Insert => "insert",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
            OpKind::Other => "other",
        }
    }

    /// True for the kinds the pipeline projects.
    pub fn is_insert_or_update(self) -> bool {
        matches!(self, OpKind::Insert | OpKind::Update)
    }
}

/// Which half of the fused stream produced the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpOrigin {
    /// Direct read of a collection; timestamp is the source head at scan time.
    Backfill,
    /// Oplog tail or change stream; timestamp is the event's own.
    ChangeTail,
}

/// Opaque change-stream restart cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeCursor {
    /// Identity of the stream the token belongs to.
    pub stream_id: String,
    /// Opaque token handed back to the server on resume.
    pub token: Bson,
}

/// One ingested change event.
#[derive(Debug, Clone)]
pub struct Operation {
    /// Document identity (`_id`).
    pub id: Bson,
    pub namespace: Namespace,
    pub kind: OpKind,
    /// Source timestamp: seconds plus ordinal within the second.
    pub timestamp: Timestamp,
    /// Document payload.
    pub doc: Document,
    pub origin: OpOrigin,
    /// Present only for change-stream events.
    pub cursor: Option<ResumeCursor>,
}

impl Operation {
    /// True when this operation came from the change tail.
    pub fn is_change_tail(&self) -> bool {
        self.origin == OpOrigin::ChangeTail
    }
}

/// Ordering key for source timestamps.
pub fn ts_key(ts: Timestamp) -> u64 {
    (u64::from(ts.time) << 32) | u64::from(ts.increment)
}

/// Unix nanoseconds for a source timestamp (second resolution).
pub fn ts_to_nanos(ts: Timestamp) -> i64 {
    i64::from(ts.time) * 1_000_000_000
}

/// The timestamp one ordinal after `ts`.
pub fn ts_next(ts: Timestamp) -> Timestamp {
    Timestamp {
        time: ts.time,
        increment: ts.increment + 1,
    }
}

/// The timestamp one ordinal before `ts`.
pub fn ts_prev(ts: Timestamp) -> Timestamp {
    if ts.increment > 0 {
        Timestamp {
            time: ts.time,
            increment: ts.increment - 1,
        }
    } else {
        Timestamp {
            time: ts.time.saturating_sub(1),
            increment: u32::MAX,
        }
    }
}
