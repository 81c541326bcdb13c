// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Source database interface.
//!
//! The pipeline talks to MongoDB through the [`SourceClient`] trait:
//! collection scans for backfill, the oplog tail or change streams for
//! incremental events, identity lookups for view resolution, and the
//! resume-position collections. [`MongoSourceClient`] implements it on
//! the official driver; [`MockSourceClient`] is an in-memory stand-in
//! for tests and offline runs.

use std::collections::HashMap;

use async_trait::async_trait;
use bson::{doc, Bson, Document, Timestamp};
use futures_util::StreamExt;
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType};
use mongodb::options::{
    Acknowledgment, ClientOptions, CollectionOptions, CursorType, FullDocumentType, WriteConcern,
};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::op::{Namespace, OpKind, OpOrigin, Operation, ResumeCursor};
use crate::{NAME, VERSION};

/// Collection holding timestamp resume documents.
pub const RESUME_COLLECTION: &str = "resume";
/// Collection holding change-stream token documents.
pub const TOKENS_COLLECTION: &str = "tokens";

/// Source-side errors.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("MongoDB driver error: {0}")]
    Driver(#[from] mongodb::error::Error),

    #[error("malformed change event: {0}")]
    Malformed(String),

    #[error("{0}")]
    Stream(String),
}

/// Options for tailing the oplog.
#[derive(Debug, Clone)]
pub struct TailOptions {
    /// Namespace of the oplog collection.
    pub oplog_ns: Namespace,
    /// Emit entries at or after this timestamp.
    pub start_at: Timestamp,
}

/// Everything the pipeline needs from the source database.
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Round-trip health check.
    async fn ping(&self) -> Result<(), SourceError>;

    /// Newest timestamp in the change log.
    async fn head_timestamp(&self) -> Result<Timestamp, SourceError>;

    /// Last committed timestamp reported by the replica set.
    async fn committed_timestamp(&self) -> Result<Timestamp, SourceError>;

    /// Fetch one document by identity (view resolution, update
    /// materialization).
    async fn find_by_id(
        &self,
        ns: &Namespace,
        id: &Bson,
    ) -> Result<Option<Document>, SourceError>;

    /// Full scan of a namespace; emits backfill operations stamped with
    /// the head timestamp at scan start.
    async fn scan(
        &self,
        ns: &Namespace,
        out: mpsc::Sender<Operation>,
    ) -> Result<(), SourceError>;

    /// Tail the oplog until stopped.
    async fn tail_oplog(
        &self,
        opts: &TailOptions,
        out: mpsc::Sender<Operation>,
        stop: watch::Receiver<bool>,
    ) -> Result<(), SourceError>;

    /// Watch one namespace's change stream until stopped.
    async fn watch_namespace(
        &self,
        ns: &Namespace,
        resume_token: Option<Bson>,
        start_at: Option<Timestamp>,
        out: mpsc::Sender<Operation>,
        stop: watch::Receiver<bool>,
    ) -> Result<(), SourceError>;

    /// Load the stored resume timestamp for a resume name.
    async fn load_resume_timestamp(
        &self,
        name: &str,
    ) -> Result<Option<Timestamp>, SourceError>;

    /// Upsert the resume timestamp for a resume name.
    async fn save_resume_timestamp(
        &self,
        name: &str,
        ts: Timestamp,
    ) -> Result<(), SourceError>;

    /// Load the stored change-stream token for `(name, stream_id)`.
    async fn load_resume_token(
        &self,
        name: &str,
        stream_id: &str,
    ) -> Result<Option<Bson>, SourceError>;

    /// Upsert one token per stream identity.
    async fn save_resume_tokens(
        &self,
        name: &str,
        tokens: &HashMap<String, Bson>,
    ) -> Result<(), SourceError>;
}

/// [`SourceClient`] on the official MongoDB driver.
pub struct MongoSourceClient {
    client: mongodb::Client,
    oplog_ns: Namespace,
    /// Relaxed write concern for resume writes, when configured.
    resume_write_concern: Option<WriteConcern>,
}

impl MongoSourceClient {
    /// Connect and construct. Does not ping; callers ping separately so
    /// the wait can be made signal-interruptible.
    pub async fn connect(
        url: &str,
        oplog_ns: Namespace,
        resume_write_unsafe: bool,
    ) -> Result<Self, SourceError> {
        let mut options = ClientOptions::parse(url).await?;
        options.app_name = Some(format!("{} v{}", NAME, VERSION));
        let client = mongodb::Client::with_options(options)?;

        let resume_write_concern = resume_write_unsafe.then(|| {
            WriteConcern::builder()
                .w(Acknowledgment::Nodes(0))
                .journal(false)
                .build()
        });

        Ok(Self {
            client,
            oplog_ns,
            resume_write_concern,
        })
    }

    fn collection(&self, ns: &Namespace) -> mongodb::Collection<Document> {
        self.client
            .database(&ns.database)
            .collection(&ns.collection)
    }

    /// A collection in the pipeline's internal database, honoring the
    /// relaxed resume write concern when configured.
    fn internal_collection(&self, name: &str) -> mongodb::Collection<Document> {
        match &self.resume_write_concern {
            Some(wc) => self.client.database(NAME).collection_with_options(
                name,
                CollectionOptions::builder().write_concern(wc.clone()).build(),
            ),
            None => self.client.database(NAME).collection(name),
        }
    }

    fn oplog_entry_namespace(entry: &Document) -> Option<Namespace> {
        entry.get_str("ns").ok()?.parse().ok()
    }

    async fn oplog_entry_to_operation(
        &self,
        entry: &Document,
    ) -> Result<Option<Operation>, SourceError> {
        let ns = match Self::oplog_entry_namespace(entry) {
            Some(ns) => ns,
            None => return Ok(None), // command entries and no-ops
        };
        let ts = entry
            .get_timestamp("ts")
            .map_err(|e| SourceError::Malformed(e.to_string()))?;

        let (kind, id, doc) = match entry.get_str("op").unwrap_or_default() {
            "i" => {
                let doc = entry
                    .get_document("o")
                    .map_err(|e| SourceError::Malformed(e.to_string()))?
                    .clone();
                let id = doc.get("_id").cloned().unwrap_or(Bson::Null);
                (OpKind::Insert, id, doc)
            }
            "u" => {
                let id = entry
                    .get_document("o2")
                    .ok()
                    .and_then(|o2| o2.get("_id").cloned())
                    .ok_or_else(|| {
                        SourceError::Malformed("update entry without o2._id".into())
                    })?;
                // The oplog carries a patch; re-read the current document.
                match self.find_by_id(&ns, &id).await? {
                    Some(doc) => (OpKind::Update, id, doc),
                    None => {
                        debug!(namespace = %ns, "updated document vanished before lookup");
                        return Ok(None);
                    }
                }
            }
            "d" => {
                let doc = entry
                    .get_document("o")
                    .map(Document::clone)
                    .unwrap_or_default();
                let id = doc.get("_id").cloned().unwrap_or(Bson::Null);
                (OpKind::Delete, id, doc)
            }
            _ => return Ok(None),
        };

        Ok(Some(Operation {
            id,
            namespace: ns,
            kind,
            timestamp: ts,
            doc,
            origin: OpOrigin::ChangeTail,
            cursor: None,
        }))
    }

    fn change_event_to_operation(
        ns: &Namespace,
        event: ChangeStreamEvent<Document>,
        token: Bson,
    ) -> Option<Operation> {
        let kind = match event.operation_type {
            OperationType::Insert => OpKind::Insert,
            OperationType::Update | OperationType::Replace => OpKind::Update,
            OperationType::Delete => OpKind::Delete,
            _ => OpKind::Other,
        };
        let id = event
            .document_key
            .as_ref()
            .and_then(|k| k.get("_id").cloned())
            .unwrap_or(Bson::Null);
        let doc = event
            .full_document
            .or(event.document_key)
            .unwrap_or_default();
        let timestamp = event.cluster_time.unwrap_or_else(now_timestamp);

        Some(Operation {
            id,
            namespace: ns.clone(),
            kind,
            timestamp,
            doc,
            origin: OpOrigin::ChangeTail,
            cursor: Some(ResumeCursor {
                stream_id: ns.to_string(),
                token,
            }),
        })
    }
}

fn now_timestamp() -> Timestamp {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    Timestamp {
        time: secs as u32,
        increment: 0,
    }
}

#[async_trait]
impl SourceClient for MongoSourceClient {
    async fn ping(&self) -> Result<(), SourceError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await?;
        Ok(())
    }

    async fn head_timestamp(&self) -> Result<Timestamp, SourceError> {
        let newest = self
            .collection(&self.oplog_ns)
            .find_one(doc! {})
            .sort(doc! { "$natural": -1 })
            .await?;
        match newest {
            Some(entry) => entry
                .get_timestamp("ts")
                .map_err(|e| SourceError::Malformed(e.to_string())),
            None => Ok(now_timestamp()),
        }
    }

    async fn committed_timestamp(&self) -> Result<Timestamp, SourceError> {
        let status = self
            .client
            .database("admin")
            .run_command(doc! { "replSetGetStatus": 1 })
            .await?;
        status
            .get_document("optimes")
            .and_then(|o| o.get_document("lastCommittedOpTime"))
            .and_then(|o| o.get_timestamp("ts"))
            .map_err(|e| SourceError::Malformed(format!("replSetGetStatus: {}", e)))
    }

    async fn find_by_id(
        &self,
        ns: &Namespace,
        id: &Bson,
    ) -> Result<Option<Document>, SourceError> {
        Ok(self.collection(ns).find_one(doc! { "_id": id.clone() }).await?)
    }

    async fn scan(
        &self,
        ns: &Namespace,
        out: mpsc::Sender<Operation>,
    ) -> Result<(), SourceError> {
        let scan_ts = self.head_timestamp().await?;
        let mut cursor = self.collection(ns).find(doc! {}).await?;
        while let Some(doc) = cursor.next().await {
            let doc = doc?;
            let op = Operation {
                id: doc.get("_id").cloned().unwrap_or(Bson::Null),
                namespace: ns.clone(),
                kind: OpKind::Insert,
                timestamp: scan_ts,
                doc,
                origin: OpOrigin::Backfill,
                cursor: None,
            };
            if out.send(op).await.is_err() {
                break; // pipeline shut down
            }
        }
        Ok(())
    }

    async fn tail_oplog(
        &self,
        opts: &TailOptions,
        out: mpsc::Sender<Operation>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), SourceError> {
        let filter = doc! { "ts": { "$gte": opts.start_at } };
        let mut cursor = self
            .collection(&opts.oplog_ns)
            .find(filter)
            .cursor_type(CursorType::TailableAwait)
            .no_cursor_timeout(true)
            .await?;

        loop {
            let next = tokio::select! {
                _ = stop.changed() => return Ok(()),
                next = cursor.next() => next,
            };
            let entry = match next {
                Some(entry) => entry?,
                None => return Err(SourceError::Stream("oplog cursor closed".into())),
            };
            if let Some(op) = self.oplog_entry_to_operation(&entry).await? {
                if out.send(op).await.is_err() {
                    return Ok(());
                }
            }
        }
    }

    async fn watch_namespace(
        &self,
        ns: &Namespace,
        resume_token: Option<Bson>,
        start_at: Option<Timestamp>,
        out: mpsc::Sender<Operation>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), SourceError> {
        let collection = self.collection(ns);
        let mut action = collection
            .watch()
            .full_document(FullDocumentType::UpdateLookup);
        if let Some(token) = resume_token {
            let token: mongodb::change_stream::event::ResumeToken = bson::from_bson(token)
                .map_err(|e| SourceError::Malformed(format!("stored resume token: {}", e)))?;
            action = action.resume_after(token);
        } else if let Some(ts) = start_at {
            action = action.start_at_operation_time(ts);
        }
        let mut stream = action.await?;

        loop {
            let next = tokio::select! {
                _ = stop.changed() => return Ok(()),
                next = stream.next() => next,
            };
            let event = match next {
                Some(event) => event?,
                None => return Err(SourceError::Stream(format!("change stream {} closed", ns))),
            };
            let token = bson::to_bson(&event.id)
                .map_err(|e| SourceError::Malformed(format!("resume token: {}", e)))?;
            if let Some(op) = Self::change_event_to_operation(ns, event, token) {
                if out.send(op).await.is_err() {
                    return Ok(());
                }
            }
        }
    }

    async fn load_resume_timestamp(
        &self,
        name: &str,
    ) -> Result<Option<Timestamp>, SourceError> {
        let stored = self
            .internal_collection(RESUME_COLLECTION)
            .find_one(doc! { "_id": name })
            .await?;
        match stored {
            Some(doc) => match doc.get_timestamp("ts") {
                Ok(ts) => Ok(Some(ts)),
                Err(_) => {
                    warn!(resume_name = name, "stored resume document has no timestamp");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn save_resume_timestamp(
        &self,
        name: &str,
        ts: Timestamp,
    ) -> Result<(), SourceError> {
        self.internal_collection(RESUME_COLLECTION)
            .update_one(
                doc! { "_id": name },
                doc! { "$set": { "ts": ts } },
            )
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn load_resume_token(
        &self,
        name: &str,
        stream_id: &str,
    ) -> Result<Option<Bson>, SourceError> {
        let stored = self
            .internal_collection(TOKENS_COLLECTION)
            .find_one(doc! { "resumeName": name, "streamID": stream_id })
            .await?;
        Ok(stored.and_then(|doc| doc.get("token").cloned()))
    }

    async fn save_resume_tokens(
        &self,
        name: &str,
        tokens: &HashMap<String, Bson>,
    ) -> Result<(), SourceError> {
        let collection = self.internal_collection(TOKENS_COLLECTION);
        for (stream_id, token) in tokens {
            collection
                .update_one(
                    doc! { "resumeName": name, "streamID": stream_id },
                    doc! { "$set": {
                        "resumeName": name,
                        "streamID": stream_id,
                        "token": token.clone(),
                    } },
                )
                .upsert(true)
                .await?;
        }
        Ok(())
    }
}

/// In-memory [`SourceClient`] for tests.
///
/// Collections are seeded with documents; the change tail replays a
/// scripted list of operations and then idles until stopped.
pub struct MockSourceClient {
    collections: Mutex<HashMap<String, Vec<Document>>>,
    tail_ops: Mutex<Vec<Operation>>,
    resume_timestamps: Mutex<HashMap<String, Timestamp>>,
    tokens: Mutex<HashMap<(String, String), Bson>>,
    head: Mutex<Timestamp>,
}

impl Default for MockSourceClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSourceClient {
    pub fn new() -> Self {
        Self {
            collections: Mutex::new(HashMap::new()),
            tail_ops: Mutex::new(Vec::new()),
            resume_timestamps: Mutex::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
            head: Mutex::new(Timestamp { time: 0, increment: 0 }),
        }
    }

    /// Seed a document into a namespace (served by scans and lookups).
    pub fn insert_document(&self, ns: &Namespace, doc: Document) {
        self.collections
            .lock()
            .entry(ns.to_string())
            .or_default()
            .push(doc);
    }

    /// Script an operation for the change tail to replay.
    pub fn push_tail_op(&self, op: Operation) {
        self.tail_ops.lock().push(op);
    }

    /// Set the head timestamp reported for scans and resume-from-head.
    pub fn set_head(&self, ts: Timestamp) {
        *self.head.lock() = ts;
    }

    /// The stored resume timestamp, if any.
    pub fn stored_timestamp(&self, name: &str) -> Option<Timestamp> {
        self.resume_timestamps.lock().get(name).copied()
    }

    /// The stored token for a stream, if any.
    pub fn stored_token(&self, name: &str, stream_id: &str) -> Option<Bson> {
        self.tokens
            .lock()
            .get(&(name.to_string(), stream_id.to_string()))
            .cloned()
    }

    async fn drain_tail(
        &self,
        only_ns: Option<&Namespace>,
        out: &mpsc::Sender<Operation>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), SourceError> {
        let ops: Vec<Operation> = {
            let mut tail = self.tail_ops.lock();
            match only_ns {
                None => std::mem::take(&mut *tail),
                Some(ns) => {
                    let (matching, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut *tail)
                        .into_iter()
                        .partition(|op| &op.namespace == ns);
                    *tail = rest;
                    matching
                }
            }
        };
        for op in ops {
            if out.send(op).await.is_err() {
                return Ok(());
            }
        }
        // Idle until the pipeline stops.
        while !*stop.borrow() {
            if stop.changed().await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SourceClient for MockSourceClient {
    async fn ping(&self) -> Result<(), SourceError> {
        Ok(())
    }

    async fn head_timestamp(&self) -> Result<Timestamp, SourceError> {
        Ok(*self.head.lock())
    }

    async fn committed_timestamp(&self) -> Result<Timestamp, SourceError> {
        Ok(*self.head.lock())
    }

    async fn find_by_id(
        &self,
        ns: &Namespace,
        id: &Bson,
    ) -> Result<Option<Document>, SourceError> {
        Ok(self
            .collections
            .lock()
            .get(&ns.to_string())
            .and_then(|docs| docs.iter().find(|d| d.get("_id") == Some(id)).cloned()))
    }

    async fn scan(
        &self,
        ns: &Namespace,
        out: mpsc::Sender<Operation>,
    ) -> Result<(), SourceError> {
        let scan_ts = *self.head.lock();
        let docs = self
            .collections
            .lock()
            .get(&ns.to_string())
            .cloned()
            .unwrap_or_default();
        for doc in docs {
            let op = Operation {
                id: doc.get("_id").cloned().unwrap_or(Bson::Null),
                namespace: ns.clone(),
                kind: OpKind::Insert,
                timestamp: scan_ts,
                doc,
                origin: OpOrigin::Backfill,
                cursor: None,
            };
            if out.send(op).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn tail_oplog(
        &self,
        _opts: &TailOptions,
        out: mpsc::Sender<Operation>,
        stop: watch::Receiver<bool>,
    ) -> Result<(), SourceError> {
        self.drain_tail(None, &out, stop).await
    }

    async fn watch_namespace(
        &self,
        ns: &Namespace,
        _resume_token: Option<Bson>,
        _start_at: Option<Timestamp>,
        out: mpsc::Sender<Operation>,
        stop: watch::Receiver<bool>,
    ) -> Result<(), SourceError> {
        self.drain_tail(Some(ns), &out, stop).await
    }

    async fn load_resume_timestamp(
        &self,
        name: &str,
    ) -> Result<Option<Timestamp>, SourceError> {
        Ok(self.resume_timestamps.lock().get(name).copied())
    }

    async fn save_resume_timestamp(
        &self,
        name: &str,
        ts: Timestamp,
    ) -> Result<(), SourceError> {
        self.resume_timestamps.lock().insert(name.to_string(), ts);
        Ok(())
    }

    async fn load_resume_token(
        &self,
        name: &str,
        stream_id: &str,
    ) -> Result<Option<Bson>, SourceError> {
        Ok(self
            .tokens
            .lock()
            .get(&(name.to_string(), stream_id.to_string()))
            .cloned())
    }

    async fn save_resume_tokens(
        &self,
        name: &str,
        tokens: &HashMap<String, Bson>,
    ) -> Result<(), SourceError> {
        let mut stored = self.tokens.lock();
        for (stream_id, token) in tokens {
            stored.insert((name.to_string(), stream_id.clone()), token.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns() -> Namespace {
        Namespace::new("db", "c")
    }

    #[tokio::test]
    async fn test_mock_scan_emits_backfill_ops() {
        let mock = MockSourceClient::new();
        mock.set_head(Timestamp { time: 100, increment: 0 });
        mock.insert_document(&ns(), doc! { "_id": 1, "v": 1 });
        mock.insert_document(&ns(), doc! { "_id": 2, "v": 2 });

        let (tx, mut rx) = mpsc::channel(16);
        mock.scan(&ns(), tx).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.origin, OpOrigin::Backfill);
        assert_eq!(first.kind, OpKind::Insert);
        assert_eq!(first.timestamp.time, 100);
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_mock_find_by_id() {
        let mock = MockSourceClient::new();
        mock.insert_document(&ns(), doc! { "_id": 7, "v": "x" });

        let found = mock.find_by_id(&ns(), &Bson::Int32(7)).await.unwrap();
        assert_eq!(found.unwrap().get_str("v").unwrap(), "x");

        let missing = mock.find_by_id(&ns(), &Bson::Int32(8)).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_mock_resume_round_trip() {
        let mock = MockSourceClient::new();
        let ts = Timestamp { time: 42, increment: 7 };
        mock.save_resume_timestamp("default", ts).await.unwrap();
        assert_eq!(mock.load_resume_timestamp("default").await.unwrap(), Some(ts));
        assert_eq!(mock.load_resume_timestamp("other").await.unwrap(), None);

        let mut tokens = HashMap::new();
        tokens.insert("db.c".to_string(), Bson::String("tok".into()));
        mock.save_resume_tokens("default", &tokens).await.unwrap();
        assert_eq!(
            mock.load_resume_token("default", "db.c").await.unwrap(),
            Some(Bson::String("tok".into()))
        );
    }

    #[tokio::test]
    async fn test_mock_tail_stops_on_signal() {
        let mock = MockSourceClient::new();
        mock.push_tail_op(Operation {
            id: Bson::Int32(1),
            namespace: ns(),
            kind: OpKind::Insert,
            timestamp: Timestamp { time: 1, increment: 1 },
            doc: doc! { "_id": 1 },
            origin: OpOrigin::ChangeTail,
            cursor: None,
        });

        let (tx, mut rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);
        let opts = TailOptions {
            oplog_ns: Namespace::new("local", "oplog.rs"),
            start_at: Timestamp { time: 0, increment: 0 },
        };

        let handle = tokio::spawn(async move { mock.tail_oplog(&opts, tx, stop_rx).await });

        assert!(rx.recv().await.is_some());
        stop_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        assert!(rx.recv().await.is_none());
    }
}
