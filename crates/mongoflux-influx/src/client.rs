// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HTTP sink client.
//!
//! Speaks the InfluxDB 1.x API: `CREATE DATABASE` via `/query`, Line
//! Protocol writes via `/write?db=&rp=&precision=`. One client is shared
//! by all pipeline workers; reqwest pools the underlying connections.
//!
//! TLS trust comes from either the platform defaults, an extra PEM root
//! certificate, or (for test rigs) certificate verification can be
//! disabled entirely.

use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::batch::PointBatch;

/// Sink client errors.
#[derive(Debug, Error)]
pub enum InfluxError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server rejected request ({status}): {body}")]
    Server { status: u16, body: String },

    #[error("unable to read PEM file {path}: {source}")]
    Pem {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("no certificates parsed from {0}")]
    BadPem(PathBuf),
}

/// Write-side operations the pipeline needs from the sink.
#[async_trait]
pub trait InfluxWrite: Send + Sync {
    /// Create a database. Idempotent on the server side.
    async fn create_database(&self, db: &str) -> Result<(), InfluxError>;

    /// Write a batch of points.
    async fn write(&self, batch: &PointBatch) -> Result<(), InfluxError>;
}

/// Connection settings for [`InfluxClient`].
#[derive(Debug, Clone, Default)]
pub struct InfluxClientConfig {
    /// Base URL, e.g. `http://localhost:8086`.
    pub url: String,
    /// Basic auth user; empty disables auth.
    pub username: String,
    /// Basic auth password.
    pub password: String,
    /// Skip server certificate validation.
    pub skip_verify: bool,
    /// Extra PEM root certificate for the server.
    pub pem_file: Option<PathBuf>,
    /// User-Agent header value.
    pub user_agent: String,
}

/// HTTP client for InfluxDB 1.x.
pub struct InfluxClient {
    http: reqwest::Client,
    url: String,
    username: String,
    password: String,
}

impl InfluxClient {
    /// Build a client, loading TLS trust material if configured.
    pub fn new(config: InfluxClientConfig) -> Result<Self, InfluxError> {
        let mut builder = reqwest::Client::builder().user_agent(config.user_agent.clone());

        if config.skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(path) = &config.pem_file {
            let pem = std::fs::read(path).map_err(|source| InfluxError::Pem {
                path: path.clone(),
                source,
            })?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|_| InfluxError::BadPem(path.clone()))?;
            builder = builder.add_root_certificate(cert);
        }

        Ok(Self {
            http: builder.build()?,
            url: config.url.trim_end_matches('/').to_string(),
            username: config.username,
            password: config.password,
        })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.username.is_empty() {
            req
        } else {
            req.basic_auth(&self.username, Some(&self.password))
        }
    }

    async fn check(resp: reqwest::Response) -> Result<(), InfluxError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(InfluxError::Server {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl InfluxWrite for InfluxClient {
    async fn create_database(&self, db: &str) -> Result<(), InfluxError> {
        debug!(database = db, "ensuring sink database exists");
        let req = self
            .http
            .post(format!("{}/query", self.url))
            .query(&[("q", format!("CREATE DATABASE \"{}\"", db))]);
        let resp = self.authorize(req).send().await?;
        Self::check(resp).await
    }

    async fn write(&self, batch: &PointBatch) -> Result<(), InfluxError> {
        let mut query = vec![
            ("db", batch.database.clone()),
            ("precision", batch.precision.as_str().to_string()),
        ];
        if !batch.retention.is_empty() {
            query.push(("rp", batch.retention.clone()));
        }

        let req = self
            .http
            .post(format!("{}/write", self.url))
            .query(&query)
            .body(batch.to_line_protocol());
        let resp = self.authorize(req).send().await?;
        Self::check(resp).await
    }
}

/// In-memory sink client for tests.
///
/// Records every write and database creation; optionally fails writes to
/// exercise error paths.
#[derive(Default)]
pub struct MockInfluxClient {
    writes: Mutex<Vec<PointBatch>>,
    creates: Mutex<Vec<String>>,
    fail_writes: Mutex<bool>,
}

impl MockInfluxClient {
    /// Create an empty mock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail.
    pub fn fail_writes(&self, fail: bool) {
        *self.fail_writes.lock() = fail;
    }

    /// Batches accepted so far.
    pub fn written(&self) -> Vec<PointBatch> {
        self.writes.lock().clone()
    }

    /// Total points accepted so far.
    pub fn written_points(&self) -> usize {
        self.writes.lock().iter().map(PointBatch::len).sum()
    }

    /// Databases passed to `create_database`, in call order.
    pub fn created_databases(&self) -> Vec<String> {
        self.creates.lock().clone()
    }
}

#[async_trait]
impl InfluxWrite for MockInfluxClient {
    async fn create_database(&self, db: &str) -> Result<(), InfluxError> {
        self.creates.lock().push(db.to_string());
        Ok(())
    }

    async fn write(&self, batch: &PointBatch) -> Result<(), InfluxError> {
        if *self.fail_writes.lock() {
            return Err(InfluxError::Server {
                status: 500,
                body: "mock write failure".into(),
            });
        }
        self.writes.lock().push(batch.clone());
        Ok(())
    }
}
