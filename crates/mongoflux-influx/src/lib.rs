// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! InfluxDB v1 sink support for mongoflux.
//!
//! This crate provides:
//! - Line Protocol point construction with tag/field escaping
//! - Timestamp precision handling (`ns` .. `h`)
//! - Per-namespace point batches with a size-based flush trigger
//! - An HTTP sink client (`/write`, `CREATE DATABASE`) with basic auth
//!   and optional TLS trust material
//!
//! # Overview
//!
//! ```text
//! Point --> PointBatch --> InfluxWrite::write --> InfluxDB /write
//! ```
//!
//! The client speaks the InfluxDB 1.x API: databases and retention
//! policies rather than orgs and buckets.

pub mod batch;
pub mod client;
pub mod point;

pub use batch::PointBatch;
pub use client::{InfluxClient, InfluxClientConfig, InfluxError, InfluxWrite, MockInfluxClient};
pub use point::{FieldValue, Point, Precision};
