// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! User transform registry.
//!
//! Measurements that cannot be expressed as a declarative tag/field
//! mapping reference a transform by name. Transforms are compiled into
//! the binary and registered under their name at startup; configuration
//! refers to the name. Unknown names are fatal at startup.
//!
//! The registry also carries two lighter per-measurement hooks:
//! predicates (drop an operation before projection) and coercions
//! (fix up a document in place before projection).

use std::collections::HashMap;

use bson::{DateTime, Document};
use mongoflux_influx::FieldValue;
use thiserror::Error;

use crate::op::{OpKind, Operation};

/// Transform invocation errors. Reported per operation; never fatal for
/// the pipeline.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("{0}")]
    Failed(String),
}

/// The view of an operation handed to a transform.
#[derive(Debug)]
pub struct MongoDocument<'a> {
    /// Document payload.
    pub data: &'a Document,
    /// Full `database.collection` namespace.
    pub namespace: String,
    pub database: &'a str,
    pub collection: &'a str,
    /// `insert`, `update`, `delete`, or `other`.
    pub operation: OpKind,
}

/// One point produced by a transform. The point name comes from the
/// measurement (literal or template), not from the transform.
#[derive(Debug, Clone)]
pub struct TransformedPoint {
    pub tags: Vec<(String, String)>,
    pub fields: Vec<(String, FieldValue)>,
    pub timestamp: DateTime,
}

/// A user transform: one document in, zero or more points out.
pub type TransformFn = fn(&MongoDocument<'_>) -> Result<Vec<TransformedPoint>, TransformError>;

/// An operation-level predicate; `false` drops the operation.
pub type PredicateFn = fn(&Operation) -> bool;

/// A document fix-up applied before projection.
pub type CoerceFn = fn(&mut Document);

/// Registry of compiled-in transforms, predicates, and coercions.
#[derive(Default)]
pub struct TransformRegistry {
    transforms: HashMap<String, TransformFn>,
    predicates: HashMap<String, PredicateFn>,
    coercions: HashMap<String, CoerceFn>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_transform(&mut self, name: impl Into<String>, f: TransformFn) {
        self.transforms.insert(name.into(), f);
    }

    pub fn register_predicate(&mut self, name: impl Into<String>, f: PredicateFn) {
        self.predicates.insert(name.into(), f);
    }

    pub fn register_coercion(&mut self, name: impl Into<String>, f: CoerceFn) {
        self.coercions.insert(name.into(), f);
    }

    pub fn transform(&self, name: &str) -> Option<TransformFn> {
        self.transforms.get(name).copied()
    }

    pub fn predicate(&self, name: &str) -> Option<PredicateFn> {
        self.predicates.get(name).copied()
    }

    pub fn coercion(&self, name: &str) -> Option<CoerceFn> {
        self.coercions.get(name).copied()
    }

    /// True when nothing has been registered.
    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty() && self.predicates.is_empty() && self.coercions.is_empty()
    }
}
