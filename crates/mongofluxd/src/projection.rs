// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Projection of source operations into sink points.
//!
//! Two modes per measurement:
//!
//! - **Declarative**: walk the document, flatten nested maps one level
//!   deep into dotted paths, route mapped paths into tags and fields,
//!   and resolve the point time from the operation or a document field.
//! - **Transform**: hand the document to a registered transform and emit
//!   whatever points it returns.
//!
//! Type mismatches on mapped paths are logged and dropped without
//! failing the operation; a missing time field or an empty field set
//! fails the operation with [`ProjectionError::InvalidDocument`].

use bson::Bson;
use mongoflux_influx::{FieldValue, Point};
use thiserror::Error;
use tracing::warn;

use crate::measurement::Measurement;
use crate::op::{ts_to_nanos, Operation};
use crate::template::TemplateError;
use crate::transform::{MongoDocument, TransformError};

/// Per-operation projection failures.
#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("transform failed: {0}")]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// Project one operation into zero or more points.
pub fn project(op: &Operation, m: &Measurement) -> Result<Vec<Point>, ProjectionError> {
    match m.transform {
        Some(transform) => project_transform(op, m, transform),
        None => project_declarative(op, m).map(|p| vec![p]),
    }
}

fn project_transform(
    op: &Operation,
    m: &Measurement,
    transform: crate::transform::TransformFn,
) -> Result<Vec<Point>, ProjectionError> {
    let md = MongoDocument {
        data: &op.doc,
        namespace: op.namespace.to_string(),
        database: &op.namespace.database,
        collection: &op.namespace.collection,
        operation: op.kind,
    };

    let mut points = Vec::new();
    for tp in transform(&md)? {
        if tp.fields.is_empty() {
            return Err(ProjectionError::InvalidDocument(
                "transform produced a point with no fields".into(),
            ));
        }
        let name = match &m.template {
            Some(tpl) => tpl.render(&tp.tags, &tp.fields, &op.doc)?,
            None => m.measure.clone(),
        };
        points.push(Point::new(
            name,
            tp.tags,
            tp.fields,
            tp.timestamp.timestamp_millis() * 1_000_000,
        ));
    }
    Ok(points)
}

fn project_declarative(op: &Operation, m: &Measurement) -> Result<Point, ProjectionError> {
    let mut tags: Vec<(String, String)> = Vec::new();
    let mut fields: Vec<(String, FieldValue)> = Vec::new();
    let mut time_ns: Option<i64> = None;

    if m.timefield.is_none() {
        time_ns = Some(ts_to_nanos(op.timestamp));
    }

    for (key, value) in &op.doc {
        if key == "_id" {
            continue;
        }
        match value {
            Bson::DateTime(dt) => {
                if m.timefield.as_deref() == Some(key.as_str()) {
                    time_ns = Some(dt.timestamp_millis() * 1_000_000);
                }
            }
            Bson::Timestamp(ts) => {
                if m.timefield.as_deref() == Some(key.as_str()) {
                    time_ns = Some(ts_to_nanos(*ts));
                }
            }
            Bson::Document(child) => {
                // Flatten exactly one level; deeper maps and arrays are
                // not reachable as paths.
                for (child_key, child_value) in child {
                    if as_field_value(child_value).is_some() {
                        load_kv(
                            op,
                            m,
                            &format!("{}.{}", key, child_key),
                            child_value,
                            &mut tags,
                            &mut fields,
                        );
                    }
                }
            }
            other => load_kv(op, m, key, other, &mut tags, &mut fields),
        }
    }

    let time_ns = match time_ns {
        Some(t) => t,
        None => {
            let timefield = m.timefield.as_deref().unwrap_or_default();
            let reason = if op.doc.contains_key(timefield) {
                format!("time field {} has an unsupported type", timefield)
            } else {
                format!("time field {} not found in document", timefield)
            };
            return Err(ProjectionError::InvalidDocument(reason));
        }
    };

    if fields.is_empty() {
        return Err(ProjectionError::InvalidDocument(
            "document produced no fields".into(),
        ));
    }

    let name = match &m.template {
        Some(tpl) => tpl.render(&tags, &fields, &op.doc)?,
        None => m.measure.clone(),
    };

    Ok(Point::new(name, tags, fields, time_ns))
}

/// Route one `(path, value)` leaf into the tag or field set, enforcing
/// the value-type rules: tags are strings, fields are primitives.
fn load_kv(
    op: &Operation,
    m: &Measurement,
    path: &str,
    value: &Bson,
    tags: &mut Vec<(String, String)>,
    fields: &mut Vec<(String, FieldValue)>,
) {
    if let Some(name) = m.tags.get(path) {
        match value {
            Bson::String(s) => tags.push((name.clone(), s.clone())),
            other => warn!(
                namespace = %op.namespace,
                path,
                "unsupported type {:?} for tag, value dropped",
                other.element_type()
            ),
        }
    } else if let Some(name) = m.fields.get(path) {
        match as_field_value(value) {
            Some(fv) => fields.push((name.clone(), fv)),
            None => warn!(
                namespace = %op.namespace,
                path,
                "unsupported type {:?} for field, value dropped",
                value.element_type()
            ),
        }
    }
}

/// Acceptable field primitives: string, 32/64-bit integer, double, bool.
fn as_field_value(value: &Bson) -> Option<FieldValue> {
    match value {
        Bson::String(s) => Some(FieldValue::String(s.clone())),
        Bson::Int32(i) => Some(FieldValue::Integer(i64::from(*i))),
        Bson::Int64(i) => Some(FieldValue::Integer(*i)),
        Bson::Double(f) => Some(FieldValue::Float(*f)),
        Bson::Boolean(b) => Some(FieldValue::Boolean(*b)),
        _ => None,
    }
}
