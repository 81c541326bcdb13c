// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Point batches.
//!
//! A batch groups points that share a sink destination: database,
//! retention policy, and timestamp precision. One batch is flushed as
//! one `/write` request.

use crate::point::{Point, Precision};

/// An ordered group of points bound for one sink destination.
#[derive(Debug, Clone, PartialEq)]
pub struct PointBatch {
    /// Target database.
    pub database: String,
    /// Retention policy name; empty selects the database default.
    pub retention: String,
    /// Timestamp precision for every point in the batch.
    pub precision: Precision,
    points: Vec<Point>,
}

impl PointBatch {
    /// Create an empty batch for the given destination.
    pub fn new(database: impl Into<String>, retention: impl Into<String>, precision: Precision) -> Self {
        Self {
            database: database.into(),
            retention: retention.into(),
            precision,
            points: Vec::new(),
        }
    }

    /// Append a point.
    pub fn add(&mut self, point: Point) {
        self.points.push(point);
    }

    /// Number of buffered points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True when no points are buffered.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// The buffered points.
    pub fn points(&self) -> &[Point] {
        &self.points
    }

    /// Render the whole batch as a Line Protocol request body.
    pub fn to_line_protocol(&self) -> String {
        let mut body = String::new();
        for (i, point) in self.points.iter().enumerate() {
            if i > 0 {
                body.push('\n');
            }
            point.write_line(&mut body, self.precision);
        }
        body
    }
}
