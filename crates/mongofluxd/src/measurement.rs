// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Compiled measurement definitions.
//!
//! A [`Measurement`] is the immutable, resolved form of one
//! `[[measurement]]` table: defaults applied, namespaces parsed, the
//! name template compiled, and transform hooks resolved against the
//! registry. Built once at startup and shared read-only by all workers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use mongoflux_influx::Precision;

use crate::config::{ConfigError, MeasurementConfig};
use crate::op::Namespace;
use crate::template::{self, Template};
use crate::transform::{CoerceFn, PredicateFn, TransformFn, TransformRegistry};

/// One source namespace bound to one sink point schema.
#[derive(Debug)]
pub struct Measurement {
    /// Effective source namespace (the view when one is configured).
    pub namespace: String,
    /// Alternate namespace read back by identity on change-tail events.
    pub view: Option<Namespace>,
    /// Document field holding the point time; `None` uses the operation
    /// timestamp.
    pub timefield: Option<String>,
    /// Retention policy passthrough; empty selects the sink default.
    pub retention: String,
    pub precision: Precision,
    /// Literal point name; ignored when `template` is set.
    pub measure: String,
    pub template: Option<Template>,
    pub database: String,
    /// Source field path to tag name.
    pub tags: HashMap<String, String>,
    /// Source field path to field name.
    pub fields: HashMap<String, String>,
    pub transform: Option<TransformFn>,
    pub predicate: Option<PredicateFn>,
    pub coerce: Option<CoerceFn>,
}

impl Measurement {
    fn build(
        config: &MeasurementConfig,
        registry: &TransformRegistry,
    ) -> Result<Self, ConfigError> {
        let mut effective_ns = config.namespace.clone();
        let mut view = None;
        if let Some(v) = &config.view {
            effective_ns = v.clone();
            view = Some(v.parse::<Namespace>().map_err(ConfigError::Invalid)?);
        }
        let parsed: Namespace = effective_ns.parse().map_err(ConfigError::Invalid)?;

        let database = match &config.database {
            Some(db) if !db.is_empty() => db.clone(),
            _ => parsed.database.clone(),
        };
        let measure = match &config.measure {
            Some(m) if !m.is_empty() => m.clone(),
            _ => parsed.collection.clone(),
        };
        let template = if template::is_template(&measure) {
            Some(Template::parse(&measure).map_err(|e| {
                ConfigError::Invalid(format!("measure for {}: {}", config.namespace, e))
            })?)
        } else {
            None
        };

        let precision = config
            .precision
            .as_deref()
            .unwrap_or("s")
            .parse::<Precision>()
            .map_err(ConfigError::Invalid)?;

        let transform = match &config.transform {
            Some(name) => Some(registry.transform(name).ok_or_else(|| {
                ConfigError::Invalid(format!("unknown transform {:?}", name))
            })?),
            None => None,
        };
        let predicate = match &config.filter {
            Some(name) => Some(registry.predicate(name).ok_or_else(|| {
                ConfigError::Invalid(format!("unknown filter predicate {:?}", name))
            })?),
            None => None,
        };
        let coerce = match &config.coerce {
            Some(name) => Some(registry.coercion(name).ok_or_else(|| {
                ConfigError::Invalid(format!("unknown coercion {:?}", name))
            })?),
            None => None,
        };

        let fields = parse_mappings(&config.fields);
        if transform.is_none() && fields.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "measurement {} needs at least one field or a transform",
                config.namespace
            )));
        }

        Ok(Self {
            namespace: effective_ns,
            view,
            timefield: config.timefield.clone().filter(|t| !t.is_empty()),
            retention: config.retention.clone().unwrap_or_default(),
            precision,
            measure,
            template,
            database,
            tags: parse_mappings(&config.tags),
            fields,
            transform,
            predicate,
            coerce,
        })
    }
}

/// Split `source[:target]` mapping entries; a missing target maps the
/// source path to itself.
fn parse_mappings(entries: &[String]) -> HashMap<String, String> {
    entries
        .iter()
        .map(|entry| match entry.split_once(':') {
            Some((src, dst)) => (src.to_string(), dst.to_string()),
            None => (entry.clone(), entry.clone()),
        })
        .collect()
}

/// All measurements, keyed by every namespace that can carry their
/// operations (the configured namespace and the view).
#[derive(Debug)]
pub struct MeasurementSet {
    by_namespace: HashMap<String, Arc<Measurement>>,
    ordered: Vec<Arc<Measurement>>,
    /// Namespaces configured directly (not views); these feed the change
    /// tail.
    tail_namespaces: Vec<Namespace>,
}

impl MeasurementSet {
    /// Compile measurement configs against the transform registry.
    pub fn build(
        configs: &[MeasurementConfig],
        registry: &TransformRegistry,
    ) -> Result<Self, ConfigError> {
        if configs.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one measurement is required".into(),
            ));
        }

        let mut by_namespace = HashMap::new();
        let mut ordered = Vec::new();
        let mut tail_namespaces = Vec::new();

        for config in configs {
            let measurement = Arc::new(Measurement::build(config, registry)?);
            by_namespace.insert(config.namespace.clone(), Arc::clone(&measurement));
            if let Some(view) = &config.view {
                by_namespace.insert(view.clone(), Arc::clone(&measurement));
            }
            tail_namespaces.push(config.namespace.parse().map_err(ConfigError::Invalid)?);
            ordered.push(measurement);
        }

        Ok(Self {
            by_namespace,
            ordered,
            tail_namespaces,
        })
    }

    /// Look up the measurement for an operation's namespace.
    pub fn get(&self, namespace: &str) -> Option<&Arc<Measurement>> {
        self.by_namespace.get(namespace)
    }

    /// Every namespace that may carry operations for a measurement.
    pub fn measured_namespaces(&self) -> HashSet<String> {
        self.by_namespace.keys().cloned().collect()
    }

    /// Namespaces to scan during backfill: the view when configured,
    /// otherwise the measurement namespace.
    pub fn scan_namespaces(&self) -> Vec<Namespace> {
        self.ordered
            .iter()
            .map(|m| {
                m.view
                    .clone()
                    .unwrap_or_else(|| m.namespace.parse().expect("validated at build"))
            })
            .collect()
    }

    /// Namespaces the change tail watches.
    pub fn tail_namespaces(&self) -> &[Namespace] {
        &self.tail_namespaces
    }
}
