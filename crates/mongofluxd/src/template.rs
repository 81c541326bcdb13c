// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Point-name templates.
//!
//! Measurement names may be templated over the projected tags and fields
//! and the source document:
//!
//! ```text
//! {{index .Tags "region"}}_metric
//! {{.Doc.kind}}_events
//! ```
//!
//! Two action forms are supported inside `{{ }}`: `index .SCOPE "key"`
//! and `.SCOPE.key`, where SCOPE is `Tags`, `Fields`, or `Doc`. Anything
//! outside actions is literal text.

use bson::{Bson, Document};
use mongoflux_influx::FieldValue;
use thiserror::Error;

/// Template parse and render errors.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template parse error: {0}")]
    Parse(String),

    #[error("template render error: {0}")]
    Render(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Tags,
    Fields,
    Doc,
}

impl Scope {
    fn parse(s: &str) -> Result<Self, TemplateError> {
        match s {
            "Tags" => Ok(Scope::Tags),
            "Fields" => Ok(Scope::Fields),
            "Doc" => Ok(Scope::Doc),
            other => Err(TemplateError::Parse(format!("unknown scope .{}", other))),
        }
    }
}

#[derive(Debug, Clone)]
enum Part {
    Literal(String),
    Lookup { scope: Scope, key: String },
}

/// A compiled point-name template.
#[derive(Debug, Clone)]
pub struct Template {
    parts: Vec<Part>,
}

/// True when the measurement name contains template actions.
pub fn is_template(s: &str) -> bool {
    s.contains("{{")
}

impl Template {
    /// Compile a template string.
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut parts = Vec::new();
        let mut rest = source;

        while let Some(open) = rest.find("{{") {
            if open > 0 {
                parts.push(Part::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 2..];
            let close = after
                .find("}}")
                .ok_or_else(|| TemplateError::Parse(format!("unterminated action in {:?}", source)))?;
            parts.push(parse_action(after[..close].trim())?);
            rest = &after[close + 2..];
        }
        if !rest.is_empty() {
            parts.push(Part::Literal(rest.to_string()));
        }

        Ok(Self { parts })
    }

    /// Render the template against the projected tags and fields and the
    /// source document.
    pub fn render(
        &self,
        tags: &[(String, String)],
        fields: &[(String, FieldValue)],
        doc: &Document,
    ) -> Result<String, TemplateError> {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(s) => out.push_str(s),
                Part::Lookup { scope, key } => match scope {
                    Scope::Tags => {
                        let value = tags
                            .iter()
                            .find(|(k, _)| k == key)
                            .map(|(_, v)| v.clone())
                            .ok_or_else(|| missing("Tags", key))?;
                        out.push_str(&value);
                    }
                    Scope::Fields => {
                        let value = fields
                            .iter()
                            .find(|(k, _)| k == key)
                            .map(|(_, v)| v.clone())
                            .ok_or_else(|| missing("Fields", key))?;
                        out.push_str(&render_field(&value));
                    }
                    Scope::Doc => {
                        let value = doc.get(key).ok_or_else(|| missing("Doc", key))?;
                        out.push_str(&render_bson(key, value)?);
                    }
                },
            }
        }
        Ok(out)
    }
}

/// Parse the inside of a `{{ }}` action.
fn parse_action(action: &str) -> Result<Part, TemplateError> {
    if let Some(rest) = action.strip_prefix("index ") {
        // index .SCOPE "key"
        let rest = rest.trim();
        let (scope, key) = rest
            .split_once(' ')
            .ok_or_else(|| TemplateError::Parse(format!("malformed index action: {}", action)))?;
        let scope = Scope::parse(scope.trim().strip_prefix('.').ok_or_else(|| {
            TemplateError::Parse(format!("index scope must start with '.': {}", action))
        })?)?;
        let key = key.trim();
        let key = key
            .strip_prefix('"')
            .and_then(|k| k.strip_suffix('"'))
            .ok_or_else(|| TemplateError::Parse(format!("index key must be quoted: {}", action)))?;
        return Ok(Part::Lookup {
            scope,
            key: key.to_string(),
        });
    }

    // .SCOPE.key
    if let Some(rest) = action.strip_prefix('.') {
        if let Some((scope, key)) = rest.split_once('.') {
            return Ok(Part::Lookup {
                scope: Scope::parse(scope)?,
                key: key.to_string(),
            });
        }
    }

    Err(TemplateError::Parse(format!("unsupported action: {}", action)))
}

fn missing(scope: &str, key: &str) -> TemplateError {
    TemplateError::Render(format!("{} has no entry {:?}", scope, key))
}

fn render_field(value: &FieldValue) -> String {
    match value {
        FieldValue::String(s) => s.clone(),
        FieldValue::Integer(i) => i.to_string(),
        FieldValue::Float(f) => f.to_string(),
        FieldValue::Boolean(b) => b.to_string(),
    }
}

fn render_bson(key: &str, value: &Bson) -> Result<String, TemplateError> {
    match value {
        Bson::String(s) => Ok(s.clone()),
        Bson::Int32(i) => Ok(i.to_string()),
        Bson::Int64(i) => Ok(i.to_string()),
        Bson::Double(f) => Ok(f.to_string()),
        Bson::Boolean(b) => Ok(b.to_string()),
        other => Err(TemplateError::Render(format!(
            "document value {:?} ({}) cannot be rendered into a name",
            key,
            other.element_type() as u8
        ))),
    }
}
