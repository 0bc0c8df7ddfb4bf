//! `ContentDocument`: one exported object in JSON TML form.
//!
//! A document is a JSON object with an optional top-level `guid` and exactly
//! one content key (`worksheet`, `table`, ...) that names its type. Migration
//! logic treats the body as opaque except for:
//!
//! - the identity `guid`,
//! - the `name` under the content key, and
//! - the reference-bearing field paths declared by its `ContentType`.

use std::fmt::Write as _;

use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::content_type::{ContentType, PathSegment};

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("unknown content type `{0}`")]
    UnknownContentType(String),

    #[error("document is not a JSON object")]
    NotAnObject,

    #[error("document has no content key (expected one of connection, table, view, sql_view, worksheet, answer, liveboard)")]
    MissingContentKey,

    #[error("document has more than one content key: {0}")]
    AmbiguousContentKey(String),

    #[error("document is a `{found}` but a `{expected}` was expected")]
    TypeMismatch {
        expected: ContentType,
        found: ContentType,
    },

    #[error("invalid guid `{0}`")]
    InvalidGuid(String),

    #[error("invalid platform version `{0}`")]
    InvalidVersion(String),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// True when `s` parses as a UUID.
pub fn is_guid(s: &str) -> bool {
    !s.is_empty() && Uuid::parse_str(s).is_ok()
}

/// A GUID-valued field found by the structural scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedReference {
    /// Rendered path, e.g. `worksheet.tables[1].fqn`.
    pub path: String,
    pub value: String,
}

/// What to do with one embedded reference during a rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rewrite {
    Keep,
    Replace(String),
    /// Remove the field, leaving the reference unresolved.
    Clear,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContentDocument {
    content_type: ContentType,
    body: Value,
}

impl ContentDocument {
    /// Build a document from a parsed JSON value, detecting its type from the
    /// content key.
    pub fn from_value(body: Value) -> Result<Self, DocumentError> {
        let obj = body.as_object().ok_or(DocumentError::NotAnObject)?;

        let mut found: Vec<ContentType> = ContentType::ALL
            .into_iter()
            .filter(|t| obj.get(t.as_str()).is_some_and(Value::is_object))
            .collect();
        let content_type = match found.len() {
            0 => return Err(DocumentError::MissingContentKey),
            1 => found.remove(0),
            _ => {
                let keys: Vec<&str> = found.iter().map(|t| t.as_str()).collect();
                return Err(DocumentError::AmbiguousContentKey(keys.join(", ")));
            }
        };

        if let Some(guid) = obj.get("guid") {
            match guid {
                Value::Null => {}
                Value::String(s) if s.is_empty() || is_guid(s) => {}
                other => return Err(DocumentError::InvalidGuid(other.to_string())),
            }
        }

        Ok(Self { content_type, body })
    }

    /// Like `from_value`, but fails unless the document is of `expected` type.
    pub fn from_value_as(expected: ContentType, body: Value) -> Result<Self, DocumentError> {
        let doc = Self::from_value(body)?;
        if doc.content_type != expected {
            return Err(DocumentError::TypeMismatch {
                expected,
                found: doc.content_type,
            });
        }
        Ok(doc)
    }

    pub fn parse(text: &str) -> Result<Self, DocumentError> {
        Self::from_value(serde_json::from_str(text)?)
    }

    /// Assemble a document from its identity and the object under its content key.
    pub fn from_parts(
        content_type: ContentType,
        guid: Option<&str>,
        content: Value,
    ) -> Result<Self, DocumentError> {
        let mut body = Map::new();
        if let Some(guid) = guid {
            body.insert("guid".to_string(), Value::String(guid.to_string()));
        }
        body.insert(content_type.as_str().to_string(), content);
        Self::from_value_as(content_type, Value::Object(body))
    }

    pub fn to_pretty_string(&self) -> Result<String, DocumentError> {
        Ok(serde_json::to_string_pretty(&self.body)?)
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    /// The identity GUID; `None` before the first successful import.
    pub fn guid(&self) -> Option<&str> {
        self.body
            .get("guid")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn set_guid(&mut self, guid: &str) -> Result<(), DocumentError> {
        if !is_guid(guid) {
            return Err(DocumentError::InvalidGuid(guid.to_string()));
        }
        if let Some(obj) = self.body.as_object_mut() {
            obj.insert("guid".to_string(), Value::String(guid.to_string()));
        }
        Ok(())
    }

    pub fn clear_guid(&mut self) {
        if let Some(obj) = self.body.as_object_mut() {
            obj.remove("guid");
        }
    }

    pub fn display_name(&self) -> &str {
        self.content()
            .and_then(|c| c.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    pub fn into_body(self) -> Value {
        self.body
    }

    /// The object under the content key.
    pub fn content(&self) -> Option<&Map<String, Value>> {
        self.body
            .get(self.content_type.as_str())
            .and_then(Value::as_object)
    }

    pub fn content_mut(&mut self) -> Option<&mut Map<String, Value>> {
        let key = self.content_type.as_str();
        self.body.get_mut(key).and_then(Value::as_object_mut)
    }

    // ========================================================================
    // Reference scan
    // ========================================================================

    /// Every GUID reference present in the document, in declaration order.
    pub fn references(&self) -> Vec<EmbeddedReference> {
        let mut out = Vec::new();
        let mut path = String::new();
        for segments in self.content_type.reference_paths() {
            walk(&self.body, segments, &mut path, &mut out);
            path.clear();
        }
        out
    }

    /// Visit every object that *may* hold a reference (the parent of the
    /// leaf field), whether or not the leaf is currently set.
    ///
    /// The callback receives the rendered leaf path, the parent object and
    /// the leaf field name.
    pub fn visit_reference_slots_mut(
        &mut self,
        mut f: impl FnMut(&str, &mut Map<String, Value>, &'static str),
    ) {
        let mut path = String::new();
        for segments in self.content_type.reference_paths() {
            walk_slots_mut(&mut self.body, segments, &mut path, &mut f);
            path.clear();
        }
    }

    /// Apply `f` to every present reference. Returns how many fields changed.
    pub fn rewrite_references(&mut self, mut f: impl FnMut(&EmbeddedReference) -> Rewrite) -> usize {
        let mut touched = 0;
        self.visit_reference_slots_mut(|path, slot, leaf| {
            let Some(current) = slot.get(leaf).and_then(Value::as_str) else {
                return;
            };
            let reference = EmbeddedReference {
                path: path.to_string(),
                value: current.to_string(),
            };
            match f(&reference) {
                Rewrite::Keep => {}
                Rewrite::Replace(value) => {
                    if value != reference.value {
                        slot.insert(leaf.to_string(), Value::String(value));
                        touched += 1;
                    }
                }
                Rewrite::Clear => {
                    slot.remove(leaf);
                    touched += 1;
                }
            }
        });
        touched
    }
}

fn push_field(path: &mut String, name: &str) {
    if !path.is_empty() {
        path.push('.');
    }
    path.push_str(name);
}

fn walk(node: &Value, segments: &[PathSegment], path: &mut String, out: &mut Vec<EmbeddedReference>) {
    match segments {
        [] => {}
        [PathSegment::Field(leaf)] => {
            if let Some(value) = node.get(*leaf).and_then(Value::as_str) {
                let mark = path.len();
                push_field(path, leaf);
                out.push(EmbeddedReference {
                    path: path.clone(),
                    value: value.to_string(),
                });
                path.truncate(mark);
            }
        }
        [PathSegment::Field(name), rest @ ..] => {
            if let Some(child) = node.get(*name) {
                let mark = path.len();
                push_field(path, name);
                walk(child, rest, path, out);
                path.truncate(mark);
            }
        }
        [PathSegment::Each, rest @ ..] => {
            if let Some(items) = node.as_array() {
                for (i, item) in items.iter().enumerate() {
                    let mark = path.len();
                    let _ = write!(path, "[{i}]");
                    walk(item, rest, path, out);
                    path.truncate(mark);
                }
            }
        }
    }
}

fn walk_slots_mut(
    node: &mut Value,
    segments: &[PathSegment],
    path: &mut String,
    f: &mut dyn FnMut(&str, &mut Map<String, Value>, &'static str),
) {
    match segments {
        [] => {}
        [PathSegment::Field(leaf)] => {
            if let Some(slot) = node.as_object_mut() {
                let mark = path.len();
                push_field(path, leaf);
                f(path.as_str(), slot, *leaf);
                path.truncate(mark);
            }
        }
        [PathSegment::Field(name), rest @ ..] => {
            if let Some(child) = node.get_mut(*name) {
                let mark = path.len();
                push_field(path, name);
                walk_slots_mut(child, rest, path, f);
                path.truncate(mark);
            }
        }
        [PathSegment::Each, rest @ ..] => {
            if let Some(items) = node.as_array_mut() {
                for (i, item) in items.iter_mut().enumerate() {
                    let mark = path.len();
                    let _ = write!(path, "[{i}]");
                    walk_slots_mut(item, rest, path, f);
                    path.truncate(mark);
                }
            }
        }
    }
}
