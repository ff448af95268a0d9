//! Command descriptor tree and resolver
//!
//! The tree is a JSON object-of-objects mirroring command paths. A command node
//! carries three sub-objects:
//!
//! ```text
//! scpi_details: { <model_key>: { command_template: "FREQ <f> HZ" } }
//! scpi_inputs:  { <name>: { value: ... } }      (ordered)
//! scpi_outputs: { <name>: { value: ... } }      (ordered, defines response field order)
//! ```
//!
//! Lookups never create nodes; only [`CommandTree::ingest`] does.

use indexmap::IndexMap;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

pub const SCPI_DETAILS: &str = "scpi_details";
pub const SCPI_INPUTS: &str = "scpi_inputs";
pub const SCPI_OUTPUTS: &str = "scpi_outputs";
pub const COMMAND_TEMPLATE: &str = "command_template";

/// Number of trailing path segments after the command's base node:
/// `scpi_details`, the model key and the action marker
pub const TRAILING_SEGMENTS: usize = 3;

/// Ordered name -> declared value
pub type FieldMap = IndexMap<String, Value>;

#[derive(Error, Debug, PartialEq)]
pub enum LookupError {
    #[error("Path segment '{segment}' not found at depth {depth}")]
    MissingSegment { segment: String, depth: usize },

    #[error("Path segment '{segment}' at depth {depth} is not a map")]
    NotAMap { segment: String, depth: usize },

    #[error("Command path needs more than {TRAILING_SEGMENTS} segments, got {0}")]
    PathTooShort(usize),

    #[error("No command template for model '{model}' under '{path}'")]
    MissingTemplate { model: String, path: String },
}

#[derive(Error, Debug, PartialEq)]
pub enum IngestError {
    #[error("Cannot ingest at an empty path")]
    EmptyPath,

    #[error("Refusing to replace map at '{0}' with a non-map value")]
    WouldReplaceMap(String),

    #[error("Repository document root must be an object")]
    RootNotMap,
}

/// Everything needed to build, send and decode one command
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCommand {
    pub base_path: Vec<String>,
    pub model_key: String,
    pub template: String,
    pub inputs: FieldMap,
    /// `None` means no results are expected
    pub outputs: Option<FieldMap>,
}

/// The hierarchical command descriptor store
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandTree {
    root: Map<String, Value>,
}

impl CommandTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree from a whole document
    pub fn from_value(value: Value) -> Result<Self, IngestError> {
        match value {
            Value::Object(root) => Ok(Self { root }),
            _ => Err(IngestError::RootNotMap),
        }
    }

    /// Snapshot the whole document
    pub fn to_value(&self) -> Value {
        Value::Object(self.root.clone())
    }

    pub fn root(&self) -> &Map<String, Value> {
        &self.root
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Write or merge `value` at `path`, creating intermediate maps as needed
    ///
    /// An intermediate segment holding a scalar is replaced by a map. A
    /// non-map value aimed at an existing map is rejected; a map aimed at an
    /// existing map is deep-merged.
    pub fn ingest<S: AsRef<str>>(&mut self, path: &[S], value: Value) -> Result<(), IngestError> {
        let Some((last, parents)) = path.split_last() else {
            return Err(IngestError::EmptyPath);
        };

        let mut node = &mut self.root;
        for segment in parents {
            let entry = node
                .entry(segment.as_ref().to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            node = entry.as_object_mut().ok_or(IngestError::RootNotMap)?;
        }

        let key = last.as_ref();
        if let Some(Value::Object(existing)) = node.get_mut(key) {
            return match value {
                Value::Object(incoming) => {
                    merge_into(existing, incoming, key);
                    Ok(())
                }
                _ => Err(IngestError::WouldReplaceMap(join(path))),
            };
        }

        node.insert(key.to_string(), value);
        Ok(())
    }

    /// Strict traversal; reports the first missing segment
    pub fn lookup<S: AsRef<str>>(&self, path: &[S]) -> Result<&Value, LookupError> {
        // An empty path addresses nothing
        let Some((first, rest)) = path.split_first() else {
            return Err(LookupError::PathTooShort(0));
        };

        let mut current = self
            .root
            .get(first.as_ref())
            .ok_or_else(|| LookupError::MissingSegment {
                segment: first.as_ref().to_string(),
                depth: 0,
            })?;

        for (i, segment) in rest.iter().enumerate() {
            let depth = i + 1;
            let map = current.as_object().ok_or_else(|| LookupError::NotAMap {
                segment: path[depth - 1].as_ref().to_string(),
                depth: depth - 1,
            })?;
            current = map
                .get(segment.as_ref())
                .ok_or_else(|| LookupError::MissingSegment {
                    segment: segment.as_ref().to_string(),
                    depth,
                })?;
        }

        Ok(current)
    }

    /// Resolve a trigger path into template, inputs and outputs for `model_key`
    ///
    /// The base node is reached with all but the last three segments.
    pub fn resolve<S: AsRef<str>>(
        &self,
        path: &[S],
        model_key: &str,
    ) -> Result<ResolvedCommand, LookupError> {
        if path.len() <= TRAILING_SEGMENTS {
            return Err(LookupError::PathTooShort(path.len()));
        }

        let base = &path[..path.len() - TRAILING_SEGMENTS];
        let node = self.lookup(base)?;
        let node = node.as_object().ok_or_else(|| LookupError::NotAMap {
            segment: base[base.len() - 1].as_ref().to_string(),
            depth: base.len() - 1,
        })?;

        let template = node
            .get(SCPI_DETAILS)
            .and_then(|details| details.get(model_key))
            .and_then(|model| model.get(COMMAND_TEMPLATE))
            .and_then(Value::as_str)
            .ok_or_else(|| LookupError::MissingTemplate {
                model: model_key.to_string(),
                path: join(base),
            })?;

        let inputs = node
            .get(SCPI_INPUTS)
            .and_then(Value::as_object)
            .map(field_map)
            .unwrap_or_default();

        let outputs = node
            .get(SCPI_OUTPUTS)
            .and_then(Value::as_object)
            .filter(|outputs| !outputs.is_empty())
            .map(field_map);

        Ok(ResolvedCommand {
            base_path: base.iter().map(|s| s.as_ref().to_string()).collect(),
            model_key: model_key.to_string(),
            template: template.to_string(),
            inputs,
            outputs,
        })
    }
}

/// The model key is the second-to-last segment of a trigger path
pub fn model_key_of<S: AsRef<str>>(path: &[S]) -> Option<&str> {
    path.len()
        .checked_sub(2)
        .and_then(|i| path.get(i))
        .map(|s| s.as_ref())
}

/// Flatten `{name: {value: v}}` into an ordered `name -> v` map
pub fn field_map(fields: &Map<String, Value>) -> FieldMap {
    fields
        .iter()
        .map(|(name, spec)| {
            let value = match spec {
                Value::Object(obj) => obj.get("value").cloned().unwrap_or(Value::Null),
                scalar => scalar.clone(),
            };
            (name.clone(), value)
        })
        .collect()
}

fn merge_into(existing: &mut Map<String, Value>, incoming: Map<String, Value>, at: &str) {
    for (key, value) in incoming {
        match (existing.get_mut(&key), value) {
            (Some(Value::Object(dst)), Value::Object(src)) => merge_into(dst, src, &key),
            (Some(Value::Object(_)), _) => {
                warn!("[YAK] Keeping map at '{}/{}', ignoring non-map value", at, key);
            }
            (_, value) => {
                existing.insert(key, value);
            }
        }
    }
}

fn join<S: AsRef<str>>(path: &[S]) -> String {
    crate::topics::join(path)
}
