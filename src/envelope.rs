//! Command envelope normalization
//!
//! Callers may send a command in either of two shapes:
//!
//! ```text
//! A) {"data": {"route": "...", "version": 1, "input": {...}}}
//! B) {"route" | "comando": "...", "version"?: 1, "input" | "payload" | "dados"?: {...}}
//! ```
//!
//! Both are reduced to one canonical [`CommandEnvelope`]. Shape A wins
//! whenever `data` is an object, regardless of any shape-B fields next to it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;

/// Fields a shape-A `data` object must carry.
const REQUIRED_FIELDS: [&str; 3] = ["route", "version", "input"];

/// Aliases accepted for the route in shape B, in priority order.
const ROUTE_ALIASES: [&str; 2] = ["route", "comando"];

/// Aliases accepted for the input mapping in shape B, in priority order.
const INPUT_ALIASES: [&str; 3] = ["input", "payload", "dados"];

/// Version assumed when shape B omits it.
pub const DEFAULT_VERSION: i64 = 1;

/// Canonical command sent upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Upstream route name (never empty)
    pub route: String,
    /// Command version
    pub version: i64,
    /// Command arguments
    pub input: Map<String, Value>,
}

impl CommandEnvelope {
    /// Body posted to the upstream: the envelope wrapped under `data`.
    #[must_use]
    pub fn to_upstream_body(&self) -> Value {
        json!({ "data": self })
    }
}

/// The request body does not describe a valid command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ValidationError(String);

impl ValidationError {
    /// Create a validation error with a caller-facing message
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    fn missing_field(name: &str) -> Self {
        Self(format!("missing field: {name}"))
    }
}

/// Normalize a raw request body into a [`CommandEnvelope`].
pub fn normalize(raw: &Value) -> Result<CommandEnvelope, ValidationError> {
    let Some(body) = raw.as_object() else {
        return Err(ValidationError::new("request body must be a JSON object"));
    };

    if let Some(Value::Object(data)) = body.get("data") {
        return normalize_container(data);
    }

    normalize_flat(body)
}

/// Shape A: every field required, types checked.
fn normalize_container(data: &Map<String, Value>) -> Result<CommandEnvelope, ValidationError> {
    if let Some(missing) = REQUIRED_FIELDS.iter().find(|k| !data.contains_key(**k)) {
        return Err(ValidationError::missing_field(missing));
    }

    let route = match &data["route"] {
        Value::String(s) if !s.is_empty() => s.clone(),
        _ => return Err(ValidationError::new("field 'route' must be a non-empty string")),
    };
    let version = parse_version(&data["version"])?;
    let Value::Object(input) = &data["input"] else {
        return Err(ValidationError::new("field 'input' must be a JSON object"));
    };

    Ok(CommandEnvelope {
        route,
        version,
        input: input.clone(),
    })
}

/// Shape B: aliases, defaults for version and input.
fn normalize_flat(body: &Map<String, Value>) -> Result<CommandEnvelope, ValidationError> {
    let route = match first_present(body, &ROUTE_ALIASES) {
        Some(Value::String(s)) => s.clone(),
        Some(_) => return Err(ValidationError::new("field 'route' must be a string")),
        None => return Err(ValidationError::new("route required")),
    };

    let version = match body.get("version") {
        None | Some(Value::Null) => DEFAULT_VERSION,
        Some(v) => parse_version(v)?,
    };

    let input = match first_present(body, &INPUT_ALIASES) {
        None => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => return Err(ValidationError::new("field 'input' must be a JSON object")),
    };

    Ok(CommandEnvelope {
        route,
        version,
        input,
    })
}

/// First alias whose value is not blank.
fn first_present<'a>(body: &'a Map<String, Value>, aliases: &[&str]) -> Option<&'a Value> {
    aliases
        .iter()
        .filter_map(|k| body.get(*k))
        .find(|v| !is_blank(v))
}

/// Blank values fall through to the next alias.
fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn parse_version(value: &Value) -> Result<i64, ValidationError> {
    value
        .as_i64()
        .ok_or_else(|| ValidationError::new("field 'version' must be an integer"))
}
