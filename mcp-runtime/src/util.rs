use chrono::{DateTime, Utc};
use cloudflare_mcp_core::error::codes;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::ToolError;

pub(crate) fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(concat!("cloudflare-mcp/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Stable user identity for a bearer token. The token itself never leaves
/// this function.
pub(crate) fn user_id_for_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    format!("token-{}", &hex::encode(digest)[..24])
}

pub(crate) fn to_pretty_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
}

pub(crate) fn parse_response_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).to_string()))
}

fn validation(key: &str, message: String) -> ToolError {
    ToolError::new(codes::VALIDATION_FAILED, message).with_field(key)
}

pub(crate) fn arg_bool(args: &Map<String, Value>, key: &str, default: bool) -> Result<bool, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(v)) => Ok(*v),
        Some(_) => Err(validation(key, format!("'{key}' must be a boolean"))),
    }
}

pub(crate) fn arg_optional_bool(
    args: &Map<String, Value>,
    key: &str,
) -> Result<Option<bool>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(v)) => Ok(Some(*v)),
        Some(_) => Err(validation(key, format!("'{key}' must be a boolean"))),
    }
}

pub(crate) fn required_string(args: &Map<String, Value>, key: &str) -> Result<String, ToolError> {
    let value = args
        .get(key)
        .ok_or_else(|| validation(key, format!("Missing required field '{key}'")))?;
    match value {
        Value::String(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        Value::String(_) => Err(validation(key, format!("'{key}' must not be empty"))),
        _ => Err(validation(key, format!("'{key}' must be a string"))),
    }
}

pub(crate) fn arg_optional_string(
    args: &Map<String, Value>,
    key: &str,
) -> Result<Option<String>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(v)) if v.trim().is_empty() => Ok(None),
        Some(Value::String(v)) => Ok(Some(v.trim().to_string())),
        Some(_) => Err(validation(key, format!("'{key}' must be a string"))),
    }
}

/// Optional string restricted to `allowed`.
pub(crate) fn arg_optional_enum(
    args: &Map<String, Value>,
    key: &str,
    allowed: &[&str],
) -> Result<Option<String>, ToolError> {
    let Some(value) = arg_optional_string(args, key)? else {
        return Ok(None);
    };
    if allowed.contains(&value.as_str()) {
        Ok(Some(value))
    } else {
        Err(validation(
            key,
            format!("'{key}' must be one of: {}", allowed.join(", ")),
        ))
    }
}

pub(crate) fn arg_optional_u64(
    args: &Map<String, Value>,
    key: &str,
) -> Result<Option<u64>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| validation(key, format!("'{key}' must be an unsigned integer")))
            .map(Some),
        Some(_) => Err(validation(key, format!("'{key}' must be an unsigned integer"))),
    }
}

/// Optional unsigned integer within `min..=max`.
pub(crate) fn arg_optional_u64_in(
    args: &Map<String, Value>,
    key: &str,
    min: u64,
    max: u64,
) -> Result<Option<u64>, ToolError> {
    match arg_optional_u64(args, key)? {
        Some(v) if v < min || v > max => Err(validation(
            key,
            format!("'{key}' must be between {min} and {max}"),
        )),
        other => Ok(other),
    }
}

pub(crate) fn arg_optional_f64_in(
    args: &Map<String, Value>,
    key: &str,
    min: f64,
    max: f64,
) -> Result<Option<f64>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => match n.as_f64() {
            Some(v) if (min..=max).contains(&v) => Ok(Some(v)),
            _ => Err(validation(
                key,
                format!("'{key}' must be a number between {min} and {max}"),
            )),
        },
        Some(_) => Err(validation(key, format!("'{key}' must be a number"))),
    }
}

pub(crate) fn arg_optional_string_array(
    args: &Map<String, Value>,
    key: &str,
) -> Result<Option<Vec<String>>, ToolError> {
    let Some(value) = args.get(key) else {
        return Ok(None);
    };
    if value.is_null() {
        return Ok(None);
    }
    let items = value
        .as_array()
        .ok_or_else(|| validation(key, format!("'{key}' must be an array of strings")))?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let text = item
            .as_str()
            .ok_or_else(|| validation(key, format!("'{key}' items must be strings")))?;
        let normalized = text.trim();
        if !normalized.is_empty() {
            out.push(normalized.to_string());
        }
    }
    Ok(Some(out))
}

pub(crate) fn arg_optional_object(
    args: &Map<String, Value>,
    key: &str,
) -> Result<Option<Map<String, Value>>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map.clone())),
        Some(_) => Err(validation(key, format!("'{key}' must be an object"))),
    }
}

pub(crate) fn arg_optional_datetime(
    args: &Map<String, Value>,
    key: &str,
) -> Result<Option<DateTime<Utc>>, ToolError> {
    let Some(raw) = arg_optional_string(args, key)? else {
        return Ok(None);
    };
    DateTime::parse_from_rfc3339(&raw)
        .map(|parsed| Some(parsed.with_timezone(&Utc)))
        .map_err(|_| {
            validation(
                key,
                format!("'{key}' must be an RFC 3339 timestamp (e.g. 2025-01-31T00:00:00Z)"),
            )
        })
}

pub(crate) fn required_datetime(
    args: &Map<String, Value>,
    key: &str,
) -> Result<DateTime<Utc>, ToolError> {
    arg_optional_datetime(args, key)?
        .ok_or_else(|| validation(key, format!("Missing required field '{key}'")))
}

/// Path segments are interpolated into API URLs; reject anything that could
/// change the path shape.
/// True when `value` can be spliced into an API path as a single segment.
pub(crate) fn is_path_segment(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && value != "."
        && value != ".."
}

pub(crate) fn path_segment(args: &Map<String, Value>, key: &str) -> Result<String, ToolError> {
    let value = required_string(args, key)?;
    if is_path_segment(&value) {
        Ok(value)
    } else {
        Err(validation(
            key,
            format!("'{key}' may only contain letters, digits, '-', '_' and '.'"),
        ))
    }
}

pub(crate) fn push_query(query: &mut Vec<(String, String)>, key: &str, value: Option<impl ToString>) {
    if let Some(value) = value {
        query.push((key.to_string(), value.to_string()));
    }
}
