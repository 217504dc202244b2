//! Per-kind schema checks and coercion.
//!
//! Every event entering the bus passes through [`validate`] before it
//! can touch application state. Coercions mutate the payload in place;
//! a hard failure drops the event (counted, never propagated).

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use super::{Event, EventKind};

/// Log messages beyond this many characters are truncated and flagged.
pub const MAX_LOG_MESSAGE_CHARS: usize = 5000;

/// Recognized log levels; anything else coerces to INFO.
pub const LOG_LEVELS: &[&str] = &["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL"];

/// Valid phase statuses. Unrecognized statuses are a hard failure
/// because downstream state transitions depend on exact values.
pub const PHASE_STATUSES: &[&str] = &[
    "pending",
    "active",
    "in_progress",
    "completed",
    "error",
    "skipped",
    "interrupted",
];

#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("unrecognized phase status `{0}`")]
    InvalidPhaseStatus(String),
    #[error("field `{0}` is not a non-negative integer")]
    InvalidCount(&'static str),
    #[error("processed_count {processed} exceeds total_count {total}")]
    ProgressOverflow { processed: u64, total: u64 },
    #[error("field `{0}` is not coercible to a boolean")]
    InvalidBool(&'static str),
}

/// Validate and coerce an event's payload in place.
///
/// Unknown kinds pass through with only a timestamp default injected,
/// so unrecognized-but-harmless signals from newer backends are not
/// blocked.
pub fn validate(event: &mut Event) -> Result<(), ValidationError> {
    let arrival = Utc::now();
    match event.kind.clone() {
        EventKind::Log => validate_log(&mut event.payload, arrival),
        kind if kind.is_phase() => validate_phase(&mut event.payload, arrival),
        EventKind::ProgressUpdate => validate_progress(&mut event.payload, arrival),
        EventKind::AgentStatusUpdate => validate_agent_status(&mut event.payload, arrival),
        _ => {
            // gpu_stats, logs_cleared, transport_switch, unknown kinds.
            if let Value::Object(obj) = &mut event.payload {
                normalize_timestamp(obj, arrival);
            }
            Ok(())
        }
    }
}

fn validate_log(payload: &mut Value, arrival: DateTime<Utc>) -> Result<(), ValidationError> {
    let obj = as_object(payload)?;

    let mut message = coerce_string(obj.get("message")).ok_or(ValidationError::MissingField("message"))?;
    if message.chars().count() > MAX_LOG_MESSAGE_CHARS {
        message = message.chars().take(MAX_LOG_MESSAGE_CHARS).collect();
        obj.insert("truncated".into(), Value::Bool(true));
    }
    obj.insert("message".into(), Value::String(message));

    let level = obj
        .get("level")
        .and_then(Value::as_str)
        .map(str::to_uppercase)
        .filter(|l| LOG_LEVELS.contains(&l.as_str()))
        .unwrap_or_else(|| "INFO".to_string());
    obj.insert("level".into(), Value::String(level));

    normalize_timestamp(obj, arrival);
    Ok(())
}

fn validate_phase(payload: &mut Value, arrival: DateTime<Utc>) -> Result<(), ValidationError> {
    let obj = as_object(payload)?;

    let status = obj
        .get("status")
        .and_then(Value::as_str)
        .ok_or(ValidationError::MissingField("status"))?;
    if !PHASE_STATUSES.contains(&status) {
        return Err(ValidationError::InvalidPhaseStatus(status.to_string()));
    }

    validate_counts(obj)?;
    normalize_timestamp(obj, arrival);
    Ok(())
}

fn validate_progress(payload: &mut Value, arrival: DateTime<Utc>) -> Result<(), ValidationError> {
    let obj = as_object(payload)?;
    validate_counts(obj)?;
    normalize_timestamp(obj, arrival);
    Ok(())
}

fn validate_agent_status(payload: &mut Value, arrival: DateTime<Utc>) -> Result<(), ValidationError> {
    let obj = as_object(payload)?;

    let is_running = coerce_bool(obj.get("is_running"))
        .ok_or(ValidationError::InvalidBool("is_running"))?;
    obj.insert("is_running".into(), Value::Bool(is_running));

    if let Some(message) = coerce_string(obj.get("current_phase_message")) {
        obj.insert("current_phase_message".into(), Value::String(message));
    }

    match obj.get("task_id").cloned() {
        Some(Value::Null) => {
            obj.remove("task_id");
        }
        Some(value) => {
            if let Some(id) = coerce_string(Some(&value)) {
                obj.insert("task_id".into(), Value::String(id));
            }
        }
        None => {}
    }

    normalize_timestamp(obj, arrival);
    Ok(())
}

/// Check `processed_count`/`total_count` where present, reject overflow,
/// and derive `percentage` — the transport-supplied value is never
/// trusted.
fn validate_counts(obj: &mut Map<String, Value>) -> Result<(), ValidationError> {
    let processed = match obj.get("processed_count") {
        Some(v) => Some(v.as_u64().ok_or(ValidationError::InvalidCount("processed_count"))?),
        None => None,
    };
    let total = match obj.get("total_count") {
        Some(v) => Some(v.as_u64().ok_or(ValidationError::InvalidCount("total_count"))?),
        None => None,
    };

    obj.remove("percentage");
    if let (Some(processed), Some(total)) = (processed, total) {
        if processed > total {
            return Err(ValidationError::ProgressOverflow { processed, total });
        }
        if total > 0 {
            let percentage = ((processed as f64 / total as f64) * 100.0).round() as u64;
            obj.insert("percentage".into(), Value::from(percentage));
        }
    }
    Ok(())
}

fn as_object(payload: &mut Value) -> Result<&mut Map<String, Value>, ValidationError> {
    payload.as_object_mut().ok_or(ValidationError::NotAnObject)
}

fn coerce_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn coerce_bool(value: Option<&Value>) -> Option<bool> {
    match value? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.to_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Rewrite `timestamp` to RFC3339, defaulting to arrival time when the
/// field is absent or unparseable. Numeric timestamps are read as epoch
/// seconds.
fn normalize_timestamp(obj: &mut Map<String, Value>, arrival: DateTime<Utc>) {
    let parsed = match obj.get("timestamp") {
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok(),
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        _ => None,
    };
    let stamp = parsed.unwrap_or(arrival);
    obj.insert("timestamp".into(), Value::String(stamp.to_rfc3339()));
}
