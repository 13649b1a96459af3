//! Normalizes disconnect payloads into a [`DisconnectCause`] and a message.
//!
//! Transports attach errors in several shapes. A Boom-style payload
//! (`output.statusCode`, `output.payload.{statusCode,error,message}`) can sit
//! at the root, under `error`, or under `lastDisconnect.error`. Extraction is
//! an ordered list of strategies; the first one that yields details wins.

use serde::Serialize;
use serde_json::Value;

use crate::transport::RawDisconnect;

/// Character limit of the fallback JSON dump.
pub const DUMP_LIMIT: usize = 800;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "code")]
pub enum DisconnectCause {
    LoggedOut,
    ConnectionClosed,
    TimedOut,
    BadSession,
    /// The close carried no status code.
    ConnectionLost,
    RestartRequired,
    Unknown(u16),
}

impl DisconnectCause {
    pub fn from_status(code: u16) -> Self {
        match code {
            401 => Self::LoggedOut,
            428 => Self::ConnectionClosed,
            408 => Self::TimedOut,
            500 => Self::BadSession,
            515 => Self::RestartRequired,
            other => Self::Unknown(other),
        }
    }

    /// Wire status for the cause, if it has one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::LoggedOut => Some(401),
            Self::ConnectionClosed => Some(428),
            Self::TimedOut => Some(408),
            Self::BadSession => Some(500),
            Self::RestartRequired => Some(515),
            Self::Unknown(code) => Some(*code),
            Self::ConnectionLost => None,
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct BoomDetails {
    status_code: Option<u16>,
    error: Option<String>,
    message: Option<String>,
}

type Locator = fn(&Value) -> Option<&Value>;

const BOOM_LOCATIONS: &[Locator] = &[at_root, under_error, under_last_disconnect];

fn at_root(value: &Value) -> Option<&Value> {
    Some(value)
}

fn under_error(value: &Value) -> Option<&Value> {
    value.get("error")
}

fn under_last_disconnect(value: &Value) -> Option<&Value> {
    value.pointer("/lastDisconnect/error")
}

fn boom_details(value: &Value) -> Option<BoomDetails> {
    let output = value.get("output").filter(|o| o.is_object())?;
    let payload = output.get("payload");
    let status_code = as_status(output.get("statusCode"))
        .or_else(|| as_status(payload.and_then(|p| p.get("statusCode"))));
    let error = as_str(payload.and_then(|p| p.get("error")));
    let message = as_str(payload.and_then(|p| p.get("message")));

    if status_code.is_none() && error.is_none() && message.is_none() {
        return None;
    }
    Some(BoomDetails {
        status_code,
        error,
        message,
    })
}

fn first_boom(value: &Value) -> Option<BoomDetails> {
    BOOM_LOCATIONS
        .iter()
        .filter_map(|locate| locate(value))
        .find_map(boom_details)
}

fn as_status(value: Option<&Value>) -> Option<u16> {
    value
        .and_then(Value::as_u64)
        .and_then(|n| u16::try_from(n).ok())
        .filter(|n| *n != 0)
}

fn as_str(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_str).map(str::to_owned)
}

/// Status code carried by a disconnect, if any.
pub fn status_code(raw: &RawDisconnect) -> Option<u16> {
    match raw {
        RawDisconnect::Payload(value) => first_boom(value)
            .and_then(|b| b.status_code)
            .or_else(|| as_status(value.get("status"))),
        RawDisconnect::Error { .. } | RawDisconnect::Text(_) => None,
    }
}

pub fn classify(raw: Option<&RawDisconnect>) -> DisconnectCause {
    match raw.and_then(status_code) {
        Some(code) => DisconnectCause::from_status(code),
        None => DisconnectCause::ConnectionLost,
    }
}

/// Human-readable one-liner such as `status=401 Unauthorized Connection Failure`.
pub fn format_error(raw: &RawDisconnect) -> String {
    let value = match raw {
        RawDisconnect::Error { message } => return message.clone(),
        RawDisconnect::Text(text) => return text.clone(),
        RawDisconnect::Payload(value) => value,
    };
    if !value.is_object() {
        return match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
    }

    let boom = first_boom(value);
    let status = boom
        .as_ref()
        .and_then(|b| b.status_code)
        .or_else(|| as_status(value.get("status")));
    let code = match value.get("code") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    let message = [
        boom.as_ref().and_then(|b| b.message.clone()),
        as_str(value.get("message")),
        as_str(value.pointer("/error/message")),
    ]
    .into_iter()
    .flatten()
    .find(|m| !m.trim().is_empty());

    let mut pieces = Vec::new();
    if let Some(status) = status {
        pieces.push(format!("status={status}"));
    }
    if let Some(tag) = boom.and_then(|b| b.error) {
        pieces.push(tag);
    }
    if let Some(message) = message {
        pieces.push(message);
    }
    if let Some(code) = code {
        pieces.push(format!("code={code}"));
    }

    if pieces.is_empty() {
        safe_dump(value, DUMP_LIMIT)
    } else {
        pieces.join(" ")
    }
}

/// Pretty JSON cut to `limit` characters, with `…` appended when cut.
pub fn safe_dump(value: &Value, limit: usize) -> String {
    let raw = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    match raw.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}…", &raw[..idx]),
        None => raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn payload(v: Value) -> RawDisconnect {
        RawDisconnect::Payload(v)
    }

    #[test]
    fn test_cause_mapping() {
        assert_eq!(DisconnectCause::from_status(401), DisconnectCause::LoggedOut);
        assert_eq!(DisconnectCause::from_status(428), DisconnectCause::ConnectionClosed);
        assert_eq!(DisconnectCause::from_status(408), DisconnectCause::TimedOut);
        assert_eq!(DisconnectCause::from_status(500), DisconnectCause::BadSession);
        assert_eq!(DisconnectCause::from_status(515), DisconnectCause::RestartRequired);
        assert_eq!(DisconnectCause::from_status(440), DisconnectCause::Unknown(440));
        assert_eq!(DisconnectCause::Unknown(440).status_code(), Some(440));
        assert_eq!(DisconnectCause::ConnectionLost.status_code(), None);
    }

    #[test]
    fn test_classify_without_code_is_connection_lost() {
        assert_eq!(classify(None), DisconnectCause::ConnectionLost);
        assert_eq!(
            classify(Some(&RawDisconnect::Text("socket hang up".into()))),
            DisconnectCause::ConnectionLost
        );
        assert_eq!(
            classify(Some(&payload(json!({"foo": 1})))),
            DisconnectCause::ConnectionLost
        );
    }

    #[test]
    fn test_status_code_nesting_order() {
        let direct = payload(json!({
            "output": {"statusCode": 401},
            "error": {"output": {"statusCode": 515}},
        }));
        assert_eq!(status_code(&direct), Some(401));

        let nested = payload(json!({"error": {"output": {"statusCode": 515}}}));
        assert_eq!(status_code(&nested), Some(515));

        let deep = payload(json!({
            "lastDisconnect": {"error": {"output": {"payload": {"statusCode": 408}}}}
        }));
        assert_eq!(status_code(&deep), Some(408));

        let bare = payload(json!({"status": 500}));
        assert_eq!(classify(Some(&bare)), DisconnectCause::BadSession);
    }

    #[test]
    fn test_format_boom_payload() {
        let raw = payload(json!({
            "output": {
                "statusCode": 401,
                "payload": {"error": "Unauthorized", "message": "Connection Failure"}
            },
            "code": "E_AUTH",
        }));
        assert_eq!(
            format_error(&raw),
            "status=401 Unauthorized Connection Failure code=E_AUTH"
        );
    }

    #[test]
    fn test_format_message_fallbacks() {
        let raw = payload(json!({"message": "  ", "error": {"message": "stream errored"}}));
        assert_eq!(format_error(&raw), "stream errored");

        let err = RawDisconnect::Error {
            message: "read ECONNRESET".into(),
        };
        assert_eq!(format_error(&err), "read ECONNRESET");
    }

    #[test]
    fn test_format_falls_back_to_dump() {
        let raw = payload(json!({"weird": true}));
        assert_eq!(format_error(&raw), "{\n  \"weird\": true\n}");
    }

    #[test]
    fn test_safe_dump_truncates_on_char_boundary() {
        let value = json!({ "blob": "é".repeat(2000) });
        let dumped = safe_dump(&value, DUMP_LIMIT);
        assert!(dumped.ends_with('…'));
        assert_eq!(dumped.chars().count(), DUMP_LIMIT + 1);

        let small = json!({"a": 1});
        assert!(!safe_dump(&small, DUMP_LIMIT).ends_with('…'));
    }
}
