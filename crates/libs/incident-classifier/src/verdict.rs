//! Verdict parsing
//!
//! Vision models answer with a small JSON object, sometimes wrapped in a
//! markdown code fence. Endpoints that proxy a chat-style model wrap that
//! text again (`{"text": "..."}` or `{"content": [{"text": "..."}]}`).

use serde::Deserialize;
use serde_json::Value;

use crate::{Classification, ClassifierError, ThreatLevel};

#[derive(Debug, Deserialize)]
struct RawVerdict {
    #[serde(default)]
    level: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

/// Parse model text into a `Classification`.
///
/// Level defaults to `NORMAL` when missing or unrecognised, reason defaults
/// to `"No reason"`. Text that is not a JSON object is an error.
pub fn parse_verdict(text: &str) -> Result<Classification, ClassifierError> {
    let body = strip_code_fence(text);
    let raw: RawVerdict =
        serde_json::from_str(body).map_err(|e| ClassifierError::Parse(e.to_string()))?;

    let level = raw
        .level
        .as_deref()
        .map(ThreatLevel::parse)
        .unwrap_or(ThreatLevel::Normal);
    let reason = raw
        .reason
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| "No reason".to_string());

    Ok(Classification::new(level, reason))
}

/// Pull a verdict out of an endpoint response body.
///
/// Accepts the verdict object itself, `{"text": "<verdict>"}`,
/// `{"content": [{"text": "<verdict>"}]}`, or bare (possibly fenced) text.
pub fn extract_verdict(body: &str) -> Result<Classification, ClassifierError> {
    let value: Value = match serde_json::from_str(strip_code_fence(body)) {
        Ok(v) => v,
        Err(_) => return parse_verdict(body),
    };

    if value.get("level").is_some() {
        return parse_verdict(&value.to_string());
    }

    if let Some(text) = value.get("text").and_then(Value::as_str) {
        return parse_verdict(text);
    }

    let content_text = value
        .get("content")
        .and_then(Value::as_array)
        .and_then(|blocks| blocks.first())
        .and_then(|block| block.get("text"))
        .and_then(Value::as_str);
    if let Some(text) = content_text {
        return parse_verdict(text);
    }

    Err(ClassifierError::Parse(
        "response carries no verdict".to_string(),
    ))
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // drop the info string ("json") on the opening fence line
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest.trim_start_matches("json"),
    };
    rest.trim_end().trim_end_matches("```").trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_verdict() {
        let v = parse_verdict(r#"{"level": "CRITICAL", "reason": "Knife visible"}"#).unwrap();
        assert_eq!(v.level, ThreatLevel::Critical);
        assert_eq!(v.reason, "Knife visible");
    }

    #[test]
    fn test_parse_fenced_verdict() {
        let text = "```json\n{\"level\": \"dangerous\", \"reason\": \"Crowd pushing\"}\n```";
        let v = parse_verdict(text).unwrap();
        assert_eq!(v.level, ThreatLevel::Dangerous);
        assert_eq!(v.reason, "Crowd pushing");
    }

    #[test]
    fn test_parse_defaults() {
        let v = parse_verdict(r#"{"level": "panic"}"#).unwrap();
        assert_eq!(v.level, ThreatLevel::Normal);
        assert_eq!(v.reason, "No reason");

        let v = parse_verdict("{}").unwrap();
        assert_eq!(v.level, ThreatLevel::Normal);
    }

    #[test]
    fn test_parse_garbage_is_error() {
        assert!(matches!(
            parse_verdict("the platform looks calm"),
            Err(ClassifierError::Parse(_))
        ));
    }

    #[test]
    fn test_extract_from_wrappers() {
        let direct = extract_verdict(r#"{"level":"DANGEROUS","reason":"fight"}"#).unwrap();
        assert_eq!(direct.level, ThreatLevel::Dangerous);

        let text = extract_verdict(r#"{"text":"{\"level\":\"CRITICAL\",\"reason\":\"weapon\"}"}"#)
            .unwrap();
        assert_eq!(text.level, ThreatLevel::Critical);

        let content = extract_verdict(
            r#"{"content":[{"type":"text","text":"```json\n{\"level\":\"NORMAL\",\"reason\":\"quiet\"}\n```"}]}"#,
        )
        .unwrap();
        assert_eq!(content.level, ThreatLevel::Normal);
        assert_eq!(content.reason, "quiet");
    }

    #[test]
    fn test_extract_without_verdict() {
        assert!(extract_verdict(r#"{"id": "msg_1"}"#).is_err());
    }
}
