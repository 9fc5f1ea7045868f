//! PII redaction for log output and error messages.
//!
//! Redaction is best-effort and defense-in-depth: callers must still keep
//! transcript text out of log attributes. Two layers are applied:
//!
//! 1. Regex patterns over free-form strings (SSN, credit card, email,
//!    US phone, driver's license, `plate:`-tagged tokens).
//! 2. A reserved key set: any field whose key matches (case-insensitive)
//!    is replaced wholesale with `[REDACTED]`.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

lazy_static! {
    // Social Security Numbers
    static ref SSN_REGEX: Regex = Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap();
    static ref SSN_BARE_REGEX: Regex = Regex::new(r"\b\d{9}\b").unwrap();

    // Credit card numbers - grouped and bare 16-digit forms
    static ref CARD_REGEX: Regex =
        Regex::new(r"\b\d{4}[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{4}\b").unwrap();

    // Email addresses - RFC 5322 simplified
    static ref EMAIL_REGEX: Regex =
        Regex::new(r"(?i)\b[A-Z0-9._%+-]+@[A-Z0-9.-]+\.[A-Z]{2,}\b").unwrap();

    // Phone numbers - US formats
    static ref PHONE_REGEX: Regex =
        Regex::new(r"\b\(?[0-9]{3}\)?[-.\s]?[0-9]{3}[-.\s]?[0-9]{4}\b").unwrap();

    // Driver's license - common state patterns
    static ref DL_REGEX: Regex = Regex::new(r"\b[A-Z]\d{7}\b|\b[A-Z]{2}\d{6}\b").unwrap();

    // License plates, only when tagged to limit false positives
    static ref PLATE_REGEX: Regex =
        Regex::new(r"(?i)(plate|license|tag)[:\s]+[A-Z0-9]{2,8}\b").unwrap();
}

const REDACTED: &str = "[REDACTED]";

/// Field keys whose values are never loggable, regardless of content.
const RESERVED_KEYS: &[&str] = &[
    "password",
    "api_key",
    "apikey",
    "token",
    "secret",
    "authorization",
    "auth",
    "credential",
    "transcription",
    "transcript",
    "transcript_text",
    "transcription_text",
    "audio_content",
    "file_content",
    "ssn",
    "social_security",
    "credit_card",
    "card_number",
    "cvv",
    "pin",
];

pub fn is_reserved_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    RESERVED_KEYS.contains(&key.as_str())
}

/// Redact known PII patterns from a string. Idempotent: redacting an
/// already-redacted string returns it unchanged.
pub fn redact(text: &str) -> String {
    let mut out = SSN_REGEX.replace_all(text, "[SSN-REDACTED]").into_owned();
    out = CARD_REGEX.replace_all(&out, "[CARD-REDACTED]").into_owned();
    out = SSN_BARE_REGEX
        .replace_all(&out, "[SSN-REDACTED]")
        .into_owned();
    out = EMAIL_REGEX.replace_all(&out, "[EMAIL-REDACTED]").into_owned();
    out = PHONE_REGEX.replace_all(&out, "[PHONE-REDACTED]").into_owned();
    out = DL_REGEX.replace_all(&out, "[DL-REDACTED]").into_owned();
    out = PLATE_REGEX
        .replace_all(&out, "plate:[PLATE-REDACTED]")
        .into_owned();
    out
}

/// Redact a structured value: reserved keys are dropped wholesale, string
/// leaves run through the pattern pass.
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, inner) in map {
                if is_reserved_key(key) {
                    out.insert(key.clone(), Value::String(REDACTED.to_string()));
                } else {
                    out.insert(key.clone(), redact_value(inner));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        Value::String(s) => Value::String(redact(s)),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redacts_ssn() {
        assert_eq!(redact("ssn is 123-45-6789 ok"), "ssn is [SSN-REDACTED] ok");
    }

    #[test]
    fn redacts_credit_card() {
        let out = redact("card 4532-1488-0343-6467 on file");
        assert!(out.contains("[CARD-REDACTED]"));
        assert!(!out.contains("4532"));
    }

    #[test]
    fn redacts_email_and_phone() {
        let out = redact("reach john.doe@example.com or (555) 123-4567");
        assert!(out.contains("[EMAIL-REDACTED]"));
        assert!(out.contains("[PHONE-REDACTED]"));
        assert!(!out.contains("example.com"));
    }

    #[test]
    fn redacts_tagged_plate() {
        let out = redact("vehicle plate: ABC1234 observed");
        assert!(out.contains("plate:[PLATE-REDACTED]"));
        assert!(!out.contains("ABC1234"));
    }

    #[test]
    fn leaves_clean_text_alone() {
        let text = "job 7f3a completed in 12.4s";
        assert_eq!(redact(text), text);
    }

    #[test]
    fn redaction_is_idempotent() {
        let inputs = [
            "ssn 123-45-6789, card 4532148803436467, a@b.com, (555) 123-4567",
            "plate: XY12AB and DL A1234567",
            "nothing sensitive here",
        ];
        for input in inputs {
            let once = redact(input);
            assert_eq!(redact(&once), once);
        }
    }

    #[test]
    fn reserved_keys_are_case_insensitive() {
        assert!(is_reserved_key("API_KEY"));
        assert!(is_reserved_key("Transcript_Text"));
        assert!(!is_reserved_key("job_id"));
    }

    #[test]
    fn redact_value_masks_reserved_fields_and_scans_strings() {
        let value = json!({
            "api_key": "sk-live-12345",
            "note": "call (555) 123-4567",
            "nested": { "transcript_text": "the whole conversation" },
            "count": 3,
        });

        let out = redact_value(&value);
        assert_eq!(out["api_key"], "[REDACTED]");
        assert_eq!(out["nested"]["transcript_text"], "[REDACTED]");
        assert_eq!(out["count"], 3);
        assert!(out["note"].as_str().unwrap().contains("[PHONE-REDACTED]"));
    }
}
