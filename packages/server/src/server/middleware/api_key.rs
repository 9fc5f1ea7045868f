//! API-key authentication for admin routes.
//!
//! Keys are compared as SHA-256 digests in constant time. Failed attempts
//! are written to the audit log, which feeds the failed-auth report.

use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::kernel::audit::{Actor, AuditEvent, AuditOutcome};
use crate::server::app::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";

pub struct ApiKeyValidator {
    hashes: Vec<[u8; 32]>,
}

impl ApiKeyValidator {
    pub fn new(keys: &[String]) -> Self {
        let hashes = keys
            .iter()
            .filter(|k| !k.is_empty())
            .map(|k| Sha256::digest(k.as_bytes()).into())
            .collect();
        Self { hashes }
    }

    /// Validate a presented key; on success returns the first 8 hex chars
    /// of its hash for audit attribution.
    pub fn validate(&self, presented: &str) -> Option<String> {
        let digest: [u8; 32] = Sha256::digest(presented.as_bytes()).into();

        let mut matched = false;
        for hash in &self.hashes {
            if constant_time_eq(hash, &digest) {
                matched = true;
            }
        }

        if matched {
            Some(hex::encode(digest)[..8].to_string())
        } else {
            None
        }
    }
}

fn constant_time_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let presented = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    let Some(presented) = presented else {
        audit_auth_failure(&state, user_agent, "missing API key").await;
        return unauthorized("Missing API key");
    };

    let Some(fingerprint) = state.auth.validate(presented) else {
        audit_auth_failure(&state, user_agent, "invalid API key").await;
        return unauthorized("Invalid API key");
    };

    if let Err(limited) = state.limiter.check(&fingerprint) {
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "detail": format!(
                    "Rate limit exceeded. Max {} requests per {}s",
                    limited.limit, limited.window_seconds
                )
            })),
        )
            .into_response();

        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&limited.limit.to_string()) {
            headers.insert("X-RateLimit-Limit", value);
        }
        if let Ok(value) = HeaderValue::from_str(&limited.window_seconds.to_string()) {
            headers.insert("X-RateLimit-Window", value);
        }
        if let Ok(value) = HeaderValue::from_str(&limited.retry_after_seconds.to_string()) {
            headers.insert("Retry-After", value);
        }
        return response;
    }

    next.run(request).await
}

fn unauthorized(detail: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "detail": detail }))).into_response()
}

async fn audit_auth_failure(state: &AppState, user_agent: Option<String>, reason: &str) {
    let event = AuditEvent::new("auth.api_key", "api")
        .actor(Actor {
            user_agent,
            ..Default::default()
        })
        .outcome(AuditOutcome::Failure)
        .reason(reason);
    if let Err(e) = state.audit.log(event).await {
        tracing::error!(error = %e, "failed to audit auth failure");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_configured_keys() {
        let validator = ApiKeyValidator::new(&["alpha".to_string(), "beta".to_string()]);
        assert!(validator.validate("alpha").is_some());
        assert!(validator.validate("beta").is_some());
        assert!(validator.validate("gamma").is_none());
    }

    #[test]
    fn empty_key_set_rejects_everything() {
        let validator = ApiKeyValidator::new(&[]);
        assert!(validator.validate("anything").is_none());
    }

    #[test]
    fn fingerprint_is_stable_hash_prefix() {
        let validator = ApiKeyValidator::new(&["alpha".to_string()]);
        let fp = validator.validate("alpha").unwrap();
        assert_eq!(fp.len(), 8);
        let expected = hex::encode(Sha256::digest(b"alpha"));
        assert_eq!(fp, expected[..8]);
    }

    #[test]
    fn constant_time_eq_matches_semantics() {
        let a = [7u8; 32];
        let mut b = [7u8; 32];
        assert!(constant_time_eq(&a, &b));
        b[31] = 8;
        assert!(!constant_time_eq(&a, &b));
    }
}
