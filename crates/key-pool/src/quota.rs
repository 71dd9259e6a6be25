//! Quota detection for upstream API responses
//!
//! The YouTube Data API signals a spent daily quota with 403 (`quotaExceeded`,
//! `dailyLimitExceeded`) and per-minute limits with 429. Both mean the key is
//! unusable for the rest of the run, so both rotate.

use metadata_source::{ErrorClassification, SourceError};

/// Body fragments that mark a quota failure regardless of status code.
const QUOTA_PATTERNS: &[&str] = &["quota", "exceeded"];

/// Classify a free-form error message by keyword.
pub fn classify_message(message: &str) -> ErrorClassification {
    let lower = message.to_lowercase();
    for pattern in QUOTA_PATTERNS {
        if lower.contains(pattern) {
            return ErrorClassification::QuotaExceeded;
        }
    }
    ErrorClassification::Transient
}

/// Classify an upstream error by HTTP status and response body.
///
/// 429 and 403 are always quota failures. Any other status is a quota failure
/// only when the body mentions quota; otherwise it is Transient.
pub fn classify_status(status: u16, body: &str) -> ErrorClassification {
    match status {
        429 | 403 => ErrorClassification::QuotaExceeded,
        _ => classify_message(body),
    }
}

/// Classify a `SourceError`. Transport and parse failures never rotate.
pub fn classify_error(error: &SourceError) -> ErrorClassification {
    match error {
        SourceError::Status { status, body } => classify_status(*status, body),
        SourceError::Transport(_) | SourceError::Malformed(_) => ErrorClassification::Transient,
    }
}
