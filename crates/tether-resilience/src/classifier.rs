//! Error classification
//!
//! Maps a raw [`OperationError`] to an [`ErrorKind`] plus a retry
//! recommendation. A circuit-open signal always classifies as
//! `DependencyUnavailable` and is never folded into `Transient`: treating a
//! refused call as a blip is what turns an outage into a spawn loop.

use regex::Regex;
use std::sync::OnceLock;
use tether_core::{Classification, ErrorKind, OperationError};
use tracing::warn;

/// Message heuristics; a pattern that failed to compile simply never matches
struct MessagePatterns {
    circuit_open: Option<Regex>,
    auth: Option<Regex>,
    rate_limited: Option<Regex>,
    timeout: Option<Regex>,
    transient: Option<Regex>,
}

const CIRCUIT_OPEN: &str = r"(?i)circuit\s+(breaker\s+)?(is\s+)?open";
const AUTH: &str =
    r"(?i)(\b401\b|\b403\b|unauthori[sz]ed|forbidden|invalid api key|authentication|permission denied)";
const RATE_LIMITED: &str = r"(?i)(\b429\b|rate.?limit|too many requests|quota exceeded|throttl)";
const TIMEOUT: &str = r"(?i)(timed?\s?out|deadline exceeded|\b408\b|\b504\b)";
const TRANSIENT: &str = r"(?i)(connection (reset|refused|closed|aborted)|broken pipe|temporar|unavailable|\b50[0-3]\b|try again|network|unexpected eof)";

fn compile(pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(pattern, error = %e, "classifier pattern rejected");
            None
        }
    }
}

fn patterns() -> &'static MessagePatterns {
    static PATTERNS: OnceLock<MessagePatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| MessagePatterns {
        circuit_open: compile(CIRCUIT_OPEN),
        auth: compile(AUTH),
        rate_limited: compile(RATE_LIMITED),
        timeout: compile(TIMEOUT),
        transient: compile(TRANSIENT),
    })
}

fn matches(pattern: &Option<Regex>, message: &str) -> bool {
    pattern.as_ref().is_some_and(|re| re.is_match(message))
}

/// Stateless classifier for operation failures
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify one failure
    pub fn classify(&self, error: &OperationError) -> Classification {
        match error {
            OperationError::CircuitOpen { .. } => Self::of(ErrorKind::DependencyUnavailable),
            OperationError::Timeout { .. } => Self::of(ErrorKind::Timeout),
            OperationError::RateLimited { retry_after } => Classification {
                kind: ErrorKind::RateLimited,
                retryable: true,
                suggested_delay: *retry_after,
            },
            OperationError::Status { code, message } => Self::classify_status(*code, message),
            OperationError::Connection(_) => Self::of(ErrorKind::Transient),
            OperationError::Auth(_) => Self::of(ErrorKind::Auth),
            OperationError::Fatal(_) => Self::of(ErrorKind::Fatal),
            OperationError::Other(message) => Self::of(Self::kind_from_message(message)),
        }
    }

    /// A body announcing an open circuit wins over the status code: a 503
    /// from an upstream breaker is not a blip
    fn classify_status(code: u16, message: &str) -> Classification {
        if matches(&patterns().circuit_open, message) {
            return Self::of(ErrorKind::DependencyUnavailable);
        }
        let kind = match code {
            401 | 403 => ErrorKind::Auth,
            408 | 504 => ErrorKind::Timeout,
            429 => ErrorKind::RateLimited,
            500..=599 => ErrorKind::Transient,
            // 4xx and anything unexpected: the request itself is wrong
            _ => ErrorKind::Fatal,
        };
        Self::of(kind)
    }

    /// Unrecognised messages are FATAL
    fn kind_from_message(message: &str) -> ErrorKind {
        let p = patterns();
        if matches(&p.circuit_open, message) {
            ErrorKind::DependencyUnavailable
        } else if matches(&p.auth, message) {
            ErrorKind::Auth
        } else if matches(&p.rate_limited, message) {
            ErrorKind::RateLimited
        } else if matches(&p.timeout, message) {
            ErrorKind::Timeout
        } else if matches(&p.transient, message) {
            ErrorKind::Transient
        } else {
            ErrorKind::Fatal
        }
    }

    fn of(kind: ErrorKind) -> Classification {
        Classification {
            kind,
            retryable: kind.as_retryable().is_some(),
            suggested_delay: None,
        }
    }
}
