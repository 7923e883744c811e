//! Logging infrastructure for Unifs
//!
//! Every adapter emits `tracing` events and, when `debug` is enabled in the
//! configuration, also forwards each line to the configured [`Logger`]
//! callback. The default logger is a no-op owned by each validated config.
//!
//! # Log Levels
//!
//! - **WARN**: Retries, aborted uploads
//! - **DEBUG**: One line per operation (start, finish, failure)
//! - **TRACE**: Individual S3 requests
//!
//! # Security
//!
//! Log lines never carry credentials. S3 request URLs and headers pass
//! through [`redact_url`] and [`redact_header`] first, and paths pass through
//! [`sanitize_for_log`] so a crafted file name cannot inject fake log lines.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

/// Maximum length of a logged value before truncation.
const MAX_VALUE_LENGTH: usize = 200;

/// Query parameters and headers whose values are credentials.
const SENSITIVE_KEYS: &[&str] = &[
    "authorization",
    "x-amz-signature",
    "x-amz-credential",
    "x-amz-security-token",
    "awsaccesskeyid",
    "signature",
];

/// Log severity passed to a [`Logger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(name)
    }
}

/// Caller-supplied log sink.
#[derive(Clone)]
pub struct Logger(Arc<dyn Fn(LogLevel, &str) + Send + Sync>);

impl Logger {
    /// Wrap a callback.
    pub fn new(f: impl Fn(LogLevel, &str) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Logger that drops every line.
    pub fn noop() -> Self {
        Self::new(|_, _| {})
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        (self.0)(level, message)
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::noop()
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Logger(..)")
    }
}

/// Per-handle log emitter: `tracing` always, the callback only in debug mode.
#[derive(Debug, Clone)]
pub struct OperationLog {
    backend: &'static str,
    debug: bool,
    logger: Logger,
}

impl OperationLog {
    pub fn new(backend: &'static str, debug: bool, logger: Logger) -> Self {
        Self {
            backend,
            debug,
            logger,
        }
    }

    pub fn debug(&self, message: &str) {
        tracing::debug!(backend = self.backend, "{}", message);
        if self.debug {
            self.logger
                .log(LogLevel::Debug, &format!("[{}] {}", self.backend, message));
        }
    }

    pub fn trace(&self, message: &str) {
        tracing::trace!(backend = self.backend, "{}", message);
        if self.debug {
            self.logger
                .log(LogLevel::Trace, &format!("[{}] {}", self.backend, message));
        }
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(backend = self.backend, "{}", message);
        self.logger
            .log(LogLevel::Warn, &format!("[{}] {}", self.backend, message));
    }
}

/// Remove credential query parameters from a URL.
///
/// Presigned S3 URLs carry the signature and access key id in the query.
pub fn redact_url(url: &str) -> Cow<'_, str> {
    let Some((base, query)) = url.split_once('?') else {
        return truncate(url);
    };
    let mut changed = false;
    let redacted: Vec<String> = query
        .split('&')
        .map(|pair| {
            let key = pair.split('=').next().unwrap_or("");
            if SENSITIVE_KEYS.contains(&key.to_ascii_lowercase().as_str()) {
                changed = true;
                format!("{}=[REDACTED]", key)
            } else {
                pair.to_string()
            }
        })
        .collect();
    if !changed {
        return truncate(url);
    }
    Cow::Owned(format!("{}?{}", base, redacted.join("&")))
}

/// Redact the value of a credential-bearing header.
pub fn redact_header<'a>(name: &str, value: &'a str) -> Cow<'a, str> {
    if SENSITIVE_KEYS.contains(&name.to_ascii_lowercase().as_str()) {
        Cow::Borrowed("[REDACTED]")
    } else {
        truncate(value)
    }
}

/// Mask a secret keeping only a short prefix, for `Debug` output.
pub fn mask_secret(secret: &str) -> String {
    let prefix: String = secret.chars().take(4).collect();
    if secret.chars().count() <= 8 {
        "[REDACTED]".to_string()
    } else {
        format!("{}…[REDACTED]", prefix)
    }
}

/// Escape control characters so a path cannot forge log lines.
pub fn sanitize_for_log(input: &str) -> String {
    input
        .replace('\n', "\\n")
        .replace('\r', "\\r")
        .replace('\t', "\\t")
        .chars()
        .filter(|c| !c.is_control())
        .collect()
}

/// Truncate a value at a char boundary.
fn truncate(value: &str) -> Cow<'_, str> {
    if value.len() <= MAX_VALUE_LENGTH {
        return Cow::Borrowed(value);
    }
    let mut end = MAX_VALUE_LENGTH;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    Cow::Owned(format!(
        "{}...[truncated {} bytes]",
        &value[..end],
        value.len() - end
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn url_signature_is_redacted() {
        let url = "https://b.s3.amazonaws.com/k?X-Amz-Credential=AKIA123&X-Amz-Signature=abc&partNumber=2";
        let redacted = redact_url(url);
        assert!(!redacted.contains("AKIA123"));
        assert!(!redacted.contains("=abc"));
        assert!(redacted.contains("partNumber=2"));
    }

    #[test]
    fn plain_url_unchanged() {
        let url = "https://b.s3.amazonaws.com/k?list-type=2&prefix=a%2F";
        assert_eq!(redact_url(url).as_ref(), url);
    }

    #[test]
    fn authorization_header_redacted() {
        assert_eq!(
            redact_header("Authorization", "AWS4-HMAC-SHA256 Credential=...").as_ref(),
            "[REDACTED]"
        );
        assert_eq!(redact_header("x-amz-date", "20240101T000000Z").as_ref(), "20240101T000000Z");
    }

    #[test]
    fn secret_masking() {
        assert_eq!(mask_secret("short"), "[REDACTED]");
        let masked = mask_secret("wJalrXUtnFEMI/K7MDENG/bPxRfiCYEXAMPLEKEY");
        assert!(masked.starts_with("wJal"));
        assert!(!masked.contains("EXAMPLEKEY"));
    }

    #[test]
    fn sanitize_escapes_newlines() {
        assert_eq!(sanitize_for_log("a\nb\x07"), "a\\nb");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let long = "é".repeat(150);
        let out = truncate(&long);
        assert!(out.contains("truncated"));
    }

    #[test]
    fn callback_only_receives_debug_lines_in_debug_mode() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let logger = Logger::new(move |level, msg| {
            sink.lock().unwrap().push(format!("{} {}", level, msg));
        });

        OperationLog::new("local", false, logger.clone()).debug("quiet");
        assert!(lines.lock().unwrap().is_empty());

        OperationLog::new("local", true, logger.clone()).debug("loud");
        OperationLog::new("local", false, logger).warn("retrying");
        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "debug [local] loud");
        assert!(lines[1].starts_with("warn"));
    }
}
