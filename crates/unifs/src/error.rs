//! Error types for Unifs
//!
//! Every backend failure is translated into one [`Error`] so callers can
//! handle not-found, permission, storage, network and validation problems
//! without knowing which backend produced them.
//!
//! Classification works on a backend-neutral [`NativeError`] description
//! (name, code, message, HTTP status). [`map_error`] checks patterns in a
//! fixed precedence order:
//!
//! | Order | Kind | Examples |
//! |-------|------|----------|
//! | 1 | not-found | `ENOENT`, `NoSuchKey`, `NotFound`, HTTP 404 |
//! | 2 | permission | `EACCES`, `EPERM`, `AccessDenied`, HTTP 403 |
//! | 3 | network | `ETIMEDOUT`, `ECONNRESET`, `SlowDown`, `RequestTimeout` |
//! | 4 | validation | `EINVAL`, `ENAMETOOLONG`, `InvalidArgument` |
//! | 5 | storage | `ENOSPC`, `EDQUOT`, `NoSuchBucket`, `EntityTooLarge` |
//! | 6 | other | anything else |
//!
//! Bucket-level codes (`NoSuchBucket`) are never treated as not-found: a
//! missing bucket is a deployment problem, not a missing file.

use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use serde::Serialize;
use std::fmt;
use std::io::ErrorKind as IoErrorKind;
use thiserror::Error;

/// Result type alias using Unifs's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed native error kept as the cause of a taxonomy error.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Unifs error types.
#[derive(Error, Debug)]
pub enum Error {
    /// The path does not exist.
    #[error("no such file or directory: {path}{}", op_suffix(.operation))]
    NotFound {
        path: String,
        operation: Option<String>,
        #[source]
        source: Option<BoxError>,
    },

    /// The backend refused access to the path.
    #[error("permission denied: {path}{}", op_suffix(.operation))]
    PermissionDenied {
        path: String,
        operation: Option<String>,
        #[source]
        source: Option<BoxError>,
    },

    /// Storage-level failure: quota, disk full, bucket missing, wrong entry type.
    #[error("storage error: {message}")]
    Storage {
        message: String,
        code: Option<String>,
        #[source]
        source: Option<BoxError>,
    },

    /// Transient transport failure: timeouts, resets, throttling.
    #[error("network error: {message}")]
    Network {
        message: String,
        code: Option<String>,
        #[source]
        source: Option<BoxError>,
    },

    /// Invalid configuration or arguments.
    #[error("validation error: {message}")]
    Validation {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Unclassified failure.
    #[error("filesystem error: {message}")]
    Other {
        message: String,
        code: Option<String>,
        #[source]
        source: Option<BoxError>,
    },
}

fn op_suffix(operation: &Option<String>) -> String {
    match operation {
        Some(op) => format!(" ({})", op),
        None => String::new(),
    }
}

/// Error category, independent of backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    Storage,
    Network,
    Validation,
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NotFound => "FileNotFoundError",
            ErrorKind::PermissionDenied => "PermissionError",
            ErrorKind::Storage => "StorageError",
            ErrorKind::Network => "NetworkError",
            ErrorKind::Validation => "ValidationError",
            ErrorKind::Other => "FilesystemError",
        };
        f.write_str(name)
    }
}

impl Error {
    /// Create a validation error without a cause.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            source: None,
        }
    }

    /// Create a validation error reporting every collected problem at once.
    pub fn invalid_config(errors: &[String]) -> Self {
        Self::validation(format!("invalid configuration: {}", errors.join("; ")))
    }

    /// Create a not-found error for `path`.
    pub fn not_found(path: impl Into<String>, operation: Option<&str>) -> Self {
        Self::NotFound {
            path: path.into(),
            operation: operation.map(str::to_string),
            source: None,
        }
    }

    /// Create a permission error for `path`.
    pub fn permission_denied(path: impl Into<String>, operation: Option<&str>) -> Self {
        Self::PermissionDenied {
            path: path.into(),
            operation: operation.map(str::to_string),
            source: None,
        }
    }

    /// Create a storage error carrying a POSIX-style or S3 code.
    pub fn storage(message: impl Into<String>, code: &str) -> Self {
        Self::Storage {
            message: message.into(),
            code: Some(code.to_string()),
            source: None,
        }
    }

    /// Create a network timeout error.
    pub fn timeout(operation: &str, path: &str, after_ms: u128) -> Self {
        Self::Network {
            message: format!("{} {} timed out after {}ms", operation, path, after_ms),
            code: Some("ETIMEDOUT".to_string()),
            source: None,
        }
    }

    /// The taxonomy category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Error::Storage { .. } => ErrorKind::Storage,
            Error::Network { .. } => ErrorKind::Network,
            Error::Validation { .. } => ErrorKind::Validation,
            Error::Other { .. } => ErrorKind::Other,
        }
    }

    /// Path the failing operation targeted, when known.
    pub fn path(&self) -> Option<&str> {
        match self {
            Error::NotFound { path, .. } | Error::PermissionDenied { path, .. } => Some(path),
            _ => None,
        }
    }

    /// Operation that failed, when known.
    pub fn operation(&self) -> Option<&str> {
        match self {
            Error::NotFound { operation, .. } | Error::PermissionDenied { operation, .. } => {
                operation.as_deref()
            }
            _ => None,
        }
    }

    /// Backend code (`ENOSPC`, `SlowDown`, `503`, ...) for storage, network
    /// and unclassified errors.
    pub fn code(&self) -> Option<&str> {
        match self {
            Error::Storage { code, .. }
            | Error::Network { code, .. }
            | Error::Other { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Wrap this error for transport through an async I/O stream.
    pub fn into_io(self) -> std::io::Error {
        let kind = match self.kind() {
            ErrorKind::NotFound => IoErrorKind::NotFound,
            ErrorKind::PermissionDenied => IoErrorKind::PermissionDenied,
            ErrorKind::Network => IoErrorKind::TimedOut,
            ErrorKind::Validation => IoErrorKind::InvalidInput,
            ErrorKind::Storage | ErrorKind::Other => IoErrorKind::Other,
        };
        std::io::Error::new(kind, self)
    }

    /// Recover a taxonomy error from a stream's `std::io::Error`.
    ///
    /// Errors that were produced by [`Error::into_io`] are unwrapped; any
    /// other I/O error is classified through [`map_error`].
    pub fn from_io(err: std::io::Error, context: &ErrorContext) -> Self {
        if err.get_ref().is_some_and(|inner| inner.is::<Error>()) {
            if let Some(inner) = err.into_inner() {
                if let Ok(unifs) = inner.downcast::<Error>() {
                    return *unifs;
                }
            }
            return Error::Other {
                message: "stream error".to_string(),
                code: None,
                source: None,
            };
        }
        map_error(err, context)
    }
}

/// Where a failure happened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub path: Option<String>,
    pub operation: Option<String>,
}

impl ErrorContext {
    pub fn new(operation: &str, path: &str) -> Self {
        Self {
            path: Some(path.to_string()),
            operation: Some(operation.to_string()),
        }
    }

    pub fn path(path: &str) -> Self {
        Self {
            path: Some(path.to_string()),
            operation: None,
        }
    }
}

/// Backend-neutral description of a native failure.
#[derive(Debug, Default)]
pub struct NativeError {
    /// Error name, e.g. `ENOENT` or `TimeoutError`.
    pub name: Option<String>,
    /// Backend code, e.g. `NoSuchKey` or `EACCES`.
    pub code: Option<String>,
    pub message: String,
    /// HTTP status for object-store failures.
    pub status: Option<u16>,
    pub source: Option<BoxError>,
}

impl NativeError {
    /// Native error identified only by name.
    pub fn named(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            message: name.to_string(),
            ..Default::default()
        }
    }

    /// Native error identified by code and message.
    pub fn with_code(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.to_string()),
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn caused_by(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.name.iter().chain(self.code.iter()).map(String::as_str)
    }

    fn has_id(&self, ids: &[&str]) -> bool {
        self.identifiers().any(|id| ids.contains(&id))
    }

    /// Message heuristics only apply when the backend gave no name or code.
    fn message_hints(&self, needles: &[&str]) -> bool {
        self.name.is_none() && self.code.is_none() && self.message_has(needles)
    }

    fn message_has(&self, needles: &[&str]) -> bool {
        let lower = self.message.to_ascii_lowercase();
        needles.iter().any(|n| lower.contains(n))
    }

    fn best_code(&self) -> Option<String> {
        self.code
            .clone()
            .or_else(|| self.name.clone())
            .or_else(|| self.status.map(|s| s.to_string()))
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.best_code() {
            Some(code) if code != self.message => write!(f, "{}: {}", code, self.message),
            _ => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for NativeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for NativeError {
    fn from(err: std::io::Error) -> Self {
        let code = errno_name(&err);
        Self {
            name: None,
            code: code.map(str::to_string),
            message: err.to_string(),
            status: None,
            source: Some(Box::new(err)),
        }
    }
}

impl<E> From<SdkError<E, HttpResponse>> for NativeError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    fn from(err: SdkError<E, HttpResponse>) -> Self {
        let status = err.raw_response().map(|r| r.status().as_u16());
        let code = match &err {
            SdkError::TimeoutError(_) => Some("ETIMEDOUT".to_string()),
            SdkError::DispatchFailure(f) if f.is_timeout() => Some("ETIMEDOUT".to_string()),
            SdkError::DispatchFailure(f) if f.is_io() => Some("ECONNRESET".to_string()),
            SdkError::DispatchFailure(_) => Some("ECONNREFUSED".to_string()),
            SdkError::ConstructionFailure(_) => Some("EINVAL".to_string()),
            _ => err.code().map(str::to_string),
        };
        let message = err
            .message()
            .map(str::to_string)
            .unwrap_or_else(|| DisplayErrorContext(&err).to_string());
        Self {
            name: None,
            code,
            message,
            status,
            source: Some(Box::new(err)),
        }
    }
}

/// POSIX-style name for an I/O error.
fn errno_name(err: &std::io::Error) -> Option<&'static str> {
    match err.kind() {
        IoErrorKind::NotFound => Some("ENOENT"),
        IoErrorKind::PermissionDenied => Some("EACCES"),
        IoErrorKind::AlreadyExists => Some("EEXIST"),
        IoErrorKind::NotADirectory => Some("ENOTDIR"),
        IoErrorKind::IsADirectory => Some("EISDIR"),
        IoErrorKind::DirectoryNotEmpty => Some("ENOTEMPTY"),
        IoErrorKind::InvalidInput => Some("EINVAL"),
        IoErrorKind::StorageFull => Some("ENOSPC"),
        IoErrorKind::QuotaExceeded => Some("EDQUOT"),
        IoErrorKind::ReadOnlyFilesystem => Some("EROFS"),
        IoErrorKind::TimedOut => Some("ETIMEDOUT"),
        IoErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
        IoErrorKind::ConnectionReset | IoErrorKind::ConnectionAborted => Some("ECONNRESET"),
        IoErrorKind::BrokenPipe => Some("EPIPE"),
        IoErrorKind::UnexpectedEof => Some("ECONNRESET"),
        _ => None,
    }
}

const NOT_FOUND_IDS: &[&str] = &["ENOENT", "NoSuchKey", "NotFound", "NoSuchUpload"];
const BUCKET_IDS: &[&str] = &["NoSuchBucket"];
const PERMISSION_IDS: &[&str] = &[
    "EACCES",
    "EPERM",
    "AccessDenied",
    "Forbidden",
    "InvalidAccessKeyId",
    "SignatureDoesNotMatch",
    "AllAccessDisabled",
];
const NETWORK_IDS: &[&str] = &[
    "ETIMEDOUT",
    "ECONNREFUSED",
    "ECONNRESET",
    "ENOTFOUND",
    "EAI_AGAIN",
    "EPIPE",
    "EHOSTUNREACH",
    "ENETUNREACH",
    "TimeoutError",
    "NetworkingError",
    "RequestTimeout",
    "RequestTimeTooSkewed",
    "SlowDown",
    "ServiceUnavailable",
    "Throttling",
    "ThrottlingException",
];
const VALIDATION_IDS: &[&str] = &[
    "EINVAL",
    "ENAMETOOLONG",
    "InvalidArgument",
    "InvalidBucketName",
    "KeyTooLongError",
    "InvalidRange",
    "MalformedXML",
    "ValidationError",
];
const STORAGE_IDS: &[&str] = &[
    "ENOSPC",
    "EDQUOT",
    "EROFS",
    "EISDIR",
    "ENOTDIR",
    "ENOTEMPTY",
    "EEXIST",
    "EMFILE",
    "NoSuchBucket",
    "EntityTooLarge",
    "QuotaExceeded",
    "InternalError",
    "BucketAlreadyExists",
];

/// Translate a native backend failure into the taxonomy.
///
/// The native error is kept as the `source` of the result.
pub fn map_error(native: impl Into<NativeError>, context: &ErrorContext) -> Error {
    let native = native.into();
    let path = context.path.clone().unwrap_or_default();
    let operation = context.operation.clone();
    let bucket_level = native.has_id(BUCKET_IDS) || native.message_has(&["bucket does not exist"]);

    if !bucket_level
        && (native.has_id(NOT_FOUND_IDS)
            || native.status == Some(404)
            || native.message_hints(&["no such file", "not found", "does not exist"]))
    {
        return Error::NotFound {
            path,
            operation,
            source: Some(Box::new(native)),
        };
    }

    if native.has_id(PERMISSION_IDS)
        || native.status == Some(403)
        || native.message_hints(&["permission denied", "access denied", "forbidden"])
    {
        return Error::PermissionDenied {
            path,
            operation,
            source: Some(Box::new(native)),
        };
    }

    let message = describe(&native, context);
    let code = native.best_code();

    if native.has_id(NETWORK_IDS)
        || matches!(native.status, Some(408 | 429 | 503))
        || native.message_hints(&["timed out", "timeout", "network", "socket hang up", "connection"])
    {
        return Error::Network {
            message,
            code,
            source: Some(Box::new(native)),
        };
    }

    if native.has_id(VALIDATION_IDS)
        || native.status == Some(400)
        || native.message_hints(&["invalid"])
    {
        return Error::Validation {
            message,
            source: Some(Box::new(native)),
        };
    }

    if bucket_level
        || native.has_id(STORAGE_IDS)
        || matches!(native.status, Some(500..=599))
        || native.message_hints(&["no space", "quota", "disk full"])
    {
        return Error::Storage {
            message,
            code,
            source: Some(Box::new(native)),
        };
    }

    Error::Other {
        message,
        code,
        source: Some(Box::new(native)),
    }
}

fn describe(native: &NativeError, context: &ErrorContext) -> String {
    match (&context.operation, &context.path) {
        (Some(op), Some(path)) => format!("{} {}: {}", op, path, native),
        (None, Some(path)) => format!("{}: {}", path, native),
        (Some(op), None) => format!("{}: {}", op, native),
        (None, None) => native.to_string(),
    }
}
