//! Backend configuration and validation.
//!
//! Configuration arrives in one of three ways:
//!
//! - typed, as a [`Config`] value built in Rust,
//! - raw, as a `serde_json::Value` shaped `{ type, local?, s3?, common? }`,
//! - from environment variables via [`Config::from_env`].
//!
//! All three end in a [`ValidationResult`]. Validation never panics and never
//! returns `Err`: every problem is collected into `errors` so a misconfigured
//! deployment sees the whole list at once. Only a valid result carries a
//! [`ValidatedConfig`], the single shape adapters consume.
//!
//! # Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | `local.basePath` | process working directory |
//! | `local.createMissingDirs` | `false` |
//! | `s3.forcePathStyle` | `false` |
//! | `s3.prefix` | `""` |
//! | `s3.timeout` / `s3.maxRetries` | inherited from `common` |
//! | `common.timeout` | 30000 ms |
//! | `common.maxRetries` | 3 |
//! | `common.debug` | `false` |
//! | `common.logger` | no-op |

use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::logging_impl::{Logger, mask_secret};

/// Default per-operation timeout: 30 seconds
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Default retry budget
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Maximum allowed timeout (10 minutes)
pub const MAX_TIMEOUT_MS: u64 = 600_000;

/// Maximum allowed retry budget
pub const MAX_RETRIES_LIMIT: u32 = 10;

/// Backend discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendType {
    Local,
    S3,
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendType::Local => f.write_str("local"),
            BackendType::S3 => f.write_str("s3"),
        }
    }
}

impl FromStr for BackendType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(BackendType::Local),
            "s3" => Ok(BackendType::S3),
            other => Err(Error::validation(format!(
                "type must be one of \"local\", \"s3\" (got \"{}\")",
                other
            ))),
        }
    }
}

/// Filesystem configuration.
///
/// Exactly one backend block exists, matching the variant.
#[derive(Debug, Clone)]
pub enum Config {
    Local {
        local: LocalConfig,
        common: CommonConfig,
    },
    S3 {
        s3: S3Config,
        common: CommonConfig,
    },
}

/// Local disk settings.
#[derive(Debug, Clone, Default)]
pub struct LocalConfig {
    pub base_path: Option<PathBuf>,
    pub create_missing_dirs: Option<bool>,
}

/// S3-compatible object store settings.
#[derive(Clone, Default)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub endpoint: Option<String>,
    pub force_path_style: Option<bool>,
    pub prefix: Option<String>,
    /// Milliseconds; inherits `common.timeout` when unset.
    pub timeout: Option<u64>,
    /// Inherits `common.max_retries` when unset.
    pub max_retries: Option<u32>,
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_deref().map(mask_secret),
            )
            .field("session_token", &self.session_token.as_ref().map(|_| "[REDACTED]"))
            .field("endpoint", &self.endpoint)
            .field("force_path_style", &self.force_path_style)
            .field("prefix", &self.prefix)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

/// Settings shared by every backend.
#[derive(Debug, Clone, Default)]
pub struct CommonConfig {
    /// Milliseconds.
    pub timeout: Option<u64>,
    pub max_retries: Option<u32>,
    pub debug: Option<bool>,
    pub logger: Option<Logger>,
}

impl LocalConfig {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: Some(base_path.into()),
            create_missing_dirs: None,
        }
    }

    pub fn create_missing_dirs(mut self, enabled: bool) -> Self {
        self.create_missing_dirs = Some(enabled);
        self
    }
}

impl S3Config {
    pub fn new(bucket: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region: region.into(),
            ..Default::default()
        }
    }

    pub fn credentials(
        mut self,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Self {
        self.access_key_id = Some(access_key_id.into());
        self.secret_access_key = Some(secret_access_key.into());
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn force_path_style(mut self, enabled: bool) -> Self {
        self.force_path_style = Some(enabled);
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }
}

impl CommonConfig {
    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout = Some(ms);
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn debug(mut self, enabled: bool) -> Self {
        self.debug = Some(enabled);
        self
    }

    pub fn logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }
}

/// Configuration with every default applied.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub backend: BackendConfig,
    pub common: ResolvedCommon,
}

/// Backend-specific validated settings.
#[derive(Debug, Clone)]
pub enum BackendConfig {
    Local(ResolvedLocal),
    S3(ResolvedS3),
}

#[derive(Debug, Clone)]
pub struct ResolvedCommon {
    pub timeout: Duration,
    pub max_retries: u32,
    pub debug: bool,
    pub logger: Logger,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLocal {
    pub base_path: PathBuf,
    pub create_missing_dirs: bool,
}

#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedS3 {
    pub bucket: String,
    pub region: String,
    /// Falls back to `AWS_ACCESS_KEY_ID` in the adapter when unset.
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    /// Unset means the AWS endpoint for `region`.
    pub endpoint: Option<String>,
    pub force_path_style: bool,
    pub prefix: String,
    pub timeout: Duration,
    pub max_retries: u32,
}

impl fmt::Debug for ResolvedS3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedS3")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_deref().map(mask_secret),
            )
            .field("endpoint", &self.endpoint)
            .field("force_path_style", &self.force_path_style)
            .field("prefix", &self.prefix)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl ValidatedConfig {
    pub fn backend_type(&self) -> BackendType {
        match self.backend {
            BackendConfig::Local(_) => BackendType::Local,
            BackendConfig::S3(_) => BackendType::S3,
        }
    }
}

/// Outcome of validation.
#[derive(Debug)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    /// Present iff `errors` is empty.
    pub config: Option<ValidatedConfig>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty() && self.config.is_some()
    }

    fn failed(errors: Vec<String>) -> Self {
        Self {
            errors,
            config: None,
        }
    }

    /// Convert into a `Result`, joining all messages into one validation error.
    pub fn into_result(self) -> Result<ValidatedConfig> {
        match self.config {
            Some(config) if self.errors.is_empty() => Ok(config),
            _ => Err(Error::invalid_config(&self.errors)),
        }
    }
}

/// Collected problems keyed by field, so raw and typed checks never report
/// the same field twice.
#[derive(Default)]
struct Problems {
    fields: HashSet<&'static str>,
    messages: Vec<String>,
}

impl Problems {
    fn push(&mut self, field: &'static str, message: impl Into<String>) {
        if self.fields.insert(field) {
            self.messages.push(message.into());
        }
    }
}

impl Config {
    /// Local backend rooted at `base_path`.
    pub fn local(base_path: impl Into<PathBuf>) -> Self {
        Config::Local {
            local: LocalConfig::new(base_path),
            common: CommonConfig::default(),
        }
    }

    /// S3 backend for `bucket` in `region`.
    pub fn s3(bucket: impl Into<String>, region: impl Into<String>) -> Self {
        Config::S3 {
            s3: S3Config::new(bucket, region),
            common: CommonConfig::default(),
        }
    }

    pub fn with_common(self, common: CommonConfig) -> Self {
        match self {
            Config::Local { local, .. } => Config::Local { local, common },
            Config::S3 { s3, .. } => Config::S3 { s3, common },
        }
    }

    pub fn backend_type(&self) -> BackendType {
        match self {
            Config::Local { .. } => BackendType::Local,
            Config::S3 { .. } => BackendType::S3,
        }
    }

    pub fn common(&self) -> &CommonConfig {
        match self {
            Config::Local { common, .. } | Config::S3 { common, .. } => common,
        }
    }

    /// Check business rules and apply defaults.
    pub fn validate(self) -> ValidationResult {
        let mut problems = Problems::default();
        self.check(&mut problems);
        if !problems.messages.is_empty() {
            return ValidationResult::failed(problems.messages);
        }
        ValidationResult {
            errors: Vec::new(),
            config: Some(self.resolve()),
        }
    }

    fn check(&self, problems: &mut Problems) {
        let common = self.common();
        check_timeout(problems, "common.timeout", common.timeout);
        check_retries(problems, "common.maxRetries", common.max_retries);

        let s3 = match self {
            Config::Local { local, .. } => {
                if local
                    .base_path
                    .as_ref()
                    .is_some_and(|p| p.to_string_lossy().trim().is_empty())
                {
                    problems.push(
                        "local.basePath",
                        "local.basePath must be a non-empty path when set",
                    );
                }
                return;
            }
            Config::S3 { s3, .. } => s3,
        };
        if s3.bucket.trim().is_empty() {
            problems.push("s3.bucket", "s3.bucket is required and must be a non-empty string");
        }
        if s3.region.trim().is_empty() {
            problems.push("s3.region", "s3.region is required and must be a non-empty string");
        }
        check_timeout(problems, "s3.timeout", s3.timeout);
        check_retries(problems, "s3.maxRetries", s3.max_retries);
        if let Some(endpoint) = &s3.endpoint {
            match url::Url::parse(endpoint) {
                Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => {}
                _ => problems.push(
                    "s3.endpoint",
                    format!("s3.endpoint must be an absolute http(s) URL (got \"{}\")", endpoint),
                ),
            }
        }
        match (&s3.access_key_id, &s3.secret_access_key) {
            (Some(_), None) => problems.push(
                "s3.secretAccessKey",
                "s3.secretAccessKey is required when s3.accessKeyId is set",
            ),
            (None, Some(_)) => problems.push(
                "s3.accessKeyId",
                "s3.accessKeyId is required when s3.secretAccessKey is set",
            ),
            _ => {}
        }
    }

    fn resolve(self) -> ValidatedConfig {
        let (backend, common) = match self {
            Config::Local { local, common } => {
                let base_path = local.base_path.unwrap_or_else(|| {
                    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
                });
                let resolved = ResolvedLocal {
                    base_path,
                    create_missing_dirs: local.create_missing_dirs.unwrap_or(false),
                };
                (BackendConfig::Local(resolved), common)
            }
            Config::S3 { s3, common } => {
                let timeout_ms = s3.timeout.or(common.timeout).unwrap_or(DEFAULT_TIMEOUT_MS);
                let resolved = ResolvedS3 {
                    bucket: s3.bucket,
                    region: s3.region,
                    access_key_id: s3.access_key_id,
                    secret_access_key: s3.secret_access_key,
                    session_token: s3.session_token,
                    endpoint: s3.endpoint,
                    force_path_style: s3.force_path_style.unwrap_or(false),
                    prefix: s3.prefix.unwrap_or_default(),
                    timeout: Duration::from_millis(timeout_ms),
                    max_retries: s3
                        .max_retries
                        .or(common.max_retries)
                        .unwrap_or(DEFAULT_MAX_RETRIES),
                };
                (BackendConfig::S3(resolved), common)
            }
        };

        ValidatedConfig {
            backend,
            common: ResolvedCommon {
                timeout: Duration::from_millis(common.timeout.unwrap_or(DEFAULT_TIMEOUT_MS)),
                max_retries: common.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
                debug: common.debug.unwrap_or(false),
                logger: common.logger.unwrap_or_default(),
            },
        }
    }

    /// Read configuration from the process environment.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `FILESYSTEM_TYPE` | `type` (required) |
    /// | `FILESYSTEM_LOCAL_BASE_PATH` | `local.basePath` |
    /// | `FILESYSTEM_LOCAL_CREATE_MISSING_DIRS` | `local.createMissingDirs` |
    /// | `FILESYSTEM_S3_BUCKET` | `s3.bucket` |
    /// | `FILESYSTEM_S3_REGION` | `s3.region` |
    /// | `AWS_ACCESS_KEY_ID` | `s3.accessKeyId` |
    /// | `AWS_SECRET_ACCESS_KEY` | `s3.secretAccessKey` |
    /// | `FILESYSTEM_S3_ENDPOINT` | `s3.endpoint` |
    /// | `FILESYSTEM_S3_FORCE_PATH_STYLE` | `s3.forcePathStyle` |
    /// | `FILESYSTEM_S3_PREFIX` | `s3.prefix` |
    /// | `FILESYSTEM_TIMEOUT` | `common.timeout` |
    /// | `FILESYSTEM_MAX_RETRIES` | `common.maxRetries` |
    /// | `FILESYSTEM_DEBUG` | `common.debug` |
    pub fn from_env() -> ValidationResult {
        Self::from_env_with(|name| std::env::var(name).ok())
    }

    /// Like [`Config::from_env`] with an injectable variable lookup.
    pub fn from_env_with(lookup: impl Fn(&str) -> Option<String>) -> ValidationResult {
        validate_config(&env_config_value(lookup))
    }
}

/// Build the raw configuration value described by environment variables.
pub fn env_config_value(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
    let mut root = Map::new();
    if let Some(kind) = get("FILESYSTEM_TYPE") {
        root.insert("type".into(), Value::String(kind.trim().to_string()));
    }

    let mut common = Map::new();
    if let Some(v) = get("FILESYSTEM_TIMEOUT") {
        common.insert("timeout".into(), env_number(&v));
    }
    if let Some(v) = get("FILESYSTEM_MAX_RETRIES") {
        common.insert("maxRetries".into(), env_number(&v));
    }
    if let Some(v) = get("FILESYSTEM_DEBUG") {
        common.insert("debug".into(), env_bool(&v));
    }
    root.insert("common".into(), Value::Object(common));

    match root.get("type").and_then(Value::as_str) {
        Some("local") => {
            let mut local = Map::new();
            if let Some(v) = get("FILESYSTEM_LOCAL_BASE_PATH") {
                local.insert("basePath".into(), Value::String(v));
            }
            if let Some(v) = get("FILESYSTEM_LOCAL_CREATE_MISSING_DIRS") {
                local.insert("createMissingDirs".into(), env_bool(&v));
            }
            root.insert("local".into(), Value::Object(local));
        }
        Some("s3") => {
            let mut s3 = Map::new();
            let strings = [
                ("FILESYSTEM_S3_BUCKET", "bucket"),
                ("FILESYSTEM_S3_REGION", "region"),
                ("AWS_ACCESS_KEY_ID", "accessKeyId"),
                ("AWS_SECRET_ACCESS_KEY", "secretAccessKey"),
                ("FILESYSTEM_S3_ENDPOINT", "endpoint"),
                ("FILESYSTEM_S3_PREFIX", "prefix"),
            ];
            for (var, field) in strings {
                if let Some(v) = get(var) {
                    s3.insert(field.into(), Value::String(v));
                }
            }
            if let Some(v) = get("FILESYSTEM_S3_FORCE_PATH_STYLE") {
                s3.insert("forcePathStyle".into(), env_bool(&v));
            }
            root.insert("s3".into(), Value::Object(s3));
        }
        _ => {}
    }

    Value::Object(root)
}

/// Parse an env number, leaving unparsable text for the validator to reject.
fn env_number(v: &str) -> Value {
    match v.trim().parse::<i64>() {
        Ok(n) => Value::from(n),
        Err(_) => Value::String(v.to_string()),
    }
}

fn env_bool(v: &str) -> Value {
    match v.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Value::Bool(true),
        "false" | "0" | "no" | "off" => Value::Bool(false),
        _ => Value::String(v.to_string()),
    }
}

/// Validate a raw configuration value.
///
/// Checks the discriminant, block presence and field types, then applies the
/// same business rules as [`Config::validate`]. All problems are reported.
pub fn validate_config(raw: &Value) -> ValidationResult {
    let mut problems = Problems::default();
    let Some(root) = raw.as_object() else {
        return ValidationResult::failed(vec!["configuration must be an object".to_string()]);
    };

    let backend = match root.get("type") {
        None | Some(Value::Null) => {
            problems.push("type", "type is required (expected \"local\" or \"s3\")");
            None
        }
        Some(Value::String(s)) => match s.parse::<BackendType>() {
            Ok(t) => Some(t),
            Err(e) => {
                problems.push("type", error_message(e));
                None
            }
        },
        Some(_) => {
            problems.push("type", "type must be a string (\"local\" or \"s3\")");
            None
        }
    };

    let common = lower_common(root.get("common"), &mut problems);

    let config = match backend {
        Some(BackendType::Local) => {
            if present(root.get("s3")) {
                problems.push("s3", "s3 block must not be present when type is \"local\"");
            }
            lower_local(root.get("local"), &mut problems).map(|local| Config::Local { local, common })
        }
        Some(BackendType::S3) => {
            if present(root.get("local")) {
                problems.push("local", "local block must not be present when type is \"s3\"");
            }
            lower_s3(root.get("s3"), &mut problems).map(|s3| Config::S3 { s3, common })
        }
        None => None,
    };

    if let Some(config) = &config {
        config.check(&mut problems);
    }
    match config {
        Some(config) if problems.messages.is_empty() => ValidationResult {
            errors: Vec::new(),
            config: Some(config.resolve()),
        },
        _ => ValidationResult::failed(problems.messages),
    }
}

fn error_message(err: Error) -> String {
    match err {
        Error::Validation { message, .. } => message,
        other => other.to_string(),
    }
}

fn present(value: Option<&Value>) -> bool {
    !matches!(value, None | Some(Value::Null))
}

fn block<'a>(
    value: Option<&'a Value>,
    name: &'static str,
    required: bool,
    problems: &mut Problems,
) -> Option<&'a Map<String, Value>> {
    match value {
        None | Some(Value::Null) => {
            if required {
                problems.push(name, format!("{} block is required when type is \"{}\"", name, name));
            }
            None
        }
        Some(Value::Object(map)) => Some(map),
        Some(_) => {
            problems.push(name, format!("{} must be an object", name));
            None
        }
    }
}

fn lower_local(value: Option<&Value>, problems: &mut Problems) -> Option<LocalConfig> {
    let map = block(value, "local", true, problems)?;
    Some(LocalConfig {
        base_path: opt_string(map, "basePath", "local.basePath", problems).map(PathBuf::from),
        create_missing_dirs: opt_bool(map, "createMissingDirs", "local.createMissingDirs", problems),
    })
}

fn lower_s3(value: Option<&Value>, problems: &mut Problems) -> Option<S3Config> {
    let map = block(value, "s3", true, problems)?;
    Some(S3Config {
        bucket: opt_string(map, "bucket", "s3.bucket", problems).unwrap_or_default(),
        region: opt_string(map, "region", "s3.region", problems).unwrap_or_default(),
        access_key_id: opt_string(map, "accessKeyId", "s3.accessKeyId", problems),
        secret_access_key: opt_string(map, "secretAccessKey", "s3.secretAccessKey", problems),
        session_token: opt_string(map, "sessionToken", "s3.sessionToken", problems),
        endpoint: opt_string(map, "endpoint", "s3.endpoint", problems),
        force_path_style: opt_bool(map, "forcePathStyle", "s3.forcePathStyle", problems),
        prefix: opt_string(map, "prefix", "s3.prefix", problems),
        timeout: opt_u64(map, "timeout", "s3.timeout", problems),
        max_retries: opt_u64(map, "maxRetries", "s3.maxRetries", problems)
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX)),
    })
}

fn lower_common(value: Option<&Value>, problems: &mut Problems) -> CommonConfig {
    let Some(map) = block(value, "common", false, problems) else {
        return CommonConfig::default();
    };
    CommonConfig {
        timeout: opt_u64(map, "timeout", "common.timeout", problems),
        max_retries: opt_u64(map, "maxRetries", "common.maxRetries", problems)
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX)),
        debug: opt_bool(map, "debug", "common.debug", problems),
        logger: None,
    }
}

fn opt_string(
    map: &Map<String, Value>,
    key: &str,
    field: &'static str,
    problems: &mut Problems,
) -> Option<String> {
    match map.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            problems.push(field, format!("{} must be a string", field));
            None
        }
    }
}

fn opt_bool(
    map: &Map<String, Value>,
    key: &str,
    field: &'static str,
    problems: &mut Problems,
) -> Option<bool> {
    match map.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::Bool(b)) => Some(*b),
        Some(_) => {
            problems.push(field, format!("{} must be a boolean", field));
            None
        }
    }
}

fn opt_u64(
    map: &Map<String, Value>,
    key: &str,
    field: &'static str,
    problems: &mut Problems,
) -> Option<u64> {
    match map.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => match n.as_u64() {
            Some(v) => Some(v),
            None => {
                problems.push(field, format!("{} must be a non-negative integer", field));
                None
            }
        },
        Some(_) => {
            problems.push(field, format!("{} must be a number", field));
            None
        }
    }
}

fn check_timeout(problems: &mut Problems, field: &'static str, timeout: Option<u64>) {
    if let Some(ms) = timeout {
        if ms == 0 || ms > MAX_TIMEOUT_MS {
            problems.push(
                field,
                format!("{} must be between 1 and {} ms (got {})", field, MAX_TIMEOUT_MS, ms),
            );
        }
    }
}

fn check_retries(problems: &mut Problems, field: &'static str, retries: Option<u32>) {
    if let Some(n) = retries {
        if n > MAX_RETRIES_LIMIT {
            problems.push(
                field,
                format!("{} must be between 0 and {} (got {})", field, MAX_RETRIES_LIMIT, n),
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn local_defaults_are_filled() {
        let result = validate_config(&json!({ "type": "local", "local": {} }));
        assert!(result.is_valid(), "{:?}", result.errors);
        let config = result.config.unwrap();
        let BackendConfig::Local(local) = &config.backend else {
            panic!("expected local backend");
        };
        assert_eq!(local.base_path, std::env::current_dir().unwrap());
        assert!(!local.create_missing_dirs);
        assert_eq!(config.common.timeout, Duration::from_millis(30_000));
        assert_eq!(config.common.max_retries, 3);
        assert!(!config.common.debug);
    }

    #[test]
    fn missing_or_unknown_type_is_reported_not_thrown() {
        for raw in [json!({}), json!({ "type": "ftp" }), json!({ "type": 7 }), json!(null)] {
            let result = validate_config(&raw);
            assert!(!result.is_valid());
            assert!(!result.errors.is_empty());
            assert!(result.config.is_none());
        }
    }

    #[test]
    fn empty_base_path_is_rejected() {
        let result = validate_config(&json!({ "type": "local", "local": { "basePath": "" } }));
        assert!(!result.is_valid());
        assert!(result.config.is_none());
        assert!(
            result.errors.iter().any(|e| e.contains("local.basePath")),
            "{:?}",
            result.errors
        );

        let err = Config::local("  ").validate().into_result().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
        assert!(err.to_string().contains("local.basePath"), "{}", err);
    }

    #[test]
    fn missing_bucket_mentions_bucket() {
        let result = validate_config(&json!({ "type": "s3", "s3": { "region": "us-east-1" } }));
        assert!(!result.is_valid());
        assert!(result.errors.iter().any(|e| e.contains("bucket")));
    }

    #[test]
    fn errors_are_collected_not_fail_fast() {
        let result = validate_config(&json!({
            "type": "s3",
            "s3": { "bucket": 42, "forcePathStyle": "yes" },
            "common": { "maxRetries": -1, "timeout": "soon" }
        }));
        assert!(!result.is_valid());
        let joined = result.errors.join("\n");
        assert!(joined.contains("s3.bucket must be a string"), "{}", joined);
        assert!(joined.contains("s3.region is required"), "{}", joined);
        assert!(joined.contains("s3.forcePathStyle must be a boolean"), "{}", joined);
        assert!(joined.contains("common.maxRetries must be a non-negative integer"));
        assert!(joined.contains("common.timeout must be a number"));
        // bucket reported once, not again as "required"
        assert_eq!(result.errors.iter().filter(|e| e.contains("s3.bucket")).count(), 1);
    }

    #[test]
    fn mixed_blocks_rejected() {
        let result = validate_config(&json!({
            "type": "local",
            "local": { "basePath": "/tmp" },
            "s3": { "bucket": "b", "region": "r" }
        }));
        assert!(!result.is_valid());
        assert!(result.errors[0].contains("s3 block must not be present"));
    }

    #[test]
    fn missing_matching_block_rejected() {
        let result = validate_config(&json!({ "type": "local" }));
        assert!(!result.is_valid());
        assert!(result.errors[0].contains("local block is required"));
    }

    #[test]
    fn s3_inherits_common_settings() {
        let result = validate_config(&json!({
            "type": "s3",
            "s3": { "bucket": "b", "region": "eu-west-1" },
            "common": { "timeout": 5000, "maxRetries": 1, "debug": true }
        }));
        let config = result.into_result().unwrap();
        let BackendConfig::S3(s3) = &config.backend else {
            panic!("expected s3 backend");
        };
        assert_eq!(s3.timeout, Duration::from_millis(5000));
        assert_eq!(s3.max_retries, 1);
        assert!(!s3.force_path_style);
        assert_eq!(s3.prefix, "");
        assert!(s3.endpoint.is_none());
        assert!(config.common.debug);
    }

    #[test]
    fn s3_overrides_win_over_common() {
        let config = Config::S3 {
            s3: S3Config {
                timeout: Some(1000),
                max_retries: Some(0),
                ..S3Config::new("b", "r")
            },
            common: CommonConfig::default().timeout_ms(9000).max_retries(5),
        };
        let validated = config.validate().into_result().unwrap();
        let BackendConfig::S3(s3) = validated.backend else {
            panic!("expected s3 backend");
        };
        assert_eq!(s3.timeout, Duration::from_millis(1000));
        assert_eq!(s3.max_retries, 0);
    }

    #[test]
    fn typed_business_rules() {
        let config = Config::S3 {
            s3: S3Config::new("", " ").endpoint("not a url"),
            common: CommonConfig::default().timeout_ms(0).max_retries(99),
        };
        let result = config.validate();
        assert!(!result.is_valid());
        assert_eq!(result.errors.len(), 5, "{:?}", result.errors);
    }

    #[test]
    fn credentials_must_be_paired() {
        let mut s3 = S3Config::new("b", "r");
        s3.access_key_id = Some("AKIA".into());
        let result = Config::S3 {
            s3,
            common: CommonConfig::default(),
        }
        .validate();
        assert!(result.errors[0].contains("secretAccessKey"));
    }

    #[test]
    fn into_result_joins_messages() {
        let err = validate_config(&json!({ "type": "s3", "s3": {} }))
            .into_result()
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("bucket"));
        assert!(msg.contains("region"));
    }

    #[test]
    fn env_lookup_builds_s3_config() {
        let vars = [
            ("FILESYSTEM_TYPE", "s3"),
            ("FILESYSTEM_S3_BUCKET", "uploads"),
            ("FILESYSTEM_S3_REGION", "us-east-1"),
            ("FILESYSTEM_S3_ENDPOINT", "http://localhost:9000"),
            ("FILESYSTEM_S3_FORCE_PATH_STYLE", "true"),
            ("FILESYSTEM_S3_PREFIX", "tenant-a"),
            ("AWS_ACCESS_KEY_ID", "minio"),
            ("AWS_SECRET_ACCESS_KEY", "minio-secret"),
            ("FILESYSTEM_MAX_RETRIES", "2"),
            ("FILESYSTEM_DEBUG", "1"),
        ];
        let lookup = |name: &str| {
            vars.iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.to_string())
        };
        let config = Config::from_env_with(lookup).into_result().unwrap();
        let BackendConfig::S3(s3) = &config.backend else {
            panic!("expected s3 backend");
        };
        assert_eq!(s3.bucket, "uploads");
        assert!(s3.force_path_style);
        assert_eq!(s3.prefix, "tenant-a");
        assert_eq!(s3.max_retries, 2);
        assert_eq!(s3.access_key_id.as_deref(), Some("minio"));
        assert!(config.common.debug);
    }

    #[test]
    fn env_without_type_fails() {
        let result = Config::from_env_with(|_| None);
        assert!(!result.is_valid());
        assert!(result.errors[0].contains("type is required"));
    }

    #[test]
    fn env_invalid_number_is_reported() {
        let lookup = |name: &str| match name {
            "FILESYSTEM_TYPE" => Some("local".to_string()),
            "FILESYSTEM_TIMEOUT" => Some("fast".to_string()),
            _ => None,
        };
        let result = Config::from_env_with(lookup);
        assert!(!result.is_valid());
        assert!(result.errors[0].contains("common.timeout"));
    }

    #[test]
    fn debug_output_masks_secret() {
        let s3 = S3Config::new("b", "r").credentials("AKIAEXAMPLE", "wJalrXUtnFEMI/K7MDENG/bPxRfiCYEXAMPLEKEY");
        let dbg = format!("{:?}", s3);
        assert!(!dbg.contains("EXAMPLEKEY"));
        assert!(dbg.contains("AKIAEXAMPLE"));
    }
}
