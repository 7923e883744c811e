//! Filesystem construction.
//!
//! The factory validates configuration and dispatches on the backend type.
//! Nothing is layered on top of the adapter it returns.

use serde_json::Value;
use std::sync::Arc;

use crate::config::{BackendConfig, Config, ValidatedConfig, ValidationResult, validate_config};
use crate::error::Result;
use crate::fs::{Filesystem, LocalFs, S3Fs};

/// Build a filesystem from typed configuration.
///
/// # Errors
///
/// Returns a validation error listing every configuration problem.
pub fn create_filesystem(config: Config) -> Result<Arc<dyn Filesystem>> {
    from_validation(config.validate())
}

/// Build a filesystem from a raw JSON-shaped configuration value.
pub fn create_filesystem_from_value(raw: &Value) -> Result<Arc<dyn Filesystem>> {
    from_validation(validate_config(raw))
}

/// Build a filesystem from `FILESYSTEM_*` and `AWS_*` environment variables.
pub fn create_filesystem_from_env() -> Result<Arc<dyn Filesystem>> {
    from_validation(Config::from_env())
}

/// Build a filesystem from an already validated configuration.
pub fn create_from_validated(config: ValidatedConfig) -> Result<Arc<dyn Filesystem>> {
    let ValidatedConfig { backend, common } = config;
    match backend {
        BackendConfig::Local(local) => Ok(Arc::new(LocalFs::new(&local, &common))),
        BackendConfig::S3(s3) => Ok(Arc::new(S3Fs::new(&s3, &common)?)),
    }
}

fn from_validation(result: ValidationResult) -> Result<Arc<dyn Filesystem>> {
    create_from_validated(result.into_result()?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::S3Config;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[tokio::test]
    async fn builds_local_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let fs = create_filesystem(Config::local(dir.path())).unwrap();
        fs.write_file("hello.txt", b"hi").await.unwrap();
        assert!(dir.path().join("hello.txt").exists());
    }

    #[test]
    fn builds_s3_filesystem_without_network() {
        let config = Config::s3("bucket", "us-east-1");
        assert!(create_filesystem(config).is_ok());
    }

    #[test]
    fn invalid_config_lists_every_problem() {
        let err = create_filesystem_from_value(&json!({
            "type": "s3",
            "s3": { "bucket": "", "region": "" }
        }))
        .err()
        .unwrap();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let message = err.to_string();
        assert!(message.contains("bucket"), "{}", message);
        assert!(message.contains("region"), "{}", message);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = create_filesystem_from_value(&json!({ "type": "ftp" }))
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn half_credentials_are_rejected() {
        let config = Config::S3 {
            s3: S3Config {
                access_key_id: Some("AKID".to_string()),
                ..S3Config::new("bucket", "us-east-1")
            },
            common: Default::default(),
        };
        assert!(create_filesystem(config).is_err());
    }
}
