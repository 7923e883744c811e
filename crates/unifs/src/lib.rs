//! Unifs - one async filesystem API over local disk and S3-compatible storage
//!
//! Application code talks to the [`Filesystem`] trait. A configuration value
//! picks the backend:
//!
//! - [`LocalFs`]: host disk rooted at a base directory
//! - [`S3Fs`]: an S3 bucket (AWS, MinIO, R2, ...) with a virtual directory
//!   layer on top of flat object keys
//!
//! Every failure surfaces as one [`Error`] taxonomy regardless of backend,
//! so callers match on [`ErrorKind`] instead of errno strings or S3 codes.
//!
//! # Example
//!
//! ```rust
//! use unifs::{Config, Encoding, MkdirOptions, create_filesystem};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let dir = tempfile::tempdir()?;
//!     let fs = create_filesystem(Config::local(dir.path()))?;
//!
//!     fs.mkdir("/notes", MkdirOptions::recursive()).await?;
//!     fs.write_string("/notes/today.txt", "hi", Encoding::Utf8).await?;
//!     fs.append_string("/notes/today.txt", "!", Encoding::Utf8).await?;
//!
//!     let text = fs.read_to_string("/notes/today.txt", Encoding::Utf8).await?;
//!     assert_eq!(text, "hi!");
//!     assert_eq!(fs.readdir("/notes").await?, vec!["today.txt"]);
//!     Ok(())
//! }
//! ```
//!
//! # Configuration from the environment
//!
//! ```rust,no_run
//! let fs = unifs::create_filesystem_from_env()?;
//! # Ok::<(), unifs::Error>(())
//! ```
//!
//! See [`Config::from_env`] for the variables read.

mod component;
mod config;
mod error;
mod factory;
mod fs;
mod logging_impl;
pub mod path;
mod retry;

pub use async_trait::async_trait;

pub use component::{DEFAULT_NAME, FilesystemComponent};
pub use config::{
    BackendConfig, BackendType, CommonConfig, Config, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_MS,
    LocalConfig, MAX_RETRIES_LIMIT, MAX_TIMEOUT_MS, ResolvedCommon, ResolvedLocal, ResolvedS3,
    S3Config, ValidatedConfig, ValidationResult, env_config_value, validate_config,
};
pub use error::{BoxError, Error, ErrorContext, ErrorKind, NativeError, Result, map_error};
pub use factory::{
    create_filesystem, create_filesystem_from_env, create_filesystem_from_value,
    create_from_validated,
};
pub use fs::{
    AccessMode, Encoding, FileStats, FileType, Filesystem, LocalFs, MkdirOptions, ReadStream,
    ReadStreamOptions, RmdirOptions, S3Fs, WriteStream, WriteStreamOptions,
};
pub use logging_impl::{LogLevel, Logger};
pub use retry::{Backoff, RetryOptions, is_retryable_error, with_retry};
