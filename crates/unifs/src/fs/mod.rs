//! Filesystem backends for Unifs
//!
//! Provides the async [`Filesystem`] trait and its implementations:
//! - [`LocalFs`]: Host disk rooted at a base directory
//! - [`S3Fs`]: S3-compatible object storage with a virtual directory layer

mod local;
mod runner;
mod s3;
mod stream;
mod traits;

pub use local::LocalFs;
pub use s3::S3Fs;
pub use traits::{
    AccessMode, Encoding, FileStats, FileType, Filesystem, MkdirOptions, ReadStream,
    ReadStreamOptions, RmdirOptions, WriteStream, WriteStreamOptions,
};

use crate::error::{Error, Result};
use crate::path::resolve_path;

/// Resolve a caller path to a `/`-rooted virtual path.
///
/// Paths that climb above the backend root are refused, so neither adapter
/// can be steered outside its base directory or bucket prefix.
pub(crate) fn virtual_path(path: &str, operation: &str) -> Result<String> {
    if path.contains('\0') {
        return Err(Error::validation(format!(
            "{}: path contains a null byte",
            operation
        )));
    }
    let resolved = resolve_path(&[path]);
    if !resolved.starts_with('/') {
        return Err(Error::validation(format!(
            "{}: drive-qualified paths are not supported: {}",
            operation, path
        )));
    }
    if resolved == "/.." || resolved.starts_with("/../") {
        return Err(Error::permission_denied(path, Some(operation)));
    }
    Ok(resolved)
}
