//! Filesystem trait definitions

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::fmt;
use std::ops::BitOr;
use std::pin::Pin;
use std::str::FromStr;
use std::time::SystemTime;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Error, Result};

/// Readable byte stream returned by [`Filesystem::create_read_stream`].
///
/// Failures, including failing to open the file, arrive as `std::io::Error`
/// from the read itself. Use [`Error::from_io`] to recover the taxonomy error.
pub type ReadStream = Pin<Box<dyn AsyncRead + Send>>;

/// Writable byte stream returned by [`Filesystem::create_write_stream`].
///
/// Data is only guaranteed to be stored once `shutdown()` completes.
pub type WriteStream = Pin<Box<dyn AsyncWrite + Send>>;

/// Async filesystem trait.
///
/// Paths are `/`-separated and interpreted relative to the backend root
/// (the local base directory or the bucket prefix); a leading `/` is optional.
/// Both adapters implement exactly this set of operations, so behavior is
/// backend-independent apart from the documented S3 approximations.
#[async_trait]
pub trait Filesystem: Send + Sync {
    /// Read a file's contents.
    async fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    /// Read a file and decode it with `encoding`.
    async fn read_to_string(&self, path: &str, encoding: Encoding) -> Result<String> {
        let bytes = self.read_file(path).await?;
        Ok(encoding.to_text(&bytes))
    }

    /// Write contents to a file, replacing it.
    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Encode `data` with `encoding` and write it.
    async fn write_string(&self, path: &str, data: &str, encoding: Encoding) -> Result<()> {
        let bytes = encoding.to_bytes(data)?;
        self.write_file(path, &bytes).await
    }

    /// Append contents to a file, creating it if missing.
    async fn append_file(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Encode `data` with `encoding` and append it.
    async fn append_string(&self, path: &str, data: &str, encoding: Encoding) -> Result<()> {
        let bytes = encoding.to_bytes(data)?;
        self.append_file(path, &bytes).await
    }

    /// Delete a file.
    async fn unlink(&self, path: &str) -> Result<()>;

    /// Copy a file.
    async fn copy_file(&self, src: &str, dest: &str) -> Result<()>;

    /// Rename/move a file or directory.
    async fn rename(&self, old_path: &str, new_path: &str) -> Result<()>;

    /// Names of the entries in a directory (not full paths), sorted.
    async fn readdir(&self, path: &str) -> Result<Vec<String>>;

    /// Create a directory.
    async fn mkdir(&self, path: &str, options: MkdirOptions) -> Result<()>;

    /// Remove a directory.
    async fn rmdir(&self, path: &str, options: RmdirOptions) -> Result<()>;

    /// Get metadata, following symlinks.
    async fn stat(&self, path: &str) -> Result<FileStats>;

    /// Get metadata without following symlinks.
    async fn lstat(&self, path: &str) -> Result<FileStats>;

    /// Fail unless `path` is accessible with `mode`.
    async fn access(&self, path: &str, mode: AccessMode) -> Result<()>;

    /// Open a lazy readable stream.
    fn create_read_stream(&self, path: &str, options: ReadStreamOptions) -> ReadStream;

    /// Open a lazy writable stream.
    fn create_write_stream(&self, path: &str, options: WriteStreamOptions) -> WriteStream;

    /// Check if a path exists. Never fails: any error means `false`.
    async fn exists(&self, path: &str) -> bool;

    /// Canonical path of an existing entry.
    async fn realpath(&self, path: &str) -> Result<String>;
}

/// File metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStats {
    pub file_type: FileType,
    /// Size in bytes
    pub size: u64,
    /// Unix mode bits; synthesized for object stores
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u64,
    /// Last modification time
    pub mtime: SystemTime,
    /// Last access time
    pub atime: SystemTime,
    /// Last status change time
    pub ctime: SystemTime,
    /// Creation time
    pub birthtime: SystemTime,
}

impl FileStats {
    /// Stats for an object-store entry, where only size and time are known.
    pub fn synthetic(file_type: FileType, size: u64, modified: SystemTime) -> Self {
        let mode = match file_type {
            FileType::Directory => 0o755,
            _ => 0o644,
        };
        Self {
            file_type,
            size,
            mode,
            uid: 0,
            gid: 0,
            nlink: 1,
            mtime: modified,
            atime: modified,
            ctime: modified,
            birthtime: modified,
        }
    }

    pub fn is_file(&self) -> bool {
        self.file_type.is_file()
    }

    pub fn is_directory(&self) -> bool {
        self.file_type.is_dir()
    }

    pub fn is_symbolic_link(&self) -> bool {
        self.file_type.is_symlink()
    }
}

/// File type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Regular file
    File,
    /// Directory
    Directory,
    /// Symbolic link
    Symlink,
}

impl FileType {
    /// Check if this is a file.
    pub fn is_file(&self) -> bool {
        matches!(self, FileType::File)
    }

    /// Check if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }

    /// Check if this is a symlink.
    pub fn is_symlink(&self) -> bool {
        matches!(self, FileType::Symlink)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MkdirOptions {
    /// Create missing ancestors; succeed if the directory exists.
    pub recursive: bool,
}

impl MkdirOptions {
    pub fn recursive() -> Self {
        Self { recursive: true }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RmdirOptions {
    /// Remove the directory and everything under it.
    pub recursive: bool,
}

impl RmdirOptions {
    pub fn recursive() -> Self {
        Self { recursive: true }
    }
}

/// Byte range for [`Filesystem::create_read_stream`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadStreamOptions {
    /// First byte to read.
    pub start: Option<u64>,
    /// Last byte to read, inclusive.
    pub end: Option<u64>,
}

impl ReadStreamOptions {
    pub fn range(start: u64, end: u64) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStreamOptions {
    /// Append to an existing file instead of truncating it.
    pub append: bool,
}

/// Access check mode, combinable with `|`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccessMode(u8);

impl AccessMode {
    /// Existence only.
    pub const EXISTS: AccessMode = AccessMode(0);
    pub const EXECUTE: AccessMode = AccessMode(1);
    pub const WRITE: AccessMode = AccessMode(2);
    pub const READ: AccessMode = AccessMode(4);

    pub fn contains(self, other: AccessMode) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl Default for AccessMode {
    fn default() -> Self {
        AccessMode::EXISTS
    }
}

impl BitOr for AccessMode {
    type Output = AccessMode;

    fn bitor(self, rhs: AccessMode) -> AccessMode {
        AccessMode(self.0 | rhs.0)
    }
}

/// Text encodings accepted by the string read/write helpers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Encoding {
    #[default]
    Utf8,
    /// 7-bit; the high bit of each byte is dropped when decoding.
    Ascii,
    /// One byte per char (`binary`).
    Latin1,
    Base64,
    Hex,
}

impl Encoding {
    /// Decode bytes into text. Invalid UTF-8 becomes U+FFFD.
    pub fn to_text(self, bytes: &[u8]) -> String {
        match self {
            Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Encoding::Ascii => bytes.iter().map(|b| char::from(b & 0x7f)).collect(),
            Encoding::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
            Encoding::Base64 => STANDARD.encode(bytes),
            Encoding::Hex => bytes.iter().map(|b| format!("{:02x}", b)).collect(),
        }
    }

    /// Encode text into bytes.
    pub fn to_bytes(self, text: &str) -> Result<Vec<u8>> {
        match self {
            Encoding::Utf8 => Ok(text.as_bytes().to_vec()),
            // Chars above the byte range keep their low byte.
            Encoding::Ascii | Encoding::Latin1 => Ok(text.chars().map(|c| c as u32 as u8).collect()),
            Encoding::Base64 => STANDARD
                .decode(text.trim())
                .map_err(|e| Error::validation(format!("invalid base64 data: {}", e))),
            Encoding::Hex => decode_hex(text.trim()),
        }
    }
}

fn decode_hex(text: &str) -> Result<Vec<u8>> {
    if text.len() % 2 != 0 {
        return Err(Error::validation("invalid hex data: odd length"));
    }
    (0..text.len())
        .step_by(2)
        .map(|i| {
            text.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| Error::validation(format!("invalid hex data at offset {}", i)))
        })
        .collect()
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Encoding::Utf8 => "utf8",
            Encoding::Ascii => "ascii",
            Encoding::Latin1 => "latin1",
            Encoding::Base64 => "base64",
            Encoding::Hex => "hex",
        };
        f.write_str(name)
    }
}

impl FromStr for Encoding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Encoding::Utf8),
            "ascii" => Ok(Encoding::Ascii),
            "latin1" | "binary" => Ok(Encoding::Latin1),
            "base64" => Ok(Encoding::Base64),
            "hex" => Ok(Encoding::Hex),
            other => Err(Error::validation(format!("unknown encoding: {}", other))),
        }
    }
}
