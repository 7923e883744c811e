//! S3-compatible object storage backend.
//!
//! Objects are addressed as `prefix + path` with the leading `/` removed.
//! Directories are virtual: a directory exists when a zero-byte `dir/`
//! placeholder exists or when any key lives under `dir/`.
//!
//! Approximations of POSIX semantics:
//!
//! - `rename` is copy-then-delete and not atomic. Renaming a directory moves
//!   every object under its prefix.
//! - `append_file` is read-modify-write; concurrent appenders race and the
//!   last writer wins.
//! - `lstat` equals `stat` and `access` only checks existence, since objects
//!   have no links and no permission bits.
//!
//! Operations run as a sequence of requests, and each request is retried on
//! its own. A retry therefore never replays a mutation that already landed
//! as part of a larger step; the one write that is not safe to repeat, the
//! rewrite inside `append_file`, runs exactly once.

mod client;
mod upload;

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use self::client::{ObjectMeta, S3Client};
use self::upload::S3WriteStream;
use super::runner::OperationRunner;
use super::stream::{LazyReader, LazyWriter};
use super::traits::{
    AccessMode, FileStats, FileType, Filesystem, MkdirOptions, ReadStream, ReadStreamOptions,
    RmdirOptions, WriteStream, WriteStreamOptions,
};
use super::virtual_path;
use crate::config::{ResolvedCommon, ResolvedS3};
use crate::error::{Error, ErrorContext, ErrorKind, NativeError, Result};
use crate::logging_impl::OperationLog;
use crate::path::dirname;

/// Filesystem over one bucket, optionally scoped to a key prefix.
#[derive(Clone)]
pub struct S3Fs {
    inner: Arc<S3Inner>,
}

struct S3Inner {
    client: Arc<S3Client>,
    /// Empty, or ends with `/`.
    prefix: String,
    runner: OperationRunner,
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

/// HTTP status behind a mapped S3 error.
fn http_status(err: &Error) -> Option<u16> {
    std::error::Error::source(err)?
        .downcast_ref::<NativeError>()?
        .status
}

impl S3Fs {
    pub fn new(config: &ResolvedS3, common: &ResolvedCommon) -> Result<Self> {
        let log = OperationLog::new("s3", common.debug, common.logger.clone());
        let client = S3Client::new(config, log.clone())?;
        let prefix = normalize_prefix(&config.prefix);
        log.debug(&format!(
            "bucket {} region {} prefix '{}'",
            config.bucket, config.region, prefix
        ));
        Ok(Self {
            inner: Arc::new(S3Inner {
                client: Arc::new(client),
                prefix,
                runner: OperationRunner::new(config.timeout, config.max_retries, log),
            }),
        })
    }

    pub fn bucket(&self) -> &str {
        self.inner.client.bucket()
    }

    /// Key prefix every path is stored under, empty or ending in `/`.
    pub fn prefix(&self) -> &str {
        &self.inner.prefix
    }

    fn client(&self) -> &S3Client {
        &self.inner.client
    }

    fn runner(&self) -> &OperationRunner {
        &self.inner.runner
    }

    /// Object key for a virtual path.
    fn key_for(&self, virtual_path: &str) -> String {
        format!("{}{}", self.inner.prefix, virtual_path.trim_start_matches('/'))
    }

    /// Directory prefix for a virtual path (`prefix/dir/`, or the bare
    /// prefix for the root).
    fn dir_key_for(&self, virtual_path: &str) -> String {
        let key = self.key_for(virtual_path);
        if virtual_path == "/" || key.is_empty() || key.ends_with('/') {
            key
        } else {
            format!("{}/", key)
        }
    }

    /// Resolve a path that must name an object, not the root.
    fn object_path(&self, path: &str, operation: &str) -> Result<(String, String)> {
        let virtual_path = virtual_path(path, operation)?;
        if virtual_path == "/" {
            return Err(Error::storage(
                format!("{}: {} is a directory", operation, path),
                "EISDIR",
            ));
        }
        let key = self.key_for(&virtual_path);
        Ok((virtual_path, key))
    }

    async fn head(&self, key: &str, context: &ErrorContext) -> Result<Option<ObjectMeta>> {
        self.client().head(key, context).await
    }

    /// Every key and common prefix under `prefix`, following continuation tokens.
    async fn list_all(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        context: &ErrorContext,
    ) -> Result<(Vec<String>, Vec<String>)> {
        let mut keys = Vec::new();
        let mut prefixes = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self
                .client()
                .list_page(prefix, delimiter, token.as_deref(), None, context)
                .await?;
            keys.extend(page.keys);
            prefixes.extend(page.prefixes);
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok((keys, prefixes))
    }

    /// Whether anything (placeholder or children) exists under `dir_key`.
    async fn dir_exists(&self, dir_key: &str, context: &ErrorContext) -> Result<bool> {
        if dir_key.is_empty() || dir_key == self.inner.prefix {
            return Ok(true);
        }
        let page = self
            .client()
            .list_page(dir_key, Some("/"), None, Some(1), context)
            .await?;
        Ok(!page.keys.is_empty() || !page.prefixes.is_empty())
    }

    async fn stat_virtual(&self, virtual_path: &str, context: &ErrorContext) -> Result<FileStats> {
        if virtual_path == "/" {
            return Ok(FileStats::synthetic(FileType::Directory, 0, UNIX_EPOCH));
        }
        let key = self.key_for(virtual_path);
        if let Some(meta) = self.head(&key, context).await? {
            return Ok(FileStats::synthetic(FileType::File, meta.size, meta.modified));
        }
        let dir_key = self.dir_key_for(virtual_path);
        if let Some(meta) = self.head(&dir_key, context).await? {
            return Ok(FileStats::synthetic(FileType::Directory, 0, meta.modified));
        }
        if self.dir_exists(&dir_key, context).await? {
            return Ok(FileStats::synthetic(FileType::Directory, 0, UNIX_EPOCH));
        }
        Err(Error::not_found(
            context.path.clone().unwrap_or_default(),
            context.operation.as_deref(),
        ))
    }

    /// Fail with `ENOTDIR` when an object sits where directory `dir` should be.
    async fn ensure_not_file(&self, dir: &str, context: &ErrorContext) -> Result<()> {
        if self.head(&self.key_for(dir), context).await?.is_some() {
            return Err(Error::storage(
                format!(
                    "{}: {} is not a directory",
                    context.operation.as_deref().unwrap_or("mkdir"),
                    dir
                ),
                "ENOTDIR",
            ));
        }
        Ok(())
    }

    async fn open_read(&self, path: &str, options: ReadStreamOptions) -> Result<ReadStream> {
        const OP: &str = "createReadStream";
        let (_, key) = self.object_path(path, OP)?;
        let context = ErrorContext::new(OP, path);

        let start = options.start.unwrap_or(0);
        let range = match options.end {
            Some(end) if end < start => return Ok(Box::pin(tokio::io::empty())),
            Some(end) => Some(format!("bytes={}-{}", start, end)),
            None if start > 0 => Some(format!("bytes={}-", start)),
            None => None,
        };

        match self.client().open(&key, range, &context).await {
            Ok(body) => Ok(Box::pin(body.into_async_read())),
            // Range past the end of the object: nothing to read.
            Err(e) if http_status(&e) == Some(416) => Ok(Box::pin(tokio::io::empty())),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Filesystem for S3Fs {
    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        const OP: &str = "readFile";
        let (_, key) = self.object_path(path, OP)?;
        let key = &key;
        let context = &ErrorContext::new(OP, path);
        self.runner()
            .run(OP, path, move || async move {
                self.client().get(key, context).await
            })
            .await
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        const OP: &str = "writeFile";
        let (_, key) = self.object_path(path, OP)?;
        let key = &key;
        let context = &ErrorContext::new(OP, path);
        self.runner()
            .run(OP, path, move || async move {
                self.client().upload(key, data, context).await
            })
            .await
    }

    async fn append_file(&self, path: &str, data: &[u8]) -> Result<()> {
        const OP: &str = "appendFile";
        let (_, key) = self.object_path(path, OP)?;
        let key = &key;
        let context = &ErrorContext::new(OP, path);
        let mut content = self
            .runner()
            .run(OP, path, move || async move {
                match self.client().get(key, context).await {
                    Ok(existing) => Ok(existing),
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
                    Err(e) => Err(e),
                }
            })
            .await?;
        content.extend_from_slice(data);
        self.runner()
            .run_once(OP, path, self.client().upload(key, &content, context))
            .await
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        const OP: &str = "unlink";
        let (_, key) = self.object_path(path, OP)?;
        let key = &key;
        let context = &ErrorContext::new(OP, path);
        let found = self
            .runner()
            .run(OP, path, move || async move { self.head(key, context).await })
            .await?;
        if found.is_none() {
            return Err(Error::not_found(path, Some(OP)));
        }
        self.runner()
            .run(OP, path, move || async move {
                self.client().delete_object(key, context).await
            })
            .await
    }

    async fn copy_file(&self, src: &str, dest: &str) -> Result<()> {
        const OP: &str = "copyFile";
        let (_, from) = self.object_path(src, OP)?;
        let (_, to) = self.object_path(dest, OP)?;
        let (from, to) = (&from, &to);
        let context = &ErrorContext::new(OP, src);
        self.runner()
            .run(OP, src, move || async move {
                if self.head(from, context).await?.is_none() {
                    return Err(Error::not_found(src, Some(OP)));
                }
                self.client().copy_object(from, to, context).await
            })
            .await
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        const OP: &str = "rename";
        let (old_virtual, from) = self.object_path(old_path, OP)?;
        let (new_virtual, to) = self.object_path(new_path, OP)?;
        if new_virtual == old_virtual || new_virtual.starts_with(&format!("{}/", old_virtual)) {
            return Err(Error::validation(format!(
                "{}: cannot move {} into itself",
                OP, old_path
            )));
        }
        let from_dir = self.dir_key_for(&old_virtual);
        let to_dir = self.dir_key_for(&new_virtual);
        let (from, to, from_dir) = (&from, &to, &from_dir);
        let context = &ErrorContext::new(OP, old_path);

        let is_file = self
            .runner()
            .run(OP, old_path, move || async move {
                Ok(self.head(from, context).await?.is_some())
            })
            .await?;
        if is_file {
            self.runner()
                .run(OP, old_path, move || async move {
                    self.client().copy_object(from, to, context).await
                })
                .await?;
            return self
                .runner()
                .run(OP, old_path, move || async move {
                    self.client().delete_object(from, context).await
                })
                .await;
        }

        let (keys, _) = self
            .runner()
            .run(OP, old_path, move || async move {
                self.list_all(from_dir, None, context).await
            })
            .await?;
        if keys.is_empty() {
            return Err(Error::not_found(old_path, Some(OP)));
        }
        for key in &keys {
            let target = format!("{}{}", to_dir, &key[from_dir.len()..]);
            let target = &target;
            self.runner()
                .run(OP, old_path, move || async move {
                    self.client().copy_object(key, target, context).await
                })
                .await?;
        }
        let keys = &keys;
        self.runner()
            .run(OP, old_path, move || async move {
                self.client().delete_many(keys, context).await
            })
            .await
    }

    async fn readdir(&self, path: &str) -> Result<Vec<String>> {
        const OP: &str = "readdir";
        let virtual_path = virtual_path(path, OP)?;
        let dir_key = self.dir_key_for(&virtual_path);
        let is_root = virtual_path == "/";
        let (dir_key, virtual_path) = (&dir_key, &virtual_path);
        let context = &ErrorContext::new(OP, path);
        self.runner()
            .run(OP, path, move || async move {
                let (keys, prefixes) = self.list_all(dir_key, Some("/"), context).await?;
                let mut placeholder = false;
                let mut names = BTreeSet::new();
                for key in &keys {
                    match &key[dir_key.len()..] {
                        "" => placeholder = true,
                        name => {
                            names.insert(name.to_string());
                        }
                    }
                }
                for prefix in &prefixes {
                    let name = prefix[dir_key.len()..].trim_end_matches('/');
                    if !name.is_empty() {
                        names.insert(name.to_string());
                    }
                }

                if names.is_empty() && !placeholder && !is_root {
                    let key = self.key_for(virtual_path);
                    if self.head(&key, context).await?.is_some() {
                        return Err(Error::storage(
                            format!("{}: {} is not a directory", OP, path),
                            "ENOTDIR",
                        ));
                    }
                    return Err(Error::not_found(path, Some(OP)));
                }
                Ok(names.into_iter().collect())
            })
            .await
    }

    async fn mkdir(&self, path: &str, options: MkdirOptions) -> Result<()> {
        const OP: &str = "mkdir";
        let virtual_path = virtual_path(path, OP)?;
        if virtual_path == "/" {
            return if options.recursive {
                Ok(())
            } else {
                Err(Error::storage(format!("{}: {} already exists", OP, path), "EEXIST"))
            };
        }
        let virtual_path = &virtual_path;
        let context = &ErrorContext::new(OP, path);

        // Placeholders to create, outermost first.
        let dir_keys = self
            .runner()
            .run(OP, path, move || async move {
                if self.head(&self.key_for(virtual_path), context).await?.is_some() {
                    return Err(Error::storage(
                        format!("{}: {} already exists as a file", OP, path),
                        "EEXIST",
                    ));
                }

                if options.recursive {
                    let mut dirs = Vec::new();
                    let mut current = dirname(virtual_path);
                    while current != "/" {
                        dirs.push(current.clone());
                        current = dirname(&current);
                    }
                    dirs.reverse();
                    for dir in &dirs {
                        self.ensure_not_file(dir, context).await?;
                    }
                    dirs.push(virtual_path.clone());
                    return Ok(dirs.iter().map(|d| self.dir_key_for(d)).collect());
                }

                let parent = dirname(virtual_path);
                if !self.dir_exists(&self.dir_key_for(&parent), context).await? {
                    self.ensure_not_file(&parent, context).await?;
                    return Err(Error::not_found(path, Some(OP)));
                }
                let dir_key = self.dir_key_for(virtual_path);
                if self.dir_exists(&dir_key, context).await? {
                    return Err(Error::storage(
                        format!("{}: {} already exists", OP, path),
                        "EEXIST",
                    ));
                }
                Ok(vec![dir_key])
            })
            .await?;

        for dir_key in &dir_keys {
            self.runner()
                .run(OP, path, move || async move {
                    self.client().put_object(dir_key, Vec::new(), context).await
                })
                .await?;
        }
        Ok(())
    }

    async fn rmdir(&self, path: &str, options: RmdirOptions) -> Result<()> {
        const OP: &str = "rmdir";
        let virtual_path = virtual_path(path, OP)?;
        if virtual_path == "/" {
            return Err(Error::permission_denied(path, Some(OP)));
        }
        let dir_key = self.dir_key_for(&virtual_path);
        let dir_key = &dir_key;
        let context = &ErrorContext::new(OP, path);

        if !options.recursive {
            // The placeholder sorts first, so two keys settle emptiness.
            let page = self
                .runner()
                .run(OP, path, move || async move {
                    self.client()
                        .list_page(dir_key, None, None, Some(2), context)
                        .await
                })
                .await?;
            if page.keys.is_empty() {
                return Err(Error::not_found(path, Some(OP)));
            }
            if page.keys.iter().any(|k| k != dir_key) {
                return Err(Error::storage(
                    format!("{}: {} is not empty", OP, path),
                    "ENOTEMPTY",
                ));
            }
            return self
                .runner()
                .run(OP, path, move || async move {
                    self.client().delete_object(dir_key, context).await
                })
                .await;
        }

        let (keys, _) = self
            .runner()
            .run(OP, path, move || async move {
                self.list_all(dir_key, None, context).await
            })
            .await?;
        if keys.is_empty() {
            return Err(Error::not_found(path, Some(OP)));
        }
        let keys = &keys;
        self.runner()
            .run(OP, path, move || async move {
                self.client().delete_many(keys, context).await
            })
            .await
    }

    async fn stat(&self, path: &str) -> Result<FileStats> {
        const OP: &str = "stat";
        let virtual_path = virtual_path(path, OP)?;
        let virtual_path = &virtual_path;
        let context = &ErrorContext::new(OP, path);
        self.runner()
            .run(OP, path, move || async move {
                self.stat_virtual(virtual_path, context).await
            })
            .await
    }

    async fn lstat(&self, path: &str) -> Result<FileStats> {
        const OP: &str = "lstat";
        let virtual_path = virtual_path(path, OP)?;
        let virtual_path = &virtual_path;
        let context = &ErrorContext::new(OP, path);
        self.runner()
            .run(OP, path, move || async move {
                self.stat_virtual(virtual_path, context).await
            })
            .await
    }

    async fn access(&self, path: &str, _mode: AccessMode) -> Result<()> {
        const OP: &str = "access";
        let virtual_path = virtual_path(path, OP)?;
        let virtual_path = &virtual_path;
        let context = &ErrorContext::new(OP, path);
        self.runner()
            .run(OP, path, move || async move {
                self.stat_virtual(virtual_path, context).await.map(|_| ())
            })
            .await
    }

    fn create_read_stream(&self, path: &str, options: ReadStreamOptions) -> ReadStream {
        let this = self.clone();
        let path = path.to_string();
        Box::pin(LazyReader::new(async move {
            this.open_read(&path, options).await
        }))
    }

    fn create_write_stream(&self, path: &str, options: WriteStreamOptions) -> WriteStream {
        const OP: &str = "createWriteStream";
        if options.append {
            return Box::pin(LazyWriter::failed(Error::validation(format!(
                "{}: append mode is not supported by object storage",
                OP
            ))));
        }
        match self.object_path(path, OP) {
            Ok((_, key)) => {
                let client = Arc::clone(&self.inner.client);
                let path = path.to_string();
                Box::pin(LazyWriter::new(async move {
                    let stream: WriteStream = Box::pin(S3WriteStream::spawn(client, key, &path));
                    Ok(stream)
                }))
            }
            Err(e) => Box::pin(LazyWriter::failed(e)),
        }
    }

    async fn exists(&self, path: &str) -> bool {
        self.stat(path).await.is_ok()
    }

    async fn realpath(&self, path: &str) -> Result<String> {
        const OP: &str = "realpath";
        let virtual_path = virtual_path(path, OP)?;
        let virtual_path = &virtual_path;
        let context = &ErrorContext::new(OP, path);
        self.runner()
            .run(OP, path, move || async move {
                self.stat_virtual(virtual_path, context).await?;
                Ok(virtual_path.clone())
            })
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::logging_impl::Logger;
    use std::time::Duration;

    fn s3(prefix: &str) -> S3Fs {
        let config = ResolvedS3 {
            bucket: "bucket".to_string(),
            region: "us-east-1".to_string(),
            access_key_id: Some("AKID".to_string()),
            secret_access_key: Some("secret".to_string()),
            session_token: None,
            endpoint: Some("http://127.0.0.1:9".to_string()),
            force_path_style: true,
            prefix: prefix.to_string(),
            timeout: Duration::from_secs(1),
            max_retries: 0,
        };
        let common = ResolvedCommon {
            timeout: Duration::from_secs(1),
            max_retries: 0,
            debug: false,
            logger: Logger::noop(),
        };
        S3Fs::new(&config, &common).unwrap()
    }

    #[test]
    fn prefixes_are_normalized() {
        assert_eq!(normalize_prefix(""), "");
        assert_eq!(normalize_prefix("/"), "");
        assert_eq!(normalize_prefix("/tenants/a/"), "tenants/a/");
        assert_eq!(normalize_prefix("tenants"), "tenants/");
    }

    #[test]
    fn keys_carry_the_prefix() {
        let fs = s3("tenant");
        assert_eq!(fs.prefix(), "tenant/");
        assert_eq!(fs.key_for("/docs/a.txt"), "tenant/docs/a.txt");
        assert_eq!(fs.dir_key_for("/docs"), "tenant/docs/");
        assert_eq!(fs.dir_key_for("/"), "tenant/");

        let bare = s3("");
        assert_eq!(bare.key_for("/a"), "a");
        assert_eq!(bare.dir_key_for("/"), "");
        assert_eq!(bare.dir_key_for("/a/b"), "a/b/");
    }

    #[test]
    fn root_is_not_an_object() {
        let fs = s3("");
        let err = fs.object_path("/", "readFile").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert_eq!(err.code(), Some("EISDIR"));
        let (virtual_path, key) = fs.object_path("a/../b.txt", "readFile").unwrap();
        assert_eq!(virtual_path, "/b.txt");
        assert_eq!(key, "b.txt");
    }

    #[tokio::test]
    async fn append_streams_are_rejected() {
        use tokio::io::AsyncWriteExt;
        let fs = s3("");
        let mut stream = fs.create_write_stream("a.log", WriteStreamOptions { append: true });
        let err = stream.write_all(b"x").await.unwrap_err();
        let err = Error::from_io(err, &ErrorContext::path("a.log"));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn escaping_paths_never_reach_the_network() {
        let fs = s3("tenant");
        let err = fs.read_file("../other-tenant/secret").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert!(!fs.exists("../x").await);
    }
}
