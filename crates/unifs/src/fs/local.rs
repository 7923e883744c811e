//! Local disk backend.
//!
//! Every caller path is resolved against `base_path` as a `/`-rooted virtual
//! path; paths that climb above the base are refused with a permission error.
//!
//! `write_file` is atomic: data goes to a hidden temp file next to the
//! target and is renamed over it. A failed or cancelled write leaves the
//! previous content in place and removes the temp file. A symlink at the
//! target is written through, as long as it resolves inside the base.

use async_trait::async_trait;
use rand::Rng;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::runner::OperationRunner;
use super::stream::{LazyReader, LazyWriter};
use super::traits::{
    AccessMode, FileStats, FileType, Filesystem, MkdirOptions, ReadStream, ReadStreamOptions,
    RmdirOptions, WriteStream, WriteStreamOptions,
};
use super::virtual_path;
use crate::config::{ResolvedCommon, ResolvedLocal};
use crate::error::{Error, ErrorContext, Result, map_error};
use crate::logging_impl::OperationLog;

/// Filesystem rooted at a directory on the host.
#[derive(Clone)]
pub struct LocalFs {
    inner: Arc<LocalInner>,
}

struct LocalInner {
    base: PathBuf,
    create_missing_dirs: bool,
    runner: OperationRunner,
}

fn io_error(err: io::Error, operation: &str, path: &str) -> Error {
    map_error(err, &ErrorContext::new(operation, path))
}

impl LocalFs {
    pub fn new(config: &ResolvedLocal, common: &ResolvedCommon) -> Self {
        let log = OperationLog::new("local", common.debug, common.logger.clone());
        log.debug(&format!(
            "rooted at {} (create_missing_dirs={})",
            config.base_path.display(),
            config.create_missing_dirs
        ));
        Self {
            inner: Arc::new(LocalInner {
                base: config.base_path.clone(),
                create_missing_dirs: config.create_missing_dirs,
                runner: OperationRunner::new(common.timeout, common.max_retries, log),
            }),
        }
    }

    /// Directory all paths are resolved against.
    pub fn base_path(&self) -> &Path {
        &self.inner.base
    }

    fn runner(&self) -> &OperationRunner {
        &self.inner.runner
    }

    /// Host path for a caller path.
    fn resolve(&self, path: &str, operation: &str) -> Result<PathBuf> {
        let virtual_path = virtual_path(path, operation)?;
        let relative = virtual_path.trim_start_matches('/');
        if relative.is_empty() {
            Ok(self.inner.base.clone())
        } else {
            Ok(self.inner.base.join(relative))
        }
    }

    /// File an atomic write replaces: `host` itself, or the file a symlink
    /// at `host` points to. Links leading outside the base are refused.
    async fn write_target(&self, host: &Path, operation: &str, path: &str) -> Result<PathBuf> {
        match fs::symlink_metadata(host).await {
            Ok(meta) if meta.file_type().is_symlink() => {}
            _ => return Ok(host.to_path_buf()),
        }
        let resolve = async {
            let link = fs::read_link(host).await?;
            let joined = match host.parent() {
                Some(parent) => parent.join(link),
                None => link,
            };
            let resolved = match fs::canonicalize(&joined).await {
                Ok(resolved) => resolved,
                // Dangling link: the write creates the file it names.
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    let (Some(parent), Some(name)) = (joined.parent(), joined.file_name()) else {
                        return Err(e);
                    };
                    fs::canonicalize(parent).await?.join(name)
                }
                Err(e) => return Err(e),
            };
            let base = fs::canonicalize(&self.inner.base).await?;
            Ok::<_, io::Error>((resolved, base))
        };
        let (resolved, base) = resolve.await.map_err(|e| io_error(e, operation, path))?;
        if !resolved.starts_with(&base) {
            return Err(Error::permission_denied(path, Some(operation)));
        }
        Ok(resolved)
    }

    async fn ensure_parent(&self, host: &Path) -> io::Result<()> {
        if !self.inner.create_missing_dirs {
            return Ok(());
        }
        match host.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent).await,
            _ => Ok(()),
        }
    }

    async fn open_read(&self, path: &str, options: ReadStreamOptions) -> Result<ReadStream> {
        const OP: &str = "createReadStream";
        let host = self.resolve(path, OP)?;
        let mut file = fs::File::open(&host)
            .await
            .map_err(|e| io_error(e, OP, path))?;
        let start = options.start.unwrap_or(0);
        if start > 0 {
            file.seek(SeekFrom::Start(start))
                .await
                .map_err(|e| io_error(e, OP, path))?;
        }
        match options.end {
            Some(end) => {
                let len = if end >= start { end - start + 1 } else { 0 };
                Ok(Box::pin(file.take(len)))
            }
            None => Ok(Box::pin(file)),
        }
    }

    async fn open_write(&self, path: &str, options: WriteStreamOptions) -> Result<WriteStream> {
        const OP: &str = "createWriteStream";
        let host = self.resolve(path, OP)?;
        self.ensure_parent(&host)
            .await
            .map_err(|e| io_error(e, OP, path))?;
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .append(options.append)
            .truncate(!options.append)
            .open(&host)
            .await
            .map_err(|e| io_error(e, OP, path))?;
        Ok(Box::pin(file))
    }
}

/// Removes a temp file unless disarmed.
struct TempGuard {
    path: Option<PathBuf>,
}

impl TempGuard {
    fn disarm(&mut self) {
        self.path = None;
    }
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn temp_path_for(target: &Path) -> io::Result<PathBuf> {
    let name = target
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let suffix: u64 = rand::rng().random();
    Ok(target.with_file_name(format!(
        ".{}.{:016x}.tmp",
        name.to_string_lossy(),
        suffix
    )))
}

async fn write_atomic(target: &Path, data: &[u8]) -> io::Result<()> {
    let existing = match fs::metadata(target).await {
        Ok(meta) if meta.is_dir() => {
            return Err(io::Error::new(
                io::ErrorKind::IsADirectory,
                "is a directory",
            ));
        }
        Ok(meta) => Some(meta.permissions()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(e),
    };

    let temp = temp_path_for(target)?;
    let mut guard = TempGuard {
        path: Some(temp.clone()),
    };
    fs::write(&temp, data).await?;
    if let Some(permissions) = existing {
        fs::set_permissions(&temp, permissions).await?;
    }
    fs::rename(&temp, target).await?;
    guard.disarm();
    Ok(())
}

#[cfg(unix)]
fn system_time(secs: i64, nanos: i64) -> Option<SystemTime> {
    let secs = u64::try_from(secs).ok()?;
    let nanos = u32::try_from(nanos).ok()?;
    UNIX_EPOCH.checked_add(Duration::new(secs, nanos))
}

fn file_stats(meta: &std::fs::Metadata) -> FileStats {
    let ft = meta.file_type();
    let file_type = if ft.is_symlink() {
        FileType::Symlink
    } else if ft.is_dir() {
        FileType::Directory
    } else {
        FileType::File
    };
    let mtime = meta.modified().unwrap_or(UNIX_EPOCH);
    let atime = meta.accessed().unwrap_or(mtime);
    let birthtime = meta.created().unwrap_or(mtime);

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        FileStats {
            file_type,
            size: meta.len(),
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            nlink: meta.nlink(),
            mtime,
            atime,
            ctime: system_time(meta.ctime(), meta.ctime_nsec()).unwrap_or(mtime),
            birthtime,
        }
    }

    #[cfg(not(unix))]
    {
        let mut stats = FileStats::synthetic(file_type, meta.len(), mtime);
        if meta.permissions().readonly() {
            stats.mode &= !0o222;
        }
        stats.atime = atime;
        stats.birthtime = birthtime;
        stats
    }
}

/// Check `mode` against the permission bits of an existing entry.
fn check_access(meta: &std::fs::Metadata, mode: AccessMode) -> bool {
    if mode.contains(AccessMode::WRITE) && meta.permissions().readonly() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let bits = meta.permissions().mode();
        if mode.contains(AccessMode::READ) && bits & 0o444 == 0 {
            return false;
        }
        if mode.contains(AccessMode::EXECUTE) && bits & 0o111 == 0 {
            return false;
        }
    }
    true
}

#[async_trait]
impl Filesystem for LocalFs {
    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        const OP: &str = "readFile";
        let host = self.resolve(path, OP)?;
        let host = &host;
        self.runner()
            .run(OP, path, move || async move {
                fs::read(host).await.map_err(|e| io_error(e, OP, path))
            })
            .await
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        const OP: &str = "writeFile";
        let host = self.resolve(path, OP)?;
        let host = &host;
        self.runner()
            .run(OP, path, move || async move {
                self.ensure_parent(host)
                    .await
                    .map_err(|e| io_error(e, OP, path))?;
                let target = self.write_target(host, OP, path).await?;
                write_atomic(&target, data)
                    .await
                    .map_err(|e| io_error(e, OP, path))
            })
            .await
    }

    async fn append_file(&self, path: &str, data: &[u8]) -> Result<()> {
        const OP: &str = "appendFile";
        let host = self.resolve(path, OP)?;
        let host = &host;
        let append = async {
            self.ensure_parent(host).await?;
            let mut file = fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(host)
                .await?;
            file.write_all(data).await?;
            file.flush().await
        };
        self.runner()
            .run_once(OP, path, async move {
                append.await.map_err(|e| io_error(e, OP, path))
            })
            .await
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        const OP: &str = "unlink";
        let host = self.resolve(path, OP)?;
        let host = &host;
        self.runner()
            .run(OP, path, move || async move {
                fs::remove_file(host)
                    .await
                    .map_err(|e| io_error(e, OP, path))
            })
            .await
    }

    async fn copy_file(&self, src: &str, dest: &str) -> Result<()> {
        const OP: &str = "copyFile";
        let from = self.resolve(src, OP)?;
        let to = self.resolve(dest, OP)?;
        let (from, to) = (&from, &to);
        self.runner()
            .run(OP, src, move || async move {
                fs::metadata(from)
                    .await
                    .map_err(|e| io_error(e, OP, src))?;
                self.ensure_parent(to)
                    .await
                    .map_err(|e| io_error(e, OP, dest))?;
                fs::copy(from, to)
                    .await
                    .map_err(|e| io_error(e, OP, dest))?;
                Ok(())
            })
            .await
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        const OP: &str = "rename";
        let from = self.resolve(old_path, OP)?;
        let to = self.resolve(new_path, OP)?;
        self.runner()
            .run_once(OP, old_path, async {
                fs::symlink_metadata(&from)
                    .await
                    .map_err(|e| io_error(e, OP, old_path))?;
                self.ensure_parent(&to)
                    .await
                    .map_err(|e| io_error(e, OP, new_path))?;
                fs::rename(&from, &to)
                    .await
                    .map_err(|e| io_error(e, OP, new_path))
            })
            .await
    }

    async fn readdir(&self, path: &str) -> Result<Vec<String>> {
        const OP: &str = "readdir";
        let host = self.resolve(path, OP)?;
        let host = &host;
        self.runner()
            .run(OP, path, move || async move {
                let list = async {
                    let mut entries = fs::read_dir(host).await?;
                    let mut names = Vec::new();
                    while let Some(entry) = entries.next_entry().await? {
                        names.push(entry.file_name().to_string_lossy().into_owned());
                    }
                    names.sort();
                    Ok::<_, io::Error>(names)
                };
                list.await.map_err(|e| io_error(e, OP, path))
            })
            .await
    }

    async fn mkdir(&self, path: &str, options: MkdirOptions) -> Result<()> {
        const OP: &str = "mkdir";
        let host = self.resolve(path, OP)?;
        let host = &host;
        self.runner()
            .run(OP, path, move || async move {
                let result = if options.recursive {
                    fs::create_dir_all(host).await
                } else {
                    match self.ensure_parent(host).await {
                        Ok(()) => fs::create_dir(host).await,
                        Err(e) => Err(e),
                    }
                };
                result.map_err(|e| io_error(e, OP, path))
            })
            .await
    }

    async fn rmdir(&self, path: &str, options: RmdirOptions) -> Result<()> {
        const OP: &str = "rmdir";
        let host = self.resolve(path, OP)?;
        if host == self.inner.base {
            return Err(Error::permission_denied(path, Some(OP)));
        }
        let host = &host;
        self.runner()
            .run(OP, path, move || async move {
                let result = if options.recursive {
                    fs::remove_dir_all(host).await
                } else {
                    fs::remove_dir(host).await
                };
                result.map_err(|e| io_error(e, OP, path))
            })
            .await
    }

    async fn stat(&self, path: &str) -> Result<FileStats> {
        const OP: &str = "stat";
        let host = self.resolve(path, OP)?;
        let host = &host;
        self.runner()
            .run(OP, path, move || async move {
                let meta = fs::metadata(host)
                    .await
                    .map_err(|e| io_error(e, OP, path))?;
                Ok(file_stats(&meta))
            })
            .await
    }

    async fn lstat(&self, path: &str) -> Result<FileStats> {
        const OP: &str = "lstat";
        let host = self.resolve(path, OP)?;
        let host = &host;
        self.runner()
            .run(OP, path, move || async move {
                let meta = fs::symlink_metadata(host)
                    .await
                    .map_err(|e| io_error(e, OP, path))?;
                Ok(file_stats(&meta))
            })
            .await
    }

    async fn access(&self, path: &str, mode: AccessMode) -> Result<()> {
        const OP: &str = "access";
        let host = self.resolve(path, OP)?;
        let host = &host;
        self.runner()
            .run(OP, path, move || async move {
                let meta = fs::metadata(host)
                    .await
                    .map_err(|e| io_error(e, OP, path))?;
                if check_access(&meta, mode) {
                    Ok(())
                } else {
                    Err(Error::permission_denied(path, Some(OP)))
                }
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
        let this = self.clone();
        let path = path.to_string();
        Box::pin(LazyWriter::new(async move {
            this.open_write(&path, options).await
        }))
    }

    async fn exists(&self, path: &str) -> bool {
        self.stat(path).await.is_ok()
    }

    async fn realpath(&self, path: &str) -> Result<String> {
        const OP: &str = "realpath";
        let host = self.resolve(path, OP)?;
        let host = &host;
        self.runner()
            .run(OP, path, move || async move {
                let canonical = fs::canonicalize(host)
                    .await
                    .map_err(|e| io_error(e, OP, path))?;
                Ok(canonical.to_string_lossy().into_owned())
            })
            .await
    }
}
