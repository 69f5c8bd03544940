//! Durable key=value configuration store.
//!
//! # Responsibilities
//! - Parse the line-oriented `.env` file (comments and blank lines preserved)
//! - Publish updates atomically (temp file + rename)
//! - Serialize writers with an in-process mutex plus an OS advisory lock
//! - Keep timestamped backups and prune them by count
//!
//! # Design Decisions
//! - Lock-unsupported filesystems degrade to unlocked mode (logged)
//! - A concurrent holder of the original file's lock fails the write
//! - Rename failures caused by bind mounts (EXDEV/EBUSY/EPERM/EACCES) fall
//!   back to a locked in-place overwrite; atomicity is lost only there
//! - Backup failures never block the write

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use thiserror::Error;
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::observability::metrics;

/// Characters that force a value to be quoted on write.
const QUOTE_TRIGGERS: [char; 6] = [' ', '#', '"', '\'', '$', '\\'];

/// Errors surfaced to administrative callers.
#[derive(Debug, Error)]
pub enum ConfigStoreError {
    #[error("env path '{0}' is a directory, expected a file")]
    IsDirectory(PathBuf),

    #[error("original file '{0}' is locked by another writer")]
    Locked(PathBuf),

    #[error("failed to acquire file lock on '{path}': {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("source file '{0}' does not exist")]
    Missing(PathBuf),

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("background write task failed: {0}")]
    Join(String),
}

impl ConfigStoreError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub type StoreResult<T> = Result<T, ConfigStoreError>;

/// Publishes a fully written temp file over the destination.
///
/// Production uses `rename`; tests substitute failing implementations to
/// drive the fallback path.
pub trait ReplaceFile: Send + Sync {
    fn replace(&self, from: &Path, to: &Path) -> io::Result<()>;
}

/// `rename(2)`-based replacement.
#[derive(Debug, Default, Clone, Copy)]
pub struct RenameReplace;

impl ReplaceFile for RenameReplace {
    fn replace(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }
}

/// Metadata for one backup file.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BackupInfo {
    pub filename: String,
    pub path: PathBuf,
    pub size: u64,
    #[serde(skip)]
    pub modified: SystemTime,
}

/// Outcome of an advisory lock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockState {
    Locked,
    Unsupported,
}

/// File-backed key=value store with atomic publication.
pub struct ConfigStore {
    env_file: PathBuf,
    backup_dir: PathBuf,
    keep_backups: usize,
    replacer: Arc<dyn ReplaceFile>,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("env_file", &self.env_file)
            .field("backup_dir", &self.backup_dir)
            .field("keep_backups", &self.keep_backups)
            .finish()
    }
}

impl ConfigStore {
    /// Create a store for `env_file`, keeping backups in `backup_dir`.
    pub fn new(env_file: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Self {
        let backup_dir = backup_dir.into();
        if let Err(e) = fs::create_dir_all(&backup_dir) {
            tracing::warn!(dir = %backup_dir.display(), error = %e, "Backup directory unavailable");
        }
        Self {
            env_file: env_file.into(),
            backup_dir,
            keep_backups: 10,
            replacer: Arc::new(RenameReplace),
            write_lock: Mutex::new(()),
        }
    }

    /// Number of backups retained after each write.
    pub fn with_keep_backups(mut self, keep: usize) -> Self {
        self.keep_backups = keep;
        self
    }

    /// Override the publication step.
    pub fn with_replacer(mut self, replacer: Arc<dyn ReplaceFile>) -> Self {
        self.replacer = replacer;
        self
    }

    pub fn env_file(&self) -> &Path {
        &self.env_file
    }

    /// Read and parse the env file. A missing file yields an empty map.
    pub fn load_env(&self) -> StoreResult<BTreeMap<String, String>> {
        if !self.env_file.exists() {
            tracing::info!(path = %self.env_file.display(), "Env file not found, using empty config");
            return Ok(BTreeMap::new());
        }
        let content =
            fs::read_to_string(&self.env_file).map_err(|e| ConfigStoreError::io(&self.env_file, e))?;
        let values = parse_env(&content);
        tracing::debug!(path = %self.env_file.display(), count = values.len(), "Loaded env file");
        Ok(values)
    }

    /// Merge `updates` into the env file.
    ///
    /// Existing keys are rewritten in place, comments and unrelated lines are
    /// kept verbatim, and new keys are appended.
    pub async fn update_env(
        &self,
        updates: BTreeMap<String, String>,
        create_backup: bool,
    ) -> StoreResult<()> {
        if updates.is_empty() {
            return Ok(());
        }

        let _guard = self.write_lock.lock().await;

        let job = WriteJob {
            env_file: self.env_file.clone(),
            backup_dir: self.backup_dir.clone(),
            keep_backups: self.keep_backups,
            replacer: Arc::clone(&self.replacer),
            updates,
            create_backup,
        };

        let result = tokio::task::spawn_blocking(move || job.run())
            .await
            .map_err(|e| ConfigStoreError::Join(e.to_string()))?;

        match &result {
            Ok(count) => {
                metrics::record_config_write(true);
                tracing::info!(path = %self.env_file.display(), count, "Updated env file");
            }
            Err(e) => {
                metrics::record_config_write(false);
                tracing::error!(path = %self.env_file.display(), error = %e, "Failed to update env file");
            }
        }
        result.map(|_| ())
    }

    /// Copy the current env file into the backup directory.
    pub fn create_backup(&self) -> StoreResult<PathBuf> {
        create_backup(&self.env_file, &self.backup_dir)
    }

    /// List backups, newest first.
    pub fn list_backups(&self) -> Vec<BackupInfo> {
        list_backups(&self.env_file, &self.backup_dir)
    }

    /// Delete all but the `keep` newest backups. Returns the number removed.
    pub fn cleanup_old_backups(&self, keep: usize) -> usize {
        cleanup_old_backups(&self.env_file, &self.backup_dir, keep)
    }

    /// Restore the env file from a backup, backing up the current file first.
    pub async fn restore_backup(&self, backup: &Path) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        if !backup.exists() {
            return Err(ConfigStoreError::Missing(backup.to_path_buf()));
        }
        if self.env_file.exists() {
            let current = self.create_backup()?;
            tracing::info!(backup = %current.display(), "Saved current env file before restore");
        }
        fs::copy(backup, &self.env_file).map_err(|e| ConfigStoreError::io(&self.env_file, e))?;
        tracing::info!(from = %backup.display(), "Restored env file from backup");
        Ok(())
    }
}

/// Owned state for one blocking write.
struct WriteJob {
    env_file: PathBuf,
    backup_dir: PathBuf,
    keep_backups: usize,
    replacer: Arc<dyn ReplaceFile>,
    updates: BTreeMap<String, String>,
    create_backup: bool,
}

impl WriteJob {
    fn run(self) -> StoreResult<usize> {
        let env_file = &self.env_file;
        if env_file.is_dir() {
            return Err(ConfigStoreError::IsDirectory(env_file.clone()));
        }

        let parent = match env_file.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(|e| ConfigStoreError::io(&parent, e))?;

        if self.create_backup && env_file.exists() {
            match create_backup(env_file, &self.backup_dir) {
                Ok(_) => {
                    cleanup_old_backups(env_file, &self.backup_dir, self.keep_backups);
                }
                Err(e) => tracing::warn!(error = %e, "Backup skipped"),
            }
        }

        let (stem, suffix) = name_parts(env_file);
        let temp = tempfile::Builder::new()
            .prefix(&format!("{stem}_tmp_"))
            .suffix(&suffix)
            .tempfile_in(&parent)
            .map_err(|e| ConfigStoreError::io(&parent, e))?;
        let (mut temp_file, temp_path) = temp.into_parts();

        lock_blocking(&temp_file, &temp_path)?;

        let rendered = if env_file.exists() {
            let mut original = File::open(env_file).map_err(|e| ConfigStoreError::io(env_file, e))?;
            lock_nonblocking(&original, env_file)?;
            let mut content = String::new();
            original
                .read_to_string(&mut content)
                .map_err(|e| ConfigStoreError::io(env_file, e))?;
            drop(original);
            render_updated(&content, &self.updates)
        } else {
            render_updated("", &self.updates)
        };

        temp_file
            .write_all(rendered.as_bytes())
            .and_then(|_| temp_file.flush())
            .and_then(|_| temp_file.sync_all())
            .map_err(|e| ConfigStoreError::io(&temp_path, e))?;

        match self.replacer.replace(&temp_path, env_file) {
            Ok(()) => {
                // The temp name no longer exists; disarm its cleanup.
                let _ = temp_path.keep();
            }
            Err(e) if is_rename_fallback(&e) => {
                tracing::warn!(
                    error = %e,
                    "Atomic replace failed, falling back to direct write"
                );
                write_in_place(env_file, rendered.as_bytes())?;
            }
            Err(e) => return Err(ConfigStoreError::io(env_file, e)),
        }

        drop(temp_file);
        Ok(self.updates.len())
    }
}

/// Overwrite `path` while holding its lock. Not atomic.
fn write_in_place(path: &Path, content: &[u8]) -> StoreResult<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| ConfigStoreError::io(path, e))?;
    lock_blocking(&file, path)?;
    file.set_len(0)
        .and_then(|_| file.write_all(content))
        .and_then(|_| file.flush())
        .and_then(|_| file.sync_all())
        .map_err(|e| ConfigStoreError::io(path, e))
}

fn is_rename_fallback(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::CrossesDevices | io::ErrorKind::ResourceBusy | io::ErrorKind::PermissionDenied
    )
}

fn lock_blocking(file: &File, path: &Path) -> StoreResult<LockState> {
    match file.lock() {
        Ok(()) => Ok(LockState::Locked),
        Err(e) if e.kind() == io::ErrorKind::Unsupported => {
            tracing::warn!(path = %path.display(), "File lock not supported, continuing without lock");
            Ok(LockState::Unsupported)
        }
        Err(e) => Err(ConfigStoreError::Lock {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

fn lock_nonblocking(file: &File, path: &Path) -> StoreResult<LockState> {
    match file.try_lock() {
        Ok(()) => Ok(LockState::Locked),
        Err(TryLockError::WouldBlock) => Err(ConfigStoreError::Locked(path.to_path_buf())),
        Err(TryLockError::Error(e)) if e.kind() == io::ErrorKind::Unsupported => {
            tracing::warn!(path = %path.display(), "File lock not supported, continuing without lock");
            Ok(LockState::Unsupported)
        }
        Err(TryLockError::Error(e)) => Err(ConfigStoreError::Lock {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Split a file name into the stem and suffix used for backup/temp names.
/// `.env` has stem `.env` and an empty suffix.
fn name_parts(path: &Path) -> (String, String) {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "config".to_string());
    let suffix = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (stem, suffix)
}

fn create_backup(env_file: &Path, backup_dir: &Path) -> StoreResult<PathBuf> {
    if !env_file.exists() {
        return Err(ConfigStoreError::Missing(env_file.to_path_buf()));
    }
    fs::create_dir_all(backup_dir).map_err(|e| ConfigStoreError::io(backup_dir, e))?;

    let stamp = OffsetDateTime::now_utc()
        .format(format_description!(
            "[year][month][day]_[hour][minute][second]_[subsecond digits:6]"
        ))
        .unwrap_or_else(|_| OffsetDateTime::now_utc().unix_timestamp_nanos().to_string());
    let (stem, suffix) = name_parts(env_file);

    // Never reuse a name: a clash within the same microsecond gets a counter.
    let mut attempt = 0u32;
    let (backup_path, mut target) = loop {
        let name = if attempt == 0 {
            format!("{stem}_{stamp}{suffix}")
        } else {
            format!("{stem}_{stamp}_{attempt}{suffix}")
        };
        let path = backup_dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => break (path, file),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
            Err(e) => return Err(ConfigStoreError::io(&path, e)),
        }
    };

    let mut source = File::open(env_file).map_err(|e| ConfigStoreError::io(env_file, e))?;
    io::copy(&mut source, &mut target).map_err(|e| ConfigStoreError::io(&backup_path, e))?;
    target.sync_all().map_err(|e| ConfigStoreError::io(&backup_path, e))?;
    tracing::info!(backup = %backup_path.display(), "Created env backup");
    Ok(backup_path)
}

fn list_backups(env_file: &Path, backup_dir: &Path) -> Vec<BackupInfo> {
    let (stem, suffix) = name_parts(env_file);
    let prefix = format!("{stem}_");
    let temp_prefix = format!("{stem}_tmp_");

    let entries = match fs::read_dir(backup_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(dir = %backup_dir.display(), error = %e, "Failed to list backups");
            return Vec::new();
        }
    };

    let mut backups: Vec<BackupInfo> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let filename = entry.file_name().to_string_lossy().into_owned();
            if !filename.starts_with(&prefix)
                || filename.starts_with(&temp_prefix)
                || !filename.ends_with(&suffix)
            {
                return None;
            }
            let meta = entry.metadata().ok()?;
            if !meta.is_file() {
                return None;
            }
            Some(BackupInfo {
                filename,
                path: entry.path(),
                size: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            })
        })
        .collect();

    // Newest first; names embed the timestamp, so they break mtime ties.
    backups.sort_by(|a, b| {
        b.modified
            .cmp(&a.modified)
            .then_with(|| b.filename.cmp(&a.filename))
    });
    backups
}

fn cleanup_old_backups(env_file: &Path, backup_dir: &Path, keep: usize) -> usize {
    let mut deleted = 0;
    for backup in list_backups(env_file, backup_dir).into_iter().skip(keep) {
        match fs::remove_file(&backup.path) {
            Ok(()) => {
                deleted += 1;
                tracing::debug!(backup = %backup.filename, "Deleted old backup");
            }
            Err(e) => tracing::warn!(backup = %backup.filename, error = %e, "Failed to delete backup"),
        }
    }
    deleted
}

/// Parse env file content into a map. Later duplicates win.
pub fn parse_env(content: &str) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();
    for raw in content.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        values.insert(key.to_string(), unquote(value.trim()));
    }
    values
}

fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == b'\'' && last == b'\'' {
            return value[1..value.len() - 1].to_string();
        }
        if first == b'"' && last == b'"' {
            return value[1..value.len() - 1].replace("\\\"", "\"");
        }
    }
    // Unquoted values may carry a trailing ` # comment`.
    match value.find(" #") {
        Some(idx) => value[..idx].trim_end().to_string(),
        None => value.to_string(),
    }
}

/// Quote a value for writing when it contains special characters.
pub fn quote_value(value: &str) -> String {
    if !value.contains(QUOTE_TRIGGERS) {
        return value.to_string();
    }
    if !value.contains('\'') {
        format!("'{value}'")
    } else if !value.contains('"') {
        format!("\"{value}\"")
    } else {
        format!("\"{}\"", value.replace('"', "\\\""))
    }
}

/// Apply `updates` to existing file content, preserving layout.
pub fn render_updated(original: &str, updates: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(original.len() + 64);
    let mut written = std::collections::BTreeSet::new();

    for raw in original.lines() {
        let line = raw.trim_end();
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            out.push_str(line);
            out.push('\n');
            continue;
        }
        let key = line.split_once('=').map(|(k, _)| k.trim());
        match key.and_then(|k| updates.get_key_value(k)) {
            Some((key, value)) => {
                out.push_str(&format!("{key}={}\n", quote_value(value)));
                written.insert(key.as_str());
            }
            None => {
                out.push_str(line);
                out.push('\n');
            }
        }
    }

    for (key, value) in updates {
        if !written.contains(key.as_str()) {
            out.push_str(&format!("{key}={}\n", quote_value(value)));
        }
    }
    out
}

/// Write `content` to `path` through a temp file in the same directory.
///
/// Used for the JSON side files, which have no layout to preserve.
pub fn write_atomic(path: &Path, content: &[u8]) -> StoreResult<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).map_err(|e| ConfigStoreError::io(&parent, e))?;

    let mut temp = tempfile::NamedTempFile::new_in(&parent).map_err(|e| ConfigStoreError::io(&parent, e))?;
    temp.write_all(content)
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|e| ConfigStoreError::io(path, e))?;

    match temp.persist(path) {
        Ok(_) => Ok(()),
        Err(e) if is_rename_fallback(&e.error) => {
            tracing::warn!(path = %path.display(), error = %e.error, "Atomic replace failed, falling back to direct write");
            write_in_place(path, content)
        }
        Err(e) => Err(ConfigStoreError::io(path, e.error)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BusyReplace;

    impl ReplaceFile for BusyReplace {
        fn replace(&self, _from: &Path, _to: &Path) -> io::Result<()> {
            Err(io::Error::from(io::ErrorKind::ResourceBusy))
        }
    }

    struct BrokenReplace;

    impl ReplaceFile for BrokenReplace {
        fn replace(&self, _from: &Path, _to: &Path) -> io::Result<()> {
            Err(io::Error::from(io::ErrorKind::NotFound))
        }
    }

    fn store_in(dir: &Path) -> ConfigStore {
        ConfigStore::new(dir.join(".env"), dir.join("backups"))
    }

    fn updates(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_env() {
        let parsed = parse_env(
            "# header\nA=1\n\nB='two words'\nC=\"say \\\"hi\\\"\"\nexport D=4\nE=plain # trailing\nnot a pair\n",
        );
        assert_eq!(parsed["A"], "1");
        assert_eq!(parsed["B"], "two words");
        assert_eq!(parsed["C"], "say \"hi\"");
        assert_eq!(parsed["D"], "4");
        assert_eq!(parsed["E"], "plain");
        assert_eq!(parsed.len(), 5);
    }

    #[test]
    fn test_quote_value() {
        assert_eq!(quote_value("simple"), "simple");
        assert_eq!(quote_value("has space"), "'has space'");
        assert_eq!(quote_value("it's $HOME"), "\"it's $HOME\"");
        assert_eq!(quote_value("both ' and \""), "\"both ' and \\\"\"");
    }

    #[test]
    fn test_quoted_values_survive_round_trip() {
        let rendered = render_updated("", &updates(&[("K", "a b $c")]));
        assert_eq!(parse_env(&rendered)["K"], "a b $c");
    }

    #[test]
    fn test_render_preserves_comments_and_appends() {
        let out = render_updated("K=old\n#comment\nOTHER=x\n", &updates(&[("K", "v"), ("NEW", "n")]));
        assert_eq!(out, "K=v\n#comment\nOTHER=x\nNEW=n\n");
    }

    #[tokio::test]
    async fn test_update_env_preserves_comment() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        fs::write(store.env_file(), "K=old\n#comment\n").unwrap();

        store.update_env(updates(&[("K", "v")]), true).await.unwrap();

        let content = fs::read_to_string(store.env_file()).unwrap();
        assert_eq!(content, "K=v\n#comment\n");
        assert_eq!(store.load_env().unwrap()["K"], "v");
        assert_eq!(store.list_backups().len(), 1);
    }

    #[tokio::test]
    async fn test_update_env_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("nested/.env"), dir.path().join("backups"));

        store.update_env(updates(&[("PORT", "9000")]), true).await.unwrap();

        assert_eq!(store.load_env().unwrap()["PORT"], "9000");
        assert!(store.list_backups().is_empty());
    }

    #[tokio::test]
    async fn test_busy_rename_falls_back_to_direct_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).with_replacer(Arc::new(BusyReplace));
        fs::write(store.env_file(), "K=old\n#comment\n").unwrap();

        store.update_env(updates(&[("K", "v")]), false).await.unwrap();

        assert_eq!(fs::read_to_string(store.env_file()).unwrap(), "K=v\n#comment\n");
        // No temp files left behind.
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().contains("_tmp_"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_unrecoverable_rename_leaves_original_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).with_replacer(Arc::new(BrokenReplace));
        fs::write(store.env_file(), "K=old\n").unwrap();

        let err = store.update_env(updates(&[("K", "v")]), false).await;

        assert!(err.is_err());
        assert_eq!(fs::read_to_string(store.env_file()).unwrap(), "K=old\n");
    }

    #[tokio::test]
    async fn test_directory_path_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join(".env")).unwrap();
        let store = store_in(dir.path());

        let err = store.update_env(updates(&[("K", "v")]), false).await.unwrap_err();
        assert!(matches!(err, ConfigStoreError::IsDirectory(_)));
    }

    #[tokio::test]
    async fn test_concurrent_updates_serialize() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store_in(dir.path()));

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .update_env(updates(&[(&format!("KEY_{i}"), "x")]), false)
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.load_env().unwrap().len(), 8);
    }

    #[test]
    fn test_backup_pruning_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        fs::write(store.env_file(), "K=1\n").unwrap();
        for stamp in ["20240101_000001", "20240101_000002", "20240101_000003"] {
            fs::write(dir.path().join("backups").join(format!(".env_{stamp}")), "K=1\n").unwrap();
        }

        let deleted = store.cleanup_old_backups(2);

        assert_eq!(deleted, 1);
        let names: Vec<String> = store.list_backups().into_iter().map(|b| b.filename).collect();
        assert_eq!(names, vec![".env_20240101_000003", ".env_20240101_000002"]);
    }

    #[tokio::test]
    async fn test_restore_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        fs::write(store.env_file(), "K=old\n").unwrap();
        let backup = store.create_backup().unwrap();
        fs::write(store.env_file(), "K=new\n").unwrap();

        store.restore_backup(&backup).await.unwrap();

        assert_eq!(store.load_env().unwrap()["K"], "old");
    }

    #[test]
    fn test_backups_in_quick_succession_are_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        fs::write(store.env_file(), "K=1\n").unwrap();
        let first = store.create_backup().unwrap();
        fs::write(store.env_file(), "K=2\n").unwrap();
        let second = store.create_backup().unwrap();

        assert_ne!(first, second);
        assert_eq!(fs::read_to_string(&first).unwrap(), "K=1\n");
        assert_eq!(fs::read_to_string(&second).unwrap(), "K=2\n");
        assert_eq!(store.list_backups().len(), 2);
    }

    #[test]
    fn test_write_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("headers.json");
        write_atomic(&path, b"{\"a\":1}").unwrap();
        write_atomic(&path, b"{\"a\":2}").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"a\":2}");
    }
}
