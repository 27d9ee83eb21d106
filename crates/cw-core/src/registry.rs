//! Persistent task registry.
//!
//! The registry is a single JSON document (`tasks.json`) holding every task
//! plus the daemon record. Every mutation is a transaction:
//!
//! 1. take the guard file `tasks.json.lock` (`O_CREAT | O_EXCL`),
//! 2. reload the document from disk,
//! 3. apply the change,
//! 4. write a temp file and rename it over the document.
//!
//! The CLI and the daemon can therefore both mutate the registry without
//! losing each other's writes, and a crash mid-write never leaves a
//! half-written document behind.
//!
//! A document that exists but cannot be parsed is reported as
//! [`RegistryError::CorruptState`]; it is never replaced by an empty one.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cron::{CronError, CronExpr};
use crate::types::{now_epoch_secs, DaemonRecord, RegistryDocument, Task};

/// How long a mutation waits for another writer's guard file.
const LOCK_TIMEOUT: Duration = Duration::from_millis(1500);

/// Guard files older than this are assumed to belong to a crashed writer.
const STALE_LOCK_AGE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    InvalidExpression(#[from] CronError),
    #[error("task `{0}` not found")]
    NotFound(String),
    #[error("corrupt registry document at {}: {reason}", path.display())]
    CorruptState { path: PathBuf, reason: String },
    #[error("registry I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out waiting for registry lock {}", .0.display())]
    Locked(PathBuf),
}

impl RegistryError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        RegistryError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// In-memory snapshot of the registry document bound to its file.
#[derive(Debug)]
pub struct TaskRegistry {
    path: PathBuf,
    document: RegistryDocument,
}

impl TaskRegistry {
    /// Open the registry at `path`, loading it if it exists.
    ///
    /// A missing file yields an empty registry; the file is created by the
    /// first mutation.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let mut registry = Self {
            path: path.into(),
            document: RegistryDocument::default(),
        };
        registry.load()?;
        Ok(registry)
    }

    /// The document file this registry reads and writes.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The current in-memory document.
    pub fn document(&self) -> &RegistryDocument {
        &self.document
    }

    /// Replace the in-memory snapshot with the document on disk.
    pub fn load(&mut self) -> Result<(), RegistryError> {
        self.document = read_document(&self.path)?;
        debug!(
            path = %self.path.display(),
            tasks = self.document.tasks.len(),
            "registry loaded"
        );
        Ok(())
    }

    /// Write the in-memory snapshot to disk as-is.
    pub fn save(&self) -> Result<(), RegistryError> {
        let _guard = RegistryGuard::acquire(&self.lock_path(), LOCK_TIMEOUT)?;
        write_document(&self.path, &self.document)
    }

    /// Run `f` against the freshest on-disk document and persist the result.
    ///
    /// Nothing is written when `f` returns an error.
    pub fn transaction<R>(
        &mut self,
        f: impl FnOnce(&mut RegistryDocument) -> Result<R, RegistryError>,
    ) -> Result<R, RegistryError> {
        let _guard = RegistryGuard::acquire(&self.lock_path(), LOCK_TIMEOUT)?;
        let mut document = read_document(&self.path)?;
        let out = f(&mut document)?;
        write_document(&self.path, &document)?;
        self.document = document;
        Ok(out)
    }

    /// Add a task scheduled from the current time.
    pub fn add(
        &mut self,
        cron_expression: &str,
        instructions_reference: &str,
    ) -> Result<Task, RegistryError> {
        self.add_at(cron_expression, instructions_reference, now_epoch_secs())
    }

    /// Add a task whose first `next_run` is computed from `now`.
    pub fn add_at(
        &mut self,
        cron_expression: &str,
        instructions_reference: &str,
        now: i64,
    ) -> Result<Task, RegistryError> {
        let expr = CronExpr::parse(cron_expression)?;
        let next_run = expr.next_after_epoch(now)?;

        let task = self.transaction(|doc| {
            let mut task = Task::new(
                fresh_id(doc),
                expr.as_str(),
                instructions_reference,
                now,
            );
            task.next_run = Some(next_run);
            doc.tasks.push(task.clone());
            Ok(task)
        })?;

        info!(task_id = %task.id, cron = %task.cron_expression, next_run, "task added");
        Ok(task)
    }

    /// Remove a task by id.
    pub fn remove(&mut self, id: &str) -> Result<(), RegistryError> {
        self.transaction(|doc| {
            let index = doc
                .tasks
                .iter()
                .position(|t| t.id == id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            doc.tasks.remove(index);
            Ok(())
        })?;
        info!(task_id = %id, "task removed");
        Ok(())
    }

    /// Snapshot of every task in insertion order.
    pub fn list(&self) -> Vec<Task> {
        self.document.tasks.clone()
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.document.task(id).cloned()
    }

    /// Apply `mutator` to one task and persist.
    pub fn update(
        &mut self,
        id: &str,
        mutator: impl FnOnce(&mut Task),
    ) -> Result<Task, RegistryError> {
        self.transaction(|doc| {
            let task = doc
                .task_mut(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            mutator(task);
            Ok(task.clone())
        })
    }

    pub fn daemon_record(&self) -> Option<DaemonRecord> {
        self.document.daemon_record()
    }

    /// Persist (or clear, with `None`) the daemon record.
    pub fn set_daemon_record(&mut self, record: Option<DaemonRecord>) -> Result<(), RegistryError> {
        self.transaction(|doc| {
            doc.set_daemon_record(record);
            Ok(())
        })
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }
}

/// Short random id not yet used in `doc`.
fn fresh_id(doc: &RegistryDocument) -> String {
    loop {
        let id = Uuid::new_v4().simple().to_string()[..8].to_string();
        if doc.task(&id).is_none() {
            return id;
        }
    }
}

fn read_document(path: &Path) -> Result<RegistryDocument, RegistryError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(RegistryDocument::default());
        }
        Err(e) => return Err(RegistryError::io(path, e)),
    };

    serde_json::from_slice(&bytes).map_err(|e| RegistryError::CorruptState {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn write_document(path: &Path, document: &RegistryDocument) -> Result<(), RegistryError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| RegistryError::io(parent, e))?;
    }

    let mut json = serde_json::to_vec_pretty(document).map_err(|e| RegistryError::Io {
        path: path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
    })?;
    json.push(b'\n');

    let tmp_path = path.with_extension("tmp");
    let mut file = File::create(&tmp_path).map_err(|e| RegistryError::io(&tmp_path, e))?;
    file.write_all(&json)
        .and_then(|()| file.sync_all())
        .map_err(|e| RegistryError::io(&tmp_path, e))?;
    std::fs::rename(&tmp_path, path).map_err(|e| RegistryError::io(path, e))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// RegistryGuard
// ---------------------------------------------------------------------------

/// Exclusive guard file held for the duration of one write.
struct RegistryGuard {
    path: PathBuf,
}

impl RegistryGuard {
    fn acquire(path: &Path, timeout: Duration) -> Result<Self, RegistryError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RegistryError::io(parent, e))?;
        }

        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let _ = write!(file, "{}", std::process::id());
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    evict_stale_lock(path);
                    if started.elapsed() > timeout {
                        return Err(RegistryError::Locked(path.to_path_buf()));
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => return Err(RegistryError::io(path, e)),
            }
        }
    }
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn evict_stale_lock(path: &Path) {
    let age = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok());

    if age.is_some_and(|age| age > STALE_LOCK_AGE) {
        warn!(path = %path.display(), "evicting stale registry lock");
        let _ = std::fs::remove_file(path);
    }
}
