//! File-backed run state.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{RunState, StateBackend, StateChange};
use crate::error::{LoadError, Result};

/// How long a writer waits for another process to release the lock file.
const LOCK_WAIT: Duration = Duration::from_secs(30);
const LOCK_POLL: Duration = Duration::from_millis(20);
/// A lock file older than this was left by a process that died mid-write.
const LOCK_STALE: Duration = Duration::from_secs(120);

/// Stores the run state as a signed JSON document.
///
/// Writes go to `<path>.tmp` first and are renamed into place, so a crash
/// mid-write leaves the previous state intact. Writers in this process
/// queue on a mutex; writers in other processes exclude each other with a
/// `<path>.lock` file created exclusively.
pub struct FileStateBackend {
    path: PathBuf,
    writer: Mutex<()>,
    lock_wait: Duration,
}

/// Held while the state file is being written. Removed on drop.
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    async fn acquire(path: PathBuf, wait: Duration) -> Result<Self> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(LoadError::Io(e)),
            }

            if Self::is_stale(&path).await {
                warn!("Removing stale state lock {}", path.display());
                let _ = tokio::fs::remove_file(&path).await;
                continue;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(LoadError::State(format!(
                    "State file is locked by another process ({})",
                    path.display()
                )));
            }
            tokio::time::sleep(LOCK_POLL).await;
        }
    }

    async fn is_stale(path: &Path) -> bool {
        let modified = match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => return false,
        };
        SystemTime::now()
            .duration_since(modified)
            .map(|age| age > LOCK_STALE)
            .unwrap_or(false)
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl FileStateBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(()),
            lock_wait: LOCK_WAIT,
        }
    }

    #[cfg(test)]
    fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }

    async fn read(&self) -> Result<Option<RunState>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(LoadError::Io(e)),
        };
        RunState::from_signed_json(&content).map(Some)
    }

    async fn write(&self, state: &RunState) -> Result<()> {
        let content = state.to_signed_json()?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Saved run state to {}", self.path.display());
        Ok(())
    }
}

#[async_trait]
impl StateBackend for FileStateBackend {
    async fn init_schema(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }

    async fn save(&self, state: &RunState) -> Result<()> {
        let _writer = self.writer.lock().await;
        let _lock = LockFile::acquire(self.lock_path(), self.lock_wait).await?;
        self.write(state).await
    }

    async fn load(&self) -> Result<Option<RunState>> {
        self.read().await
    }

    async fn update(&self, change: StateChange<'_>) -> Result<RunState> {
        let _writer = self.writer.lock().await;
        let _lock = LockFile::acquire(self.lock_path(), self.lock_wait).await?;
        let next = change(self.read().await?)?;
        self.write(&next).await?;
        Ok(next)
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LoadError::Io(e)),
        }
    }

    fn backend_type(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_load_clear() {
        let dir = TempDir::new().unwrap();
        let backend = FileStateBackend::new(dir.path().join("nested").join("state.json"));
        backend.init_schema().await.unwrap();
        assert!(backend.load().await.unwrap().is_none());

        let state = RunState::new("run-1".into(), "hash".into());
        backend.save(&state).await.unwrap();
        assert!(!backend.path().with_extension("tmp").exists());

        let loaded = backend.load().await.unwrap().unwrap();
        assert_eq!(loaded.run_id, "run-1");

        backend.clear().await.unwrap();
        assert!(backend.load().await.unwrap().is_none());
        backend.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_updates_from_two_handles_all_land() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let first = std::sync::Arc::new(FileStateBackend::new(&path));
        let second = std::sync::Arc::new(FileStateBackend::new(&path));
        first
            .save(&RunState::new("run-1".into(), "hash".into()))
            .await
            .unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..20u64 {
            let backend = if i % 2 == 0 { first.clone() } else { second.clone() };
            tasks.spawn(async move {
                backend
                    .update(Box::new(move |stored: Option<RunState>| {
                        let mut state = stored.unwrap();
                        state.table_rows.insert(format!("t{}", i), i);
                        Ok(state)
                    }))
                    .await
                    .unwrap();
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }

        let state = first.load().await.unwrap().unwrap();
        assert_eq!(state.table_rows.len(), 20);
        assert!(!path.with_file_name("state.json.lock").exists());
    }

    #[tokio::test]
    async fn test_held_lock_times_out_and_stale_lock_is_removed() {
        let dir = TempDir::new().unwrap();
        let backend = FileStateBackend::new(dir.path().join("state.json"))
            .with_lock_wait(Duration::from_millis(100));
        let lock = backend.lock_path();

        let held = LockFile::acquire(lock.clone(), LOCK_WAIT).await.unwrap();
        let err = backend
            .save(&RunState::new("run-1".into(), "hash".into()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("locked by another process"), "{}", err);
        drop(held);
        assert!(!lock.exists());

        let file = std::fs::File::create(&lock).unwrap();
        file.set_modified(SystemTime::now() - LOCK_STALE * 2).unwrap();
        drop(file);
        backend
            .save(&RunState::new("run-1".into(), "hash".into()))
            .await
            .unwrap();
        assert!(!lock.exists());
    }

    #[tokio::test]
    async fn test_tampered_file_rejected() {
        let dir = TempDir::new().unwrap();
        let backend = FileStateBackend::new(dir.path().join("state.json"));
        let state = RunState::new("run-1".into(), "hash".into());
        backend.save(&state).await.unwrap();

        let content = std::fs::read_to_string(backend.path()).unwrap();
        std::fs::write(backend.path(), content.replace("run-1", "run-2")).unwrap();
        assert!(matches!(backend.load().await, Err(LoadError::State(_))));
    }
}
