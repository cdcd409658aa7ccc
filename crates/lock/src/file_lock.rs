//! Short-held mutex files guarding critical sections (brain appends).
//!
//! Acquisition creates the lock file with `O_CREAT|O_EXCL` and writes a JSON
//! payload identifying the holder. Contenders inspect the payload: a live
//! holder with a fresh `refreshedAt` is waited out with jittered exponential
//! backoff; a dead or stale holder is unlinked and the slot retaken. Release
//! unlinks only when the on-disk payload still shows our pid+nonce, so a
//! racing takeover is never clobbered.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::process::{hostname, mtime_utc, pid_alive, random_nonce};

const BACKOFF_INITIAL_MS: u64 = 10;
const BACKOFF_MAX_MS: u64 = 250;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockPayload {
    pid: u32,
    nonce: String,
    acquired_at: DateTime<Utc>,
    refreshed_at: DateTime<Utc>,
    hostname: String,
    purpose: String,
}

#[derive(Debug, Clone)]
pub struct FileLockOptions {
    pub stale_ms: u64,
    pub timeout_ms: u64,
    pub purpose: String,
}

impl Default for FileLockOptions {
    fn default() -> Self {
        Self {
            stale_ms: 30_000,
            timeout_ms: 5_000,
            purpose: String::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error(
        "LOCK_TIMEOUT: could not acquire {path} within {timeout_ms} ms (holder pid {holder:?})"
    )]
    Timeout {
        path: PathBuf,
        timeout_ms: u64,
        holder: Option<u32>,
    },
    #[error("lock io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Owned lock. Releasing (explicitly or on drop) unlinks the file only if it
/// still carries our pid+nonce.
#[derive(Debug)]
pub struct FileLockGuard {
    path: PathBuf,
    pid: u32,
    nonce: String,
    released: bool,
}

impl FileLockGuard {
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match fs::read_to_string(&self.path) {
            Ok(raw) => {
                if let Ok(payload) = serde_json::from_str::<LockPayload>(&raw) {
                    if payload.pid == self.pid && payload.nonce == self.nonce {
                        let _ = fs::remove_file(&self.path);
                    }
                }
            }
            Err(_) => {
                // Already gone or unreadable; a lost race, nothing to undo.
            }
        }
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Acquire `lock_path` exclusively, waiting out a live holder until
/// `timeout_ms` and taking over dead or stale ones immediately.
pub async fn acquire_file_lock(
    lock_path: &Path,
    opts: &FileLockOptions,
) -> Result<FileLockGuard, LockError> {
    let deadline = Instant::now() + Duration::from_millis(opts.timeout_ms);
    let pid = std::process::id();
    let nonce = random_nonce();
    let mut backoff_ms = BACKOFF_INITIAL_MS;
    let mut last_holder: Option<u32> = None;

    loop {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)
        {
            Ok(mut file) => {
                let now = Utc::now();
                let payload = LockPayload {
                    pid,
                    nonce: nonce.clone(),
                    acquired_at: now,
                    refreshed_at: now,
                    hostname: hostname(),
                    purpose: opts.purpose.clone(),
                };
                let rendered = serde_json::to_string(&payload).map_err(|err| LockError::Io {
                    path: lock_path.to_path_buf(),
                    source: std::io::Error::other(err),
                })?;
                if let Err(err) = file.write_all(rendered.as_bytes()).and_then(|_| file.flush())
                {
                    let _ = fs::remove_file(lock_path);
                    return Err(LockError::Io {
                        path: lock_path.to_path_buf(),
                        source: err,
                    });
                }
                return Ok(FileLockGuard {
                    path: lock_path.to_path_buf(),
                    pid,
                    nonce,
                    released: false,
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                match holder_state(lock_path, opts.stale_ms) {
                    HolderState::Live { pid: holder_pid } => {
                        last_holder = holder_pid;
                        if Instant::now() >= deadline {
                            return Err(LockError::Timeout {
                                path: lock_path.to_path_buf(),
                                timeout_ms: opts.timeout_ms,
                                holder: last_holder,
                            });
                        }
                        // ±50% jitter keeps contending processes from
                        // retrying in lockstep.
                        let jitter = rand::thread_rng().gen_range(0.5..1.5);
                        let sleep_ms = (backoff_ms as f64 * jitter) as u64;
                        tokio::time::sleep(Duration::from_millis(sleep_ms.max(1))).await;
                        backoff_ms = (backoff_ms * 2).min(BACKOFF_MAX_MS);
                    }
                    HolderState::Stale { pid: holder_pid } => {
                        warn!(
                            path = %lock_path.display(),
                            holder = ?holder_pid,
                            "removing stale lock file"
                        );
                        let _ = fs::remove_file(lock_path);
                    }
                    HolderState::Gone => {
                        // Vanished between the open and the inspection.
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = lock_path.parent() {
                    fs::create_dir_all(parent).map_err(|source| LockError::Io {
                        path: lock_path.to_path_buf(),
                        source,
                    })?;
                }
            }
            Err(source) => {
                return Err(LockError::Io {
                    path: lock_path.to_path_buf(),
                    source,
                });
            }
        }
    }
}

/// Run `f` while holding the lock, releasing it on all paths.
pub async fn with_file_lock<T, F, Fut>(
    lock_path: &Path,
    opts: &FileLockOptions,
    f: F,
) -> Result<T, LockError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let guard = acquire_file_lock(lock_path, opts).await?;
    let out = f().await;
    guard.release();
    Ok(out)
}

enum HolderState {
    Live { pid: Option<u32> },
    Stale { pid: Option<u32> },
    Gone,
}

fn holder_state(lock_path: &Path, stale_ms: u64) -> HolderState {
    let raw = match fs::read_to_string(lock_path) {
        Ok(raw) => raw,
        Err(_) => return HolderState::Gone,
    };
    let now = Utc::now();
    match serde_json::from_str::<LockPayload>(&raw) {
        Ok(payload) => {
            let fresh = age_within(now, payload.refreshed_at, stale_ms);
            if pid_alive(payload.pid) && fresh {
                HolderState::Live {
                    pid: Some(payload.pid),
                }
            } else {
                HolderState::Stale {
                    pid: Some(payload.pid),
                }
            }
        }
        Err(_) => {
            // Unparseable payload: fall back to mtime as the freshness signal.
            match mtime_utc(lock_path) {
                Some(mtime) if age_within(now, mtime, stale_ms) => HolderState::Live { pid: None },
                Some(_) => HolderState::Stale { pid: None },
                None => HolderState::Gone,
            }
        }
    }
}

fn age_within(now: DateTime<Utc>, then: DateTime<Utc>, stale_ms: u64) -> bool {
    let age_ms = now.signed_duration_since(then).num_milliseconds();
    age_ms <= stale_ms as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_opts() -> FileLockOptions {
        FileLockOptions {
            stale_ms: 30_000,
            timeout_ms: 300,
            purpose: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn acquire_writes_payload_and_release_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("brain.jsonl.lock");

        let guard = acquire_file_lock(&path, &quick_opts()).await.unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        let payload: LockPayload = serde_json::from_str(&raw).unwrap();
        assert_eq!(payload.pid, std::process::id());
        assert_eq!(payload.purpose, "test");

        guard.release();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn contention_times_out_with_lock_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("held.lock");

        let _guard = acquire_file_lock(&path, &quick_opts()).await.unwrap();
        let err = acquire_file_lock(&path, &quick_opts()).await.unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
        assert!(err.to_string().contains("LOCK_TIMEOUT"));
    }

    #[tokio::test]
    async fn dead_holder_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.lock");

        let now = Utc::now();
        let dead = LockPayload {
            pid: 4_194_304, // beyond the pid range, guaranteed dead
            nonce: "deadbeef".to_string(),
            acquired_at: now,
            refreshed_at: now,
            hostname: "x".to_string(),
            purpose: "old".to_string(),
        };
        fs::write(&path, serde_json::to_string(&dead).unwrap()).unwrap();

        let guard = acquire_file_lock(&path, &quick_opts()).await.unwrap();
        guard.release();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn unparseable_fresh_lock_counts_as_live() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.lock");
        fs::write(&path, "not json").unwrap();

        // mtime is "now", so the holder is presumed live until stale_ms.
        let err = acquire_file_lock(&path, &quick_opts()).await.unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
    }

    #[tokio::test]
    async fn release_tolerates_lost_race() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raced.lock");

        let guard = acquire_file_lock(&path, &quick_opts()).await.unwrap();
        // Another process takes over out from under us.
        let now = Utc::now();
        let other = LockPayload {
            pid: std::process::id(),
            nonce: "othernonce".to_string(),
            acquired_at: now,
            refreshed_at: now,
            hostname: "x".to_string(),
            purpose: "other".to_string(),
        };
        fs::write(&path, serde_json::to_string(&other).unwrap()).unwrap();

        guard.release();
        // Not ours any more, so release must leave it in place.
        assert!(path.exists());
    }

    #[tokio::test]
    async fn with_file_lock_serializes_critical_sections() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let dir = tempfile::tempdir().unwrap();
        let path = Arc::new(dir.path().join("serial.lock"));
        let in_section = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let path = Arc::clone(&path);
            let in_section = Arc::clone(&in_section);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let opts = FileLockOptions {
                    timeout_ms: 5_000,
                    ..Default::default()
                };
                with_file_lock(&path, &opts, || async {
                    let current = in_section.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(current, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_section.fetch_sub(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
