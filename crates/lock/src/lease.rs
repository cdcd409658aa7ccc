//! Long-held leadership leases backed by a single JSON file.
//!
//! A leader role (a poller, a heartbeat loop) acquires the lease once and
//! refreshes it periodically. The handle pins the open fd and the inode of
//! the file it created: refresh rewrites the payload in place through that
//! fd, and both refresh and release first verify the path still resolves to
//! the pinned inode. A demoted former leader therefore cannot clobber or
//! unlink the file a successor re-created at the same path.
//!
//! Consumer state machine: acquire → leader; any `refresh() == false` or
//! `is_current() == false` → follower (the caller must cancel leader-only
//! timers and in-flight work before re-attempting); followers periodically
//! retry acquisition and take over stale leases.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::process::{hostname, mtime_utc, pid_alive};

const ACQUIRE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeasePayload {
    pub version: u32,
    pub purpose: String,
    pub pid: u32,
    pub nonce: String,
    pub acquired_at: DateTime<Utc>,
    pub refreshed_at: DateTime<Utc>,
    pub hostname: String,
}

#[derive(Debug, Clone)]
pub struct LeaseOptions {
    pub stale_ms: u64,
    pub purpose: String,
}

/// Outcome of an acquisition attempt.
#[derive(Debug)]
pub enum LeaseAcquire {
    Acquired(LeaseHandle),
    /// Someone else holds a fresh lease; `owner_pid` is best-effort.
    Held { owner_pid: Option<u32> },
}

/// An owned lease: the created file's fd and inode, plus our payload.
#[derive(Debug)]
pub struct LeaseHandle {
    path: PathBuf,
    file: fs::File,
    ino: u64,
    payload: LeasePayload,
}

impl LeaseHandle {
    pub fn payload(&self) -> &LeasePayload {
        &self.payload
    }

    /// True iff the path still maps to the inode this handle created.
    pub fn is_current(&self) -> bool {
        fs::metadata(&self.path)
            .map(|meta| meta.ino() == self.ino)
            .unwrap_or(false)
    }

    /// Rewrite the payload in place through the held fd, bumping
    /// `refreshedAt`. Returns `false` when the lease has been lost: the path
    /// no longer maps to our inode, or the on-disk payload no longer matches
    /// our pid+nonce+purpose.
    pub fn refresh(&mut self, now: DateTime<Utc>) -> Result<bool> {
        if !self.is_current() {
            return Ok(false);
        }

        let mut raw = String::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_string(&mut raw)?;
        let on_disk: LeasePayload = match serde_json::from_str(&raw) {
            Ok(payload) => payload,
            Err(_) => return Ok(false),
        };
        if on_disk.pid != self.payload.pid
            || on_disk.nonce != self.payload.nonce
            || on_disk.purpose != self.payload.purpose
        {
            return Ok(false);
        }

        self.payload.refreshed_at = now;
        let rendered = serde_json::to_string(&self.payload)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.set_len(0)?;
        self.file.write_all(rendered.as_bytes())?;
        self.file.sync_all()?;
        Ok(true)
    }

    /// Unlink the lease file, but only if the path still resolves to our
    /// inode. Consumes the handle; the fd closes on drop.
    pub fn release(self) -> Result<()> {
        if self.is_current() {
            fs::remove_file(&self.path)
                .with_context(|| format!("releasing lease at {}", self.path.display()))?;
        }
        Ok(())
    }
}

/// Try to acquire the lease at `path`. Stale leases (dead holder, expired or
/// unparseable `refreshedAt`) are unlinked and retaken, up to 3 attempts.
pub fn try_acquire_lease(
    path: &Path,
    nonce: &str,
    now: DateTime<Utc>,
    opts: &LeaseOptions,
) -> Result<LeaseAcquire> {
    for _ in 0..ACQUIRE_ATTEMPTS {
        match fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(mut file) => {
                let payload = LeasePayload {
                    version: 1,
                    purpose: opts.purpose.clone(),
                    pid: std::process::id(),
                    nonce: nonce.to_string(),
                    acquired_at: now,
                    refreshed_at: now,
                    hostname: hostname(),
                };
                let rendered = serde_json::to_string(&payload)?;
                file.write_all(rendered.as_bytes())?;
                file.sync_all()?;
                let ino = file.metadata()?.ino();
                info!(path = %path.display(), purpose = %opts.purpose, "lease acquired");
                return Ok(LeaseAcquire::Acquired(LeaseHandle {
                    path: path.to_path_buf(),
                    file,
                    ino,
                    payload,
                }));
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let observed = read_lease(path);
                if lease_is_stale(path, observed.as_ref(), now, opts.stale_ms) {
                    warn!(
                        path = %path.display(),
                        owner = ?observed.as_ref().map(|p| p.pid),
                        "taking over stale lease"
                    );
                    let _ = fs::remove_file(path);
                    continue;
                }
                return Ok(LeaseAcquire::Held {
                    owner_pid: observed.map(|p| p.pid),
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
            }
            Err(err) => {
                return Err(err).with_context(|| format!("acquiring lease at {}", path.display()));
            }
        }
    }

    Ok(LeaseAcquire::Held {
        owner_pid: read_lease(path).map(|p| p.pid),
    })
}

/// Read and parse the lease file. `None` when missing or unparseable.
pub fn read_lease(path: &Path) -> Option<LeasePayload> {
    let raw = fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

fn lease_is_stale(
    path: &Path,
    payload: Option<&LeasePayload>,
    now: DateTime<Utc>,
    stale_ms: u64,
) -> bool {
    match payload {
        Some(payload) => {
            if !pid_alive(payload.pid) {
                return true;
            }
            let age_ms = now
                .signed_duration_since(payload.refreshed_at)
                .num_milliseconds();
            age_ms > stale_ms as i64
        }
        None => match mtime_utc(path) {
            Some(mtime) => now.signed_duration_since(mtime).num_milliseconds() > stale_ms as i64,
            // Vanished or unstattable: treat as takeable.
            None => true,
        },
    }
}
