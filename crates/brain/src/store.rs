//! Append-only JSONL brain log: tolerant reads, event-sourced fold, and
//! serialized appends under the file lock.
//!
//! Readers never lock. They must therefore tolerate a truncated tail line
//! (a crash mid-append) and malformed lines; both are counted in
//! [`ReadStats`] rather than surfaced as errors. Writers take the sibling
//! `.lock` file so each append is either fully flushed or absent.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use rho_lock::file_lock::{FileLockOptions, acquire_file_lock};

use crate::schema::{BrainEntry, EntryKind, EntryType};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadStats {
    /// Well-formed entries returned.
    pub total: usize,
    /// Malformed or unknown-type lines skipped.
    pub bad_lines: usize,
    /// True when the file ends in an unterminated line.
    pub truncated_tail: bool,
}

/// Materialized view of the log after a fold.
#[derive(Debug, Clone, Default)]
pub struct BrainState {
    pub identity: BTreeMap<String, BrainEntry>,
    pub user: BTreeMap<String, BrainEntry>,
    pub meta: BTreeMap<String, BrainEntry>,
    pub behaviors: Vec<BrainEntry>,
    pub learnings: Vec<BrainEntry>,
    pub preferences: Vec<BrainEntry>,
    pub contexts: Vec<BrainEntry>,
    pub tasks: Vec<BrainEntry>,
    pub reminders: Vec<BrainEntry>,
    /// Ids removed by a tombstone and not since resurrected.
    pub dead: HashSet<String>,
}

impl BrainState {
    /// Locate a live entry by id across all collections.
    pub fn find(&self, id: &str) -> Option<&BrainEntry> {
        self.identity
            .values()
            .chain(self.user.values())
            .chain(self.meta.values())
            .chain(&self.behaviors)
            .chain(&self.learnings)
            .chain(&self.preferences)
            .chain(&self.contexts)
            .chain(&self.tasks)
            .chain(&self.reminders)
            .find(|entry| entry.id == id)
    }

    pub fn len(&self) -> usize {
        self.identity.len()
            + self.user.len()
            + self.meta.len()
            + self.behaviors.len()
            + self.learnings.len()
            + self.preferences.len()
            + self.contexts.len()
            + self.tasks.len()
            + self.reminders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_by_id(&mut self, target_type: EntryType, target_id: &str) {
        match target_type {
            EntryType::Identity => self.identity.retain(|_, e| e.id != target_id),
            EntryType::User => self.user.retain(|_, e| e.id != target_id),
            EntryType::Meta => self.meta.retain(|_, e| e.id != target_id),
            EntryType::Behavior => self.behaviors.retain(|e| e.id != target_id),
            EntryType::Learning => self.learnings.retain(|e| e.id != target_id),
            EntryType::Preference => self.preferences.retain(|e| e.id != target_id),
            EntryType::Context => self.contexts.retain(|e| e.id != target_id),
            EntryType::Task => self.tasks.retain(|e| e.id != target_id),
            EntryType::Reminder => self.reminders.retain(|e| e.id != target_id),
            EntryType::Tombstone => {}
        }
    }

    fn upsert(&mut self, entry: BrainEntry) {
        let entry_type = entry.entry_type();
        let map = match entry_type {
            EntryType::Identity => Some(&mut self.identity),
            EntryType::User => Some(&mut self.user),
            EntryType::Meta => Some(&mut self.meta),
            _ => None,
        };
        if let Some(map) = map {
            let key = entry.kind.natural_key().unwrap_or_default().to_string();
            map.insert(key, entry);
            return;
        }
        let list = match entry_type {
            EntryType::Behavior => &mut self.behaviors,
            EntryType::Learning => &mut self.learnings,
            EntryType::Preference => &mut self.preferences,
            EntryType::Context => &mut self.contexts,
            EntryType::Task => &mut self.tasks,
            EntryType::Reminder => &mut self.reminders,
            _ => return,
        };
        match list.iter_mut().find(|e| e.id == entry.id) {
            Some(slot) => *slot = entry,
            None => list.push(entry),
        }
    }
}

/// Read the log, skipping damage instead of failing on it.
///
/// A missing file is an empty brain. Blank lines and `\r` are tolerated. An
/// unterminated final line is counted as a truncated tail and its entry is
/// not emitted.
pub fn read_brain(path: &Path) -> Result<(Vec<BrainEntry>, ReadStats)> {
    let mut stats = ReadStats::default();
    let raw = match std::fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok((Vec::new(), stats));
        }
        Err(err) => {
            return Err(err).with_context(|| format!("reading brain log {}", path.display()));
        }
    };

    let mut entries = Vec::new();
    let mut pieces: Vec<&str> = raw.split('\n').collect();

    // Everything after the last newline is an in-progress append, not a line.
    if let Some(tail) = pieces.pop() {
        if !tail.trim().is_empty() {
            stats.truncated_tail = true;
        }
    }

    for (idx, line) in pieces.iter().enumerate() {
        let line = line.trim_end_matches('\r').trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<BrainEntry>(line) {
            Ok(entry) => {
                stats.total += 1;
                entries.push(entry);
            }
            Err(err) => {
                stats.bad_lines += 1;
                warn!(
                    line = idx + 1,
                    error = %err,
                    path = %path.display(),
                    "skipping malformed brain line"
                );
            }
        }
    }

    Ok((entries, stats))
}

/// Fold the log into materialized collections.
///
/// Tombstones remove their target and record it in the dead set; a later
/// entry reusing that id resurrects it. Keyed types upsert by natural key,
/// list types replace by id or append.
pub fn fold_brain(entries: &[BrainEntry]) -> BrainState {
    let mut state = BrainState::default();
    for entry in entries {
        match &entry.kind {
            EntryKind::Tombstone {
                target_id,
                target_type,
                ..
            } => {
                state.dead.insert(target_id.clone());
                state.remove_by_id(*target_type, target_id);
            }
            _ => {
                state.dead.remove(&entry.id);
                state.upsert(entry.clone());
            }
        }
    }
    state
}

/// Read and fold in one step.
pub fn load_brain(path: &Path) -> Result<(BrainState, ReadStats)> {
    let (entries, stats) = read_brain(path)?;
    Ok((fold_brain(&entries), stats))
}

fn lock_path_for(brain_path: &Path) -> PathBuf {
    let filename = brain_path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| "brain.jsonl".to_string());
    brain_path.with_file_name(format!("{filename}.lock"))
}

fn lock_options() -> FileLockOptions {
    FileLockOptions {
        purpose: "brain-append".to_string(),
        ..Default::default()
    }
}

async fn append_line(path: &Path, entry: &BrainEntry) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    let line = serde_json::to_string(entry)?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    // Flush userspace buffers and fsync so the entry survives a crash
    // immediately after append.
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

/// Validate and append one entry under the file lock.
pub async fn append_brain_entry(path: &Path, entry: &BrainEntry) -> Result<()> {
    entry.validate()?;
    let guard = acquire_file_lock(&lock_path_for(path), &lock_options()).await?;
    let result = append_line(path, entry).await;
    guard.release();
    result
}

/// Append unless `is_duplicate` matches against the state folded inside the
/// lock. Returns whether the entry was written.
pub async fn append_brain_entry_with_dedup<F>(
    path: &Path,
    entry: &BrainEntry,
    is_duplicate: F,
) -> Result<bool>
where
    F: FnOnce(&BrainState, &BrainEntry) -> bool,
{
    entry.validate()?;
    let guard = acquire_file_lock(&lock_path_for(path), &lock_options()).await?;
    let result = async {
        let (state, _) = load_brain(path)?;
        if is_duplicate(&state, entry) {
            return Ok(false);
        }
        append_line(path, entry).await?;
        Ok(true)
    }
    .await;
    guard.release();
    result
}
