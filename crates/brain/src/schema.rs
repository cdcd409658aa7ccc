//! The brain's entry model: a closed set of typed, JSONL-persisted records.
//!
//! Every entry carries `id`, `type`, `created`; the per-type fields live in
//! [`EntryKind`], an internally tagged serde enum, so the tag set itself is
//! the schema registry. Keyed types (`identity`, `user`, `meta`, `context`)
//! derive their id from the natural key, which is what makes re-adding the
//! same key an upsert instead of a duplicate.

use std::fmt;
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, Local, NaiveDate, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

static INTERVAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)(m|h|d)$").expect("interval regex"));
static DAILY_AT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([01]\d|2[0-3]):([0-5]\d)$").expect("daily-at regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Behavior,
    Identity,
    User,
    Learning,
    Preference,
    Context,
    Task,
    Reminder,
    Meta,
    Tombstone,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Behavior => "behavior",
            EntryType::Identity => "identity",
            EntryType::User => "user",
            EntryType::Learning => "learning",
            EntryType::Preference => "preference",
            EntryType::Context => "context",
            EntryType::Task => "task",
            EntryType::Reminder => "reminder",
            EntryType::Meta => "meta",
            EntryType::Tombstone => "tombstone",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "behavior" => EntryType::Behavior,
            "identity" => EntryType::Identity,
            "user" => EntryType::User,
            "learning" => EntryType::Learning,
            "preference" => EntryType::Preference,
            "context" => EntryType::Context,
            "task" => EntryType::Task,
            "reminder" => EntryType::Reminder,
            "meta" => EntryType::Meta,
            "tombstone" => EntryType::Tombstone,
            _ => return None,
        })
    }

    /// Types whose id is derived from a natural key.
    pub fn is_keyed(&self) -> bool {
        matches!(
            self,
            EntryType::Identity | EntryType::User | EntryType::Meta | EntryType::Context
        )
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BehaviorCategory {
    Do,
    Dont,
    Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningSource {
    Auto,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningScope {
    Global,
    Project,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    High,
    Normal,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunResult {
    Ok,
    Error,
    Skipped,
}

/// Reminder schedule: a fixed interval or a daily local wall-clock time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Cadence {
    Interval { every: String },
    Daily { at: String },
}

impl Cadence {
    pub fn validate(&self) -> Result<()> {
        match self {
            Cadence::Interval { every } => {
                if !INTERVAL_RE.is_match(every) {
                    bail!("invalid interval cadence {every:?}: expected <n>m|h|d");
                }
            }
            Cadence::Daily { at } => {
                if !DAILY_AT_RE.is_match(at) {
                    bail!("invalid daily cadence {at:?}: expected HH:MM");
                }
            }
        }
        Ok(())
    }

    /// Compute the next due time after a run at `run_at`.
    ///
    /// Intervals add n minutes/hours/days. Daily cadences resolve `HH:MM` on
    /// the run day in local time and roll to the next day when that moment
    /// is not strictly in the future (a run at exactly 00:00 with `at =
    /// "00:00"` schedules +24 h).
    pub fn next_due_after(&self, run_at: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match self {
            Cadence::Interval { every } => {
                let caps = INTERVAL_RE
                    .captures(every)
                    .with_context(|| format!("invalid interval cadence {every:?}"))?;
                let n: i64 = caps[1].parse().context("interval count")?;
                let step = match &caps[2] {
                    "m" => Duration::minutes(n),
                    "h" => Duration::hours(n),
                    _ => Duration::days(n),
                };
                Ok(run_at + step)
            }
            Cadence::Daily { at } => {
                let caps = DAILY_AT_RE
                    .captures(at)
                    .with_context(|| format!("invalid daily cadence {at:?}"))?;
                let hour: u32 = caps[1].parse().context("daily hour")?;
                let minute: u32 = caps[2].parse().context("daily minute")?;

                let local_run = run_at.with_timezone(&Local);
                let naive = local_run
                    .date_naive()
                    .and_hms_opt(hour, minute, 0)
                    .context("daily cadence time out of range")?;
                let candidate = match Local.from_local_datetime(&naive) {
                    chrono::LocalResult::Single(dt) => dt,
                    chrono::LocalResult::Ambiguous(earliest, _) => earliest,
                    // DST gap: the wall-clock time does not exist today.
                    chrono::LocalResult::None => Local
                        .from_local_datetime(&(naive + Duration::hours(1)))
                        .earliest()
                        .context("daily cadence time unresolvable")?,
                };
                let next = if candidate > local_run {
                    candidate
                } else {
                    candidate + Duration::days(1)
                };
                Ok(next.with_timezone(&Utc))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryKind {
    Behavior {
        category: BehaviorCategory,
        text: String,
    },
    Identity {
        key: String,
        value: String,
    },
    User {
        key: String,
        value: String,
    },
    Learning {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<LearningSource>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope: Option<LearningScope>,
        #[serde(
            rename = "projectPath",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        project_path: Option<String>,
    },
    Preference {
        category: String,
        text: String,
    },
    Context {
        project: String,
        path: String,
        content: String,
    },
    Task {
        description: String,
        status: TaskStatus,
        priority: Priority,
        #[serde(default)]
        tags: Vec<String>,
        #[serde(default)]
        due: Option<String>,
        #[serde(rename = "completedAt", default)]
        completed_at: Option<DateTime<Utc>>,
    },
    Reminder {
        text: String,
        enabled: bool,
        cadence: Cadence,
        priority: Priority,
        #[serde(default)]
        tags: Vec<String>,
        #[serde(default)]
        last_run: Option<DateTime<Utc>>,
        #[serde(default)]
        next_due: Option<DateTime<Utc>>,
        #[serde(default)]
        last_result: Option<RunResult>,
        #[serde(default)]
        last_error: Option<String>,
    },
    Meta {
        key: String,
        value: String,
    },
    Tombstone {
        target_id: String,
        target_type: EntryType,
        reason: String,
    },
}

impl EntryKind {
    pub fn entry_type(&self) -> EntryType {
        match self {
            EntryKind::Behavior { .. } => EntryType::Behavior,
            EntryKind::Identity { .. } => EntryType::Identity,
            EntryKind::User { .. } => EntryType::User,
            EntryKind::Learning { .. } => EntryType::Learning,
            EntryKind::Preference { .. } => EntryType::Preference,
            EntryKind::Context { .. } => EntryType::Context,
            EntryKind::Task { .. } => EntryType::Task,
            EntryKind::Reminder { .. } => EntryType::Reminder,
            EntryKind::Meta { .. } => EntryType::Meta,
            EntryKind::Tombstone { .. } => EntryType::Tombstone,
        }
    }

    /// The natural key for keyed types, `None` otherwise.
    pub fn natural_key(&self) -> Option<&str> {
        match self {
            EntryKind::Identity { key, .. }
            | EntryKind::User { key, .. }
            | EntryKind::Meta { key, .. } => Some(key),
            EntryKind::Context { path, .. } => Some(path),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrainEntry {
    pub id: String,
    pub created: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EntryKind,
}

impl BrainEntry {
    pub fn new(kind: EntryKind, created: DateTime<Utc>) -> Self {
        let id = match kind.natural_key() {
            Some(key) => deterministic_id(kind.entry_type(), key),
            None => random_id(),
        };
        Self { id, created, kind }
    }

    pub fn entry_type(&self) -> EntryType {
        self.kind.entry_type()
    }

    /// Reject entries that serde alone cannot: empty ids, empty required
    /// strings, and malformed cadences or due dates.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            bail!("entry id must be non-empty");
        }
        match &self.kind {
            EntryKind::Behavior { text, .. } => require("text", text)?,
            EntryKind::Identity { key, value } | EntryKind::User { key, value } => {
                require("key", key)?;
                require("value", value)?;
            }
            EntryKind::Meta { key, value } => {
                require("key", key)?;
                require("value", value)?;
            }
            EntryKind::Learning { text, .. } => require("text", text)?,
            EntryKind::Preference { category, text } => {
                require("category", category)?;
                require("text", text)?;
            }
            EntryKind::Context { project, path, .. } => {
                require("project", project)?;
                require("path", path)?;
            }
            EntryKind::Task {
                description, due, ..
            } => {
                require("description", description)?;
                if let Some(due) = due {
                    NaiveDate::parse_from_str(due, "%Y-%m-%d")
                        .with_context(|| format!("invalid due date {due:?}: expected YYYY-MM-DD"))?;
                }
            }
            EntryKind::Reminder { text, cadence, .. } => {
                require("text", text)?;
                cadence.validate()?;
            }
            EntryKind::Tombstone { target_id, .. } => require("target_id", target_id)?,
        }
        Ok(())
    }

    /// One-line human rendering, used by removal confirmations and listings.
    pub fn summary(&self) -> String {
        match &self.kind {
            EntryKind::Behavior { category, text } => {
                format!("[{}] {}", behavior_label(*category), clip(text, 80))
            }
            EntryKind::Identity { key, value }
            | EntryKind::User { key, value }
            | EntryKind::Meta { key, value } => format!("{key} = {}", clip(value, 80)),
            EntryKind::Learning { text, .. } => clip(text, 80),
            EntryKind::Preference { category, text } => {
                format!("[{category}] {}", clip(text, 80))
            }
            EntryKind::Context { project, path, .. } => format!("{path} ({project})"),
            EntryKind::Task {
                description,
                status,
                priority,
                due,
                ..
            } => {
                let due_note = due
                    .as_ref()
                    .map(|d| format!(", due {d}"))
                    .unwrap_or_default();
                format!(
                    "[{}/{}{due_note}] {}",
                    status_label(*status),
                    priority_label(*priority),
                    clip(description, 80)
                )
            }
            EntryKind::Reminder { text, enabled, .. } => {
                format!("[{}] {}", if *enabled { "on" } else { "off" }, clip(text, 80))
            }
            EntryKind::Tombstone {
                target_id,
                target_type,
                reason,
            } => format!("tombstone {target_type} {target_id} ({reason})"),
        }
    }
}

pub(crate) fn behavior_label(category: BehaviorCategory) -> &'static str {
    match category {
        BehaviorCategory::Do => "do",
        BehaviorCategory::Dont => "dont",
        BehaviorCategory::Value => "value",
    }
}

pub(crate) fn status_label(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::Done => "done",
    }
}

pub(crate) fn priority_label(priority: Priority) -> &'static str {
    match priority {
        Priority::Urgent => "urgent",
        Priority::High => "high",
        Priority::Normal => "normal",
        Priority::Low => "low",
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("{field} must be non-empty");
    }
    Ok(())
}

pub(crate) fn clip(text: &str, max_chars: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_chars {
        return text.to_string();
    }
    let clipped: String = chars.into_iter().take(max_chars).collect();
    format!("{clipped}…")
}

/// Deterministic id for keyed types: the first 8 hex chars of
/// `sha256("<type>:<naturalKey>")`.
pub fn deterministic_id(entry_type: EntryType, natural_key: &str) -> String {
    let digest = Sha256::digest(format!("{entry_type}:{natural_key}").as_bytes());
    digest[..4].iter().map(|b| format!("{b:02x}")).collect()
}

/// Random id for everything else: 4 fresh random bytes as 8 hex chars.
pub fn random_id() -> String {
    let bytes = Uuid::new_v4().into_bytes();
    bytes[..4].iter().map(|b| format!("{b:02x}")).collect()
}

/// Canonical form used for duplicate-text rejection: lowercase, runs of
/// non-alphanumerics collapsed to single spaces, trimmed.
pub fn normalize_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
        } else {
            pending_space = true;
        }
    }
    out
}
