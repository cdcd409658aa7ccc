//! The brain's single mutation surface: an action dispatcher over the store.
//!
//! Every operation returns a structured [`BrainActionResult`] instead of
//! propagating errors, so any caller (CLI, chat surface, extension) can
//! relay the outcome verbatim. Appends go through the store and therefore
//! the file lock; reads never lock.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::project::learning_score;
use crate::schema::{
    BehaviorCategory, BrainEntry, Cadence, EntryKind, EntryType, LearningScope, LearningSource,
    Priority, RunResult, TaskStatus, deterministic_id, normalize_text, random_id,
};
use crate::store::{
    BrainState, append_brain_entry, append_brain_entry_with_dedup, load_brain, read_brain,
};

/// Loosely typed entry fields shared by `add` and `update`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EntryParams {
    #[serde(rename = "type")]
    pub entry_type: Option<String>,
    pub key: Option<String>,
    pub value: Option<String>,
    pub text: Option<String>,
    pub category: Option<String>,
    pub source: Option<LearningSource>,
    pub scope: Option<LearningScope>,
    #[serde(rename = "projectPath")]
    pub project_path: Option<String>,
    pub project: Option<String>,
    pub path: Option<String>,
    pub content: Option<String>,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub tags: Option<Vec<String>>,
    pub due: Option<String>,
    pub cadence: Option<Cadence>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListFilter {
    Pending,
    Done,
    Active,
}

#[derive(Debug, Clone)]
pub enum BrainAction {
    Add {
        params: EntryParams,
    },
    Update {
        id: String,
        params: EntryParams,
    },
    Remove {
        id: Option<String>,
        entry_type: Option<String>,
        key: Option<String>,
    },
    List {
        entry_type: Option<String>,
        query: Option<String>,
        filter: Option<ListFilter>,
        verbose: bool,
    },
    Decay,
    TaskDone {
        id: String,
    },
    TaskClear,
    ReminderRun {
        id: String,
        result: Option<RunResult>,
        error: Option<String>,
    },
}

impl BrainAction {
    /// Parse an action from loose JSON params. Unknown actions, missing
    /// required ids, and invalid enum values surface as errors for the
    /// caller to wrap.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let action = value
            .get("action")
            .and_then(serde_json::Value::as_str)
            .context("action is required")?
            .to_string();
        let str_field = |name: &str| -> Option<String> {
            value
                .get(name)
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
        };
        let required_id = || str_field("id").context("id is required");

        Ok(match action.as_str() {
            "add" => BrainAction::Add {
                params: serde_json::from_value(value.clone())
                    .context("invalid entry params")?,
            },
            "update" => BrainAction::Update {
                id: required_id()?,
                params: serde_json::from_value(value.clone())
                    .context("invalid entry params")?,
            },
            "remove" => BrainAction::Remove {
                id: str_field("id"),
                entry_type: str_field("type"),
                key: str_field("key"),
            },
            "list" => BrainAction::List {
                entry_type: str_field("type"),
                query: str_field("query"),
                filter: match value.get("filter") {
                    Some(raw) => Some(
                        serde_json::from_value(raw.clone()).context("invalid list filter")?,
                    ),
                    None => None,
                },
                verbose: value
                    .get("verbose")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false),
            },
            "decay" => BrainAction::Decay,
            "task_done" => BrainAction::TaskDone { id: required_id()? },
            "task_clear" => BrainAction::TaskClear,
            "reminder_run" => BrainAction::ReminderRun {
                id: required_id()?,
                result: match value.get("result") {
                    Some(raw) => Some(
                        serde_json::from_value(raw.clone()).context("invalid run result")?,
                    ),
                    None => None,
                },
                error: str_field("error"),
            },
            other => bail!("unknown action {other:?}"),
        })
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BrainActionResult {
    pub ok: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl BrainActionResult {
    fn success(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
            data: None,
        }
    }

    fn success_with(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            ok: true,
            message: message.into(),
            data: Some(data),
        }
    }

    fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrainToolOptions {
    /// Working directory used for project-scoped learning scores.
    pub cwd: PathBuf,
    pub decay_after_days: i64,
    pub decay_min_score: i64,
}

impl Default for BrainToolOptions {
    fn default() -> Self {
        Self {
            cwd: std::env::current_dir().unwrap_or_else(|_| "/".into()),
            decay_after_days: 90,
            decay_min_score: 3,
        }
    }
}

/// Dispatch one action against the brain at `brain_path`.
pub async fn handle_brain_action(
    brain_path: &Path,
    action: BrainAction,
    opts: &BrainToolOptions,
) -> BrainActionResult {
    match dispatch(brain_path, action, opts).await {
        Ok(result) => result,
        Err(err) => BrainActionResult::failure(format!("{err:#}")),
    }
}

async fn dispatch(
    brain_path: &Path,
    action: BrainAction,
    opts: &BrainToolOptions,
) -> Result<BrainActionResult> {
    let now = Utc::now();
    match action {
        BrainAction::Add { params } => do_add(brain_path, params, now).await,
        BrainAction::Update { id, params } => do_update(brain_path, &id, params).await,
        BrainAction::Remove {
            id,
            entry_type,
            key,
        } => do_remove(brain_path, id, entry_type, key, now).await,
        BrainAction::List {
            entry_type,
            query,
            filter,
            verbose,
        } => do_list(brain_path, entry_type, query, filter, verbose, now),
        BrainAction::Decay => do_decay(brain_path, opts, now).await,
        BrainAction::TaskDone { id } => do_task_done(brain_path, &id, now).await,
        BrainAction::TaskClear => do_task_clear(brain_path, now).await,
        BrainAction::ReminderRun { id, result, error } => {
            do_reminder_run(brain_path, &id, result, error, now).await
        }
    }
}

// ── add ──────────────────────────────────────────────────────────────────────

async fn do_add(
    brain_path: &Path,
    params: EntryParams,
    now: DateTime<Utc>,
) -> Result<BrainActionResult> {
    let entry = build_entry(&params, now)?;
    let entry_type = entry.entry_type();

    if matches!(entry_type, EntryType::Learning | EntryType::Preference) {
        let normalized = normalize_text(dedup_text(&entry.kind).unwrap_or_default());
        let wrote = append_brain_entry_with_dedup(brain_path, &entry, |state, _| {
            let pool = match entry_type {
                EntryType::Learning => &state.learnings,
                _ => &state.preferences,
            };
            pool.iter()
                .any(|existing| match dedup_text(&existing.kind) {
                    Some(text) => normalize_text(text) == normalized,
                    None => false,
                })
        })
        .await?;
        if !wrote {
            return Ok(BrainActionResult::failure(format!(
                "Duplicate {entry_type}: already stored"
            )));
        }
    } else {
        append_brain_entry(brain_path, &entry).await?;
    }

    debug!(id = %entry.id, kind = %entry_type, "brain entry added");
    Ok(BrainActionResult::success_with(
        format!("Added {entry_type} {}: {}", entry.id, entry.summary()),
        json!({ "id": entry.id }),
    ))
}

fn dedup_text(kind: &EntryKind) -> Option<&str> {
    match kind {
        EntryKind::Learning { text, .. } | EntryKind::Preference { text, .. } => Some(text),
        _ => None,
    }
}

fn build_entry(params: &EntryParams, now: DateTime<Utc>) -> Result<BrainEntry> {
    let raw_type = params
        .entry_type
        .as_deref()
        .context("type parameter is required")?;
    let entry_type =
        EntryType::parse(raw_type).with_context(|| format!("unknown entry type {raw_type:?}"))?;

    let kind = match entry_type {
        EntryType::Behavior => EntryKind::Behavior {
            category: parse_behavior_category(
                params.category.as_deref().context("category is required")?,
            )?,
            text: required(&params.text, "text")?,
        },
        EntryType::Identity => EntryKind::Identity {
            key: required(&params.key, "key")?,
            value: required(&params.value, "value")?,
        },
        EntryType::User => EntryKind::User {
            key: required(&params.key, "key")?,
            value: required(&params.value, "value")?,
        },
        EntryType::Meta => EntryKind::Meta {
            key: required(&params.key, "key")?,
            value: required(&params.value, "value")?,
        },
        EntryType::Learning => EntryKind::Learning {
            text: required(&params.text, "text")?,
            source: params.source,
            scope: params.scope,
            project_path: params.project_path.clone(),
        },
        EntryType::Preference => EntryKind::Preference {
            category: required(&params.category, "category")?,
            text: required(&params.text, "text")?,
        },
        EntryType::Context => EntryKind::Context {
            project: required(&params.project, "project")?,
            path: required(&params.path, "path")?,
            content: params.content.clone().unwrap_or_default(),
        },
        EntryType::Task => EntryKind::Task {
            description: required(&params.description, "description")?,
            status: params.status.unwrap_or(TaskStatus::Pending),
            priority: params.priority.unwrap_or(Priority::Normal),
            tags: params.tags.clone().unwrap_or_default(),
            due: params.due.clone(),
            completed_at: None,
        },
        EntryType::Reminder => {
            let cadence = params.cadence.clone().context("cadence is required")?;
            cadence.validate()?;
            // Schedule the first run up front so a fresh reminder is due
            // without waiting for a prior reminder_run.
            let next_due = cadence.next_due_after(now)?;
            EntryKind::Reminder {
                text: required(&params.text, "text")?,
                enabled: params.enabled.unwrap_or(true),
                cadence,
                priority: params.priority.unwrap_or(Priority::Normal),
                tags: params.tags.clone().unwrap_or_default(),
                last_run: None,
                next_due: Some(next_due),
                last_result: None,
                last_error: None,
            }
        }
        EntryType::Tombstone => bail!("tombstones are created via remove, not add"),
    };

    let entry = BrainEntry::new(kind, now);
    entry.validate()?;
    Ok(entry)
}

fn parse_behavior_category(raw: &str) -> Result<BehaviorCategory> {
    Ok(match raw {
        "do" => BehaviorCategory::Do,
        "dont" => BehaviorCategory::Dont,
        "value" => BehaviorCategory::Value,
        other => bail!("behavior category must be one of do, dont, value (got {other:?})"),
    })
}

fn required(value: &Option<String>, field: &str) -> Result<String> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value.clone()),
        _ => bail!("{field} is required"),
    }
}

// ── update ───────────────────────────────────────────────────────────────────

async fn do_update(
    brain_path: &Path,
    id: &str,
    params: EntryParams,
) -> Result<BrainActionResult> {
    let (state, _) = load_brain(brain_path)?;
    let Some(existing) = state.find(id) else {
        return Ok(BrainActionResult::failure(format!("No entry with id {id}")));
    };

    // Merge params over the existing entry; id, type, and created survive.
    let mut entry = existing.clone();
    apply_params(&mut entry.kind, &params)?;
    entry.validate()?;
    append_brain_entry(brain_path, &entry).await?;

    Ok(BrainActionResult::success(format!(
        "Updated {} {id}: {}",
        entry.entry_type(),
        entry.summary()
    )))
}

fn apply_params(kind: &mut EntryKind, params: &EntryParams) -> Result<()> {
    match kind {
        EntryKind::Behavior { category, text } => {
            if let Some(raw) = &params.category {
                *category = parse_behavior_category(raw)?;
            }
            overwrite(text, &params.text);
        }
        EntryKind::Identity { key, value }
        | EntryKind::User { key, value }
        | EntryKind::Meta { key, value } => {
            // The key is the identity of the entry; only the value moves.
            let _ = key;
            overwrite(value, &params.value);
        }
        EntryKind::Learning {
            text,
            source,
            scope,
            project_path,
        } => {
            overwrite(text, &params.text);
            if params.source.is_some() {
                *source = params.source;
            }
            if params.scope.is_some() {
                *scope = params.scope;
            }
            if params.project_path.is_some() {
                *project_path = params.project_path.clone();
            }
        }
        EntryKind::Preference { category, text } => {
            overwrite(category, &params.category);
            overwrite(text, &params.text);
        }
        EntryKind::Context {
            project, content, ..
        } => {
            overwrite(project, &params.project);
            overwrite(content, &params.content);
        }
        EntryKind::Task {
            description,
            status,
            priority,
            tags,
            due,
            ..
        } => {
            overwrite(description, &params.description);
            if let Some(new_status) = params.status {
                *status = new_status;
            }
            if let Some(new_priority) = params.priority {
                *priority = new_priority;
            }
            if let Some(new_tags) = &params.tags {
                *tags = new_tags.clone();
            }
            if params.due.is_some() {
                *due = params.due.clone();
            }
        }
        EntryKind::Reminder {
            text,
            enabled,
            cadence,
            priority,
            tags,
            ..
        } => {
            overwrite(text, &params.text);
            if let Some(new_enabled) = params.enabled {
                *enabled = new_enabled;
            }
            if let Some(new_cadence) = &params.cadence {
                new_cadence.validate()?;
                *cadence = new_cadence.clone();
            }
            if let Some(new_priority) = params.priority {
                *priority = new_priority;
            }
            if let Some(new_tags) = &params.tags {
                *tags = new_tags.clone();
            }
        }
        EntryKind::Tombstone { .. } => bail!("tombstones cannot be updated"),
    }
    Ok(())
}

fn overwrite(slot: &mut String, value: &Option<String>) {
    if let Some(value) = value {
        *slot = value.clone();
    }
}

// ── remove ───────────────────────────────────────────────────────────────────

async fn do_remove(
    brain_path: &Path,
    id: Option<String>,
    entry_type: Option<String>,
    key: Option<String>,
    now: DateTime<Utc>,
) -> Result<BrainActionResult> {
    let (state, _) = load_brain(brain_path)?;

    let (target_id, target_type, summary) = if let Some(id) = id {
        let Some(existing) = state.find(&id) else {
            return Ok(BrainActionResult::failure(format!("No entry with id {id}")));
        };
        (id.clone(), existing.entry_type(), existing.summary())
    } else {
        let raw_type = entry_type.context("remove needs an id, or a keyed type plus key")?;
        let parsed = EntryType::parse(&raw_type)
            .with_context(|| format!("unknown entry type {raw_type:?}"))?;
        if !parsed.is_keyed() {
            bail!("{parsed} entries are removed by id");
        }
        let key = key.context("key is required when removing by type")?;
        let target_id = deterministic_id(parsed, &key);
        let summary = state
            .find(&target_id)
            .map(|entry| entry.summary())
            .unwrap_or_else(|| format!("{parsed} {key}"));
        (target_id, parsed, summary)
    };

    let tombstone = BrainEntry {
        id: random_id(),
        created: now,
        kind: EntryKind::Tombstone {
            target_id: target_id.clone(),
            target_type,
            reason: "remove".to_string(),
        },
    };
    append_brain_entry(brain_path, &tombstone).await?;

    Ok(BrainActionResult::success(format!(
        "Removed {target_type} {target_id}: {summary}"
    )))
}

// ── list ─────────────────────────────────────────────────────────────────────

fn do_list(
    brain_path: &Path,
    entry_type: Option<String>,
    query: Option<String>,
    filter: Option<ListFilter>,
    verbose: bool,
    now: DateTime<Utc>,
) -> Result<BrainActionResult> {
    let type_filter = match entry_type.as_deref() {
        Some(raw) => Some(
            EntryType::parse(raw).with_context(|| format!("unknown entry type {raw:?}"))?,
        ),
        None => None,
    };
    let (entries, _) = read_brain(brain_path)?;
    let state = crate::store::fold_brain(&entries);

    let query_lower = query.map(|q| q.to_lowercase());
    let matches = |entry: &BrainEntry| -> bool {
        if let Some(wanted) = type_filter {
            if entry.entry_type() != wanted {
                return false;
            }
        }
        if let Some(query) = &query_lower {
            if !entry.summary().to_lowercase().contains(query) {
                return false;
            }
        }
        match filter {
            Some(ListFilter::Pending) => {
                matches!(&entry.kind, EntryKind::Task { status, .. } if *status == TaskStatus::Pending)
            }
            Some(ListFilter::Done) => {
                matches!(&entry.kind, EntryKind::Task { status, .. } if *status == TaskStatus::Done)
            }
            Some(ListFilter::Active) => {
                matches!(&entry.kind, EntryKind::Reminder { enabled, .. } if *enabled)
            }
            None => true,
        }
    };

    let mut selected: Vec<&BrainEntry> = Vec::new();
    for map in [&state.identity, &state.user, &state.meta] {
        selected.extend(map.values().filter(|e| matches(e)));
    }
    for list in [
        &state.behaviors,
        &state.preferences,
        &state.contexts,
        &state.learnings,
        &state.tasks,
        &state.reminders,
    ] {
        selected.extend(list.iter().filter(|e| matches(e)));
    }

    if verbose {
        let raw: Vec<serde_json::Value> = selected
            .iter()
            .map(|entry| serde_json::to_value(entry))
            .collect::<std::result::Result<_, _>>()?;
        return Ok(BrainActionResult::success_with(
            format!("{} entries", raw.len()),
            serde_json::Value::Array(raw),
        ));
    }

    // Compact: group by type, oldest to newest, with relative ages.
    let group_order = [
        EntryType::Identity,
        EntryType::User,
        EntryType::Behavior,
        EntryType::Preference,
        EntryType::Context,
        EntryType::Learning,
        EntryType::Task,
        EntryType::Reminder,
        EntryType::Meta,
    ];
    let mut out = String::new();
    for group_type in group_order {
        let mut group: Vec<&&BrainEntry> = selected
            .iter()
            .filter(|e| e.entry_type() == group_type)
            .collect();
        if group.is_empty() {
            continue;
        }
        group.sort_by(|a, b| a.created.cmp(&b.created).then(a.id.cmp(&b.id)));
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&format!("{group_type} ({}):\n", group.len()));
        for entry in group {
            let source_note = match &entry.kind {
                EntryKind::Learning {
                    source: Some(source),
                    ..
                } => format!(
                    ", {}",
                    match source {
                        LearningSource::Auto => "auto",
                        LearningSource::Manual => "manual",
                    }
                ),
                _ => String::new(),
            };
            out.push_str(&format!(
                "  {}  {}  ({}{})\n",
                entry.id,
                entry.summary(),
                relative_age(now, entry.created),
                source_note
            ));
        }
    }

    if out.is_empty() {
        out = "(no entries)".to_string();
    }
    Ok(BrainActionResult::success_with(
        out,
        json!({ "count": selected.len() }),
    ))
}

fn relative_age(now: DateTime<Utc>, created: DateTime<Utc>) -> String {
    let delta = now.signed_duration_since(created);
    if delta.num_seconds() < 60 {
        "just now".to_string()
    } else if delta.num_minutes() < 60 {
        format!("{}m ago", delta.num_minutes())
    } else if delta.num_hours() < 24 {
        format!("{}h ago", delta.num_hours())
    } else {
        format!("{}d ago", delta.num_days())
    }
}

// ── decay ────────────────────────────────────────────────────────────────────

async fn do_decay(
    brain_path: &Path,
    opts: &BrainToolOptions,
    now: DateTime<Utc>,
) -> Result<BrainActionResult> {
    let (state, _) = load_brain(brain_path)?;
    let mut removed = 0usize;

    for entry in &state.learnings {
        let age_days = now.signed_duration_since(entry.created).num_days();
        if age_days <= opts.decay_after_days {
            continue;
        }
        let score = learning_score(entry, now, &opts.cwd);
        if score >= opts.decay_min_score {
            continue;
        }
        let tombstone = BrainEntry {
            id: random_id(),
            created: now,
            kind: EntryKind::Tombstone {
                target_id: entry.id.clone(),
                target_type: EntryType::Learning,
                reason: "decay".to_string(),
            },
        };
        append_brain_entry(brain_path, &tombstone).await?;
        removed += 1;
    }

    let message = if removed == 0 {
        "Nothing to decay".to_string()
    } else {
        format!("Decayed {removed} learnings")
    };
    Ok(BrainActionResult::success_with(
        message,
        json!({ "removed": removed }),
    ))
}

// ── tasks & reminders ────────────────────────────────────────────────────────

async fn do_task_done(
    brain_path: &Path,
    id: &str,
    now: DateTime<Utc>,
) -> Result<BrainActionResult> {
    let (state, _) = load_brain(brain_path)?;
    let Some(existing) = state.find(id) else {
        return Ok(BrainActionResult::failure(format!("No entry with id {id}")));
    };
    let mut entry = existing.clone();
    match &mut entry.kind {
        EntryKind::Task {
            status,
            completed_at,
            ..
        } => {
            *status = TaskStatus::Done;
            *completed_at = Some(now);
        }
        _ => {
            return Ok(BrainActionResult::failure(format!(
                "Entry {id} is not a task"
            )));
        }
    }
    append_brain_entry(brain_path, &entry).await?;
    Ok(BrainActionResult::success(format!(
        "Task done: {}",
        entry.summary()
    )))
}

async fn do_task_clear(brain_path: &Path, now: DateTime<Utc>) -> Result<BrainActionResult> {
    let (state, _) = load_brain(brain_path)?;
    let done: Vec<&BrainEntry> = state
        .tasks
        .iter()
        .filter(|entry| {
            matches!(&entry.kind, EntryKind::Task { status, .. } if *status == TaskStatus::Done)
        })
        .collect();

    for entry in &done {
        let tombstone = BrainEntry {
            id: random_id(),
            created: now,
            kind: EntryKind::Tombstone {
                target_id: entry.id.clone(),
                target_type: EntryType::Task,
                reason: "task_clear".to_string(),
            },
        };
        append_brain_entry(brain_path, &tombstone).await?;
    }

    Ok(BrainActionResult::success_with(
        format!("Cleared {} done tasks", done.len()),
        json!({ "removed": done.len() }),
    ))
}

async fn do_reminder_run(
    brain_path: &Path,
    id: &str,
    result: Option<RunResult>,
    error: Option<String>,
    now: DateTime<Utc>,
) -> Result<BrainActionResult> {
    let (state, _) = load_brain(brain_path)?;
    let Some(existing) = state.find(id) else {
        return Ok(BrainActionResult::failure(format!("No entry with id {id}")));
    };
    let mut entry = existing.clone();
    let next_due_at = match &mut entry.kind {
        EntryKind::Reminder {
            cadence,
            last_run,
            next_due,
            last_result,
            last_error,
            ..
        } => {
            let due = cadence.next_due_after(now)?;
            *last_run = Some(now);
            *last_result = Some(result.unwrap_or(RunResult::Ok));
            *last_error = error;
            *next_due = Some(due);
            due
        }
        _ => {
            return Ok(BrainActionResult::failure(format!(
                "Entry {id} is not a reminder"
            )));
        }
    };
    append_brain_entry(brain_path, &entry).await?;
    Ok(BrainActionResult::success_with(
        format!("Reminder run recorded; next due {}", next_due_at.to_rfc3339()),
        json!({ "next_due": next_due_at.to_rfc3339() }),
    ))
}
