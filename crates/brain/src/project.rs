//! Deterministic, budgeted projection of the brain into a system-prompt
//! prefix.
//!
//! Identity and User render at full fidelity and their cost is subtracted
//! from the budget first. The remainder splits Behavior 15% / Preferences
//! 20% / Context 25% / Learnings 40%, with any unused allocation cascading
//! into Learnings. Within a section lines are added in order until the
//! section budget would be exceeded; omissions leave a `(…N more omitted)`
//! marker. The token estimator is a flat 4 chars per token.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::schema::{BehaviorCategory, BrainEntry, EntryKind, LearningScope, LearningSource};
use crate::store::BrainState;

pub const DEFAULT_PROMPT_BUDGET: usize = 2000;
const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone)]
pub struct ProjectOptions {
    pub cwd: std::path::PathBuf,
    pub budget: usize,
}

impl Default for ProjectOptions {
    fn default() -> Self {
        Self {
            cwd: std::env::current_dir().unwrap_or_else(|_| "/".into()),
            budget: DEFAULT_PROMPT_BUDGET,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Projection {
    pub text: String,
    /// Ids that actually entered the prompt, in render order. Entries that
    /// were stored but budget-clipped are absent.
    pub injected_ids: Vec<String>,
}

pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Score a learning for ranking and decay decisions.
///
/// Recency contributes 0..10 (one point lost per week of age), project
/// scope adds 5 when the cwd sits under the learning's project path, and a
/// manual source adds 2.
pub fn learning_score(entry: &BrainEntry, now: DateTime<Utc>, cwd: &Path) -> i64 {
    let EntryKind::Learning {
        source,
        scope,
        project_path,
        ..
    } = &entry.kind
    else {
        return 0;
    };

    let age_days = now.signed_duration_since(entry.created).num_days().max(0);
    let mut score = (10 - age_days / 7).max(0);

    if *scope == Some(LearningScope::Project) {
        if let Some(project_path) = project_path {
            if cwd.to_string_lossy().starts_with(project_path.as_str()) {
                score += 5;
            }
        }
    }
    if *source == Some(LearningSource::Manual) {
        score += 2;
    }
    score
}

pub fn project_brain(state: &BrainState, opts: &ProjectOptions) -> Projection {
    project_at(state, opts, Utc::now())
}

/// Deterministic core: same state, options, and clock always yield the same
/// text and injected-id list.
pub fn project_at(state: &BrainState, opts: &ProjectOptions, now: DateTime<Utc>) -> Projection {
    let mut sections: Vec<String> = Vec::new();
    let mut injected: Vec<String> = Vec::new();

    // Identity and User are full fidelity; their real cost comes off the top.
    let mut anchored_tokens = 0usize;
    for (title, map) in [("## Identity", &state.identity), ("## User", &state.user)] {
        if map.is_empty() {
            continue;
        }
        let mut lines = vec![title.to_string()];
        for entry in map.values() {
            let (key, value) = match &entry.kind {
                EntryKind::Identity { key, value } | EntryKind::User { key, value } => (key, value),
                _ => continue,
            };
            lines.push(format!("- {key}: {value}"));
            injected.push(entry.id.clone());
        }
        let rendered = lines.join("\n");
        anchored_tokens += estimate_tokens(&rendered);
        sections.push(rendered);
    }

    let remaining = opts.budget.saturating_sub(anchored_tokens);
    let behavior_budget = remaining * 15 / 100;
    let preference_budget = remaining * 20 / 100;
    let context_budget = remaining * 25 / 100;
    let learning_budget = remaining * 40 / 100;

    let mut carry = 0usize;

    // ── Behavior: grouped Do / Don't / Values, in log order ──────────────
    let behavior_lines = behavior_section_lines(state);
    carry += render_section(&mut sections, &mut injected, behavior_lines, behavior_budget);

    // ── Preferences: grouped by category ─────────────────────────────────
    let preference_lines = preference_section_lines(state);
    carry += render_section(
        &mut sections,
        &mut injected,
        preference_lines,
        preference_budget,
    );

    // ── Context: single longest-prefix winner for the cwd ────────────────
    let context_lines = context_section_lines(state, &opts.cwd);
    carry += render_section(&mut sections, &mut injected, context_lines, context_budget);

    // ── Learnings: scored, ranked, clipped; absorbs all unused budget ────
    let learning_lines = learning_section_lines(state, now, &opts.cwd);
    render_section(
        &mut sections,
        &mut injected,
        learning_lines,
        learning_budget + carry,
    );

    Projection {
        text: sections.join("\n\n"),
        injected_ids: injected,
    }
}

/// The id list that [`project_at`] would inject, without the text.
pub fn injected_ids(state: &BrainState, opts: &ProjectOptions, now: DateTime<Utc>) -> Vec<String> {
    project_at(state, opts, now).injected_ids
}

/// A candidate section line; headers carry no id and count no omission.
struct Line {
    text: String,
    id: Option<String>,
}

impl Line {
    fn header(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            id: None,
        }
    }

    fn entry(text: impl Into<String>, id: &str) -> Self {
        Self {
            text: text.into(),
            id: Some(id.to_string()),
        }
    }
}

/// Add lines in order until the budget would be exceeded; count omitted
/// entries and append the marker. Returns the unused token allocation.
fn render_section(
    sections: &mut Vec<String>,
    injected: &mut Vec<String>,
    lines: Vec<Line>,
    budget: usize,
) -> usize {
    if lines.is_empty() {
        return budget;
    }

    let mut used = 0usize;
    let mut rendered: Vec<String> = Vec::new();
    let mut rendered_entries = 0usize;
    let mut omitted = 0usize;
    let mut stopped = false;

    for line in lines {
        if stopped {
            if line.id.is_some() {
                omitted += 1;
            }
            continue;
        }
        let cost = estimate_tokens(&line.text);
        if used + cost > budget {
            stopped = true;
            if line.id.is_some() {
                omitted += 1;
            }
            continue;
        }
        used += cost;
        rendered.push(line.text);
        if let Some(id) = line.id {
            injected.push(id);
            rendered_entries += 1;
        }
    }

    // A section whose every entry was clipped contributes nothing, not even
    // its headers.
    if rendered_entries == 0 {
        return budget;
    }

    if omitted > 0 {
        rendered.push(format!("(…{omitted} more omitted)"));
    }
    sections.push(rendered.join("\n"));
    budget.saturating_sub(used)
}

fn behavior_section_lines(state: &BrainState) -> Vec<Line> {
    if state.behaviors.is_empty() {
        return Vec::new();
    }
    let mut lines = vec![Line::header("## Behavior")];
    for (category, group_title) in [
        (BehaviorCategory::Do, "Do:"),
        (BehaviorCategory::Dont, "Don't:"),
        (BehaviorCategory::Value, "Values:"),
    ] {
        let group: Vec<&BrainEntry> = state
            .behaviors
            .iter()
            .filter(|entry| {
                matches!(&entry.kind, EntryKind::Behavior { category: c, .. } if *c == category)
            })
            .collect();
        if group.is_empty() {
            continue;
        }
        lines.push(Line::header(group_title));
        for entry in group {
            if let EntryKind::Behavior { text, .. } = &entry.kind {
                lines.push(Line::entry(format!("- {text}"), &entry.id));
            }
        }
    }
    lines
}

fn preference_section_lines(state: &BrainState) -> Vec<Line> {
    if state.preferences.is_empty() {
        return Vec::new();
    }
    let mut grouped: BTreeMap<&str, Vec<&BrainEntry>> = BTreeMap::new();
    for entry in &state.preferences {
        if let EntryKind::Preference { category, .. } = &entry.kind {
            grouped.entry(category.as_str()).or_default().push(entry);
        }
    }
    let mut lines = vec![Line::header("## Preferences")];
    for (category, group) in grouped {
        lines.push(Line::header(format!("[{category}]")));
        for entry in group {
            if let EntryKind::Preference { text, .. } = &entry.kind {
                lines.push(Line::entry(format!("- {text}"), &entry.id));
            }
        }
    }
    lines
}

fn context_section_lines(state: &BrainState, cwd: &Path) -> Vec<Line> {
    let cwd_str = cwd.to_string_lossy();
    let mut winner: Option<&BrainEntry> = None;
    for entry in &state.contexts {
        let EntryKind::Context { path, .. } = &entry.kind else {
            continue;
        };
        if !cwd_str.starts_with(path.as_str()) {
            continue;
        }
        winner = match winner {
            None => Some(entry),
            Some(current) => {
                let current_path = match &current.kind {
                    EntryKind::Context { path, .. } => path,
                    _ => unreachable!(),
                };
                if path.len() > current_path.len() {
                    Some(entry)
                } else if path.len() == current_path.len() && entry.created < current.created {
                    // Equal-length prefixes: the oldest entry wins.
                    Some(entry)
                } else {
                    Some(current)
                }
            }
        };
    }

    let Some(winner) = winner else {
        return Vec::new();
    };
    let EntryKind::Context {
        project,
        path,
        content,
    } = &winner.kind
    else {
        return Vec::new();
    };

    let mut lines = vec![
        Line::header("## Project Context"),
        Line::entry(format!("{path} ({project})"), &winner.id),
    ];
    for content_line in content.lines() {
        lines.push(Line::header(content_line.to_string()));
    }
    lines
}

fn learning_section_lines(state: &BrainState, now: DateTime<Utc>, cwd: &Path) -> Vec<Line> {
    if state.learnings.is_empty() {
        return Vec::new();
    }
    let mut ranked: Vec<&BrainEntry> = state.learnings.iter().collect();
    ranked.sort_by(|a, b| {
        learning_score(b, now, cwd)
            .cmp(&learning_score(a, now, cwd))
            .then(b.created.cmp(&a.created))
            .then(a.id.cmp(&b.id))
    });

    let mut lines = vec![Line::header("## Learnings")];
    for entry in ranked {
        if let EntryKind::Learning { text, .. } = &entry.kind {
            lines.push(Line::entry(format!("- {text}"), &entry.id));
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{BrainEntry, EntryKind, EntryType, deterministic_id};
    use crate::store::fold_brain;
    use chrono::Duration;
    use std::path::PathBuf;

    fn identity(key: &str, value: &str, created: DateTime<Utc>) -> BrainEntry {
        BrainEntry {
            id: deterministic_id(EntryType::Identity, key),
            created,
            kind: EntryKind::Identity {
                key: key.to_string(),
                value: value.to_string(),
            },
        }
    }

    fn learning_at(text: &str, created: DateTime<Utc>) -> BrainEntry {
        BrainEntry::new(
            EntryKind::Learning {
                text: text.to_string(),
                source: None,
                scope: None,
                project_path: None,
            },
            created,
        )
    }

    fn context_at(project: &str, path: &str, created: DateTime<Utc>) -> BrainEntry {
        BrainEntry {
            id: deterministic_id(EntryType::Context, path),
            created,
            kind: EntryKind::Context {
                project: project.to_string(),
                path: path.to_string(),
                content: "build: cargo test".to_string(),
            },
        }
    }

    fn opts(budget: usize) -> ProjectOptions {
        ProjectOptions {
            cwd: PathBuf::from("/home/u/proj/sub"),
            budget,
        }
    }

    #[test]
    fn scoring_rewards_recency_scope_and_manual_source() {
        let now = Utc::now();
        let cwd = PathBuf::from("/home/u/proj");
        let fresh_manual = BrainEntry::new(
            EntryKind::Learning {
                text: "x".into(),
                source: Some(LearningSource::Manual),
                scope: Some(LearningScope::Project),
                project_path: Some("/home/u/proj".into()),
            },
            now,
        );
        assert_eq!(learning_score(&fresh_manual, now, &cwd), 17);

        let stale_auto = BrainEntry::new(
            EntryKind::Learning {
                text: "y".into(),
                source: Some(LearningSource::Auto),
                scope: Some(LearningScope::Global),
                project_path: None,
            },
            now - Duration::days(120),
        );
        assert_eq!(learning_score(&stale_auto, now, &cwd), 0);
    }

    #[test]
    fn identity_is_full_fidelity_and_total_stays_within_budget() {
        let now = Utc::now();
        let mut entries = Vec::new();
        for i in 0..30 {
            entries.push(identity(&format!("k{i:02}"), "value", now));
        }
        for i in 0..100 {
            entries.push(learning_at(
                &format!("learning number {i:03} with some padding text"),
                now - Duration::days(i),
            ));
        }
        let state = fold_brain(&entries);

        let projection = project_at(&state, &opts(1000), now);
        // All 30 identity entries render regardless of the squeeze.
        for i in 0..30 {
            assert!(projection.text.contains(&format!("k{i:02}: value")));
        }
        assert!(estimate_tokens(&projection.text) <= 1000 + 10);
        assert!(projection.text.contains("more omitted)"));

        // Injected ids mirror the render exactly: 30 identity + clipped learnings.
        let rendered_learnings = projection
            .injected_ids
            .iter()
            .filter(|id| state.learnings.iter().any(|e| e.id.as_str() == id.as_str()))
            .count();
        assert!(rendered_learnings > 0);
        assert!(rendered_learnings < 100);
        assert_eq!(projection.injected_ids.len(), 30 + rendered_learnings);
    }

    #[test]
    fn unused_allocation_cascades_to_learnings() {
        let now = Utc::now();
        let mut entries = Vec::new();
        // No behaviors, preferences, or contexts: their shares flow onward.
        for i in 0..200 {
            entries.push(learning_at(
                &format!("learning {i:03} padded out to a steady length"),
                now - Duration::days(i % 30),
            ));
        }
        let state = fold_brain(&entries);

        let narrow = project_at(&state, &opts(500), now);
        let narrow_count = narrow.injected_ids.len();
        // 40% of 500 is 200 tokens; the cascade lifts the learning budget to
        // the full 500, so far more than 40%-worth must have rendered.
        let line_tokens = estimate_tokens("- learning 000 padded out to a steady length");
        assert!(narrow_count > 200 / line_tokens);
    }

    #[test]
    fn context_picks_longest_prefix_and_breaks_ties_by_age() {
        let now = Utc::now();
        let older = now - Duration::days(10);
        let entries = vec![
            context_at("home", "/home/u", now),
            context_at("proj-new", "/home/u/proj", now),
            context_at("other", "/somewhere/else", now),
        ];
        let state = fold_brain(&entries);
        let projection = project_at(&state, &opts(2000), now);
        assert!(projection.text.contains("/home/u/proj (proj-new)"));
        assert!(!projection.text.contains("(home)"));
        assert!(!projection.text.contains("(other)"));

        // Same-length prefix: oldest created wins.
        let mut a = context_at("first", "/home/u/proj", older);
        a.id = "aaaaaaaa".to_string();
        let mut b = context_at("second", "/home/u/proj", now);
        b.id = "bbbbbbbb".to_string();
        let state = fold_brain(&[b, a]);
        let projection = project_at(&state, &opts(2000), now);
        assert!(projection.text.contains("(first)"));
    }

    #[test]
    fn behaviors_group_in_do_dont_value_order() {
        let now = Utc::now();
        let entries = vec![
            BrainEntry::new(
                EntryKind::Behavior {
                    category: BehaviorCategory::Value,
                    text: "curiosity".into(),
                },
                now,
            ),
            BrainEntry::new(
                EntryKind::Behavior {
                    category: BehaviorCategory::Do,
                    text: "ask before deleting".into(),
                },
                now,
            ),
            BrainEntry::new(
                EntryKind::Behavior {
                    category: BehaviorCategory::Dont,
                    text: "no force pushes".into(),
                },
                now,
            ),
        ];
        let state = fold_brain(&entries);
        let projection = project_at(&state, &opts(2000), now);

        let do_pos = projection.text.find("Do:").unwrap();
        let dont_pos = projection.text.find("Don't:").unwrap();
        let values_pos = projection.text.find("Values:").unwrap();
        assert!(do_pos < dont_pos && dont_pos < values_pos);
    }

    #[test]
    fn meta_entries_are_never_projected() {
        let now = Utc::now();
        let entries = vec![BrainEntry {
            id: deterministic_id(EntryType::Meta, "schema_version"),
            created: now,
            kind: EntryKind::Meta {
                key: "schema_version".into(),
                value: "3".into(),
            },
        }];
        let state = fold_brain(&entries);
        let projection = project_at(&state, &opts(2000), now);
        assert!(projection.text.is_empty());
        assert!(projection.injected_ids.is_empty());
    }

    #[test]
    fn empty_state_projects_to_empty_text() {
        let projection = project_at(&BrainState::default(), &opts(2000), Utc::now());
        assert!(projection.text.is_empty());
        assert!(projection.injected_ids.is_empty());
    }
}
