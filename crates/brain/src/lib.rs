pub mod project;
pub mod schema;
pub mod store;
pub mod tool;

pub use project::{
    DEFAULT_PROMPT_BUDGET, ProjectOptions, Projection, estimate_tokens, injected_ids,
    learning_score, project_at, project_brain,
};
pub use schema::{
    BehaviorCategory, BrainEntry, Cadence, EntryKind, EntryType, LearningScope, LearningSource,
    Priority, RunResult, TaskStatus, deterministic_id, normalize_text, random_id,
};
pub use store::{
    BrainState, ReadStats, append_brain_entry, append_brain_entry_with_dedup, fold_brain,
    load_brain, read_brain,
};
pub use tool::{
    BrainAction, BrainActionResult, BrainToolOptions, EntryParams, ListFilter, handle_brain_action,
};
