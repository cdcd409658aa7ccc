use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

use rho_brain::{BrainAction, BrainToolOptions, ProjectOptions, handle_brain_action};
use rho_config::RhoConfig;

#[derive(Debug, Parser)]
#[command(name = "rho", version, about = "Personal agent runtime shell")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Read or mutate the persistent brain.
    Brain {
        #[command(subcommand)]
        command: BrainCommands,
    },
    /// Print the projected system-prompt prefix for a working directory.
    Project {
        #[arg(long)]
        cwd: Option<PathBuf>,
        #[arg(long)]
        budget: Option<usize>,
    },
    /// Print the resolved brain and lock paths.
    Paths,
}

#[derive(Debug, Subcommand)]
enum BrainCommands {
    /// Add an entry (keyed types upsert by their natural key).
    Add {
        #[arg(long = "type")]
        entry_type: String,
        #[arg(long)]
        key: Option<String>,
        #[arg(long)]
        value: Option<String>,
        #[arg(long)]
        text: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        source: Option<String>,
        #[arg(long)]
        scope: Option<String>,
        #[arg(long = "project-path")]
        project_path: Option<String>,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        path: Option<String>,
        #[arg(long)]
        content: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        priority: Option<String>,
        #[arg(long)]
        tag: Vec<String>,
        #[arg(long)]
        due: Option<String>,
        /// Interval cadence, e.g. 30m, 2h, 1d.
        #[arg(long, conflicts_with = "at")]
        every: Option<String>,
        /// Daily cadence as HH:MM local time.
        #[arg(long)]
        at: Option<String>,
        #[arg(long)]
        disabled: bool,
    },
    /// Merge new field values over an existing entry.
    Update {
        id: String,
        #[arg(long)]
        value: Option<String>,
        #[arg(long)]
        text: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        content: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        priority: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        due: Option<String>,
        #[arg(long)]
        enabled: Option<bool>,
    },
    /// Tombstone an entry by id, or a keyed entry by type + key.
    Remove {
        id: Option<String>,
        #[arg(long = "type")]
        entry_type: Option<String>,
        #[arg(long)]
        key: Option<String>,
    },
    /// List entries, grouped by type.
    List {
        #[arg(long = "type")]
        entry_type: Option<String>,
        #[arg(long)]
        query: Option<String>,
        /// pending | done | active
        #[arg(long)]
        filter: Option<String>,
        #[arg(long)]
        verbose: bool,
    },
    /// Tombstone stale low-score learnings.
    Decay,
    /// Mark a task done.
    TaskDone { id: String },
    /// Tombstone all done tasks.
    TaskClear,
    /// Record a reminder run and reschedule it.
    ReminderRun {
        id: String,
        /// ok | error | skipped
        #[arg(long)]
        result: Option<String>,
        #[arg(long)]
        error: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = RhoConfig::load()?;
    let brain_path = config.brain_path();

    match cli.command {
        Commands::Brain { command } => {
            let params = brain_params(command);
            let action = match BrainAction::from_value(params) {
                Ok(action) => action,
                Err(err) => {
                    eprintln!("{err:#}");
                    return Ok(ExitCode::FAILURE);
                }
            };
            let opts = BrainToolOptions {
                decay_after_days: config.brain.decay_after_days,
                decay_min_score: config.brain.decay_min_score,
                ..Default::default()
            };
            let result = handle_brain_action(&brain_path, action, &opts).await;
            println!("{}", result.message);
            if let Some(data) = &result.data {
                if data.is_array() {
                    println!("{}", serde_json::to_string_pretty(data)?);
                }
            }
            Ok(if result.ok {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Project { cwd, budget } => {
            let (state, stats) = rho_brain::load_brain(&brain_path)?;
            if stats.bad_lines > 0 || stats.truncated_tail {
                eprintln!(
                    "warning: brain log damage (bad_lines={}, truncated_tail={})",
                    stats.bad_lines, stats.truncated_tail
                );
            }
            let opts = ProjectOptions {
                cwd: cwd.unwrap_or_else(|| {
                    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))
                }),
                budget: budget.unwrap_or(config.brain.prompt_budget),
            };
            let projection = rho_brain::project_brain(&state, &opts);
            println!("{}", projection.text);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Paths => {
            println!("brain: {}", brain_path.display());
            println!("lock:  {}", config.brain_lock_path().display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Flatten CLI flags into the brain tool's loose JSON params.
fn brain_params(command: BrainCommands) -> Value {
    fn set(obj: &mut serde_json::Map<String, Value>, key: &str, value: Option<String>) {
        if let Some(value) = value {
            obj.insert(key.to_string(), Value::String(value));
        }
    }

    let mut obj = serde_json::Map::new();
    match command {
        BrainCommands::Add {
            entry_type,
            key,
            value,
            text,
            category,
            source,
            scope,
            project_path,
            project,
            path,
            content,
            description,
            priority,
            tag,
            due,
            every,
            at,
            disabled,
        } => {
            obj.insert("action".into(), "add".into());
            obj.insert("type".into(), entry_type.into());
            set(&mut obj, "key", key);
            set(&mut obj, "value", value);
            set(&mut obj, "text", text);
            set(&mut obj, "category", category);
            set(&mut obj, "source", source);
            set(&mut obj, "scope", scope);
            set(&mut obj, "projectPath", project_path);
            set(&mut obj, "project", project);
            set(&mut obj, "path", path);
            set(&mut obj, "content", content);
            set(&mut obj, "description", description);
            set(&mut obj, "priority", priority);
            set(&mut obj, "due", due);
            if !tag.is_empty() {
                obj.insert("tags".into(), json!(tag));
            }
            if let Some(every) = every {
                obj.insert("cadence".into(), json!({"kind": "interval", "every": every}));
            } else if let Some(at) = at {
                obj.insert("cadence".into(), json!({"kind": "daily", "at": at}));
            }
            if disabled {
                obj.insert("enabled".into(), Value::Bool(false));
            }
        }
        BrainCommands::Update {
            id,
            value,
            text,
            category,
            content,
            description,
            priority,
            status,
            due,
            enabled,
        } => {
            obj.insert("action".into(), "update".into());
            obj.insert("id".into(), id.into());
            set(&mut obj, "value", value);
            set(&mut obj, "text", text);
            set(&mut obj, "category", category);
            set(&mut obj, "content", content);
            set(&mut obj, "description", description);
            set(&mut obj, "priority", priority);
            set(&mut obj, "status", status);
            set(&mut obj, "due", due);
            if let Some(enabled) = enabled {
                obj.insert("enabled".into(), Value::Bool(enabled));
            }
        }
        BrainCommands::Remove {
            id,
            entry_type,
            key,
        } => {
            obj.insert("action".into(), "remove".into());
            set(&mut obj, "id", id);
            set(&mut obj, "type", entry_type);
            set(&mut obj, "key", key);
        }
        BrainCommands::List {
            entry_type,
            query,
            filter,
            verbose,
        } => {
            obj.insert("action".into(), "list".into());
            set(&mut obj, "type", entry_type);
            set(&mut obj, "query", query);
            set(&mut obj, "filter", filter);
            if verbose {
                obj.insert("verbose".into(), Value::Bool(true));
            }
        }
        BrainCommands::Decay => {
            obj.insert("action".into(), "decay".into());
        }
        BrainCommands::TaskDone { id } => {
            obj.insert("action".into(), "task_done".into());
            obj.insert("id".into(), id.into());
        }
        BrainCommands::TaskClear => {
            obj.insert("action".into(), "task_clear".into());
        }
        BrainCommands::ReminderRun { id, result, error } => {
            obj.insert("action".into(), "reminder_run".into());
            obj.insert("id".into(), id.into());
            set(&mut obj, "result", result);
            set(&mut obj, "error", error);
        }
    }
    Value::Object(obj)
}
