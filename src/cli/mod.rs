//! `taskmux` command line: drives an in-process supervisor.

mod attach;
mod commands;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::store::JsonTaskStore;
use crate::supervisor::{Supervisor, SupervisorSettings};

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "taskmux",
    version,
    about = "Run long-lived commands in their own terminals",
    disable_help_subcommand = true
)]
pub struct Cli {
    /// Path to config.toml (default: platform config directory).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List tasks.
    List {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Define a new task: taskmux add --name web -- npm run dev
    Add {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        tag: String,
        /// Restart automatically after an unexpected exit.
        #[arg(long)]
        auto_retry: bool,
        /// Environment entry KEY=VALUE (repeatable).
        #[arg(long = "env", value_parser = commands::parse_env)]
        env: Vec<(String, String)>,
        /// Command line, run through the shell.
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Change fields of an existing task.
    Edit {
        /// Task id or unique id prefix.
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        tag: Option<String>,
        #[arg(long)]
        command: Option<String>,
        #[arg(long)]
        auto_retry: Option<bool>,
        /// Add or replace an environment entry KEY=VALUE (repeatable).
        #[arg(long = "env", value_parser = commands::parse_env)]
        env: Vec<(String, String)>,
        /// Drop all environment entries before applying --env.
        #[arg(long)]
        clear_env: bool,
    },
    /// Delete a task and its history.
    Remove { id: String },
    /// Print a task's scrollback.
    Logs {
        id: String,
        /// Clear the history instead of printing it.
        #[arg(long)]
        clear: bool,
    },
    /// Start tasks (all when none given) and stream their output until Ctrl-C.
    Run { ids: Vec<String> },
    /// Attach this terminal to a task. Ctrl-] detaches and stops the task.
    Attach { id: String },
}

impl Cli {
    /// Whether logs may go to stderr. An attached raw-mode terminal must not
    /// receive log lines.
    pub fn logs_to_stderr(&self) -> bool {
        matches!(self.command, Command::Run { .. })
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("failed to load configuration")?;

    let store_path = config.store_path();
    let store = JsonTaskStore::open(&store_path)
        .with_context(|| format!("failed to open task store {}", store_path.display()))?;
    let supervisor = Supervisor::open(SupervisorSettings::from(&config), Arc::new(store))?;

    match cli.command {
        Command::List { json } => commands::list(&supervisor, json),
        Command::Add {
            name,
            tag,
            auto_retry,
            env,
            command,
        } => commands::add(&supervisor, name, tag, auto_retry, env, command),
        Command::Edit {
            id,
            name,
            tag,
            command,
            auto_retry,
            env,
            clear_env,
        } => commands::edit(
            &supervisor,
            &id,
            commands::Edits {
                name,
                tag,
                command,
                auto_retry,
                env,
                clear_env,
            },
        ),
        Command::Remove { id } => commands::remove(&supervisor, &id).await,
        Command::Logs { id, clear } => commands::logs(&supervisor, &id, clear),
        Command::Run { ids } => commands::run_tasks(&supervisor, &ids).await,
        Command::Attach { id } => {
            let id = commands::resolve_id(&supervisor, &id)?;
            attach::attach(&supervisor, &id).await
        }
    }
}
