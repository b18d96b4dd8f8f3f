use std::collections::HashMap;
use std::io::{self, Write};

use anyhow::{bail, Context, Result};

use crate::events::{EventFilter, SupervisorEvent};
use crate::supervisor::Supervisor;
use crate::task::{TaskDraft, TaskId, TaskState, TaskView};

/// `KEY=VALUE` argument parser.
pub fn parse_env(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    if key.is_empty() {
        return Err(format!("missing variable name in '{}'", raw));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Accept a full id or a prefix that matches exactly one task.
pub fn resolve_id(supervisor: &Supervisor, raw: &str) -> Result<TaskId> {
    let exact = TaskId::from(raw);
    if supervisor.get(&exact).is_ok() {
        return Ok(exact);
    }
    let mut matches = supervisor
        .list()
        .into_iter()
        .filter(|view| view.config.id.as_str().starts_with(raw));
    match (matches.next(), matches.next()) {
        (Some(view), None) => Ok(view.config.id),
        (Some(_), Some(_)) => bail!("task id prefix '{}' is ambiguous", raw),
        (None, _) => bail!("no task matches '{}'", raw),
    }
}

pub fn list(supervisor: &Supervisor, json: bool) -> Result<()> {
    let views = supervisor.list();
    if json {
        println!("{}", serde_json::to_string_pretty(&views)?);
        return Ok(());
    }
    if views.is_empty() {
        println!("no tasks");
        return Ok(());
    }
    println!(
        "{:<8}  {:<20}  {:<10}  {:<5}  COMMAND",
        "ID", "NAME", "TAG", "RETRY"
    );
    for view in &views {
        let config = &view.config;
        println!(
            "{:<8}  {:<20}  {:<10}  {:<5}  {}",
            config.id.short(),
            config.name,
            config.tag,
            if config.auto_retry { "yes" } else { "no" },
            config.command
        );
    }
    Ok(())
}

pub fn add(
    supervisor: &Supervisor,
    name: String,
    tag: String,
    auto_retry: bool,
    env: Vec<(String, String)>,
    command: Vec<String>,
) -> Result<()> {
    let mut draft = TaskDraft::new(name, command.join(" "))
        .with_tag(tag)
        .with_auto_retry(auto_retry);
    for (key, value) in env {
        draft = draft.with_env(key, value);
    }
    let view = supervisor.create(draft)?;
    println!("{}", view.config.id);
    Ok(())
}

pub struct Edits {
    pub name: Option<String>,
    pub tag: Option<String>,
    pub command: Option<String>,
    pub auto_retry: Option<bool>,
    pub env: Vec<(String, String)>,
    pub clear_env: bool,
}

pub fn edit(supervisor: &Supervisor, raw_id: &str, edits: Edits) -> Result<()> {
    let id = resolve_id(supervisor, raw_id)?;
    let current = supervisor.get(&id)?;
    let mut draft = TaskDraft::from_config(&current.config);
    if let Some(name) = edits.name {
        draft.name = name;
    }
    if let Some(tag) = edits.tag {
        draft.tag = tag;
    }
    if let Some(command) = edits.command {
        draft.command = command;
    }
    if let Some(auto_retry) = edits.auto_retry {
        draft.auto_retry = auto_retry;
    }
    if edits.clear_env {
        draft.env_vars = None;
    }
    for (key, value) in edits.env {
        draft = draft.with_env(key, value);
    }
    let view = supervisor.update(&id, draft)?;
    println!("updated {} ({})", view.config.name, view.config.id.short());
    Ok(())
}

pub async fn remove(supervisor: &Supervisor, raw_id: &str) -> Result<()> {
    let id = resolve_id(supervisor, raw_id)?;
    supervisor.delete(&id).await?;
    println!("removed {}", id);
    Ok(())
}

pub fn logs(supervisor: &Supervisor, raw_id: &str, clear: bool) -> Result<()> {
    let id = resolve_id(supervisor, raw_id)?;
    if clear {
        supervisor.clear_log_history(&id)?;
        return Ok(());
    }
    let history = supervisor.scrollback(&id)?;
    if history.is_empty() && supervisor.settings().log_dir.is_none() {
        eprintln!("history is not kept between runs while `persist = false` under [scrollback]");
    }
    let mut stdout = io::stdout().lock();
    stdout.write_all(&history)?;
    stdout.flush()?;
    Ok(())
}

/// Start the given tasks (all when empty) and print their output, one
/// prefixed line at a time, until Ctrl-C.
pub async fn run_tasks(supervisor: &Supervisor, raw_ids: &[String]) -> Result<()> {
    let ids = if raw_ids.is_empty() {
        supervisor.list().into_iter().map(|view| view.config.id).collect()
    } else {
        raw_ids
            .iter()
            .map(|raw| resolve_id(supervisor, raw))
            .collect::<Result<Vec<_>>>()?
    };
    if ids.is_empty() {
        bail!("no tasks to run");
    }

    let mut events = supervisor.subscribe(EventFilter::All);
    let mut prefixers: HashMap<TaskId, LinePrefixer> = HashMap::new();
    for id in &ids {
        let view = supervisor.get(id)?;
        prefixers.insert(id.clone(), LinePrefixer::new(&view.config.name));
        if let Err(err) = supervisor.start(id).await {
            eprintln!("[{}] failed to start: {}", view.config.name, err);
        }
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut stdout = io::stdout();
    loop {
        tokio::select! {
            signal = &mut ctrl_c => {
                signal.context("failed to listen for Ctrl-C")?;
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SupervisorEvent::Output { id, data } => {
                        if let Some(prefixer) = prefixers.get_mut(&id) {
                            for line in prefixer.feed(&data) {
                                writeln!(stdout, "{}", line)?;
                            }
                        }
                    }
                    SupervisorEvent::Status { id, view } => {
                        if let Some(prefixer) = prefixers.get(&id) {
                            writeln!(stdout, "{}", prefixer.status_line(&view))?;
                        }
                    }
                }
                stdout.flush()?;
            }
        }
    }

    supervisor.shutdown().await;
    for prefixer in prefixers.values_mut() {
        if let Some(line) = prefixer.finish() {
            writeln!(stdout, "{}", line)?;
        }
    }
    if events.dropped() > 0 {
        eprintln!("{} output chunks were dropped while printing", events.dropped());
    }
    Ok(())
}

/// Splits a task's raw terminal output into `[name] line` records.
struct LinePrefixer {
    prefix: String,
    partial: Vec<u8>,
}

impl LinePrefixer {
    fn new(name: &str) -> Self {
        Self {
            prefix: format!("[{}]", name),
            partial: Vec::new(),
        }
    }

    fn feed(&mut self, data: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(data);
        let mut lines = Vec::new();
        while let Some(end) = self.partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=end).collect();
            lines.push(self.format(&line[..end]));
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.partial);
        Some(self.format(&rest))
    }

    fn format(&self, line: &[u8]) -> String {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        format!("{} {}", self.prefix, String::from_utf8_lossy(line))
    }

    fn status_line(&self, view: &TaskView) -> String {
        let status = &view.status;
        let mut line = format!("{} -- {}", self.prefix, status.state());
        if status.state() == TaskState::Running {
            if let Some(pid) = status.pid() {
                line.push_str(&format!(" (pid {})", pid));
            }
        } else if let Some(detail) = status.detail() {
            line.push_str(&format!(" ({})", detail));
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_env_splits_on_first_equals() {
        assert_eq!(
            parse_env("URL=a=b").unwrap(),
            ("URL".to_string(), "a=b".to_string())
        );
        assert_eq!(parse_env("EMPTY=").unwrap(), ("EMPTY".to_string(), String::new()));
        assert!(parse_env("NOVALUE").is_err());
        assert!(parse_env("=x").is_err());
    }

    #[test]
    fn prefixer_emits_complete_lines_only() {
        let mut prefixer = LinePrefixer::new("web");
        assert!(prefixer.feed(b"listen").is_empty());
        assert_eq!(
            prefixer.feed(b"ing\r\nready\r\npart"),
            vec!["[web] listening".to_string(), "[web] ready".to_string()]
        );
        assert_eq!(prefixer.finish(), Some("[web] part".to_string()));
        assert_eq!(prefixer.finish(), None);
    }
}
