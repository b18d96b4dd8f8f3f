use std::collections::BTreeMap;
use std::path::PathBuf;

use portable_pty::CommandBuilder;

/// Everything needed to launch one task instance.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub command: String,
    pub env_vars: BTreeMap<String, String>,
    /// Overrides the platform shell (`sh` / `cmd`).
    pub shell: Option<String>,
    /// Defaults to the supervisor's current directory.
    pub working_dir: Option<PathBuf>,
}

impl SpawnSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            env_vars: BTreeMap::new(),
            shell: None,
            working_dir: None,
        }
    }
}

/// Program and leading arguments used to interpret a command line.
pub fn shell_invocation(shell: Option<&str>) -> (String, Vec<String>) {
    let default_shell = if cfg!(target_os = "windows") { "cmd" } else { "sh" };
    let program = shell.unwrap_or(default_shell).to_string();
    let flag = if program.eq_ignore_ascii_case("cmd") || program.eq_ignore_ascii_case("cmd.exe") {
        "/C"
    } else {
        "-c"
    };
    (program, vec![flag.to_string()])
}

pub(crate) fn build_command(spec: &SpawnSpec) -> std::io::Result<CommandBuilder> {
    let (program, args) = shell_invocation(spec.shell.as_deref());
    let mut cmd = CommandBuilder::new(program);
    cmd.args(args);
    cmd.arg(&spec.command);

    let cwd = match &spec.working_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    cmd.cwd(cwd);
    cmd.env("TERM", "xterm-256color");
    for (key, value) in &spec.env_vars {
        cmd.env(key, value);
    }
    Ok(cmd)
}
