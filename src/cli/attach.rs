use std::io::{self, Read, Write};
use std::thread;

use anyhow::{anyhow, Result};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size as terminal_size};
use tokio::sync::mpsc;

use crate::events::SupervisorEvent;
use crate::pty::{ResizeWatcher, TerminalSize};
use crate::supervisor::{Attachment, Supervisor};
use crate::task::{TaskId, TaskView};

/// Ctrl-]
const DETACH_KEY: u8 = 0x1d;

enum Detach {
    Requested,
    InputClosed,
    TaskEnded(TaskView),
    WriteFailed(String),
}

/// Bridge this terminal to the task's PTY until Ctrl-] or task exit.
pub async fn attach(supervisor: &Supervisor, id: &TaskId) -> Result<()> {
    if let Ok((cols, rows)) = terminal_size() {
        supervisor.resize(id, TerminalSize::new(rows, cols))?;
    }
    supervisor.start(id).await?;

    let Attachment {
        history,
        mut events,
    } = supervisor.attach(id)?;
    let mut stdout = io::stdout();

    let view = supervisor.get(id)?;
    if !view.status.is_running() {
        stdout.write_all(&history)?;
        stdout.flush()?;
        println!("\r\n[taskmux] {} is {}", view.config.name, view.status.state());
        supervisor.shutdown().await;
        return Ok(());
    }

    enable_raw_mode()?;
    let raw_mode = scopeguard::guard((), |_| {
        let _ = disable_raw_mode();
    });
    stdout.write_all(&history)?;
    stdout.flush()?;

    let (input_tx, mut input_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    thread::Builder::new()
        .name("stdin-forwarder".to_string())
        .spawn(move || {
            let mut stdin = io::stdin();
            let mut buffer = [0u8; 1024];
            loop {
                let count = match stdin.read(&mut buffer) {
                    Ok(0) | Err(_) => break,
                    Ok(count) => count,
                };
                if input_tx.send(buffer[..count].to_vec()).is_err() {
                    break;
                }
            }
        })?;

    let resizer = {
        let supervisor = supervisor.clone();
        let id = id.clone();
        ResizeWatcher::start(move |size| {
            if let Err(err) = supervisor.resize(&id, size) {
                tracing::debug!(task_id = %id, error = %err, "resize failed");
            }
        })
        .map_err(|err| anyhow!("failed to watch terminal size: {}", err))?
    };

    let reason = loop {
        tokio::select! {
            input = input_rx.recv() => {
                let Some(bytes) = input else { break Detach::InputClosed };
                let (forward, detach) = match bytes.iter().position(|&b| b == DETACH_KEY) {
                    Some(at) => (&bytes[..at], true),
                    None => (&bytes[..], false),
                };
                if !forward.is_empty() {
                    if let Err(err) = supervisor.write(id, forward) {
                        break Detach::WriteFailed(err.to_string());
                    }
                }
                if detach {
                    break Detach::Requested;
                }
            }
            event = events.recv() => match event {
                Some(SupervisorEvent::Output { data, .. }) => {
                    stdout.write_all(&data)?;
                    stdout.flush()?;
                }
                Some(SupervisorEvent::Status { view, .. }) if !view.status.is_running() => {
                    break Detach::TaskEnded(view);
                }
                Some(SupervisorEvent::Status { .. }) => {}
                None => break Detach::InputClosed,
            },
        }
    };

    if let Some(resizer) = resizer {
        resizer.stop();
    }
    drop(raw_mode);

    match reason {
        Detach::Requested => println!("\r\n[taskmux] detached"),
        Detach::InputClosed => println!("\r\n[taskmux] input closed"),
        Detach::TaskEnded(view) => {
            let detail = view
                .status
                .detail()
                .map(|d| format!(" ({})", d))
                .unwrap_or_default();
            println!("\r\n[taskmux] {} is {}{}", view.config.name, view.status.state(), detail);
        }
        Detach::WriteFailed(err) => println!("\r\n[taskmux] {}", err),
    }
    supervisor.shutdown().await;
    Ok(())
}
