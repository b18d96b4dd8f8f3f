use std::error::Error;
#[cfg(unix)]
use std::thread;

use crate::pty::channel::TerminalSize;

#[cfg(unix)]
use crossterm::terminal::size as terminal_size;
#[cfg(unix)]
use signal_hook::consts::signal::SIGWINCH;
#[cfg(unix)]
use signal_hook::iterator::Signals;

/// Follows the controlling terminal's size and reports every change.
pub struct ResizeWatcher {
    #[cfg(unix)]
    handle: signal_hook::iterator::Handle,
    #[cfg(unix)]
    thread: thread::JoinHandle<()>,
}

impl ResizeWatcher {
    pub fn start<F>(on_resize: F) -> Result<Option<Self>, Box<dyn Error>>
    where
        F: Fn(TerminalSize) + Send + 'static,
    {
        #[cfg(unix)]
        {
            let mut signals = Signals::new([SIGWINCH])?;
            let handle = signals.handle();
            let thread = thread::Builder::new()
                .name("resize-watcher".to_string())
                .spawn(move || {
                    for _ in signals.forever() {
                        let (cols, rows) = match terminal_size() {
                            Ok(size) => size,
                            Err(_) => continue,
                        };
                        on_resize(TerminalSize::new(rows, cols));
                    }
                })?;
            return Ok(Some(Self { handle, thread }));
        }

        #[cfg(not(unix))]
        {
            let _ = on_resize;
            Ok(None)
        }
    }

    pub fn stop(self) {
        #[cfg(unix)]
        {
            self.handle.close();
            let _ = self.thread.join();
        }
    }
}
