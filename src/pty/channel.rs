use std::io::{self, Read, Write};

use parking_lot::Mutex;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize, SlavePty};
use serde::{Deserialize, Serialize};

use crate::pty::error::PtyError;

/// Terminal geometry in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub rows: u16,
    pub cols: u16,
}

impl TerminalSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    pub fn is_valid(&self) -> bool {
        self.rows > 0 && self.cols > 0
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl From<TerminalSize> for PtySize {
    fn from(size: TerminalSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

impl From<PtySize> for TerminalSize {
    fn from(size: PtySize) -> Self {
        Self {
            rows: size.rows,
            cols: size.cols,
        }
    }
}

/// Controller side of one pseudo-terminal pair.
///
/// Owns the master end and its input writer. The slave end is handed out
/// once by [`PtyChannel::open`] and consumed by process spawn.
pub struct PtyChannel {
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
}

/// Terminal side of a pair, bound to a child as its controlling terminal.
pub struct PtySlave {
    inner: Box<dyn SlavePty + Send>,
}

/// Blocking byte stream drained from the master side.
pub struct PtyReader {
    inner: Box<dyn Read + Send>,
}

impl PtyChannel {
    pub fn open(size: TerminalSize) -> Result<(Self, PtySlave), PtyError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(size.into())
            .map_err(|err| PtyError::Allocation { source: err.into() })?;
        let writer = pair.master.take_writer().map_err(PtyError::setup)?;

        let channel = Self {
            master: Mutex::new(Some(pair.master)),
            writer: Mutex::new(Some(writer)),
        };
        Ok((channel, PtySlave { inner: pair.slave }))
    }

    pub fn take_reader(&self) -> Result<PtyReader, PtyError> {
        let master = self.master.lock();
        let master = master.as_ref().ok_or(PtyError::Closed)?;
        let inner = master.try_clone_reader().map_err(PtyError::setup)?;
        Ok(PtyReader { inner })
    }

    pub fn write(&self, bytes: &[u8]) -> Result<(), PtyError> {
        let mut writer = self.writer.lock();
        let writer = writer.as_mut().ok_or(PtyError::Closed)?;
        writer.write_all(bytes)?;
        writer.flush()?;
        Ok(())
    }

    pub fn resize(&self, size: TerminalSize) -> Result<(), PtyError> {
        let master = self.master.lock();
        let master = master.as_ref().ok_or(PtyError::Closed)?;
        master
            .resize(size.into())
            .map_err(|err| PtyError::Resize {
                rows: size.rows,
                cols: size.cols,
                source: err.into(),
            })
    }

    /// Dimensions as currently reported by the OS.
    pub fn size(&self) -> Result<TerminalSize, PtyError> {
        let master = self.master.lock();
        let master = master.as_ref().ok_or(PtyError::Closed)?;
        let size = master.get_size().map_err(PtyError::setup)?;
        Ok(size.into())
    }

    /// Release the writer and the master. Idempotent.
    pub fn close(&self) {
        self.writer.lock().take();
        self.master.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.master.lock().is_none()
    }
}

impl PtySlave {
    pub(crate) fn spawn_command(
        &self,
        cmd: CommandBuilder,
    ) -> anyhow::Result<Box<dyn portable_pty::Child + Send + Sync>> {
        self.inner.spawn_command(cmd)
    }
}

impl PtyReader {
    /// Read the next chunk. `Ok(0)` means the terminal has closed.
    ///
    /// On Linux a master read fails with `EIO` once every slave descriptor
    /// is gone; that is reported as end of stream rather than an error.
    pub fn read_chunk(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.inner.read(buffer) {
                Ok(count) => return Ok(count),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                #[cfg(unix)]
                Err(err) if err.raw_os_error() == Some(libc::EIO) => return Ok(0),
                Err(err) => return Err(err),
            }
        }
    }
}
