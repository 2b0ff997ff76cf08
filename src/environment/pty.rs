// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Pseudo-terminals for local environment tasks.
//!
//! The master side is driven asynchronously through [`AsyncFd`]; the slave
//! side is reopened by the child which makes it its controlling terminal.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::PathBuf;

use nix::libc;
use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::unistd;
use tokio::io::unix::AsyncFd;

use crate::shared::error::{Error, ErrorKind, Result};

/// Terminal type if the client did not send one.
pub const DEFAULT_TERM: &str = "xterm-256color";

pub const DEFAULT_COLS: u32 = 80;
pub const DEFAULT_ROWS: u32 = 24;

const MAX_DIMENSION: u32 = u16::MAX as u32;

/// Terminal settings of an SSH `pty-req`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyConfig {
    pub term: String,
    pub col_width: u32,
    pub row_height: u32,
    pub pix_width: u32,
    pub pix_height: u32,
}

impl PtyConfig {
    pub fn new(
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    ) -> Self {
        Self {
            term,
            col_width,
            row_height,
            pix_width,
            pix_height,
        }
    }

    /// Values exceeding `u16::MAX` are clamped.
    pub fn winsize(&self) -> Winsize {
        winsize_of(self.col_width, self.row_height, self.pix_width, self.pix_height)
    }
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            term: DEFAULT_TERM.to_string(),
            col_width: DEFAULT_COLS,
            row_height: DEFAULT_ROWS,
            pix_width: 0,
            pix_height: 0,
        }
    }
}

fn winsize_of(cols: u32, rows: u32, pix_width: u32, pix_height: u32) -> Winsize {
    Winsize {
        ws_row: rows.min(MAX_DIMENSION) as u16,
        ws_col: cols.min(MAX_DIMENSION) as u16,
        ws_xpixel: pix_width.min(MAX_DIMENSION) as u16,
        ws_ypixel: pix_height.min(MAX_DIMENSION) as u16,
    }
}

/// Master side of a PTY pair.
pub struct PtyMaster {
    async_fd: AsyncFd<OwnedFd>,
    slave_path: PathBuf,
}

impl PtyMaster {
    pub fn open(config: &PtyConfig) -> Result<Self> {
        let OpenptyResult {
            master: master_fd,
            slave: slave_fd,
        } = openpty(None, None).map_err(|e| {
            Error::wrap(ErrorKind::System, "cannot open pty", io::Error::from(e))
        })?;

        let slave_path = unistd::ttyname(slave_fd.as_fd()).map_err(|e| {
            Error::wrap(ErrorKind::System, "cannot resolve tty name", io::Error::from(e))
        })?;

        set_window_size_fd(slave_fd.as_fd(), &config.winsize())?;

        // Reopened by the child.
        drop(slave_fd);

        set_nonblocking(master_fd.as_fd())?;

        let async_fd = AsyncFd::new(master_fd)
            .map_err(|e| Error::wrap(ErrorKind::System, "cannot register pty", e))?;

        Ok(Self { async_fd, slave_path })
    }

    pub fn slave_path(&self) -> &PathBuf {
        &self.slave_path
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.async_fd.get_ref().as_raw_fd()
    }

    pub fn resize(&self, cols: u32, rows: u32) -> Result<()> {
        set_window_size_fd(self.async_fd.get_ref().as_fd(), &winsize_of(cols, rows, 0, 0))
    }

    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut ready = self.async_fd.readable().await?;
            let attempt = ready.try_io(|fd| {
                unistd::read(fd.get_ref().as_raw_fd(), buf).map_err(io::Error::from)
            });
            if let Ok(result) = attempt {
                return result;
            }
        }
    }

    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let mut ready = self.async_fd.writable().await?;
            let attempt =
                ready.try_io(|fd| unistd::write(fd.get_ref(), buf).map_err(io::Error::from));
            if let Ok(result) = attempt {
                return result;
            }
        }
    }

    pub async fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write(buf).await? {
                0 => return Err(io::ErrorKind::WriteZero.into()),
                n => buf = &buf[n..],
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for PtyMaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyMaster")
            .field("slave_path", &self.slave_path)
            .field("fd", &self.as_raw_fd())
            .finish()
    }
}

fn set_window_size_fd(fd: BorrowedFd<'_>, winsize: &Winsize) -> Result<()> {
    // SAFETY: The fd is valid and we're passing a valid Winsize struct
    let result = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCSWINSZ, winsize) };
    if result < 0 {
        return Err(Error::wrap(
            ErrorKind::System,
            "cannot set window size",
            io::Error::last_os_error(),
        ));
    }
    Ok(())
}

fn set_nonblocking(fd: BorrowedFd<'_>) -> Result<()> {
    let flags = nix::fcntl::fcntl(fd.as_raw_fd(), nix::fcntl::FcntlArg::F_GETFL)
        .map_err(|e| Error::wrap(ErrorKind::System, "F_GETFL", io::Error::from(e)))?;
    let new_flags = nix::fcntl::OFlag::from_bits_truncate(flags) | nix::fcntl::OFlag::O_NONBLOCK;
    nix::fcntl::fcntl(fd.as_raw_fd(), nix::fcntl::FcntlArg::F_SETFL(new_flags))
        .map_err(|e| Error::wrap(ErrorKind::System, "F_SETFL", io::Error::from(e)))?;
    Ok(())
}
