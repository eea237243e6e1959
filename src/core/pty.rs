//! POSIX pseudo-terminal allocation
//!
//! Opens a master with `posix_openpt`, grants and unlocks it, resolves the
//! slave path and opens the slave. Both ends are owned file handles, so each
//! descriptor is closed exactly once when its owner drops it, including on
//! every early-return path of [`PtyPair::allocate`].

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::pty::{grantpt, posix_openpt, unlockpt, PtyMaster};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open PTY master: {0}")]
    OpenMaster(#[source] Errno),

    #[error("failed to grant PTY: {0}")]
    Grant(#[source] Errno),

    #[error("failed to unlock PTY: {0}")]
    Unlock(#[source] Errno),

    #[error("failed to resolve PTY slave name: {0}")]
    SlaveName(#[source] Errno),

    #[error("failed to open PTY slave {path}: {source}")]
    OpenSlave {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to configure PTY: {0}")]
    Configure(#[source] Errno),

    #[error("failed to resize PTY: {0}")]
    Resize(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, PtyError>;

/// Terminal dimensions in character cells
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PtySize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for PtySize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// A master/slave pseudo-terminal pair
#[derive(Debug)]
pub struct PtyPair {
    master: File,
    slave: File,
    slave_path: String,
}

impl PtyPair {
    /// Allocate a new pseudo-terminal pair
    pub fn allocate(size: PtySize) -> Result<Self> {
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).map_err(PtyError::OpenMaster)?;
        grantpt(&master).map_err(PtyError::Grant)?;
        unlockpt(&master).map_err(PtyError::Unlock)?;
        let slave_path = slave_name(&master)?;

        // Children must only ever see the slave
        fcntl(master.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
            .map_err(PtyError::Configure)?;

        let slave = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(&slave_path)
            .map_err(|source| PtyError::OpenSlave {
                path: slave_path.clone(),
                source,
            })?;

        // SAFETY: `into_raw_fd` hands over sole ownership of a valid open
        // descriptor, which is immediately wrapped again.
        let master = File::from(unsafe { OwnedFd::from_raw_fd(master.into_raw_fd()) });

        let pair = Self {
            master,
            slave,
            slave_path,
        };
        pair.resize(size)?;
        debug!(
            master = pair.master.as_raw_fd(),
            slave = %pair.slave_path,
            "allocated PTY"
        );
        Ok(pair)
    }

    /// Set the window size seen by programs on the slave side
    pub fn resize(&self, size: PtySize) -> Result<()> {
        set_window_size(&self.master, size)
    }

    #[cfg(test)]
    pub fn slave_path(&self) -> &str {
        &self.slave_path
    }

    #[cfg(test)]
    pub fn master(&self) -> &File {
        &self.master
    }

    #[cfg(test)]
    pub fn slave(&self) -> &File {
        &self.slave
    }

    /// Split into owned master and slave handles
    pub fn into_parts(self) -> (File, File) {
        (self.master, self.slave)
    }
}

/// Apply `TIOCSWINSZ` to a PTY descriptor
pub fn set_window_size(fd: &impl AsRawFd, size: PtySize) -> Result<()> {
    let winsize = libc::winsize {
        ws_row: size.rows,
        ws_col: size.cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: the descriptor is open for the duration of the call and
    // `winsize` outlives it.
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCSWINSZ as _, &winsize) };
    if rc < 0 {
        return Err(PtyError::Resize(io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn slave_name(master: &PtyMaster) -> Result<String> {
    nix::pty::ptsname_r(master).map_err(PtyError::SlaveName)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn slave_name(master: &PtyMaster) -> Result<String> {
    // SAFETY: only called while holding the allocation path; no other
    // thread in this crate calls `ptsname`.
    unsafe { nix::pty::ptsname(master) }.map_err(PtyError::SlaveName)
}
