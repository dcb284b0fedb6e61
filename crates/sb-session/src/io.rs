//! Descriptor plumbing shared by the multiplexer and the supervisor:
//! the host input channel, `O_NONBLOCK` management, and the readiness wait.

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::time::Duration;

use tracing::debug;

// ---------------------------------------------------------------------------
// Non-blocking mode
// ---------------------------------------------------------------------------

/// Set `O_NONBLOCK` on `fd`, returning the flags it had before.
pub fn set_nonblocking(fd: RawFd) -> io::Result<libc::c_int> {
    // SAFETY: fcntl with F_GETFL/F_SETFL does not touch memory; an invalid
    // fd is reported through errno.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if flags & libc::O_NONBLOCK == 0 && libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(flags)
    }
}

fn restore_flags(fd: RawFd, flags: libc::c_int) -> io::Result<()> {
    // SAFETY: see `set_nonblocking`.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Puts a descriptor into non-blocking mode and puts the original flags
/// back on [`restore`](Self::restore) or drop.
///
/// Holds its own duplicate of the descriptor, so the open file description
/// stays reachable after the caller's handle is gone. Flags live on the file
/// description, which the host may share with other processes.
#[derive(Debug)]
pub struct NonBlockingGuard {
    fd: OwnedFd,
    original: libc::c_int,
    restored: bool,
}

impl NonBlockingGuard {
    pub fn set(fd: BorrowedFd<'_>) -> io::Result<Self> {
        let fd = fd.try_clone_to_owned()?;
        let original = set_nonblocking(fd.as_raw_fd())?;
        Ok(Self {
            fd,
            original,
            restored: false,
        })
    }

    /// Whether the descriptor was already non-blocking before the guard.
    pub fn was_nonblocking(&self) -> bool {
        self.original & libc::O_NONBLOCK != 0
    }

    pub fn restore(&mut self) {
        if self.restored {
            return;
        }
        self.restored = true;
        if let Err(e) = restore_flags(self.fd.as_raw_fd(), self.original) {
            debug!(error = %e, "failed to restore descriptor flags");
        }
    }
}

impl Drop for NonBlockingGuard {
    fn drop(&mut self) {
        self.restore();
    }
}

// ---------------------------------------------------------------------------
// InputChannel
// ---------------------------------------------------------------------------

/// The host's inbound byte stream (normally stdin).
///
/// Reads go straight to the descriptor; there is no userspace buffer, so
/// readiness reported by `poll` always matches what `read` can return.
#[derive(Debug)]
pub struct InputChannel {
    file: File,
}

impl InputChannel {
    /// Duplicate the process's stdin.
    pub fn stdin() -> io::Result<Self> {
        let fd = io::stdin().as_fd().try_clone_to_owned()?;
        Ok(Self::from_fd(fd))
    }

    pub fn from_fd(fd: OwnedFd) -> Self {
        Self {
            file: File::from(fd),
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl AsFd for InputChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

// ---------------------------------------------------------------------------
// Readiness wait
// ---------------------------------------------------------------------------

/// Wait until any of `fds` is readable or `timeout` elapses.
///
/// `None` entries are skipped and always report `false`. Hang-up and error
/// conditions count as readable so the following `read` observes them.
/// An interrupted wait reports nothing ready.
pub fn wait_readable(fds: &[Option<RawFd>], timeout: Duration) -> io::Result<Vec<bool>> {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .flatten()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();

    let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
    // SAFETY: `pollfds` is a live, correctly sized buffer for the duration
    // of the call.
    let rc = unsafe {
        libc::poll(
            pollfds.as_mut_ptr(),
            pollfds.len() as libc::nfds_t,
            timeout_ms,
        )
    };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(vec![false; fds.len()]);
        }
        return Err(err);
    }

    let ready_mask = libc::POLLIN | libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;
    let mut polled = pollfds.iter();
    Ok(fds
        .iter()
        .map(|fd| match fd {
            Some(_) => polled
                .next()
                .is_some_and(|p| p.revents & ready_mask != 0),
            None => false,
        })
        .collect())
}
