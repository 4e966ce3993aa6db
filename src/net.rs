//! Readiness polling shared by the dispatcher loops and the child-pipe
//! drain. Thin wrapper over `poll(2)` via `nix`.

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::io;
use std::os::fd::{BorrowedFd, RawFd};

/// Readiness of one polled descriptor.
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub fd: RawFd,
    pub readable: bool,
    pub hangup: bool,
}

impl Readiness {
    pub fn actionable(&self) -> bool {
        self.readable || self.hangup
    }
}

/// Poll `fds` for readability for at most `timeout_ms` milliseconds.
///
/// Returns one entry per input fd, in order. An empty slice just sleeps
/// out the timeout, which keeps tick-driven callers uniform.
pub fn poll_readable(fds: &[RawFd], timeout_ms: u16) -> io::Result<Vec<Readiness>> {
    if fds.is_empty() {
        std::thread::sleep(std::time::Duration::from_millis(timeout_ms as u64));
        return Ok(Vec::new());
    }

    // The fds are owned by the caller's sockets/pipes, which outlive this
    // call; borrowing them raw is sound for the duration of the poll.
    let borrowed: Vec<BorrowedFd<'_>> = fds
        .iter()
        .map(|&fd| unsafe { BorrowedFd::borrow_raw(fd) })
        .collect();
    let mut poll_fds: Vec<PollFd> = borrowed
        .iter()
        .map(|fd| PollFd::new(*fd, PollFlags::POLLIN))
        .collect();

    loop {
        match poll(&mut poll_fds, PollTimeout::from(timeout_ms)) {
            Ok(_) => break,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from(e)),
        }
    }

    Ok(poll_fds
        .iter()
        .zip(fds)
        .map(|(pfd, &fd)| {
            let revents = pfd.revents().unwrap_or(PollFlags::empty());
            Readiness {
                fd,
                readable: revents.contains(PollFlags::POLLIN),
                hangup: revents.intersects(
                    PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL,
                ),
            }
        })
        .collect())
}
