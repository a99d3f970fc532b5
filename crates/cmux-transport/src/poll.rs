//! Readiness polling over raw descriptors.
//!
//! This is the "signal on readable" half of the transport contract: the
//! multiplexer worker waits here for transport readiness, its own wake-up
//! descriptor, or the next retransmission deadline, whichever comes first.

use std::io::ErrorKind;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::error::Result;

/// Events a caller wants to be woken for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READABLE: Self = Self {
        readable: true,
        writable: false,
    };

    pub const READ_WRITE: Self = Self {
        readable: true,
        writable: true,
    };
}

/// Events reported for a descriptor after [`poll`] returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// Peer hung up (socket closed, tty carrier lost).
    pub hangup: bool,
    /// Descriptor error or invalid descriptor.
    pub error: bool,
}

/// One descriptor registration for [`poll`].
#[derive(Debug, Clone, Copy)]
pub struct PollFd {
    fd: RawFd,
    interest: Interest,
    readiness: Readiness,
}

impl PollFd {
    pub fn new(fd: RawFd, interest: Interest) -> Self {
        Self {
            fd,
            interest,
            readiness: Readiness::default(),
        }
    }

    /// Readiness observed by the last [`poll`] call.
    pub fn readiness(&self) -> Readiness {
        self.readiness
    }
}

/// Wait until at least one descriptor is ready or `timeout` elapses.
///
/// `None` waits indefinitely. Returns the number of ready descriptors (0 on
/// timeout). Interrupted waits are restarted.
pub fn poll(fds: &mut [PollFd], timeout: Option<Duration>) -> Result<usize> {
    let mut raw: Vec<libc::pollfd> = fds
        .iter()
        .map(|entry| {
            let mut events = 0;
            if entry.interest.readable {
                events |= libc::POLLIN;
            }
            if entry.interest.writable {
                events |= libc::POLLOUT;
            }
            libc::pollfd {
                fd: entry.fd,
                events,
                revents: 0,
            }
        })
        .collect();

    let timeout_ms = timeout_millis(timeout);

    let ready = loop {
        // SAFETY: `raw` is a live, exclusively borrowed slice of `pollfd`
        // structs and its length is passed alongside the pointer.
        let rc = unsafe { libc::poll(raw.as_mut_ptr(), raw.len() as libc::nfds_t, timeout_ms) };
        if rc >= 0 {
            break rc as usize;
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(err.into());
        }
    };

    for (entry, raw) in fds.iter_mut().zip(raw.iter()) {
        entry.readiness = Readiness {
            readable: raw.revents & libc::POLLIN != 0,
            writable: raw.revents & libc::POLLOUT != 0,
            hangup: raw.revents & libc::POLLHUP != 0,
            error: raw.revents & (libc::POLLERR | libc::POLLNVAL) != 0,
        };
    }

    Ok(ready)
}

fn timeout_millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(timeout) => {
            // Round up so a pending deadline is never polled as "already due".
            let mut millis = timeout.as_millis();
            if Duration::from_millis(millis as u64) < timeout {
                millis += 1;
            }
            millis.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn times_out_without_data() {
        let (left, _right) = UnixStream::pair().unwrap();
        let mut fds = [PollFd::new(left.as_raw_fd(), Interest::READABLE)];

        let ready = poll(&mut fds, Some(Duration::from_millis(5))).unwrap();
        assert_eq!(ready, 0);
        assert!(!fds[0].readiness().readable);
    }

    #[test]
    fn reports_readable_after_write() {
        let (left, mut right) = UnixStream::pair().unwrap();
        right.write_all(b"x").unwrap();
        let mut fds = [PollFd::new(left.as_raw_fd(), Interest::READ_WRITE)];

        let ready = poll(&mut fds, Some(Duration::from_millis(100))).unwrap();
        assert_eq!(ready, 1);
        assert!(fds[0].readiness().readable);
        assert!(fds[0].readiness().writable);
    }

    #[test]
    fn reports_hangup_when_peer_closes() {
        let (left, right) = UnixStream::pair().unwrap();
        drop(right);
        let mut fds = [PollFd::new(left.as_raw_fd(), Interest::READABLE)];

        poll(&mut fds, Some(Duration::from_millis(100))).unwrap();
        let readiness = fds[0].readiness();
        assert!(readiness.readable || readiness.hangup);
    }

    #[test]
    fn timeout_rounds_up_sub_millisecond() {
        assert_eq!(timeout_millis(Some(Duration::from_micros(10))), 1);
        assert_eq!(timeout_millis(Some(Duration::from_millis(300))), 300);
        assert_eq!(timeout_millis(None), -1);
    }
}
