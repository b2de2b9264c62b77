//! Single readiness wait over the waker and the registered sockets.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Result of one readiness wait
#[derive(Debug, Default)]
pub(crate) struct Ready {
    pub(crate) woken: bool,
    pub(crate) readable: Vec<RawFd>,
    pub(crate) writable: Vec<RawFd>,
}

/// Block until a descriptor is ready or `timeout` elapses (`None` waits forever)
///
/// Invalid descriptors are reported ready so their callbacks fail and get removed.
pub(crate) fn poll(
    waker: RawFd,
    read_fds: &[RawFd],
    write_fds: &[RawFd],
    timeout: Option<Duration>,
) -> io::Result<Ready> {
    let mut fds = Vec::with_capacity(1 + read_fds.len() + write_fds.len());
    fds.push(libc::pollfd {
        fd: waker,
        events: libc::POLLIN,
        revents: 0,
    });
    for &fd in read_fds {
        fds.push(libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        });
    }
    for &fd in write_fds {
        fds.push(libc::pollfd {
            fd,
            events: libc::POLLOUT,
            revents: 0,
        });
    }

    let timeout_ms = match timeout {
        None => -1,
        Some(d) => {
            // Round up so a timer is never polled for a moment before it is due
            let ms = d.as_nanos().div_ceil(1_000_000);
            i32::try_from(ms).unwrap_or(i32::MAX)
        }
    };

    // SAFETY: This is safe because:
    // 1. fds is a live, properly initialized Vec of pollfd for the duration of the call
    // 2. the length passed matches the Vec's length
    // 3. revents is only read after a successful return
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut ready = Ready {
        woken: fds[0].revents & libc::POLLIN != 0,
        ..Default::default()
    };
    let failed = libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;
    for pfd in &fds[1..1 + read_fds.len()] {
        if pfd.revents & (libc::POLLIN | failed) != 0 {
            ready.readable.push(pfd.fd);
        }
    }
    for pfd in &fds[1 + read_fds.len()..] {
        if pfd.revents & (libc::POLLOUT | failed) != 0 {
            ready.writable.push(pfd.fd);
        }
    }
    Ok(ready)
}
