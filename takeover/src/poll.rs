//! Waiting on several listeners at once.

use std::os::fd::AsRawFd;
use std::time::Duration;

/// Waits up to `timeout` for any of `sources` to become readable, returning which are.
///
/// An interrupted wait reports nothing readable, so a caller polling in a loop gets to check its
/// shutdown flag.
///
/// # Errors
///
/// When `poll` fails.
pub fn readable(sources: &[&dyn AsRawFd], timeout: Duration) -> std::io::Result<Vec<bool>> {
    let mut fds = sources
        .iter()
        .map(|source| libc::pollfd {
            fd: source.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        })
        .collect::<Vec<_>>();
    let timeout = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
    let nfds = libc::nfds_t::try_from(fds.len())
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;

    // SAFETY: `fds` is a valid array of `nfds` `pollfd`s for the duration of the call.
    let ready = unsafe { libc::poll(fds.as_mut_ptr(), nfds, timeout) };
    if ready < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            return Ok(vec![false; fds.len()]);
        }
        return Err(err);
    }
    Ok(fds
        .iter()
        .map(|fd| fd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
        .collect())
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn reports_readable_sources() {
        let (quiet, _quiet_peer) = UnixStream::pair().unwrap();
        let (busy, mut busy_peer) = UnixStream::pair().unwrap();
        let sources: [&dyn AsRawFd; 2] = [&quiet, &busy];
        assert_eq!(
            readable(&sources, Duration::from_millis(10)).unwrap(),
            [false, false]
        );
        busy_peer.write_all(b"x").unwrap();
        assert_eq!(
            readable(&sources, Duration::from_millis(10)).unwrap(),
            [false, true]
        );
    }

    #[test]
    fn nothing_to_poll() {
        assert!(readable(&[], Duration::from_millis(1)).unwrap().is_empty());
    }
}
