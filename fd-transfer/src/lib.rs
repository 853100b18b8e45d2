#![warn(clippy::pedantic)]

//! Passing labelled file descriptors between processes over a unix stream socket.
//!
//! A transfer is one or more messages. Each message is a [`frame`] whose body describes the
//! descriptors attached to it:
//!
//! 1. `fd_count`, the number of descriptors attached.
//! 2. `labels`, one label per descriptor, in attachment order.
//! 3. `more`, whether another message of the same transfer follows.
//!
//! The descriptors ride as a single `SCM_RIGHTS` control message on the first byte of the frame.
//! Transfers of more than [`bindings::MAX_FDS`] descriptors are split across messages, the order
//! of descriptors (and their labels) is preserved across the split.

use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use log::{debug, trace};
use log_derive::logfn;
use serde::{Deserialize, Serialize};

/// Wrappers around `libc` socket functions.
pub mod bindings;
pub mod frame;

use frame::{ReadFrameError, WriteFrameError};

/// Access to the raw descriptor backing a connection or listener.
///
/// Implemented for everything implementing [`AsRawFd`], so any socket type can be transferred.
pub trait AsRawDescriptor {
    /// Returns the raw descriptor, ownership is not transferred.
    fn as_raw_descriptor(&self) -> RawFd;
}
impl<T: AsRawFd + ?Sized> AsRawDescriptor for T {
    fn as_raw_descriptor(&self) -> RawFd {
        self.as_raw_fd()
    }
}

/// A descriptor to send along with its label.
pub type Outgoing<'a> = (&'a dyn AsRawDescriptor, &'a str);

/// A received descriptor along with its label.
#[derive(Debug)]
pub struct LabelledFd {
    /// The descriptor, owned by this process.
    pub fd: OwnedFd,
    /// The label the sender attached to it.
    pub label: String,
}

/// Body of one transfer message.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct Header {
    fd_count: usize,
    labels: Vec<String>,
    more: bool,
}

/// Error type for [`send`].
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// Failed to encode a message.
    #[error("Failed to encode a message: {0}")]
    Encode(#[from] WriteFrameError),
    /// Failed to write a message to the channel, the receiver may not have any descriptor.
    #[error("Failed to write a message to the channel: {0}")]
    Io(std::io::Error),
}

/// Error type for [`receive`].
#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    /// Nothing arrived before the read timeout of the channel elapsed.
    #[error("Nothing arrived before the read timeout of the channel elapsed.")]
    Timeout,
    /// The sender closed the channel.
    #[error("The sender closed the channel.")]
    Closed,
    /// The kernel discarded descriptors as they did not fit the control buffer.
    #[error("The kernel discarded descriptors as they did not fit the control buffer.")]
    Truncated,
    /// The number of descriptors does not match the number of labels.
    #[error("Expected {labels} descriptors, received {fds}.")]
    FdCountMismatch {
        /// Number of descriptors described.
        labels: usize,
        /// Number of descriptors received.
        fds: usize,
    },
    /// Failed to decode a message.
    #[error("Failed to decode a message: {0}")]
    Decode(ReadFrameError),
    /// Failed to read from the channel.
    #[error("Failed to read from the channel: {0}")]
    Io(std::io::Error),
}
impl From<std::io::Error> for ReceiveError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut => Self::Timeout,
            ErrorKind::UnexpectedEof => Self::Closed,
            _ => Self::Io(err),
        }
    }
}
impl From<ReadFrameError> for ReceiveError {
    fn from(err: ReadFrameError) -> Self {
        match err {
            ReadFrameError::EndOfStream => Self::Closed,
            ReadFrameError::Timeout => Self::Timeout,
            ReadFrameError::Read(err) => Self::Io(err),
            other => Self::Decode(other),
        }
    }
}

/// Sends `fds` with their labels over `channel`.
///
/// The descriptors stay open in this process. Closing them is up to the caller, once it knows the
/// receiver has them.
///
/// # Errors
///
/// When a message fails to encode or to be written. The caller must then assume no descriptor
/// arrived.
#[logfn(ok = "TRACE", err = "ERROR")]
pub fn send(channel: &UnixStream, fds: &[Outgoing<'_>]) -> Result<(), SendError> {
    // An empty transfer is still one message, so the receiver learns there is nothing.
    let batches = if fds.is_empty() {
        vec![fds]
    } else {
        fds.chunks(bindings::MAX_FDS).collect()
    };
    let last = batches.len() - 1;
    let mut writer = channel;
    for (i, batch) in batches.into_iter().enumerate() {
        let header = Header {
            fd_count: batch.len(),
            labels: batch.iter().map(|(_, label)| (*label).to_owned()).collect(),
            more: i != last,
        };
        trace!("header: {:?}", header);
        let bytes = frame::encode(&header)?;
        let raw = batch
            .iter()
            .map(|(fd, _)| fd.as_raw_descriptor())
            .collect::<Vec<_>>();

        let sent = bindings::send_with_fds(channel.as_raw_fd(), &bytes, &raw)
            .map_err(SendError::Io)?;
        if sent == 0 {
            return Err(SendError::Io(ErrorKind::WriteZero.into()));
        }
        // The control message is attached to the bytes already sent, the remainder goes plain.
        writer
            .write_all(&bytes[sent..])
            .map_err(SendError::Io)?;
        debug!("sent {} descriptors ({} bytes)", raw.len(), bytes.len());
    }
    Ok(())
}

/// Receives one transfer from `channel`.
///
/// Blocks until the whole transfer arrived, bounded by the read timeout of `channel`. When
/// `expected` is given, the transfer must carry exactly that many descriptors.
///
/// # Errors
///
/// When the channel fails, times out or closes, or the transfer is malformed. Descriptors received
/// before the error are closed.
#[logfn(ok = "TRACE", err = "ERROR")]
pub fn receive(channel: &UnixStream, expected: Option<usize>) -> Result<Vec<LabelledFd>, ReceiveError> {
    let mut received = Vec::new();
    loop {
        let (header, fds) = receive_message(channel)?;
        if header.fd_count != header.labels.len() || fds.len() != header.labels.len() {
            return Err(ReceiveError::FdCountMismatch {
                labels: header.labels.len(),
                fds: fds.len(),
            });
        }
        received.extend(
            fds.into_iter()
                .zip(header.labels)
                .map(|(fd, label)| LabelledFd { fd, label }),
        );
        if !header.more {
            break;
        }
    }
    match expected {
        Some(labels) if labels != received.len() => Err(ReceiveError::FdCountMismatch {
            labels,
            fds: received.len(),
        }),
        _ => Ok(received),
    }
}

/// Receives one message of a transfer.
fn receive_message(channel: &UnixStream) -> Result<(Header, Vec<OwnedFd>), ReceiveError> {
    // Only the prefix is read with `recvmsg`, so plain reads never consume bytes carrying the
    // descriptors of a following message.
    let mut prefix = [0; frame::PREFIX];
    let message = bindings::recv_with_fds(channel.as_raw_fd(), &mut prefix)?;
    if message.truncated {
        return Err(ReceiveError::Truncated);
    }
    if message.len == 0 {
        return Err(ReceiveError::Closed);
    }
    let mut reader = channel;
    reader.read_exact(&mut prefix[message.len..])?;
    let header = frame::read_body::<Header>(&mut reader, prefix)?;
    trace!("header: {:?}", header);
    Ok((header, message.fds))
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixListener;
    use std::time::Duration;

    use rand::distributions::Alphanumeric;
    use rand::Rng;

    use super::*;

    static INIT_LOGGER: std::sync::Once = std::sync::Once::new();
    fn init_logger() {
        INIT_LOGGER.call_once(|| simple_logger::init_with_level(log::Level::Trace).unwrap());
    }

    fn random_label() -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect()
    }

    /// Asserts the received descriptor `received` is the other end of `peer`.
    fn assert_connected(received: OwnedFd, peer: &UnixStream, byte: u8) {
        let mut received = UnixStream::from(received);
        received.write_all(&[byte]).unwrap();
        let mut buf = [0];
        let mut peer = peer;
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [byte]);
    }

    #[test]
    fn empty_transfer() {
        init_logger();
        let (a, b) = UnixStream::pair().unwrap();
        send(&a, &[]).unwrap();
        assert!(receive(&b, Some(0)).unwrap().is_empty());
    }

    #[test]
    fn single_descriptor() {
        init_logger();
        let (a, b) = UnixStream::pair().unwrap();
        let (local, peer) = UnixStream::pair().unwrap();

        send(&a, &[(&local, "conn#1")]).unwrap();
        let mut received = receive(&b, Some(1)).unwrap();

        assert_eq!(received.len(), 1);
        let LabelledFd { fd, label } = received.remove(0);
        assert_eq!(label, "conn#1");
        assert_connected(fd, &peer, 7);
    }

    #[test]
    fn labels_keep_their_descriptors() {
        init_logger();
        let (a, b) = UnixStream::pair().unwrap();
        let pairs = (0..5)
            .map(|_| UnixStream::pair().unwrap())
            .collect::<Vec<_>>();
        let labels = (0..pairs.len()).map(|_| random_label()).collect::<Vec<_>>();
        let outgoing = pairs
            .iter()
            .zip(&labels)
            .map(|((local, _), label)| (local as &dyn AsRawDescriptor, label.as_str()))
            .collect::<Vec<_>>();

        send(&a, &outgoing).unwrap();
        let received = receive(&b, None).unwrap();

        assert_eq!(
            received.iter().map(|r| r.label.as_str()).collect::<Vec<_>>(),
            labels.iter().map(String::as_str).collect::<Vec<_>>()
        );
        for (i, (labelled, (_, peer))) in received.into_iter().zip(&pairs).enumerate() {
            assert_connected(labelled.fd, peer, u8::try_from(i).unwrap());
        }
    }

    #[test]
    fn mixed_socket_types() {
        init_logger();
        let path = std::env::temp_dir().join(format!("fd-transfer-{}.sock", random_label()));
        let listener = UnixListener::bind(&path).unwrap();
        let (local, _peer) = UnixStream::pair().unwrap();
        let (a, b) = UnixStream::pair().unwrap();

        let outgoing: [Outgoing<'_>; 2] = [(&listener, "listener"), (&local, "conn#1")];
        send(&a, &outgoing).unwrap();
        let mut received = receive(&b, Some(2)).unwrap();

        let inherited = UnixListener::from(received.remove(0).fd);
        assert_eq!(
            inherited.local_addr().unwrap().as_pathname(),
            Some(path.as_path())
        );
        assert_eq!(received[0].label, "conn#1");
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn large_transfers_are_batched() {
        init_logger();
        const COUNT: usize = bindings::MAX_FDS + 47;
        let (a, b) = UnixStream::pair().unwrap();
        let (local, peer) = UnixStream::pair().unwrap();
        let labels = (0..COUNT).map(|i| format!("conn#{i}")).collect::<Vec<_>>();
        let outgoing = labels
            .iter()
            .map(|label| (&local as &dyn AsRawDescriptor, label.as_str()))
            .collect::<Vec<_>>();

        // The receiving side must be drained concurrently, the transfer may exceed the socket buffer.
        let receiver = std::thread::spawn(move || receive(&b, Some(COUNT)).unwrap());
        send(&a, &outgoing).unwrap();
        let received = receiver.join().unwrap();

        assert_eq!(
            received.iter().map(|r| r.label.clone()).collect::<Vec<_>>(),
            labels
        );
        let last = received.into_iter().last().unwrap();
        assert_connected(last.fd, &peer, 1);
    }

    #[test]
    fn sender_keeps_its_descriptor() {
        init_logger();
        let (a, b) = UnixStream::pair().unwrap();
        let (local, peer) = UnixStream::pair().unwrap();

        send(&a, &[(&local, "conn#1")]).unwrap();
        let received = receive(&b, Some(1)).unwrap();

        // If the sender descriptor got closed, fcntl(F_GETFD) would return -1 with EBADF.
        // SAFETY:
        // `local` is open for the duration of the call.
        let flags = unsafe { libc::fcntl(local.as_raw_fd(), libc::F_GETFD) };
        assert_ne!(flags, -1, "sender descriptor unexpectedly closed");
        drop(received);

        let mut local = &local;
        local.write_all(b"x").unwrap();
        let mut buf = [0];
        let mut peer = &peer;
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"x");
    }

    #[test]
    fn closing_both_copies_closes_the_socket() {
        init_logger();
        let (a, b) = UnixStream::pair().unwrap();
        let (local, peer) = UnixStream::pair().unwrap();

        send(&a, &[(&local, "conn#1")]).unwrap();
        let received = receive(&b, Some(1)).unwrap();
        drop(local);

        // One reference is left, the peer must not see the end of the stream yet.
        peer.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        let mut buf = [0];
        let mut reader = &peer;
        assert!(matches!(
            reader.read(&mut buf),
            Err(err) if err.kind() == ErrorKind::WouldBlock
        ));

        drop(received);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn fewer_descriptors_than_labels() {
        init_logger();
        let (a, b) = UnixStream::pair().unwrap();
        let (local, _peer) = UnixStream::pair().unwrap();
        let header = Header {
            fd_count: 2,
            labels: vec![String::from("conn#1"), String::from("conn#2")],
            more: false,
        };
        let bytes = frame::encode(&header).unwrap();
        let sent = bindings::send_with_fds(a.as_raw_fd(), &bytes, &[local.as_raw_fd()]).unwrap();
        (&a).write_all(&bytes[sent..]).unwrap();

        assert!(matches!(
            receive(&b, None),
            Err(ReceiveError::FdCountMismatch { labels: 2, fds: 1 })
        ));
    }

    #[test]
    fn unexpected_count() {
        init_logger();
        let (a, b) = UnixStream::pair().unwrap();
        let (local, _peer) = UnixStream::pair().unwrap();
        send(&a, &[(&local, "conn#1")]).unwrap();
        assert!(matches!(
            receive(&b, Some(2)),
            Err(ReceiveError::FdCountMismatch { labels: 2, fds: 1 })
        ));
    }

    #[test]
    fn receive_times_out() {
        init_logger();
        let (_a, b) = UnixStream::pair().unwrap();
        b.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
        assert!(matches!(receive(&b, None), Err(ReceiveError::Timeout)));
    }

    #[test]
    fn receive_from_closed_channel() {
        init_logger();
        let (a, b) = UnixStream::pair().unwrap();
        drop(a);
        assert!(matches!(receive(&b, None), Err(ReceiveError::Closed)));
    }

    #[test]
    fn send_to_closed_channel() {
        init_logger();
        let (a, b) = UnixStream::pair().unwrap();
        let (local, _peer) = UnixStream::pair().unwrap();
        drop(b);
        assert!(matches!(
            send(&a, &[(&local, "conn#1")]),
            Err(SendError::Io(_))
        ));
        // The failed send leaves our descriptor untouched.
        // SAFETY:
        // `local` is open for the duration of the call.
        assert_ne!(unsafe { libc::fcntl(local.as_raw_fd(), libc::F_GETFD) }, -1);
    }

    #[test]
    fn received_descriptors_are_close_on_exec() {
        init_logger();
        let (a, b) = UnixStream::pair().unwrap();
        let (local, _peer) = UnixStream::pair().unwrap();
        send(&a, &[(&local, "conn#1")]).unwrap();
        let received = receive(&b, Some(1)).unwrap();
        // SAFETY:
        // The received descriptor is open for the duration of the call.
        let flags = unsafe { libc::fcntl(received[0].fd.as_raw_fd(), libc::F_GETFD) };
        assert_eq!(flags & libc::FD_CLOEXEC, libc::FD_CLOEXEC);
    }
}
