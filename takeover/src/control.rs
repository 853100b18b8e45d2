//! Handshake frames exchanged over the control channel once the descriptors are sent.
//!
//! 1. The predecessor sends the descriptors ([`fd_transfer::send`]).
//! 2. The successor answers [`ControlFrame::Ack`] with the number it received.
//! 3. The predecessor answers [`ControlFrame::Done`], it no longer serves anything.
//!
//! The successor serves only after reading `Done`, the predecessor stops serving only after
//! reading a matching `Ack`.

use std::os::unix::net::UnixStream;
use std::time::Duration;

use fd_transfer::frame::{self, ReadFrameError, WriteFrameError};
use log::trace;
use serde::{Deserialize, Serialize};

/// A handshake frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlFrame {
    /// The successor received this many descriptors.
    Ack {
        /// Number of descriptors received.
        received: usize,
    },
    /// The predecessor gave everything up.
    Done,
}

/// Error type for the control channel.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Failed to configure the channel.
    #[error("Failed to configure the control channel: {0}")]
    Configure(std::io::Error),
    /// Failed to write a frame.
    #[error("Failed to write a control frame: {0}")]
    Write(#[from] WriteFrameError),
    /// Failed to read a frame.
    #[error("Failed to read a control frame: {0}")]
    Read(#[from] ReadFrameError),
    /// The peer sent a frame out of turn.
    #[error("Expected {expected}, received {received:?}.")]
    Unexpected {
        /// What was expected.
        expected: &'static str,
        /// What arrived.
        received: ControlFrame,
    },
}

/// Bounds every blocking operation on `channel` by `timeout`.
///
/// # Errors
///
/// When the timeouts cannot be set.
pub fn bound(channel: &UnixStream, timeout: Duration) -> Result<(), ControlError> {
    channel
        .set_read_timeout(Some(timeout))
        .and_then(|()| channel.set_write_timeout(Some(timeout)))
        .map_err(ControlError::Configure)
}

/// Writes `control_frame` to `channel`.
///
/// # Errors
///
/// When writing fails.
pub fn write(channel: &UnixStream, control_frame: ControlFrame) -> Result<(), ControlError> {
    trace!("writing {:?}", control_frame);
    let mut writer = channel;
    frame::write_frame(&mut writer, &control_frame)?;
    Ok(())
}

/// Reads the acknowledgement of a transfer.
///
/// # Errors
///
/// When reading fails, or the frame is not an [`ControlFrame::Ack`].
pub fn read_ack(channel: &UnixStream) -> Result<usize, ControlError> {
    match read(channel)? {
        ControlFrame::Ack { received } => Ok(received),
        received => Err(ControlError::Unexpected {
            expected: "Ack",
            received,
        }),
    }
}

/// Reads the end of the handshake.
///
/// # Errors
///
/// When reading fails, or the frame is not [`ControlFrame::Done`].
pub fn read_done(channel: &UnixStream) -> Result<(), ControlError> {
    match read(channel)? {
        ControlFrame::Done => Ok(()),
        received => Err(ControlError::Unexpected {
            expected: "Done",
            received,
        }),
    }
}

fn read(channel: &UnixStream) -> Result<ControlFrame, ControlError> {
    let mut reader = channel;
    let control_frame = frame::read_frame(&mut reader)?;
    trace!("read {:?}", control_frame);
    Ok(control_frame)
}
