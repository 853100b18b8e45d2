//! Length prefixed `bincode` frames.
//!
//! A frame consists of:
//! 1. The length of the body as a little endian `u32`.
//! 2. The body, a `bincode` serialized value.

use std::io::{ErrorKind, Read, Write};
use std::mem::size_of;

use log::trace;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Size of the length description of a frame.
pub const PREFIX: usize = size_of::<u32>();

/// The largest body we accept, anything above this is treated as a corrupt stream.
pub const MAX_BODY: usize = 16 * 1024 * 1024;

/// Error type for [`read_frame`].
#[derive(Debug, thiserror::Error)]
pub enum ReadFrameError {
    /// The stream ended before a full frame was read.
    #[error("The stream ended before a full frame was read.")]
    EndOfStream,
    /// No frame arrived before the read timeout of the stream elapsed.
    #[error("No frame arrived before the read timeout of the stream elapsed.")]
    Timeout,
    /// The frame describes a body larger than [`MAX_BODY`].
    #[error("The frame describes a body of {0} bytes, larger than {MAX_BODY}.")]
    InvalidLength(usize),
    /// Failed to read the frame from the stream.
    #[error("Failed to read the frame from the stream: {0}")]
    Read(std::io::Error),
    /// Failed to deserialize the body.
    #[error("Failed to deserialize the body: {0}")]
    Deserialize(#[from] bincode::Error),
}
impl From<std::io::Error> for ReadFrameError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            ErrorKind::UnexpectedEof => Self::EndOfStream,
            ErrorKind::WouldBlock | ErrorKind::TimedOut => Self::Timeout,
            _ => Self::Read(err),
        }
    }
}

/// Error type for [`write_frame`].
#[derive(Debug, thiserror::Error)]
pub enum WriteFrameError {
    /// Failed to serialize the body.
    #[error("Failed to serialize the body: {0}")]
    Serialize(#[from] bincode::Error),
    /// The body is larger than [`MAX_BODY`].
    #[error("The body is {0} bytes, larger than {MAX_BODY}.")]
    TooLarge(usize),
    /// Failed to write all data to the stream.
    #[error("Failed to write all data to the stream: {0}")]
    Write(std::io::Error),
}

/// Serializes `value` into a complete frame.
///
/// # Errors
///
/// When `value` fails to serialize or is too large.
pub fn encode(value: &impl Serialize) -> Result<Vec<u8>, WriteFrameError> {
    let body = bincode::serialize(value)?;
    let length = u32::try_from(body.len())
        .ok()
        .filter(|&length| length as usize <= MAX_BODY)
        .ok_or(WriteFrameError::TooLarge(body.len()))?;
    let mut bytes = Vec::with_capacity(PREFIX + body.len());
    bytes.extend(length.to_le_bytes());
    bytes.extend(body);
    Ok(bytes)
}

/// Reads the body length from a frame prefix.
///
/// # Errors
///
/// When the length exceeds [`MAX_BODY`].
pub fn body_length(prefix: [u8; PREFIX]) -> Result<usize, ReadFrameError> {
    let length = u32::from_le_bytes(prefix) as usize;
    if length > MAX_BODY {
        return Err(ReadFrameError::InvalidLength(length));
    }
    Ok(length)
}

/// Reads exactly one body, following an already read prefix.
///
/// # Errors
///
/// When the stream fails or ends, or the body fails to deserialize.
pub fn read_body<T: DeserializeOwned>(
    reader: &mut impl Read,
    prefix: [u8; PREFIX],
) -> Result<T, ReadFrameError> {
    // We size `body` to exactly the length so we only read this frame, and not into the next one.
    let mut body = vec![0; body_length(prefix)?];
    reader.read_exact(&mut body)?;
    trace!("body: {} bytes", body.len());
    Ok(bincode::deserialize(&body)?)
}

/// Reads one frame from `reader`.
///
/// # Errors
///
/// When the stream fails or ends, or the body fails to deserialize.
pub fn read_frame<T: DeserializeOwned>(reader: &mut impl Read) -> Result<T, ReadFrameError> {
    let mut prefix = [0; PREFIX];
    reader.read_exact(&mut prefix)?;
    read_body(reader, prefix)
}

/// Writes `value` as one frame to `writer`.
///
/// # Errors
///
/// When `value` fails to serialize or the stream fails.
pub fn write_frame(writer: &mut impl Write, value: &impl Serialize) -> Result<(), WriteFrameError> {
    let bytes = encode(value)?;
    trace!("write_bytes: {} bytes", bytes.len());
    writer.write_all(&bytes).map_err(WriteFrameError::Write)
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn frames_follow_each_other() {
        let mut bytes = Vec::new();
        write_frame(&mut bytes, &String::from("first")).unwrap();
        write_frame(&mut bytes, &7u64).unwrap();

        let mut reader = Cursor::new(bytes);
        assert_eq!(read_frame::<String>(&mut reader).unwrap(), "first");
        assert_eq!(read_frame::<u64>(&mut reader).unwrap(), 7);
        assert!(matches!(
            read_frame::<u64>(&mut reader),
            Err(ReadFrameError::EndOfStream)
        ));
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut bytes = Vec::from(u32::MAX.to_le_bytes());
        bytes.extend([0; 8]);
        assert!(matches!(
            read_frame::<u64>(&mut Cursor::new(bytes)),
            Err(ReadFrameError::InvalidLength(length)) if length == u32::MAX as usize
        ));
    }

    #[test]
    fn truncated_body_is_end_of_stream() {
        let mut bytes = encode(&String::from("truncated")).unwrap();
        bytes.truncate(bytes.len() - 2);
        assert!(matches!(
            read_frame::<String>(&mut Cursor::new(bytes)),
            Err(ReadFrameError::EndOfStream)
        ));
    }
}
