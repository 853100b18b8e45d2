#![warn(clippy::pedantic)]

//! A client for the takeover echo server.
//!
//! Connections survive the server handing over to a new process, so a client normally never
//! notices a handoff. [`Client::reconnect`] covers a server which was restarted rather than
//! handed over.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::trace;
use log_derive::logfn;

/// Longest a single write or read may block.
pub const DEADLINE: Duration = Duration::from_secs(10);
/// Most bytes read for one reply.
pub const REPLY_BUFFER: usize = 1024;

/// Error type of a [`Client`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Failed to connect to the server.
    #[error("Failed to connect to `{}`: {source}", path.display())]
    Connect {
        /// Path of the server socket.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Failed to write a request.
    #[error("Failed to write a request: {0}")]
    Write(std::io::Error),
    /// Failed to read a reply.
    #[error("Failed to read a reply: {0}")]
    Read(std::io::Error),
    /// The server closed the connection.
    #[error("The server closed the connection.")]
    Closed,
}

/// A connection to the server.
#[derive(Debug)]
pub struct Client {
    path: PathBuf,
    stream: UnixStream,
}
impl Client {
    /// Connects to the server listening at `path`.
    ///
    /// # Errors
    ///
    /// When failing to connect.
    #[logfn(ok = "TRACE", err = "ERROR")]
    pub fn connect(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let path = path.as_ref().to_path_buf();
        let stream = dial(&path)?;
        Ok(Self { path, stream })
    }

    /// Writes `bytes` in one go and returns what the server replied with in one read.
    ///
    /// # Errors
    ///
    /// When writing or reading fails or takes longer than [`DEADLINE`], or the server closed the
    /// connection.
    #[logfn(ok = "TRACE", err = "WARN")]
    pub fn request(&mut self, bytes: &[u8]) -> Result<Vec<u8>, ClientError> {
        self.stream.write_all(bytes).map_err(ClientError::Write)?;
        let mut buf = [0; REPLY_BUFFER];
        let read = self.stream.read(&mut buf).map_err(ClientError::Read)?;
        if read == 0 {
            return Err(ClientError::Closed);
        }
        trace!("reply: {} bytes", read);
        Ok(buf[..read].to_vec())
    }

    /// Replaces the connection with a fresh one to the same path.
    ///
    /// # Errors
    ///
    /// When failing to connect.
    #[logfn(ok = "TRACE", err = "ERROR")]
    pub fn reconnect(&mut self) -> Result<(), ClientError> {
        self.stream = dial(&self.path)?;
        Ok(())
    }
}

fn dial(path: &Path) -> Result<UnixStream, ClientError> {
    let connect_err = |source| ClientError::Connect {
        path: path.to_path_buf(),
        source,
    };
    let stream = UnixStream::connect(path).map_err(connect_err)?;
    stream
        .set_read_timeout(Some(DEADLINE))
        .and_then(|()| stream.set_write_timeout(Some(DEADLINE)))
        .map_err(connect_err)?;
    Ok(stream)
}
