//! Deciding whether this process takes over from a running one, or is the first of its line.

use std::io::ErrorKind;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use log::{info, warn};
use log_derive::logfn;

/// Which side of a handoff this process is on, decided once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    /// No process was serving, this one binds the sockets itself.
    Predecessor,
    /// A process is serving, this one takes over its sockets.
    Successor,
}

/// Error type for [`probe_role`] and [`HandoffEndpoint::establish`].
#[derive(Debug, thiserror::Error)]
pub enum RoleError {
    /// The control socket path could neither be found nor ruled out.
    #[error("Failed to inspect control socket `{}`: {source}", path.display())]
    Probe {
        /// Path of the control socket.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Failed to bind the control socket.
    #[error("Failed to bind control socket `{}`: {source}", path.display())]
    Bind {
        /// Path of the control socket.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Failed to connect to the control socket of the running process.
    #[error("Failed to connect to control socket `{}`: {source}", path.display())]
    Dial {
        /// Path of the control socket.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
}

/// Decides the role for the control socket at `path`, without touching the filesystem.
///
/// # Errors
///
/// When the existence of `path` cannot be determined.
pub fn probe_role(path: &Path) -> Result<ProcessRole, RoleError> {
    match std::fs::symlink_metadata(path) {
        Ok(_) => Ok(ProcessRole::Successor),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(ProcessRole::Predecessor),
        Err(source) => Err(RoleError::Probe {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// This process' end of the control channel.
#[derive(Debug)]
pub struct HandoffEndpoint {
    role: ProcessRole,
    path: PathBuf,
    control_listener: Option<UnixListener>,
    control_conn: Option<UnixStream>,
}

impl HandoffEndpoint {
    /// Determines the role of this process and opens its end of the control channel.
    ///
    /// When `path` is absent this process is the [`ProcessRole::Predecessor`] and listens on
    /// `path`. When present, this process is the [`ProcessRole::Successor`] and connects to it. A
    /// present `path` nobody listens on is left over from a process which is gone, it is removed
    /// and this process becomes the predecessor.
    ///
    /// # Errors
    ///
    /// When the role cannot be determined or the control socket cannot be bound or connected to.
    #[logfn(ok = "TRACE", err = "ERROR")]
    pub fn establish(path: &Path) -> Result<Self, RoleError> {
        match probe_role(path)? {
            ProcessRole::Predecessor => Self::listen(path),
            ProcessRole::Successor => match UnixStream::connect(path) {
                Ok(conn) => {
                    info!("connected to running process at {}", path.display());
                    Ok(Self {
                        role: ProcessRole::Successor,
                        path: path.to_path_buf(),
                        control_listener: None,
                        control_conn: Some(conn),
                    })
                }
                Err(err) if err.kind() == ErrorKind::ConnectionRefused => {
                    warn!("removing stale control socket {}", path.display());
                    std::fs::remove_file(path).map_err(|source| RoleError::Bind {
                        path: path.to_path_buf(),
                        source,
                    })?;
                    Self::listen(path)
                }
                Err(source) => Err(RoleError::Dial {
                    path: path.to_path_buf(),
                    source,
                }),
            },
        }
    }

    fn listen(path: &Path) -> Result<Self, RoleError> {
        let bind_err = |source| RoleError::Bind {
            path: path.to_path_buf(),
            source,
        };
        let listener = UnixListener::bind(path).map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;
        info!("listening for successors at {}", path.display());
        Ok(Self {
            role: ProcessRole::Predecessor,
            path: path.to_path_buf(),
            control_listener: Some(listener),
            control_conn: None,
        })
    }

    /// The role decided at startup.
    #[must_use]
    pub const fn role(&self) -> ProcessRole {
        self.role
    }

    /// Path of the control socket.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The listener successors connect to, if this process accepts them.
    #[must_use]
    pub const fn control_listener(&self) -> Option<&UnixListener> {
        self.control_listener.as_ref()
    }

    /// Takes the control connection dialed at startup.
    pub fn take_control_conn(&mut self) -> Option<UnixStream> {
        self.control_conn.take()
    }

    /// Accepts a pending successor, `None` when there is none.
    ///
    /// # Errors
    ///
    /// When accepting fails.
    pub fn accept_successor(&self) -> std::io::Result<Option<UnixStream>> {
        let Some(listener) = &self.control_listener else {
            return Ok(None);
        };
        match listener.accept() {
            Ok((conn, _)) => {
                // Accepted sockets do not inherit non-blocking mode, but be explicit.
                conn.set_nonblocking(false)?;
                Ok(Some(conn))
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Replaces the control socket of the process this one took over from with its own, so a
    /// later process can take over from this one.
    ///
    /// A process started between the previous process exiting and this call returning finds no
    /// one accepting on the control socket and decides to be the first of its line. Binding the
    /// business socket then fails for it, as this process still accepts there, but its control
    /// socket may have displaced this one, leaving this process without successors.
    ///
    /// # Errors
    ///
    /// When the old socket cannot be removed or the new one cannot be bound.
    #[logfn(ok = "TRACE", err = "ERROR")]
    pub fn rearm(&mut self) -> Result<(), RoleError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(source) => {
                return Err(RoleError::Bind {
                    path: self.path.clone(),
                    source,
                })
            }
        }
        let rearmed = Self::listen(&self.path)?;
        self.control_listener = rearmed.control_listener;
        self.control_conn = None;
        Ok(())
    }

    /// Closes the control channel, removing the socket file when this process owns it.
    pub fn close(self) {
        if self.control_listener.is_some() {
            if let Err(err) = std::fs::remove_file(&self.path) {
                warn!("failed to remove control socket {}: {}", self.path.display(), err);
            }
        }
    }
}
