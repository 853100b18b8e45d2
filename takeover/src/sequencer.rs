//! The two sides of a handoff as explicit state machines.
//!
//! Predecessor: `Serving → Freezing → Transferring → Draining → Exited`, back to `Serving` when a
//! handoff fails at any point before it is committed.
//!
//! Successor: `AwaitingHandoff → Receiving → Resuming → Serving`.
//!
//! The predecessor stops accepting before it freezes, the successor starts accepting only after
//! the predecessor committed (see [`crate::control`]), so the two never accept at the same time.

use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;
use std::time::Duration;

use fd_transfer::frame::ReadFrameError;
use fd_transfer::{AsRawDescriptor, LabelledFd, Outgoing, ReceiveError, SendError};
use log::{info, warn};
use log_derive::logfn;

use crate::control::{self, ControlError, ControlFrame};
use crate::registry::FreezeError;
use crate::server::{ConnectionHandler, Server, Settings};

/// Label of the business listener in a transfer.
pub const LISTENER_LABEL: &str = "listener";

/// States of the process being replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredecessorState {
    /// Accepting and serving.
    Serving,
    /// Not accepting, handlers parked.
    Freezing,
    /// Sending descriptors and awaiting the successor's acknowledgement.
    Transferring,
    /// Committed, releasing this process' copies.
    Draining,
    /// Nothing left to serve.
    Exited,
}

/// States of the process taking over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccessorState {
    /// Connected to the predecessor, nothing received yet.
    AwaitingHandoff,
    /// Receiving descriptors.
    Receiving,
    /// The predecessor committed, rebuilding the listener and connections.
    Resuming,
    /// Accepting and serving.
    Serving,
}

/// Error type for handoff transitions.
#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    /// The operation is not valid in the current state.
    #[error("Cannot {operation} while {state}.")]
    InvalidTransition {
        /// The current state.
        state: String,
        /// The operation attempted.
        operation: &'static str,
    },
    /// Handlers could not be parked.
    #[error("Failed to freeze connections: {0}")]
    Freeze(#[from] FreezeError),
    /// Failed to duplicate the listener for transfer.
    #[error("Failed to duplicate the listener: {0}")]
    Duplicate(std::io::Error),
    /// Failed to send the descriptors.
    #[error("Failed to send descriptors: {0}")]
    Send(#[from] SendError),
    /// Failed to receive the descriptors.
    #[error("Failed to receive descriptors: {0}")]
    Receive(#[from] ReceiveError),
    /// The handshake failed.
    #[error("Handshake failed: {0}")]
    Control(#[from] ControlError),
    /// The successor acknowledged a different number of descriptors than were sent.
    #[error("Sent {sent} descriptors, {acknowledged} acknowledged.")]
    AckMismatch {
        /// Descriptors sent.
        sent: usize,
        /// Descriptors acknowledged.
        acknowledged: usize,
    },
    /// The transfer did not carry exactly one listener.
    #[error("Expected one `{LISTENER_LABEL}` descriptor, received {found}.")]
    Listener {
        /// Number of listeners received.
        found: usize,
    },
    /// The predecessor hung up instead of committing, it still serves everything.
    #[error("The predecessor abandoned the handoff.")]
    Aborted,
    /// Failed to resume serving on the received descriptors.
    #[error("Failed to resume serving: {0}")]
    Resume(std::io::Error),
}

fn invalid(state: impl std::fmt::Debug, operation: &'static str) -> HandoffError {
    HandoffError::InvalidTransition {
        state: format!("{state:?}"),
        operation,
    }
}

/// The serving side, which a successor takes over from.
#[derive(Debug)]
pub struct Predecessor {
    state: PredecessorState,
    server: Server,
    timeout: Duration,
}

impl Predecessor {
    /// Wraps a serving `server`, bounding each handoff step by `timeout`.
    #[must_use]
    pub const fn new(server: Server, timeout: Duration) -> Self {
        Self {
            state: PredecessorState::Serving,
            server,
            timeout,
        }
    }

    /// The current state.
    #[must_use]
    pub const fn state(&self) -> PredecessorState {
        self.state
    }

    /// The business server.
    #[must_use]
    pub const fn server(&self) -> &Server {
        &self.server
    }

    /// Gives up the business server, for shutting down.
    #[must_use]
    pub fn into_server(self) -> Server {
        self.server
    }

    /// Accepts pending clients, only while [`PredecessorState::Serving`].
    ///
    /// # Errors
    ///
    /// When accepting fails.
    pub fn accept_pending(&mut self) -> std::io::Result<usize> {
        match self.state {
            PredecessorState::Serving => self.server.accept_pending(),
            _ => Ok(0),
        }
    }

    /// `Serving → Freezing`: stops accepting and parks every connection handler.
    ///
    /// # Errors
    ///
    /// When not serving, or handlers stay busy past the timeout (the predecessor keeps serving).
    #[logfn(ok = "TRACE", err = "WARN")]
    pub fn freeze(&mut self) -> Result<(), HandoffError> {
        if self.state != PredecessorState::Serving {
            return Err(invalid(self.state, "freeze"));
        }
        self.state = PredecessorState::Freezing;
        if let Err(err) = self.server.registry().freeze(self.timeout) {
            self.state = PredecessorState::Serving;
            return Err(err.into());
        }
        info!("frozen, {} connections", self.server.registry().len());
        Ok(())
    }

    /// `Freezing → Transferring → Draining`: sends the listener and every connection over
    /// `control` and completes the handshake, returning the number of connections handed off.
    ///
    /// # Errors
    ///
    /// When not frozen, or the transfer or handshake fails. On failure the predecessor is serving
    /// again with all of its connections.
    #[logfn(ok = "TRACE", err = "WARN")]
    pub fn transfer(&mut self, control: &UnixStream) -> Result<usize, HandoffError> {
        if self.state != PredecessorState::Freezing {
            return Err(invalid(self.state, "transfer"));
        }
        self.state = PredecessorState::Transferring;
        match self.send_all(control) {
            Ok(connections) => {
                self.state = PredecessorState::Draining;
                info!("handed off listener and {} connections", connections);
                Ok(connections)
            }
            Err(err) => {
                self.abort();
                Err(err)
            }
        }
    }

    fn send_all(&self, control: &UnixStream) -> Result<usize, HandoffError> {
        control::bound(control, self.timeout)?;
        // The duplicate is what travels, this process keeps its own listener open throughout.
        let listener = self
            .server
            .listener()
            .try_clone()
            .map_err(HandoffError::Duplicate)?;
        let connections = self.server.registry().snapshot();

        let mut outgoing: Vec<Outgoing<'_>> = Vec::with_capacity(connections.len() + 1);
        outgoing.push((&listener as &dyn AsRawDescriptor, LISTENER_LABEL));
        outgoing.extend(
            connections
                .iter()
                .map(|(label, stream)| (&**stream as &dyn AsRawDescriptor, label.as_str())),
        );
        fd_transfer::send(control, &outgoing)?;

        let acknowledged = control::read_ack(control)?;
        if acknowledged != outgoing.len() {
            return Err(HandoffError::AckMismatch {
                sent: outgoing.len(),
                acknowledged,
            });
        }
        control::write(control, ControlFrame::Done)?;
        Ok(connections.len())
    }

    /// Abandons a handoff in progress, serving again.
    pub fn abort(&mut self) {
        if matches!(
            self.state,
            PredecessorState::Freezing | PredecessorState::Transferring
        ) {
            warn!("abandoning handoff while {:?}", self.state);
            self.server.registry().thaw();
            self.state = PredecessorState::Serving;
        }
    }

    /// `Serving → Freezing → Transferring → Draining`, triggered by a successor connecting on
    /// `control`.
    ///
    /// # Errors
    ///
    /// See [`Predecessor::freeze`] and [`Predecessor::transfer`].
    pub fn hand_off(&mut self, control: &UnixStream) -> Result<usize, HandoffError> {
        self.freeze()?;
        self.transfer(control)
    }

    /// `Draining → Exited`: closes this process' copies of the handed off connections once their
    /// handlers stopped, returning how many were closed.
    ///
    /// The business socket file is left in place, it belongs to the successor.
    ///
    /// # Errors
    ///
    /// When not draining.
    #[logfn(ok = "INFO", err = "WARN")]
    pub fn drain(&mut self) -> Result<usize, HandoffError> {
        if self.state != PredecessorState::Draining {
            return Err(invalid(self.state, "drain"));
        }
        let records = self.server.registry().relinquish();
        let closed = records.len();
        drop(records);
        self.server.join_handlers();
        self.state = PredecessorState::Exited;
        Ok(closed)
    }
}

/// What a successor receives.
#[derive(Debug)]
pub struct Inheritance {
    /// The business listener.
    pub listener: UnixListener,
    /// The connections, in the order they were sent, with their labels.
    pub connections: Vec<(String, UnixStream)>,
}

impl Inheritance {
    fn from_received(received: Vec<LabelledFd>) -> Result<Self, HandoffError> {
        let (listeners, connections): (Vec<_>, Vec<_>) = received
            .into_iter()
            .partition(|labelled| labelled.label == LISTENER_LABEL);
        let mut listeners = listeners.into_iter();
        match (listeners.next(), listeners.len()) {
            (Some(listener), 0) => Ok(Self {
                listener: UnixListener::from(listener.fd),
                connections: connections
                    .into_iter()
                    .map(|labelled| (labelled.label, UnixStream::from(labelled.fd)))
                    .collect(),
            }),
            (first, rest) => Err(HandoffError::Listener {
                found: usize::from(first.is_some()) + rest,
            }),
        }
    }
}

/// The side taking over.
#[derive(Debug)]
pub struct Successor {
    state: SuccessorState,
    control: UnixStream,
    timeout: Duration,
}

impl Successor {
    /// Wraps the control connection to the predecessor, bounding each handoff step by `timeout`.
    #[must_use]
    pub const fn new(control: UnixStream, timeout: Duration) -> Self {
        Self {
            state: SuccessorState::AwaitingHandoff,
            control,
            timeout,
        }
    }

    /// The current state.
    #[must_use]
    pub const fn state(&self) -> SuccessorState {
        self.state
    }

    /// `AwaitingHandoff → Receiving → Resuming`: receives the listener and connections and
    /// completes the handshake.
    ///
    /// # Errors
    ///
    /// When the transfer or handshake fails or times out. The received descriptors are closed,
    /// the predecessor still serves everything, this process must not serve.
    #[logfn(ok = "TRACE", err = "ERROR")]
    pub fn receive(&mut self) -> Result<Inheritance, HandoffError> {
        if self.state != SuccessorState::AwaitingHandoff {
            return Err(invalid(self.state, "receive"));
        }
        self.state = SuccessorState::Receiving;
        control::bound(&self.control, self.timeout)?;

        let received = fd_transfer::receive(&self.control, None)?;
        let count = received.len();
        let inheritance = Inheritance::from_received(received)?;
        control::write(&self.control, ControlFrame::Ack { received: count })?;
        match control::read_done(&self.control) {
            Ok(()) => {}
            Err(ControlError::Read(ReadFrameError::EndOfStream)) => {
                return Err(HandoffError::Aborted)
            }
            Err(err) => return Err(err.into()),
        }

        info!(
            "received listener and {} connections",
            inheritance.connections.len()
        );
        self.state = SuccessorState::Resuming;
        Ok(inheritance)
    }

    /// `Resuming → Serving`: serves the inherited listener and connections.
    ///
    /// # Errors
    ///
    /// When not resuming, or the server cannot be started.
    pub fn resume(
        &mut self,
        inheritance: Inheritance,
        handler: Arc<dyn ConnectionHandler>,
        settings: Settings,
    ) -> Result<Server, HandoffError> {
        if self.state != SuccessorState::Resuming {
            return Err(invalid(self.state, "resume"));
        }
        let server = Server::resume(
            inheritance.listener,
            inheritance.connections,
            handler,
            settings,
        )
        .map_err(HandoffError::Resume)?;
        self.state = SuccessorState::Serving;
        Ok(server)
    }
}
