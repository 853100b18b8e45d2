//! The business side: an accept loop, and one handler thread per connection.

use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use crate::config::Config;
use crate::registry::{Activity, Admission, ConnectionId, ConnectionRegistry};

/// Most bytes read from a connection in one cycle.
pub const READ_BUFFER: usize = 1024;

/// The application protocol spoken on business connections.
///
/// Handlers see the connection as a byte stream. A request is whatever one read returned, no
/// message boundary survives a handoff.
pub trait ConnectionHandler: Send + Sync {
    /// Processes bytes read from the connection labelled `label`, returning the bytes to write
    /// back.
    fn handle(&self, label: &str, request: &[u8]) -> Vec<u8>;
}

/// Replies to every request with the request, prefixed by a greeting.
#[derive(Debug, Clone)]
pub struct Echo {
    greeting: String,
}
impl Echo {
    /// Constructs an echo handler replying `"{greeting}: {request}"`.
    pub fn new(greeting: impl Into<String>) -> Self {
        Self {
            greeting: greeting.into(),
        }
    }
}
impl ConnectionHandler for Echo {
    fn handle(&self, label: &str, request: &[u8]) -> Vec<u8> {
        debug!("{} recv: {}", label, String::from_utf8_lossy(request));
        let mut reply = Vec::with_capacity(self.greeting.len() + 2 + request.len());
        reply.extend_from_slice(self.greeting.as_bytes());
        reply.extend_from_slice(b": ");
        reply.extend_from_slice(request);
        reply
    }
}

/// Timing of connection handlers.
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    /// A connection without data for this long is closed.
    pub idle_timeout: Duration,
    /// Longest a handler blocks in a read, bounding how long a freeze waits for it.
    pub poll_interval: Duration,
}
impl From<&Config> for Settings {
    fn from(config: &Config) -> Self {
        Self {
            idle_timeout: config.idle_timeout,
            poll_interval: config.poll_interval,
        }
    }
}

/// Error type of a single connection, it only ever closes that connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Failed to configure the socket.
    #[error("Failed to configure the socket: {0}")]
    Configure(std::io::Error),
    /// Failed to read a request.
    #[error("Failed to read a request: {0}")]
    Read(std::io::Error),
    /// Failed to write a reply.
    #[error("Failed to write a reply: {0}")]
    Write(std::io::Error),
    /// Nothing arrived within the idle timeout.
    #[error("Nothing arrived within {0:?}.")]
    Idle(Duration),
}

/// Outcome of one read-process-write cycle.
enum Cycle {
    Served,
    Idle,
    EndOfStream,
}

/// The business listener and its connections.
pub struct Server {
    listener: UnixListener,
    path: PathBuf,
    registry: Arc<ConnectionRegistry>,
    handler: Arc<dyn ConnectionHandler>,
    settings: Settings,
    handles: Vec<JoinHandle<()>>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("listener", &self.listener)
            .field("path", &self.path)
            .field("registry", &self.registry)
            .field("settings", &self.settings)
            .field("handles", &self.handles.len())
            .finish_non_exhaustive()
    }
}

impl Server {
    fn new(
        listener: UnixListener,
        path: PathBuf,
        handler: Arc<dyn ConnectionHandler>,
        settings: Settings,
    ) -> Self {
        Self {
            listener,
            path,
            registry: Arc::new(ConnectionRegistry::new()),
            handler,
            settings,
            handles: Vec::new(),
        }
    }

    /// Binds a new business listener at `path`.
    ///
    /// A socket file at `path` nobody accepts on was left behind by a process which is gone and is
    /// replaced. A socket file somebody still accepts on is left alone.
    ///
    /// # Errors
    ///
    /// When another process serves at `path` ([`ErrorKind::AddrInUse`]), or the socket cannot be
    /// bound.
    pub fn bind(
        path: &Path,
        handler: Arc<dyn ConnectionHandler>,
        settings: Settings,
    ) -> std::io::Result<Self> {
        match UnixStream::connect(path) {
            Ok(_) => {
                return Err(std::io::Error::new(
                    ErrorKind::AddrInUse,
                    "another process serves at this path",
                ))
            }
            Err(err) if err.kind() == ErrorKind::ConnectionRefused => {
                std::fs::remove_file(path)?;
                warn!("removed stale business socket {}", path.display());
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        info!("listening for clients at {}", path.display());
        Ok(Self::new(listener, path.to_path_buf(), handler, settings))
    }

    /// Resumes serving on a listener and connections taken over from another process.
    ///
    /// # Errors
    ///
    /// When the listener has no path, cannot be configured, or a handler cannot be started.
    pub fn resume(
        listener: UnixListener,
        connections: Vec<(String, UnixStream)>,
        handler: Arc<dyn ConnectionHandler>,
        settings: Settings,
    ) -> std::io::Result<Self> {
        let path = listener
            .local_addr()?
            .as_pathname()
            .map(Path::to_path_buf)
            .ok_or_else(|| {
                std::io::Error::new(ErrorKind::InvalidInput, "inherited listener has no path")
            })?;
        listener.set_nonblocking(true)?;
        let mut server = Self::new(listener, path, handler, settings);
        for (label, stream) in connections {
            stream.set_nonblocking(false)?;
            let (id, stream) = server.registry.adopt(label, stream);
            server.spawn(id, stream)?;
        }
        info!(
            "resumed at {} with {} connections",
            server.path.display(),
            server.registry.len()
        );
        Ok(server)
    }

    /// Accepts every pending connection, returning how many were accepted.
    ///
    /// # Errors
    ///
    /// When accepting, or starting a handler, fails.
    pub fn accept_pending(&mut self) -> std::io::Result<usize> {
        let mut accepted = 0;
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false)?;
                    let (id, stream) = self.registry.insert(stream);
                    info!("accepted {}", id);
                    self.spawn(id, stream)?;
                    accepted += 1;
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(accepted),
                // The client gave up before we got to it.
                Err(err) if err.kind() == ErrorKind::ConnectionAborted => {}
                Err(err) => return Err(err),
            }
        }
    }

    fn spawn(&mut self, id: ConnectionId, stream: Arc<UnixStream>) -> std::io::Result<()> {
        let registry = Arc::clone(&self.registry);
        let handler = Arc::clone(&self.handler);
        let settings = self.settings;
        let spawned = std::thread::Builder::new()
            .name(id.to_string())
            .spawn(move || serve_connection(id, &stream, &registry, handler.as_ref(), settings));
        match spawned {
            Ok(handle) => {
                self.handles.retain(|handle| !handle.is_finished());
                self.handles.push(handle);
                Ok(())
            }
            Err(err) => {
                self.registry.remove(id);
                Err(err)
            }
        }
    }

    /// The business listener.
    #[must_use]
    pub const fn listener(&self) -> &UnixListener {
        &self.listener
    }

    /// Path the business listener is bound at.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The connections of this server.
    #[must_use]
    pub const fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Waits for every handler thread to finish.
    pub fn join_handlers(&mut self) {
        let now = Instant::now();
        info!("awaiting {} handlers", self.handles.len());
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("a connection handler panicked");
            }
        }
        info!("awaited handlers: {:?}", now.elapsed());
    }

    /// Stops serving for good, removing the socket file. Connections are abandoned to process
    /// exit.
    pub fn shutdown(self) {
        info!("removing business socket {}", self.path.display());
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!("failed to remove {}: {}", self.path.display(), err);
        }
    }
}

/// Serves connection `id` until it closes, idles out, or is relinquished.
fn serve_connection(
    id: ConnectionId,
    stream: &UnixStream,
    registry: &ConnectionRegistry,
    handler: &dyn ConnectionHandler,
    settings: Settings,
) {
    let label = registry.label(id).unwrap_or_else(|| id.to_string());
    // The read timeout bounds how long a cycle keeps a freeze waiting.
    if let Err(err) = stream
        .set_read_timeout(Some(settings.poll_interval))
        .and_then(|()| stream.set_write_timeout(Some(settings.idle_timeout)))
    {
        warn!("{}: {}", label, ConnectionError::Configure(err));
        registry.remove(id);
        return;
    }

    let mut buf = [0; READ_BUFFER];
    let mut last_activity = Instant::now();
    loop {
        if registry.enter(id) == Admission::Relinquished {
            // Another process owns the socket now, it must not be shut down, only closed.
            debug!("{} relinquished", label);
            return;
        }
        match cycle(stream, &mut buf, &label, handler) {
            Ok(Cycle::Served) => {
                last_activity = Instant::now();
                registry.leave(id, Activity::Served);
            }
            Ok(Cycle::Idle) if last_activity.elapsed() < settings.idle_timeout => {
                registry.leave(id, Activity::Idle);
            }
            Ok(Cycle::Idle) => {
                debug!("{}: {}", label, ConnectionError::Idle(settings.idle_timeout));
                registry.leave(id, Activity::Closed);
                return;
            }
            Ok(Cycle::EndOfStream) => {
                debug!("{} closed by client", label);
                registry.leave(id, Activity::Closed);
                return;
            }
            Err(err) => {
                warn!("{}: {}", label, err);
                registry.leave(id, Activity::Closed);
                return;
            }
        }
    }
}

fn cycle(
    stream: &UnixStream,
    buf: &mut [u8],
    label: &str,
    handler: &dyn ConnectionHandler,
) -> Result<Cycle, ConnectionError> {
    let mut reader = stream;
    let read = match reader.read(buf) {
        Ok(0) => return Ok(Cycle::EndOfStream),
        Ok(read) => read,
        Err(err)
            if matches!(
                err.kind(),
                ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
            ) =>
        {
            return Ok(Cycle::Idle)
        }
        Err(err) => return Err(ConnectionError::Read(err)),
    };
    let reply = handler.handle(label, &buf[..read]);
    trace!("{} reply: {} bytes", label, reply.len());
    let mut writer = stream;
    writer.write_all(&reply).map_err(ConnectionError::Write)?;
    Ok(Cycle::Served)
}
