#![warn(clippy::pedantic)]

//! A unix socket server which hands its listener and live connections over to a newer process
//! without dropping a byte.
//!
//! The first process started with a given control socket serves clients. A second process
//! started with the same control socket takes the listener and every connection over from it
//! ([`sequencer`]), after which the first process exits. The second can in turn be replaced by a
//! third, and so on.

use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use log_derive::logfn;

/// Command line configuration.
pub mod config;
pub mod control;
/// Waiting on listeners.
pub mod poll;
pub mod registry;
pub mod role;
pub mod sequencer;
pub mod server;

pub use config::Config;
use role::{HandoffEndpoint, ProcessRole, RoleError};
use sequencer::{HandoffError, Predecessor, Successor};
use server::{ConnectionHandler, Server, Settings};

/// How [`run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A successor took over, along with this many connections.
    HandedOff {
        /// Number of connections handed off.
        connections: usize,
    },
    /// Shut down on request, without a successor.
    Shutdown,
}

/// Error type for [`run`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The role of this process could not be established.
    #[error("Failed to establish role: {0}")]
    Role(#[from] RoleError),
    /// Failed to bind the business socket.
    #[error("Failed to bind business socket `{}`: {source}", path.display())]
    Bind {
        /// Path of the business socket.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Taking over from the running process failed.
    #[error("Failed to take over: {0}")]
    Handoff(#[from] HandoffError),
    /// Failed to wait for clients or successors.
    #[error("Failed to poll: {0}")]
    Poll(std::io::Error),
    /// Failed to accept a successor, or the control connection went missing.
    #[error("Control channel failed: {0}")]
    ControlChannel(std::io::Error),
}

/// Serves `handler` per `config` until `exit` is set or a successor takes over.
///
/// When another process already serves at `config.control`, this process takes its listener and
/// connections over first.
///
/// # Errors
///
/// When this process can neither serve nor take over. A handoff failing after this process started
/// serving is not an error, it keeps serving.
#[logfn(ok = "INFO", err = "ERROR")]
pub fn run(
    config: &Config,
    handler: Arc<dyn ConnectionHandler>,
    exit: &AtomicBool,
) -> Result<Outcome, Error> {
    let mut endpoint = HandoffEndpoint::establish(&config.control)?;
    let settings = Settings::from(config);

    let server = match endpoint.role() {
        ProcessRole::Predecessor => match Server::bind(&config.business, handler, settings) {
            Ok(server) => server,
            Err(source) => {
                endpoint.close();
                return Err(Error::Bind {
                    path: config.business.clone(),
                    source,
                });
            }
        },
        ProcessRole::Successor => {
            let control = endpoint.take_control_conn().ok_or_else(|| {
                Error::ControlChannel(std::io::ErrorKind::NotConnected.into())
            })?;
            let mut successor = Successor::new(control, config.handoff_timeout);
            let inheritance = successor.receive()?;
            let server = successor.resume(inheritance, handler, settings)?;
            if let Err(err) = endpoint.rearm() {
                warn!("serving, but nothing can take over from this process: {}", err);
            }
            server
        }
    };

    serve(
        Predecessor::new(server, config.handoff_timeout),
        endpoint,
        config.poll_interval,
        exit,
    )
}

fn serve(
    mut predecessor: Predecessor,
    endpoint: HandoffEndpoint,
    poll_interval: Duration,
    exit: &AtomicBool,
) -> Result<Outcome, Error> {
    info!("ready to receive connections");
    loop {
        if exit.load(Ordering::SeqCst) {
            info!("shutting down");
            predecessor.into_server().shutdown();
            endpoint.close();
            return Ok(Outcome::Shutdown);
        }

        let ready = {
            let mut sources: Vec<&dyn AsRawFd> = Vec::with_capacity(2);
            sources.push(predecessor.server().listener());
            if let Some(listener) = endpoint.control_listener() {
                sources.push(listener);
            }
            poll::readable(&sources, poll_interval).map_err(Error::Poll)?
        };

        if ready.first().copied().unwrap_or(false) {
            if let Err(err) = predecessor.accept_pending() {
                warn!("failed to accept: {}", err);
            }
        }

        if !ready.get(1).copied().unwrap_or(false) {
            continue;
        }
        let Some(control) = endpoint
            .accept_successor()
            .map_err(Error::ControlChannel)?
        else {
            continue;
        };
        info!("successor connected");
        match predecessor.hand_off(&control) {
            Ok(connections) => {
                predecessor.drain()?;
                // The socket files now belong to the successor, which already replaced the
                // control socket or is about to.
                drop(endpoint);
                return Ok(Outcome::HandedOff { connections });
            }
            Err(err) => warn!("handoff abandoned, still serving: {}", err),
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
pub(crate) mod tests {
    use std::io::{Read, Write};
    use std::os::unix::fs::MetadataExt;
    use std::os::unix::net::UnixStream;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Once};
    use std::thread::JoinHandle;
    use std::time::{Duration, Instant};

    use rand::Rng;

    use super::*;
    use crate::server::Echo;

    static INIT_LOGGER: Once = Once::new();

    /// Initializes the logger once per test binary.
    pub fn init_logger() {
        INIT_LOGGER.call_once(|| simple_logger::init_with_level(log::Level::Trace).unwrap());
    }

    /// A path under `/tmp` no other test uses.
    pub fn temp_path(name: &str) -> PathBuf {
        let suffix = rand::thread_rng().gen::<u64>();
        PathBuf::from(format!("/tmp/takeover-{name}-{suffix:016x}.sock"))
    }

    /// Writes `bytes` and reads the reply.
    pub fn request(stream: &mut UnixStream, bytes: &[u8]) -> Vec<u8> {
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream.write_all(bytes).unwrap();
        let mut buf = [0; 1024];
        let read = stream.read(&mut buf).unwrap();
        buf[..read].to_vec()
    }

    /// Polls `condition` until it holds, failing after a few seconds.
    pub fn wait_for(mut condition: impl FnMut() -> bool) {
        let start = Instant::now();
        while !condition() {
            assert!(
                start.elapsed() < Duration::from_secs(5),
                "condition not met in time"
            );
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn config(business: &Path, control: &Path, greeting: &str) -> Config {
        Config {
            business: business.to_path_buf(),
            control: control.to_path_buf(),
            poll_interval: Duration::from_millis(10),
            greeting: String::from(greeting),
            ..Config::default()
        }
    }

    fn spawn(config: Config, exit: Arc<AtomicBool>) -> JoinHandle<Result<Outcome, Error>> {
        std::thread::spawn(move || {
            let handler = Arc::new(Echo::new(config.greeting.clone()));
            run(&config, handler, &exit)
        })
    }

    fn connect(path: &Path) -> UnixStream {
        let start = Instant::now();
        loop {
            match UnixStream::connect(path) {
                Ok(stream) => return stream,
                Err(_) if start.elapsed() < Duration::from_secs(5) => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(err) => panic!("failed to connect to {}: {err}", path.display()),
            }
        }
    }

    #[test]
    fn generations() {
        init_logger();
        let business = temp_path("business");
        let control = temp_path("control");

        let first_exit = Arc::new(AtomicBool::new(false));
        let first = spawn(config(&business, &control, "v1"), Arc::clone(&first_exit));
        let mut client = connect(&business);
        assert_eq!(request(&mut client, b"one"), b"v1: one");

        let first_control = std::fs::metadata(&control).unwrap().ino();
        let second_exit = Arc::new(AtomicBool::new(false));
        let second = spawn(config(&business, &control, "v2"), Arc::clone(&second_exit));
        assert!(matches!(
            first.join().unwrap(),
            Ok(Outcome::HandedOff { connections: 1 })
        ));
        assert_eq!(request(&mut client, b"two"), b"v2: two");

        // The successor can be replaced in turn, once it replaced the control socket.
        wait_for(|| {
            std::fs::metadata(&control).map_or(false, |metadata| metadata.ino() != first_control)
        });
        let third_exit = Arc::new(AtomicBool::new(false));
        let third = spawn(config(&business, &control, "v3"), Arc::clone(&third_exit));
        assert!(matches!(
            second.join().unwrap(),
            Ok(Outcome::HandedOff { connections: 1 })
        ));
        assert_eq!(request(&mut client, b"three"), b"v3: three");
        let mut fresh = connect(&business);
        assert_eq!(request(&mut fresh, b"fresh"), b"v3: fresh");

        third_exit.store(true, Ordering::SeqCst);
        assert!(matches!(third.join().unwrap(), Ok(Outcome::Shutdown)));
        assert!(!business.exists());
        assert!(!control.exists());
    }

    #[test]
    fn shutdown_removes_sockets() {
        init_logger();
        let business = temp_path("business");
        let control = temp_path("control");
        let exit = Arc::new(AtomicBool::new(false));
        let serving = spawn(config(&business, &control, "v1"), Arc::clone(&exit));
        let mut client = connect(&business);
        assert_eq!(request(&mut client, b"one"), b"v1: one");

        exit.store(true, Ordering::SeqCst);
        assert!(matches!(serving.join().unwrap(), Ok(Outcome::Shutdown)));
        assert!(!business.exists());
        assert!(!control.exists());
    }

    #[test]
    fn stale_control_socket_does_not_displace_a_live_server() {
        init_logger();
        let business = temp_path("business");
        let control = temp_path("control");
        let exit = Arc::new(AtomicBool::new(false));
        let serving = spawn(config(&business, &control, "v1"), Arc::clone(&exit));
        let mut client = connect(&business);

        // Looks like the control socket of a process which is gone.
        let stale = temp_path("control");
        drop(std::os::unix::net::UnixListener::bind(&stale).unwrap());
        let late = config(&business, &stale, "v2");
        assert!(matches!(
            run(&late, Arc::new(Echo::new("v2")), &AtomicBool::new(false)),
            Err(Error::Bind { .. })
        ));
        assert!(!stale.exists());
        assert_eq!(request(&mut client, b"still"), b"v1: still");
        let mut fresh = connect(&business);
        assert_eq!(request(&mut fresh, b"fresh"), b"v1: fresh");

        exit.store(true, Ordering::SeqCst);
        assert!(matches!(serving.join().unwrap(), Ok(Outcome::Shutdown)));
    }

    #[test]
    fn unbindable_business_socket() {
        init_logger();
        let business = PathBuf::from("/nonexistent/takeover.sock");
        let control = temp_path("control");
        let exit = AtomicBool::new(false);
        let config = config(&business, &control, "v1");
        assert!(matches!(
            run(&config, Arc::new(Echo::new("v1")), &exit),
            Err(Error::Bind { .. })
        ));
        // Nothing is left behind to confuse the next process.
        assert!(!control.exists());
    }
}
