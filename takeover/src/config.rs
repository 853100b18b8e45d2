use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Default path of the business socket.
pub const BUSINESS_SOCKET: &str = "/tmp/socket_takeover.sock";
/// Default path of the control socket.
pub const CONTROL_SOCKET: &str = "/tmp/upg_data.sock";

/// A unix socket echo server which hands its listener and live connections over to the next
/// process started with the same control socket.
#[derive(Debug, Clone, Parser)]
#[clap(author, version, about)]
pub struct Config {
    /// Path of the socket clients connect to.
    #[clap(short, long, value_parser, default_value = BUSINESS_SOCKET)]
    pub business: PathBuf,
    /// Path of the socket a successor uses to take over from this process.
    #[clap(short, long, value_parser, default_value = CONTROL_SOCKET)]
    pub control: PathBuf,
    /// Log level.
    #[clap(short, long, value_parser, default_value = "Info")]
    pub log_level: log::Level,
    /// Milliseconds a connection may stay silent before it is closed.
    #[clap(short, long = "idle-timeout", value_parser = parse_millis, default_value = "10000")]
    pub idle_timeout: Duration,
    /// Milliseconds each step of a handoff may take before the handoff is abandoned.
    #[clap(short = 't', long = "handoff-timeout", value_parser = parse_millis, default_value = "5000")]
    pub handoff_timeout: Duration,
    /// Milliseconds between checks for shutdown and handoff requests.
    #[clap(short, long = "poll-interval", value_parser = parse_millis, default_value = "50")]
    pub poll_interval: Duration,
    /// Prefix of every reply.
    #[clap(short, long, value_parser, default_value = "hello client")]
    pub greeting: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            business: PathBuf::from(BUSINESS_SOCKET),
            control: PathBuf::from(CONTROL_SOCKET),
            log_level: log::Level::Info,
            idle_timeout: Duration::from_secs(10),
            handoff_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
            greeting: String::from("hello client"),
        }
    }
}

fn parse_millis(s: &str) -> Result<Duration, String> {
    let millis = s
        .parse::<u64>()
        .map_err(|err| format!("`{s}` is not a number of milliseconds: {err}"))?;
    if millis == 0 {
        return Err(String::from("must be at least 1 millisecond"));
    }
    Ok(Duration::from_millis(millis))
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_parsed_defaults() {
        let parsed = Config::parse_from(["takeover"]);
        let default = Config::default();
        assert_eq!(parsed.business, default.business);
        assert_eq!(parsed.control, default.control);
        assert_eq!(parsed.log_level, default.log_level);
        assert_eq!(parsed.idle_timeout, default.idle_timeout);
        assert_eq!(parsed.handoff_timeout, default.handoff_timeout);
        assert_eq!(parsed.poll_interval, default.poll_interval);
        assert_eq!(parsed.greeting, default.greeting);
    }

    #[test]
    fn arguments() {
        let parsed = Config::try_parse_from([
            "takeover",
            "-b",
            "/tmp/b.sock",
            "-c",
            "/tmp/c.sock",
            "-l",
            "Trace",
            "-i",
            "250",
            "-t",
            "1000",
            "-g",
            "hello from v2",
        ])
        .unwrap();
        assert_eq!(parsed.business, PathBuf::from("/tmp/b.sock"));
        assert_eq!(parsed.control, PathBuf::from("/tmp/c.sock"));
        assert_eq!(parsed.log_level, log::Level::Trace);
        assert_eq!(parsed.idle_timeout, Duration::from_millis(250));
        assert_eq!(parsed.handoff_timeout, Duration::from_secs(1));
        assert_eq!(parsed.greeting, "hello from v2");
    }

    #[test]
    fn zero_timeout_is_rejected() {
        assert!(Config::try_parse_from(["takeover", "--idle-timeout", "0"]).is_err());
    }
}
