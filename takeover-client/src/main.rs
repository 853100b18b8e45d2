#![warn(clippy::pedantic)]
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::Parser;
use indicatif::ProgressBar;
use log::{error, info, warn};
use takeover_client::Client;

/// Sends numbered greetings to a takeover server, printing every reply.
#[derive(Debug, Parser)]
#[clap(author, version, about)]
struct Args {
    /// Path of the server socket.
    #[clap(short, long, value_parser, default_value = "/tmp/socket_takeover.sock")]
    business: PathBuf,
    /// Number of requests to send.
    #[clap(short, long, value_parser, default_value_t = 1000)]
    requests: u64,
    /// Milliseconds to wait between requests.
    #[clap(short, long, value_parser, default_value_t = 10)]
    interval: u64,
    /// Log level.
    #[clap(short, long, value_parser, default_value = "Warn")]
    log_level: log::Level,
}

fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(err) = simple_logger::init_with_level(args.log_level) {
        eprintln!("failed to initialize logger: {err}");
        return ExitCode::FAILURE;
    }
    let now = Instant::now();

    let mut client = match Client::connect(&args.business) {
        Ok(client) => client,
        Err(err) => {
            error!("{}", err);
            return ExitCode::FAILURE;
        }
    };

    let bar = ProgressBar::new(args.requests);
    for i in 0..args.requests {
        let request = format!("hello server: {i}");
        let reply = match client.request(request.as_bytes()) {
            Ok(reply) => reply,
            Err(err) => {
                // The server was restarted rather than handed over, try once more on a fresh
                // connection.
                warn!("{}, reconnecting", err);
                match client
                    .reconnect()
                    .and_then(|()| client.request(request.as_bytes()))
                {
                    Ok(reply) => reply,
                    Err(err) => {
                        error!("{}", err);
                        bar.abandon();
                        return ExitCode::FAILURE;
                    }
                }
            }
        };
        info!("client recv: {}", String::from_utf8_lossy(&reply));
        bar.println(String::from_utf8_lossy(&reply));
        bar.inc(1);
        std::thread::sleep(Duration::from_millis(args.interval));
    }
    bar.finish();
    println!("live for: {:?}", now.elapsed());
    ExitCode::SUCCESS
}
