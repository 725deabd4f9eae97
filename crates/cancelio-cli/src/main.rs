use std::process::ExitCode;
use std::sync::mpsc;
use std::time::Duration;

use cancelio::{Client, Server, DEFAULT_SERVER_IP, DEFAULT_SERVER_PORT, DEFAULT_TIMEOUT};
use clap::{Parser, Subcommand};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "cancelio", about = "Cancellable request/response TCP server and client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a server until interrupted.
    Serve {
        #[arg(long, default_value_t = DEFAULT_SERVER_PORT)]
        port: u16,
        #[arg(long, default_value_t = 64)]
        max_clients: usize,
    },
    /// Send one delay request and print the reply.
    Ping {
        #[arg(long, default_value = DEFAULT_SERVER_IP)]
        host: String,
        #[arg(long, default_value_t = DEFAULT_SERVER_PORT)]
        port: u16,
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,
        #[arg(long, value_parser = humantime::parse_duration, default_value = "5s")]
        timeout: Duration,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        Command::Serve { port, max_clients } => serve(port, max_clients),
        Command::Ping { host, port, delay_ms, timeout } => ping(&host, port, delay_ms, timeout),
    }
}

fn serve(port: u16, max_clients: usize) -> ExitCode {
    let server = Server::new(max_clients);
    if !server.start(port) {
        error!(port, "server failed to start");
        return ExitCode::FAILURE;
    }
    info!(port, max_clients, "server started, waiting for Ctrl-C");

    let (tx, rx) = mpsc::channel();
    if let Err(err) = ctrlc::set_handler(move || {
        // set_handler requires Fn, not FnOnce; a closed receiver just means
        // a second signal arrived after shutdown was already underway.
        let _ = tx.send(());
    }) {
        error!(%err, "failed to install signal handler");
        server.stop();
        return ExitCode::FAILURE;
    }

    let _ = rx.recv();
    info!("shutdown requested");
    server.stop();
    ExitCode::SUCCESS
}

fn ping(host: &str, port: u16, delay_ms: u64, timeout: Duration) -> ExitCode {
    let client = Client::new(if timeout.is_zero() { DEFAULT_TIMEOUT } else { timeout });
    let mut delay = Duration::from_millis(delay_ms);
    if client.send_delay(&mut delay, host, port) {
        println!("{}", delay.as_millis());
        ExitCode::SUCCESS
    } else {
        error!(host, port, delay_ms, "request failed");
        ExitCode::FAILURE
    }
}
