//! parley-server binary: loads config, seeds the in-memory directory, and
//! runs the relay until a signal or a console `exit`.

use anyhow::Context;
use clap::Parser;
use parley_server::{MemoryDirectory, RelayHandle, RelayServer, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

/// parley-server: chat relay
#[derive(Parser, Debug)]
#[command(name = "parley-server", version, about = "Authenticated chat relay server")]
struct Cli {
    /// Listen address (empty = all interfaces)
    #[arg(short, long)]
    addr: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.parley/server.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Read operator commands from stdin
    #[arg(long)]
    console: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config_path = PathBuf::from(&cli.config);
    let config = ServerConfig::load(Some(&config_path), cli.addr.as_deref(), cli.port)
        .context("failed to load config")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.bind_addr(),
        users = config.users.len(),
        "starting parley-server"
    );

    let directory = Arc::new(MemoryDirectory::from_seeds(&config.users));
    let (server, handle) = RelayServer::bind(config, directory.clone())
        .await
        .context("failed to bind listener")?;

    let mut relay = tokio::spawn(server.run());

    tokio::select! {
        result = &mut relay => {
            report(result);
            return Ok(());
        }
        _ = shutdown_signal() => info!("received shutdown signal"),
        _ = console(handle.clone(), directory), if cli.console => info!("console exit"),
    }

    handle.shutdown();
    report(relay.await);
    info!("parley-server stopped");
    Ok(())
}

fn report(result: Result<parley_core::ParleyResult<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "relay error"),
        Err(e) => error!(error = %e, "relay task failed"),
    }
}

/// Operator commands read line by line from stdin. Returns on `exit` or EOF.
async fn console(handle: RelayHandle, directory: Arc<MemoryDirectory>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!(
        "commands: exit, notify, sessions, active, users, remove <name>, history [name], stats"
    );

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "console read failed");
                return;
            }
        };
        let mut words = line.split_whitespace();
        match words.next() {
            Some("exit") => return,
            Some("notify") => {
                if let Err(e) = handle.notify_contacts_changed().await {
                    warn!(error = %e, "notify failed");
                }
            }
            Some("sessions") => match handle.sessions().await {
                Ok(names) if names.is_empty() => println!("no sessions"),
                Ok(names) => println!("{}", names.join(", ")),
                Err(e) => warn!(error = %e, "sessions query failed"),
            },
            Some("active") => {
                for user in directory.active_users() {
                    println!(
                        "{} {}:{} since {}",
                        user.name,
                        user.ip,
                        user.port,
                        unix_secs(user.login_time)
                    );
                }
            }
            Some("users") => {
                for user in directory.known_users() {
                    let last = user
                        .last_login
                        .map(|t| unix_secs(t).to_string())
                        .unwrap_or_else(|| "never".into());
                    println!("{} last_login={}", user.name, last);
                }
            }
            Some("remove") => {
                let Some(name) = words.next() else {
                    println!("usage: remove <name>");
                    continue;
                };
                directory.remove_user(name);
                info!(user = name, "user removed");
                if let Err(e) = handle.notify_contacts_changed().await {
                    warn!(error = %e, "notify failed");
                }
            }
            Some("history") => {
                for record in directory.login_history(words.next()) {
                    println!(
                        "{} {}:{} at {}",
                        record.name,
                        record.ip,
                        record.port,
                        unix_secs(record.time)
                    );
                }
            }
            Some("stats") => {
                for stats in directory.message_stats() {
                    let last = stats
                        .last_login
                        .map(|t| unix_secs(t).to_string())
                        .unwrap_or_else(|| "never".into());
                    println!(
                        "{} last_login={} sent={} accepted={}",
                        stats.name, last, stats.sent, stats.accepted
                    );
                }
            }
            Some(other) => println!("unknown command: {other}"),
            None => {}
        }
    }
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let Ok(mut sigterm) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        else {
            ctrl_c.await.ok();
            return;
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
