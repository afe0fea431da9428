//! spindle - delegation server for coding-agent CLIs.
//!
//! `serve` runs the MCP server in the foreground (stdio by default, HTTP
//! with `--http`); `start`/`reload` prefer a user systemd unit and fall
//! back to a detached self-spawn and the reload marker; `status` queries
//! the HTTP health endpoint.
//!
//! Exit codes: 0 success, 1 generic error, 2 usage (from clap).

use std::net::SocketAddr;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use spindle_core::config::SpindleConfig;
use spindle_core::Supervisor;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// spindle - delegation server for coding-agent CLIs
#[derive(Parser, Debug)]
#[command(name = "spindle")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the server (via user systemd when available, else detached)
    Start,

    /// Restart the server to pick up changes
    Reload,

    /// Check server health
    Status {
        /// HTTP port the server listens on
        #[arg(long, default_value_t = 8002)]
        port: u16,

        /// HTTP host the server listens on
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },

    /// Run the MCP server in the foreground
    Serve {
        /// Serve HTTP instead of stdio
        #[arg(long)]
        http: bool,

        /// HTTP port (with --http)
        #[arg(long, default_value_t = 8002)]
        port: u16,

        /// HTTP host (with --http)
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Diagnostics go to stderr; the stdio transport owns stdout.
    let filter = EnvFilter::try_new(&cli.log_level)
        .or_else(|_| EnvFilter::try_new("info"))
        .expect("default filter is valid");
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Start => start(),
        Commands::Reload => reload(),
        Commands::Status { port, host } => status(&host, port),
        Commands::Serve { http, port, host } => serve(http, &host, port),
    }
}

fn systemd_unit_exists() -> bool {
    Command::new("systemctl")
        .args(["--user", "list-unit-files", "spindle.service"])
        .output()
        .is_ok_and(|out| String::from_utf8_lossy(&out.stdout).contains("spindle.service"))
}

fn start() -> Result<()> {
    if systemd_unit_exists() {
        Command::new("systemctl")
            .args(["--user", "start", "spindle"])
            .status()
            .context("failed to run systemctl")?;
        println!("started via systemd");
        return Ok(());
    }

    let exe = std::env::current_exe().context("failed to locate the spindle binary")?;
    Command::new(exe)
        .args(["serve", "--http"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()
        .context("failed to spawn the background server")?;
    println!("started in background (no systemd unit found)");
    Ok(())
}

fn reload() -> Result<()> {
    if systemd_unit_exists() {
        Command::new("systemctl")
            .args(["--user", "restart", "spindle"])
            .status()
            .context("failed to run systemctl")?;
        println!("restarted via systemd");
        return Ok(());
    }

    // No service manager: touch the reload marker a serving process
    // watches, so it exits and its supervisor restarts it.
    let marker = SpindleConfig::from_env().reload_signal_path();
    if let Some(parent) = marker.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&marker, unix_timestamp_line())?;
    println!("touched reload marker at {}", marker.display());
    Ok(())
}

fn status(host: &str, port: u16) -> Result<()> {
    let url = format!("http://{host}:{port}/health");
    let output = Command::new("curl")
        .args(["-s", "--max-time", "2", &url])
        .output()
        .context("failed to run curl")?;
    if output.status.success() && !output.stdout.is_empty() {
        println!("{}", String::from_utf8_lossy(&output.stdout).trim());
    } else {
        println!("not running");
    }
    Ok(())
}

fn serve(http: bool, host: &str, port: u16) -> Result<()> {
    let config = SpindleConfig::from_env();
    let reload_marker = config.reload_signal_path();

    let runtime = tokio::runtime::Runtime::new().context("failed to start the runtime")?;
    runtime.block_on(async move {
        let supervisor =
            Arc::new(Supervisor::new(config).context("failed to open the spindle root")?);
        supervisor.recover_orphans();
        let monitor = supervisor.spawn_monitor();

        let serve_result = tokio::select! {
            result = run_transport(Arc::clone(&supervisor), http, host, port) => result,
            () = watch_reload_marker(reload_marker) => {
                tracing::info!("reload marker touched; shutting down");
                Ok(())
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted; shutting down");
                Ok(())
            }
            _ = sigterm() => {
                tracing::info!("terminated; shutting down");
                Ok(())
            }
        };

        monitor.abort();
        serve_result.map_err(Into::into)
    })
}

async fn run_transport(
    supervisor: Arc<Supervisor>,
    http: bool,
    host: &str,
    port: u16,
) -> std::io::Result<()> {
    if http {
        let addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        spindle_server::serve_http(supervisor, addr).await
    } else {
        spindle_server::serve_stdio(supervisor).await
    }
}

async fn sigterm() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(_) => std::future::pending().await,
    }
}

/// Resolve once the reload marker's mtime changes (or it appears).
async fn watch_reload_marker(path: std::path::PathBuf) {
    let initial = mtime_of(&path);
    loop {
        tokio::time::sleep(Duration::from_secs(5)).await;
        if mtime_of(&path) != initial {
            return;
        }
    }
}

fn mtime_of(path: &Path) -> Option<std::time::SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn unix_timestamp_line() -> String {
    format!(
        "{}\n",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    )
}
