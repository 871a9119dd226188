//! CLI entry point for masmon.
//!
//! Two modes:
//! - `masmon monitor` polls the controller, prints status transitions, and
//!   optionally keeps an incremental spinning log on disk.
//! - `masmon shell` is an interactive prompt for sending raw commands.
//!
//! The controller address comes from `--address node:port` or is discovered
//! from the spectrometer's `symbols.sh`; the command table from `--commands`
//! or the usual `cfgmas.dat` locations.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use masmon::config::{self, ControllerAddress, PlotRanges};
use masmon::connection::Connection;
use masmon::error::MasError;
use masmon::history::History;
use masmon::protocol::CommandTable;
use masmon::session::{
    spawn_session, ControllerStatus, ReconnectDecision, SessionEvent, SessionOptions,
    SessionTiming,
};

#[derive(Parser)]
#[command(name = "masmon")]
#[command(about = "Monitor and control a MAS probe controller over TCP", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the controller and print status updates
    Monitor {
        /// Directory to store spinning log files in
        #[arg(short = 'l', long)]
        log_dir: Option<PathBuf>,

        /// Run offline using simple fake spinning values
        #[arg(short, long)]
        offline: bool,

        /// Controller address as node:port (default: from symbols.sh)
        #[arg(long)]
        address: Option<String>,

        /// Command table file (default: cfgmas.dat search path)
        #[arg(long)]
        commands: Option<PathBuf>,

        /// Begin incremental logging immediately
        #[arg(long)]
        log: bool,

        /// Emit events as JSON lines instead of text
        #[arg(long)]
        json: bool,
    },

    /// Interactively send commands to the controller
    Shell {
        /// Controller address as node:port (default: from symbols.sh)
        #[arg(long)]
        address: Option<String>,

        /// Command table file (default: cfgmas.dat search path)
        #[arg(long)]
        commands: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Monitor {
            log_dir,
            offline,
            address,
            commands,
            log,
            json,
        } => monitor(log_dir, offline, address, commands, log, json).await,
        Commands::Shell { address, commands } => shell(address, commands).await,
    }
}

fn load_table(path: Option<PathBuf>) -> Result<CommandTable> {
    let path = match path {
        Some(path) => path,
        None => config::find_command_file()?,
    };
    CommandTable::load(&path).with_context(|| format!("loading command table {}", path.display()))
}

fn resolve_address(spec: Option<String>) -> Result<ControllerAddress> {
    Ok(match spec {
        Some(spec) => ControllerAddress::parse(&spec)?,
        None => ControllerAddress::discover()?,
    })
}

fn lock(history: &Arc<Mutex<History>>) -> MutexGuard<'_, History> {
    history.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn monitor(
    log_dir: Option<PathBuf>,
    offline: bool,
    address: Option<String>,
    commands: Option<PathBuf>,
    log: bool,
    json: bool,
) -> Result<()> {
    let ranges = PlotRanges::load(&config::find_ranges_file()?)?;
    let table = load_table(commands)?;
    let address = if offline {
        // The offline path never opens a socket; any placeholder will do.
        ControllerAddress {
            node: "offline".into(),
            port: 0,
        }
    } else {
        resolve_address(address)?
    };

    let history = Arc::new(Mutex::new(History::new(
        ranges.history_length(),
        log_dir.as_deref(),
    )));
    if log {
        lock(&history)
            .begin_logging()
            .context("cannot begin logging")?;
    }

    let options = SessionOptions {
        address,
        table,
        timing: SessionTiming::default(),
        offline,
    };
    let (handle, mut events, join) = spawn_session(options, history.clone());

    let mut last_status: Option<ControllerStatus> = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("stopping");
                handle.stop();
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                if json {
                    println!("{}", serde_json::to_string(&event)?);
                }
                match event {
                    SessionEvent::Status { status, time } => {
                        if !json && last_status.as_ref() != Some(&status) {
                            println!(
                                "{}  spin {:>5} Hz (set {:>5})  drive {:>4}  bearing {:>4}  sense {:>4}",
                                time.format("%H:%M:%S"),
                                status.spin,
                                status.spin_set,
                                status.drive,
                                status.bearing,
                                status.sense,
                            );
                            last_status = Some(status);
                        }
                    }
                    SessionEvent::ReconnectNeeded { cause } => {
                        // Headless: no operator dialog, so report and abort.
                        eprintln!("connection lost: {cause}");
                        handle.resolve_reconnect(ReconnectDecision::Abort);
                    }
                }
            }
        }
    }

    // Keep draining so the loop never blocks on a full event channel while
    // winding down.
    while events.recv().await.is_some() {}
    join.await?;

    let mut history = lock(&history);
    if history.is_logging() {
        history.end_logging().context("flushing spinning log")?;
    }
    Ok(())
}

async fn shell(address: Option<String>, commands: Option<PathBuf>) -> Result<()> {
    let table = load_table(commands)?;
    let address = resolve_address(address)?;
    let mut conn = Connection::open(&address, table).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("Enter command: ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else { break };
        let line = line.trim();

        match line {
            "" => continue,
            "exit" => break,
            "test" => {
                println!("{}", conn.test_connection().await);
                continue;
            }
            _ => {}
        }

        let mut words = line.split_whitespace();
        let Some(code) = words.next() else { continue };
        let args: Vec<String> = words.map(str::to_owned).collect();
        match conn.send_command(code, &args).await {
            Ok(tokens) => println!("{}", tokens.join(" ")),
            Err(MasError::Protocol(err)) => println!("invalid command: {err}"),
            Err(err) => return Err(err.into()),
        }
    }

    conn.close().await;
    Ok(())
}
