//! CLI interface for cellwatch.
//!
//! `cellwatch run` starts the agent in the foreground and keeps it running
//! until interrupted or until `cellwatch stop` withdraws the run request.
//! The other commands only read or edit the storage root, so they work
//! whether or not an agent is running.

mod format;

use std::{fs, io, path::PathBuf};

use clap::{Parser, Subcommand};
use jiff::Timestamp;

use crate::agent::{Agent, Exit};
use crate::config::Config;
use crate::logging::init_logging;
use crate::source;
use crate::storage::{
    Storage, clear_heartbeat, is_service_requested, load_heartbeat, set_service_requested,
};

use format::{CSV_HEADER, csv_row, format_observation, format_status};

/// cellwatch: a cell tower and position sampler that survives its host.
#[derive(Debug, Parser)]
#[command(name = "cellwatch", version, after_long_help = USAGE_HELP)]
pub struct Cli {
    /// Config file. Defaults to `~/.cellwatch/config.toml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Storage root. Defaults to `~/.cellwatch`.
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

const USAGE_HELP: &str = r#"Typical setup:
  1. Configure sources in ~/.cellwatch/config.toml:
       [sources]
       fix-command = ["gnss-once", "--json"]
       attachment-command = ["modem-cells", "--follow"]
  2. cellwatch run                  # start sampling
  3. cellwatch run --if-requested   # from a boot hook: restart only if still wanted
  4. cellwatch log --csv --tail 20  # inspect what was recorded
  5. cellwatch stop                 # withdraw the run request and clear the schedule"#;

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the agent in the foreground.
    ///
    /// Records the run request, so `run --if-requested` after a reboot
    /// picks up where this left off.
    Run {
        /// Only start if a run request is on record.
        #[arg(long)]
        if_requested: bool,
    },

    /// Withdraw the run request and clear the heartbeat schedule.
    ///
    /// A running agent notices at its next cadence tick and exits.
    Stop,

    /// Show the heartbeat state and the latest status line.
    Status,

    /// Print recorded observations.
    Log {
        /// Use the CSV column layout.
        #[arg(long)]
        csv: bool,

        /// Only the last N observations.
        #[arg(long, value_name = "N")]
        tail: Option<usize>,
    },
}

/// Run the CLI, returning an error message on failure.
pub fn run() -> Result<(), String> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    let root = match cli.root {
        Some(root) => root,
        None => Storage::default_root().ok_or("could not determine home directory")?,
    };
    let storage =
        Storage::new(root).map_err(|e| format!("failed to initialize storage: {e}"))?;

    match cli.command {
        Command::Run { if_requested } => cmd_run(&config, &storage, if_requested),
        Command::Stop => cmd_stop(&storage),
        Command::Status => cmd_status(&storage),
        Command::Log { csv, tail } => cmd_log(&storage, csv, tail),
    }
}

fn cmd_run(config: &Config, storage: &Storage, if_requested: bool) -> Result<(), String> {
    let state = storage
        .open_state()
        .map_err(|e| format!("failed to open state: {e}"))?;
    if if_requested && !is_service_requested(&state) {
        eprintln!("No run request on record; not starting");
        return Ok(());
    }
    // Held until the agent has stopped.
    let _lock = storage.lock_agent().map_err(|e| e.to_string())?;

    init_logging(&config.logging).map_err(|e| format!("failed to initialize logging: {e}"))?;
    set_service_requested(&state, true).map_err(|e| format!("failed to record run request: {e}"))?;
    drop(state);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("failed to start async runtime: {e}"))?;

    let exit = runtime.block_on(async {
        let sources = source::select(&config.sources);
        let agent = Agent::open(config, storage, sources)
            .map_err(|e| format!("failed to start agent: {e}"))?;
        Ok::<_, String>(agent.run(shutdown_signal()).await)
    })?;

    match exit {
        Exit::Shutdown => eprintln!("Agent interrupted; schedule kept for the next start"),
        Exit::StopRequested => eprintln!("Agent stopped"),
    }
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

fn cmd_stop(storage: &Storage) -> Result<(), String> {
    let state = storage
        .open_state()
        .map_err(|e| format!("failed to open state: {e}"))?;

    set_service_requested(&state, false)
        .map_err(|e| format!("failed to withdraw run request: {e}"))?;
    clear_heartbeat(&state).map_err(|e| format!("failed to clear heartbeat state: {e}"))?;

    eprintln!("Run request withdrawn; a running agent exits at its next tick");
    Ok(())
}

fn cmd_status(storage: &Storage) -> Result<(), String> {
    let state = storage
        .open_state()
        .map_err(|e| format!("failed to open state: {e}"))?;

    let status_line = match fs::read_to_string(storage.status_path()) {
        Ok(s) => Some(s.trim_end().to_string()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(format!("failed to read status: {e}")),
    };

    println!(
        "{}",
        format_status(
            &load_heartbeat(&state),
            is_service_requested(&state),
            status_line.as_deref(),
            Timestamp::now(),
        )
    );
    Ok(())
}

fn cmd_log(storage: &Storage, csv: bool, tail: Option<usize>) -> Result<(), String> {
    let log = storage.event_log();
    let observations = log
        .load()
        .map_err(|e| format!("failed to read {}: {e}", log.path().display()))?;

    let skip = tail.map_or(0, |n| observations.len().saturating_sub(n));
    let shown = &observations[skip..];

    if csv {
        println!("{CSV_HEADER}");
        for obs in shown {
            println!("{}", csv_row(obs));
        }
    } else if shown.is_empty() {
        println!("No observations");
    } else {
        for obs in shown {
            println!("{}", format_observation(obs));
        }
    }
    Ok(())
}
