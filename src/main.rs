//! saga-store — counter demo driven from stdin.
//!
//! Startup sequence:
//!   1. Load .env (if present)
//!   2. Load config
//!   3. Resolve effective log level (CLI `-v` flags > env > config)
//!   4. Init logger once
//!   5. Bootstrap store → saga middleware → root saga
//!   6. Spawn Ctrl-C → shutdown signal watcher
//!   7. Feed stdin lines into the store as actions until EOF or shutdown
//!   8. Let pending delayed increments land, then cancel + join the root saga
//!
//! Every state change is printed to stdout as one JSON line.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use saga_store::counter::{self, CounterAction, CounterState};
use saga_store::error::AppError;
use saga_store::store::{Store, TracingMiddleware};
use saga_store::{Bootstrapper, config, logger};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    // Optional file; a missing .env is not an error.
    let _ = dotenvy::dotenv();

    let args = parse_cli_args();

    let config = config::load(args.config_path.as_deref())?;

    let effective_log_level = args.log_level.unwrap_or(config.log_level.as_str());
    let force_cli_level = args.log_level.is_some();

    logger::init(effective_log_level, force_cli_level, config.log_file.as_deref())?;

    info!(
        app_name = %config.app_name,
        configured_log_level = %config.log_level,
        effective_log_level = %effective_log_level,
        channel_capacity = config.saga.channel_capacity,
        grace_ms = config.shutdown.grace_ms,
        "config loaded"
    );

    // Shared shutdown token — Ctrl-C cancels it, the root saga watches it.
    let shutdown = CancellationToken::new();

    let ctrlc_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received — initiating shutdown");
            ctrlc_token.cancel();
        }
    });

    let app = Bootstrapper::new(counter::reduce, CounterState::default())
        .with_middleware(TracingMiddleware)
        .with_saga_options(config.saga.options())
        .with_shutdown(shutdown.clone())
        .start(counter::root_saga)?;

    let store = app.store().clone();
    let _printer = store.subscribe(|state: &CounterState| match serde_json::to_string(state) {
        Ok(json) => println!("{json}"),
        Err(e) => warn!(error = %e, "failed to serialize state"),
    });

    read_actions(&store, &shutdown).await?;

    let grace = Duration::from_millis(config.shutdown.grace_ms);
    if !shutdown.is_cancelled() && !counter::wait_until_drained(&store, grace).await {
        warn!(
            pending = store.get_state().pending,
            "delayed increments still pending at shutdown"
        );
    }

    match tokio::time::timeout(grace, app.shutdown()).await {
        Ok(Ok(exit)) => info!(?exit, "root saga stopped"),
        Ok(Err(e)) => return Err(e),
        Err(_) => warn!(grace_ms = config.shutdown.grace_ms, "root saga did not stop in time"),
    }

    info!(value = store.get_state().value, "exiting");
    Ok(())
}

/// Dispatch one action per stdin line. Unparsable lines are logged and
/// skipped; returns on EOF or shutdown.
async fn read_actions(
    store: &Store<CounterState, CounterAction>,
    shutdown: &CancellationToken,
) -> Result<(), AppError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            info!("end of input");
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }

        match line.parse::<CounterAction>() {
            Ok(action) => {
                if let Err(e) = store.dispatch(action) {
                    warn!(error = %e, "dispatch failed");
                }
            }
            Err(e) => warn!(input = %line.trim(), error = %e, "ignoring input"),
        }
    }
}

struct CliArgs {
    log_level: Option<&'static str>,
    config_path: Option<String>,
}

fn parse_cli_args() -> CliArgs {
    let mut verbosity = 0u8;
    let mut config_path = None;

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        if arg == "--" {
            break;
        }

        match arg.as_str() {
            "-h" | "--help" => {
                println!("Usage: saga-store [OPTIONS]");
                println!();
                println!("Reads one action per line from stdin and prints the state after each change.");
                println!("Actions: inc | dec | reset | inc-async [ms] | {{\"type\":\"INC\"}}");
                println!();
                println!("Options:");
                println!("  -h, --help                 Print help");
                println!("  -f, --config <PATH>        Path to configuration file (default: config/default.toml)");
                println!("  -v, -vv, -vvv, -vvvv       Increase logging verbosity");
                std::process::exit(0);
            }
            "-f" | "--config" => {
                if let Some(path) = iter.next() {
                    config_path = Some(path);
                } else {
                    eprintln!("error: -f/--config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--verbose" => verbosity = verbosity.saturating_add(1),
            a if a.starts_with('-') && a.len() > 1 && a.chars().skip(1).all(|c| c == 'v') => {
                verbosity = verbosity.saturating_add((a.len() - 1) as u8);
            }
            _ => {}
        }
    }

    // -v warn, -vv info, -vvv debug (boot phases, dispatch timings),
    // -vvvv trace.
    let log_level = match verbosity {
        0 => None,
        1 => Some("warn"),
        2 => Some("info"),
        3 => Some("debug"),
        _ => Some("trace"),
    };

    CliArgs {
        log_level,
        config_path,
    }
}
