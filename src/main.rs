//! CLI entry point.
//!
//! Stands in for the RPC shell described in §6.1: takes a vault path, runs
//! boot recovery before anything else, then exposes a `rename` subcommand
//! that drives the front door end to end. The full request/response server
//! a real deployment would use remains out of scope for this crate.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

use vault_engine::config::EngineConfig;
use vault_engine::recovery;
use vault_engine::rename::{rename, RenameOptions, RenameResult};
use vault_engine::transaction::TransactionManager;
use vault_engine::wal::WalManager;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Root directory of the vault this process operates on.
    #[arg(long, global = true)]
    vault: PathBuf,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Rename a note, optionally rewriting every wikilink that points at it.
    Rename {
        /// Path (or bare stem) of the note to rename, relative to the vault.
        old: PathBuf,
        /// New stem; the engine appends the correct extension.
        new_filename: String,
        /// Skip rewriting links to the renamed note.
        #[arg(long)]
        no_update_links: bool,
        /// Preview the operation without mutating anything.
        #[arg(long)]
        dry_run: bool,
    },
}

fn main() {
    let args = Args::parse();
    setup_tracing(&args);

    let config = match EngineConfig::new(args.vault.clone()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("could not resolve state directory: {err}");
            std::process::exit(1);
        }
    };

    let wal = match WalManager::new(config.state_dir.clone()) {
        Ok(wal) => wal,
        Err(err) => {
            eprintln!("could not open WAL directory {:?}: {err}", config.state_dir);
            std::process::exit(1);
        }
    };

    let manager = match TransactionManager::new(config.vault_root.clone(), wal) {
        Ok(manager) => manager,
        Err(err) => {
            eprintln!("could not open vault {:?}: {err}", config.vault_root);
            std::process::exit(1);
        }
    };

    // Boot recovery runs once, before any command executes, and never
    // blocks startup on its own outcome (§4.7).
    for report in recovery::run(&manager) {
        tracing::info!(
            correlation_id = %report.correlation_id,
            outcome = ?report.outcome,
            "boot recovery entry processed"
        );
    }

    match args.command {
        Command::Rename { old, new_filename, no_update_links, dry_run } => {
            let options = RenameOptions { update_links: !no_update_links, dry_run };
            match rename(&manager, &old, &new_filename, options) {
                Ok(RenameResult::Success(outcome)) => print_json(&outcome),
                Ok(RenameResult::Preview(preview)) => print_json(&preview),
                Err(err) => {
                    print_json(&err);
                    std::process::exit(1);
                }
            }
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(err) => eprintln!("failed to serialize result: {err}"),
    }
}

/// Configures the tracing subscriber the same way the rest of this codebase
/// always has: an `EnvFilter` defaulting to `info` (`debug` with `--debug`),
/// a pretty formatter in debug builds, and span-close events so phase
/// timings show up in the log stream as well as the CLI's own JSON output.
fn setup_tracing(args: &Args) {
    let log_level = if args.debug { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("vault_engine={log_level}").into());

    let formatter = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::LocalTime::rfc_3339())
        .with_span_events(FmtSpan::CLOSE);

    if cfg!(debug_assertions) {
        formatter.pretty().init();
    } else {
        formatter.init();
    }
}
