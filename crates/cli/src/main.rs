//! # CLI - Bookie Ledger Storage Shell
//!
//! A REPL-style command-line interface over the interleaved ledger storage.
//! Reads commands from stdin, executes them against the storage, and prints
//! results to stdout. Logs go to stderr so scripted sessions can parse
//! stdout line by line.
//!
//! ## Commands
//!
//! ```text
//! ADD ledger entry payload      Store an entry (refused on fenced ledgers)
//! RECOVER ledger entry payload  Store an entry, ignoring the fence
//! READ ledger entry             Print the entry payload (or "(nil)")
//! FENCE ledger                  Fence a ledger
//! KEY ledger key                Set the ledger's master key
//! DELETE ledger                 Delete a ledger and its index
//! FLUSH                         Persist everything cached
//! CHECKPOINT                    Take a checkpoint now
//! CHECK                         Run the local consistency check
//! LEDGERS                       List active ledgers
//! STATS                         Print storage debug info
//! EXIT / QUIT                   Shut down gracefully
//! ```
//!
//! Running `cli check` skips the shell: it runs the consistency check once
//! and exits with status 0 when clean, 1 on inconsistencies or when an index
//! cannot be read.
//!
//! ## Configuration
//!
//! ```text
//! BOOKIE_LEDGER_DIRS        Comma separated ledger dirs  (default: "data/ledgers")
//! BOOKIE_ENTRY_LOG_SIZE_MB  Entry log rollover size      (default: 64)
//! BOOKIE_WRITE_CACHE_MB     Size of each write cache     (default: 16)
//! BOOKIE_FLUSH_INTERVAL_MS  Periodic checkpoint interval (default: 60000)
//! BOOKIE_CHECK_RATE         Consistency checks/second    (default: 0 = unthrottled)
//! RUST_LOG                  Log filter                   (default: "info")
//! ```
//!
//! ## Example
//!
//! ```text
//! $ cargo run -p cli
//! bookie storage started (dirs=["data/ledgers"], ledgers=0, cache=16MiB)
//! > ADD 1 0 hello
//! OK 0
//! > READ 1 0
//! hello
//! > FENCE 1
//! OK (fenced)
//! > EXIT
//! bye
//! ```

use anyhow::{Context, Result};
use config::StorageConfig;
use std::io::{self, BufRead, Write};
use std::process::ExitCode;
use std::sync::Arc;
use storage::{
    make_entry, rate_limiter, CheckpointSource, DetectedInconsistency, InterleavedLedgerStorage,
    LedgerStorage, RateLimit, SequentialCheckpointSource, StorageError, SyncThread,
    ENTRY_HEADER_BYTES,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn main() -> Result<ExitCode> {
    init_logging();

    let config = StorageConfig::from_env();
    let source = Arc::new(SequentialCheckpointSource::new());
    let storage = Arc::new(
        InterleavedLedgerStorage::open(config.clone(), source.clone())
            .context("failed to open ledger storage")?,
    );

    if std::env::args().nth(1).as_deref() == Some("check") {
        return Ok(check_once(&storage, &config));
    }

    let handle: Arc<dyn LedgerStorage> = storage.clone();
    let sync = Arc::new(SyncThread::new(
        Arc::downgrade(&handle),
        source.clone(),
        config.flush_interval,
    ));
    storage.set_checkpointer(sync.clone());
    storage.start();

    println!(
        "bookie storage started (dirs={:?}, ledgers={}, cache={}MiB)",
        config.ledger_dirs,
        storage.active_ledgers().len(),
        config.write_cache_capacity / (1024 * 1024)
    );
    println!("Commands: ADD l e payload | RECOVER l e payload | READ l e | FENCE l | KEY l key");
    println!("          DELETE l | FLUSH | CHECKPOINT | CHECK | LEDGERS | STATS | EXIT");
    print!("> ");
    io::stdout().flush().ok();

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let parts: Vec<&str> = line.split_whitespace().collect();
        if let Some((cmd, args)) = parts.split_first() {
            if matches!(cmd.to_uppercase().as_str(), "EXIT" | "QUIT") {
                println!("bye");
                break;
            }
            execute(&storage, source.as_ref(), &config, cmd, args);
        }

        print!("> ");
        io::stdout().flush().ok();
    }

    info!("shell exiting");
    sync.shutdown();
    storage.shutdown().context("failed to shut down ledger storage")?;
    Ok(ExitCode::SUCCESS)
}

/// Runs one shell command and prints its outcome.
fn execute(
    storage: &InterleavedLedgerStorage,
    source: &dyn CheckpointSource,
    config: &StorageConfig,
    cmd: &str,
    args: &[&str],
) {
    match cmd.to_uppercase().as_str() {
        "ADD" | "RECOVER" => {
            let recovery = cmd.eq_ignore_ascii_case("RECOVER");
            let (Some(ledger), Some(entry)) = (arg_u64(args, 0), arg_u64(args, 1)) else {
                println!("ERR usage: {} ledger entry payload", cmd.to_uppercase());
                return;
            };
            let payload = args.get(2..).unwrap_or_default().join(" ");
            let bytes = make_entry(ledger, entry, payload.as_bytes());
            let result = if recovery {
                storage.add_recovery_entry(&bytes)
            } else {
                storage.add_entry(&bytes)
            };
            match result {
                Ok(id) => println!("OK {}", id),
                Err(e) => println!("ERR add failed: {}", e),
            }
        }
        "READ" => {
            let (Some(ledger), Some(entry)) = (arg_u64(args, 0), arg_u64(args, 1)) else {
                println!("ERR usage: READ ledger entry");
                return;
            };
            match storage.read_entry(ledger, entry) {
                Ok(bytes) => {
                    let body = bytes.get(ENTRY_HEADER_BYTES..).unwrap_or_default();
                    println!("{}", String::from_utf8_lossy(body));
                }
                Err(e) if e.is_not_found() => println!("(nil)"),
                Err(e) => println!("ERR read failed: {}", e),
            }
        }
        "FENCE" => {
            let Some(ledger) = arg_u64(args, 0) else {
                println!("ERR usage: FENCE ledger");
                return;
            };
            match storage.set_fenced(ledger) {
                Ok(true) => println!("OK (fenced)"),
                Ok(false) => println!("OK (already fenced)"),
                Err(e) => println!("ERR fence failed: {}", e),
            }
        }
        "KEY" => {
            let (Some(ledger), Some(key)) = (arg_u64(args, 0), args.get(1)) else {
                println!("ERR usage: KEY ledger key");
                return;
            };
            match storage.set_master_key(ledger, key.as_bytes()) {
                Ok(()) => println!("OK"),
                Err(e) => println!("ERR key failed: {}", e),
            }
        }
        "DELETE" => {
            let Some(ledger) = arg_u64(args, 0) else {
                println!("ERR usage: DELETE ledger");
                return;
            };
            match storage.delete_ledger(ledger) {
                Ok(()) => println!("OK"),
                Err(StorageError::NoLedger(_)) => println!("(nil)"),
                Err(e) => println!("ERR delete failed: {}", e),
            }
        }
        "FLUSH" => match storage.flush() {
            Ok(()) => println!("OK"),
            Err(e) => println!("ERR flush failed: {}", e),
        },
        "CHECKPOINT" => {
            let mark = source.new_checkpoint();
            let done = storage
                .checkpoint(mark)
                .and_then(|done| source.checkpoint_complete(done, false).map(|()| done));
            match done {
                Ok(done) => println!("OK (checkpoint {})", done.0),
                Err(e) => println!("ERR checkpoint failed: {}", e),
            }
        }
        "CHECK" => {
            report(&run_check(storage, config));
        }
        "LEDGERS" => {
            let ledgers = storage.active_ledgers();
            if ledgers.is_empty() {
                println!("(empty)");
            } else {
                for id in &ledgers {
                    println!("{}", id);
                }
                println!("({} ledgers)", ledgers.len());
            }
        }
        "STATS" => {
            println!("{:?}", storage);
        }
        other => {
            println!("unknown command: {}", other);
        }
    }
}

fn arg_u64(args: &[&str], i: usize) -> Option<u64> {
    args.get(i)?.parse().ok()
}

fn run_check(
    storage: &InterleavedLedgerStorage,
    config: &StorageConfig,
) -> Result<Vec<DetectedInconsistency>, StorageError> {
    let limiter = rate_limiter(config.consistency_check_rate);
    storage.local_consistency_check(limiter.as_ref().map(|l| l as &dyn RateLimit))
}

/// Prints the outcome of a check and returns whether it was clean.
fn report(result: &Result<Vec<DetectedInconsistency>, StorageError>) -> bool {
    let found = match result {
        Ok(found) => found,
        Err(e) => {
            println!("ERR check failed: {}", e);
            return false;
        }
    };
    for inconsistency in found {
        println!("{}", inconsistency);
    }
    if found.is_empty() {
        println!("CLEAN");
        true
    } else {
        println!("INCONSISTENT ({})", found.len());
        false
    }
}

fn check_once(storage: &InterleavedLedgerStorage, config: &StorageConfig) -> ExitCode {
    let result = run_check(storage, config);
    if report(&result) {
        ExitCode::SUCCESS
    } else {
        warn!("consistency check failed");
        ExitCode::FAILURE
    }
}
