//! Logmend: repair and reason about append-only conversation logs.
//!
//! A conversation log is newline-delimited JSON: a DAG of user/assistant
//! messages with tool invocations and tool results interleaved. Logs
//! accumulate three structural defects over time (interrupted tool calls,
//! replayed duplicate tool results, orphaned parent references), and
//! logmend turns a possibly-corrupted log back into a valid one.
//!
//! # Core Principles
//!
//! - **Scan never mutates**: defect detection is read-only and repeatable
//! - **Repairs are planned, then applied**: the engine emits a minimal,
//!   deterministic, idempotent operation list; only a persistence backend
//!   writes
//! - **Every repair is replayable**: under the event-sourced backend each
//!   decision is an immutable event; any historical state reconstructs by
//!   replay
//! - **Original bytes are sacred**: untouched lines round-trip
//!   byte-identical, malformed lines are preserved verbatim
//!
//! # Pipeline
//!
//! codec → DAG → scanner → engine → backend (file-atomic | event-sourced)
//! → materializer, orchestrated by the [`core::manager::RepairManager`]
//! façade that interactive front ends drive.
//!
//! # Examples
//!
//! ```bash
//! # Report defects without side effects
//! logmend scan session.jsonl
//!
//! # Repair in place (file-atomic backend, batch policies)
//! logmend fix session.jsonl --duplicates keep-first --missing synth-cancel
//!
//! # Record a baseline into the event store
//! logmend sync session.jsonl
//!
//! # Inspect the repair event stream
//! logmend events --log session.jsonl
//!
//! # Revert a repair event / restore a backup
//! logmend undo session.jsonl --target <id>
//! ```

pub mod core;

use crate::core::audit::AuditLog;
use crate::core::config::{BackendChoice, Config};
use crate::core::engine::{DuplicatePolicy, MissingPolicy, OrphanPolicy, RepairPolicy};
use crate::core::error::MendError;
use crate::core::event_backend::{EventBackend, RevertOutcome};
use crate::core::event_store::{EventStore, RepairEvent};
use crate::core::file_backend::FileBackend;
use crate::core::logfile::LogFile;
use crate::core::manager::{DefectSelection, RepairManager};
use crate::core::materialize::ViewCache;
use crate::core::output;
use crate::core::persist::PersistenceBackend;
use crate::core::scanner::{self, DefectReport};
use crate::core::time;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[clap(
    name = "logmend",
    version = env!("CARGO_PKG_VERSION"),
    about = "Repair append-only conversation logs"
)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum DuplicateArg {
    KeepFirst,
    KeepLast,
    DropInvalid,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum MissingArg {
    SynthCancel,
    Leave,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OrphanArg {
    RelinkBest,
    DropSubtree,
    Leave,
}

#[derive(clap::Args, Debug)]
struct ScanCli {
    /// Log file to scan.
    log: PathBuf,
    /// Output format.
    #[clap(long, value_enum, default_value = "text")]
    format: OutputFormat,
    /// Config file (defaults to ./logmend.toml when present).
    #[clap(long)]
    config: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct FixCli {
    /// Log files to repair. Independent files repair in parallel.
    #[clap(required = true)]
    logs: Vec<PathBuf>,
    /// Policy for well-formed duplicate tool results.
    #[clap(long, value_enum, default_value = "keep-first")]
    duplicates: DuplicateArg,
    /// Policy for unanswered tool uses.
    #[clap(long, value_enum, default_value = "synth-cancel")]
    missing: MissingArg,
    /// Policy for orphaned parent references.
    #[clap(long, value_enum, default_value = "relink-best")]
    orphans: OrphanArg,
    /// Operator label recorded on every operation.
    #[clap(long, default_value = "batch")]
    operator: String,
    /// Config file (defaults to ./logmend.toml when present).
    #[clap(long)]
    config: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct SyncCli {
    /// Log file to record a baseline for.
    log: PathBuf,
    /// Config file (defaults to ./logmend.toml when present).
    #[clap(long)]
    config: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct EventsCli {
    /// Log file whose primary session to query.
    #[clap(long)]
    log: Option<PathBuf>,
    /// Query an explicit session id.
    #[clap(long)]
    session: Option<String>,
    /// Query by subject record uuid instead.
    #[clap(long)]
    record: Option<String>,
    /// Probe store connectivity and schema, then exit.
    #[clap(long)]
    health: bool,
    /// Config file (defaults to ./logmend.toml when present).
    #[clap(long)]
    config: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct UndoCli {
    /// Log file the undo applies to.
    log: PathBuf,
    /// Event id (event-sourced) or backup id (file-atomic) to revert.
    #[clap(long)]
    target: Option<String>,
    /// List undo points instead of reverting.
    #[clap(long)]
    list: bool,
    /// Config file (defaults to ./logmend.toml when present).
    #[clap(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan a log and report defects without side effects
    #[clap(name = "scan")]
    Scan(ScanCli),

    /// Run the full repair pipeline with batch policies
    #[clap(name = "fix")]
    Fix(FixCli),

    /// One-shot baseline import into the event store
    #[clap(name = "sync")]
    Sync(SyncCli),

    /// Query the repair event stream
    #[clap(name = "events")]
    Events(EventsCli),

    /// List undo points or revert a repair
    #[clap(name = "undo")]
    Undo(UndoCli),
}

/// CLI entry point. Returns the process exit code on handled flows; errors
/// map to codes via [`MendError::exit_code`] in `main`.
pub fn run() -> Result<i32, MendError> {
    let cli = Cli::parse();
    match cli.command {
        Command::Scan(args) => run_scan(args),
        Command::Fix(args) => run_fix(args),
        Command::Sync(args) => run_sync(args),
        Command::Events(args) => run_events(args),
        Command::Undo(args) => run_undo(args),
    }
}

fn audit_for(config: &Config) -> AuditLog {
    AuditLog::new(config.event_store.endpoint.join("manager.events.jsonl"))
}

fn run_scan(args: ScanCli) -> Result<i32, MendError> {
    let config = Config::load(args.config.as_deref())?;
    let log = LogFile::load(&args.log)?;
    let report = scanner::scan(&log, &config.scanner);

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print_report(&args.log, &report),
    }

    Ok(if report.has_cycles() {
        4
    } else if report.defects.is_empty() {
        0
    } else {
        2
    })
}

fn print_report(path: &std::path::Path, report: &DefectReport) {
    println!("scan: {}", path.display());
    let c = &report.counters;
    println!(
        "blocks: {} examined, {} valid, {} invalid; cycles: {}",
        c.blocks_examined, c.blocks_valid, c.blocks_invalid, c.cycles_detected
    );
    if !report.line_errors.is_empty() {
        println!(
            "{}: {} (preserved verbatim)",
            "unparsed lines".yellow(),
            report.line_errors.len()
        );
        for err in report.line_errors.iter().take(5) {
            println!("  line {}: {}", err.line_no, output::ellipsize(&err.detail, 80));
        }
    }
    for cycle in &report.cycles {
        println!("{}: {}", "cycle".red().bold(), cycle.join(" -> "));
    }

    if report.defects.is_empty() && !report.has_cycles() {
        println!("{}", "clean".green().bold());
        return;
    }

    println!();
    println!("{}", output::count_noun(report.defects.len(), "defect"));
    println!("{:<4} {:<22} {:<14} DETAIL", "#", "KIND", "RECORD");
    for (i, defect) in report.defects.iter().enumerate() {
        let detail = report
            .context
            .get(i)
            .map(|ctx| format!("line {}: {}", ctx.line_no, ctx.hint))
            .unwrap_or_default();
        println!(
            "{:<4} {:<22} {:<14} {}",
            i,
            defect.kind_str().cyan(),
            output::ellipsize(defect.subject_uuid(), 14),
            detail
        );
    }
}

struct FixSummary {
    path: PathBuf,
    backup_id: String,
    applied: usize,
    skipped: usize,
    stale: usize,
    remaining: usize,
    failure: Option<String>,
}

fn run_fix(args: FixCli) -> Result<i32, MendError> {
    let config = Config::load(args.config.as_deref())?;
    let policy = RepairPolicy {
        duplicates: match args.duplicates {
            DuplicateArg::KeepFirst => DuplicatePolicy::KeepFirst,
            DuplicateArg::KeepLast => DuplicatePolicy::KeepLast,
            DuplicateArg::DropInvalid => DuplicatePolicy::DropInvalid,
        },
        missing: match args.missing {
            MissingArg::SynthCancel => MissingPolicy::SynthCancel,
            MissingArg::Leave => MissingPolicy::Leave,
        },
        orphans: match args.orphans {
            OrphanArg::RelinkBest => OrphanPolicy::RelinkBest,
            OrphanArg::DropSubtree => OrphanPolicy::DropSubtree,
            OrphanArg::Leave => OrphanPolicy::Leave,
        },
    };

    // per-session serialization is the manager's lock; across log files
    // repairs are independent and run in parallel
    let results: Vec<Result<FixSummary, MendError>> = args
        .logs
        .par_iter()
        .map(|path| fix_one(path, &config, &policy, &args.operator))
        .collect();

    let mut exit = 0;
    let mut first_error: Option<MendError> = None;
    for result in results {
        match result {
            Ok(summary) => {
                print_fix_summary(&summary);
                if summary.failure.is_some() {
                    exit = exit.max(3);
                } else if summary.remaining > 0 {
                    exit = exit.max(2);
                }
            }
            Err(e) => {
                eprintln!("{}: {}", "fix failed".red().bold(), e);
                let code = e.exit_code();
                exit = exit.max(code);
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        Some(e) if exit >= 3 => Err(e),
        _ => Ok(exit),
    }
}

fn fix_one(
    path: &std::path::Path,
    config: &Config,
    policy: &RepairPolicy,
    operator: &str,
) -> Result<FixSummary, MendError> {
    let mut manager = RepairManager::new(config.clone(), audit_for(config))?;
    manager.load(path)?;
    let defect_count = manager.scan()?.defects.len();
    if defect_count == 0 {
        return Ok(FixSummary {
            path: path.to_path_buf(),
            backup_id: "-".to_string(),
            applied: 0,
            skipped: 0,
            stale: 0,
            remaining: 0,
            failure: None,
        });
    }

    manager.preview(&DefectSelection::All, policy, operator)?;
    let outcome = manager.confirm()?;
    let remaining = manager.scan()?.defects.len();

    Ok(FixSummary {
        path: path.to_path_buf(),
        backup_id: outcome.backup_id.clone(),
        applied: outcome.applied.len(),
        skipped: outcome.skipped.len(),
        stale: outcome.stale.len(),
        remaining,
        failure: outcome.failed.map(|(op, msg)| {
            format!("{} on {}: {}", op.kind.kind_str(), op.kind.subject_uuid(), msg)
        }),
    })
}

fn print_fix_summary(summary: &FixSummary) {
    let status = match &summary.failure {
        Some(_) => "partial".red().bold(),
        None if summary.applied == 0 => "clean".green().bold(),
        None => "repaired".green().bold(),
    };
    println!(
        "fix: {} {} ({} applied, {} skipped, {} stale, {} remaining; recovery id {})",
        summary.path.display(),
        status,
        summary.applied,
        summary.skipped,
        summary.stale,
        summary.remaining,
        summary.backup_id
    );
    if let Some(failure) = &summary.failure {
        println!("  halted: {}", failure);
    }
}

fn run_sync(args: SyncCli) -> Result<i32, MendError> {
    let config = Config::load(args.config.as_deref())?;
    let store = EventStore::open(&config)?;
    let log = LogFile::load(&args.log)?;
    let session = log
        .primary_session()
        .unwrap_or_else(|| "unsessioned".to_string());

    let bytes = std::fs::read(&args.log)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = format!("{:x}", hasher.finalize());

    let baseline = RepairEvent {
        event_id: time::new_event_id(),
        session_id: session.clone(),
        record_uuid: session.clone(),
        operation_kind: "baseline".to_string(),
        old_parent: None,
        new_parent: None,
        payload: serde_json::json!({
            "path": args.log.display().to_string(),
            "sha256": sha256,
            "records": log.records().count(),
            "unparsed_lines": log.line_errors().len(),
        }),
        operator: "sync".to_string(),
        reason: "initial baseline import".to_string(),
        timestamp: time::now_iso(),
        similarity_score: None,
        is_reverted: false,
    };
    let stored = store.append(&baseline)?;
    println!(
        "sync: session {} baselined as event {} ({} records)",
        session,
        stored.event_id,
        log.records().count()
    );
    Ok(0)
}

fn run_events(args: EventsCli) -> Result<i32, MendError> {
    let config = Config::load(args.config.as_deref())?;
    let store = EventStore::open(&config)?;

    if args.health {
        store.health()?;
        println!("store: {} {}", store.path().display(), "ok".green().bold());
        return Ok(0);
    }

    let events = if let Some(record) = &args.record {
        store.query_for_record(record)?
    } else {
        let session = match (&args.session, &args.log) {
            (Some(s), _) => s.clone(),
            (None, Some(path)) => LogFile::load(path)?
                .primary_session()
                .unwrap_or_else(|| "unsessioned".to_string()),
            (None, None) => {
                return Err(MendError::ConfigError(
                    "events requires --session, --log, or --record".to_string(),
                ));
            }
        };
        store.query_for_session_resolved(&session)?
    };

    println!(
        "{:<26} {:<24} {:<14} {:<10} STATE",
        "TS", "KIND", "RECORD", "OPERATOR"
    );
    for ev in &events {
        println!(
            "{:<26} {:<24} {:<14} {:<10} {}",
            output::ellipsize(&ev.timestamp, 26),
            ev.operation_kind,
            output::ellipsize(&ev.record_uuid, 14),
            output::ellipsize(&ev.operator, 10),
            if ev.is_reverted {
                "reverted".yellow().to_string()
            } else {
                "live".to_string()
            }
        );
        println!("  {} {}", "id".dimmed(), ev.event_id);
    }
    println!("{}", output::count_noun(events.len(), "event"));
    Ok(0)
}

fn run_undo(args: UndoCli) -> Result<i32, MendError> {
    let config = Config::load(args.config.as_deref())?;
    let mut log = LogFile::load(&args.log)?;

    if args.list {
        let backend: Box<dyn PersistenceBackend> = match config.backend {
            BackendChoice::FileAtomic => Box::new(FileBackend::new()),
            BackendChoice::EventSourced => {
                let store = Arc::new(EventStore::open(&config)?);
                Box::new(EventBackend::new(store, Arc::new(ViewCache::new())))
            }
        };
        let history = backend.undo_history(&log)?;
        for point in &history {
            println!("{:<26} {:<28} {}", point.timestamp, point.id, point.label);
        }
        println!("{}", output::count_noun(history.len(), "undo point"));
        return Ok(0);
    }

    let Some(target) = args.target else {
        return Err(MendError::ConfigError(
            "undo requires --target <id> or --list".to_string(),
        ));
    };

    match config.backend {
        BackendChoice::EventSourced => {
            let store = Arc::new(EventStore::open(&config)?);
            let event_backend = EventBackend::new(store, Arc::new(ViewCache::new()));
            match event_backend.revert_event(&target)? {
                RevertOutcome::Reverted(ev) => {
                    println!("undo: reverted {} via {}", target, ev.event_id);
                }
                RevertOutcome::AlreadyReverted => {
                    println!("undo: {} already_reverted (no-op)", target);
                }
            }
        }
        BackendChoice::FileAtomic => {
            let backend = FileBackend::new();
            if !backend.rollback_to_backup(&mut log, &target)? {
                return Err(MendError::NotFound(format!("backup {}", target)));
            }
            println!(
                "undo: restored {} from backup {}",
                args.log.display(),
                target
            );
        }
    }
    Ok(0)
}
