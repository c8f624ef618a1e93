//! sd-admin: Operator tool for storage directories.
//!
//! Moves notes between storage directories, resumes or reports interrupted
//! moves, scans for index/document divergence and manages backups. Every
//! command prints JSON on stdout; logs go to stderr.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sd_admin::app::absolute_str;
use sd_admin::{App, Config};
use sd_core::backup::RestoreIdentity;
use sd_core::{ConflictPolicy, MoveRequest, SdId, StorageDirectoryRegistry};

#[derive(Parser, Debug)]
#[command(name = "sd-admin")]
#[command(about = "Storage directory administration: note moves, consistency scans, backups")]
struct Args {
    /// Data directory (overrides SD_ADMIN_HOME)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage registered storage directories
    #[command(subcommand)]
    Sd(SdCommand),

    /// Move a note to another storage directory
    Move {
        note_id: String,
        /// Source storage directory id
        #[arg(long)]
        from: i64,
        /// Target storage directory id
        #[arg(long)]
        to: i64,
        /// Target folder id
        #[arg(long)]
        folder: Option<String>,
        /// What to do if the target already has a live note with this id
        #[arg(long, value_enum, default_value_t = ConflictArg::Fail)]
        conflict: ConflictArg,
    },

    /// List unfinished moves
    Moves {
        /// Only foreign moves past the staleness threshold
        #[arg(long)]
        stale: bool,
    },

    /// Resume owned moves and report foreign ones
    Recover,

    /// Claim a move left by another instance and finish it
    Takeover { move_id: String },

    /// Cancel a move that has not updated the index yet
    Cancel { move_id: String },

    /// Delete old completed and cancelled move records
    GcMoves,

    /// Report index/document divergence (read-only)
    Scan,

    /// Repair one scan finding
    #[command(subcommand)]
    Repair(RepairCommand),

    /// Manage backups
    #[command(subcommand)]
    Backup(BackupCommand),
}

#[derive(Subcommand, Debug)]
enum SdCommand {
    /// Register a storage directory (created if missing)
    Add {
        path: PathBuf,
        #[arg(long)]
        name: Option<String>,
        /// Identity for a new directory; an existing SD_ID marker wins
        #[arg(long)]
        uuid: Option<String>,
    },
    List,
    /// Make a storage directory the active one
    Activate { id: i64 },
}

#[derive(Subcommand, Debug)]
enum RepairCommand {
    /// Keep one copy of a duplicated note, delete the others
    Duplicate {
        note_id: String,
        #[arg(long)]
        keep: i64,
    },
    /// Create an index row for an orphaned document
    ImportOrphan {
        #[arg(long)]
        sd: i64,
        note_id: String,
    },
    /// Delete an orphaned document
    DeleteOrphan {
        #[arg(long)]
        sd: i64,
        note_id: String,
    },
    /// Delete an index row whose document is missing
    DeleteMissing {
        #[arg(long)]
        sd: i64,
        note_id: String,
    },
    /// Delete a stale migration lock
    DeleteLock {
        #[arg(long)]
        sd: i64,
    },
    /// Delete another device's activity log
    DeleteActivityLog {
        #[arg(long)]
        sd: i64,
        instance: String,
    },
}

#[derive(Subcommand, Debug)]
enum BackupCommand {
    /// Back up a whole storage directory, or selected notes with --notes
    Create {
        #[arg(long)]
        sd: i64,
        #[arg(long, value_delimiter = ',')]
        notes: Vec<String>,
        #[arg(long)]
        description: Option<String>,
    },
    List,
    /// Restore a backup into an empty directory and register it
    Restore {
        backup_id: String,
        target: PathBuf,
        /// Give the restored directory a new identity
        #[arg(long)]
        new_identity: bool,
    },
    Delete { backup_id: String },
    /// Prune expired pre-operation snapshots
    Cleanup,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ConflictArg {
    Fail,
    Replace,
    KeepBoth,
}

impl From<ConflictArg> for ConflictPolicy {
    fn from(arg: ConflictArg) -> Self {
        match arg {
            ConflictArg::Fail => ConflictPolicy::Fail,
            ConflictArg::Replace => ConflictPolicy::Replace,
            ConflictArg::KeepBoth => ConflictPolicy::KeepBoth,
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(app: &App, command: Command) -> Result<()> {
    match command {
        Command::Sd(SdCommand::Add { path, name, uuid }) => {
            print_json(&app.add_storage_dir(&path, name, uuid).await?)
        }
        Command::Sd(SdCommand::List) => print_json(&app.index().list_storage_dirs().await?),
        Command::Sd(SdCommand::Activate { id }) => {
            app.index().set_active(SdId(id)).await?;
            print_json(&json!({ "active": id }))
        }
        Command::Move {
            note_id,
            from,
            to,
            folder,
            conflict,
        } => {
            let mut request =
                MoveRequest::new(note_id, SdId(from), SdId(to)).with_conflict(conflict.into());
            request.target_folder_id = folder;
            print_json(&app.move_note(request).await?)
        }
        Command::Moves { stale: true } => print_json(&app.coordinator.stale_moves().await?),
        Command::Moves { stale: false } => {
            print_json(&app.coordinator.list_active_moves().await?)
        }
        Command::Recover => print_json(&app.coordinator.recover_incomplete_moves().await?),
        Command::Takeover { move_id } => {
            print_json(&app.coordinator.take_over_move(&move_id).await?)
        }
        Command::Cancel { move_id } => print_json(&app.coordinator.cancel_move(&move_id).await?),
        Command::GcMoves => {
            let removed = app.coordinator.cleanup_old_moves().await?;
            print_json(&json!({ "removed": removed }))
        }
        Command::Scan => print_json(&app.scanner.scan().await?),
        Command::Repair(repair) => run_repair(app, repair).await,
        Command::Backup(backup) => run_backup(app, backup).await,
    }
}

async fn run_repair(app: &App, command: RepairCommand) -> Result<()> {
    let scanner = &app.scanner;
    match command {
        RepairCommand::Duplicate { note_id, keep } => {
            let removed = scanner.resolve_duplicate(&note_id, SdId(keep)).await?;
            print_json(&json!({ "note_id": note_id, "kept": keep, "removed_from": removed }))
        }
        RepairCommand::ImportOrphan { sd, note_id } => {
            print_json(&scanner.import_orphan(SdId(sd), &note_id).await?)
        }
        RepairCommand::DeleteOrphan { sd, note_id } => {
            scanner.delete_orphan(SdId(sd), &note_id).await?;
            print_json(&json!({ "deleted_document": note_id, "sd": sd }))
        }
        RepairCommand::DeleteMissing { sd, note_id } => {
            scanner.delete_missing_row(SdId(sd), &note_id).await?;
            print_json(&json!({ "deleted_row": note_id, "sd": sd }))
        }
        RepairCommand::DeleteLock { sd } => {
            scanner.delete_stale_lock(SdId(sd)).await?;
            print_json(&json!({ "deleted_lock": sd }))
        }
        RepairCommand::DeleteActivityLog { sd, instance } => {
            scanner.delete_activity_log(SdId(sd), &instance).await?;
            print_json(&json!({ "deleted_activity_log": instance, "sd": sd }))
        }
    }
}

async fn run_backup(app: &App, command: BackupCommand) -> Result<()> {
    let backups = &app.backups;
    match command {
        BackupCommand::Create {
            sd,
            notes,
            description,
        } => {
            let metadata = if notes.is_empty() {
                backups.create_manual_backup(SdId(sd), description).await?
            } else {
                backups
                    .create_pre_operation_snapshot(SdId(sd), &notes, description)
                    .await?
            };
            print_json(&metadata)
        }
        BackupCommand::List => print_json(&backups.list_backups().await?),
        BackupCommand::Restore {
            backup_id,
            target,
            new_identity,
        } => {
            let identity = if new_identity {
                RestoreIdentity::New
            } else {
                RestoreIdentity::Preserve
            };
            let target = absolute_str(&target)?;
            print_json(&backups.restore_from_backup(&backup_id, &target, identity).await?)
        }
        BackupCommand::Delete { backup_id } => {
            backups.delete_backup(&backup_id).await?;
            print_json(&json!({ "deleted": backup_id }))
        }
        BackupCommand::Cleanup => {
            let deleted = backups.cleanup_old_snapshots().await?;
            print_json(&json!({ "deleted": deleted }))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,sd_admin=debug,sd_core=debug"
    } else {
        "info,sd_admin=info,sd_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = match args.home {
        Some(home) => Config::with_home(home),
        None => Config::from_env()?,
    };
    let app = App::open(&config).await?;

    // Interrupted moves are resumed before anything else touches the index
    if !matches!(args.command, Command::Recover) {
        match app.coordinator.recover_incomplete_moves().await {
            Ok(report) if !report.stale.is_empty() => {
                warn!("{} stale move(s) need attention; see `sd-admin moves --stale`", report.stale.len());
            }
            Ok(_) => {}
            Err(e) => warn!("Move recovery failed: {}", e),
        }
    }

    run(&app, args.command).await?;
    info!("Done");
    Ok(())
}
