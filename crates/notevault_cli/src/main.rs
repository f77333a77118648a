//! Command-line inspector for a notevault workspace.
//!
//! # Responsibility
//! - Open a workspace (running crash recovery) and report what happened.
//! - Offer listing, search and backend migration for local maintenance.

use clap::{Parser, Subcommand, ValueEnum};
use log::info;
use notevault_core::{
    init_logging, BackendKind, CoreConfig, ListScope, NoteService, RecoveryState, VaultSession,
};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "notevault")]
#[command(version, about = "Inspect and maintain a notevault workspace", long_about = None)]
struct Args {
    /// Workspace root directory
    #[arg(short, long, default_value = ".")]
    root: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Write logs into this absolute directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the recovery report and workspace counts (default)
    Status,
    /// List committed folders and notes
    List,
    /// Search plain notes for all words of QUERY
    Search { query: String },
    /// Move the workspace to another storage backend
    Migrate {
        #[arg(long, value_enum)]
        to: Backend,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Backend {
    Document,
    Relational,
}

impl From<Backend> for BackendKind {
    fn from(value: Backend) -> Self {
        match value {
            Backend::Document => BackendKind::Document,
            Backend::Relational => BackendKind::Relational,
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(code) => code,
        Err(message) => {
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<ExitCode, String> {
    if let Some(dir) = &args.log_dir {
        init_logging(&args.log_level, dir).map_err(|err| err.to_string())?;
    }
    let config = CoreConfig::load(&args.root).map_err(|err| err.to_string())?;
    let mut service = NoteService::open(&args.root, &config).map_err(|err| err.to_string())?;
    info!(
        "event=cli_open module=cli status=ok backend={}",
        service.backend()
    );

    match args.command.unwrap_or(Command::Status) {
        Command::Status => {
            let report = service.recovery();
            println!("backend={}", report.kind);
            println!("recovery={:?}", report.outcome());
            for notice in &report.notices {
                println!("notice={notice:?}");
            }
            for path in &report.quarantined {
                println!("quarantined={}", path.display());
            }
            let workspace = service.workspace();
            println!(
                "folders={} notes={} mentions={}",
                workspace.folders.len(),
                workspace.notes.len(),
                workspace.mentions.len()
            );
            if report.outcome() == RecoveryState::Failed {
                return Ok(ExitCode::from(2));
            }
        }
        Command::List => {
            let cursor = service
                .list(ListScope::All)
                .map_err(|err| err.to_string())?;
            for entry in cursor {
                let entry = entry.map_err(|err| err.to_string())?;
                let title = match (&entry.title, entry.locked) {
                    (Some(title), _) => title.as_str(),
                    (None, true) => "[locked]",
                    (None, false) => "[sealed]",
                };
                println!("{:?}\t{}\t{}", entry.kind, entry.id, title);
            }
        }
        Command::Search { query } => {
            let session = VaultSession::new();
            for hit in service.search(&session, &query) {
                println!("{}\t{}", hit.id, hit.title);
            }
        }
        Command::Migrate { to } => {
            let report = service
                .migrate_to(to.into())
                .map_err(|err| err.to_string())?;
            println!(
                "migrated {} -> {} version={} folders={} notes={} verified={} duration_ms={}",
                report.source,
                report.target,
                report.version,
                report.folders,
                report.notes,
                report.verified_checksums,
                report.duration_ms
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}
