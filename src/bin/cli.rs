#![cfg(not(tarpaulin_include))]

use clap::{Parser, Subcommand};
use log::info;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use trialsheet::downloader::{ExportFormat, render};
use trialsheet::loader::{ExperimentUpload, load_grid};
use trialsheet::login::{NewUser, create_location, register_user};
use trialsheet::model::{EntryStatus, Role, Scope};
use trialsheet::saving::{load_snapshot, save_snapshot};
use trialsheet::{EntryError, Result, Store};

/// Offline administration for a trialsheet database
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// SQLite database file
    #[arg(long, global = true, env = "TRIALSHEET_DB", default_value = "trialsheet.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the schema, optionally with a first super admin
    Init {
        #[arg(long)]
        admin: Option<String>,

        #[arg(long, env = "TRIALSHEET_PASSWORD")]
        password: Option<String>,
    },

    /// Add a location
    AddLocation { name: String },

    /// Add a user account
    AddUser {
        username: String,

        #[arg(long, env = "TRIALSHEET_PASSWORD")]
        password: String,

        /// super_admin, admin or user
        #[arg(long, default_value = "user")]
        role: String,

        #[arg(long)]
        location: Option<i64>,
    },

    /// Replace a location's experiment with a CSV or XLSX layout
    Import {
        file: PathBuf,

        #[arg(long)]
        location: i64,
    },

    /// Write a location's wide grid to a CSV or XLSX file
    Export {
        file: PathBuf,

        #[arg(long)]
        location: i64,

        /// Draft, Submitted or all
        #[arg(long, default_value = "all")]
        status: String,
    },

    /// Save a compressed snapshot of a location
    Backup {
        file: PathBuf,

        #[arg(long)]
        location: i64,
    },

    /// Replace a location's data with a snapshot
    Restore {
        file: PathBuf,

        #[arg(long)]
        location: i64,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn execute(cli: Cli) -> Result<()> {
    let store = Store::open(&cli.db)?;

    match cli.command {
        Command::Init { admin, password } => {
            if let Some(username) = admin {
                let password = password.ok_or_else(|| {
                    EntryError::Validation("--password is required with --admin".into())
                })?;
                register_user(
                    &store,
                    &NewUser {
                        username,
                        password,
                        role: Role::SuperAdmin,
                        location_id: None,
                    },
                )?;
            }
            println!("Database ready at {}", cli.db.display());
        }
        Command::AddLocation { name } => {
            let location = create_location(&store, &name)?;
            println!("Location {} created with id {}", location.name, location.id);
        }
        Command::AddUser {
            username,
            password,
            role,
            location,
        } => {
            let user = register_user(
                &store,
                &NewUser {
                    username,
                    password,
                    role: role.parse()?,
                    location_id: location,
                },
            )?;
            println!("User {} ({}) created", user.username, user.role);
        }
        Command::Import { file, location } => {
            let upload = ExperimentUpload::from_grid(&load_grid(&file)?)?;
            store.replace_experiment(Scope::new(location), &upload)?;
            println!(
                "Imported {}: {} treatments, {} traits",
                upload.experiment_id,
                upload.treatments.len(),
                upload.traits.len()
            );
        }
        Command::Export {
            file,
            location,
            status,
        } => {
            let status = match status.as_str() {
                s if s.eq_ignore_ascii_case("all") => None,
                s => Some(s.parse::<EntryStatus>()?),
            };
            let format = ExportFormat::from_name(&extension(&file))?;
            let grid = store.observations().export_wide(Scope::new(location), status)?;
            std::fs::write(&file, render(&grid, format)?)?;
            println!("Wrote {} rows to {}", grid.rows.len(), file.display());
        }
        Command::Backup { file, location } => {
            let snapshot = store.snapshot(Scope::new(location))?;
            save_snapshot(&snapshot, &file)?;
            info!("backup of location {} written", location);
            println!(
                "Saved {} treatments and {} observations to {}",
                snapshot.treatments.len(),
                snapshot.observations.len(),
                file.display()
            );
        }
        Command::Restore { file, location } => {
            let snapshot = load_snapshot(&file)?;
            store.restore(Scope::new(location), &snapshot)?;
            println!("Restored location {} from {}", location, file.display());
        }
    }

    Ok(())
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_string()
}
