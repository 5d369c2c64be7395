//! lwstore CLI - maintenance front-end for descriptor tables

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use lwstore::config::{self, HostConfig};
use lwstore::ui::{self, DescriptorRow, Icons};
use lwstore::{CancellationToken, Descriptor, StorageHost, StorageManager};
use futures::StreamExt;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "lwstore")]
#[command(version)]
#[command(about = "Lightweight transactional blob storage - keyed binary descriptors over SQL")]
#[command(long_about = r#"
lwstore manages descriptor tables: one row per id, owned by a user, carrying
a small binary payload.

Example usage:
  lwstore init
  lwstore create --owner u1
  lwstore put --id <id> --file payload.bin
  lwstore cleanup --older-than-secs 86400
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Table to operate on (defaults to the first configured store)
    #[arg(short, long, global = true)]
    table: Option<String>,

    /// Emit JSON instead of human-readable output
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config and create the schema
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    #[command(flatten)]
    Store(StoreCommand),
}

/// Commands that operate on one configured table
#[derive(Subcommand)]
enum StoreCommand {
    /// Create an empty descriptor
    Create {
        /// Owning user id
        #[arg(short, long)]
        owner: String,

        /// Explicit descriptor id (generated when omitted)
        #[arg(long)]
        id: Option<String>,
    },

    /// Show a descriptor
    Get {
        #[arg(long, conflicts_with = "owner", required_unless_present = "owner")]
        id: Option<String>,

        #[arg(short, long)]
        owner: Option<String>,

        /// Write the payload to this file
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Replace a descriptor's payload with a file's contents
    Put {
        #[arg(long)]
        id: String,

        #[arg(short, long)]
        file: PathBuf,
    },

    /// Remove a descriptor
    Rm {
        #[arg(long)]
        id: String,
    },

    /// List every descriptor
    List,

    /// Delete descriptors created before a cutoff
    Cleanup {
        /// RFC 3339 cutoff timestamp
        #[arg(long, conflicts_with = "older_than_secs", required_unless_present = "older_than_secs")]
        before: Option<DateTime<Utc>>,

        /// Age in seconds
        #[arg(long)]
        older_than_secs: Option<i64>,
    },

    /// Show table statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config_path = cli.config.clone().unwrap_or_else(config::default_config_path);

    let command = match cli.command {
        Commands::Init { force } => return run_init(&config_path, force, cli.json).await,
        Commands::Store(command) => command,
    };

    let host_config = config::load_config(Some(&config_path))?.unwrap_or_default();
    let host = StorageHost::init(&host_config).await?;
    let table = match &cli.table {
        Some(t) => t.clone(),
        None => host
            .tables()
            .next()
            .map(str::to_string)
            .context("no tables configured")?,
    };
    let manager = host
        .manager(&table)
        .with_context(|| format!("table {table} is not configured"))?;

    // Ctrl-C cancels the in-flight operation
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let result = run(command, &manager, &cancel, cli.json).await;
    host.teardown();
    result
}

async fn run_init(config_path: &PathBuf, force: bool, json: bool) -> anyhow::Result<()> {
    let host_config = HostConfig::default();
    config::write_config(config_path, &host_config, force)?;
    let host = StorageHost::init(&host_config).await?;

    if json {
        let tables: Vec<&str> = host.tables().collect();
        println!(
            "{}",
            serde_json::json!({ "config": config_path, "tables": tables })
        );
    } else {
        ui::success(&format!("Wrote {}", config_path.display()));
        for store in &host_config.stores {
            ui::info(
                &format!("{} {}", Icons::DATABASE, store.table),
                &store.database.display().to_string(),
            );
        }
    }
    host.teardown();
    Ok(())
}

async fn run(command: StoreCommand, manager: &StorageManager, cancel: &CancellationToken, json: bool) -> anyhow::Result<()> {
    match command {
        StoreCommand::Create { owner, id } => {
            let mut descriptor = manager.create_descriptor(&owner, id.as_deref(), cancel).await?;
            print_descriptor(&descriptor, json)?;
            descriptor.release(cancel).await?;
        }

        StoreCommand::Get { id, owner, out } => {
            let found = match (id, owner) {
                (Some(id), _) => manager.get_descriptor_by_id(&id, cancel).await?,
                (None, Some(owner)) => manager.get_descriptor_by_owner(&owner, cancel).await?,
                (None, None) => anyhow::bail!("either --id or --owner is required"),
            };
            let Some(mut descriptor) = found else {
                if json {
                    println!("{}", serde_json::json!({ "found": false }));
                } else {
                    ui::warn("No descriptor found.");
                }
                return Ok(());
            };

            if let Some(path) = out {
                std::fs::write(&path, descriptor.data()?)?;
                if !json {
                    ui::success(&format!("Payload written to {}", path.display()));
                }
            }
            print_descriptor(&descriptor, json)?;
            descriptor.release(cancel).await?;
        }

        StoreCommand::Put { id, file } => {
            let bytes = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            let mut descriptor = manager
                .get_descriptor_by_id(&id, cancel)
                .await?
                .with_context(|| format!("descriptor {id} not found"))?;
            descriptor.set_data(bytes)?;
            descriptor.persist(cancel).await?;
            print_descriptor(&descriptor, json)?;
            descriptor.release(cancel).await?;
        }

        StoreCommand::Rm { id } => {
            manager.remove_by_id(&id, cancel).await?;
            if json {
                println!("{}", serde_json::json!({ "removed": id }));
            } else {
                ui::success(&format!("{} Removed {}", Icons::DEL, id));
            }
        }

        StoreCommand::List => {
            let mut rows = Vec::new();
            let mut entries = Vec::new();
            let mut all = manager.enumerate_all(cancel.clone());
            while let Some(lease) = all.next().await {
                let mut lease = lease?;
                if json {
                    entries.push(descriptor_json(&lease)?);
                } else {
                    rows.push(DescriptorRow::from_descriptor(&lease)?);
                }
                lease.release(cancel).await?;
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if rows.is_empty() {
                ui::warn("Table is empty.");
            } else {
                println!("{}", ui::descriptor_table(&rows));
            }
        }

        StoreCommand::Cleanup { before, older_than_secs } => {
            let removed = match (before, older_than_secs) {
                (Some(cutoff), _) => manager.cleanup_older_than(cutoff, cancel).await?,
                (None, Some(secs)) => {
                    manager
                        .cleanup_older_than_age(chrono::Duration::seconds(secs), cancel)
                        .await?
                }
                (None, None) => anyhow::bail!("either --before or --older-than-secs is required"),
            };
            if json {
                println!("{}", serde_json::json!({ "removed": removed }));
            } else {
                ui::success(&format!("{} Removed {} descriptor(s)", Icons::BROOM, removed));
            }
        }

        StoreCommand::Stats => {
            let count = manager.count(cancel).await?;
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "table": manager.table(),
                        "dialect": manager.dialect().as_str(),
                        "descriptors": count,
                        "key_size": manager.key_size(),
                        "max_data_size": manager.max_data_size(),
                    })
                );
            } else {
                ui::section(&format!("{} {}", Icons::STATS, manager.table()));
                ui::summary_row("Dialect:", manager.dialect().as_str());
                ui::summary_row("Descriptors:", &count.to_string());
                ui::summary_row("Key size:", &manager.key_size().to_string());
                ui::summary_row("Max payload:", &ui::human_bytes(manager.max_data_size()));
            }
        }
    }

    Ok(())
}

fn descriptor_json(descriptor: &Descriptor) -> lwstore::Result<serde_json::Value> {
    Ok(serde_json::json!({
        "id": descriptor.id()?,
        "owner": descriptor.owner()?,
        "size": descriptor.len()?,
        "created": descriptor.created()?,
        "last_modified": descriptor.last_modified()?,
    }))
}

fn print_descriptor(descriptor: &Descriptor, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&descriptor_json(descriptor)?)?);
        return Ok(());
    }

    ui::header(&format!("Descriptor {}", descriptor.id()?));
    ui::summary_row(&format!("{} Owner:", Icons::PERSON), descriptor.owner()?);
    ui::summary_row(&format!("{} Size:", Icons::PACKAGE), &ui::human_bytes(descriptor.len()?));
    ui::summary_row(&format!("{} Created:", Icons::CLOCK), &descriptor.created()?.to_rfc3339());
    ui::summary_row(
        &format!("{} Modified:", Icons::CLOCK),
        &descriptor.last_modified()?.to_rfc3339(),
    );
    if descriptor.len()? > 0 {
        ui::summary_row(&format!("{} Preview:", Icons::KEY), &ui::dim(&preview(descriptor.data()?)));
    }
    Ok(())
}

/// First bytes of a payload as hex
fn preview(data: &[u8]) -> String {
    let mut hex: String = data.iter().take(16).map(|b| format!("{b:02x}")).collect();
    if data.len() > 16 {
        hex.push('…');
    }
    hex
}
