//! SafeCare administration tool
//!
//! Runs maintenance passes over a JSON snapshot of the document store.
//!
//! ## Usage
//!
//! ```bash
//! # Repair every mirror, writing the result to a new snapshot
//! safecare-admin reconcile --snapshot db.json --output repaired.json
//!
//! # Repair one patient in place
//! safecare-admin reconcile --snapshot db.json --patient p123
//!
//! # Tag legacy creators and key positional collections
//! safecare-admin --config safecare.toml migrate --snapshot db.json
//!
//! # List (and optionally prune) access entries without a canonical record
//! safecare-admin orphans --snapshot db.json --prune
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use safecare_access::{Config, MemoryStore, PatientId, PatientService};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "safecare-admin")]
#[command(about = "Maintenance passes for SafeCare patient data")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "SAFECARE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Copy canonical records to every holder's mirror and drop stale mirrors
    Reconcile {
        /// Store snapshot (JSON)
        #[arg(long)]
        snapshot: PathBuf,

        /// Only this patient
        #[arg(long)]
        patient: Option<String>,

        /// Where to write the result (defaults to the input snapshot)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Tag legacy creator references and key positional collections
    Migrate {
        #[arg(long)]
        snapshot: PathBuf,

        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Report access entries and government ID claims whose canonical record is missing
    Orphans {
        #[arg(long)]
        snapshot: PathBuf,

        /// Revoke the orphaned entries
        #[arg(long)]
        prune: bool,

        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("safecare_access=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => Config::default(),
    };

    match args.command {
        Command::Reconcile {
            snapshot,
            patient,
            output,
        } => {
            let (store, service) = open(&snapshot, config).await?;
            match patient {
                Some(id) => {
                    let report = service
                        .reconciler()
                        .reconcile(&PatientId::from(id.as_str()))
                        .await?;
                    info!(
                        patient_id = %id,
                        written = report.mirrors_written.len(),
                        removed = report.mirrors_removed.len(),
                        "Reconciled"
                    );
                }
                None => {
                    let report = service.migrator().reconcile_all().await?;
                    for (patient_id, e) in &report.failed {
                        error!(patient_id = %patient_id, error = %e, "Reconcile failed");
                    }
                    info!(
                        reconciled = report.reconciled.len(),
                        failed = report.failed.len(),
                        "Reconcile pass complete"
                    );
                }
            }
            save(&store, output.as_deref().unwrap_or(&snapshot)).await?;
        }

        Command::Migrate { snapshot, output } => {
            let (store, service) = open(&snapshot, config).await?;
            let migrator = service.migrator();

            let creators = migrator.migrate_creator_refs().await?;
            for patient_id in &creators.unresolved {
                warn!(patient_id = %patient_id, "Legacy creator has no holder to pin");
            }
            let keyed = migrator.migrate_positional_collections().await?;
            info!(
                rewritten = creators.rewritten.len(),
                pinned = creators.pinned.len(),
                keyed = keyed.entries_converted(),
                "Migration complete"
            );
            save(&store, output.as_deref().unwrap_or(&snapshot)).await?;
        }

        Command::Orphans {
            snapshot,
            prune,
            output,
        } => {
            let (store, service) = open(&snapshot, config).await?;
            let migrator = service.migrator();

            let orphans = migrator.find_orphaned_access_entries().await?;
            for (account_id, patient_id) in &orphans {
                println!("{account_id}\t{patient_id}");
            }
            let claims = migrator.find_orphaned_government_id_claims().await?;
            for (government_id, patient_id) in &claims {
                println!("governmentId:{government_id}\t{patient_id}");
            }
            if prune && !(orphans.is_empty() && claims.is_empty()) {
                let pruned = migrator.prune_orphaned_access_entries().await?;
                let released = migrator.prune_orphaned_government_id_claims().await?;
                info!(pruned, released, "Pruned orphaned entries");
                save(&store, output.as_deref().unwrap_or(&snapshot)).await?;
            }
        }
    }

    Ok(())
}

async fn open(
    snapshot: &Path,
    config: Config,
) -> anyhow::Result<(Arc<MemoryStore>, PatientService)> {
    let store = Arc::new(
        MemoryStore::load_snapshot(snapshot)
            .await
            .with_context(|| format!("loading snapshot {}", snapshot.display()))?,
    );
    info!(snapshot = %snapshot.display(), "Snapshot loaded");
    let service = PatientService::new(store.clone(), config);
    Ok((store, service))
}

async fn save(store: &MemoryStore, path: &Path) -> anyhow::Result<()> {
    store
        .save_snapshot(path)
        .await
        .with_context(|| format!("writing snapshot {}", path.display()))?;
    info!(path = %path.display(), "Snapshot written");
    Ok(())
}
