use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use shared::domain::TenantId;
use storage::{now_ms, Storage};

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/sessions.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show every lease with its owner and expiry.
    ListLeases,
    /// Drop a tenant's lease regardless of owner.
    ForceRelease { tenant_id: String },
    /// Delete leases whose TTL has run out.
    PurgeExpired,
    /// Remove a tenant's stored credentials so it pairs again.
    ClearCredentials { tenant_id: String },
}

fn format_ms(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::ListLeases => {
            let now = now_ms();
            let leases = storage.list_leases().await?;
            if leases.is_empty() {
                println!("no leases");
            }
            for lease in leases {
                println!(
                    "tenant={} worker={} acquired_at={} expires_at={}{}",
                    lease.tenant_id,
                    lease.worker_id,
                    format_ms(lease.acquired_at_ms),
                    format_ms(lease.expires_at_ms()),
                    if lease.is_expired(now) { " (expired)" } else { "" }
                );
            }
        }
        Command::ForceRelease { tenant_id } => {
            let tenant_id = TenantId::new(tenant_id);
            match storage.force_release_lease(&tenant_id).await? {
                Some(previous) => println!("released tenant={tenant_id} previous_owner={previous}"),
                None => println!("tenant={tenant_id} had no lease"),
            }
        }
        Command::PurgeExpired => {
            let purged = storage.purge_expired_leases(now_ms()).await?;
            println!("purged {purged} expired lease(s)");
        }
        Command::ClearCredentials { tenant_id } => {
            let tenant_id = TenantId::new(tenant_id);
            let removed = storage.clear_credential_blobs(&tenant_id).await?;
            println!("cleared {removed} credential row(s) for tenant={tenant_id}");
        }
    }

    Ok(())
}
