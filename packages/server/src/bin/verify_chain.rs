// Offline audit-chain verifier.
//
// Exits non-zero when the chain is broken, printing the first offending
// sequence number.

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;

use scribe_core::common::logging;
use scribe_core::kernel::audit::{AuditLog, ChainVerification, PgAuditLog};
use scribe_core::Config;

#[derive(Parser)]
#[command(name = "verify_chain", about = "Verify the audit log hash chain")]
struct Args {
    /// Sequence number to start from.
    #[arg(long, default_value_t = 1)]
    start_seq: i64,

    /// Records fetched per batch.
    #[arg(long, default_value_t = 1000)]
    batch_size: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_env().context("Failed to load configuration")?;
    logging::init(&config);

    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    let audit = PgAuditLog::new(pool);
    match audit.verify_chain(args.start_seq, args.batch_size).await? {
        ChainVerification::Valid => {
            println!("audit chain valid from sequence {}", args.start_seq);
            Ok(())
        }
        ChainVerification::BrokenAt(sequence) => {
            eprintln!("audit chain BROKEN at sequence {}", sequence);
            std::process::exit(1);
        }
    }
}
