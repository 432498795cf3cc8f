//! Entry point for repo2obj.
//!
//! Simple flow: parse args → read ticket UUID → open store → assemble ELF →
//! write object file.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use urepo::config::Config;
use urepo::store::Store;
use urepo::{ticket, writer};

fn main() -> Result<()> {
    let config = Config::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let ticket_id = ticket::read_ticket_file(&config.ticket)?;
    info!("ticket {}: {}", config.ticket.display(), ticket_id);

    let store = Store::open(&config.repo_path())?;
    let object = writer::assemble(&store, ticket_id)?;

    std::fs::write(&config.output, &object)
        .with_context(|| format!("failed to write {}", config.output.display()))?;
    info!(
        "wrote {} ({} bytes)",
        config.output.display(),
        object.len()
    );
    Ok(())
}
