//! CLI tool for managing customer domain mappings
//!
//! Usage:
//!   vanityproxy-domains set <domain> <customer-id>
//!   vanityproxy-domains get <domain>
//!   vanityproxy-domains delete <domain>
//!   vanityproxy-domains list [--json]
//!
//! Writes go straight to the database. A running proxy keeps serving cached
//! lookups until they are evicted; use the admin API for live changes.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use vanityproxy::{normalize_host, DomainMapping, SqliteStore, Store};

/// CLI tool for managing customer domain mappings
#[derive(Parser, Debug)]
#[command(name = "vanityproxy-domains")]
#[command(author = "VanityProxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "Manage customer domain mappings for VanityProxy")]
struct Args {
    /// Database path
    #[arg(long, env = "DB_PATH", default_value = "./data/vanity.db")]
    db_path: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Map a domain to a customer, replacing any existing mapping
    Set {
        /// Domain name (e.g., shop.example.com)
        domain: String,

        /// Customer identifier
        customer_id: String,
    },

    /// Show the customer a domain is mapped to
    Get {
        /// Domain name
        domain: String,
    },

    /// Delete a domain mapping
    Delete {
        /// Domain name
        domain: String,
    },

    /// List all mappings
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let store = SqliteStore::open(&args.db_path)
        .with_context(|| format!("Failed to open store at {}", args.db_path.display()))?;

    match args.command {
        Commands::Set {
            domain,
            customer_id,
        } => {
            let domain = parse_domain(&domain)?;
            if customer_id.is_empty() {
                bail!("Customer ID must not be empty");
            }

            store.set_domain(&domain, &customer_id).await?;
            println!("Mapped {} to {}", domain, customer_id);
        }

        Commands::Get { domain } => {
            let domain = parse_domain(&domain)?;

            match store.get_domain(&domain).await? {
                Some(customer_id) => println!("{}", customer_id),
                None => {
                    eprintln!("No mapping found for {}", domain);
                    std::process::exit(1);
                }
            }
        }

        Commands::Delete { domain } => {
            let domain = parse_domain(&domain)?;

            if store.get_domain(&domain).await?.is_none() {
                eprintln!("No mapping found for {}", domain);
                std::process::exit(1);
            }

            store.delete_domain(&domain).await?;
            println!("Deleted mapping for {}", domain);
        }

        Commands::List { json } => {
            let mut mappings: Vec<DomainMapping> = store
                .list_domains()
                .await?
                .into_iter()
                .map(|(domain, customer_id)| DomainMapping {
                    domain,
                    customer_id,
                })
                .collect();
            mappings.sort_by(|a, b| a.domain.cmp(&b.domain));

            if json {
                println!("{}", serde_json::to_string_pretty(&mappings)?);
                return Ok(());
            }

            if mappings.is_empty() {
                println!("No mappings found");
                return Ok(());
            }

            println!("{:<50} {:<30}", "DOMAIN", "CUSTOMER_ID");
            println!("{}", "-".repeat(81));

            for mapping in &mappings {
                println!("{:<50} {:<30}", mapping.domain, mapping.customer_id);
            }

            println!("\nTotal: {} mapping(s)", mappings.len());
        }
    }

    Ok(())
}

fn parse_domain(raw: &str) -> Result<String> {
    normalize_host(raw).with_context(|| format!("Invalid domain: {:?}", raw))
}
