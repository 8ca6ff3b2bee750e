//! Lemur signer - reads a CSR on stdin, prints the signed PEM chain.
//!
//! Run by butler as a certificate signer subprocess. The API token and
//! endpoint come from the `KEY` and `ENDPOINT` environment variables.

use anyhow::{ensure, Context, Result};
use clap::Parser;
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;

use butler::signer::lemur::{LemurClient, SigningRequest};

#[derive(Parser)]
#[command(name = "lemur-signer")]
#[command(about = "Sign a CSR read from stdin through the Lemur API")]
struct Cli {
    /// Certificate common name, also used as the DNS SAN.
    #[arg(long)]
    common_name: String,

    /// Lemur authority name.
    #[arg(long)]
    authority: String,

    /// Certificate owner (email).
    #[arg(long)]
    owner: String,

    #[arg(long, default_value_t = 1)]
    valid_years: u32,

    /// Ask Lemur to send expiry notifications.
    #[arg(long)]
    notify: bool,

    /// Skip TLS verification of the Lemur endpoint.
    #[arg(long)]
    insecure: bool,

    /// Lemur API token.
    #[arg(long, env = "KEY", hide_env_values = true)]
    key: String,

    /// Lemur certificates endpoint.
    #[arg(long, env = "ENDPOINT")]
    endpoint: String,

    /// Debug logging on stderr.
    #[arg(long, env = "DEBUG_SIGNER")]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut csr = String::new();
    tokio::io::stdin()
        .read_to_string(&mut csr)
        .await
        .context("Failed to read CSR from stdin")?;
    ensure!(!csr.trim().is_empty(), "no CSR on stdin");

    let client = LemurClient::new(&cli.endpoint, &cli.key, cli.insecure)
        .context("Failed to create lemur client")?;
    let request = SigningRequest::new(
        csr,
        &cli.common_name,
        &cli.owner,
        &cli.authority,
        cli.valid_years,
        cli.notify,
    );
    let pem = client
        .sign(&request)
        .await
        .with_context(|| format!("Failed to sign certificate for {}", cli.common_name))?;

    print!("{pem}");
    Ok(())
}
