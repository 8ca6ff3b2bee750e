//! Butler CLI - apply configuration and run commands across a BMC fleet.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use butler::app::spawn_signal_handler;
use butler::inventory::{Inventory, Scope};
use butler::{App, AssetSelector, ButlerConfig, Overrides};

/// Butler - BMC and chassis fleet configuration.
#[derive(Parser)]
#[command(name = "butler", version)]
#[command(about = "Apply configuration and run commands across BMCs and chassis")]
struct Cli {
    /// Tool configuration file.
    #[arg(long, default_value = "/etc/bmcbutler/bmcbutler.yml", env = "BUTLER_CONFIG")]
    config: PathBuf,

    /// Debug logging.
    #[arg(long, conflicts_with = "trace")]
    debug: bool,

    /// Trace logging, also enables signer debug output.
    #[arg(long)]
    trace: bool,

    /// Log as JSON lines.
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply the device configuration.
    Configure {
        #[command(flatten)]
        run: RunArgs,
    },

    /// Run a command on each device.
    Execute {
        /// Command to run: bmc-reset or powercycle.
        #[arg(long)]
        command: String,

        #[command(flatten)]
        run: RunArgs,
    },
}

/// Which assets to act on.
#[derive(Args)]
#[group(required = true, multiple = false)]
struct Selection {
    /// Every asset in the inventory.
    #[arg(long)]
    all: bool,

    /// Chassis only.
    #[arg(long)]
    chassis: bool,

    /// Servers only.
    #[arg(long)]
    servers: bool,

    /// These serials.
    #[arg(long, value_delimiter = ',')]
    serials: Vec<String>,

    /// These BMC addresses, bypassing the inventory.
    #[arg(long, value_delimiter = ',')]
    ips: Vec<String>,
}

impl Selection {
    fn selector(&self) -> AssetSelector {
        if !self.ips.is_empty() {
            AssetSelector::ips(self.ips.clone())
        } else if !self.serials.is_empty() {
            AssetSelector::serials(self.serials.clone())
        } else if self.chassis {
            AssetSelector::scope(Scope::Chassis)
        } else if self.servers {
            AssetSelector::scope(Scope::Servers)
        } else {
            AssetSelector::all()
        }
    }
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    selection: Selection,

    /// Log what would be done without connecting.
    #[arg(long)]
    dryrun: bool,

    /// Number of concurrent workers.
    #[arg(long)]
    butlers: Option<usize>,

    /// Managed locations, replaces the configured list.
    #[arg(long, value_delimiter = ',')]
    locations: Option<Vec<String>>,

    /// Only apply these resources.
    #[arg(long, value_delimiter = ',')]
    resources: Option<Vec<String>>,

    /// Act on assets regardless of location.
    #[arg(long)]
    ignore_location: bool,
}

impl RunArgs {
    fn overrides(&self, trace: bool) -> Overrides {
        Overrides {
            butlers: self.butlers,
            locations: self.locations.clone(),
            resources: self.resources.clone(),
            dry_run: self.dryrun,
            ignore_location: self.ignore_location,
            ips: self.selection.ips.clone(),
            trace,
        }
    }
}

fn init_tracing(cli: &Cli) {
    let level = if cli.trace {
        "trace"
    } else if cli.debug {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let run = match &cli.command {
        Commands::Configure { run } | Commands::Execute { run, .. } => run,
    };
    let config = ButlerConfig::load(&cli.config, &run.overrides(cli.trace)).await?;
    let inventory = Inventory::build(&config.inventory, run.selection.selector());

    let app = App::new(config)?;
    let signals = spawn_signal_handler(app.stop_token());

    let summary = match &cli.command {
        Commands::Configure { .. } => app.configure(inventory).await?,
        Commands::Execute { command, .. } => app.execute(inventory, command).await,
    };
    signals.abort();

    info!(
        run_id = %summary.run_id,
        dispatched = summary.dispatched,
        handled = summary.handled,
        unroutable = summary.unroutable,
        interrupted = summary.interrupted,
        "Done"
    );
    Ok(())
}
