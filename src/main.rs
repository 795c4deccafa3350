use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use adportal::config::PortalConfig;
use adportal::session::SessionId;
use adportal::Portal;

#[derive(Parser)]
#[command(
    name = "adportal",
    about = "Ad-gated captive portal: time-bounded network access over RADIUS CoA",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (TOML). Falls back to /etc/adportal/adportal.toml, then defaults.
    #[arg(long, global = true, env = "ADPORTAL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + expiry sweeper)
    Serve {
        /// Override server.bind
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run one expiry sweep now and print what it did
    Sweep,

    /// Show a session's status and remaining time
    Status {
        /// Session id
        session_id: String,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Terminate a session and disconnect the device at the NAS
    Disconnect {
        /// Session id
        session_id: String,
    },

    /// Delete ad impressions older than the retention window
    PurgeImpressions {
        /// Override sweeper.impression_retention_days
        #[arg(long)]
        days: Option<u32>,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn init_tracing(config: &PortalConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = PortalConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "starting adportal daemon");
            adportal::serve(config).await?;
        }
        Commands::Sweep => {
            let portal = Portal::build(config)?;
            match portal.sweeper().sweep_once().await? {
                Some(report) => println!(
                    "scanned: {}  expired: {}  failed: {}",
                    report.scanned, report.expired, report.failed
                ),
                None => println!("A sweep is already running."),
            }
        }
        Commands::Status { session_id, json } => {
            let session_id: SessionId = session_id.parse()?;
            let portal = Portal::build(config)?;
            let report = portal.manager.check_status(session_id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Session:    {}", report.session_id);
                println!("Device:     {}", report.mac_address);
                println!("Status:     {}", report.status);
                if let Some(remaining) = report.remaining_seconds {
                    println!("Remaining:  {}m {:02}s", remaining / 60, remaining % 60);
                }
                if let Some(start) = report.session_start {
                    println!("Started:    {}", start.to_rfc3339());
                }
                if let Some(end) = report.session_end {
                    println!("Ended:      {}", end.to_rfc3339());
                }
                println!("Data used:  {:.1} MB", report.data_used_mb);
            }
        }
        Commands::Disconnect { session_id } => {
            let session_id: SessionId = session_id.parse()?;
            let portal = Portal::build(config)?;
            portal.manager.disconnect_by_request(session_id).await?;
            println!("Session {} terminated.", session_id);
        }
        Commands::PurgeImpressions { days } => {
            let days = days.unwrap_or(config.sweeper.impression_retention_days);
            let portal = Portal::build(config)?;
            let removed = portal.manager.purge_impressions(days).await?;
            println!("Removed {} impression(s) older than {} days.", removed, days);
        }
        Commands::Config => {
            for secret in [&mut config.radius.secret, &mut config.token.secret] {
                if !secret.is_empty() {
                    *secret = "<redacted>".to_string();
                }
            }
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
