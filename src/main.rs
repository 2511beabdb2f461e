use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, bail};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use understudy::bot::{self, Seat};
use understudy::channel::Gateway;
use understudy::channel::telegram::TelegramApi;
use understudy::config::{DEFAULT_CONFIG_FILE, FleetConfig};
use understudy::fleet::FleetEntry;
use understudy::health::LivePrimaryProbe;
use understudy::identity::IdentityStore;
use understudy::process::{OsProcessManager, ProcessManager};
use understudy::promotion::Promoter;
use understudy::supervisor::Supervisor;
use understudy::supervisor::instance::InstanceManifest;
use understudy::telemetry;

/// Understudy: primary/standby failover for a fleet of Telegram bots.
#[derive(Parser)]
#[command(name = "understudy", version, about)]
struct Cli {
    /// Path to the fleet config file.
    #[arg(short = 'c', long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a bot process (the primary seat, or a launched instance).
    Run {
        /// Instance directory created by `launch`.
        #[arg(long)]
        instance: Option<PathBuf>,
    },

    /// Launch a standby with the given credential and wait for it to settle.
    Launch {
        credential: String,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List fleet entries with current status.
    Fleet {
        #[arg(long)]
        json: bool,
    },

    /// Print the identity record.
    Identity,

    /// Promote this seat (or an instance) to primary if the primary is down.
    Promote {
        #[arg(long)]
        instance: Option<PathBuf>,
    },

    /// Stop a launched standby.
    Stop { clone_id: String },

    /// Restart a launched standby from its instance directory.
    Relaunch { clone_id: String },

    /// Print a systemd unit for a launched standby.
    Unit { clone_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    telemetry::init();

    let cli = Cli::parse();
    let config = FleetConfig::load(&cli.config)?;

    match cli.command {
        Command::Run { instance } => {
            let seat = match &instance {
                Some(dir) => Seat::Instance(dir),
                None => Seat::Primary,
            };
            bot::run(config, &cli.config, seat).await
        }
        Command::Launch { credential, json } => launch(&config, &cli.config, &credential, json).await,
        Command::Fleet { json } => {
            let entries = supervisor(&config, &cli.config)?.list().await?;
            if json {
                let by_id: BTreeMap<&str, &FleetEntry> =
                    entries.iter().map(|e| (e.clone_id.as_str(), e)).collect();
                println!("{}", serde_json::to_string_pretty(&by_id)?);
            } else {
                print_fleet(&entries);
            }
            Ok(())
        }
        Command::Identity => {
            let store = IdentityStore::new(config.identity_path());
            match store.try_read()? {
                Some(record) => {
                    println!("primary:     {}", record.is_primary);
                    println!("credential:  {}", record.active_credential);
                    if let Some(at) = record.promoted_at {
                        println!("promoted at: {}", at.to_rfc3339());
                    }
                    if let Some(prev) = &record.predecessor_credential {
                        println!("predecessor: {prev}");
                    }
                }
                None => println!("No promotion recorded; the configured primary is authoritative."),
            }
            Ok(())
        }
        Command::Promote { instance } => promote(&config, instance.as_deref()).await,
        Command::Stop { clone_id } => {
            let entry = supervisor(&config, &cli.config)?.stop(&clone_id).await?;
            println!("{} (pid {}) stopped", entry.clone_id, entry.pid);
            Ok(())
        }
        Command::Relaunch { clone_id } => {
            let report = supervisor(&config, &cli.config)?
                .relaunch(&clone_id)
                .await?;
            println!("{}", report.describe());
            Ok(())
        }
        Command::Unit { clone_id } => {
            print!(
                "{}",
                supervisor(&config, &cli.config)?.render_systemd_unit(&clone_id)?
            );
            Ok(())
        }
    }
}

fn live_parts(config: &FleetConfig) -> (Arc<dyn ProcessManager>, Arc<dyn Gateway>) {
    (
        Arc::new(OsProcessManager::new()),
        Arc::new(TelegramApi::new(&config.telegram)),
    )
}

fn supervisor(config: &FleetConfig, config_path: &Path) -> Result<Supervisor> {
    let (processes, gateway) = live_parts(config);
    Ok(Supervisor::new(config, config_path, processes, gateway)?)
}

async fn launch(config: &FleetConfig, config_path: &Path, raw: &str, json: bool) -> Result<()> {
    let supervisor = supervisor(config, config_path)?;
    let result = supervisor.launch(None, raw).await;

    if json {
        let report = match &result {
            Ok(r) => serde_json::json!({ "success": true, "report": r }),
            Err(e) => serde_json::json!({
                "success": false,
                "error": e.to_string(),
                "detail": e.user_message(),
            }),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        match &result {
            Ok(r) => println!("OK  {}", r.describe()),
            Err(e) => eprintln!("FAILED  {}", e.user_message()),
        }
    }

    if result.is_err() {
        std::process::exit(1);
    }
    Ok(())
}

async fn promote(config: &FleetConfig, instance: Option<&Path>) -> Result<()> {
    let manifest = instance.map(InstanceManifest::load).transpose()?;
    let resolved = bot::resolve_credential(config, manifest.as_ref())
        .wrap_err("cannot determine which credential to promote")?;

    let (processes, gateway) = live_parts(config);
    let probe = LivePrimaryProbe::from_config(config, processes, gateway);
    let promoter = Promoter::new(
        IdentityStore::new(config.identity_path()),
        config.primary.credential_file.clone(),
        probe.static_primary().cloned(),
    );
    let outcome = promoter.promote(&resolved.credential, &probe).await?;
    println!("{}", outcome.describe());
    if !outcome.is_promoted() {
        bail!("promotion not performed");
    }
    Ok(())
}

fn print_fleet(entries: &[FleetEntry]) {
    if entries.is_empty() {
        println!("No standbys launched yet.");
        return;
    }
    println!(
        "{:<28} {:>8}  {:<8} {:<14} LAUNCHED",
        "CLONE", "PID", "STATUS", "CREDENTIAL"
    );
    for e in entries {
        println!(
            "{:<28} {:>8}  {:<8} {:<14} {}",
            e.clone_id,
            e.pid,
            e.status.to_string(),
            e.credential_preview,
            e.launched_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
}
