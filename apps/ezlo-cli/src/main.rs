//! Ezlo CLI entry point.

mod config;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use ezlo_discovery::Client as DiscoveryClient;
use ezlo_hub_connection::predicates;
use ezlo_hub_connection::{
    CredentialsResolver, FileCredentialsResolver, HubClient, HubDiscovery, HubError, hub_url,
};

use crate::config::CliConfig;

#[derive(Parser)]
#[command(name = "ezlo-cli", version, about = "Talk to Ezlo hubs on the local network")]
struct Cli {
    /// Hub serial. May be omitted when only one hub has credentials.
    #[arg(long, global = true)]
    hub: Option<String>,

    /// Hub host or IP, skipping mDNS lookup
    #[arg(long, global = true)]
    host: Option<String>,

    /// Configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List hubs announced on the local network
    Discover {
        /// Connect to every hub with known credentials and print its info
        #[arg(long)]
        connect: bool,
    },
    /// Manage stored hub credentials
    Hubs {
        #[command(subcommand)]
        action: HubsAction,
    },
    /// Print hub information
    Info,
    /// List devices
    Devices,
    /// List items
    Items {
        /// Only items of this device
        #[arg(long)]
        device: Option<String>,
    },
    /// List scenes
    Scenes,
    /// List rooms
    Rooms,
    /// List house modes and the active one
    Modes,
    /// Run a scene and wait for it to finish
    RunScene { scene_id: String },
    /// Switch the house mode and wait for the switch
    SetMode { mode_id: String },
    /// Set an item value. VALUE is parsed as JSON, else taken as a string
    SetItem {
        /// One or more item ids, comma separated
        items: String,
        value: String,
    },
    /// Print hub broadcasts until interrupted
    Watch {
        /// Only broadcasts with this msg_subclass
        #[arg(long)]
        subclass: Option<String>,
    },
}

#[derive(Subcommand)]
enum HubsAction {
    /// List hubs with stored credentials
    List,
    /// Store credentials for a hub
    Add {
        serial: String,
        user: String,
        token: String,
    },
    /// Forget a hub
    Remove { serial: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => config::config_path()?,
    };
    let config = match CliConfig::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %config_path.display(),
                "failed to load config, using defaults"
            );
            CliConfig::default()
        }
    };

    match &cli.command {
        Command::Discover { connect } => discover(&config, *connect).await,
        Command::Hubs { action } => manage_hubs(&config, action).await,
        command => {
            let client = open_session(&cli, &config).await?;
            let outcome = run_command(&client, command).await;
            client.disconnect();
            outcome
        }
    }
}

async fn run_command(client: &HubClient, command: &Command) -> anyhow::Result<()> {
    match command {
        Command::Info => print_json(&client.info().await?),
        Command::Devices => print_json(&client.devices().await?),
        Command::Items { device } => print_json(&client.items(device.as_deref()).await?),
        Command::Scenes => print_json(&client.scenes().await?),
        Command::Rooms => print_json(&client.rooms().await?),
        Command::Modes => {
            let modes = client.house_modes().await?;
            let current = client.current_house_mode().await?;
            print_json(&serde_json::json!({"current": current, "modes": modes}))
        }
        Command::RunScene { scene_id } => {
            client.run_scene(scene_id).await?;
            println!("scene {scene_id} finished");
            Ok(())
        }
        Command::SetMode { mode_id } => {
            let mode = client.set_house_mode(mode_id).await?;
            println!("house mode is {mode}");
            Ok(())
        }
        Command::SetItem { items, value } => {
            let value = parse_value(value);
            let ids: Vec<String> = items.split(',').map(|s| s.trim().to_string()).collect();
            let result = match <[String; 1]>::try_from(ids) {
                Ok([id]) => client.set_item_value(id, value).await?,
                Err(ids) => client.set_item_value(ids, value).await?,
            };
            print_json(&result)
        }
        Command::Watch { subclass } => watch(client, subclass.as_deref()).await,
        Command::Discover { .. } | Command::Hubs { .. } => Ok(()),
    }
}

/// Opens a session with the selected hub.
async fn open_session(cli: &Cli, config: &CliConfig) -> anyhow::Result<HubClient> {
    let credentials_path = config.credentials_path()?;
    let resolver = FileCredentialsResolver::load(&credentials_path)?;

    let serial = match &cli.hub {
        Some(serial) => serial.clone(),
        None => {
            let hubs = resolver.hubs().await?;
            match hubs.as_slice() {
                [only] => only.clone(),
                [] => bail!(
                    "no hub credentials in {}, add some with `ezlo-cli hubs add`",
                    credentials_path.display()
                ),
                _ => bail!("several hubs known ({}), pick one with --hub", hubs.join(", ")),
            }
        }
    };
    let credentials = resolver.credentials(&serial).await?;

    let host = match cli.host.clone().or_else(|| config.hosts.get(&serial).cloned()) {
        Some(host) => host,
        None => locate(&serial, config).await?,
    };

    let client = HubClient::with_config(
        hub_url(&host),
        credentials,
        config.session.to_session_config(),
    );
    client.connect().await?;
    Ok(client)
}

/// Finds the address of `serial` over mDNS.
async fn locate(serial: &str, config: &CliConfig) -> anyhow::Result<String> {
    tracing::info!(hub = %serial, "looking up hub on the local network");
    let hubs = DiscoveryClient::new()
        .discover(config.discovery_duration())
        .await?;
    hubs.into_iter()
        .find(|hub| hub.serial == serial)
        .map(|hub| hub.address())
        .with_context(|| format!("hub {serial} not found on the local network"))
}

async fn discover(config: &CliConfig, connect: bool) -> anyhow::Result<()> {
    let resolver = Arc::new(FileCredentialsResolver::load(config.credentials_path()?)?);

    if !connect {
        let known = resolver.hubs().await?;
        let hubs = DiscoveryClient::new()
            .discover(config.discovery_duration())
            .await?;
        for hub in hubs {
            let status = if known.contains(&hub.serial) {
                "credentials stored"
            } else {
                "no credentials"
            };
            println!("{}\t{}\t{status}", hub.serial, hub.address());
        }
        return Ok(());
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<HubClient>();
    let discovery = HubDiscovery::start(
        resolver,
        config.session.to_session_config(),
        Some(config.discovery_duration()),
        move |client| {
            let _ = tx.send(client);
        },
    );
    report_sessions(rx, discovery.finished()).await?;
    Ok(())
}

/// Prints the info of every session handed over until `done` resolves or
/// the sender goes away. A hub that fails is logged and skipped. Returns
/// the number of hubs reported.
async fn report_sessions(
    mut sessions: mpsc::UnboundedReceiver<HubClient>,
    done: impl Future<Output = ()>,
) -> anyhow::Result<usize> {
    tokio::pin!(done);
    let mut reported = 0;

    loop {
        tokio::select! {
            () = &mut done => break,
            client = sessions.recv() => match client {
                Some(client) => {
                    let report = describe_hub(&client).await;
                    client.disconnect();
                    match report {
                        Ok(report) => {
                            print_json(&report)?;
                            reported += 1;
                        }
                        Err(e) => tracing::warn!(
                            hub = %client.identity(),
                            error = %e,
                            "failed to read hub info, skipping"
                        ),
                    }
                }
                None => break,
            },
        }
    }
    Ok(reported)
}

/// Info summary of a discovered hub.
async fn describe_hub(client: &HubClient) -> Result<Value, HubError> {
    let info = client.info().await?;
    Ok(serde_json::json!({
        "hub": client.identity(),
        "url": client.url(),
        "info": info,
    }))
}

async fn manage_hubs(config: &CliConfig, action: &HubsAction) -> anyhow::Result<()> {
    let resolver = FileCredentialsResolver::load(config.credentials_path()?)?;
    match action {
        HubsAction::List => {
            for serial in resolver.hubs().await? {
                println!("{serial}");
            }
        }
        HubsAction::Add {
            serial,
            user,
            token,
        } => {
            resolver.insert(serial, user, token)?;
            println!("stored credentials for hub {serial}");
        }
        HubsAction::Remove { serial } => {
            if resolver.remove(serial)? {
                println!("forgot hub {serial}");
            } else {
                bail!("no credentials for hub {serial}");
            }
        }
    }
    Ok(())
}

/// Prints broadcasts as JSON lines until Ctrl-C.
async fn watch(client: &HubClient, subclass: Option<&str>) -> anyhow::Result<()> {
    let mut broadcasts = match subclass {
        Some(name) => client.subscribe_broadcasts(predicates::broadcast_subclass(name)),
        None => client.subscribe_broadcasts(predicates::is_broadcast()),
    };
    tracing::info!(hub = %client.identity(), "watching broadcasts, Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            msg = broadcasts.recv() => match msg {
                Some(msg) => println!("{}", msg.to_text()?),
                None => break,
            },
        }
    }
    Ok(())
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
