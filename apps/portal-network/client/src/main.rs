use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use portal_network_client::{describe_entry, find_entry, ClientError, KeyboardClient};
use portal_network_core::{BlockPos, ResourceId};
use portal_wire::ServerMessage;
use tracing_subscriber::EnvFilter;

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "portal-keyboard")]
#[command(about = "Drive a portal keyboard against a running portal-network server")]
struct Cli {
    /// Server address
    #[arg(long, env = "PORTAL_SERVER", default_value = "127.0.0.1:25570")]
    server: SocketAddr,

    /// Dimension the keyboard sits in
    #[arg(long, env = "PORTAL_DIMENSION", default_value = "minecraft:overworld")]
    dimension: ResourceId,

    /// Keyboard position as x,y,z
    #[arg(long, env = "PORTAL_DEVICE", allow_hyphen_values = true)]
    device: BlockPos,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the endpoints this keyboard can dial
    List,
    /// Dial an endpoint by id, id prefix or name
    Connect { target: String },
    /// Close the link of the keyboard's endpoint
    Disconnect,
    /// Rename the endpoint whose anchor sits at --anchor
    Rename {
        #[arg(long, allow_hyphen_values = true)]
        anchor: BlockPos,
        name: String,
    },
    /// Print status pushes until interrupted
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut client = KeyboardClient::connect(cli.server, cli.dimension, cli.device)
        .await
        .with_context(|| format!("could not reach {}", cli.server))?;

    match cli.command {
        Commands::List => {
            let entries = client.list(REPLY_TIMEOUT).await?;
            if entries.is_empty() {
                println!("no other portals registered");
            }
            for entry in &entries {
                println!("{}", describe_entry(entry));
            }
        }
        Commands::Connect { target } => {
            let entries = client.list(REPLY_TIMEOUT).await?;
            let entry = find_entry(&entries, &target)
                .ok_or_else(|| anyhow!("no portal matches {target:?}"))?;
            let target_id = entry.id;
            client.request_connect(target_id).await?;
            await_status(&mut client, true).await?;
            println!("linked to {}", describe_entry(entry));
        }
        Commands::Disconnect => {
            client.request_disconnect().await?;
            await_status(&mut client, false).await?;
            println!("link closed");
        }
        Commands::Rename { anchor, name } => {
            client.request_rename(anchor, name).await?;
            let applied = client
                .wait_for(REPLY_TIMEOUT, |message| match message {
                    ServerMessage::NameResponse { anchor_pos, name } if anchor_pos == anchor => {
                        Some(name)
                    }
                    _ => None,
                })
                .await?;
            println!("renamed to {applied:?}");
        }
        Commands::Watch => watch(&mut client).await?,
    }
    Ok(())
}

/// Waits for a status push reporting `active`. The list reply that precedes
/// a connect carries the old status, so earlier pushes are skipped.
async fn await_status(client: &mut KeyboardClient, active: bool) -> Result<(), ClientError> {
    client
        .wait_for(REPLY_TIMEOUT, |message| match message {
            ServerMessage::StatusResponse { active: now, .. } if now == active => Some(()),
            _ => None,
        })
        .await
}

async fn watch(client: &mut KeyboardClient) -> Result<()> {
    // The server only pushes status for endpoints this session has touched.
    client.request_list().await?;
    loop {
        let message = match client.next_message(Duration::from_secs(3600)).await {
            Ok(message) => message,
            Err(ClientError::Timeout(_)) => continue,
            Err(err) => return Err(err.into()),
        };
        match message {
            ServerMessage::StatusResponse {
                anchor_pos,
                active,
                disconnect_allowed,
            } => println!(
                "status {anchor_pos}: active={active} disconnect_allowed={disconnect_allowed}"
            ),
            ServerMessage::NameResponse { anchor_pos, name } => {
                println!("name {anchor_pos}: {name:?}")
            }
            ServerMessage::ConnectionError { message } => println!("error: {message}"),
            ServerMessage::EndpointListResponse { entries, .. } => {
                println!("{} portals visible", entries.len())
            }
        }
    }
}
