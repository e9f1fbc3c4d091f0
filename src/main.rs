//! Offline Mesh - command line node
//!
//! Runs one mesh node over TCP and reads chat commands from stdin:
//!
//! ```text
//! @<identity> <message>   send a message
//! /dial <address>         connect to a peer
//! /status                 print node status as JSON
//! /quit                   stop the node
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use offline_mesh::link::TcpTransport;
use offline_mesh::{
    FileIdentityStore, Identity, LinkAddress, LinkStatus, MeshConfig, MeshEvent, MeshNode,
};

#[derive(Parser)]
#[command(name = "offline-mesh")]
#[command(about = "Multi-hop text messaging over short-range links")]
struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to accept links on, e.g. 0.0.0.0:7878
    #[arg(short, long)]
    listen: Option<String>,

    /// Address peers should use to reach this node
    #[arg(short, long)]
    advertise: Option<String>,

    /// Peer to dial at startup; may be repeated
    #[arg(short, long)]
    dial: Vec<String>,

    /// File holding the persistent device identity
    #[arg(short, long)]
    identity_file: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn into_config(self) -> Result<MeshConfig> {
        let mut config = match &self.config {
            Some(path) => MeshConfig::from_file(path)?,
            None => MeshConfig::default(),
        };

        if let Some(listen) = self.listen {
            config.listen_address = listen;
        }
        if self.advertise.is_some() {
            config.advertised_address = self.advertise;
        }
        if let Some(path) = self.identity_file {
            config.identity_file = path;
        }
        config.peers.extend(self.dial);

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = cli.into_config()?;

    info!("=== Offline Mesh node ===");

    let store = Arc::new(
        FileIdentityStore::open(&config.identity_file).context("Failed to open identity store")?,
    );
    let transport = Arc::new(TcpTransport::new(
        config.listen_address.clone(),
        config.advertised_address.clone(),
    ));

    let (node, events) = MeshNode::start(&config, transport, store)?;
    info!("Local identity: {}", node.identity());

    node.listen().await?;
    if let Some(address) = node.local_address() {
        info!("Reachable at {}", address);
    }

    for peer in &config.peers {
        if let Err(e) = node.dial(&LinkAddress::from(peer.as_str())).await {
            warn!("Startup dial to {} failed: {}", peer, e);
        }
    }

    tokio::spawn(print_events(events));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match handle_line(&node, line.trim()).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => error!("{:#}", e),
        }
    }

    node.stop();
    Ok(())
}

/// Returns false when the user asked to quit
async fn handle_line(node: &MeshNode, line: &str) -> Result<bool> {
    if line.is_empty() {
        return Ok(true);
    }

    if let Some(rest) = line.strip_prefix('@') {
        let (target, content) = rest
            .split_once(char::is_whitespace)
            .context("usage: @<identity> <message>")?;
        node.send_message(&Identity::from(target), content.trim_start())
            .await?;
        return Ok(true);
    }

    let mut words = line.split_whitespace();
    match words.next() {
        Some("/dial") => {
            let address = words.next().context("usage: /dial <address>")?;
            node.dial(&LinkAddress::from(address)).await?;
        }
        Some("/status") => {
            let status = node.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Some("/quit") => return Ok(false),
        _ => println!("commands: @<identity> <message>, /dial <address>, /status, /quit"),
    }

    Ok(true)
}

async fn print_events(mut events: mpsc::UnboundedReceiver<MeshEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            MeshEvent::Message(message) => {
                println!(
                    "[{}] {}: {}",
                    message.received_at.format("%H:%M:%S"),
                    message.sender,
                    message.content
                );
            }
            MeshEvent::Status(LinkStatus::Connected { address }) => println!("* connected {}", address),
            MeshEvent::Status(LinkStatus::Lost { address }) => println!("* lost {}", address),
            MeshEvent::Status(LinkStatus::DialFailed { address, reason }) => {
                println!("* could not reach {}: {}", address, reason)
            }
            MeshEvent::Status(LinkStatus::ListenFailed { reason }) => {
                println!("* stopped listening: {}", reason)
            }
        }
    }
}
