//! Chat over Mesa.
//!
//! Run a server with two nodes sharing one delivery bridge:
//!   cargo run -p mesa-demo-chat -- server --addr 127.0.0.1:9001 --nodes 2
//!
//! Then connect clients to either node:
//!   cargo run -p mesa-demo-chat -- client --url ws://127.0.0.1:9001 --name ann
//!   cargo run -p mesa-demo-chat -- client --url ws://127.0.0.1:9002 --name bo
//!
//! In the client, type to talk to everyone, `/w <name> <text>` to whisper,
//! `/quit` to leave.

mod client;
mod config;
mod protocol;
mod server;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::config::ChatConfig;

#[derive(Parser, Debug)]
#[command(name = "chat", version, about = "Chat server and client over Mesa")]
struct Cli {
    /// TOML file with `[server]` and `[client]` sections.
    #[arg(long, global = true, env = "MESA_CHAT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one or more chat nodes.
    Server {
        /// Address of the first node; further nodes take the following ports.
        #[arg(long, default_value = "127.0.0.1:9001", env = "MESA_CHAT_ADDR")]
        addr: SocketAddr,

        /// Number of nodes sharing one delivery bridge.
        #[arg(long, default_value_t = 1)]
        nodes: u16,
    },
    /// Connect to a node from the terminal.
    Client {
        #[arg(long, default_value = "ws://127.0.0.1:9001", env = "MESA_CHAT_URL")]
        url: String,

        /// Display name, also used as the identity.
        #[arg(long)]
        name: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chat=info,mesa_server=info,mesa_client=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ChatConfig::load(path)?,
        None => ChatConfig::default(),
    };

    match cli.command {
        Command::Server { addr, nodes } => server::run(addr, nodes, config.server).await,
        Command::Client { url, name } => client::run(&url, &name, config.client).await,
    }
}
