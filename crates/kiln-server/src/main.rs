use clap::Parser;
use tracing::{error, info};

mod acl;
mod commands;
mod config;
mod connection;
mod dispatch;
mod error;
mod glob;
mod pubsub;
mod raft;
mod registry;
mod replication;
mod server;
mod tls;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kiln=info,kiln_server=info".into()),
        )
        .init();

    let config = config::Config::parse();

    tokio::select! {
        result = server::run(config) => {
            if let Err(e) = result {
                error!("server terminated: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }
}
