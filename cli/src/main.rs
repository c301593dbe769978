// p2pcat — cat over a libp2p stream
//
// Relays stdin/stdout over exactly one peer-to-peer stream, either by dialing
// a peer (initiate) or by waiting for one (respond). Data goes to stdout, all
// diagnostics go to stderr.

mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use config::Config;
use p2pcat_core::{
    initiate, protocol_id, seeds, PeerLocation, Relay, RelayReport, Responder, SessionError,
};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "p2pcat")]
#[command(about = "Pipe stdin/stdout to a peer over a libp2p stream", long_about = None)]
#[command(version)]
struct Cli {
    /// Show informational logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Find peers through the DHT, bootstrapping from public seed peers
    #[arg(long, global = true)]
    routed: bool,

    /// Config file [default: <config dir>/p2pcat/config.json]
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dial a peer and relay stdin/stdout over a new stream
    Initiate {
        /// Peer address, e.g. /ip4/203.0.113.7/tcp/4001/p2p/12D3KooW...
        peer_address: String,
        /// Protocol id, e.g. /chat/1.0
        protocol: String,
    },
    /// Accept one inbound stream and relay stdin/stdout over it
    Respond {
        /// Protocol id to accept streams on
        #[arg(long, value_name = "PROTOCOL")]
        listen: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref());
    init_logging(
        cli.verbose,
        config.as_ref().map_or("warn", |c| c.log_filter.as_str()),
    );

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    let outcome = match config {
        Ok(config) => tokio::select! {
            outcome = run(cli.command, cli.routed, config, &cancel) => outcome,
            _ = cancel.cancelled() => Err(SessionError::Cancelled.into()),
        },
        Err(e) => Err(e),
    };

    let code = match outcome {
        Ok(report) if report.is_clean() => 0,
        Ok(report) => {
            info!(
                "relay ended with errors: outbound {}, inbound {}",
                report.outbound, report.inbound
            );
            1
        }
        Err(e) => {
            error!("{:#}", e);
            1
        }
    };

    // Exit right away: a pending stdin read would otherwise hold the runtime
    std::process::exit(code);
}

/// RUST_LOG wins, then -v, then the configured filter.
fn init_logging(verbose: bool, configured: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("info")
        } else {
            EnvFilter::try_new(configured).unwrap_or_else(|_| EnvFilter::new("warn"))
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted");
            cancel.cancel();
        }
    });
}

// Seeds are only parsed when routing needs them.
fn seed_list(routed: bool) -> &'static [PeerLocation] {
    if routed {
        seeds()
    } else {
        &[]
    }
}

async fn run(
    command: Commands,
    routed: bool,
    config: Config,
    cancel: &CancellationToken,
) -> Result<RelayReport> {
    match command {
        Commands::Initiate {
            peer_address,
            protocol,
        } => {
            // Validate everything before any node exists
            let target = PeerLocation::parse(&peer_address)?;
            let protocol = protocol_id(&protocol)?;
            let node_config = config.node_config(false, routed)?;

            let report = initiate(
                &target,
                protocol,
                node_config,
                seed_list(routed),
                Relay::stdio()?,
                cancel,
            )
            .await?;
            Ok(report)
        }

        Commands::Respond { listen } => {
            let protocol = protocol_id(&listen)?;
            let node_config = config.node_config(true, routed)?;
            let relay = Relay::stdio()?;

            let responder = Responder::start(node_config, seed_list(routed), cancel).await?;
            let peer_id = responder.local_peer_id();

            eprintln!("listening on: /p2p/{} {}", peer_id, protocol);
            for addr in responder.host().listen_addrs().await? {
                info!("listening on: {}/p2p/{}", addr, peer_id);
            }

            let served = responder.serve(protocol, relay, cancel).await;
            responder.shutdown().await;
            Ok(served?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_initiate() {
        let cli = Cli::try_parse_from([
            "p2pcat",
            "-v",
            "initiate",
            "/ip4/127.0.0.1/tcp/4001/p2p/12D3KooWD3eckifWpRn9wQpMG9R9hX3sD158z7EqHWmweQAJU5SA",
            "/chat/1.0",
        ])
        .unwrap();

        assert!(cli.verbose);
        assert!(!cli.routed);
        assert!(matches!(
            cli.command,
            Commands::Initiate { ref protocol, .. } if protocol == "/chat/1.0"
        ));
    }

    #[test]
    fn test_parse_respond_with_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "p2pcat", "respond", "--listen", "/chat/1.0", "--routed", "--config", "p2pcat.json",
        ])
        .unwrap();

        assert!(cli.routed);
        assert_eq!(cli.config, Some(PathBuf::from("p2pcat.json")));
        assert!(matches!(
            cli.command,
            Commands::Respond { ref listen } if listen == "/chat/1.0"
        ));
    }

    #[test]
    fn test_respond_requires_listen() {
        assert!(Cli::try_parse_from(["p2pcat", "respond"]).is_err());
    }

    #[test]
    fn test_seed_list_empty_without_routing() {
        assert!(seed_list(false).is_empty());
        assert!(!seed_list(true).is_empty());
    }
}
