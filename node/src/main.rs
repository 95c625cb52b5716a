//! Agent coordinator node
//!
//! Serves the cluster protocol over TCP and keeps heartbeats running until
//! Ctrl-C, or until the REPL exits when started with `--repl`.

use std::sync::Arc;

use clap::Parser;
use switchboard_coordinator::transport::serve;
use switchboard_coordinator::{Coordinator, TcpTransport};
use switchboard_node::{Args, ReplContext, repl};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = args.to_config().map_err(|report| format!("{report:?}"))?;
    let address = args
        .listen_address()
        .ok_or("local node missing from the cluster list")?
        .to_owned();

    let transport = TcpTransport::new(config.members.iter().map(|member| &member.node));
    let coordinator =
        Arc::new(Coordinator::new(config, transport).map_err(|report| format!("{report:?}"))?);

    let listener = TcpListener::bind(&address).await?;
    info!(node = %coordinator.node_id(), %address, "node listening");

    let token = CancellationToken::new();
    let server = tokio::spawn(serve(listener, Arc::clone(&coordinator), token.clone()));
    let tasks = coordinator.start(&token);

    if args.repl {
        println!("Switchboard node {}", coordinator.node_id());
        println!("Type 'help' for available commands.\n");
        tokio::select! {
            () = repl::run(ReplContext::new(Arc::clone(&coordinator))) => {}
            signal = tokio::signal::ctrl_c() => signal?,
        }
    } else {
        tokio::signal::ctrl_c().await?;
    }

    info!("shutting down");
    token.cancel();
    for task in tasks {
        let _ = task.await;
    }
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "server failed"),
        Err(e) => error!(error = %e, "server task panicked"),
    }
    Ok(())
}
