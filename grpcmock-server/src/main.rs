mod cli;

use std::process;

use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use grpcmock_core::api;
use grpcmock_core::proxy::Proxy;
use grpcmock_core::server::{self, AppState};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = cli::Cli::parse();

    let grpc_addr = match cli::listen_addr(&cli.grpc_port) {
        Ok(addr) => addr,
        Err(msg) => {
            eprintln!("{msg}");
            process::exit(2);
        }
    };
    let http_addr = match cli::listen_addr(&cli.http_port) {
        Ok(addr) => addr,
        Err(msg) => {
            eprintln!("{msg}");
            process::exit(2);
        }
    };

    let proxy_target = cli.proxy.as_deref().filter(|t| !t.is_empty());
    let proxy = match proxy_target {
        Some(target) => match Proxy::new(target) {
            Ok(proxy) => Some(proxy),
            Err(e) => {
                eprintln!("Failed to configure proxy: {e}");
                process::exit(2);
            }
        },
        None => None,
    };

    let state = AppState::new();

    let http_listener = match TcpListener::bind(http_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("listen {http_addr}: {e}");
            process::exit(1);
        }
    };
    let config = api::config_router(state.clone());
    tokio::spawn(async move {
        tracing::info!(%http_addr, "HTTP config server listening");
        if let Err(e) = server::serve(http_listener, config).await {
            tracing::error!("HTTP config server failed: {e}");
        }
    });

    let grpc_listener = match TcpListener::bind(grpc_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("listen {grpc_addr}: {e}");
            process::exit(1);
        }
    };
    let router = server::grpc_router(&state, proxy);
    tracing::info!(
        %grpc_addr,
        proxy = proxy_target.unwrap_or(""),
        "gRPC server listening"
    );
    if let Err(e) = server::serve(grpc_listener, router).await {
        eprintln!("Unable to run gRPC server: {e}");
        process::exit(1);
    }
}
