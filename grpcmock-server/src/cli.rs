use std::net::SocketAddr;

use clap::Parser;

/// Hot-reloadable gRPC mock server and pass-through proxy.
///
/// Serves two endpoints: a gRPC endpoint answering mocked and proxied RPCs
/// (with reflection v1 and v1alpha), and an HTTP configuration endpoint for
/// uploading .proto sources, registering mocks, and reading call history.
#[derive(Parser, Debug)]
#[command(name = "grpcmock", version)]
pub struct Cli {
    /// gRPC listen address; ":50051" binds all interfaces.
    #[arg(long, default_value = ":50051")]
    pub grpc_port: String,

    /// HTTP configuration listen address.
    #[arg(long, default_value = ":8080")]
    pub http_port: String,

    /// Upstream backend address; un-mocked calls are proxied there.
    /// Empty disables the proxy.
    #[arg(long, env = "PROXY_TARGET")]
    pub proxy: Option<String>,
}

/// Parse a listen address, accepting the ":PORT" shorthand.
pub fn listen_addr(spec: &str) -> Result<SocketAddr, String> {
    let normalized = if spec.starts_with(':') {
        format!("0.0.0.0{spec}")
    } else {
        spec.to_string()
    };
    normalized
        .parse()
        .map_err(|e| format!("invalid listen address '{spec}': {e}"))
}
