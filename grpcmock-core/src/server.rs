//! Assembly of the gRPC-side router: both reflection services plus the
//! unknown-method dispatcher as the catch-all, served over h2c.

use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tonic_reflection::pb::v1::server_reflection_server::ServerReflectionServer as ReflectionV1Server;
use tonic_reflection::pb::v1alpha::server_reflection_server::ServerReflectionServer as ReflectionV1AlphaServer;

use crate::dispatch::DispatchService;
use crate::error::Result;
use crate::history::HistoryRegistry;
use crate::mocks::MockRegistry;
use crate::proxy::Proxy;
use crate::reflection::{ReflectionV1, ReflectionV1Alpha};
use crate::registry::DescriptorRegistry;

/// The three in-memory registries shared by the gRPC and configuration
/// surfaces.
#[derive(Clone)]
pub struct AppState {
    pub descriptors: Arc<DescriptorRegistry>,
    pub mocks: Arc<MockRegistry>,
    pub history: Arc<HistoryRegistry>,
}

impl AppState {
    pub fn new() -> Self {
        AppState {
            descriptors: Arc::new(DescriptorRegistry::new()),
            mocks: Arc::new(MockRegistry::new()),
            history: Arc::new(HistoryRegistry::new()),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the gRPC router: reflection v1 and v1alpha are routed by their
/// service prefix; every other path falls through to the dispatcher.
pub fn grpc_router(state: &AppState, proxy: Option<Proxy>) -> Router {
    let dispatch = DispatchService::new(
        state.descriptors.clone(),
        state.mocks.clone(),
        state.history.clone(),
        proxy,
    );
    Router::new()
        .route_service(
            "/grpc.reflection.v1.ServerReflection/*rpc",
            ReflectionV1Server::new(ReflectionV1::new(state.descriptors.clone())),
        )
        .route_service(
            "/grpc.reflection.v1alpha.ServerReflection/*rpc",
            ReflectionV1AlphaServer::new(ReflectionV1Alpha::new(state.descriptors.clone())),
        )
        .fallback_service(dispatch)
}

/// Serve a router on the given listener until the future is dropped.
pub async fn serve(listener: TcpListener, router: Router) -> Result<()> {
    axum::serve(listener, router).await?;
    Ok(())
}
