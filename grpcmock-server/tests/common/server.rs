use http::uri::PathAndQuery;
use prost_reflect::DynamicMessage;
use tokio::net::TcpListener;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Response, Status};

use grpcmock_core::api;
use grpcmock_core::codec::{Frame, MultiplexCodec};
use grpcmock_core::proxy::Proxy;
use grpcmock_core::server::{self, AppState};

/// An in-process mock server on ephemeral ports.
///
/// Both the gRPC and the HTTP configuration surfaces are served from
/// background tasks that are aborted on drop, so each test gets an isolated
/// instance.
pub struct TestServer {
    pub state: AppState,
    pub grpc_addr: String,
    pub http_addr: String,
    grpc_task: tokio::task::JoinHandle<()>,
    http_task: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with_proxy(None).await
    }

    /// Start a server whose un-mocked calls are proxied to `target`.
    pub async fn start_proxying(target: &str) -> Self {
        let proxy = Proxy::new(target).expect("valid proxy target");
        Self::start_with_proxy(Some(proxy)).await
    }

    async fn start_with_proxy(proxy: Option<Proxy>) -> Self {
        let state = AppState::new();

        let grpc_listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind ephemeral gRPC port");
        let grpc_addr = grpc_listener.local_addr().unwrap().to_string();
        let router = server::grpc_router(&state, proxy);
        let grpc_task = tokio::spawn(async move {
            let _ = server::serve(grpc_listener, router).await;
        });

        let http_listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind ephemeral HTTP port");
        let http_addr = http_listener.local_addr().unwrap().to_string();
        let config = api::config_router(state.clone());
        let http_task = tokio::spawn(async move {
            let _ = server::serve(http_listener, config).await;
        });

        TestServer {
            state,
            grpc_addr,
            http_addr,
            grpc_task,
            http_task,
        }
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{path}", self.http_addr)
    }

    pub async fn channel(&self) -> Channel {
        Endpoint::from_shared(format!("http://{}", self.grpc_addr))
            .expect("valid endpoint")
            .connect()
            .await
            .expect("connect to test server")
    }

    /// Register a `.proto` source through the configuration surface.
    pub async fn register_proto(&self, filename: &str, content: &str) {
        let response = reqwest::Client::new()
            .post(self.http_url("/protos/register/json"))
            .json(&serde_json::json!({
                "files": [{"filename": filename, "content": content}]
            }))
            .send()
            .await
            .expect("register proto request");
        assert_eq!(response.status(), 201, "proto registration failed");
    }

    /// Register a mock through the configuration surface.
    pub async fn register_mock(&self, mock: serde_json::Value) {
        let response = reqwest::Client::new()
            .post(self.http_url("/mocks"))
            .json(&mock)
            .send()
            .await
            .expect("register mock request");
        assert_eq!(response.status(), 201, "mock registration failed");
    }

    /// Fetch the call history as JSON.
    pub async fn history(&self) -> serde_json::Value {
        reqwest::Client::new()
            .get(self.http_url("/history"))
            .send()
            .await
            .expect("history request")
            .json()
            .await
            .expect("history JSON")
    }

    /// Invoke a unary method dynamically, returning the full response so
    /// callers can inspect metadata.
    pub async fn call_unary(
        &self,
        method_path: &str,
        request_json: serde_json::Value,
    ) -> Result<Response<Frame>, Status> {
        let method = self
            .state
            .descriptors
            .method_descriptor(method_path)
            .expect("method descriptor registered");
        let request = DynamicMessage::deserialize(method.input(), request_json)
            .expect("request matches input schema");

        let mut grpc = tonic::client::Grpc::new(self.channel().await);
        grpc.ready()
            .await
            .map_err(|e| Status::unknown(format!("service not ready: {e}")))?;

        let path = PathAndQuery::try_from(method_path.to_string()).expect("valid method path");
        grpc.unary(
            Request::new(Frame::Message(request)),
            path,
            MultiplexCodec::typed(method.output()),
        )
        .await
    }

    /// Invoke a unary method and decode the reply as protobuf JSON.
    pub async fn call_unary_json(
        &self,
        method_path: &str,
        request_json: serde_json::Value,
    ) -> Result<serde_json::Value, Status> {
        let response = self.call_unary(method_path, request_json).await?;
        match response.into_inner() {
            Frame::Message(msg) => {
                Ok(serde_json::to_value(&msg).expect("reply serializes to JSON"))
            }
            Frame::Raw(_) => panic!("expected a typed reply frame"),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.grpc_task.abort();
        self.http_task.abort();
    }
}
