use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use http::header::CONTENT_TYPE;
use http::HeaderValue;
use prost_reflect::{DynamicMessage, MessageDescriptor, MethodDescriptor};
use tokio_stream::Stream;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue, MetadataMap};
use tonic::server::{Grpc, StreamingService};
use tonic::{Code, Request, Response, Status, Streaming};

use crate::codec::{Frame, MultiplexCodec};
use crate::history::HistoryRegistry;
use crate::mocks::{MockConfig, MockRegistry};
use crate::proxy::Proxy;
use crate::registry::DescriptorRegistry;
use crate::trace::{CallTrace, TracedStream};

type BoxFrameStream = Pin<Box<dyn Stream<Item = Result<Frame, Status>> + Send + 'static>>;
type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Content type advertised on dispatcher responses; the subtype is the
/// multiplex codec's wire name.
const GRPC_CONTENT_TYPE: &str = "application/grpc+multiplex";

/// The unknown-method handler, installed as the gRPC router's catch-all.
///
/// Every incoming stream is resolved against the descriptor and mock
/// registries and routed to the mock path, the proxy, or an
/// `UNIMPLEMENTED` status. The whole call is recorded in the history
/// registry via a [`CallTrace`].
#[derive(Clone)]
pub struct DispatchService {
    inner: Arc<DispatchState>,
}

struct DispatchState {
    descriptors: Arc<DescriptorRegistry>,
    mocks: Arc<MockRegistry>,
    history: Arc<HistoryRegistry>,
    proxy: Option<Proxy>,
}

impl DispatchService {
    pub fn new(
        descriptors: Arc<DescriptorRegistry>,
        mocks: Arc<MockRegistry>,
        history: Arc<HistoryRegistry>,
        proxy: Option<Proxy>,
    ) -> Self {
        DispatchService {
            inner: Arc::new(DispatchState {
                descriptors,
                mocks,
                history,
                proxy,
            }),
        }
    }
}

impl tower::Service<http::Request<axum::body::Body>> for DispatchService {
    type Response = http::Response<tonic::body::BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<Result<Self::Response, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<axum::body::Body>) -> Self::Future {
        let state = self.inner.clone();
        Box::pin(async move { Ok(state.dispatch(req).await) })
    }
}

impl DispatchState {
    async fn dispatch(
        &self,
        req: http::Request<axum::body::Body>,
    ) -> http::Response<tonic::body::BoxBody> {
        let full_method = req.uri().path().to_string();
        tracing::info!(method = %full_method, "gRPC call");

        let method = self.descriptors.method_descriptor(&full_method);
        let trace = CallTrace::open(self.history.clone(), &full_method, method.clone());

        let mock = self.mocks.get(&full_method);
        let mut response = match (method, mock) {
            (Some(method), Some(mock)) => {
                let call = MockCall {
                    descriptors: self.descriptors.clone(),
                    method: method.clone(),
                    mock,
                    trace,
                };
                Grpc::new(MultiplexCodec::typed(method.input()))
                    .streaming(call, req)
                    .await
            }
            (Some(_), None) => {
                self.forward(full_method, trace, req, "no mock and proxy disabled")
                    .await
            }
            (None, _) => {
                self.forward(
                    full_method,
                    trace,
                    req,
                    "method descriptor not registered and proxy disabled",
                )
                .await
            }
        };

        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(GRPC_CONTENT_TYPE));
        response
    }

    /// Delegate to the proxy when one is configured, otherwise terminate the
    /// call as unimplemented with `disabled_message`.
    async fn forward(
        &self,
        full_method: String,
        trace: Arc<CallTrace>,
        req: http::Request<axum::body::Body>,
        disabled_message: &str,
    ) -> http::Response<tonic::body::BoxBody> {
        match &self.proxy {
            Some(proxy) => {
                trace.mark_proxified();
                let call = ProxyCall {
                    proxy: proxy.clone(),
                    full_method,
                    trace,
                };
                Grpc::new(MultiplexCodec::opaque()).streaming(call, req).await
            }
            None => {
                let status = Status::unimplemented(disabled_message);
                trace.close_with_status(&status);
                Grpc::new(MultiplexCodec::opaque())
                    .streaming(FailCall { status }, req)
                    .await
            }
        }
    }
}

/// Close the trace with `status` and hand the status back to the transport.
fn fail(trace: &CallTrace, status: Status) -> Status {
    trace.close_with_status(&status);
    status
}

// -- Mock path -----------------------------------------------------------------

struct MockCall {
    descriptors: Arc<DescriptorRegistry>,
    method: MethodDescriptor,
    mock: MockConfig,
    trace: Arc<CallTrace>,
}

impl StreamingService<Frame> for MockCall {
    type Response = Frame;
    type ResponseStream = BoxFrameStream;
    type Future = BoxFuture<Result<Response<Self::ResponseStream>, Status>>;

    fn call(&mut self, request: Request<Streaming<Frame>>) -> Self::Future {
        let descriptors = self.descriptors.clone();
        let method = self.method.clone();
        let mock = self.mock.clone();
        let trace = self.trace.clone();

        Box::pin(async move {
            let mut inbound = request.into_inner();
            let frame = match inbound.message().await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    return Err(fail(&trace, Status::invalid_argument("missing request message")))
                }
                Err(status) => return Err(fail(&trace, status)),
            };
            trace.record_recv(&frame);

            // The sleep is bound to the call: if the client goes away the
            // future is dropped and the trace closes as CANCELLED.
            if mock.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(mock.delay_ms)).await;
            }

            let item = if mock.grpc_status != 0 {
                Err(Status::new(
                    Code::from_i32(mock.grpc_status),
                    mock.error_string.clone(),
                ))
            } else {
                let output = resolve_response_type(&descriptors, &method, &mock)
                    .map_err(|status| fail(&trace, status))?;
                let message = build_mock_message(&output, &mock.mock_response)
                    .map_err(|status| fail(&trace, status))?;
                Ok(Frame::Message(message))
            };

            let stream: BoxFrameStream =
                Box::pin(TracedStream::new(tokio_stream::once(item), trace));
            let mut response = Response::new(stream);
            if !mock.headers.is_empty() {
                *response.metadata_mut() = response_headers(&mock.headers);
            }
            Ok(response)
        })
    }
}

/// The mock's explicit `responseType` override is honored only when the
/// named descriptor exists; without an override the method's output type is
/// used.
fn resolve_response_type(
    descriptors: &DescriptorRegistry,
    method: &MethodDescriptor,
    mock: &MockConfig,
) -> Result<MessageDescriptor, Status> {
    if mock.response_type.is_empty() {
        return Ok(method.output());
    }
    descriptors
        .message_descriptor(&mock.response_type)
        .ok_or_else(|| {
            Status::internal(format!(
                "response type {:?} not registered",
                mock.response_type
            ))
        })
}

/// Interpret the mock response tree as protobuf JSON against the output
/// schema, including well-known-type conventions.
fn build_mock_message(
    descriptor: &MessageDescriptor,
    value: &serde_json::Value,
) -> Result<DynamicMessage, Status> {
    DynamicMessage::deserialize(descriptor.clone(), value.clone()).map_err(|e| {
        Status::internal(format!(
            "mock response does not match {}: {e}",
            descriptor.full_name()
        ))
    })
}

/// Convert the mock's header map into response metadata, skipping entries
/// that are not valid gRPC metadata.
fn response_headers(headers: &std::collections::HashMap<String, String>) -> MetadataMap {
    let mut metadata = MetadataMap::new();
    for (name, value) in headers {
        match (
            AsciiMetadataKey::from_bytes(name.as_bytes()),
            AsciiMetadataValue::try_from(value.as_str()),
        ) {
            (Ok(key), Ok(value)) => {
                metadata.insert(key, value);
            }
            _ => tracing::warn!(header = %name, "skipping invalid mock header"),
        }
    }
    metadata
}

// -- Proxy path ----------------------------------------------------------------

struct ProxyCall {
    proxy: Proxy,
    full_method: String,
    trace: Arc<CallTrace>,
}

impl StreamingService<Frame> for ProxyCall {
    type Response = Frame;
    type ResponseStream = BoxFrameStream;
    type Future = BoxFuture<Result<Response<Self::ResponseStream>, Status>>;

    fn call(&mut self, request: Request<Streaming<Frame>>) -> Self::Future {
        let proxy = self.proxy.clone();
        let full_method = self.full_method.clone();
        let trace = self.trace.clone();

        Box::pin(async move {
            match proxy.handle(&full_method, request, trace.clone()).await {
                Ok(response) => {
                    let (metadata, stream, extensions) = response.into_parts();
                    let stream: BoxFrameStream = Box::pin(TracedStream::new(stream, trace));
                    Ok(Response::from_parts(metadata, stream, extensions))
                }
                Err(status) => Err(fail(&trace, status)),
            }
        })
    }
}

// -- Terminal status path ------------------------------------------------------

struct FailCall {
    status: Status,
}

impl StreamingService<Frame> for FailCall {
    type Response = Frame;
    type ResponseStream = BoxFrameStream;
    type Future = BoxFuture<Result<Response<Self::ResponseStream>, Status>>;

    fn call(&mut self, _request: Request<Streaming<Frame>>) -> Self::Future {
        let status = self.status.clone();
        Box::pin(async move { Err(status) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CODEC_NAME;

    const HELLO_PROTO: &str = r#"
syntax = "proto3";
package example;
service Greeter {
  rpc SayHello (HelloRequest) returns (HelloReply);
}
message HelloRequest { string name = 1; }
message HelloReply { string message = 1; }
"#;

    fn greeter_registry() -> Arc<DescriptorRegistry> {
        let registry = DescriptorRegistry::new();
        registry
            .register_proto_file("hello.proto", HELLO_PROTO)
            .unwrap();
        Arc::new(registry)
    }

    fn say_hello(registry: &DescriptorRegistry) -> MethodDescriptor {
        registry
            .method_descriptor("/example.Greeter/SayHello")
            .unwrap()
    }

    #[test]
    fn content_type_matches_codec_name() {
        assert_eq!(GRPC_CONTENT_TYPE, format!("application/grpc+{CODEC_NAME}"));
    }

    #[test]
    fn response_type_defaults_to_method_output() {
        let registry = greeter_registry();
        let method = say_hello(&registry);
        let mock = MockConfig::default();

        let desc = resolve_response_type(&registry, &method, &mock).unwrap();
        assert_eq!(desc.full_name(), "example.HelloReply");
    }

    #[test]
    fn response_type_override_is_honored_when_registered() {
        let registry = greeter_registry();
        let method = say_hello(&registry);
        let mock = MockConfig {
            response_type: "example.HelloRequest".into(),
            ..Default::default()
        };

        let desc = resolve_response_type(&registry, &method, &mock).unwrap();
        assert_eq!(desc.full_name(), "example.HelloRequest");
    }

    #[test]
    fn unknown_response_type_override_is_internal() {
        let registry = greeter_registry();
        let method = say_hello(&registry);
        let mock = MockConfig {
            response_type: "example.Missing".into(),
            ..Default::default()
        };

        let status = resolve_response_type(&registry, &method, &mock).unwrap_err();
        assert_eq!(status.code(), Code::Internal);
    }

    #[test]
    fn mock_message_builds_from_json_tree() {
        let registry = greeter_registry();
        let reply = registry.message_descriptor("example.HelloReply").unwrap();

        let message =
            build_mock_message(&reply, &serde_json::json!({"message": "Hello from mock"}))
                .unwrap();
        let field = message
            .get_field_by_name("message")
            .expect("field present");
        assert_eq!(field.as_str(), Some("Hello from mock"));
    }

    #[test]
    fn mock_message_honors_well_known_type_conventions() {
        let registry = DescriptorRegistry::new();
        registry
            .register_proto_file(
                "event.proto",
                r#"
syntax = "proto3";
package events;
import "google/protobuf/timestamp.proto";
message Event { google.protobuf.Timestamp occurred_at = 1; }
"#,
            )
            .unwrap();
        let event = registry.message_descriptor("events.Event").unwrap();

        let message = build_mock_message(
            &event,
            &serde_json::json!({"occurredAt": "2021-07-01T12:00:00Z"}),
        )
        .unwrap();
        let rendered = serde_json::to_value(&message).unwrap();
        assert_eq!(rendered["occurredAt"], "2021-07-01T12:00:00Z");
    }

    #[test]
    fn mismatched_mock_payload_is_internal() {
        let registry = greeter_registry();
        let reply = registry.message_descriptor("example.HelloReply").unwrap();

        let status =
            build_mock_message(&reply, &serde_json::json!({"message": {"nested": true}}))
                .unwrap_err();
        assert_eq!(status.code(), Code::Internal);
    }

    #[test]
    fn invalid_mock_headers_are_skipped() {
        let mut headers = std::collections::HashMap::new();
        headers.insert("x-mock".to_string(), "yes".to_string());
        headers.insert("bad header name".to_string(), "value".to_string());

        let metadata = response_headers(&headers);
        assert_eq!(metadata.get("x-mock").unwrap(), "yes");
        assert_eq!(metadata.len(), 1);
    }
}
