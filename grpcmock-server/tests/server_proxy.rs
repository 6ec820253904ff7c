mod common;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use common::server::TestServer;
use common::HELLO_PROTO;
use http::uri::PathAndQuery;
use prost::Message;
use prost_reflect::DynamicMessage;
use serde_json::json;
use tonic::{Code, Request};

use grpcmock_core::codec::{Frame, MultiplexCodec};

/// Boot an upstream instance answering `SayHello` with a mock.
async fn upstream_with_mock() -> TestServer {
    let upstream = TestServer::start().await;
    upstream.register_proto("hello.proto", HELLO_PROTO).await;
    upstream
        .register_mock(json!({
            "service": "example.Greeter",
            "method": "SayHello",
            "mockResponse": {"message": "Hello from upstream"}
        }))
        .await;
    upstream
}

#[tokio::test]
async fn proxy_round_trip_with_known_schema() {
    let upstream = upstream_with_mock().await;
    let front = TestServer::start_proxying(&upstream.grpc_addr).await;
    // The front knows the schema but has no mock, so the call is proxied.
    front.register_proto("hello.proto", HELLO_PROTO).await;

    let reply = front
        .call_unary_json("/example.Greeter/SayHello", json!({"name": "Ray"}))
        .await
        .unwrap();
    assert_eq!(reply["message"], "Hello from upstream");

    // The front recorded the call as proxied and decoded the frames against
    // the registered schema.
    let history = front.history().await;
    let entry = &history.as_array().unwrap()[0];
    assert_eq!(entry["state"], "CLOSED");
    assert_eq!(entry["grpc_code"], 0);

    let messages = entry["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    for message in messages {
        assert_eq!(message["proxified"], true);
        assert_eq!(message["recognized"], true);
    }
    assert_eq!(messages[0]["payload"]["name"], "Ray");
    assert_eq!(messages[1]["payload"]["message"], "Hello from upstream");

    // The upstream saw the call as its own mock invocation.
    let upstream_history = upstream.history().await;
    assert_eq!(upstream_history.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn proxy_forwards_unknown_methods_byte_for_byte() {
    let upstream = upstream_with_mock().await;
    // The front has no descriptors at all; frames stay opaque.
    let front = TestServer::start_proxying(&upstream.grpc_addr).await;

    let method = upstream
        .state
        .descriptors
        .method_descriptor("/example.Greeter/SayHello")
        .unwrap();
    let request =
        DynamicMessage::deserialize(method.input(), json!({"name": "Ray"})).unwrap();
    let request_bytes = request.encode_to_vec();

    let mut grpc = tonic::client::Grpc::new(front.channel().await);
    grpc.ready().await.unwrap();
    let path = PathAndQuery::try_from("/example.Greeter/SayHello".to_string()).unwrap();
    let response = grpc
        .unary(
            Request::new(Frame::Raw(request_bytes.clone().into())),
            path,
            MultiplexCodec::opaque(),
        )
        .await
        .unwrap();

    let Frame::Raw(reply_bytes) = response.into_inner() else {
        panic!("expected an opaque reply frame");
    };
    let reply = DynamicMessage::decode(method.output(), reply_bytes).unwrap();
    assert_eq!(
        serde_json::to_value(&reply).unwrap()["message"],
        "Hello from upstream"
    );

    // Without a descriptor the front records the exact request bytes.
    let history = front.history().await;
    let entry = &history.as_array().unwrap()[0];
    let messages = entry["messages"].as_array().unwrap();
    assert_eq!(messages[0]["direction"], "recv");
    assert_eq!(messages[0]["recognized"], false);
    assert_eq!(messages[0]["proxified"], true);
    assert_eq!(messages[0]["payload_string"], BASE64.encode(&request_bytes));
}

#[tokio::test]
async fn upstream_status_is_forwarded_verbatim() {
    let upstream = TestServer::start().await;
    upstream.register_proto("hello.proto", HELLO_PROTO).await;
    upstream
        .register_mock(json!({
            "service": "example.Greeter",
            "method": "SayHello",
            "grpcStatus": 7,
            "errorString": "nope"
        }))
        .await;

    let front = TestServer::start_proxying(&upstream.grpc_addr).await;
    front.register_proto("hello.proto", HELLO_PROTO).await;

    let err = front
        .call_unary("/example.Greeter/SayHello", json!({"name": "Mal"}))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);
    assert_eq!(err.message(), "nope");

    let history = front.history().await;
    let entry = &history.as_array().unwrap()[0];
    assert_eq!(entry["grpc_code"], 7);
    assert_eq!(entry["state"], "CLOSED");
}

#[tokio::test]
async fn unreachable_upstream_surfaces_unavailable() {
    // Nothing listens on this port; connect_lazy defers the failure to the
    // first call.
    let front = TestServer::start_proxying("127.0.0.1:1").await;
    front.register_proto("hello.proto", HELLO_PROTO).await;

    let err = front
        .call_unary("/example.Greeter/SayHello", json!({"name": "Lee"}))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
}
