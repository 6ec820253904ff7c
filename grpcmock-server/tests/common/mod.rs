// Shared across integration test binaries; not every test uses every helper.
#![allow(dead_code)]

pub mod server;

pub const HELLO_PROTO: &str = r#"
syntax = "proto3";
package example;

service Greeter {
  rpc SayHello (HelloRequest) returns (HelloReply);
}

message HelloRequest {
  string name = 1;
}

message HelloReply {
  string message = 1;
}
"#;
