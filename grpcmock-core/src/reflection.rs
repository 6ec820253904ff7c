use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;

use prost::Message;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tonic::{Code, Request, Response, Status, Streaming};
use tonic_reflection::pb::{v1, v1alpha};

use crate::registry::DescriptorRegistry;

/// Version-neutral reflection request, extracted from either wire variant.
enum Query {
    ListServices,
    FileByFilename(String),
    FileContainingSymbol(String),
    Unsupported,
}

/// Version-neutral reflection answer; each wire variant converts it back
/// into its own generated types.
enum Answer {
    Services(Vec<String>),
    File(Vec<u8>),
    Error { code: Code, message: String },
}

/// Resolve one reflection query against the registry's descriptor snapshot.
fn answer(registry: &DescriptorRegistry, query: Query) -> Answer {
    match query {
        Query::ListServices => {
            let mut seen = HashSet::new();
            let mut names = Vec::new();
            for fd in registry.file_descriptors() {
                for svc in fd.services() {
                    if seen.insert(svc.full_name().to_string()) {
                        names.push(svc.full_name().to_string());
                    }
                }
            }
            Answer::Services(names)
        }
        Query::FileByFilename(path) => registry
            .file_descriptors()
            .iter()
            .find(|fd| fd.name() == path)
            .map(|fd| Answer::File(fd.file_descriptor_proto().encode_to_vec()))
            .unwrap_or(Answer::Error {
                code: Code::NotFound,
                message: "file not found".to_string(),
            }),
        Query::FileContainingSymbol(symbol) => registry
            .file_descriptors()
            .iter()
            .find(|fd| {
                fd.services().any(|svc| svc.full_name() == symbol)
                    || fd.messages().any(|msg| msg.full_name() == symbol)
            })
            .map(|fd| Answer::File(fd.file_descriptor_proto().encode_to_vec()))
            .unwrap_or(Answer::Error {
                code: Code::NotFound,
                message: "symbol not found".to_string(),
            }),
        Query::Unsupported => Answer::Error {
            code: Code::Unimplemented,
            message: "request type not supported".to_string(),
        },
    }
}

// -- v1 wire protocol ----------------------------------------------------------

/// Reflection service for the `grpc.reflection.v1` protocol, answering from
/// the in-memory descriptor registry instead of statically registered
/// services.
pub struct ReflectionV1 {
    registry: Arc<DescriptorRegistry>,
}

impl ReflectionV1 {
    pub fn new(registry: Arc<DescriptorRegistry>) -> Self {
        ReflectionV1 { registry }
    }
}

fn v1_query(request: &v1::ServerReflectionRequest) -> Query {
    use v1::server_reflection_request::MessageRequest;
    match &request.message_request {
        Some(MessageRequest::ListServices(_)) => Query::ListServices,
        Some(MessageRequest::FileByFilename(path)) => Query::FileByFilename(path.clone()),
        Some(MessageRequest::FileContainingSymbol(symbol)) => {
            Query::FileContainingSymbol(symbol.clone())
        }
        _ => Query::Unsupported,
    }
}

/// Build a v1 response, echoing the host and the request verbatim.
fn v1_response(
    original: v1::ServerReflectionRequest,
    answer: Answer,
) -> v1::ServerReflectionResponse {
    use v1::server_reflection_response::MessageResponse;
    let message_response = match answer {
        Answer::Services(names) => MessageResponse::ListServicesResponse(v1::ListServiceResponse {
            service: names
                .into_iter()
                .map(|name| v1::ServiceResponse { name })
                .collect(),
        }),
        Answer::File(bytes) => MessageResponse::FileDescriptorResponse(v1::FileDescriptorResponse {
            file_descriptor_proto: vec![bytes],
        }),
        Answer::Error { code, message } => MessageResponse::ErrorResponse(v1::ErrorResponse {
            error_code: code as i32,
            error_message: message,
        }),
    };
    v1::ServerReflectionResponse {
        valid_host: original.host.clone(),
        original_request: Some(original),
        message_response: Some(message_response),
    }
}

#[tonic::async_trait]
impl v1::server_reflection_server::ServerReflection for ReflectionV1 {
    type ServerReflectionInfoStream =
        Pin<Box<dyn Stream<Item = Result<v1::ServerReflectionResponse, Status>> + Send + 'static>>;

    async fn server_reflection_info(
        &self,
        request: Request<Streaming<v1::ServerReflectionRequest>>,
    ) -> Result<Response<Self::ServerReflectionInfoStream>, Status> {
        let registry = self.registry.clone();
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(4);

        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(req)) => {
                        let resp = v1_response(req.clone(), answer(&registry, v1_query(&req)));
                        if tx.send(Ok(resp)).await.is_err() {
                            break;
                        }
                    }
                    // Client half-close ends the stream cleanly.
                    Ok(None) => break,
                    Err(status) => {
                        let _ = tx.send(Err(status)).await;
                        break;
                    }
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

// -- v1alpha wire protocol -----------------------------------------------------

/// Reflection service for the wire-compatible `v1alpha` variant. Same
/// decision logic; only the generated types differ.
pub struct ReflectionV1Alpha {
    registry: Arc<DescriptorRegistry>,
}

impl ReflectionV1Alpha {
    pub fn new(registry: Arc<DescriptorRegistry>) -> Self {
        ReflectionV1Alpha { registry }
    }
}

fn v1alpha_query(request: &v1alpha::ServerReflectionRequest) -> Query {
    use v1alpha::server_reflection_request::MessageRequest;
    match &request.message_request {
        Some(MessageRequest::ListServices(_)) => Query::ListServices,
        Some(MessageRequest::FileByFilename(path)) => Query::FileByFilename(path.clone()),
        Some(MessageRequest::FileContainingSymbol(symbol)) => {
            Query::FileContainingSymbol(symbol.clone())
        }
        _ => Query::Unsupported,
    }
}

fn v1alpha_response(
    original: v1alpha::ServerReflectionRequest,
    answer: Answer,
) -> v1alpha::ServerReflectionResponse {
    use v1alpha::server_reflection_response::MessageResponse;
    let message_response = match answer {
        Answer::Services(names) => {
            MessageResponse::ListServicesResponse(v1alpha::ListServiceResponse {
                service: names
                    .into_iter()
                    .map(|name| v1alpha::ServiceResponse { name })
                    .collect(),
            })
        }
        Answer::File(bytes) => {
            MessageResponse::FileDescriptorResponse(v1alpha::FileDescriptorResponse {
                file_descriptor_proto: vec![bytes],
            })
        }
        Answer::Error { code, message } => MessageResponse::ErrorResponse(v1alpha::ErrorResponse {
            error_code: code as i32,
            error_message: message,
        }),
    };
    v1alpha::ServerReflectionResponse {
        valid_host: original.host.clone(),
        original_request: Some(original),
        message_response: Some(message_response),
    }
}

#[tonic::async_trait]
impl v1alpha::server_reflection_server::ServerReflection for ReflectionV1Alpha {
    type ServerReflectionInfoStream = Pin<
        Box<dyn Stream<Item = Result<v1alpha::ServerReflectionResponse, Status>> + Send + 'static>,
    >;

    async fn server_reflection_info(
        &self,
        request: Request<Streaming<v1alpha::ServerReflectionRequest>>,
    ) -> Result<Response<Self::ServerReflectionInfoStream>, Status> {
        let registry = self.registry.clone();
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(4);

        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(req)) => {
                        let resp =
                            v1alpha_response(req.clone(), answer(&registry, v1alpha_query(&req)));
                        if tx.send(Ok(resp)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(status) => {
                        let _ = tx.send(Err(status)).await;
                        break;
                    }
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}
