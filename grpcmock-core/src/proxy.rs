use std::sync::Arc;

use http::uri::PathAndQuery;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::client::Grpc;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Response, Status, Streaming};

use crate::codec::{Frame, MultiplexCodec};
use crate::error::{Result, ServerError};
use crate::trace::CallTrace;

/// Both pumps must be able to post their terminal signal without blocking.
const SIGNAL_CAPACITY: usize = 2;
const FRAME_BUFFER: usize = 16;

/// Terminal signal of one pump direction. A half-close is the clean-EOF
/// sentinel; anything else is a genuine transport error.
enum PumpSignal {
    HalfClose,
    Failed(Status),
}

/// Forwards calls byte-for-byte to an upstream backend when no mock is
/// configured, without knowing the schema.
///
/// gRPC streams are full-duplex: each side half-closes its send stream when
/// done, producing exactly one clean EOF per direction. Both EOFs must be
/// observed before the call is complete; the final status is propagated by
/// the transport.
#[derive(Clone, Debug)]
pub struct Proxy {
    channel: Channel,
    target: String,
}

impl Proxy {
    /// Create a proxy to `target` over lazy plaintext transport. Dial
    /// failures surface per call as `UNAVAILABLE`.
    pub fn new(target: &str) -> Result<Self> {
        let endpoint = Endpoint::from_shared(format!("http://{target}")).map_err(|e| {
            ServerError::InvalidArgument(format!("invalid proxy target '{target}': {e}"))
        })?;
        Ok(Proxy {
            channel: endpoint.connect_lazy(),
            target: target.to_string(),
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Open an upstream stream on the same method and pump frames in both
    /// directions until each peer half-closes, propagating incoming metadata
    /// verbatim.
    pub async fn handle(
        &self,
        full_method: &str,
        request: Request<Streaming<Frame>>,
        trace: Arc<CallTrace>,
    ) -> std::result::Result<Response<ReceiverStream<std::result::Result<Frame, Status>>>, Status>
    {
        let path = PathAndQuery::try_from(full_method.to_string())
            .map_err(|e| Status::internal(format!("invalid method path: {e}")))?;

        let mut grpc = Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| Status::unavailable(format!("upstream unavailable: {e}")))?;

        let metadata = request.metadata().clone();
        let mut inbound = request.into_inner();

        let (up_tx, up_rx) = mpsc::channel::<Frame>(FRAME_BUFFER);
        let mut upstream_request = Request::new(ReceiverStream::new(up_rx));
        *upstream_request.metadata_mut() = metadata;

        tracing::debug!(method = %full_method, target = %self.target, "proxying call upstream");
        let upstream = grpc
            .streaming(upstream_request, path, MultiplexCodec::opaque())
            .await?;
        let mut upstream_body = upstream.into_inner();

        let (signal_tx, mut signal_rx) = mpsc::channel::<PumpSignal>(SIGNAL_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel::<std::result::Result<Frame, Status>>(FRAME_BUFFER);

        // Client -> upstream pump. Dropping `up_tx` on exit half-closes the
        // upstream send stream.
        {
            let trace = trace.clone();
            let signal = signal_tx.clone();
            tokio::spawn(async move {
                loop {
                    match inbound.message().await {
                        Ok(Some(frame)) => {
                            trace.record_recv(&frame);
                            if up_tx.send(frame).await.is_err() {
                                let status = Status::aborted("upstream stream closed");
                                let _ = signal.send(PumpSignal::Failed(status)).await;
                                return;
                            }
                        }
                        Ok(None) => {
                            let _ = signal.send(PumpSignal::HalfClose).await;
                            return;
                        }
                        Err(status) => {
                            let _ = signal.send(PumpSignal::Failed(status)).await;
                            return;
                        }
                    }
                }
            });
        }

        // Upstream -> client pump.
        {
            let out = out_tx.clone();
            tokio::spawn(async move {
                loop {
                    match upstream_body.message().await {
                        Ok(Some(frame)) => {
                            if out.send(Ok(frame)).await.is_err() {
                                let status = Status::cancelled("client stream closed");
                                let _ = signal_tx.send(PumpSignal::Failed(status)).await;
                                return;
                            }
                        }
                        Ok(None) => {
                            let _ = signal_tx.send(PumpSignal::HalfClose).await;
                            return;
                        }
                        Err(status) => {
                            let _ = signal_tx.send(PumpSignal::Failed(status)).await;
                            return;
                        }
                    }
                }
            });
        }

        // Wait for the first pump to finish. A genuine error aborts the call
        // with that error; a half-close waits for the second pump before the
        // response stream is allowed to end.
        tokio::spawn(async move {
            match signal_rx.recv().await {
                Some(PumpSignal::Failed(status)) => {
                    let _ = out_tx.send(Err(status)).await;
                }
                Some(PumpSignal::HalfClose) => {
                    if let Some(PumpSignal::Failed(status)) = signal_rx.recv().await {
                        let _ = out_tx.send(Err(status)).await;
                    }
                }
                None => {}
            }
        });

        Ok(Response::new(ReceiverStream::new(out_rx)))
    }
}
