use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use prost_reflect::{DynamicMessage, MethodDescriptor};
use tokio_stream::Stream;
use tonic::{Code, Status};
use uuid::Uuid;

use crate::codec::Frame;
use crate::history::{CallState, History, HistoryRegistry, Message};

/// Records one RPC into the history registry.
///
/// Opened when the dispatcher accepts a stream, fed by the recv/send paths,
/// and closed exactly once with the final status. The handle is shared
/// between the request reader and the response stream; if every holder drops
/// without reaching a terminal state (client disconnect, abandoned mock
/// delay), the entry is closed as `CANCELLED`.
pub struct CallTrace {
    registry: Arc<HistoryRegistry>,
    method: Option<MethodDescriptor>,
    proxified: AtomicBool,
    entry: Mutex<History>,
    closed: AtomicBool,
}

impl CallTrace {
    /// Create and persist an OPEN history entry for `full_method`.
    pub fn open(
        registry: Arc<HistoryRegistry>,
        full_method: &str,
        method: Option<MethodDescriptor>,
    ) -> Arc<Self> {
        let entry = History {
            id: Uuid::new_v4().to_string(),
            start_time: Utc::now(),
            end_time: None,
            full_method: full_method.to_string(),
            messages: Vec::new(),
            state: CallState::Open,
            grpc_code: 0,
            grpc_message: String::new(),
        };
        registry.save(entry.clone());
        Arc::new(CallTrace {
            registry,
            method,
            proxified: AtomicBool::new(false),
            entry: Mutex::new(entry),
            closed: AtomicBool::new(false),
        })
    }

    /// Flag every subsequently recorded message as routed via the proxy.
    pub fn mark_proxified(&self) {
        self.proxified.store(true, Ordering::Relaxed);
    }

    pub fn record_recv(&self, frame: &Frame) {
        self.record("recv", frame);
    }

    pub fn record_send(&self, frame: &Frame) {
        self.record("send", frame);
    }

    fn record(&self, direction: &str, frame: &Frame) {
        let (recognized, payload_string, payload) = match frame {
            Frame::Message(msg) => match serde_json::to_value(msg) {
                Ok(value) => (true, value.to_string(), Some(value)),
                Err(_) => (false, "<invalid message>".to_string(), None),
            },
            // Raw frames are decoded against the method schema when one is
            // known (the proxy path), otherwise kept as base64.
            Frame::Raw(bytes) => {
                let descriptor = self.method.as_ref().map(|m| {
                    if direction == "recv" {
                        m.input()
                    } else {
                        m.output()
                    }
                });
                let decoded = descriptor
                    .and_then(|desc| DynamicMessage::decode(desc, bytes.clone()).ok())
                    .and_then(|msg| serde_json::to_value(&msg).ok());
                match decoded {
                    Some(value) => (true, value.to_string(), Some(value)),
                    None => (false, BASE64.encode(bytes), None),
                }
            }
        };

        let message = Message {
            direction: direction.to_string(),
            timestamp: Utc::now(),
            recognized,
            proxified: self.proxified.load(Ordering::Relaxed),
            payload_string,
            payload,
        };

        let mut entry = self.entry.lock().expect("trace lock poisoned");
        entry.messages.push(message);
        self.registry.save(entry.clone());
    }

    /// Close the entry with the final status. First close wins; later calls
    /// (including the drop guard) are no-ops.
    pub fn close(&self, code: Code, message: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut entry = self.entry.lock().expect("trace lock poisoned");
        entry.end_time = Some(Utc::now());
        entry.state = CallState::Closed;
        entry.grpc_code = code as i32;
        entry.grpc_message = message.to_string();
        self.registry.save(entry.clone());
    }

    pub fn close_with_status(&self, status: &Status) {
        self.close(status.code(), status.message());
    }

    pub fn close_ok(&self) {
        self.close(Code::Ok, "");
    }
}

impl Drop for CallTrace {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            self.close(Code::Cancelled, "call cancelled");
        }
    }
}

/// Response-stream wrapper that records every message in yield order and
/// closes the trace when the stream reaches a terminal state.
pub struct TracedStream<S> {
    inner: S,
    trace: Arc<CallTrace>,
}

impl<S> TracedStream<S> {
    pub fn new(inner: S, trace: Arc<CallTrace>) -> Self {
        TracedStream { inner, trace }
    }
}

impl<S> Stream for TracedStream<S>
where
    S: Stream<Item = Result<Frame, Status>> + Unpin,
{
    type Item = Result<Frame, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                this.trace.record_send(&frame);
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(status))) => {
                this.trace.close_with_status(&status);
                Poll::Ready(Some(Err(status)))
            }
            Poll::Ready(None) => {
                this.trace.close_ok();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
