//! Hot-reloadable gRPC mock server and pass-through proxy.
//!
//! The server holds no compiled schemas at startup. Operators upload
//! `.proto` source text over the configuration HTTP surface; the
//! [`registry::DescriptorRegistry`] compiles and indexes the descriptors in
//! memory, [`reflection`] serves schema discovery from that index, and the
//! [`dispatch::DispatchService`] routes every incoming RPC to a mocked
//! reply, an error status, or a byte-level [`proxy`] round-trip to an
//! upstream backend. Every call is recorded in [`history`].

pub mod api;
pub mod codec;
pub mod dispatch;
pub mod error;
pub mod history;
pub mod mocks;
pub mod proxy;
pub mod reflection;
pub mod registry;
pub mod server;
pub mod trace;
