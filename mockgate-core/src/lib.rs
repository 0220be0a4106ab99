//! mockgate core: everything the proxy needs to decide, per gRPC call,
//! whether to answer from a registered case or relay to the real backend.
//!
//! The read path is a [`snapshot::Snapshot`] loaded once per call. The write
//! path (store, control plane) never touches a published snapshot; the
//! [`reload::Reloader`] rebuilds and swaps a fresh one instead.

pub mod config;
pub mod control;
pub mod grpc;
pub mod lifecycle;
pub mod matching;
pub mod reload;
pub mod rule;
pub mod schema;
pub mod snapshot;
pub mod store;
pub mod telemetry;
pub mod upstream;
