//! mockgate gRPC proxy.
//!
//! The gRPC listener, the per-call mock-or-relay service and the admin
//! server exposing health, metrics and the control API.

pub mod admin;
pub mod error;
pub mod ports;
pub mod proxy_body;
pub mod proxy_config;
pub mod proxy_service;
pub mod relay;
