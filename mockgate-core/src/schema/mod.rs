//! Schema resolution and dynamic message codec.
//!
//! Backends are never compiled against: their services are discovered
//! through gRPC server reflection and loaded into a prost-reflect
//! descriptor pool ([`shape`]). Messages of those types move between
//! protobuf wire bytes and a JSON view ([`json`]).

pub mod json;
pub mod reflection;
pub mod shape;

use bytes::Bytes;
use prost::Message;
use thiserror::Error;

use crate::grpc::{FrameError, GrpcStatus};

pub use json::{JsonOptions, bind, template, to_json};
pub use prost_reflect::{DynamicMessage, MessageDescriptor};
pub use reflection::{ReflectionResolver, SchemaSource};
pub use shape::{FieldShape, MethodDescriptor, ScalarKind, ServiceDescriptor, build_services};

/// Failures while discovering a backend's schema. Any of these aborts the
/// upstream registration or reload that triggered resolution.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("reflected files do not form a valid descriptor set: {0}")]
    Pool(#[from] prost_reflect::DescriptorError),

    #[error("reflection call to {backend} failed: {reason}")]
    Backend { backend: String, reason: String },

    #[error("reflection returned status {0}")]
    Status(GrpcStatus),

    #[error("reflection protocol error: {0}")]
    Protocol(String),

    #[error("invalid reflection frame: {0}")]
    Frame(#[from] FrameError),

    #[error("invalid descriptor bytes: {0}")]
    Descriptor(#[from] prost::DecodeError),

    #[error("backend {0} exposes no services")]
    NoServices(String),
}

/// Failures converting message values between wire bytes and JSON.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed wire data: {0}")]
    Wire(#[from] prost::DecodeError),

    #[error("{0}")]
    Json(#[from] serde_json::Error),

    #[error("message {message} must be a JSON object")]
    ExpectedObject { message: String },
}

/// Parse wire bytes as a message of type `desc`.
pub fn decode(desc: &MessageDescriptor, bytes: &[u8]) -> Result<DynamicMessage, CodecError> {
    Ok(DynamicMessage::decode(desc.clone(), bytes)?)
}

/// Bind a JSON view and serialize it to wire bytes.
pub fn encode_json(desc: &MessageDescriptor, json: &serde_json::Value) -> Result<Bytes, CodecError> {
    let message = bind(desc, json)?;
    Ok(Bytes::from(message.encode_to_vec()))
}

/// Parse wire bytes and render them as a JSON view.
pub fn decode_json(
    desc: &MessageDescriptor,
    bytes: &[u8],
    opts: &JsonOptions,
) -> Result<serde_json::Value, CodecError> {
    to_json(&decode(desc, bytes)?, opts)
}
