//! Schema discovery through gRPC server reflection.
//!
//! Each reflection request is sent as its own single-message call on the
//! bidirectional `ServerReflectionInfo` method, which every reflection
//! server answers independently. `v1alpha` is tried first; backends that
//! answer UNIMPLEMENTED are retried on `v1`.

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use http_body_util::{BodyExt, Full};
use prost::Message;
use prost_types::FileDescriptorProto;
use std::collections::{HashMap, HashSet};
use tracing::debug;

use super::SchemaError;
use super::shape::{ServiceDescriptor, build_services};
use crate::grpc::{Code, DEFAULT_MAX_FRAME_BYTES, GrpcStatus, decode_frames, encode_frame};
use crate::upstream::BackendConnection;

pub const REFLECTION_V1ALPHA: &str =
    "/grpc.reflection.v1alpha.ServerReflection/ServerReflectionInfo";
pub const REFLECTION_V1: &str = "/grpc.reflection.v1.ServerReflection/ServerReflectionInfo";

/// Services under this prefix are reflection plumbing, never routed.
const REFLECTION_SERVICE_PREFIX: &str = "grpc.reflection.";

/// Reflection protocol messages. `v1` and `v1alpha` share one wire format,
/// so the `v1alpha` types serve both paths.
pub use tonic_reflection::pb::v1alpha as messages;

use messages::server_reflection_request::MessageRequest;
use messages::server_reflection_response::MessageResponse;
use messages::{ServerReflectionRequest, ServerReflectionResponse};

/// Where service descriptors come from. The reload loop and the control
/// plane resolve every upstream through this seam.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    async fn resolve(&self, backend: &BackendConnection) -> Result<Vec<ServiceDescriptor>, SchemaError>;
}

/// [`SchemaSource`] backed by the server reflection protocol.
#[derive(Debug, Clone)]
pub struct ReflectionResolver {
    max_frame_bytes: usize,
}

impl Default for ReflectionResolver {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

#[async_trait]
impl SchemaSource for ReflectionResolver {
    async fn resolve(&self, backend: &BackendConnection) -> Result<Vec<ServiceDescriptor>, SchemaError> {
        match self.resolve_on(backend, REFLECTION_V1ALPHA).await {
            Err(SchemaError::Status(status)) if status.code == Code::Unimplemented => {
                debug!(backend = backend.name(), "v1alpha reflection unimplemented, trying v1");
                self.resolve_on(backend, REFLECTION_V1).await
            }
            other => other,
        }
    }
}

impl ReflectionResolver {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    async fn resolve_on(
        &self,
        backend: &BackendConnection,
        path: &str,
    ) -> Result<Vec<ServiceDescriptor>, SchemaError> {
        let listed = match self
            .exchange(backend, path, MessageRequest::ListServices(String::new()))
            .await?
        {
            MessageResponse::ListServicesResponse(list) => list.service,
            _ => return Err(SchemaError::Protocol("expected list_services response".into())),
        };
        let service_names: Vec<String> = listed
            .into_iter()
            .map(|s| s.name)
            .filter(|name| !name.starts_with(REFLECTION_SERVICE_PREFIX))
            .collect();
        if service_names.is_empty() {
            return Err(SchemaError::NoServices(backend.name().to_string()));
        }

        let mut files = FileSet::default();
        for service in &service_names {
            let response = self
                .exchange(backend, path, MessageRequest::FileContainingSymbol(service.clone()))
                .await?;
            files.absorb(response)?;
        }

        // Close the set over imports.
        loop {
            let missing = files.missing_dependencies();
            if missing.is_empty() {
                break;
            }
            for name in missing {
                let response = self
                    .exchange(backend, path, MessageRequest::FileByFilename(name.clone()))
                    .await?;
                files.absorb(response)?;
                if !files.contains(&name) {
                    return Err(SchemaError::Protocol(format!(
                        "backend did not return requested file {name}"
                    )));
                }
            }
        }

        let services = build_services(&files.into_vec(), |name| {
            name.starts_with(REFLECTION_SERVICE_PREFIX)
        })?;
        debug!(
            backend = backend.name(),
            services = services.len(),
            "Resolved backend schema via reflection"
        );
        Ok(services)
    }

    /// One reflection request → one response.
    async fn exchange(
        &self,
        backend: &BackendConnection,
        path: &str,
        request: MessageRequest,
    ) -> Result<MessageResponse, SchemaError> {
        let message = ServerReflectionRequest {
            host: String::new(),
            message_request: Some(request),
        };
        let body = Full::new(encode_frame(&message.encode_to_vec()))
            .map_err(|never| match never {})
            .boxed_unsync();

        let backend_error = |reason: String| SchemaError::Backend {
            backend: backend.name().to_string(),
            reason,
        };
        let response = backend
            .call(path, HeaderMap::new(), body)
            .await
            .map_err(|e| backend_error(e.to_string()))?;
        let (parts, body) = response.into_parts();

        // Trailers-only responses carry the status in the headers.
        if let Some(status) = GrpcStatus::from_headers(&parts.headers)
            && !status.is_ok()
        {
            return Err(SchemaError::Status(status));
        }
        if !parts.status.is_success() {
            return Err(SchemaError::Status(GrpcStatus::new(
                Code::from_http_status(parts.status),
                format!("HTTP {}", parts.status),
            )));
        }

        let collected = body
            .collect()
            .await
            .map_err(|e| backend_error(e.to_string()))?;
        if let Some(status) = collected.trailers().and_then(GrpcStatus::from_headers)
            && !status.is_ok()
        {
            return Err(SchemaError::Status(status));
        }
        let bytes: Bytes = collected.to_bytes();
        let frame = decode_frames(&bytes, self.max_frame_bytes)?
            .into_iter()
            .next()
            .ok_or_else(|| SchemaError::Protocol("empty reflection response".into()))?;
        let reply = ServerReflectionResponse::decode(frame.payload)?;
        match reply.message_response {
            Some(MessageResponse::ErrorResponse(e)) => Err(SchemaError::Status(GrpcStatus::new(
                Code::from_i32(e.error_code),
                e.error_message,
            ))),
            Some(other) => Ok(other),
            None => Err(SchemaError::Protocol("reflection response has no payload".into())),
        }
    }
}

/// Descriptor files collected so far, in arrival order.
#[derive(Default)]
struct FileSet {
    order: Vec<String>,
    files: HashMap<String, FileDescriptorProto>,
}

impl FileSet {
    fn absorb(&mut self, response: MessageResponse) -> Result<(), SchemaError> {
        let MessageResponse::FileDescriptorResponse(response) = response else {
            return Err(SchemaError::Protocol("expected file descriptor response".into()));
        };
        for raw in response.file_descriptor_proto {
            let file = FileDescriptorProto::decode(raw.as_slice())?;
            let name = file.name().to_string();
            if !self.files.contains_key(&name) {
                self.order.push(name.clone());
                self.files.insert(name, file);
            }
        }
        Ok(())
    }

    fn contains(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    fn missing_dependencies(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.order
            .iter()
            .filter_map(|name| self.files.get(name))
            .flat_map(|file| file.dependency.iter())
            .filter(|dep| !self.files.contains_key(*dep) && seen.insert((*dep).clone()))
            .cloned()
            .collect()
    }

    fn into_vec(mut self) -> Vec<FileDescriptorProto> {
        self.order
            .iter()
            .filter_map(|name| self.files.remove(name))
            .collect()
    }
}
