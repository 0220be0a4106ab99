//! Error types for the gRPC proxy layer.

use http::{Response, StatusCode};
use thiserror::Error;

use mockgate_core::grpc::{Code, FrameError, GrpcStatus};
use mockgate_core::matching::MatchError;
use mockgate_core::upstream::UpstreamError;

use crate::proxy_body::ResponseBody;
use crate::relay::{empty_body, trailers_only};

#[derive(Error, Debug)]
pub enum ProxyError {
    /// Request is not `POST` with a gRPC content type.
    #[error("not a gRPC request")]
    NotGrpc,

    #[error("upstream not found for method {method}")]
    UpstreamNotFound { method: String },

    #[error(transparent)]
    Match(#[from] MatchError),

    /// Framing or body failure on the inbound stream.
    #[error("transport error: {0}")]
    TransportInternal(String),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// The caller's stream failed after the relay started.
    #[error("failed proxying s2c")]
    Relay,
}

impl From<FrameError> for ProxyError {
    fn from(e: FrameError) -> Self {
        ProxyError::TransportInternal(e.to_string())
    }
}

impl ProxyError {
    pub fn to_status(&self) -> GrpcStatus {
        match self {
            ProxyError::NotGrpc => GrpcStatus::new(Code::InvalidArgument, self.to_string()),
            ProxyError::UpstreamNotFound { .. } => {
                GrpcStatus::new(Code::Unimplemented, self.to_string())
            }
            ProxyError::Match(_) => GrpcStatus::new(Code::NotFound, self.to_string()),
            ProxyError::TransportInternal(_) | ProxyError::Relay => {
                GrpcStatus::internal(self.to_string())
            }
            ProxyError::Upstream(UpstreamError::Connect { .. }) => {
                GrpcStatus::new(Code::Unavailable, self.to_string())
            }
            ProxyError::Upstream(_) => GrpcStatus::internal(self.to_string()),
        }
    }

    /// Trailers-only gRPC response carrying [`Self::to_status`].
    ///
    /// Non-gRPC requests get a plain HTTP 415 instead.
    pub fn to_response(&self) -> Response<ResponseBody> {
        if matches!(self, ProxyError::NotGrpc) {
            let mut response = Response::new(empty_body());
            *response.status_mut() = StatusCode::UNSUPPORTED_MEDIA_TYPE;
            return response;
        }
        trailers_only(self.to_status())
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;
