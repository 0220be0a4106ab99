//! Native gRPC wire support over HTTP/2.
//!
//! The proxy never goes through generated stubs: calls arrive as HTTP/2
//! streams and are handled at the level of length-prefixed frames, status
//! trailers, and metadata headers. Payloads stay opaque in this module.
//!
//! - **Framing**: 5-byte message prefix (compressed flag + big-endian length)
//! - **Status**: `grpc-status` / `grpc-message` trailers and trailers-only responses
//! - **Headers**: content-type detection and metadata lookup

pub mod framing;
pub mod headers;
pub mod status;

pub use framing::{
    DEFAULT_MAX_FRAME_BYTES, FrameDecoder, FrameError, GrpcFrame, decode_frames, encode_frame,
};
pub use headers::{
    GRPC_CONTENT_TYPE, MOCK_MATCHED_HEADER, MOCK_MATCHED_VALUE, is_connection_header,
    is_grpc_content_type, metadata_value, metadata_values,
};
pub use status::{Code, GrpcStatus};
