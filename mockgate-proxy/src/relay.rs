//! Passthrough relay between a caller stream and a backend call.
//!
//! Two tasks move frames, one per direction, under a supervisor:
//!
//! - caller → backend ends by dropping its sender (half-close); a failure
//!   on this side aborts the other task and ends the call with INTERNAL.
//! - backend → caller forwards data and trailers verbatim; when it
//!   finishes, the caller-side task is aborted.

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, Response, StatusCode};
use http_body::Body;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, warn};

use mockgate_core::grpc::{
    Code, FrameDecoder, GRPC_CONTENT_TYPE, GrpcFrame, GrpcStatus, is_connection_header,
};
use mockgate_core::upstream::{BackendConnection, BoxError};

use crate::error::{ProxyError, ProxyResult};
use crate::proxy_body::{self, FrameSender, ResponseBody};

/// Pulls whole gRPC frames off a caller's request body.
pub struct FrameReader<B> {
    body: B,
    decoder: FrameDecoder,
    eos: bool,
}

impl<B> FrameReader<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    pub fn new(body: B, max_frame_bytes: usize) -> Self {
        Self {
            body,
            decoder: FrameDecoder::new(max_frame_bytes),
            eos: false,
        }
    }

    /// Next complete frame, or `None` at a clean end of stream. Request
    /// trailers are discarded.
    pub async fn next(&mut self) -> ProxyResult<Option<GrpcFrame>> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(Some(frame));
            }
            if self.eos {
                self.decoder.finish()?;
                return Ok(None);
            }
            match self.body.frame().await {
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        self.decoder.push(&data);
                    }
                }
                Some(Err(e)) => {
                    let e: BoxError = e.into();
                    return Err(ProxyError::TransportInternal(e.to_string()));
                }
                None => self.eos = true,
            }
        }
    }
}

/// Metadata forwarded to the backend: everything except hop-by-hop headers.
pub fn outbound_metadata(inbound: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(inbound.len());
    for (name, value) in inbound {
        if !is_connection_header(name.as_str()) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// Relay a call to `backend`. `first` is the frame already consumed for
/// matching and is sent ahead of the rest of `reader`.
pub async fn relay<B>(
    backend: &BackendConnection,
    method: &str,
    metadata: HeaderMap,
    first: Option<GrpcFrame>,
    reader: FrameReader<B>,
) -> ProxyResult<Response<ResponseBody>>
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Into<BoxError>,
{
    let (c2b_tx, c2b_body) = proxy_body::channel();
    let c2b = tokio::spawn(caller_to_backend(first, reader, c2b_tx).in_current_span());

    let response = match backend
        .call(method, outbound_metadata(&metadata), c2b_body.boxed_unsync())
        .await
    {
        Ok(response) => response,
        Err(e) => {
            c2b.abort();
            return Err(e.into());
        }
    };

    let (parts, backend_body) = response.into_parts();
    if parts.status != StatusCode::OK {
        c2b.abort();
        let status = GrpcStatus::new(
            Code::from_http_status(parts.status),
            format!("backend {} answered HTTP {}", backend.name(), parts.status),
        );
        return Ok(trailers_only(status));
    }

    // Trailers-only answer: the status already sits in the headers.
    if GrpcStatus::from_headers(&parts.headers).is_some() {
        c2b.abort();
        let mut response = Response::new(empty_body());
        copy_headers(&parts.headers, response.headers_mut());
        return Ok(response);
    }

    let (b2c_tx, b2c_body) = proxy_body::channel();
    let b2c = tokio::spawn(backend_to_caller(backend_body, b2c_tx.clone()).in_current_span());
    tokio::spawn(supervise(c2b, b2c, b2c_tx).in_current_span());

    let mut response = Response::new(b2c_body.boxed());
    copy_headers(&parts.headers, response.headers_mut());
    Ok(response)
}

fn copy_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from {
        if !is_connection_header(name.as_str()) {
            to.append(name.clone(), value.clone());
        }
    }
}

async fn caller_to_backend<B>(
    first: Option<GrpcFrame>,
    mut reader: FrameReader<B>,
    tx: FrameSender,
) -> ProxyResult<()>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    if let Some(frame) = first
        && !tx.data(frame.encode()).await
    {
        return Ok(());
    }
    loop {
        match reader.next().await {
            Ok(Some(frame)) => {
                if !tx.data(frame.encode()).await {
                    // Backend call already gone; the other side reports why.
                    return Ok(());
                }
            }
            Ok(None) => return Ok(()),
            Err(e) => {
                // Reset the backend stream rather than half-closing it.
                let _ = tx.error(e.to_string()).await;
                return Err(e);
            }
        }
    }
}

/// Returns true when the backend's trailers reached the caller.
async fn backend_to_caller(mut body: Incoming, tx: FrameSender) -> bool {
    loop {
        match body.frame().await {
            Some(Ok(frame)) => match frame.into_data() {
                Ok(data) => {
                    if !tx.data(data).await {
                        debug!("Caller went away during relay");
                        return false;
                    }
                }
                Err(frame) => {
                    if let Ok(trailers) = frame.into_trailers() {
                        return tx.trailers(trailers).await;
                    }
                }
            },
            Some(Err(e)) => {
                warn!(error = %e, "Backend stream failed during relay");
                let status = GrpcStatus::internal(format!("backend stream failed: {e}"));
                return tx.trailers(status.to_trailers()).await;
            }
            None => {
                let status = GrpcStatus::internal("backend stream ended without status");
                return tx.trailers(status.to_trailers()).await;
            }
        }
    }
}

async fn supervise(
    mut c2b: JoinHandle<ProxyResult<()>>,
    mut b2c: JoinHandle<bool>,
    tx: FrameSender,
) {
    tokio::select! {
        biased;
        caller = &mut c2b => {
            match caller {
                Ok(Ok(())) => {
                    let _ = b2c.await;
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Caller stream failed during relay");
                    b2c.abort();
                    let _ = tx.trailers(ProxyError::Relay.to_status().to_trailers()).await;
                }
                Err(e) => {
                    warn!(error = %e, "Caller relay task died");
                    b2c.abort();
                    let _ = tx.trailers(ProxyError::Relay.to_status().to_trailers()).await;
                }
            }
        }
        _ = &mut b2c => {
            c2b.abort();
        }
    }
}

pub(crate) fn empty_body() -> ResponseBody {
    http_body_util::Empty::<Bytes>::new()
        .map_err(|never| -> BoxError { match never {} })
        .boxed()
}

/// Response with status in the headers and no body.
pub fn trailers_only(status: GrpcStatus) -> Response<ResponseBody> {
    let mut response = Response::new(empty_body());
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(GRPC_CONTENT_TYPE));
    status.write_headers(headers);
    response
}
