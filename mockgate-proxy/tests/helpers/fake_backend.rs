//! A small HTTP/2 gRPC server standing in for a real backend.
//!
//! Serves `demo.Greeter` plus the v1alpha reflection service so the proxy can
//! discover it the same way it discovers production backends.

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Request, Response};
use http_body::Frame;
use http_body_util::{BodyExt, StreamBody, combinators::BoxBody};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use mockgate_core::grpc::{Code, GrpcStatus, decode_frames, encode_frame};
use mockgate_core::schema::reflection::REFLECTION_V1ALPHA;
use prost::Message;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tonic_reflection::pb::v1alpha::server_reflection_request::MessageRequest;
use tonic_reflection::pb::v1alpha::server_reflection_response::MessageResponse;
use tonic_reflection::pb::v1alpha::{
    FileDescriptorResponse, ListServiceResponse, ServerReflectionRequest,
    ServerReflectionResponse, ServiceResponse,
};

use super::{HelloReply, HelloRequest, demo_file};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type FakeBody = BoxBody<Bytes, BoxError>;

/// Handle to a running fake backend. The server stops when this is dropped.
pub struct FakeBackend {
    pub addr: SocketAddr,
    calls: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl FakeBackend {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        let server_calls = calls.clone();
        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => stream,
                        Err(_) => continue,
                    },
                    _ = server_shutdown.cancelled() => break,
                };
                let calls = server_calls.clone();
                tokio::spawn(async move {
                    let svc = hyper::service::service_fn(move |req| {
                        let calls = calls.clone();
                        async move { Ok::<_, Infallible>(route(req, calls).await) }
                    });
                    let _ = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), svc)
                        .await;
                });
            }
        });

        Self {
            addr,
            calls,
            shutdown,
        }
    }

    pub fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    /// Greeter calls answered so far (reflection traffic is not counted).
    pub fn greeter_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn route(req: Request<Incoming>, calls: Arc<AtomicUsize>) -> Response<FakeBody> {
    let path = req.uri().path().to_string();
    let (parts, body) = req.into_parts();
    let bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return status_only(GrpcStatus::internal(e.to_string())),
    };
    let frames = match decode_frames(&bytes, 4 * 1024 * 1024) {
        Ok(frames) => frames,
        Err(e) => return status_only(GrpcStatus::internal(e.to_string())),
    };

    if path == REFLECTION_V1ALPHA {
        let Some(first) = frames.first() else {
            return status_only(GrpcStatus::internal("empty reflection request"));
        };
        return reflection(&first.payload);
    }

    match path.as_str() {
        "/demo.Greeter/SayHello" | "/demo.Greeter/SlowHello" => {
            calls.fetch_add(1, Ordering::SeqCst);
            if path.ends_with("SlowHello") {
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
            // Every inbound frame contributes a name, so multi-frame relays
            // are visible in the reply.
            let names: Vec<String> = frames
                .iter()
                .filter_map(|f| HelloRequest::decode(f.payload.clone()).ok())
                .map(|r| r.name)
                .collect();
            let reply = HelloReply {
                message: format!("hello {}", names.join(",")),
            };
            let mut headers = HeaderMap::new();
            headers.insert("x-backend", HeaderValue::from_static("fake"));
            if let Some(echo) = parts.headers.get("x-echo") {
                headers.insert("x-echo", echo.clone());
            }
            let mut trailers = GrpcStatus::ok().to_trailers();
            trailers.insert("x-trailer", HeaderValue::from_static("done"));
            unary(headers, reply.encode_to_vec(), trailers)
        }
        "/demo.Greeter/Refuse" => {
            calls.fetch_add(1, Ordering::SeqCst);
            status_only(GrpcStatus::new(Code::FailedPrecondition, "backend says no"))
        }
        _ => status_only(GrpcStatus::new(Code::Unimplemented, "unknown method")),
    }
}

fn reflection(payload: &[u8]) -> Response<FakeBody> {
    let request = match ServerReflectionRequest::decode(payload) {
        Ok(request) => request,
        Err(e) => return status_only(GrpcStatus::internal(e.to_string())),
    };
    let answer = match request.message_request {
        Some(MessageRequest::ListServices(_)) => {
            MessageResponse::ListServicesResponse(ListServiceResponse {
                service: vec![
                    ServiceResponse {
                        name: "demo.Greeter".into(),
                    },
                    ServiceResponse {
                        name: "grpc.reflection.v1alpha.ServerReflection".into(),
                    },
                ],
            })
        }
        Some(MessageRequest::FileContainingSymbol(_)) | Some(MessageRequest::FileByFilename(_)) => {
            MessageResponse::FileDescriptorResponse(FileDescriptorResponse {
                file_descriptor_proto: vec![demo_file().encode_to_vec()],
            })
        }
        _ => return status_only(GrpcStatus::new(Code::Unimplemented, "unsupported reflection request")),
    };
    let response = ServerReflectionResponse {
        valid_host: String::new(),
        original_request: None,
        message_response: Some(answer),
    };
    unary(
        HeaderMap::new(),
        response.encode_to_vec(),
        GrpcStatus::ok().to_trailers(),
    )
}

fn unary(headers: HeaderMap, message: Vec<u8>, trailers: HeaderMap) -> Response<FakeBody> {
    let frames: Vec<Result<Frame<Bytes>, BoxError>> = vec![
        Ok(Frame::data(encode_frame(&message))),
        Ok(Frame::trailers(trailers)),
    ];
    let mut response = Response::new(StreamBody::new(futures_util::stream::iter(frames)).boxed());
    response
        .headers_mut()
        .insert("content-type", HeaderValue::from_static("application/grpc"));
    response.headers_mut().extend(headers);
    response
}

fn status_only(status: GrpcStatus) -> Response<FakeBody> {
    let body = http_body_util::Empty::<Bytes>::new()
        .map_err(|never| -> BoxError { match never {} })
        .boxed();
    let mut response = Response::new(body);
    response
        .headers_mut()
        .insert("content-type", HeaderValue::from_static("application/grpc"));
    status.write_headers(response.headers_mut());
    response
}
