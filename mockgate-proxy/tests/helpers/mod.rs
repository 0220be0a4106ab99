//! Shared fixtures for the end-to-end tests: a fake backend, an in-process
//! proxy wired the way the binary wires it, and an HTTP/2 gRPC client.

#![allow(dead_code)]

pub mod fake_backend;

use bytes::Bytes;
use http::{HeaderMap, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use mockgate_core::control::ControlPlane;
use mockgate_core::grpc::{GrpcStatus, decode_frames, encode_frame};
use mockgate_core::matching::{MatchEngine, MatchKeys};
use mockgate_core::reload::{ReloadSettings, Reloader};
use mockgate_core::schema::ReflectionResolver;
use mockgate_core::snapshot::SnapshotHandle;
use mockgate_core::store::{Case, MemoryCaseStore, UpstreamConfig};
use mockgate_core::upstream::{BackendPool, PoolSettings};
use mockgate_proxy::proxy_service::ProxyService;
use prost::Message;
use prost_types::field_descriptor_proto::{Label, Type};
use prost_types::{
    DescriptorProto, FieldDescriptorProto, FileDescriptorProto, MethodDescriptorProto,
    ServiceDescriptorProto,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub use fake_backend::FakeBackend;

pub const SAY_HELLO: &str = "/demo.Greeter/SayHello";
pub const SLOW_HELLO: &str = "/demo.Greeter/SlowHello";
pub const REFUSE: &str = "/demo.Greeter/Refuse";

#[derive(Clone, PartialEq, prost::Message)]
pub struct HelloRequest {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(int32, tag = "2")]
    pub id: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HelloReply {
    #[prost(string, tag = "1")]
    pub message: String,
}

fn field(name: &str, number: i32, ty: Type) -> FieldDescriptorProto {
    FieldDescriptorProto {
        name: Some(name.into()),
        number: Some(number),
        label: Some(Label::Optional as i32),
        r#type: Some(ty as i32),
        json_name: Some(name.into()),
        ..Default::default()
    }
}

fn method(name: &str) -> MethodDescriptorProto {
    MethodDescriptorProto {
        name: Some(name.into()),
        input_type: Some(".demo.HelloRequest".into()),
        output_type: Some(".demo.HelloReply".into()),
        ..Default::default()
    }
}

/// `demo.proto`: `service Greeter { SayHello, SlowHello, Refuse }`.
pub fn demo_file() -> FileDescriptorProto {
    FileDescriptorProto {
        name: Some("demo.proto".into()),
        package: Some("demo".into()),
        syntax: Some("proto3".into()),
        message_type: vec![
            DescriptorProto {
                name: Some("HelloRequest".into()),
                field: vec![field("name", 1, Type::String), field("id", 2, Type::Int32)],
                ..Default::default()
            },
            DescriptorProto {
                name: Some("HelloReply".into()),
                field: vec![field("message", 1, Type::String)],
                ..Default::default()
            },
        ],
        service: vec![ServiceDescriptorProto {
            name: Some("Greeter".into()),
            method: vec![method("SayHello"), method("SlowHello"), method("Refuse")],
            ..Default::default()
        }],
        ..Default::default()
    }
}

pub fn case(app: &str, name: &str, rule: &str, body: serde_json::Value) -> Case {
    Case {
        app: app.into(),
        method: SAY_HELLO.into(),
        name: name.into(),
        rule: rule.into(),
        priority: 0,
        body,
    }
}

/// A proxy listening on a random local port, fronting a [`FakeBackend`].
pub struct Harness {
    pub backend: FakeBackend,
    pub control: Arc<ControlPlane>,
    pub snapshot: SnapshotHandle,
    pub addr: SocketAddr,
    client: Client<HttpConnector, Full<Bytes>>,
    shutdown: CancellationToken,
}

impl Harness {
    /// Start a backend, register it as upstream `demo` and publish the
    /// first snapshot.
    pub async fn start() -> Self {
        let backend = FakeBackend::start().await;

        let snapshot = SnapshotHandle::default();
        let store = Arc::new(MemoryCaseStore::new());
        let schema = Arc::new(ReflectionResolver::default());
        let pool = BackendPool::new(&PoolSettings::default()).unwrap();
        let reloader = Arc::new(Reloader::new(
            store.clone(),
            schema.clone(),
            pool.clone(),
            snapshot.clone(),
            ReloadSettings::default(),
        ));
        let control = Arc::new(ControlPlane::new(store, schema, pool, reloader));

        control
            .add_upstream(UpstreamConfig {
                name: "demo".into(),
                endpoints: vec![backend.endpoint()],
                token: None,
            })
            .await
            .unwrap();
        control.reload().await.unwrap();

        let service = ProxyService::new(
            snapshot.clone(),
            MatchEngine::new(MatchKeys::default(), true),
            4 * 1024 * 1024,
        );
        let shutdown = CancellationToken::new();
        let addr = serve(service, shutdown.clone()).await;

        let client = Client::builder(TokioExecutor::new())
            .http2_only(true)
            .build_http();

        Self {
            backend,
            control,
            snapshot,
            addr,
            client,
            shutdown,
        }
    }

    /// Store `cases` through the control plane and publish them.
    pub async fn set_cases(&self, cases: Vec<Case>) {
        self.control.set_cases(cases).await.unwrap();
        self.control.reload().await.unwrap();
    }

    /// Send one call carrying `frames` as its request messages.
    pub async fn call(
        &self,
        path: &str,
        metadata: &[(&str, &str)],
        frames: &[HelloRequest],
    ) -> GrpcReply {
        let mut body = Vec::new();
        for frame in frames {
            body.extend_from_slice(&encode_frame(&frame.encode_to_vec()));
        }

        let mut builder = Request::post(format!("http://{}{}", self.addr, path))
            .header("content-type", "application/grpc")
            .header("te", "trailers");
        for (key, value) in metadata {
            builder = builder.header(*key, *value);
        }
        let request = builder.body(Full::new(Bytes::from(body))).unwrap();

        let response = self.client.request(request).await.unwrap();
        GrpcReply::read(response).await
    }

    pub async fn hello(&self, metadata: &[(&str, &str)], name: &str, id: i32) -> GrpcReply {
        let request = HelloRequest {
            name: name.into(),
            id,
        };
        self.call(SAY_HELLO, metadata, &[request]).await
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A finished call as seen by the client.
pub struct GrpcReply {
    pub http_status: StatusCode,
    pub headers: HeaderMap,
    pub trailers: Option<HeaderMap>,
    pub messages: Vec<HelloReply>,
}

impl GrpcReply {
    async fn read(response: http::Response<Incoming>) -> Self {
        let (parts, body) = response.into_parts();
        let collected = body.collect().await.unwrap();
        let trailers = collected.trailers().cloned();
        let bytes = collected.to_bytes();
        let messages = decode_frames(&bytes, 4 * 1024 * 1024)
            .unwrap()
            .into_iter()
            .map(|f| HelloReply::decode(f.payload).unwrap())
            .collect();
        Self {
            http_status: parts.status,
            headers: parts.headers,
            trailers,
            messages,
        }
    }

    /// Status from the trailers, or from the headers for trailers-only
    /// answers.
    pub fn status(&self) -> GrpcStatus {
        self.trailers
            .as_ref()
            .and_then(GrpcStatus::from_headers)
            .or_else(|| GrpcStatus::from_headers(&self.headers))
            .unwrap()
    }

    pub fn message(&self) -> &str {
        &self.messages[0].message
    }

    pub fn is_mocked(&self) -> bool {
        self.headers.get("mock").is_some_and(|v| v == "matched")
    }
}

/// Serve `service` on a random port until `shutdown` fires.
async fn serve(service: ProxyService, shutdown: CancellationToken) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let stream = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(_) => continue,
                },
                _ = shutdown.cancelled() => break,
            };
            let service = service.clone();
            tokio::spawn(async move {
                let svc = hyper::service::service_fn(move |req: Request<Incoming>| {
                    let service = service.clone();
                    async move { Ok::<_, Infallible>(service.handle(req).await) }
                });
                let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), svc)
                    .await;
            });
        }
    });
    addr
}
