//! Per-call handling: route, decide, then answer from a case or relay.
//!
//! Every call loads one snapshot up front and uses only that snapshot for
//! routing and matching, so a reload mid-call never mixes generations.

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Method, Request, Response};
use http_body::{Body, Frame};
use http_body_util::{BodyExt, StreamBody};
use std::sync::Arc;
use std::time::Instant;
use tracing::{Instrument, Span, debug, field, info_span, warn};

use mockgate_core::grpc::{
    GRPC_CONTENT_TYPE, GrpcStatus, MOCK_MATCHED_HEADER, MOCK_MATCHED_VALUE, encode_frame,
    is_grpc_content_type,
};
use mockgate_core::matching::{CallContext, MatchEngine, MockDecision};
use mockgate_core::snapshot::SnapshotHandle;
use mockgate_core::telemetry::MockGateMetrics;
use mockgate_core::upstream::BoxError;

use crate::error::{ProxyError, ProxyResult};
use crate::proxy_body::ResponseBody;
use crate::relay::{FrameReader, relay};

#[derive(Clone)]
struct ServiceInner {
    snapshot: SnapshotHandle,
    engine: MatchEngine,
    max_frame_bytes: usize,
    metrics: Option<Arc<MockGateMetrics>>,
}

/// The gRPC-facing side of the proxy. Cheap to clone.
#[derive(Clone)]
pub struct ProxyService {
    inner: Arc<ServiceInner>,
}

impl ProxyService {
    pub fn new(snapshot: SnapshotHandle, engine: MatchEngine, max_frame_bytes: usize) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                snapshot,
                engine,
                max_frame_bytes,
                metrics: None,
            }),
        }
    }

    pub fn with_metrics(self, metrics: Arc<MockGateMetrics>) -> Self {
        let mut inner = (*self.inner).clone();
        inner.metrics = Some(metrics);
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Handle one call. Failures are turned into gRPC status responses.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<ResponseBody>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Into<BoxError>,
    {
        let started = Instant::now();
        let method = req.uri().path().to_string();
        let span = info_span!(
            "grpc_call",
            method = %method,
            app = field::Empty,
            outcome = field::Empty,
        );

        async {
            let (outcome, response) = match self.dispatch(req, &method).await {
                Ok(done) => done,
                Err(e) => {
                    match &e {
                        ProxyError::Match(_) | ProxyError::UpstreamNotFound { .. } => {
                            debug!(error = %e, "Call rejected")
                        }
                        _ => warn!(error = %e, "Call failed"),
                    }
                    ("error", e.to_response())
                }
            };
            Span::current().record("outcome", outcome);
            if let Some(metrics) = &self.inner.metrics {
                metrics.record_call(
                    &method,
                    outcome,
                    started.elapsed().as_secs_f64() * 1000.0,
                );
            }
            response
        }
        .instrument(span)
        .await
    }

    async fn dispatch<B>(
        &self,
        req: Request<B>,
        method: &str,
    ) -> ProxyResult<(&'static str, Response<ResponseBody>)>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Into<BoxError>,
    {
        if req.method() != Method::POST || !is_grpc_content_type(req.headers()) {
            return Err(ProxyError::NotGrpc);
        }

        let snapshot = self.inner.snapshot.load();
        let route = snapshot
            .lookup_method(method)
            .cloned()
            .ok_or_else(|| ProxyError::UpstreamNotFound {
                method: method.to_string(),
            })?;

        let (parts, body) = req.into_parts();
        let app = self.inner.engine.keys().app(&parts.headers);
        if let Some(app) = app {
            Span::current().record("app", app);
        }

        let mut reader = FrameReader::new(body, self.inner.max_frame_bytes);
        let first = reader.next().await?;
        let request: &[u8] = match &first {
            Some(frame) if frame.compressed => {
                debug!("Compressed request frame, matching against an empty message");
                &[]
            }
            Some(frame) => &frame.payload,
            None => &[],
        };

        let decision = self.inner.engine.decide(
            &snapshot,
            &route,
            &CallContext {
                method,
                app,
                metadata: &parts.headers,
                request,
            },
        )?;
        let outcome = decision.outcome();

        match decision {
            MockDecision::MatchedMetadata(mock) | MockDecision::MatchedBody(mock) => {
                debug!(case = ?mock.case_name, outcome, "Call mocked");
                Ok((outcome, mock_response(mock.message)))
            }
            MockDecision::None => {
                drop(snapshot);
                debug!(backend = route.backend.name(), "Relaying call");
                let response = relay(&route.backend, method, parts.headers, first, reader).await?;
                Ok((outcome, response))
            }
        }
    }
}

/// A complete unary answer: headers, one message, OK trailers.
pub fn mock_response(message: Bytes) -> Response<ResponseBody> {
    let frames: Vec<Result<Frame<Bytes>, BoxError>> = vec![
        Ok(Frame::data(encode_frame(&message))),
        Ok(Frame::trailers(GrpcStatus::ok().to_trailers())),
    ];
    let body = StreamBody::new(futures_util::stream::iter(frames)).boxed();

    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(GRPC_CONTENT_TYPE));
    headers.insert(MOCK_MATCHED_HEADER, HeaderValue::from_static(MOCK_MATCHED_VALUE));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use http_body_util::Full;
    use mockgate_core::grpc::{Code, decode_frames};
    use mockgate_core::matching::MatchKeys;
    use mockgate_core::schema::{build_services, decode_json, encode_json, JsonOptions};
    use mockgate_core::snapshot::{Snapshot, SnapshotBuilder};
    use mockgate_core::store::{Case, UpstreamConfig};
    use mockgate_core::upstream::{BackendPool, PoolSettings};
    use prost_types::field_descriptor_proto::{Label, Type};
    use prost_types::{
        DescriptorProto, FieldDescriptorProto, FileDescriptorProto, MethodDescriptorProto,
        ServiceDescriptorProto,
    };
    use serde_json::json;

    const SAY_HELLO: &str = "/demo.Greeter/SayHello";

    fn field(name: &str, number: i32, ty: Type) -> FieldDescriptorProto {
        FieldDescriptorProto {
            name: Some(name.into()),
            number: Some(number),
            label: Some(Label::Optional as i32),
            r#type: Some(ty as i32),
            ..Default::default()
        }
    }

    fn demo_file() -> FileDescriptorProto {
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
                method: vec![MethodDescriptorProto {
                    name: Some("SayHello".into()),
                    input_type: Some(".demo.HelloRequest".into()),
                    output_type: Some(".demo.HelloReply".into()),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn case(app: &str, name: &str, rule: &str, body: serde_json::Value) -> Case {
        Case {
            app: app.into(),
            method: SAY_HELLO.into(),
            name: name.into(),
            rule: rule.into(),
            priority: 0,
            body,
        }
    }

    fn snapshot(cases: Vec<Case>) -> Snapshot {
        let pool = BackendPool::new(&PoolSettings::default()).unwrap();
        let backend = pool
            .connect(&UpstreamConfig {
                name: "demo".into(),
                endpoints: vec!["127.0.0.1:1".into()],
                token: None,
            })
            .unwrap();
        let services = build_services(&[demo_file()], |_| false).unwrap();
        let mut builder = SnapshotBuilder::new(1);
        builder.add_upstream(backend, &services);
        for case in cases {
            builder.add_case(case).unwrap();
        }
        builder.build()
    }

    fn service(cases: Vec<Case>) -> (ProxyService, SnapshotHandle) {
        let handle = SnapshotHandle::new(snapshot(cases));
        let service = ProxyService::new(
            handle.clone(),
            MatchEngine::new(MatchKeys::default(), true),
            4 * 1024 * 1024,
        );
        (service, handle)
    }

    fn hello_request(handle: &SnapshotHandle, body: serde_json::Value) -> Bytes {
        let snapshot = handle.load();
        let route = snapshot.lookup_method(SAY_HELLO).unwrap();
        encode_frame(&encode_json(&route.descriptor.input, &body).unwrap())
    }

    fn call(path: &str, headers: &[(&str, &str)], body: Bytes) -> Request<Full<Bytes>> {
        let mut builder = Request::post(path).header("content-type", "application/grpc");
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        builder.body(Full::new(body)).unwrap()
    }

    async fn reply_json(handle: &SnapshotHandle, response: Response<ResponseBody>) -> serde_json::Value {
        let collected = response.into_body().collect().await.unwrap();
        let status = collected.trailers().and_then(GrpcStatus::from_headers).unwrap();
        assert!(status.is_ok());
        let bytes = collected.to_bytes();
        let frames = decode_frames(&bytes, 1024).unwrap();
        let snapshot = handle.load();
        let route = snapshot.lookup_method(SAY_HELLO).unwrap();
        decode_json(&route.descriptor.output, &frames[0].payload, &JsonOptions::default()).unwrap()
    }

    #[tokio::test]
    async fn test_body_rule_mocks_call() {
        let (svc, handle) = service(vec![case("app1", "c1", "id == 5", json!({"message": "mocked"}))]);
        let body = hello_request(&handle, json!({"id": 5}));

        let response = svc
            .handle(call(SAY_HELLO, &[("tested_app_name", "app1")], body))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("mock").unwrap(), "matched");
        assert_eq!(reply_json(&handle, response).await["message"], "mocked");
    }

    #[tokio::test]
    async fn test_named_case_mocks_call() {
        let (svc, handle) = service(vec![case("app1", "c1", "", json!({"message": "named"}))]);
        let body = hello_request(&handle, json!({"id": 1}));

        let response = svc
            .handle(call(
                SAY_HELLO,
                &[("tested_app_name", "app1"), ("case", "c1")],
                body,
            ))
            .await;
        assert_eq!(reply_json(&handle, response).await["message"], "named");
    }

    #[tokio::test]
    async fn test_required_mock_without_match_is_not_found() {
        let (svc, handle) = service(vec![case("app1", "c1", "id == 5", json!({}))]);
        let body = hello_request(&handle, json!({"id": 6}));

        let response = svc
            .handle(call(SAY_HELLO, &[("tested_app_name", "app1"), ("mock", "yes")], body))
            .await;
        let status = GrpcStatus::from_headers(response.headers()).unwrap();
        assert_eq!(status.code, Code::NotFound);
        assert_eq!(status.message, "matched fail, check request and cases");
    }

    #[tokio::test]
    async fn test_unknown_method_is_unimplemented() {
        let (svc, _) = service(vec![]);
        let response = svc
            .handle(call("/demo.Greeter/Nope", &[], encode_frame(b"")))
            .await;
        let status = GrpcStatus::from_headers(response.headers()).unwrap();
        assert_eq!(status.code, Code::Unimplemented);
        assert!(status.message.contains("/demo.Greeter/Nope"));
    }

    #[tokio::test]
    async fn test_non_grpc_request_rejected() {
        let (svc, _) = service(vec![]);
        let request = Request::get(SAY_HELLO).body(Full::new(Bytes::new())).unwrap();
        let response = svc.handle(request).await;
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_unavailable() {
        let (svc, handle) = service(vec![]);
        let body = hello_request(&handle, json!({"id": 1}));
        let response = svc.handle(call(SAY_HELLO, &[], body)).await;
        let status = GrpcStatus::from_headers(response.headers()).unwrap();
        assert_eq!(status.code, Code::Unavailable);
    }

    #[tokio::test]
    async fn test_published_snapshot_applies_to_next_call() {
        let (svc, handle) = service(vec![case("app1", "c1", "", json!({"message": "old"}))]);
        let headers = [("tested_app_name", "app1"), ("case", "c1")];
        let body = hello_request(&handle, json!({}));

        let response = svc.handle(call(SAY_HELLO, &headers, body.clone())).await;
        assert_eq!(reply_json(&handle, response).await["message"], "old");

        handle.publish(SnapshotBuilder::new(2).build());
        let response = svc.handle(call(SAY_HELLO, &headers, body)).await;
        let status = GrpcStatus::from_headers(response.headers()).unwrap();
        assert_eq!(status.code, Code::Unimplemented);
    }
}
