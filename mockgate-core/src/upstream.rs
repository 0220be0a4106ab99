//! Backend connections.
//!
//! Every upstream is reached through one shared HTTP/2 client so connections
//! are pooled across snapshot rebuilds. A [`BackendConnection`] is only an
//! addressing record (base URI plus token) around that client.

use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue, TE};
use http::uri::{PathAndQuery, Scheme};
use http::{HeaderMap, Method, Request, Response, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use hyper::body::Incoming;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::TokioExecutor;
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::grpc::GRPC_CONTENT_TYPE;
use crate::store::UpstreamConfig;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Request body type accepted by backend calls.
pub type OutboundBody = UnsyncBoxBody<Bytes, BoxError>;

type HttpsClient = Client<HttpsConnector<HttpConnector>, OutboundBody>;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream {name} has no endpoints")]
    NoEndpoints { name: String },

    #[error("invalid endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("invalid request to {backend}: {reason}")]
    Request { backend: String, reason: String },

    #[error("call to {backend} failed: {source}")]
    Connect {
        backend: String,
        #[source]
        source: hyper_util::client::legacy::Error,
    },
}

/// Client tuning shared by every backend.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub tcp_nodelay: bool,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            pool_max_idle_per_host: 32,
            pool_idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Shared HTTP/2 client from which backend connections are handed out.
#[derive(Clone)]
pub struct BackendPool {
    client: HttpsClient,
}

impl BackendPool {
    /// # Errors
    ///
    /// Returns `UpstreamError::Tls` when the rustls provider cannot be
    /// installed.
    pub fn new(settings: &PoolSettings) -> Result<Self, UpstreamError> {
        static RUSTLS_INIT: OnceLock<Result<(), ()>> = OnceLock::new();
        let init_result = RUSTLS_INIT.get_or_init(|| {
            rustls::crypto::ring::default_provider()
                .install_default()
                .map_err(|_| ())
        });
        if init_result.is_err() {
            return Err(UpstreamError::Tls(
                "failed to install rustls crypto provider".into(),
            ));
        }

        let mut http_connector = HttpConnector::new();
        http_connector.set_nodelay(settings.tcp_nodelay);
        http_connector.enforce_http(false);

        // Plaintext backends still work without a root store.
        let builder = match HttpsConnectorBuilder::new().with_native_roots() {
            Ok(builder) => builder,
            Err(e) => {
                warn!(error = %e, "No native TLS roots available, https backends will fail");
                HttpsConnectorBuilder::new().with_tls_config(
                    rustls::ClientConfig::builder()
                        .with_root_certificates(rustls::RootCertStore::empty())
                        .with_no_client_auth(),
                )
            }
        };
        let https_connector = builder
            .https_or_http()
            .enable_http2()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new())
            .http2_only(true)
            .http2_keep_alive_while_idle(true)
            .pool_max_idle_per_host(settings.pool_max_idle_per_host)
            .pool_idle_timeout(settings.pool_idle_timeout)
            .build(https_connector);

        Ok(Self { client })
    }

    /// Address an upstream. The first endpoint is the routing target; no
    /// network I/O happens until a call is made.
    pub fn connect(&self, upstream: &UpstreamConfig) -> Result<BackendConnection, UpstreamError> {
        let endpoint = upstream
            .endpoints
            .first()
            .ok_or_else(|| UpstreamError::NoEndpoints {
                name: upstream.name.clone(),
            })?;
        Ok(BackendConnection {
            name: upstream.name.clone(),
            base_uri: parse_endpoint(endpoint)?,
            token: upstream.token.clone().filter(|t| !t.is_empty()),
            client: self.client.clone(),
        })
    }
}

impl fmt::Debug for BackendPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendPool").finish_non_exhaustive()
    }
}

/// Endpoints without a scheme are plaintext HTTP/2.
fn parse_endpoint(endpoint: &str) -> Result<Uri, UpstreamError> {
    let invalid = |reason: String| UpstreamError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason,
    };
    let text = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("http://{endpoint}")
    };
    let uri: Uri = text.parse().map_err(|e: http::uri::InvalidUri| invalid(e.to_string()))?;
    match uri.scheme() {
        Some(s) if *s == Scheme::HTTP || *s == Scheme::HTTPS => {}
        _ => return Err(invalid("scheme must be http or https".into())),
    }
    if uri.authority().is_none() {
        return Err(invalid("missing host".into()));
    }
    Ok(uri)
}

/// One backend target.
#[derive(Clone)]
pub struct BackendConnection {
    name: String,
    base_uri: Uri,
    token: Option<String>,
    client: HttpsClient,
}

impl BackendConnection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_uri(&self) -> &Uri {
        &self.base_uri
    }

    /// Two connections address the same backend identically.
    pub fn same_target(&self, other: &BackendConnection) -> bool {
        self.base_uri == other.base_uri && self.token == other.token
    }

    /// Start a gRPC call on `path` (`/pkg.Service/Method`).
    ///
    /// `metadata` is forwarded as request headers; content-type, `te` and
    /// the bearer token are filled in when the caller did not supply them.
    /// Returns once the backend's response headers arrive.
    pub async fn call(
        &self,
        path: &str,
        mut metadata: HeaderMap,
        body: OutboundBody,
    ) -> Result<Response<Incoming>, UpstreamError> {
        let uri = self.uri_for(path)?;
        metadata
            .entry(CONTENT_TYPE)
            .or_insert(HeaderValue::from_static(GRPC_CONTENT_TYPE));
        metadata.insert(TE, HeaderValue::from_static("trailers"));
        if let Some(token) = &self.token
            && !metadata.contains_key(AUTHORIZATION)
        {
            let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| {
                UpstreamError::Request {
                    backend: self.name.clone(),
                    reason: format!("invalid token: {e}"),
                }
            })?;
            metadata.insert(AUTHORIZATION, value);
        }

        let mut request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .version(http::Version::HTTP_2)
            .body(body)
            .map_err(|e| UpstreamError::Request {
                backend: self.name.clone(),
                reason: e.to_string(),
            })?;
        *request.headers_mut() = metadata;

        self.client
            .request(request)
            .await
            .map_err(|source| UpstreamError::Connect {
                backend: self.name.clone(),
                source,
            })
    }

    fn uri_for(&self, path: &str) -> Result<Uri, UpstreamError> {
        let path_and_query =
            PathAndQuery::try_from(path).map_err(|e| UpstreamError::Request {
                backend: self.name.clone(),
                reason: format!("invalid path {path:?}: {e}"),
            })?;
        let mut parts = self.base_uri.clone().into_parts();
        parts.path_and_query = Some(path_and_query);
        Uri::from_parts(parts).map_err(|e| UpstreamError::Request {
            backend: self.name.clone(),
            reason: e.to_string(),
        })
    }
}

impl fmt::Debug for BackendConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConnection")
            .field("name", &self.name)
            .field("base_uri", &self.base_uri)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream(endpoints: &[&str], token: Option<&str>) -> UpstreamConfig {
        UpstreamConfig {
            name: "users".to_string(),
            endpoints: endpoints.iter().map(|e| e.to_string()).collect(),
            token: token.map(str::to_string),
        }
    }

    #[test]
    fn test_endpoint_without_scheme_defaults_to_http() {
        let uri = parse_endpoint("localhost:50051").unwrap();
        assert_eq!(uri.scheme_str(), Some("http"));
        assert_eq!(uri.authority().map(|a| a.as_str()), Some("localhost:50051"));
    }

    #[test]
    fn test_rejects_unsupported_scheme() {
        assert!(parse_endpoint("ftp://host:1").is_err());
    }

    #[tokio::test]
    async fn test_first_endpoint_is_routing_target() {
        let pool = BackendPool::new(&PoolSettings::default()).unwrap();
        let conn = pool
            .connect(&upstream(&["https://a.internal:443", "b:1"], Some("t")))
            .unwrap();
        assert_eq!(conn.base_uri().host(), Some("a.internal"));
        let uri = conn.uri_for("/pkg.Svc/Get").unwrap();
        assert_eq!(uri.to_string(), "https://a.internal:443/pkg.Svc/Get");
    }

    #[tokio::test]
    async fn test_no_endpoints_is_an_error() {
        let pool = BackendPool::new(&PoolSettings::default()).unwrap();
        assert!(matches!(
            pool.connect(&upstream(&[], None)),
            Err(UpstreamError::NoEndpoints { .. })
        ));
    }

    #[tokio::test]
    async fn test_same_target_compares_address_and_token() {
        let pool = BackendPool::new(&PoolSettings::default()).unwrap();
        let a = pool.connect(&upstream(&["h:1"], Some("t"))).unwrap();
        let b = pool.connect(&upstream(&["h:1"], Some("t"))).unwrap();
        let c = pool.connect(&upstream(&["h:1"], None)).unwrap();
        assert!(a.same_target(&b));
        assert!(!a.same_target(&c));
    }
}
