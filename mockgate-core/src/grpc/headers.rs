//! gRPC header helpers.

use http::HeaderMap;

/// Base content type of every gRPC call.
pub const GRPC_CONTENT_TYPE: &str = "application/grpc";

/// Response header attached to synthesized (mocked) responses.
pub const MOCK_MATCHED_HEADER: &str = "mock";

/// Value of [`MOCK_MATCHED_HEADER`] on mocked responses.
pub const MOCK_MATCHED_VALUE: &str = "matched";

/// Returns true for `application/grpc` and its `+proto`/`+json` variants.
pub fn is_grpc_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            let v = v.trim().to_ascii_lowercase();
            v == GRPC_CONTENT_TYPE
                || v.starts_with("application/grpc+")
                || v.starts_with("application/grpc;")
        })
        .unwrap_or(false)
}

/// First UTF-8 value recorded for a metadata key.
pub fn metadata_value<'a>(headers: &'a HeaderMap, key: &str) -> Option<&'a str> {
    headers
        .get_all(key)
        .iter()
        .find_map(|v| std::str::from_utf8(v.as_bytes()).ok())
}

/// Every UTF-8 value recorded for a metadata key, in arrival order.
pub fn metadata_values<'a>(headers: &'a HeaderMap, key: &str) -> Vec<&'a str> {
    headers
        .get_all(key)
        .iter()
        .filter_map(|v| std::str::from_utf8(v.as_bytes()).ok())
        .collect()
}

/// Headers that describe one HTTP hop and are never copied onto another call.
pub fn is_connection_header(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_grpc_content_types() {
        let mut headers = HeaderMap::new();
        assert!(!is_grpc_content_type(&headers));

        headers.insert("content-type", HeaderValue::from_static("application/grpc"));
        assert!(is_grpc_content_type(&headers));

        headers.insert(
            "content-type",
            HeaderValue::from_static("application/grpc+proto"),
        );
        assert!(is_grpc_content_type(&headers));

        headers.insert("content-type", HeaderValue::from_static("application/json"));
        assert!(!is_grpc_content_type(&headers));
    }

    #[test]
    fn test_metadata_lookup_keeps_order() {
        let mut headers = HeaderMap::new();
        headers.append("mock", HeaderValue::from_static("yes"));
        headers.append("mock", HeaderValue::from_static("no"));

        assert_eq!(metadata_value(&headers, "mock"), Some("yes"));
        assert_eq!(metadata_values(&headers, "mock"), vec!["yes", "no"]);
        assert_eq!(metadata_value(&headers, "case"), None);
    }

    #[test]
    fn test_connection_headers() {
        assert!(is_connection_header("te"));
        assert!(is_connection_header("content-length"));
        assert!(!is_connection_header("tested_app_name"));
        assert!(!is_connection_header("authorization"));
    }
}
