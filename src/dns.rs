pub mod rewrite;

use std::{
    net::{Ipv4Addr, Ipv6Addr},
    sync::Arc,
};

use axum::{
    Router,
    body::{Body, to_bytes},
    extract::{RawQuery, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use tracing::{info, warn};

use crate::config::DnsSettings;
use crate::telemetry::EdgeMetrics;

use self::rewrite::rewrite_query;

pub const DNS_CONTENT_TYPE: &str = "application/dns-message";

const RECORD_TYPE_A: u16 = 1;
const RECORD_TYPE_AAAA: u16 = 28;
const CLASS_IN: u16 = 1;
const MAX_DNS_MESSAGE: usize = u16::MAX as usize;

/// Fixed answers handed out for A and AAAA questions.
///
/// Each entry holds the encoded resource record minus its NAME:
/// TYPE, CLASS, TTL, RDLENGTH and RDATA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerTable {
    a_record: Vec<u8>,
    aaaa_record: Vec<u8>,
}

impl AnswerTable {
    pub fn new(ipv4: Ipv4Addr, ipv6: Ipv6Addr, ttl: u32) -> Self {
        Self {
            a_record: encode_record(RECORD_TYPE_A, ttl, &ipv4.octets()),
            aaaa_record: encode_record(RECORD_TYPE_AAAA, ttl, &ipv6.octets()),
        }
    }

    pub fn from_settings(settings: &DnsSettings) -> Self {
        Self::new(settings.ipv4, settings.ipv6, settings.ttl_seconds)
    }

    /// Encoded record for `qtype`, or `None` when no answer is synthesised.
    pub fn record_for(&self, qtype: u16) -> Option<&[u8]> {
        match qtype {
            RECORD_TYPE_A => Some(&self.a_record),
            RECORD_TYPE_AAAA => Some(&self.aaaa_record),
            _ => None,
        }
    }
}

impl Default for AnswerTable {
    fn default() -> Self {
        Self::from_settings(&DnsSettings::default())
    }
}

fn encode_record(record_type: u16, ttl: u32, rdata: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(10 + rdata.len());
    record.extend_from_slice(&record_type.to_be_bytes());
    record.extend_from_slice(&CLASS_IN.to_be_bytes());
    record.extend_from_slice(&ttl.to_be_bytes());
    record.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
    record.extend_from_slice(rdata);
    record
}

#[derive(Clone)]
struct DohState {
    answers: Arc<AnswerTable>,
    metrics: Arc<EdgeMetrics>,
}

/// DoH responder routes. Everything outside `path` (or using another
/// method) is answered with an empty 404.
pub fn router(settings: &DnsSettings, metrics: Arc<EdgeMetrics>) -> Router {
    let state = DohState {
        answers: Arc::new(AnswerTable::from_settings(settings)),
        metrics,
    };

    Router::new()
        .route(
            &normalise_path(&settings.path),
            get(doh_get)
                .post(doh_post)
                .head(not_found)
                .fallback(not_found),
        )
        .fallback(not_found)
        .with_state(state)
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Empty-bodied failure returned by the DoH handlers.
#[derive(Debug)]
struct DohError {
    status: StatusCode,
}

impl DohError {
    fn bad_request() -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
        }
    }

    fn internal() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for DohError {
    fn into_response(self) -> Response {
        self.status.into_response()
    }
}

async fn doh_get(
    State(state): State<DohState>,
    RawQuery(raw_query): RawQuery,
) -> Result<Response, DohError> {
    let payload = extract_get_payload(raw_query.as_deref().unwrap_or("")).map_err(|err| {
        state.metrics.inc_dns_rejected();
        err
    })?;
    build_dns_response(&state, &payload)
}

async fn doh_post(State(state): State<DohState>, body: Body) -> Result<Response, DohError> {
    let payload = to_bytes(body, MAX_DNS_MESSAGE).await.map_err(|err| {
        state.metrics.inc_dns_rejected();
        warn!(error = %err, "Failed to read DoH request body");
        DohError::internal()
    })?;
    build_dns_response(&state, &payload)
}

fn build_dns_response(state: &DohState, payload: &[u8]) -> Result<Response, DohError> {
    let bytes = rewrite_query(payload, &state.answers).map_err(|err| {
        state.metrics.inc_dns_rejected();
        warn!(error = %err, "Rejected malformed DNS message");
        DohError::bad_request()
    })?;

    state.metrics.inc_dns_rewrite();
    info!(answers_len = bytes.len() - payload.len(), "rewrote dns");
    Ok(dns_response(bytes))
}

fn dns_response(bytes: Vec<u8>) -> Response {
    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = StatusCode::OK;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(DNS_CONTENT_TYPE),
    );
    response
}

/// A missing `dns` parameter decodes like an empty one and is then rejected
/// by the rewriter as a truncated message.
fn extract_get_payload(query: &str) -> Result<Vec<u8>, DohError> {
    let value = query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "dns")
        .map(|(_, value)| value)
        .unwrap_or("");

    URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|_| DohError::bad_request())
}

fn normalise_path(path: &str) -> String {
    if path.is_empty() {
        "/dns-query".into()
    } else if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    /// example.com A, RD set, uncompressed.
    const EXAMPLE_A_QUERY: [u8; 29] = [
        0x12, 0x34, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0, 7, b'e', b'x', b'a', b'm', b'p', b'l',
        b'e', 3, b'c', b'o', b'm', 0, 0, 1, 0, 1,
    ];

    fn test_router() -> Router {
        router(&DnsSettings::default(), Arc::new(EdgeMetrics::new().expect("metrics")))
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, Option<String>, Vec<u8>) {
        let response = router.oneshot(request).await.expect("infallible");
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes()
            .to_vec();
        (status, content_type, body)
    }

    #[test]
    fn answer_table_encodes_default_records() {
        let table = AnswerTable::default();
        assert_eq!(
            table.record_for(1),
            Some(&[0, 1, 0, 1, 0, 0, 14, 16, 0, 4, 63, 33, 92, 165][..])
        );
        let aaaa = table.record_for(28).expect("aaaa record");
        assert_eq!(&aaaa[..10], &[0, 28, 0, 1, 0, 0, 14, 16, 0, 16]);
        assert_eq!(
            &aaaa[10..],
            &[42, 5, 208, 24, 24, 114, 152, 11, 16, 246, 113, 232, 7, 204, 173, 46]
        );
        assert!(table.record_for(15).is_none());
        assert!(table.record_for(0).is_none());
    }

    #[tokio::test]
    async fn get_with_base64_query_is_rewritten() {
        let encoded = URL_SAFE_NO_PAD.encode(EXAMPLE_A_QUERY);
        let request = Request::builder()
            .uri(format!("/dns-query?dns={encoded}"))
            .body(Body::empty())
            .expect("request");

        let (status, content_type, body) = send(test_router(), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some(DNS_CONTENT_TYPE));
        assert_eq!(body.len(), EXAMPLE_A_QUERY.len() + 16);
        assert_eq!(&body[2..4], &[0x81, 0x00]);
        assert_eq!(&body[6..8], &[0, 1]);
        assert_eq!(&body[body.len() - 4..], &[63, 33, 92, 165]);
    }

    #[tokio::test]
    async fn post_with_raw_body_is_rewritten() {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/dns-query")
            .header(header::CONTENT_TYPE, DNS_CONTENT_TYPE)
            .body(Body::from(EXAMPLE_A_QUERY.to_vec()))
            .expect("request");

        let (status, content_type, body) = send(test_router(), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some(DNS_CONTENT_TYPE));
        let mut expected = EXAMPLE_A_QUERY.to_vec();
        expected[2] = 0x81;
        expected[7] = 1;
        assert_eq!(&body[..EXAMPLE_A_QUERY.len()], &expected[..]);
    }

    #[tokio::test]
    async fn invalid_base64_is_bad_request_with_empty_body() {
        let request = Request::builder()
            .uri("/dns-query?dns=***not-base64***")
            .body(Body::empty())
            .expect("request");

        let (status, _, body) = send(test_router(), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn missing_or_truncated_message_is_bad_request() {
        let request = Request::builder()
            .uri("/dns-query")
            .body(Body::empty())
            .expect("request");
        let (status, _, body) = send(test_router(), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.is_empty());

        let request = Request::builder()
            .method(Method::POST)
            .uri("/dns-query")
            .body(Body::from(EXAMPLE_A_QUERY[..20].to_vec()))
            .expect("request");
        let (status, _, body) = send(test_router(), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn other_paths_and_methods_are_not_found() {
        for (method, uri) in [
            (Method::GET, "/"),
            (Method::GET, "/resolve?dns=AAAA"),
            (Method::POST, "/dns-query/extra"),
            (Method::PUT, "/dns-query"),
            (Method::DELETE, "/dns-query"),
            (Method::HEAD, "/dns-query"),
        ] {
            let request = Request::builder()
                .method(method.clone())
                .uri(uri)
                .body(Body::empty())
                .expect("request");
            let (status, _, body) = send(test_router(), request).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{method} {uri}");
            assert!(body.is_empty());
        }
    }

    #[tokio::test]
    async fn head_with_valid_query_is_not_found() {
        let encoded = URL_SAFE_NO_PAD.encode(EXAMPLE_A_QUERY);
        let request = Request::builder()
            .method(Method::HEAD)
            .uri(format!("/dns-query?dns={encoded}"))
            .body(Body::empty())
            .expect("request");

        let (status, content_type, body) = send(test_router(), request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_ne!(content_type.as_deref(), Some(DNS_CONTENT_TYPE));
        assert!(body.is_empty());
    }

    #[test]
    fn extract_get_payload_picks_dns_parameter() {
        let encoded = URL_SAFE_NO_PAD.encode([1u8, 2, 3]);
        let payload = extract_get_payload(&format!("ct=x&dns={encoded}&other=1"))
            .expect("decode payload");
        assert_eq!(payload, vec![1, 2, 3]);
        assert_eq!(extract_get_payload("").expect("empty"), Vec::<u8>::new());
        assert!(extract_get_payload("dns=a=b").is_err());
    }

    #[test]
    fn normalise_path_adds_leading_slash() {
        assert_eq!(normalise_path("dns-query"), "/dns-query");
        assert_eq!(normalise_path("/custom"), "/custom");
        assert_eq!(normalise_path(""), "/dns-query");
    }
}
