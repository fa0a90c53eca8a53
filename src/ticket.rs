pub mod cache;
pub mod graphql;
pub mod upstream;

use std::{fmt, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    Router,
    body::{Body, Bytes, to_bytes},
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
};
use tracing::{debug, error, info};

use crate::config::TicketSettings;
use crate::telemetry::EdgeMetrics;
use crate::{DEVICE_ID_HEADER, OPERATION_NAME_HEADER, OPERATION_TYPE_HEADER};

use self::cache::PrefetchCache;
use self::graphql::{ADD_TICKETS_TO_CART_OPERATION, GET_LISTING_OPERATION, cart_body_from_listing};
use self::upstream::UpstreamClient;

/// Largest request body buffered before forwarding.
const MAX_REQUEST_BODY: usize = 16 * 1024 * 1024;

/// Reverse proxy to the ticket API that warms the cart while a listing loads.
#[derive(Clone)]
pub struct TicketProxy {
    upstream: UpstreamClient,
    cache: Arc<PrefetchCache>,
    mutation_document: Arc<str>,
    metrics: Arc<EdgeMetrics>,
}

impl TicketProxy {
    pub fn new(
        upstream: UpstreamClient,
        cache: Arc<PrefetchCache>,
        mutation_document: impl Into<Arc<str>>,
        metrics: Arc<EdgeMetrics>,
    ) -> Self {
        Self {
            upstream,
            cache,
            mutation_document: mutation_document.into(),
            metrics,
        }
    }

    pub fn from_settings(settings: &TicketSettings, metrics: Arc<EdgeMetrics>) -> Result<Self> {
        let upstream = UpstreamClient::new(settings.upstream_url()?, settings.buffer_size)?;
        Ok(Self::new(
            upstream,
            Arc::new(PrefetchCache::new()),
            settings.mutation_document(),
            metrics,
        ))
    }

    pub fn cache(&self) -> &Arc<PrefetchCache> {
        &self.cache
    }

    /// Route a request by its GraphQL operation header.
    ///
    /// Requests without a `device-id` are never prefetched or served from
    /// the cache.
    pub async fn handle(&self, request: Request) -> Result<Response, ProxyError> {
        let operation = header_str(request.headers(), OPERATION_NAME_HEADER).map(str::to_owned);
        let device = header_str(request.headers(), DEVICE_ID_HEADER)
            .filter(|device| !device.is_empty())
            .map(str::to_owned);

        match (operation.as_deref(), device) {
            (Some(GET_LISTING_OPERATION), Some(device)) => self.prefetch(device, request).await,
            (Some(ADD_TICKETS_TO_CART_OPERATION), Some(device)) => {
                self.add_tickets_to_cart(&device, request).await
            }
            _ => self.proxy(request).await,
        }
    }

    async fn proxy(&self, request: Request) -> Result<Response, ProxyError> {
        let (parts, body) = request.into_parts();
        let body = read_body(body).await?;
        self.forward(parts, body).await
    }

    async fn forward(&self, parts: Parts, body: Bytes) -> Result<Response, ProxyError> {
        let upstream = self
            .upstream
            .send(parts.method, &parts.uri, &parts.headers, body)
            .await
            .map_err(ProxyError::bad_gateway)?;

        self.metrics.inc_ticket_proxied();
        info!(
            path = parts.uri.path(),
            status = upstream.status().as_u16(),
            "proxied request"
        );
        Ok(self.upstream.relay(upstream))
    }

    async fn prefetch(&self, device: String, request: Request) -> Result<Response, ProxyError> {
        let (mut parts, body) = request.into_parts();
        let body = read_body(body).await?;

        let cart_body = cart_body_from_listing(&body, &self.mutation_document)
            .context("malformed GetListing body")
            .map_err(ProxyError::bad_request)?;
        let headers = mutation_headers(&parts.headers, cart_body.len());

        // Owned by its own task so the cache is filled even if this client leaves.
        let upstream = self.upstream.clone();
        let cache = Arc::clone(&self.cache);
        let method = parts.method.clone();
        let uri = parts.uri.clone();
        let key = device.clone();
        let stored = tokio::spawn(async move {
            let snapshot = upstream
                .fetch(method, &uri, &headers, Bytes::from(cart_body))
                .await
                .context("AddTicketsToCart prefetch failed")?;
            let status = snapshot.status;
            cache.store(key, snapshot);
            Ok::<_, anyhow::Error>(status)
        });

        let status = stored
            .await
            .context("prefetch task aborted")
            .map_err(ProxyError::bad_gateway)?
            .map_err(ProxyError::bad_gateway)?;
        self.metrics.inc_prefetch_stored();
        info!(device = %device, status = status.as_u16(), "stored prefetch");

        parts.headers.remove(header::ACCEPT_ENCODING);
        self.forward(parts, body).await
    }

    async fn add_tickets_to_cart(
        &self,
        device: &str,
        request: Request,
    ) -> Result<Response, ProxyError> {
        match self.cache.take(device) {
            Some(snapshot) => {
                self.metrics.inc_prefetch_hit();
                info!(device, status = snapshot.status.as_u16(), "loaded prefetch");
                Ok(snapshot.into_response())
            }
            None => {
                self.metrics.inc_prefetch_miss();
                debug!(device, "no prefetched cart");
                self.proxy(request).await
            }
        }
    }
}

/// Headers for the cart mutation, cloned from the listing request.
fn mutation_headers(listing: &HeaderMap, content_length: usize) -> HeaderMap {
    let mut headers = listing.clone();
    headers.insert(OPERATION_TYPE_HEADER, HeaderValue::from_static("mutation"));
    headers.insert(
        OPERATION_NAME_HEADER,
        HeaderValue::from_static(ADD_TICKETS_TO_CART_OPERATION),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(content_length));
    headers
}

async fn read_body(body: Body) -> Result<Bytes, ProxyError> {
    to_bytes(body, MAX_REQUEST_BODY)
        .await
        .context("failed to read request body")
        .map_err(ProxyError::internal)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Failure of a ticket request. Clients only see the status.
#[derive(Debug)]
pub struct ProxyError {
    status: StatusCode,
    source: anyhow::Error,
}

impl ProxyError {
    fn new(status: StatusCode, source: impl Into<anyhow::Error>) -> Self {
        Self {
            status,
            source: source.into(),
        }
    }

    pub fn bad_request(source: impl Into<anyhow::Error>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, source)
    }

    pub fn internal(source: impl Into<anyhow::Error>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, source)
    }

    pub fn bad_gateway(source: impl Into<anyhow::Error>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, source)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:#}", self.status, self.source)
    }
}

impl std::error::Error for ProxyError {}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        self.status.into_response()
    }
}

/// Every path and method on the ticket host goes through the proxy.
pub fn router(proxy: Arc<TicketProxy>) -> Router {
    Router::new().fallback(ticket_entry).with_state(proxy)
}

async fn ticket_entry(State(proxy): State<Arc<TicketProxy>>, request: Request) -> Response {
    let device = header_str(request.headers(), DEVICE_ID_HEADER)
        .unwrap_or_default()
        .to_owned();
    let op = header_str(request.headers(), OPERATION_NAME_HEADER)
        .unwrap_or_default()
        .to_owned();

    match proxy.handle(request).await {
        Ok(response) => {
            info!(device = %device, op = %op, status = response.status().as_u16(), "ticketswap");
            response
        }
        Err(err) => {
            proxy.metrics.inc_ticket_error();
            error!(device = %device, op = %op, status = err.status().as_u16(), error = %err, "ticketswap");
            err.into_response()
        }
    }
}
