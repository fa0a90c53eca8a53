use axum::{
    body::{Body, Bytes},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use dashmap::DashMap;

/// Fully buffered upstream response kept for later replay.
#[derive(Debug, Clone, PartialEq)]
pub struct PrefetchedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl IntoResponse for PrefetchedResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Prefetched cart mutations keyed by device identifier.
///
/// Later stores overwrite earlier ones; `take` hands an entry to exactly one
/// caller. Entries never expire.
#[derive(Debug, Default)]
pub struct PrefetchCache {
    entries: DashMap<String, PrefetchedResponse>,
}

impl PrefetchCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a snapshot, returning the unconsumed one it replaced.
    pub fn store(
        &self,
        device_id: impl Into<String>,
        response: PrefetchedResponse,
    ) -> Option<PrefetchedResponse> {
        self.entries.insert(device_id.into(), response)
    }

    /// Remove and return the snapshot for `device_id`.
    pub fn take(&self, device_id: &str) -> Option<PrefetchedResponse> {
        self.entries.remove(device_id).map(|(_, response)| response)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
