use std::{
    io, mem,
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::{Context, Result};
use axum::{
    body::{Body, Bytes},
    http::{HeaderMap, HeaderName, Method, Uri, header},
    response::Response,
};
use futures_util::TryStreamExt;
use reqwest::{Client, redirect};
use tokio::{io::AsyncReadExt, sync::mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};
use url::Url;

use super::cache::PrefetchedResponse;

/// Buffers kept around for reuse once returned.
const DEFAULT_POOLED_BUFFERS: usize = 64;
/// Frames in flight between the relay task and the client connection.
const RELAY_CHANNEL_DEPTH: usize = 4;

const HOP_BY_HOP: [HeaderName; 5] = [
    header::CONNECTION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];
const KEEP_ALIVE: &str = "keep-alive";
const PROXY_CONNECTION: &str = "proxy-connection";
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Bounded free-list of equally sized byte buffers.
///
/// Returned buffers keep their previous contents.
#[derive(Debug)]
pub struct BufferPool {
    buffer_size: usize,
    max_pooled: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_pooled: usize) -> Arc<Self> {
        Arc::new(Self {
            buffer_size,
            max_pooled,
            free: Mutex::new(Vec::with_capacity(max_pooled)),
        })
    }

    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let reused = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let buffer = reused.unwrap_or_else(|| vec![0; self.buffer_size]);
        PooledBuffer {
            buffer,
            pool: Arc::clone(self),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of idle buffers waiting for reuse.
    pub fn available(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn release(&self, buffer: Vec<u8>) {
        if buffer.len() != self.buffer_size {
            return;
        }
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.max_pooled {
            free.push(buffer);
        }
    }
}

/// Buffer on loan from a [`BufferPool`]; goes back to the pool on drop.
#[derive(Debug)]
pub struct PooledBuffer {
    buffer: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buffer
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.release(mem::take(&mut self.buffer));
    }
}

/// HTTP client bound to the single upstream origin.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: Client,
    origin: Url,
    buffers: Arc<BufferPool>,
}

impl UpstreamClient {
    pub fn new(origin: Url, buffer_size: usize) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(None)
            .redirect(redirect::Policy::none())
            .build()
            .context("Failed to build upstream HTTP client")?;

        Ok(Self {
            client,
            origin,
            buffers: BufferPool::new(buffer_size, DEFAULT_POOLED_BUFFERS),
        })
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub fn buffers(&self) -> &Arc<BufferPool> {
        &self.buffers
    }

    /// Point the request's path and query at the upstream origin.
    pub fn target_url(&self, uri: &Uri) -> Url {
        let mut url = self.origin.clone();
        url.set_path(uri.path());
        url.set_query(uri.query());
        url
    }

    /// Issue a request upstream, forwarding end-to-end headers unchanged.
    pub async fn send(
        &self,
        method: Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: impl Into<reqwest::Body>,
    ) -> Result<reqwest::Response> {
        let url = self.target_url(uri);
        let response = self
            .client
            .request(method.clone(), url.clone())
            .headers(request_headers(headers))
            .body(body)
            .send()
            .await
            .with_context(|| format!("upstream {method} {url} failed"))?;
        Ok(response)
    }

    /// Like [`send`](Self::send) but reads the whole response into memory.
    pub async fn fetch(
        &self,
        method: Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<PrefetchedResponse> {
        let response = self.send(method, uri, headers, body).await?;
        let status = response.status();
        let headers = response_headers(response.headers());
        let body = response
            .bytes()
            .await
            .context("failed to read upstream response body")?;

        Ok(PrefetchedResponse {
            status,
            headers,
            body,
        })
    }

    /// Turn an upstream response into a client response whose body is
    /// streamed through a pooled buffer.
    ///
    /// The copy runs on its own task and stops, dropping the upstream
    /// response, as soon as the client side of the body goes away.
    pub fn relay(&self, upstream: reqwest::Response) -> Response {
        let status = upstream.status();
        let headers = response_headers(upstream.headers());
        let (tx, rx) = mpsc::channel(RELAY_CHANNEL_DEPTH);
        tokio::spawn(copy_body(upstream, self.buffers.acquire(), tx));

        let mut response = Response::new(Body::from_stream(ReceiverStream::new(rx)));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }
}

async fn copy_body(
    upstream: reqwest::Response,
    mut buffer: PooledBuffer,
    tx: mpsc::Sender<io::Result<Bytes>>,
) {
    let reader = StreamReader::new(upstream.bytes_stream().map_err(io::Error::other));
    tokio::pin!(reader);

    loop {
        let read = tokio::select! {
            _ = tx.closed() => {
                debug!("client went away; abandoning upstream body");
                return;
            }
            read = reader.read(&mut buffer[..]) => read,
        };

        match read {
            Ok(0) => return,
            Ok(n) => {
                if tx.send(Ok(Bytes::copy_from_slice(&buffer[..n]))).await.is_err() {
                    debug!("client went away; abandoning upstream body");
                    return;
                }
            }
            Err(err) => {
                warn!(error = %err, "upstream body relay failed");
                let _ = tx.send(Err(err)).await;
                return;
            }
        }
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(name) || name == KEEP_ALIVE || name == PROXY_CONNECTION
}

/// Headers sent upstream: everything end-to-end except `host`, which the
/// client derives from the origin, and `x-forwarded-for`.
pub fn request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name) || *name == header::HOST || name == X_FORWARDED_FOR {
            continue;
        }
        forwarded.append(name.clone(), value.clone());
    }
    forwarded
}

/// Headers relayed to the client: everything end-to-end, verbatim.
pub fn response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut relayed = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name) {
            continue;
        }
        relayed.append(name.clone(), value.clone());
    }
    relayed
}
