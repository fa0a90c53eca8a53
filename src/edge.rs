use std::{convert::Infallible, net::SocketAddr, path::Path, sync::Arc};

use anyhow::{Context, Result, anyhow, bail};
use axum::{
    Router,
    body::Body,
    extract::{Request, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig;
use tower::ServiceExt;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::EdgeSettings;
use crate::dns;
use crate::telemetry::EdgeMetrics;
use crate::ticket::{self, TicketProxy};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Service selected for a connection's negotiated server name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Dns,
    Ticket,
    Unknown,
}

/// Hands each request to the router registered for its TLS server name.
pub struct SniDispatcher {
    dns_host: String,
    ticket_host: String,
    dns: Router,
    ticket: Router,
    metrics: Arc<EdgeMetrics>,
}

impl SniDispatcher {
    pub fn new(
        dns_host: impl Into<String>,
        dns: Router,
        ticket_host: impl Into<String>,
        ticket: Router,
        metrics: Arc<EdgeMetrics>,
    ) -> Self {
        Self {
            dns_host: dns_host.into(),
            ticket_host: ticket_host.into(),
            dns,
            ticket,
            metrics,
        }
    }

    pub fn from_settings(settings: &EdgeSettings, metrics: Arc<EdgeMetrics>) -> Result<Self> {
        let proxy = TicketProxy::from_settings(&settings.ticket, Arc::clone(&metrics))?;
        Ok(Self::new(
            settings.dns.host.clone(),
            dns::router(&settings.dns, Arc::clone(&metrics)),
            settings.ticket.host.clone(),
            ticket::router(Arc::new(proxy)),
            metrics,
        ))
    }

    /// Hostnames compare case-insensitively; a missing name never matches.
    pub fn route(&self, server_name: Option<&str>) -> Route {
        match server_name {
            Some(name) if name.eq_ignore_ascii_case(&self.dns_host) => Route::Dns,
            Some(name) if name.eq_ignore_ascii_case(&self.ticket_host) => Route::Ticket,
            _ => Route::Unknown,
        }
    }

    pub async fn dispatch(&self, server_name: Option<&str>, request: Request) -> Response {
        let span = info_span!(
            "request",
            request_id = %Uuid::new_v4(),
            server_name = server_name.unwrap_or_default(),
            method = %request.method(),
            path = request.uri().path(),
        );
        self.metrics.inc_request();

        async move {
            let router = match self.route(server_name) {
                Route::Dns => {
                    info!(method = %request.method(), "dns");
                    self.dns.clone()
                }
                Route::Ticket => self.ticket.clone(),
                Route::Unknown => {
                    self.metrics.inc_unknown_server_name();
                    debug!("unknown");
                    return StatusCode::NOT_FOUND.into_response();
                }
            };

            match router.oneshot(request).await {
                Ok(response) => response,
                Err(never) => match never {},
            }
        }
        .instrument(span)
        .await
    }
}

/// TLS listener serving both hostnames from one certificate.
pub struct EdgeServer {
    settings: EdgeSettings,
    dispatcher: Arc<SniDispatcher>,
    metrics: Arc<EdgeMetrics>,
}

impl EdgeServer {
    pub fn new(settings: EdgeSettings) -> Result<Self> {
        settings.validate()?;
        let metrics = Arc::new(EdgeMetrics::new().context("Failed to register metrics")?);
        let dispatcher = Arc::new(SniDispatcher::from_settings(&settings, Arc::clone(&metrics))?);
        Ok(Self {
            settings,
            dispatcher,
            metrics,
        })
    }

    pub fn dispatcher(&self) -> &Arc<SniDispatcher> {
        &self.dispatcher
    }

    /// Serve until Ctrl-C.
    pub async fn run(self) -> Result<()> {
        let server = &self.settings.server;
        let tls_config = load_tls_config(&server.cert_path, &server.key_path)?;

        if let Some(addr) = server.metrics_listen.clone() {
            let metrics = Arc::clone(&self.metrics);
            tokio::spawn(async move {
                if let Err(err) = run_metrics_server(&addr, metrics).await {
                    error!(error = %err, "Metrics server exited");
                }
            });
        }

        run_tls_server(&server.listen, tls_config, self.dispatcher).await
    }
}

/// Build a rustls server config advertising HTTP/2 and HTTP/1.1 over ALPN.
pub fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    let certs = CertificateDer::pem_file_iter(cert_path)
        .with_context(|| format!("Failed to open certificate {}", cert_path.display()))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificate {}", cert_path.display()))?;
    if certs.is_empty() {
        bail!("No certificates found in {}", cert_path.display());
    }

    let key = PrivateKeyDer::from_pem_file(key_path)
        .with_context(|| format!("Failed to load private key {}", key_path.display()))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Certificate and private key do not form a usable identity")?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

async fn run_tls_server(
    addr: &str,
    tls_config: Arc<ServerConfig>,
    dispatcher: Arc<SniDispatcher>,
) -> Result<()> {
    let socket_addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid listen address: {addr}"))?;

    let listener = TcpListener::bind(socket_addr)
        .await
        .with_context(|| format!("Failed to bind listener at {socket_addr}"))?;

    let acceptor = TlsAcceptor::from(tls_config);

    info!(listener = %socket_addr, "Starting arcane edge");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("Shutdown signal received; no longer accepting connections");
                break;
            }
            accept_result = listener.accept() => {
                let (stream, peer) = match accept_result {
                    Ok(pair) => pair,
                    Err(err) => {
                        error!(error = %err, "Failed to accept connection");
                        continue;
                    }
                };

                let acceptor = acceptor.clone();
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    if let Err(err) = serve_connection(acceptor, stream, dispatcher).await {
                        warn!(peer = %peer, error = %err, "Connection terminated with error");
                    }
                });
            }
        }
    }

    Ok(())
}

async fn serve_connection(
    acceptor: TlsAcceptor,
    stream: TcpStream,
    dispatcher: Arc<SniDispatcher>,
) -> Result<()> {
    let tls_stream = acceptor
        .accept(stream)
        .await
        .context("TLS handshake failed")?;
    let server_name: Option<Arc<str>> = tls_stream.get_ref().1.server_name().map(Arc::from);

    let service = service_fn(move |request: hyper::Request<Incoming>| {
        let dispatcher = Arc::clone(&dispatcher);
        let server_name = server_name.clone();
        async move {
            let response = dispatcher
                .dispatch(server_name.as_deref(), request.map(Body::new))
                .await;
            Ok::<_, Infallible>(response)
        }
    });

    auto::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(tls_stream), service)
        .await
        .map_err(|err| anyhow!("HTTP connection failed: {err}"))
}

async fn run_metrics_server(addr: &str, metrics: Arc<EdgeMetrics>) -> Result<()> {
    let socket_addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid metrics listener address: {addr}"))?;

    let listener = TcpListener::bind(socket_addr)
        .await
        .with_context(|| format!("Failed to bind metrics listener at {socket_addr}"))?;

    info!(listener = %socket_addr, "Starting metrics server");

    axum::serve(listener, metrics_router(metrics).into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Metrics server terminated unexpectedly")
}

fn metrics_router(metrics: Arc<EdgeMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

async fn metrics_handler(State(metrics): State<Arc<EdgeMetrics>>) -> Response {
    match metrics.render() {
        Ok(buffer) => {
            let mut response = Response::new(Body::from(buffer));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(PROMETHEUS_CONTENT_TYPE),
            );
            response
        }
        Err(err) => {
            error!(error = %err, "Failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received; stopping arcane");
}
