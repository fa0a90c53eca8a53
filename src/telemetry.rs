use std::fs;

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use prometheus::{Encoder, IntCounter, Opts, Registry, TextEncoder};
use tracing::Subscriber;
use tracing::subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt};

use crate::config::TelemetrySettings;

static LOG_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

const LOG_FILE_PREFIX: &str = "arcane.log";

fn install_subscriber<S>(subscriber: S) -> Result<()>
where
    S: Subscriber + Send + Sync + 'static,
{
    if TRACING_INITIALIZED.get().is_some() {
        return Ok(());
    }

    subscriber::set_global_default(subscriber)?;
    let _ = TRACING_INITIALIZED.set(());
    Ok(())
}

/// Install the console subscriber, plus a JSON file layer when `log_dir` is set.
pub fn init_tracing(verbose: bool, telemetry: &TelemetrySettings) -> Result<()> {
    let default_level = if verbose {
        "arcane=debug"
    } else {
        "arcane=info"
    };
    let make_env_filter =
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match &telemetry.log_dir {
        Some(directory) => {
            fs::create_dir_all(directory).with_context(|| {
                format!("Failed to create log directory {}", directory.display())
            })?;
            let appender = tracing_appender::rolling::daily(directory, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);

            let subscriber = tracing_subscriber::registry()
                .with(make_env_filter())
                .with(fmt::layer().with_target(false))
                .with(
                    fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_span_list(true)
                        .with_target(true)
                        .with_writer(writer)
                        .with_filter(LevelFilter::DEBUG),
                );
            let _ = LOG_GUARD.set(guard);
            install_subscriber(subscriber)?;
        }
        None => {
            let subscriber = tracing_subscriber::registry()
                .with(make_env_filter())
                .with(fmt::layer().with_target(false));
            install_subscriber(subscriber)?;
        }
    }

    Ok(())
}

/// Process-wide request counters exposed on the optional metrics listener.
pub struct EdgeMetrics {
    registry: Registry,
    requests_total: IntCounter,
    unknown_server_name_total: IntCounter,
    dns_rewrites_total: IntCounter,
    dns_rejected_total: IntCounter,
    ticket_proxied_total: IntCounter,
    ticket_errors_total: IntCounter,
    prefetch_stored_total: IntCounter,
    prefetch_hits_total: IntCounter,
    prefetch_misses_total: IntCounter,
}

impl EdgeMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let counter = IntCounter::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let requests_total = counter("arcane_requests_total", "Total number of requests received")?;
        let unknown_server_name_total = counter(
            "arcane_unknown_server_name_total",
            "Requests rejected because the negotiated server name is not served",
        )?;
        let dns_rewrites_total = counter(
            "arcane_dns_rewrites_total",
            "DNS queries answered with synthetic records",
        )?;
        let dns_rejected_total = counter(
            "arcane_dns_rejected_total",
            "DNS queries rejected as undecodable or malformed",
        )?;
        let ticket_proxied_total = counter(
            "arcane_ticket_proxied_total",
            "Ticket requests relayed to the upstream origin",
        )?;
        let ticket_errors_total = counter(
            "arcane_ticket_errors_total",
            "Ticket requests that failed",
        )?;
        let prefetch_stored_total = counter(
            "arcane_prefetch_stored_total",
            "Cart mutations prefetched and cached",
        )?;
        let prefetch_hits_total = counter(
            "arcane_prefetch_hits_total",
            "Cart mutations served from the prefetch cache",
        )?;
        let prefetch_misses_total = counter(
            "arcane_prefetch_misses_total",
            "Cart mutations with no prefetched response",
        )?;

        Ok(Self {
            registry,
            requests_total,
            unknown_server_name_total,
            dns_rewrites_total,
            dns_rejected_total,
            ticket_proxied_total,
            ticket_errors_total,
            prefetch_stored_total,
            prefetch_hits_total,
            prefetch_misses_total,
        })
    }

    pub fn inc_request(&self) {
        self.requests_total.inc();
    }

    pub fn inc_unknown_server_name(&self) {
        self.unknown_server_name_total.inc();
    }

    pub fn inc_dns_rewrite(&self) {
        self.dns_rewrites_total.inc();
    }

    pub fn inc_dns_rejected(&self) {
        self.dns_rejected_total.inc();
    }

    pub fn inc_ticket_proxied(&self) {
        self.ticket_proxied_total.inc();
    }

    pub fn inc_ticket_error(&self) {
        self.ticket_errors_total.inc();
    }

    pub fn inc_prefetch_stored(&self) {
        self.prefetch_stored_total.inc();
    }

    pub fn inc_prefetch_hit(&self) {
        self.prefetch_hits_total.inc();
    }

    pub fn inc_prefetch_miss(&self) {
        self.prefetch_misses_total.inc();
    }

    pub fn render(&self) -> Result<Vec<u8>, prometheus::Error> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}
