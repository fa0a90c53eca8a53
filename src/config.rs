use std::{
    fs,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::ticket::graphql::ADD_TICKETS_TO_CART_MUTATION;

/// Runtime configuration parsed from `arcane.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EdgeSettings {
    pub server: ServerSettings,
    pub dns: DnsSettings,
    pub ticket: TicketSettings,
    pub telemetry: TelemetrySettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub listen: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_listen: Option<String>,
}

impl ServerSettings {
    fn default_listen() -> String {
        "0.0.0.0:443".into()
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: Self::default_listen(),
            cert_path: PathBuf::from("cert.pem"),
            key_path: PathBuf::from("key.pem"),
            metrics_listen: None,
        }
    }
}

/// DNS-over-HTTPS responder settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsSettings {
    pub host: String,
    pub path: String,
    pub ipv4: Ipv4Addr,
    pub ipv6: Ipv6Addr,
    pub ttl_seconds: u32,
}

impl DnsSettings {
    fn default_host() -> String {
        "dns.arcane.m-rots.com".into()
    }

    fn default_path() -> String {
        "/dns-query".into()
    }
}

impl Default for DnsSettings {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            path: Self::default_path(),
            ipv4: Ipv4Addr::new(63, 33, 92, 165),
            ipv6: Ipv6Addr::new(
                0x2a05, 0xd018, 0x1872, 0x980b, 0x10f6, 0x71e8, 0x07cc, 0xad2e,
            ),
            ttl_seconds: 3600,
        }
    }
}

/// GraphQL proxy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TicketSettings {
    pub host: String,
    pub upstream: String,
    pub buffer_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mutation_document: Option<String>,
}

impl TicketSettings {
    const fn default_buffer_size() -> usize {
        32 * 1024
    }

    /// Mutation text sent when warming the cart.
    pub fn mutation_document(&self) -> &str {
        self.mutation_document
            .as_deref()
            .unwrap_or(ADD_TICKETS_TO_CART_MUTATION)
    }

    pub fn upstream_url(&self) -> Result<Url> {
        let url = Url::parse(&self.upstream)
            .with_context(|| format!("Invalid upstream origin {}", self.upstream))?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!("Upstream origin {} must use http or https", self.upstream);
        }
        if url.host_str().is_none() {
            bail!("Upstream origin {} has no host", self.upstream);
        }
        Ok(url)
    }
}

impl Default for TicketSettings {
    fn default() -> Self {
        Self {
            host: "api.ticketswap.com".into(),
            upstream: "https://api.ticketswap.com".into(),
            buffer_size: Self::default_buffer_size(),
            mutation_document: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Directory receiving a daily-rotated JSON log next to the console output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

impl EdgeSettings {
    /// Load settings from disk, writing defaults if missing.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let settings = Self::default();
            settings.save(path)?;
            Ok(settings)
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Unable to read config at {}", path.display()))?;
        let parsed: Self = toml::from_str(&raw)
            .with_context(|| format!("Malformed config at {}", path.display()))?;
        Ok(parsed)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create config directory {}", parent.display())
                })?;
            }
        }
        let serialised = toml::to_string_pretty(self).context("Failed to render config")?;
        fs::write(path, serialised)
            .with_context(|| format!("Failed to persist config to {}", path.display()))
    }

    /// Reject settings the server cannot start with.
    pub fn validate(&self) -> Result<()> {
        self.server
            .listen
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid listen address: {}", self.server.listen))?;
        if let Some(metrics) = &self.server.metrics_listen {
            metrics
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid metrics listen address: {metrics}"))?;
        }
        if self.dns.host.trim().is_empty() {
            bail!("dns.host must not be empty");
        }
        if self.ticket.host.trim().is_empty() {
            bail!("ticket.host must not be empty");
        }
        if self.dns.host.eq_ignore_ascii_case(&self.ticket.host) {
            bail!("dns.host and ticket.host must differ");
        }
        if self.ticket.buffer_size == 0 {
            bail!("ticket.buffer_size must be greater than zero");
        }
        self.ticket.upstream_url()?;
        Ok(())
    }
}

/// Compute the default configuration path (`~/.config/arcane/arcane.toml` on Linux).
pub fn default_config_path() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("com", "m-rots", "arcane")
        .context("Unable to resolve platform config directory")?;
    Ok(dirs.config_dir().join("arcane.toml"))
}
