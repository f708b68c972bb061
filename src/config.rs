use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::error::ConfigError;

/// Top-level vordr configuration, decoded from TOML. Missing keys (or a
/// missing file) fall back to the defaults below.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log filter passed to the tracing subscriber.
    #[serde(alias = "loglevel")]
    pub log_level: String,

    /// DNS UDP+TCP listen address.
    pub bind: String,

    /// Admin HTTP API listen address.
    pub api: String,

    /// Nameserver stagger interval in milliseconds.
    pub interval: u64,

    /// Upstream per-query timeout in seconds.
    pub timeout: u64,

    /// TTL for synthesised block replies.
    pub ttl: u32,

    /// Maximum CNAME follow depth; 0 disables following.
    #[serde(rename = "followCnameDepth", alias = "followcnamedepth")]
    pub follow_cname_depth: u32,

    /// Zone-file lines defining operator answers.
    #[serde(rename = "customdnsrecords", alias = "customDnsRecords")]
    pub custom_dns_records: Vec<String>,

    pub blocking: Blocking,
    pub upstream: Upstream,
    pub metrics: MetricsConfig,

    #[serde(rename = "dnsOverHttpServer", alias = "dns_over_http_server")]
    pub dns_over_http_server: DohServer,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Blocking {
    /// Reply NXDOMAIN to blocked queries instead of a sinkhole address.
    pub nxdomain: bool,

    /// IPv4 sinkhole for blocked A queries.
    pub nullroute: String,

    /// IPv6 sinkhole for blocked AAAA queries.
    pub nullroutev6: String,

    /// Deny-list URLs fetched into the sources store.
    pub sources: Vec<String>,

    /// Directories walked for hosts-format lists.
    #[serde(rename = "sourcedirs", alias = "sourceDirs")]
    pub source_dirs: Vec<String>,

    /// Where fetched sources are written.
    #[serde(rename = "sourcesStore", alias = "sourcesstore")]
    pub sources_store: String,

    /// Manual deny entries.
    pub blocklist: Vec<String>,

    /// Names never blocked, skipped during import.
    pub whitelist: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Upstream {
    /// DoH resolver URL; empty disables DoH forwarding.
    #[serde(alias = "DoH", alias = "doH")]
    pub doh: String,

    /// Classic forwarding targets as `host:port`.
    pub nameservers: Vec<String>,

    /// Ceiling on cached entry lifetime in seconds.
    pub expire: u32,

    /// Cache capacity; 0 means unbounded.
    pub maxcount: i64,

    /// Lifetime of negative-cache entries in seconds.
    #[serde(rename = "negativeTtl", alias = "negative_ttl")]
    pub negative_ttl: u32,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub path: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DohServer {
    pub enabled: bool,
    pub bind: String,

    #[serde(rename = "timeoutMs", alias = "timeout_ms")]
    pub timeout_ms: u64,

    pub tls: TlsSettings,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub enabled: bool,

    #[serde(rename = "certPath", alias = "cert_path")]
    pub cert_path: String,

    #[serde(rename = "keyPath", alias = "key_path")]
    pub key_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            bind: "0.0.0.0:53".to_string(),
            api: "127.0.0.1:8080".to_string(),
            interval: 200,
            timeout: 5,
            ttl: 600,
            follow_cname_depth: 12,
            custom_dns_records: Vec::new(),
            blocking: Blocking::default(),
            upstream: Upstream::default(),
            metrics: MetricsConfig::default(),
            dns_over_http_server: DohServer::default(),
        }
    }
}

impl Default for Blocking {
    fn default() -> Self {
        Self {
            nxdomain: false,
            nullroute: "0.0.0.0".to_string(),
            nullroutev6: "::".to_string(),
            sources: vec![
                "https://raw.githubusercontent.com/StevenBlack/hosts/master/hosts".to_string(),
                "https://sysctl.org/cameleon/hosts".to_string(),
                "https://s3.amazonaws.com/lists.disconnect.me/simple_tracking.txt".to_string(),
                "https://s3.amazonaws.com/lists.disconnect.me/simple_ad.txt".to_string(),
            ],
            source_dirs: vec!["./sources".to_string()],
            sources_store: "./sources".to_string(),
            blocklist: Vec::new(),
            whitelist: Vec::new(),
        }
    }
}

impl Default for Upstream {
    fn default() -> Self {
        Self {
            doh: "https://cloudflare-dns.com/dns-query".to_string(),
            nameservers: vec!["1.1.1.1:53".to_string(), "1.0.0.1:53".to_string()],
            expire: 600,
            maxcount: 0,
            negative_ttl: 30,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "/metrics".to_string(),
        }
    }
}

impl Default for DohServer {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "0.0.0.0:80".to_string(),
            timeout_ms: 5000,
            tls: TlsSettings::default(),
        }
    }
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_path: String::new(),
            key_path: String::new(),
        }
    }
}

impl Config {
    /// Load from `path`. A missing file warns and yields defaults; a file
    /// that exists but fails to decode is an error (toml's message carries
    /// the row/column of the offending key).
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        if !Path::new(path).exists() {
            warn!("config {} not found, using defaults", path);
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;

        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.blocking
            .nullroute
            .parse::<Ipv4Addr>()
            .map_err(|_| ConfigError::InvalidValue {
                field: "blocking.nullroute".to_string(),
                value: self.blocking.nullroute.clone(),
            })?;

        self.blocking
            .nullroutev6
            .parse::<Ipv6Addr>()
            .map_err(|_| ConfigError::InvalidValue {
                field: "blocking.nullroutev6".to_string(),
                value: self.blocking.nullroutev6.clone(),
            })?;

        Ok(())
    }

    /// Parsed IPv4 sinkhole. Validated at load time.
    pub fn nullroute_v4(&self) -> Ipv4Addr {
        self.blocking
            .nullroute
            .parse()
            .unwrap_or(Ipv4Addr::UNSPECIFIED)
    }

    /// Parsed IPv6 sinkhole. Validated at load time.
    pub fn nullroute_v6(&self) -> Ipv6Addr {
        self.blocking
            .nullroutev6
            .parse()
            .unwrap_or(Ipv6Addr::UNSPECIFIED)
    }
}
