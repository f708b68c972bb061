use std::fmt;

pub use crate::dns::ParseError;

/// Signals from the response caches. `KeyExpired` triggers eager removal at
/// the cache layer; the pipeline only observes the other two.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("{0} not found")]
    KeyNotFound(String),

    #[error("{0} expired")]
    KeyExpired(String),

    #[error("cache is full")]
    CacheFull,
}

/// Every configured nameserver failed (or was disqualified) for a query.
#[derive(Debug, Clone)]
pub struct ResolveError {
    pub qname: String,
    pub net: String,
    pub nameservers: Vec<String>,
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} resolv failed on {} ({})",
            self.qname,
            self.nameservers.join("; "),
            self.net
        )
    }
}

impl std::error::Error for ResolveError {}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    // toml's decode errors already carry row/column context in their
    // rendered form.
    #[error("could not load config: {0}")]
    Decode(#[from] toml::de::Error),

    #[error("invalid {field}: {value}")]
    InvalidValue { field: String, value: String },
}

/// Errors building a custom record from a zone line. Logged and skipped,
/// never fatal.
#[derive(Debug, thiserror::Error)]
pub enum ZoneParseError {
    #[error("unparseable record line: {0:?}")]
    Malformed(String),

    #[error("unsupported record type {0:?}")]
    UnsupportedType(String),

    #[error("invalid rdata {value:?} for {rtype}")]
    InvalidRdata { rtype: String, value: String },
}
