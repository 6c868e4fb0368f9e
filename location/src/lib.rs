//! Maps the first path segment of a request to the backend clusters serving it.

pub mod metrics_defs;
mod resolver;
mod rules;
mod source;

pub use resolver::LocationResolver;
pub use rules::{ClusterRule, Location, LocationRule, LocationTable, Mode, RESERVED_PREFIXES, Rules};
pub use source::{FileRuleSource, RuleSource, StaticRuleSource};

use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum LocationError {
    #[error("cannot read relay rule {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("relay rule syntax error: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid location name: {0:?}")]
    InvalidName(String),

    #[error("location name {0:?} is reserved")]
    ReservedName(String),

    #[error("location {location}: cluster {cluster} has no servers")]
    NoServers { location: String, cluster: usize },

    #[error("location {location}: unexpected number of clusters ({count})")]
    ClusterCount { location: String, count: usize },

    #[error("location {location}: cluster {cluster} needs a container prefix")]
    MissingContainerPrefix { location: String, cluster: usize },

    #[error("location {location}: invalid container prefix {prefix:?}")]
    InvalidContainerPrefix { location: String, prefix: String },

    #[error("location {location}: duplicate container prefix {prefix:?}")]
    DuplicateContainerPrefix { location: String, prefix: String },

    #[error("location {location}: cache proxy configured for unknown server {server}")]
    UnknownCacheProxyServer { location: String, server: String },
}
