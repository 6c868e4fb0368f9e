use crate::LocationError;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use url::Url;

/// First path segments that never name a location.
pub const RESERVED_PREFIXES: &[&str] = &["v1.0", "auth"];

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// One cluster, requests are relayed as they are.
    #[default]
    Normal,
    /// Several clusters sharing one account namespace, told apart by container prefixes.
    Merged,
}

/// Relay rule file as written by operators.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Rules {
    pub locations: BTreeMap<String, LocationRule>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct LocationRule {
    #[serde(default)]
    pub mode: Mode,
    pub clusters: Vec<ClusterRule>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ClusterRule {
    /// Container prefix owning this cluster in merged mode.
    #[serde(default)]
    pub prefix: Option<String>,
    /// Replicas of the cluster, tried in order.
    pub servers: Vec<Url>,
    /// Web cache to use for object GETs, per server.
    #[serde(default)]
    pub cache_proxies: HashMap<Url, Url>,
}

impl Rules {
    pub fn from_yaml(contents: &str) -> Result<Self, LocationError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn validate(&self, separator: char) -> Result<(), LocationError> {
        for (name, rule) in &self.locations {
            if name.is_empty() || name.contains('/') {
                return Err(LocationError::InvalidName(name.clone()));
            }
            if RESERVED_PREFIXES.contains(&name.as_str()) {
                return Err(LocationError::ReservedName(name.clone()));
            }
            rule.validate(name, separator)?;
        }
        Ok(())
    }
}

impl LocationRule {
    fn validate(&self, name: &str, separator: char) -> Result<(), LocationError> {
        for (index, cluster) in self.clusters.iter().enumerate() {
            if cluster.servers.is_empty() {
                return Err(LocationError::NoServers {
                    location: name.to_string(),
                    cluster: index,
                });
            }
            if let Some(server) = cluster
                .cache_proxies
                .keys()
                .find(|server| !cluster.servers.contains(server))
            {
                return Err(LocationError::UnknownCacheProxyServer {
                    location: name.to_string(),
                    server: server.to_string(),
                });
            }
        }

        match self.mode {
            Mode::Normal => {
                if self.clusters.len() != 1 {
                    return Err(LocationError::ClusterCount {
                        location: name.to_string(),
                        count: self.clusters.len(),
                    });
                }
            }
            Mode::Merged => {
                if self.clusters.is_empty() {
                    return Err(LocationError::ClusterCount {
                        location: name.to_string(),
                        count: 0,
                    });
                }
                let mut seen = HashSet::new();
                for (index, cluster) in self.clusters.iter().enumerate() {
                    let prefix = match cluster.prefix.as_deref() {
                        Some(p) if !p.is_empty() => p,
                        _ => {
                            return Err(LocationError::MissingContainerPrefix {
                                location: name.to_string(),
                                cluster: index,
                            });
                        }
                    };
                    if prefix.contains(separator) || prefix.contains('/') {
                        return Err(LocationError::InvalidContainerPrefix {
                            location: name.to_string(),
                            prefix: prefix.to_string(),
                        });
                    }
                    if !seen.insert(prefix) {
                        return Err(LocationError::DuplicateContainerPrefix {
                            location: name.to_string(),
                            prefix: prefix.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// Routing data of a single location prefix.
#[derive(Clone, Debug, PartialEq)]
pub struct Location {
    prefix: String,
    mode: Mode,
    clusters: Vec<Vec<Url>>,
    container_prefixes: Vec<Option<String>>,
    cache_proxies: HashMap<Url, Url>,
}

impl Location {
    fn from_rule(prefix: &str, rule: LocationRule) -> Self {
        let mut clusters = Vec::with_capacity(rule.clusters.len());
        let mut container_prefixes = Vec::with_capacity(rule.clusters.len());
        let mut cache_proxies = HashMap::new();

        for cluster in rule.clusters {
            clusters.push(cluster.servers);
            container_prefixes.push(match rule.mode {
                Mode::Merged => cluster.prefix,
                Mode::Normal => None,
            });
            cache_proxies.extend(cluster.cache_proxies);
        }

        Location {
            prefix: prefix.to_string(),
            mode: rule.mode,
            clusters,
            container_prefixes,
            cache_proxies,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_merged(&self) -> bool {
        self.mode == Mode::Merged
    }

    /// Server lists of every cluster, in rule order.
    pub fn clusters(&self) -> &[Vec<Url>] {
        &self.clusters
    }

    /// Container prefix of every cluster, aligned with `clusters()`.
    pub fn container_prefixes(&self) -> impl Iterator<Item = Option<&str>> {
        self.container_prefixes.iter().map(|p| p.as_deref())
    }

    pub fn cluster_index_by_container_prefix(&self, prefix: &str) -> Option<usize> {
        self.container_prefixes
            .iter()
            .position(|p| p.as_deref() == Some(prefix))
    }

    pub fn servers_by_container_prefix(&self, prefix: &str) -> Option<&[Url]> {
        self.cluster_index_by_container_prefix(prefix)
            .map(|index| self.clusters[index].as_slice())
    }

    pub fn container_prefix_of(&self, server: &Url) -> Option<&str> {
        self.clusters
            .iter()
            .position(|servers| servers.contains(server))
            .and_then(|index| self.container_prefixes[index].as_deref())
    }

    pub fn cache_proxy_for(&self, server: &Url) -> Option<&Url> {
        self.cache_proxies.get(server)
    }
}

/// Immutable view of every location, swapped as a whole on reload.
#[derive(Debug, Default)]
pub struct LocationTable {
    locations: HashMap<String, Arc<Location>>,
}

impl LocationTable {
    pub fn build(rules: Rules, separator: char) -> Result<Self, LocationError> {
        rules.validate(separator)?;
        let locations = rules
            .locations
            .into_iter()
            .map(|(prefix, rule)| {
                let location = Location::from_rule(&prefix, rule);
                (prefix, Arc::new(location))
            })
            .collect();
        Ok(LocationTable { locations })
    }

    pub fn get(&self, prefix: &str) -> Option<&Arc<Location>> {
        self.locations.get(prefix)
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    /// Locations sorted by prefix.
    pub fn locations(&self) -> Vec<&Arc<Location>> {
        let mut all: Vec<_> = self.locations.values().collect();
        all.sort_by(|a, b| a.prefix.cmp(&b.prefix));
        all
    }
}
