//! The JSON records stored under the proxy prefix
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A backend InfluxDB instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostInfo {
    pub domain_name: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// `http` or `https`, `http` when empty
    pub protocol: String,
    pub readable: bool,
    pub disabled: bool,
    /// Advisory rate limit for the host's backup queue
    pub backup_rate_limit: u64,
}

impl HostInfo {
    pub fn new(domain_name: impl Into<String>, port: u16) -> Self {
        Self {
            domain_name: domain_name.into(),
            port,
            readable: true,
            ..Default::default()
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_readable(mut self, readable: bool) -> Self {
        self.readable = readable;
        self
    }

    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    /// The base URL of the host
    pub fn base_url(&self) -> String {
        let protocol = if self.protocol.is_empty() {
            "http"
        } else {
            self.protocol.as_str()
        };
        format!("{protocol}://{}:{}", self.domain_name, self.port)
    }
}

/// A named group of hosts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterInfo {
    pub host_list: Vec<String>,
    pub unreadable_host_list: Vec<String>,
}

impl ClusterInfo {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            host_list: hosts.into_iter().map(Into::into).collect(),
            unreadable_host_list: vec![],
        }
    }
}

/// Where writes and queries for a `db.table` route go
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteInfo {
    pub cluster: String,
    /// Tag keys that shard the route, empty for unsharded routes
    pub partition_tag: Vec<String>,
}

impl RouteInfo {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            partition_tag: vec![],
        }
    }

    pub fn with_partition_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.partition_tag = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// The state of a tag shard with respect to a host migration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagStatus {
    #[default]
    Ready,
    Changed,
    Merging,
}

/// Which hosts serve a tag shard
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TagInfo {
    /// Hosts that receive writes for the shard
    pub host_list: Vec<String>,
    /// Hosts that receive writes but do not serve reads yet
    pub unreadable_host: Vec<String>,
    /// Hosts being drained from the shard
    pub delete_host_list: Vec<String>,
    pub status: TagStatus,
    pub transfer_start_time: i64,
    pub transfer_end_time: i64,
    pub delete_time: i64,
}

impl TagInfo {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            host_list: hosts.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Hosts that serve reads, i.e. `host_list` minus `unreadable_host`, in order
    pub fn readable_hosts(&self) -> Vec<String> {
        self.host_list
            .iter()
            .filter(|h| !self.unreadable_host.contains(h))
            .cloned()
            .collect()
    }
}

/// A tag shard as read from the store, keeping the raw bytes for compare-and-swap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRecord {
    /// `db/measurement/tag==value[/tag2==value2]`
    pub key: String,
    pub info: TagInfo,
    pub raw: Bytes,
}
