//! Crate-owned CSDS message types.
//!
//! These types are version-agnostic and serve as the interface between the
//! session, filtering and graph logic and the codec layer. Each codec converts
//! them to/from the wire format of one CSDS major version.

use std::collections::{BTreeMap, HashSet};
use std::time::SystemTime;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::resource::ResourceRef;

/// Default user agent name presented by this client.
pub const USER_AGENT_NAME: &str = "csds-client";

/// Node identification, either of the caller or of a queried node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Identity {
    /// An opaque node identifier.
    pub id: String,
    /// The cluster the node belongs to.
    pub cluster: String,
    /// Locality specifying where the node is running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locality: Option<Locality>,
    /// String-valued node metadata.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    /// Free-form string identifying the client type.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user_agent_name: String,
    /// Version of the client.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user_agent_version: String,
}

impl Identity {
    /// Create an identity with the given node id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Synthesize the identity of this process for the given platform.
    ///
    /// The node id is derived from the host name, falling back to
    /// `localhost` when it cannot be determined.
    pub fn local(platform: &str) -> Self {
        let host = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_string());

        let mut identity = Self::new(format!("{USER_AGENT_NAME}~{host}"))
            .with_cluster(platform)
            .with_metadata("PLATFORM", platform);
        identity.user_agent_name = USER_AGENT_NAME.to_string();
        identity.user_agent_version = env!("CARGO_PKG_VERSION").to_string();
        identity
    }

    /// Set the cluster.
    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = cluster.into();
        self
    }

    /// Set the locality.
    pub fn with_locality(mut self, locality: Locality) -> Self {
        self.locality = Some(locality);
        self
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Locality information identifying where a node is running.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Locality {
    /// Region the node is in.
    pub region: String,
    /// Zone within the region.
    pub zone: String,
    /// Sub-zone within the zone.
    pub sub_zone: String,
}

/// A string matcher. Exactly one kind is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StringMatch {
    /// The input must equal the value.
    Exact(String),
    /// The input must start with the value.
    Prefix(String),
    /// The input must end with the value.
    Suffix(String),
    /// The input must contain the value.
    Contains(String),
    /// The input must match the RE2 regex.
    SafeRegex(String),
}

/// Matches a metadata value at a path of keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetadataMatch {
    /// Keys to walk, outermost first.
    pub path: Vec<String>,
    /// Expected string value.
    pub value: StringMatch,
}

/// Selects the nodes whose config the server should report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeMatcher {
    /// Matcher on the node id.
    pub node_id: Option<StringMatch>,
    /// Matchers on the node metadata. All must match.
    pub node_metadatas: Vec<MetadataMatch>,
}

/// A status request in the uniform shape shared by all protocol versions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StatusRequest {
    /// The node making the request. Only carried on the wire by versions
    /// that support it.
    pub node: Option<Identity>,
    /// Which nodes to report on. Empty means all nodes.
    pub node_matchers: Vec<NodeMatcher>,
}

/// Sync status of a piece of config as reported by the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfigStatus {
    /// Status not reported.
    #[default]
    Unknown,
    /// The client has the latest config.
    Synced,
    /// The config was not sent to the client.
    NotSent,
    /// The client has not yet acknowledged the latest config.
    Stale,
    /// The client rejected the latest config.
    Error,
}

impl ConfigStatus {
    /// Map the `ConfigStatus` proto enum value, shared by v2 and v3.
    pub fn from_proto(value: i32) -> Self {
        match value {
            1 => ConfigStatus::Synced,
            2 => ConfigStatus::NotSent,
            3 => ConfigStatus::Stale,
            4 => ConfigStatus::Error,
            _ => ConfigStatus::Unknown,
        }
    }

    /// The name printed in status tables.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigStatus::Unknown => "UNKNOWN",
            ConfigStatus::Synced => "SYNCED",
            ConfigStatus::NotSent => "NOT_SENT",
            ConfigStatus::Stale => "STALE",
            ConfigStatus::Error => "ERROR",
        }
    }
}

/// One resource in a node's config dump.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigDumpEntry {
    /// Type URL of the resource.
    pub type_url: String,
    /// Resource name. Empty if it could not be determined.
    pub name: String,
    /// Serialized resource bytes.
    pub body: Bytes,
    /// Version reported for the resource.
    pub version: Option<String>,
    /// When the resource was last updated.
    pub last_updated: Option<SystemTime>,
    /// Sync status reported for the resource.
    pub status: ConfigStatus,
    /// Resources this one points to.
    pub references: Vec<ResourceRef>,
}

impl ConfigDumpEntry {
    /// Create an entry, extracting its outgoing references from the body.
    pub fn new(type_url: impl Into<String>, name: impl Into<String>, body: Bytes) -> Self {
        let type_url = type_url.into();
        let references = crate::resource::extract_references(&type_url, &body);
        Self {
            type_url,
            name: name.into(),
            body,
            version: None,
            last_updated: None,
            status: ConfigStatus::Unknown,
            references,
        }
    }

    /// Set the version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        let version = version.into();
        self.version = (!version.is_empty()).then_some(version);
        self
    }

    /// Set the last-updated timestamp.
    pub fn with_last_updated(mut self, last_updated: Option<SystemTime>) -> Self {
        self.last_updated = last_updated;
        self
    }

    /// Set the status.
    pub fn with_status(mut self, status: ConfigStatus) -> Self {
        self.status = status;
        self
    }
}

/// The normalized config dump of one queried node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDump {
    /// The node the dump belongs to.
    pub node: Identity,
    /// Resources, in the order the server reported them.
    pub entries: Vec<ConfigDumpEntry>,
    seen: HashSet<(String, String)>,
}

impl NodeDump {
    /// Create an empty dump for a node.
    pub fn new(node: Identity) -> Self {
        Self {
            node,
            entries: Vec::new(),
            seen: HashSet::new(),
        }
    }

    /// Append an entry unless one with the same `(type_url, name)` was
    /// already pushed. Returns whether the entry was added.
    pub fn push(&mut self, entry: ConfigDumpEntry) -> bool {
        let key = (entry.type_url.clone(), entry.name.clone());
        if !self.seen.insert(key) {
            tracing::debug!(
                node = %self.node.id,
                type_url = %entry.type_url,
                name = %entry.name,
                "dropping duplicate config dump entry"
            );
            return false;
        }
        self.entries.push(entry);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_keeps_first_duplicate() {
        let mut dump = NodeDump::new(Identity::new("node-1"));
        let first = ConfigDumpEntry::new("type.googleapis.com/x.Foo", "a", Bytes::from_static(b"1"));
        let second =
            ConfigDumpEntry::new("type.googleapis.com/x.Foo", "a", Bytes::from_static(b"2"));
        let other = ConfigDumpEntry::new("type.googleapis.com/x.Bar", "a", Bytes::new());

        assert!(dump.push(first));
        assert!(!dump.push(second));
        assert!(dump.push(other));
        assert_eq!(dump.entries.len(), 2);
        assert_eq!(dump.entries[0].body.as_ref(), b"1");
    }

    #[test]
    fn test_push_large_dump() {
        let mut dump = NodeDump::new(Identity::new("node-1"));
        for round in 0..2 {
            for i in 0..20_000 {
                let added = dump.push(ConfigDumpEntry::new(
                    "type.googleapis.com/x.Foo",
                    format!("r{i}"),
                    Bytes::new(),
                ));
                assert_eq!(added, round == 0);
            }
        }
        assert_eq!(dump.entries.len(), 20_000);
        assert_eq!(dump.entries[19_999].name, "r19999");
    }

    #[test]
    fn test_local_identity() {
        let identity = Identity::local("gcp");
        assert!(identity.id.starts_with("csds-client~"));
        assert_eq!(identity.cluster, "gcp");
        assert_eq!(identity.metadata.get("PLATFORM").map(String::as_str), Some("gcp"));
        assert_eq!(identity.user_agent_name, USER_AGENT_NAME);
    }

    #[test]
    fn test_status_request_template_shape() {
        let json = r#"{
            "node_matchers": [
                {
                    "node_id": {"prefix": "projects/123/"},
                    "node_metadatas": [{"path": ["NETWORK"], "value": {"exact": "default"}}]
                }
            ]
        }"#;
        let request: StatusRequest = serde_json::from_str(json).unwrap();
        assert!(request.node.is_none());
        assert_eq!(
            request.node_matchers[0].node_id,
            Some(StringMatch::Prefix("projects/123/".to_string()))
        );
        assert_eq!(request.node_matchers[0].node_metadatas[0].path, vec!["NETWORK"]);
    }
}
