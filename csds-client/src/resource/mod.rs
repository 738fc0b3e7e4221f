//! Resource kinds and the references between them.
//!
//! Config dumps carry resources as serialized bytes tagged with a type URL.
//! This module recognizes the well-known xDS resource types of both the v2
//! and v3 APIs and extracts the names of the resources each one points to.
//!
//! The v2 and v3 messages share field numbers for every field read here, so
//! both versions are decoded with the v3 messages from `envoy-types`.
//!
//! References followed:
//!
//! | From | To | Field |
//! |---|---|---|
//! | Listener | RouteConfiguration | `HttpConnectionManager.rds.route_config_name` |
//! | Listener | Cluster | inline `HttpConnectionManager.route_config`, `TcpProxy` cluster / weighted clusters |
//! | RouteConfiguration | Cluster | route `cluster`, `weighted_clusters`, `request_mirror_policies` |
//! | ScopedRouteConfiguration | RouteConfiguration | `route_configuration_name` |
//! | Cluster | ClusterLoadAssignment | `eds_cluster_config.service_name`, or the cluster name |
//!
//! Not followed: `cluster_header` (only known per request), cluster specifier
//! plugins, scoped RDS scope sets, aggregate clusters and filter config
//! discovery.

use std::fmt;

use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::cluster::v3::cluster::{ClusterDiscoveryType, DiscoveryType};
use envoy_types::pb::envoy::config::endpoint::v3::ClusterLoadAssignment;
use envoy_types::pb::envoy::config::listener::v3::Listener;
use envoy_types::pb::envoy::config::listener::v3::filter::ConfigType;
use envoy_types::pb::envoy::config::route::v3::route::Action;
use envoy_types::pb::envoy::config::route::v3::route_action::ClusterSpecifier;
use envoy_types::pb::envoy::config::route::v3::{RouteConfiguration, ScopedRouteConfiguration};
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::HttpConnectionManager;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::http_connection_manager::RouteSpecifier;
use envoy_types::pb::envoy::extensions::filters::network::tcp_proxy::v3::TcpProxy;
use envoy_types::pb::envoy::extensions::filters::network::tcp_proxy::v3::tcp_proxy::ClusterSpecifier as TcpClusterSpecifier;
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::Secret;
use envoy_types::pb::google::protobuf::Any;
use prost::Message;
use serde::Serialize;

const TYPE_URL_PREFIX: &str = "type.googleapis.com/";

/// The kind of an xDS resource, independent of the API version.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ResourceKind {
    /// `Listener` (LDS).
    Listener,
    /// `RouteConfiguration` (RDS).
    RouteConfiguration,
    /// `ScopedRouteConfiguration` (SRDS).
    ScopedRouteConfiguration,
    /// `Cluster` (CDS).
    Cluster,
    /// `ClusterLoadAssignment` (EDS).
    ClusterLoadAssignment,
    /// `Secret` (SDS).
    Secret,
    /// Any other type, by fully qualified message name.
    Other(String),
}

impl ResourceKind {
    /// Classify a type URL such as
    /// `type.googleapis.com/envoy.config.listener.v3.Listener` or
    /// `type.googleapis.com/envoy.api.v2.Listener`.
    pub fn from_type_url(type_url: &str) -> Self {
        let full_name = type_url.strip_prefix(TYPE_URL_PREFIX).unwrap_or(type_url);
        let short_name = full_name.rsplit('.').next().unwrap_or(full_name);
        match short_name {
            "Listener" => ResourceKind::Listener,
            "RouteConfiguration" => ResourceKind::RouteConfiguration,
            "ScopedRouteConfiguration" => ResourceKind::ScopedRouteConfiguration,
            "Cluster" => ResourceKind::Cluster,
            "ClusterLoadAssignment" => ResourceKind::ClusterLoadAssignment,
            "Secret" => ResourceKind::Secret,
            _ => ResourceKind::Other(full_name.to_string()),
        }
    }

    /// Human readable label.
    pub fn as_str(&self) -> &str {
        match self {
            ResourceKind::Listener => "Listener",
            ResourceKind::RouteConfiguration => "RouteConfiguration",
            ResourceKind::ScopedRouteConfiguration => "ScopedRouteConfiguration",
            ResourceKind::Cluster => "Cluster",
            ResourceKind::ClusterLoadAssignment => "ClusterLoadAssignment",
            ResourceKind::Secret => "Secret",
            ResourceKind::Other(name) => name,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named pointer from one resource to another.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ResourceRef {
    /// Kind of the referenced resource.
    pub kind: ResourceKind,
    /// Name of the referenced resource.
    pub name: String,
}

impl ResourceRef {
    fn new(kind: ResourceKind, name: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
        }
    }
}

/// Returns the name of a serialized resource, or an empty string if the
/// type is unknown or the body does not decode.
pub fn resource_name(type_url: &str, body: &[u8]) -> String {
    let name = match ResourceKind::from_type_url(type_url) {
        ResourceKind::Listener => Listener::decode(body).map(|r| r.name),
        ResourceKind::RouteConfiguration => RouteConfiguration::decode(body).map(|r| r.name),
        ResourceKind::ScopedRouteConfiguration => {
            ScopedRouteConfiguration::decode(body).map(|r| r.name)
        }
        ResourceKind::Cluster => Cluster::decode(body).map(|r| r.name),
        ResourceKind::ClusterLoadAssignment => {
            ClusterLoadAssignment::decode(body).map(|r| r.cluster_name)
        }
        ResourceKind::Secret => Secret::decode(body).map(|r| r.name),
        ResourceKind::Other(_) => return String::new(),
    };
    name.unwrap_or_else(|error| {
        tracing::debug!(%type_url, %error, "cannot decode resource name");
        String::new()
    })
}

/// Extract the outgoing references of a serialized resource.
///
/// Unknown types and bodies that fail to decode have no references.
pub fn extract_references(type_url: &str, body: &[u8]) -> Vec<ResourceRef> {
    let mut refs = Vec::new();
    let decoded = match ResourceKind::from_type_url(type_url) {
        ResourceKind::Listener => {
            Listener::decode(body).map(|listener| listener_references(&listener, &mut refs))
        }
        ResourceKind::RouteConfiguration => RouteConfiguration::decode(body)
            .map(|route_config| route_config_references(&route_config, &mut refs)),
        ResourceKind::ScopedRouteConfiguration => {
            ScopedRouteConfiguration::decode(body).map(|scoped| {
                if !scoped.route_configuration_name.is_empty() {
                    refs.push(ResourceRef::new(
                        ResourceKind::RouteConfiguration,
                        &scoped.route_configuration_name,
                    ));
                }
            })
        }
        ResourceKind::Cluster => {
            Cluster::decode(body).map(|cluster| cluster_references(&cluster, &mut refs))
        }
        _ => Ok(()),
    };
    if let Err(error) = decoded {
        tracing::debug!(%type_url, %error, "cannot decode resource references");
    }
    refs
}

fn listener_references(listener: &Listener, refs: &mut Vec<ResourceRef>) {
    let filters = listener
        .filter_chains
        .iter()
        .chain(listener.default_filter_chain.as_ref())
        .flat_map(|chain| &chain.filters);

    for filter in filters {
        if let Some(ConfigType::TypedConfig(any)) = &filter.config_type {
            network_filter_references(any, refs);
        }
    }

    // Proxyless gRPC clients carry their HttpConnectionManager here.
    if let Some(any) = listener
        .api_listener
        .as_ref()
        .and_then(|api| api.api_listener.as_ref())
    {
        network_filter_references(any, refs);
    }
}

fn network_filter_references(any: &Any, refs: &mut Vec<ResourceRef>) {
    if any.type_url.ends_with(".HttpConnectionManager") {
        let Ok(hcm) = HttpConnectionManager::decode(any.value.as_slice()) else {
            return;
        };
        match hcm.route_specifier {
            Some(RouteSpecifier::Rds(rds)) if !rds.route_config_name.is_empty() => {
                refs.push(ResourceRef::new(
                    ResourceKind::RouteConfiguration,
                    &rds.route_config_name,
                ));
            }
            Some(RouteSpecifier::RouteConfig(route_config)) => {
                route_config_references(&route_config, refs);
            }
            _ => {}
        }
    } else if any.type_url.ends_with(".TcpProxy") {
        let Ok(tcp_proxy) = TcpProxy::decode(any.value.as_slice()) else {
            return;
        };
        match tcp_proxy.cluster_specifier {
            Some(TcpClusterSpecifier::Cluster(name)) if !name.is_empty() => {
                refs.push(ResourceRef::new(ResourceKind::Cluster, &name));
            }
            Some(TcpClusterSpecifier::WeightedClusters(weighted)) => {
                refs.extend(
                    weighted
                        .clusters
                        .iter()
                        .filter(|c| !c.name.is_empty())
                        .map(|c| ResourceRef::new(ResourceKind::Cluster, &c.name)),
                );
            }
            _ => {}
        }
    }
}

fn route_config_references(route_config: &RouteConfiguration, refs: &mut Vec<ResourceRef>) {
    let actions = route_config
        .virtual_hosts
        .iter()
        .flat_map(|vhost| &vhost.routes)
        .filter_map(|route| match &route.action {
            Some(Action::Route(action)) => Some(action),
            _ => None,
        });

    for action in actions {
        match &action.cluster_specifier {
            Some(ClusterSpecifier::Cluster(name)) if !name.is_empty() => {
                refs.push(ResourceRef::new(ResourceKind::Cluster, name));
            }
            Some(ClusterSpecifier::WeightedClusters(weighted)) => {
                refs.extend(
                    weighted
                        .clusters
                        .iter()
                        .filter(|c| !c.name.is_empty())
                        .map(|c| ResourceRef::new(ResourceKind::Cluster, &c.name)),
                );
            }
            _ => {}
        }
        refs.extend(
            action
                .request_mirror_policies
                .iter()
                .filter(|policy| !policy.cluster.is_empty())
                .map(|policy| ResourceRef::new(ResourceKind::Cluster, &policy.cluster)),
        );
    }
}

fn cluster_references(cluster: &Cluster, refs: &mut Vec<ResourceRef>) {
    let is_eds = matches!(
        cluster.cluster_discovery_type,
        Some(ClusterDiscoveryType::Type(t)) if t == DiscoveryType::Eds as i32
    );
    if !is_eds && cluster.eds_cluster_config.is_none() {
        return;
    }

    let service_name = cluster
        .eds_cluster_config
        .as_ref()
        .map(|eds| eds.service_name.as_str())
        .filter(|name| !name.is_empty())
        .unwrap_or(&cluster.name);
    refs.push(ResourceRef::new(
        ResourceKind::ClusterLoadAssignment,
        service_name,
    ));
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use envoy_types::pb::envoy::config::cluster::v3::cluster::EdsClusterConfig;
    use envoy_types::pb::envoy::config::listener::v3::{ApiListener, Filter, FilterChain};
    use envoy_types::pb::envoy::config::route::v3::{
        Route, RouteAction, VirtualHost, WeightedCluster, route_action::RequestMirrorPolicy,
        weighted_cluster::ClusterWeight,
    };
    use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::Rds;

    pub(crate) const LISTENER_V3: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
    pub(crate) const ROUTE_V3: &str =
        "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
    pub(crate) const CLUSTER_V3: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
    pub(crate) const HCM_V3: &str = "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";

    pub(crate) fn hcm_with_rds(route_config_name: &str) -> Any {
        let hcm = HttpConnectionManager {
            route_specifier: Some(RouteSpecifier::Rds(Rds {
                route_config_name: route_config_name.to_string(),
                ..Default::default()
            })),
            ..Default::default()
        };
        Any {
            type_url: HCM_V3.to_string(),
            value: hcm.encode_to_vec(),
        }
    }

    pub(crate) fn listener_bytes(name: &str, route_config_name: &str) -> Vec<u8> {
        Listener {
            name: name.to_string(),
            api_listener: Some(ApiListener {
                api_listener: Some(hcm_with_rds(route_config_name)),
            }),
            ..Default::default()
        }
        .encode_to_vec()
    }

    pub(crate) fn route_config_bytes(name: &str, clusters: &[&str]) -> Vec<u8> {
        let routes = clusters
            .iter()
            .map(|cluster| Route {
                action: Some(Action::Route(RouteAction {
                    cluster_specifier: Some(ClusterSpecifier::Cluster(cluster.to_string())),
                    ..Default::default()
                })),
                ..Default::default()
            })
            .collect();
        RouteConfiguration {
            name: name.to_string(),
            virtual_hosts: vec![VirtualHost {
                name: "vhost".to_string(),
                routes,
                ..Default::default()
            }],
            ..Default::default()
        }
        .encode_to_vec()
    }

    pub(crate) fn eds_cluster_bytes(name: &str, service_name: &str) -> Vec<u8> {
        Cluster {
            name: name.to_string(),
            cluster_discovery_type: Some(ClusterDiscoveryType::Type(DiscoveryType::Eds as i32)),
            eds_cluster_config: Some(EdsClusterConfig {
                service_name: service_name.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
        .encode_to_vec()
    }

    #[test]
    fn test_kind_from_type_url_v2_and_v3() {
        assert_eq!(
            ResourceKind::from_type_url(LISTENER_V3),
            ResourceKind::Listener
        );
        assert_eq!(
            ResourceKind::from_type_url("type.googleapis.com/envoy.api.v2.Listener"),
            ResourceKind::Listener
        );
        assert_eq!(
            ResourceKind::from_type_url("type.googleapis.com/envoy.api.v2.ClusterLoadAssignment"),
            ResourceKind::ClusterLoadAssignment
        );
        assert_eq!(
            ResourceKind::from_type_url("type.googleapis.com/acme.Widget"),
            ResourceKind::Other("acme.Widget".to_string())
        );
    }

    #[test]
    fn test_listener_api_listener_rds() {
        let body = listener_bytes("lis", "rc-1");
        assert_eq!(resource_name(LISTENER_V3, &body), "lis");
        assert_eq!(
            extract_references(LISTENER_V3, &body),
            vec![ResourceRef::new(ResourceKind::RouteConfiguration, "rc-1")]
        );
    }

    #[test]
    fn test_listener_filter_chain_tcp_proxy() {
        let tcp_proxy = TcpProxy {
            stat_prefix: "tcp".to_string(),
            cluster_specifier: Some(TcpClusterSpecifier::Cluster("backend".to_string())),
            ..Default::default()
        };
        let listener = Listener {
            name: "tcp-listener".to_string(),
            filter_chains: vec![FilterChain {
                filters: vec![Filter {
                    name: "envoy.filters.network.tcp_proxy".to_string(),
                    config_type: Some(ConfigType::TypedConfig(Any {
                        type_url: "type.googleapis.com/envoy.extensions.filters.network.tcp_proxy.v3.TcpProxy".to_string(),
                        value: tcp_proxy.encode_to_vec(),
                    })),
                }],
                ..Default::default()
            }],
            ..Default::default()
        };

        let refs = extract_references(LISTENER_V3, &listener.encode_to_vec());
        assert_eq!(refs, vec![ResourceRef::new(ResourceKind::Cluster, "backend")]);
    }

    #[test]
    fn test_route_config_clusters_and_mirrors() {
        let route_config = RouteConfiguration {
            name: "rc".to_string(),
            virtual_hosts: vec![VirtualHost {
                routes: vec![
                    Route {
                        action: Some(Action::Route(RouteAction {
                            cluster_specifier: Some(ClusterSpecifier::WeightedClusters(
                                WeightedCluster {
                                    clusters: vec![
                                        ClusterWeight {
                                            name: "a".to_string(),
                                            ..Default::default()
                                        },
                                        ClusterWeight {
                                            name: "b".to_string(),
                                            ..Default::default()
                                        },
                                        // Unnamed weights select nothing.
                                        ClusterWeight::default(),
                                    ],
                                    ..Default::default()
                                },
                            )),
                            request_mirror_policies: vec![RequestMirrorPolicy {
                                cluster: "shadow".to_string(),
                                ..Default::default()
                            }],
                            ..Default::default()
                        })),
                        ..Default::default()
                    },
                    Route {
                        action: Some(Action::Route(RouteAction {
                            cluster_specifier: Some(ClusterSpecifier::ClusterHeader(
                                "x-cluster".to_string(),
                            )),
                            ..Default::default()
                        })),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }],
            ..Default::default()
        };

        let refs = extract_references(ROUTE_V3, &route_config.encode_to_vec());
        let names: Vec<_> = refs.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "shadow"]);
        assert!(refs.iter().all(|r| r.kind == ResourceKind::Cluster));
    }

    #[test]
    fn test_eds_cluster_service_name_fallback() {
        let with_service = eds_cluster_bytes("c1", "svc");
        let without_service = eds_cluster_bytes("c2", "");

        assert_eq!(
            extract_references(CLUSTER_V3, &with_service),
            vec![ResourceRef::new(ResourceKind::ClusterLoadAssignment, "svc")]
        );
        assert_eq!(
            extract_references(CLUSTER_V3, &without_service),
            vec![ResourceRef::new(ResourceKind::ClusterLoadAssignment, "c2")]
        );

        let static_cluster = Cluster {
            name: "static".to_string(),
            ..Default::default()
        };
        assert!(extract_references(CLUSTER_V3, &static_cluster.encode_to_vec()).is_empty());
    }

    #[test]
    fn test_unknown_and_malformed_bodies_have_no_references() {
        assert!(extract_references("type.googleapis.com/acme.Widget", b"\x01\x02").is_empty());
        assert!(extract_references(LISTENER_V3, b"\xff\xff\xff").is_empty());
        assert_eq!(resource_name(LISTENER_V3, b"\xff\xff\xff"), "");
    }
}
