//! Codec for the `envoy.service.status.v2` CSDS API.
//!
//! `envoy-types` only ships the v3 API, so the v2 envelope is declared here.
//! Its nested messages (`Node`, `NodeMatcher` and the `v2alpha` admin dumps)
//! are wire compatible with their v3 counterparts and reuse them.

use bytes::Bytes;
use prost::Message;

use crate::codec::CsdsCodec;
use crate::codec::convert::{node_from_proto, node_matcher_to_proto};
use crate::codec::dump;
use crate::error::{Error, Result};
use crate::message::{ConfigStatus, NodeDump, StatusRequest};

/// The gRPC path of the v2 `StreamClientStatus` RPC.
pub const STREAM_CLIENT_STATUS_PATH: &str =
    "/envoy.service.status.v2.ClientStatusDiscoveryService/StreamClientStatus";

/// Messages of `envoy/service/status/v2/csds.proto`.
pub mod proto {
    use envoy_types::pb::envoy::config::core::v3::Node;
    use envoy_types::pb::envoy::r#type::matcher::v3::NodeMatcher;

    /// `envoy.service.status.v2.ClientStatusRequest`
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ClientStatusRequest {
        /// Management server can use these match criteria to identify clients.
        #[prost(message, repeated, tag = "1")]
        pub node_matchers: Vec<NodeMatcher>,
    }

    /// `envoy.service.status.v2.ClientStatusResponse`
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ClientStatusResponse {
        /// Client configs for the clients specified in the request.
        #[prost(message, repeated, tag = "1")]
        pub config: Vec<ClientConfig>,
    }

    /// `envoy.service.status.v2.ClientConfig`
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ClientConfig {
        /// Node for a particular client.
        #[prost(message, optional, tag = "1")]
        pub node: Option<Node>,
        /// Per xDS config dumps.
        #[prost(message, repeated, tag = "2")]
        pub xds_config: Vec<PerXdsConfig>,
    }

    /// `envoy.service.status.v2.PerXdsConfig`
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct PerXdsConfig {
        /// `envoy.service.status.v2.ConfigStatus`
        #[prost(int32, tag = "1")]
        pub status: i32,
        /// The config dump of one xDS type.
        #[prost(oneof = "per_xds_config::PerXdsConfig", tags = "2, 3, 4, 5")]
        pub per_xds_config: Option<per_xds_config::PerXdsConfig>,
    }

    /// Nested types of [`PerXdsConfig`].
    pub mod per_xds_config {
        use envoy_types::pb::envoy::admin::v3::{
            ClustersConfigDump, ListenersConfigDump, RoutesConfigDump, ScopedRoutesConfigDump,
        };

        /// The config dump of one xDS type.
        #[derive(Clone, PartialEq, prost::Oneof)]
        pub enum PerXdsConfig {
            /// `envoy.admin.v2alpha.ListenersConfigDump`
            #[prost(message, tag = "2")]
            ListenerConfig(ListenersConfigDump),
            /// `envoy.admin.v2alpha.ClustersConfigDump`
            #[prost(message, tag = "3")]
            ClusterConfig(ClustersConfigDump),
            /// `envoy.admin.v2alpha.RoutesConfigDump`
            #[prost(message, tag = "4")]
            RouteConfig(RoutesConfigDump),
            /// `envoy.admin.v2alpha.ScopedRoutesConfigDump`
            #[prost(message, tag = "5")]
            ScopedRouteConfig(ScopedRoutesConfigDump),
        }
    }
}

use proto::per_xds_config::PerXdsConfig;

/// A codec for the v2 CSDS API.
///
/// The v2 request carries no caller node, so [`StatusRequest::node`] is not
/// sent.
#[derive(Debug, Clone, Copy, Default)]
pub struct V2Codec;

impl CsdsCodec for V2Codec {
    type Response = proto::ClientStatusResponse;

    fn rpc_path(&self) -> &'static str {
        STREAM_CLIENT_STATUS_PATH
    }

    fn encode_request(&self, request: &StatusRequest) -> Result<Bytes> {
        let proto_request = proto::ClientStatusRequest {
            node_matchers: request
                .node_matchers
                .iter()
                .map(node_matcher_to_proto)
                .collect(),
        };
        Ok(proto_request.encode_to_vec().into())
    }

    fn decode_response(&self, bytes: Bytes) -> Result<Self::Response> {
        proto::ClientStatusResponse::decode(bytes)
            .map_err(|e| Error::Protocol(format!("invalid v2 ClientStatusResponse: {e}")))
    }

    fn normalize(&self, response: Self::Response) -> Vec<NodeDump> {
        response
            .config
            .into_iter()
            .map(|config| {
                let node = config.node.map(node_from_proto).unwrap_or_default();
                let mut dump = NodeDump::new(node);
                for per_xds in config.xds_config {
                    let status = ConfigStatus::from_proto(per_xds.status);
                    match per_xds.per_xds_config {
                        Some(PerXdsConfig::ListenerConfig(c)) => {
                            dump::push_listeners(&mut dump, c, status)
                        }
                        Some(PerXdsConfig::ClusterConfig(c)) => {
                            dump::push_clusters(&mut dump, c, status)
                        }
                        Some(PerXdsConfig::RouteConfig(c)) => dump::push_routes(&mut dump, c, status),
                        Some(PerXdsConfig::ScopedRouteConfig(c)) => {
                            dump::push_scoped_routes(&mut dump, c, status)
                        }
                        None => {}
                    }
                }
                dump
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Identity, NodeMatcher, StringMatch};
    use crate::resource::tests::eds_cluster_bytes;
    use crate::resource::{ResourceKind, ResourceRef};
    use crate::testutil::{FakeResource, fake_v2_response};

    const CLUSTER_V2: &str = "type.googleapis.com/envoy.api.v2.Cluster";

    #[test]
    fn test_encode_request_drops_caller_node() {
        let request = StatusRequest {
            node: Some(Identity::new("caller")),
            node_matchers: vec![NodeMatcher {
                node_id: Some(StringMatch::Suffix("-prod".to_string())),
                node_metadatas: vec![],
            }],
        };

        let bytes = V2Codec.encode_request(&request).unwrap();
        let decoded = proto::ClientStatusRequest::decode(bytes).unwrap();
        assert_eq!(decoded.node_matchers.len(), 1);
    }

    #[test]
    fn test_roundtrip_through_fake_server() {
        let request = StatusRequest {
            node: None,
            node_matchers: vec![NodeMatcher {
                node_id: Some(StringMatch::Exact("node-v2".to_string())),
                node_metadatas: vec![],
            }],
        };
        let request_bytes = V2Codec.encode_request(&request).unwrap();

        let resources = vec![FakeResource::new(CLUSTER_V2, eds_cluster_bytes("c", "svc"))];
        let response_bytes = fake_v2_response(request_bytes, &resources);

        let dumps = V2Codec.decode_dumps(response_bytes).unwrap();
        assert_eq!(dumps.len(), 1);
        assert_eq!(dumps[0].node.id, "node-v2");
        let entry = &dumps[0].entries[0];
        assert_eq!(entry.type_url, CLUSTER_V2);
        assert_eq!(entry.name, "c");
        assert_eq!(entry.status, ConfigStatus::Synced);
        assert_eq!(
            entry.references,
            vec![ResourceRef {
                kind: ResourceKind::ClusterLoadAssignment,
                name: "svc".to_string(),
            }]
        );
    }

    #[test]
    fn test_decode_garbage_is_protocol_error() {
        let err = V2Codec
            .decode_response(Bytes::from_static(b"\x0a\xff"))
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
