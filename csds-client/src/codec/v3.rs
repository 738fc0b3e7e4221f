//! Codec for the `envoy.service.status.v3` CSDS API.

use bytes::Bytes;
use envoy_types::pb::envoy::service::status::v3 as status;
use envoy_types::pb::envoy::service::status::v3::per_xds_config::PerXdsConfig;
use prost::Message;

use crate::codec::CsdsCodec;
use crate::codec::convert::{
    node_from_proto, node_matcher_to_proto, node_to_proto, timestamp_to_system_time,
};
use crate::codec::dump;
use crate::error::{Error, Result};
use crate::message::{ConfigDumpEntry, ConfigStatus, NodeDump, StatusRequest};

/// The gRPC path of the v3 `StreamClientStatus` RPC.
pub const STREAM_CLIENT_STATUS_PATH: &str =
    "/envoy.service.status.v3.ClientStatusDiscoveryService/StreamClientStatus";

/// A codec for the v3 CSDS API, backed by `envoy-types`.
#[derive(Debug, Clone, Copy, Default)]
pub struct V3Codec;

impl CsdsCodec for V3Codec {
    type Response = status::ClientStatusResponse;

    fn rpc_path(&self) -> &'static str {
        STREAM_CLIENT_STATUS_PATH
    }

    fn encode_request(&self, request: &StatusRequest) -> Result<Bytes> {
        let proto_request = status::ClientStatusRequest {
            node_matchers: request
                .node_matchers
                .iter()
                .map(node_matcher_to_proto)
                .collect(),
            node: request.node.as_ref().map(node_to_proto),
            ..Default::default()
        };
        Ok(proto_request.encode_to_vec().into())
    }

    fn decode_response(&self, bytes: Bytes) -> Result<Self::Response> {
        status::ClientStatusResponse::decode(bytes)
            .map_err(|e| Error::Protocol(format!("invalid v3 ClientStatusResponse: {e}")))
    }

    fn normalize(&self, response: Self::Response) -> Vec<NodeDump> {
        response.config.into_iter().map(normalize_client_config).collect()
    }
}

// `xds_config` is deprecated in favor of `generic_xds_configs`, but older
// control planes only populate the former.
#[allow(deprecated)]
fn normalize_client_config(config: status::ClientConfig) -> NodeDump {
    let node = config.node.map(node_from_proto).unwrap_or_default();
    let mut dump = NodeDump::new(node);

    for generic in config.generic_xds_configs {
        let status = ConfigStatus::from_proto(generic.config_status);
        let (type_url, body) = match generic.xds_config {
            Some(any) => {
                // The wrapper may be empty when contents were excluded.
                let type_url = if generic.type_url.is_empty() {
                    any.type_url
                } else {
                    generic.type_url
                };
                (type_url, Bytes::from(any.value))
            }
            None => (generic.type_url, Bytes::new()),
        };
        dump.push(
            ConfigDumpEntry::new(type_url, generic.name, body)
                .with_version(generic.version_info)
                .with_last_updated(timestamp_to_system_time(generic.last_updated))
                .with_status(status),
        );
    }

    for per_xds in config.xds_config {
        let status = ConfigStatus::from_proto(per_xds.status);
        match per_xds.per_xds_config {
            Some(PerXdsConfig::ListenerConfig(c)) => dump::push_listeners(&mut dump, c, status),
            Some(PerXdsConfig::ClusterConfig(c)) => dump::push_clusters(&mut dump, c, status),
            Some(PerXdsConfig::RouteConfig(c)) => dump::push_routes(&mut dump, c, status),
            Some(PerXdsConfig::ScopedRouteConfig(c)) => {
                dump::push_scoped_routes(&mut dump, c, status)
            }
            Some(PerXdsConfig::EndpointConfig(c)) => dump::push_endpoints(&mut dump, c, status),
            None => {}
        }
    }

    dump
}
