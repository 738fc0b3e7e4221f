//! Flattens admin config dumps into [`ConfigDumpEntry`] lists.
//!
//! The v2 (`envoy.admin.v2alpha`) and v3 (`envoy.admin.v3`) config dump
//! messages are wire compatible, so both codecs decode them into the v3
//! messages and share this walker.

use envoy_types::pb::envoy::admin::v3::{
    ClustersConfigDump, EndpointsConfigDump, ListenersConfigDump, RoutesConfigDump,
    ScopedRoutesConfigDump,
};
use envoy_types::pb::google::protobuf::{Any, Timestamp};

use crate::codec::convert::timestamp_to_system_time;
use crate::message::{ConfigDumpEntry, ConfigStatus, NodeDump};
use crate::resource::resource_name;

/// Build an entry from a resource wrapped in `Any`, resolving its name from
/// the body when the dump does not carry it.
fn entry(
    any: Any,
    name: Option<&str>,
    version: &str,
    last_updated: Option<Timestamp>,
    status: ConfigStatus,
) -> ConfigDumpEntry {
    let name = match name {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => resource_name(&any.type_url, &any.value),
    };
    ConfigDumpEntry::new(any.type_url, name, any.value.into())
        .with_version(version)
        .with_last_updated(timestamp_to_system_time(last_updated))
        .with_status(status)
}

pub(crate) fn push_listeners(dump: &mut NodeDump, config: ListenersConfigDump, status: ConfigStatus) {
    for listener in config.static_listeners {
        if let Some(any) = listener.listener {
            dump.push(entry(any, None, "", listener.last_updated, status));
        }
    }
    for listener in config.dynamic_listeners {
        // Report the state the node is serving, falling back to the
        // in-flight ones.
        let state = listener
            .active_state
            .or(listener.warming_state)
            .or(listener.draining_state);
        let Some(state) = state else {
            continue;
        };
        if let Some(any) = state.listener {
            dump.push(entry(
                any,
                Some(&listener.name),
                &state.version_info,
                state.last_updated,
                status,
            ));
        }
    }
}

pub(crate) fn push_clusters(dump: &mut NodeDump, config: ClustersConfigDump, status: ConfigStatus) {
    for cluster in config.static_clusters {
        if let Some(any) = cluster.cluster {
            dump.push(entry(any, None, "", cluster.last_updated, status));
        }
    }
    let dynamic = config
        .dynamic_active_clusters
        .into_iter()
        .chain(config.dynamic_warming_clusters);
    for cluster in dynamic {
        if let Some(any) = cluster.cluster {
            dump.push(entry(
                any,
                None,
                &cluster.version_info,
                cluster.last_updated,
                status,
            ));
        }
    }
}

pub(crate) fn push_routes(dump: &mut NodeDump, config: RoutesConfigDump, status: ConfigStatus) {
    for route in config.static_route_configs {
        if let Some(any) = route.route_config {
            dump.push(entry(any, None, "", route.last_updated, status));
        }
    }
    for route in config.dynamic_route_configs {
        if let Some(any) = route.route_config {
            dump.push(entry(
                any,
                None,
                &route.version_info,
                route.last_updated,
                status,
            ));
        }
    }
}

pub(crate) fn push_scoped_routes(
    dump: &mut NodeDump,
    config: ScopedRoutesConfigDump,
    status: ConfigStatus,
) {
    for scoped in config.inline_scoped_route_configs {
        for any in scoped.scoped_route_configs {
            dump.push(entry(any, None, "", scoped.last_updated.clone(), status));
        }
    }
    for scoped in config.dynamic_scoped_route_configs {
        for any in scoped.scoped_route_configs {
            dump.push(entry(
                any,
                None,
                &scoped.version_info,
                scoped.last_updated.clone(),
                status,
            ));
        }
    }
}

pub(crate) fn push_endpoints(dump: &mut NodeDump, config: EndpointsConfigDump, status: ConfigStatus) {
    for endpoint in config.static_endpoint_configs {
        if let Some(any) = endpoint.endpoint_config {
            dump.push(entry(any, None, "", endpoint.last_updated, status));
        }
    }
    for endpoint in config.dynamic_endpoint_configs {
        if let Some(any) = endpoint.endpoint_config {
            dump.push(entry(
                any,
                None,
                &endpoint.version_info,
                endpoint.last_updated,
                status,
            ));
        }
    }
}
