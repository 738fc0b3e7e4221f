//! Conversions between crate-owned types and the shared protobuf messages.
//!
//! `Node` and `NodeMatcher` kept their field numbers from v2 to v3, so both
//! codecs use the v3 messages from `envoy-types`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use envoy_types::pb::envoy::config::core::v3 as core;
use envoy_types::pb::envoy::r#type::matcher::v3 as matcher;
use envoy_types::pb::google::protobuf::{Struct, Timestamp, Value, value::Kind};

use crate::message::{Identity, Locality, NodeMatcher, StringMatch};

pub(crate) fn node_to_proto(identity: &Identity) -> core::Node {
    let metadata = (!identity.metadata.is_empty()).then(|| Struct {
        fields: identity
            .metadata
            .iter()
            .map(|(key, value)| {
                (
                    key.clone(),
                    Value {
                        kind: Some(Kind::StringValue(value.clone())),
                    },
                )
            })
            .collect(),
    });

    core::Node {
        id: identity.id.clone(),
        cluster: identity.cluster.clone(),
        metadata,
        locality: identity.locality.as_ref().map(|l| core::Locality {
            region: l.region.clone(),
            zone: l.zone.clone(),
            sub_zone: l.sub_zone.clone(),
        }),
        user_agent_name: identity.user_agent_name.clone(),
        user_agent_version_type: (!identity.user_agent_version.is_empty()).then(|| {
            core::node::UserAgentVersionType::UserAgentVersion(
                identity.user_agent_version.clone(),
            )
        }),
        ..Default::default()
    }
}

pub(crate) fn node_from_proto(node: core::Node) -> Identity {
    let metadata = node
        .metadata
        .map(|s| {
            s.fields
                .into_iter()
                .filter_map(|(key, value)| Some((key, metadata_value(value.kind?)?)))
                .collect()
        })
        .unwrap_or_default();

    let user_agent_version = match node.user_agent_version_type {
        Some(core::node::UserAgentVersionType::UserAgentVersion(version)) => version,
        _ => String::new(),
    };

    Identity {
        id: node.id,
        cluster: node.cluster,
        locality: node.locality.map(|l| Locality {
            region: l.region,
            zone: l.zone,
            sub_zone: l.sub_zone,
        }),
        metadata,
        user_agent_name: node.user_agent_name,
        user_agent_version,
    }
}

fn metadata_value(kind: Kind) -> Option<String> {
    match kind {
        Kind::StringValue(s) => Some(s),
        Kind::NumberValue(n) => Some(n.to_string()),
        Kind::BoolValue(b) => Some(b.to_string()),
        _ => None,
    }
}

pub(crate) fn node_matcher_to_proto(node_matcher: &NodeMatcher) -> matcher::NodeMatcher {
    matcher::NodeMatcher {
        node_id: node_matcher.node_id.as_ref().map(string_matcher_to_proto),
        node_metadatas: node_matcher
            .node_metadatas
            .iter()
            .map(|m| matcher::StructMatcher {
                path: m
                    .path
                    .iter()
                    .map(|key| matcher::struct_matcher::PathSegment {
                        segment: Some(matcher::struct_matcher::path_segment::Segment::Key(
                            key.clone(),
                        )),
                    })
                    .collect(),
                value: Some(matcher::ValueMatcher {
                    match_pattern: Some(matcher::value_matcher::MatchPattern::StringMatch(
                        string_matcher_to_proto(&m.value),
                    )),
                }),
            })
            .collect(),
    }
}

fn string_matcher_to_proto(string_match: &StringMatch) -> matcher::StringMatcher {
    use matcher::string_matcher::MatchPattern;

    let pattern = match string_match {
        StringMatch::Exact(s) => MatchPattern::Exact(s.clone()),
        StringMatch::Prefix(s) => MatchPattern::Prefix(s.clone()),
        StringMatch::Suffix(s) => MatchPattern::Suffix(s.clone()),
        StringMatch::Contains(s) => MatchPattern::Contains(s.clone()),
        StringMatch::SafeRegex(s) => MatchPattern::SafeRegex(matcher::RegexMatcher {
            regex: s.clone(),
            ..Default::default()
        }),
    };
    matcher::StringMatcher {
        match_pattern: Some(pattern),
        ..Default::default()
    }
}

pub(crate) fn timestamp_to_system_time(ts: Option<Timestamp>) -> Option<SystemTime> {
    let ts = ts?;
    let seconds = u64::try_from(ts.seconds).ok()?;
    let nanos = u32::try_from(ts.nanos).ok()?;
    UNIX_EPOCH.checked_add(Duration::new(seconds, nanos))
}
