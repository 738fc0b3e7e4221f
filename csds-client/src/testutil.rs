//! Test doubles for the transport and output layers.
//!
//! Enabled for unit tests and behind the `test-util` feature.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use envoy_types::pb::envoy::admin::v3::{
    ClustersConfigDump, ListenersConfigDump, RoutesConfigDump, ScopedRoutesConfigDump,
    clusters_config_dump::DynamicCluster,
    listeners_config_dump::{DynamicListener, DynamicListenerState},
    routes_config_dump::DynamicRouteConfig,
    scoped_routes_config_dump::DynamicScopedRouteConfigs,
};
use envoy_types::pb::envoy::config::core::v3::Node;
use envoy_types::pb::envoy::r#type::matcher::v3::NodeMatcher;
use envoy_types::pb::envoy::r#type::matcher::v3::string_matcher::MatchPattern;
use envoy_types::pb::envoy::service::status::v3 as status;
use envoy_types::pb::google::protobuf::Any;
use prost::Message;
use tokio::time::Instant;

use crate::codec::v2::proto as v2;
use crate::error::{Error, Result};
use crate::output::{OutputSink, Snapshot};
use crate::resource::{ResourceKind, resource_name};
use crate::transport::{Transport, TransportBuilder, TransportStream};

const SYNCED: i32 = 1;
const FALLBACK_NODE_ID: &str = "fake-node";

/// A resource served by the fake CSDS responses.
#[derive(Debug, Clone)]
pub struct FakeResource {
    /// Type URL of the resource.
    pub type_url: String,
    /// Serialized resource.
    pub body: Vec<u8>,
}

impl FakeResource {
    /// Create a resource.
    pub fn new(type_url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            type_url: type_url.into(),
            body,
        }
    }

    fn to_any(&self) -> Any {
        Any {
            type_url: self.type_url.clone(),
            value: self.body.clone(),
        }
    }

    fn name(&self) -> String {
        resource_name(&self.type_url, &self.body)
    }
}

/// The node ids a fake server reports on: one per exact node id matcher.
fn matched_node_ids(matchers: &[NodeMatcher]) -> Vec<String> {
    let ids: Vec<String> = matchers
        .iter()
        .filter_map(|m| m.node_id.as_ref()?.match_pattern.as_ref())
        .filter_map(|pattern| match pattern {
            MatchPattern::Exact(id) => Some(id.clone()),
            _ => None,
        })
        .collect();
    if ids.is_empty() {
        vec![FALLBACK_NODE_ID.to_string()]
    } else {
        ids
    }
}

fn node(id: String) -> Option<Node> {
    Some(Node {
        id,
        ..Default::default()
    })
}

/// Answer an encoded v3 `ClientStatusRequest` the way a control plane
/// would, reporting every resource as synced through `generic_xds_configs`.
///
/// Panics if the request does not decode.
pub fn fake_v3_response(request: Bytes, resources: &[FakeResource]) -> Bytes {
    let request = status::ClientStatusRequest::decode(request).expect("v3 request");
    let config = matched_node_ids(&request.node_matchers)
        .into_iter()
        .map(|id| status::ClientConfig {
            node: node(id),
            generic_xds_configs: resources
                .iter()
                .map(|resource| status::client_config::GenericXdsConfig {
                    type_url: resource.type_url.clone(),
                    name: resource.name(),
                    version_info: "1".to_string(),
                    xds_config: Some(resource.to_any()),
                    config_status: SYNCED,
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        })
        .collect();
    status::ClientStatusResponse { config }
        .encode_to_vec()
        .into()
}

/// Answer an encoded v2 `ClientStatusRequest`, grouping resources into the
/// per-xDS config dumps.
///
/// Resource kinds without a v2 dump are left out. Panics if the request
/// does not decode.
pub fn fake_v2_response(request: Bytes, resources: &[FakeResource]) -> Bytes {
    use v2::per_xds_config::PerXdsConfig;

    let request = v2::ClientStatusRequest::decode(request).expect("v2 request");

    let mut listeners = ListenersConfigDump::default();
    let mut clusters = ClustersConfigDump::default();
    let mut routes = RoutesConfigDump::default();
    let mut scoped_routes = ScopedRoutesConfigDump::default();
    for resource in resources {
        match ResourceKind::from_type_url(&resource.type_url) {
            ResourceKind::Listener => listeners.dynamic_listeners.push(DynamicListener {
                name: resource.name(),
                active_state: Some(DynamicListenerState {
                    version_info: "1".to_string(),
                    listener: Some(resource.to_any()),
                    last_updated: None,
                }),
                ..Default::default()
            }),
            ResourceKind::Cluster => clusters.dynamic_active_clusters.push(DynamicCluster {
                version_info: "1".to_string(),
                cluster: Some(resource.to_any()),
                ..Default::default()
            }),
            ResourceKind::RouteConfiguration => {
                routes.dynamic_route_configs.push(DynamicRouteConfig {
                    version_info: "1".to_string(),
                    route_config: Some(resource.to_any()),
                    ..Default::default()
                })
            }
            ResourceKind::ScopedRouteConfiguration => scoped_routes
                .dynamic_scoped_route_configs
                .push(DynamicScopedRouteConfigs {
                    name: resource.name(),
                    version_info: "1".to_string(),
                    scoped_route_configs: vec![resource.to_any()],
                    ..Default::default()
                }),
            _ => {}
        }
    }

    let xds_config: Vec<v2::PerXdsConfig> = [
        PerXdsConfig::ListenerConfig(listeners),
        PerXdsConfig::ClusterConfig(clusters),
        PerXdsConfig::RouteConfig(routes),
        PerXdsConfig::ScopedRouteConfig(scoped_routes),
    ]
    .into_iter()
    .map(|dump| v2::PerXdsConfig {
        status: SYNCED,
        per_xds_config: Some(dump),
    })
    .collect();

    let config = matched_node_ids(&request.node_matchers)
        .into_iter()
        .map(|id| v2::ClientConfig {
            node: node(id),
            xds_config: xds_config.clone(),
        })
        .collect();
    v2::ClientStatusResponse { config }.encode_to_vec().into()
}

/// What a [`MockStream`] does when asked for a response.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Return these bytes.
    Respond(Bytes),
    /// Fail the stream with a gRPC status.
    Fail(tonic::Status),
    /// Close the stream cleanly.
    Close,
    /// Never answer.
    Hang,
}

type Responder = Arc<dyn Fn(&Bytes) -> MockReply + Send + Sync>;

struct MockState {
    responder: Responder,
    script: VecDeque<MockReply>,
    build_failures: usize,
    builds: usize,
    streams: usize,
    requests: Vec<(Instant, Bytes)>,
}

/// An in-memory transport whose streams answer requests through a
/// responder function, optionally preceded by scripted replies.
///
/// Clones share state, so a test keeps one to inspect what the session
/// sent.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MockTransport")
            .field("builds", &state.builds)
            .field("streams", &state.streams)
            .field("requests", &state.requests.len())
            .finish()
    }
}

impl MockTransport {
    /// A transport answering every request with `responder`.
    pub fn new(responder: impl Fn(&Bytes) -> MockReply + Send + Sync + 'static) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                responder: Arc::new(responder),
                script: VecDeque::new(),
                build_failures: 0,
                builds: 0,
                streams: 0,
                requests: Vec::new(),
            })),
        }
    }

    /// A transport answering like a v3 control plane serving `resources`.
    pub fn v3(resources: Vec<FakeResource>) -> Self {
        Self::new(move |request| MockReply::Respond(fake_v3_response(request.clone(), &resources)))
    }

    /// Replies used, in order, before falling back to the responder.
    pub fn with_script(self, script: impl IntoIterator<Item = MockReply>) -> Self {
        self.lock().script.extend(script);
        self
    }

    /// Make the next `n` connection attempts fail.
    pub fn with_build_failures(self, n: usize) -> Self {
        self.lock().build_failures = n;
        self
    }

    /// Number of connection attempts.
    pub fn builds(&self) -> usize {
        self.lock().builds
    }

    /// Number of streams opened.
    pub fn streams(&self) -> usize {
        self.lock().streams
    }

    /// Requests received so far, with the time each was sent.
    pub fn requests(&self) -> Vec<(Instant, Bytes)> {
        self.lock().requests.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl TransportBuilder for MockTransport {
    type Transport = MockTransport;

    async fn build(&self) -> Result<Self::Transport> {
        let mut state = self.lock();
        state.builds += 1;
        if state.build_failures > 0 {
            state.build_failures -= 1;
            return Err(Error::Transport("connection refused".into()));
        }
        Ok(self.clone())
    }
}

impl Transport for MockTransport {
    type Stream = MockStream;

    async fn new_stream(
        &self,
        _path: &'static str,
        initial_requests: Vec<Bytes>,
    ) -> Result<Self::Stream> {
        self.lock().streams += 1;
        let mut stream = MockStream {
            transport: self.clone(),
            pending: VecDeque::new(),
        };
        for request in initial_requests {
            stream.record(request);
        }
        Ok(stream)
    }
}

/// A stream of a [`MockTransport`].
#[derive(Debug)]
pub struct MockStream {
    transport: MockTransport,
    pending: VecDeque<Bytes>,
}

impl MockStream {
    fn record(&mut self, request: Bytes) {
        self.transport
            .lock()
            .requests
            .push((Instant::now(), request.clone()));
        self.pending.push_back(request);
    }
}

impl TransportStream for MockStream {
    async fn send(&mut self, request: Bytes) -> Result<()> {
        self.record(request);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Bytes>> {
        let reply = match self.pending.pop_front() {
            Some(request) => {
                let mut state = self.transport.lock();
                match state.script.pop_front() {
                    Some(reply) => reply,
                    None => (state.responder)(&request),
                }
            }
            None => MockReply::Hang,
        };
        match reply {
            MockReply::Respond(bytes) => Ok(Some(bytes)),
            MockReply::Fail(status) => Err(Error::Stream(status)),
            MockReply::Close => Ok(None),
            MockReply::Hang => std::future::pending().await,
        }
    }
}

/// A sink that records every snapshot with its delivery time.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    deliveries: Arc<Mutex<Vec<(Instant, Snapshot)>>>,
    flushes: Arc<Mutex<usize>>,
}

impl RecordingSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshots delivered so far.
    pub fn deliveries(&self) -> Vec<(Instant, Snapshot)> {
        self.deliveries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of times the sink was flushed.
    pub fn flushes(&self) -> usize {
        *self.flushes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl OutputSink for RecordingSink {
    async fn deliver(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.deliveries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((Instant::now(), snapshot.clone()));
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        *self.flushes.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }
}
