//! The CSDS session: connects, exchanges status requests and responses, and
//! hands results to the output sink.
//!
//! A session is a sequential state machine:
//!
//! ```text
//! Idle -> Connecting -> Awaiting -> Delivering -> Sleeping -> Awaiting   (monitor)
//!                                              -> Closed                 (single-shot)
//! any  -> Failed (fatal error)
//! any  -> Closed (cancellation)
//! ```
//!
//! Exactly one request is outstanding at a time and a cycle, including the
//! sink, completes before the next one starts.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::client::config::ClientConfig;
use crate::client::retry::Backoff;
use crate::codec::CsdsCodec;
use crate::error::{Error, Result};
use crate::filter::NodeFilter;
use crate::message::StatusRequest;
use crate::output::{OutputSink, Snapshot};
use crate::runtime::Runtime;
use crate::transport::{Transport, TransportBuilder, TransportStream};

/// The phase a [`Session`] is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Built but not started.
    Idle,
    /// Establishing the channel and stream.
    Connecting,
    /// A request is outstanding.
    Awaiting,
    /// A response is being filtered and written.
    Delivering,
    /// Waiting for the next monitor cycle.
    Sleeping,
    /// Finished, either normally or by cancellation.
    Closed,
    /// Stopped by a fatal error.
    Failed,
}

/// Builder for [`Session`].
#[derive(Debug)]
pub struct SessionBuilder<TB, C, R, S> {
    transport_builder: TB,
    codec: C,
    runtime: R,
    sink: S,
    request: StatusRequest,
    config: ClientConfig,
    cancel: CancellationToken,
}

impl<TB, C, R, S> SessionBuilder<TB, C, R, S>
where
    TB: TransportBuilder,
    C: CsdsCodec,
    R: Runtime,
    S: OutputSink,
{
    /// Create a builder for a session sending `request`.
    pub fn new(
        config: &ClientConfig,
        request: StatusRequest,
        transport_builder: TB,
        codec: C,
        runtime: R,
        sink: S,
    ) -> Self {
        Self {
            transport_builder,
            codec,
            runtime,
            sink,
            request,
            config: config.clone(),
            cancel: CancellationToken::new(),
        }
    }

    /// Stop the session when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Build the session.
    ///
    /// Fails with [`Error::Config`] if the node filter does not compile.
    /// Nothing is sent until [`Session::run`].
    pub fn build(self) -> Result<Session<TB, C, R, S>> {
        let filter = NodeFilter::new(self.config.filter.mode, &self.config.filter.pattern)?;
        Ok(Session {
            transport_builder: self.transport_builder,
            codec: self.codec,
            runtime: self.runtime,
            sink: self.sink,
            request: self.request,
            filter,
            monitor_interval: self.config.monitor_interval,
            cycle_deadline: self.config.cycle_deadline(),
            visualization: self.config.visualization,
            backoff: Backoff::new(self.config.retry_policy),
            cancel: self.cancel,
            state: SessionState::Idle,
            last_error: None,
            transport: None,
            stream: None,
            sequence: 0,
        })
    }
}

type StreamOf<TB> = <<TB as TransportBuilder>::Transport as Transport>::Stream;

/// A CSDS session.
///
/// Generic over the transport, the protocol version, the runtime and the
/// output, so that each can be replaced in tests.
pub struct Session<TB: TransportBuilder, C, R, S> {
    transport_builder: TB,
    codec: C,
    runtime: R,
    sink: S,
    request: StatusRequest,
    filter: NodeFilter,
    monitor_interval: Duration,
    cycle_deadline: Duration,
    visualization: bool,
    backoff: Backoff,
    cancel: CancellationToken,
    state: SessionState,
    last_error: Option<String>,
    transport: Option<TB::Transport>,
    stream: Option<StreamOf<TB>>,
    sequence: u64,
}

impl<TB: TransportBuilder, C, R, S> fmt::Debug for Session<TB, C, R, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("sequence", &self.sequence)
            .field("connected", &self.stream.is_some())
            .field("last_error", &self.last_error)
            .finish()
    }
}

impl<TB, C, R, S> Session<TB, C, R, S>
where
    TB: TransportBuilder,
    C: CsdsCodec,
    R: Runtime,
    S: OutputSink,
{
    /// The current phase.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The most recent error, fatal or not.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Number of cycles started.
    pub fn cycles(&self) -> u64 {
        self.sequence
    }

    /// Run until the single request is answered, the session is cancelled
    /// in monitor mode, or a fatal error occurs.
    ///
    /// The sink is flushed in every case.
    pub async fn run(&mut self) -> Result<()> {
        let result = self.run_cycles().await;
        self.teardown();

        let flushed = self.sink.flush().await;
        match result.and(flushed) {
            Ok(()) => {
                self.set_state(SessionState::Closed);
                Ok(())
            }
            Err(error) => {
                tracing::error!(%error, "session failed");
                self.last_error = Some(error.to_string());
                self.set_state(SessionState::Failed);
                Err(error)
            }
        }
    }

    fn is_monitor(&self) -> bool {
        !self.monitor_interval.is_zero()
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            tracing::debug!(from = ?self.state, to = ?state, "session state transition");
            self.state = state;
        }
    }

    fn teardown(&mut self) {
        self.stream = None;
        self.transport = None;
    }

    async fn run_cycles(&mut self) -> Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            self.sequence += 1;

            let request = self.codec.encode_request(&self.request)?;
            match self.exchange(request).await {
                Ok(Some(response)) => self.deliver(response).await?,
                Ok(None) => return Ok(()),
                Err(error) if self.is_monitor() && error.is_stream_fault() => {
                    tracing::warn!(%error, cycle = self.sequence, "stream failed, reconnecting next cycle");
                    self.last_error = Some(error.to_string());
                    self.teardown();
                }
                Err(error) => return Err(error),
            }

            if !self.is_monitor() {
                return Ok(());
            }

            self.set_state(SessionState::Sleeping);
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = self.runtime.sleep(self.monitor_interval) => {}
            }
        }
    }

    /// Send one request and wait for its response.
    ///
    /// Returns `Ok(None)` if cancelled.
    async fn exchange(&mut self, request: Bytes) -> Result<Option<Bytes>> {
        let cancel = self.cancel.clone();

        match self.stream.as_mut() {
            Some(stream) => {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(None),
                    sent = stream.send(request) => sent?,
                }
            }
            None => match self.connect(request).await? {
                Some(stream) => self.stream = Some(stream),
                None => return Ok(None),
            },
        }

        self.set_state(SessionState::Awaiting);
        let deadline = self.cycle_deadline;
        let Some(stream) = self.stream.as_mut() else {
            return Err(Error::StreamClosed);
        };
        tokio::select! {
            _ = cancel.cancelled() => Ok(None),
            _ = self.runtime.sleep(deadline) => Err(Error::Timeout(deadline)),
            received = stream.recv() => match received? {
                Some(response) => Ok(Some(response)),
                None => Err(Error::StreamClosed),
            },
        }
    }

    /// Establish the channel and open a stream carrying `initial_request`,
    /// retrying with backoff.
    ///
    /// Returns `Ok(None)` if cancelled.
    async fn connect(&mut self, initial_request: Bytes) -> Result<Option<StreamOf<TB>>> {
        self.set_state(SessionState::Connecting);
        let cancel = self.cancel.clone();

        loop {
            let transport_builder = &self.transport_builder;
            let path = self.codec.rpc_path();
            let attempt = async {
                let transport = transport_builder.build().await?;
                let stream = transport
                    .new_stream(path, vec![initial_request.clone()])
                    .await?;
                Ok::<_, Error>((transport, stream))
            };
            let result = tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                result = attempt => result,
            };

            match result {
                Ok((transport, stream)) => {
                    self.backoff.reset();
                    self.transport = Some(transport);
                    return Ok(Some(stream));
                }
                Err(error) => {
                    let attempts = self.backoff.attempts() + 1;
                    let Some(delay) = self.backoff.next_backoff() else {
                        return Err(Error::Session(format!(
                            "giving up after {attempts} connection attempts: {error}"
                        )));
                    };
                    tracing::warn!(%error, attempts, ?delay, "connection attempt failed");
                    self.last_error = Some(error.to_string());
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(None),
                        _ = self.runtime.sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn deliver(&mut self, response: Bytes) -> Result<()> {
        self.set_state(SessionState::Delivering);

        let dumps = match self.codec.decode_dumps(response) {
            Ok(dumps) => dumps,
            Err(error) if self.is_monitor() => {
                tracing::warn!(%error, cycle = self.sequence, "skipping undecodable response");
                self.last_error = Some(error.to_string());
                return Ok(());
            }
            Err(error) => return Err(error),
        };

        let dumps = self.filter.retain(dumps);
        let snapshot = Snapshot::new(self.sequence, dumps, self.visualization);
        tracing::debug!(cycle = self.sequence, nodes = snapshot.nodes.len(), "delivering snapshot");
        self.sink.deliver(&snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::retry::RetryPolicy;
    use crate::codec::V3Codec;
    use crate::filter::FilterMode;
    use crate::message::{NodeMatcher, StringMatch};
    use crate::resource::tests::{LISTENER_V3, listener_bytes};
    use crate::runtime::tokio::TokioRuntime;
    use crate::testutil::{FakeResource, MockReply, MockTransport, RecordingSink};
    use tokio::time::Instant;

    type TestSession = Session<MockTransport, V3Codec, TokioRuntime, RecordingSink>;

    fn request(node_ids: &[&str]) -> StatusRequest {
        StatusRequest {
            node: None,
            node_matchers: node_ids
                .iter()
                .map(|id| NodeMatcher {
                    node_id: Some(StringMatch::Exact(id.to_string())),
                    node_metadatas: vec![],
                })
                .collect(),
        }
    }

    fn transport() -> MockTransport {
        MockTransport::v3(vec![FakeResource::new(
            LISTENER_V3,
            listener_bytes("lis", "rc"),
        )])
    }

    fn session(
        config: &ClientConfig,
        transport: &MockTransport,
        sink: &RecordingSink,
        cancel: &CancellationToken,
    ) -> TestSession {
        SessionBuilder::new(
            config,
            request(&["node-1"]),
            transport.clone(),
            V3Codec,
            TokioRuntime,
            sink.clone(),
        )
        .with_cancellation(cancel.clone())
        .build()
        .unwrap()
    }

    async fn wait_for_deliveries(sink: &RecordingSink, n: usize) {
        while sink.deliveries().len() < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_delivers_each_cycle_in_order() {
        let config = ClientConfig::new("mock").with_monitor_interval(Duration::from_millis(500));
        let transport = transport();
        let sink = RecordingSink::new();
        let cancel = CancellationToken::new();
        let mut session = session(&config, &transport, &sink, &cancel);

        let (result, ()) = tokio::join!(session.run(), async {
            wait_for_deliveries(&sink, 3).await;
            cancel.cancel();
        });

        result.unwrap();
        assert_eq!(session.state(), SessionState::Closed);

        let deliveries = sink.deliveries();
        assert_eq!(deliveries.len(), 3);
        let sequences: Vec<_> = deliveries.iter().map(|(_, s)| s.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        for pair in deliveries.windows(2) {
            assert!(pair[1].0 - pair[0].0 >= Duration::from_millis(500));
        }
        assert_eq!(transport.requests().len(), 3);
        assert_eq!(transport.streams(), 1);
        assert_eq!(sink.flushes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_shot_sends_one_request() {
        let config = ClientConfig::new("mock").with_request_timeout(Duration::from_secs(3600));
        let transport = transport();
        let sink = RecordingSink::new();
        let mut session = session(&config, &transport, &sink, &CancellationToken::new());
        assert_eq!(session.state(), SessionState::Idle);

        session.run().await.unwrap();

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(transport.requests().len(), 1);
        let deliveries = sink.deliveries();
        assert_eq!(deliveries.len(), 1);
        let node = &deliveries[0].1.nodes[0];
        assert_eq!(node.dump.node.id, "node-1");
        assert_eq!(node.dump.entries[0].name, "lis");
        assert!(node.graph.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_sleep_closes_promptly() {
        let config = ClientConfig::new("mock").with_monitor_interval(Duration::from_secs(10));
        let transport = transport();
        let sink = RecordingSink::new();
        let cancel = CancellationToken::new();
        let mut session = session(&config, &transport, &sink, &cancel);

        let (result, cancelled_at) = tokio::join!(session.run(), async {
            wait_for_deliveries(&sink, 1).await;
            cancel.cancel();
            Instant::now()
        });

        result.unwrap();
        assert!(cancelled_at.elapsed() < Duration::from_secs(1));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(transport.requests().len(), 1);
        assert_eq!(sink.flushes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_awaiting_response_closes() {
        let config = ClientConfig::new("mock").with_request_timeout(Duration::from_secs(3600));
        let transport = transport().with_script([MockReply::Hang]);
        let sink = RecordingSink::new();
        let cancel = CancellationToken::new();
        let mut session = session(&config, &transport, &sink, &cancel);

        let (result, ()) = tokio::join!(session.run(), async {
            while transport.requests().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            cancel.cancel();
        });

        result.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(transport.requests().len(), 1);
        assert!(sink.deliveries().is_empty());
        assert_eq!(sink.flushes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_connecting_closes() {
        let config = ClientConfig::new("mock");
        let transport = transport().with_build_failures(usize::MAX);
        let sink = RecordingSink::new();
        let cancel = CancellationToken::new();
        let mut session = session(&config, &transport, &sink, &cancel);

        let (result, ()) = tokio::join!(session.run(), async {
            while transport.builds() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            cancel.cancel();
        });

        result.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(transport.requests().is_empty());
        assert_eq!(sink.flushes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail_the_session() {
        let mut config = ClientConfig::new("mock");
        config.retry_policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(1), 2.0)
            .unwrap()
            .with_max_attempts(Some(2));
        let transport = transport().with_build_failures(usize::MAX);
        let sink = RecordingSink::new();
        let mut session = session(&config, &transport, &sink, &CancellationToken::new());

        let err = session.run().await.unwrap_err();

        assert!(matches!(err, Error::Session(_)));
        assert_eq!(session.state(), SessionState::Failed);
        assert!(session.last_error().is_some());
        assert_eq!(transport.builds(), 3);
        assert!(transport.requests().is_empty());
        assert!(sink.deliveries().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_recovers_within_retry_budget() {
        let config = ClientConfig::new("mock");
        let transport = transport().with_build_failures(2);
        let sink = RecordingSink::new();
        let mut session = session(&config, &transport, &sink, &CancellationToken::new());

        session.run().await.unwrap();

        assert_eq!(transport.builds(), 3);
        assert_eq!(sink.deliveries().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_skips_protocol_errors() {
        let config = ClientConfig::new("mock").with_monitor_interval(Duration::from_millis(500));
        let transport = transport()
            .with_script([MockReply::Respond(Bytes::from_static(b"\xff\xff\xff\xff"))]);
        let sink = RecordingSink::new();
        let cancel = CancellationToken::new();
        let mut session = session(&config, &transport, &sink, &cancel);

        let (result, ()) = tokio::join!(session.run(), async {
            wait_for_deliveries(&sink, 2).await;
            cancel.cancel();
        });

        result.unwrap();
        let sequences: Vec<_> = sink.deliveries().iter().map(|(_, s)| s.sequence).collect();
        assert_eq!(sequences, vec![2, 3]);
        assert_eq!(transport.streams(), 1);
        assert!(session.last_error().unwrap().contains("protocol error"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_reconnects_after_stream_error() {
        let config = ClientConfig::new("mock").with_monitor_interval(Duration::from_millis(500));
        let transport = transport().with_script([MockReply::Fail(tonic::Status::unavailable("gone"))]);
        let sink = RecordingSink::new();
        let cancel = CancellationToken::new();
        let mut session = session(&config, &transport, &sink, &cancel);

        let (result, ()) = tokio::join!(session.run(), async {
            wait_for_deliveries(&sink, 1).await;
            cancel.cancel();
        });

        result.unwrap();
        assert_eq!(transport.streams(), 2);
        assert_eq!(sink.deliveries()[0].1.sequence, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_shot_timeout_is_fatal() {
        let config = ClientConfig::new("mock").with_request_timeout(Duration::from_secs(1));
        let transport = transport().with_script([MockReply::Hang]);
        let sink = RecordingSink::new();
        let mut session = session(&config, &transport, &sink, &CancellationToken::new());

        let err = session.run().await.unwrap_err();

        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(sink.flushes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_shot_stream_close_is_fatal() {
        let config = ClientConfig::new("mock");
        let transport = transport().with_script([MockReply::Close]);
        let sink = RecordingSink::new();
        let mut session = session(&config, &transport, &sink, &CancellationToken::new());

        let err = session.run().await.unwrap_err();
        assert!(matches!(err, Error::StreamClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_filter_and_graph_applied_before_delivery() {
        let config = ClientConfig::new("mock")
            .with_filter(FilterMode::Suffix, "-prod")
            .with_visualization(true);
        let transport = transport();
        let sink = RecordingSink::new();
        let mut session = SessionBuilder::new(
            &config,
            request(&["a-prod", "b-dev"]),
            transport.clone(),
            V3Codec,
            TokioRuntime,
            sink.clone(),
        )
        .build()
        .unwrap();

        session.run().await.unwrap();

        let deliveries = sink.deliveries();
        let nodes = &deliveries[0].1.nodes;
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].dump.node.id, "a-prod");
        assert!(nodes[0].graph.as_ref().is_some_and(|g| !g.is_empty()));
    }

    #[tokio::test]
    async fn test_invalid_filter_fails_before_any_request() {
        let config = ClientConfig::new("mock").with_filter(FilterMode::Regex, "[");
        let transport = transport();

        let err = SessionBuilder::new(
            &config,
            request(&["node-1"]),
            transport.clone(),
            V3Codec,
            TokioRuntime,
            RecordingSink::new(),
        )
        .build()
        .unwrap_err();

        assert!(matches!(err, Error::Config(_)));
        assert_eq!(transport.builds(), 0);
    }
}
