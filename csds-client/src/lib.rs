//! A client for the [Client Status Discovery Service](https://www.envoyproxy.io/docs/envoy/latest/api-v3/service/status/v3/csds.proto)
//! (CSDS).
//!
//! CSDS lets an operator ask a control plane which configuration each of
//! its xDS clients currently holds. This crate:
//! - opens an authenticated gRPC channel to the CSDS service,
//! - sends a status request once, or repeatedly in monitor mode,
//! - decodes the v2 or v3 response into a version-independent [`NodeDump`],
//! - filters nodes by id and derives a [`DependencyGraph`] of the resources
//!   each node holds,
//! - renders the result as a status table, JSON lines and Graphviz DOT.
//!
//! # Example
//!
//! ```no_run
//! use csds_client::{ApiVersion, ClientConfig, CsdsClient, FilterMode};
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> csds_client::Result<()> {
//! let config = ClientConfig::new("trafficdirector.googleapis.com:443")
//!     .with_api_version(ApiVersion::V3)
//!     .with_filter(FilterMode::Prefix, "projects/123/")
//!     .with_monitor_interval(Duration::from_secs(5))
//!     .with_visualization(true);
//!
//! let cancel = CancellationToken::new();
//! CsdsClient::new(config)?.run(cancel).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Feature Flags
//!
//! - `test-util`: Exposes the [`testutil`] module with an in-memory
//!   transport, fake CSDS responses and a recording output sink.

pub mod client;
pub mod codec;
pub mod error;
pub mod filter;
pub mod graph;
pub mod message;
pub mod output;
pub mod request;
pub mod resource;
pub mod runtime;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testutil;

pub use client::CsdsClient;
pub use client::config::{
    ApiVersion, AuthnMode, ClientConfig, FilterConfig, Platform, RequestSource, TlsFiles,
};
pub use client::retry::{Backoff, RetryPolicy};
pub use client::session::{Session, SessionBuilder, SessionState};
pub use codec::{CsdsCodec, V2Codec, V3Codec};
pub use error::{Error, Result};
pub use filter::{FilterMode, NodeFilter};
pub use graph::{DependencyGraph, GraphNode};
pub use message::{
    ConfigDumpEntry, ConfigStatus, Identity, Locality, MetadataMatch, NodeDump, NodeMatcher,
    StatusRequest, StringMatch,
};
pub use output::{FileSink, NodeSnapshot, OutputSink, Snapshot, StdoutSink};
pub use resource::{ResourceKind, ResourceRef};
pub use runtime::Runtime;
pub use runtime::tokio::TokioRuntime;
pub use transport::credentials::{CallCredentials, ChannelSecurity, Credentials, TlsMaterial};
pub use transport::tonic::{TonicTransport, TonicTransportBuilder};
pub use transport::{Transport, TransportBuilder, TransportStream};
