//! Client entry point: wires configuration, credentials, transport, codec
//! and output into a [`Session`] and runs it.

use tokio_util::sync::CancellationToken;

use crate::client::config::{ApiVersion, ClientConfig};
use crate::client::session::{Session, SessionBuilder};
use crate::codec::{CsdsCodec, V2Codec, V3Codec};
use crate::error::Result;
use crate::message::{Identity, StatusRequest};
use crate::output::{FileSink, OutputSink, StdoutSink};
use crate::request;
use crate::runtime::tokio::TokioRuntime;
use crate::transport::TransportBuilder;
use crate::transport::credentials::Credentials;
use crate::transport::tonic::TonicTransportBuilder;

pub mod config;
pub mod retry;
pub mod session;

/// The CSDS client.
///
/// # Example
///
/// ```no_run
/// use csds_client::{ApiVersion, ClientConfig, CsdsClient};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn run() -> csds_client::Result<()> {
/// let config = ClientConfig::new("http://localhost:18000").with_api_version(ApiVersion::V3);
/// let client = CsdsClient::new(config)?;
/// client.run(CancellationToken::new()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct CsdsClient {
    config: ClientConfig,
}

impl CsdsClient {
    /// Create a client, validating the configuration.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// The validated configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Build the request, resolve credentials and run a session until it
    /// finishes or `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let identity = Identity::local(self.config.platform.as_str());
        let request = request::load(&self.config.request_source, identity).await?;
        let credentials = Credentials::resolve(&self.config).await?;
        let transport_builder = TonicTransportBuilder::new(&self.config, credentials)?;

        match &self.config.output_file {
            Some(path) => {
                let sink = FileSink::create(path).await?;
                self.run_with(request, transport_builder, sink, cancel).await
            }
            None => {
                self.run_with(request, transport_builder, StdoutSink::new(), cancel)
                    .await
            }
        }
    }

    /// Run a session over the given transport and sink, selecting the codec
    /// from the configured API version.
    pub async fn run_with<TB, S>(
        &self,
        request: StatusRequest,
        transport_builder: TB,
        sink: S,
        cancel: CancellationToken,
    ) -> Result<()>
    where
        TB: TransportBuilder,
        S: OutputSink,
    {
        tracing::info!(
            uri = %self.config.uri,
            api_version = %self.config.api_version,
            monitor = self.config.is_monitor(),
            "starting CSDS session"
        );
        match self.config.api_version {
            ApiVersion::V2 => {
                self.session(request, transport_builder, V2Codec, sink, cancel)?
                    .run()
                    .await
            }
            ApiVersion::V3 => {
                self.session(request, transport_builder, V3Codec, sink, cancel)?
                    .run()
                    .await
            }
        }
    }

    fn session<TB, C, S>(
        &self,
        request: StatusRequest,
        transport_builder: TB,
        codec: C,
        sink: S,
        cancel: CancellationToken,
    ) -> Result<Session<TB, C, TokioRuntime, S>>
    where
        TB: TransportBuilder,
        C: CsdsCodec,
        S: OutputSink,
    {
        SessionBuilder::new(
            &self.config,
            request,
            transport_builder,
            codec,
            TokioRuntime,
            sink,
        )
        .with_cancellation(cancel)
        .build()
    }
}
