//! `tonic` based transport implementation.
//!
//! This transport uses tonic's low-level `Grpc` client with a `BytesCodec`
//! to send and receive raw bytes, so the same channel serves every CSDS
//! version and the codec layer owns the schema.

use std::time::Duration;

use crate::client::config::ClientConfig;
use crate::error::{Error, Result};
use crate::transport::credentials::{CallCredentials, ChannelSecurity, Credentials};
use crate::transport::{Transport, TransportBuilder, TransportStream};
use bytes::{Buf, BufMut, Bytes};
use http::Uri;
use http::uri::PathAndQuery;
use tokio::sync::mpsc;
use tokio_stream::StreamExt as _;
use tonic::client::Grpc;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tonic::{Status, Streaming};

const REQUEST_CHANNEL_BUFFER_SIZE: usize = 4;

/// A codec that passes bytes through without serialization.
#[derive(Debug, Clone, Copy)]
struct BytesCodec;

impl Codec for BytesCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = BytesEncoder;
    type Decoder = BytesDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        BytesEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        BytesDecoder
    }
}

#[derive(Debug)]
struct BytesEncoder;

impl Encoder for BytesEncoder {
    type Item = Bytes;
    type Error = Status;

    fn encode(
        &mut self,
        item: Self::Item,
        dst: &mut EncodeBuf<'_>,
    ) -> std::result::Result<(), Self::Error> {
        dst.put_slice(&item);
        Ok(())
    }
}

#[derive(Debug)]
struct BytesDecoder;

impl Decoder for BytesDecoder {
    type Item = Bytes;
    type Error = Status;

    fn decode(
        &mut self,
        src: &mut DecodeBuf<'_>,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        Ok(Some(src.copy_to_bytes(src.remaining())))
    }
}

/// Normalize a service URI, adding the scheme implied by the channel
/// security when it is missing.
fn normalize_uri(uri: &str, secure: bool) -> Result<Uri> {
    let uri = if uri.contains("://") {
        uri.to_string()
    } else if secure {
        format!("https://{uri}")
    } else {
        format!("http://{uri}")
    };
    uri.parse()
        .map_err(|e| Error::Config(format!("invalid service_uri {uri:?}: {e}")))
}

/// Opens CSDS streams over a tonic [`Channel`].
#[derive(Clone, Debug)]
pub struct TonicTransport {
    channel: Channel,
    call: Option<CallCredentials>,
}

impl TonicTransport {
    /// Create a transport from an existing tonic [`Channel`].
    pub fn from_channel(channel: Channel) -> Self {
        Self {
            channel,
            call: None,
        }
    }

    /// Attach call credentials to every stream.
    pub fn with_call_credentials(mut self, call: Option<CallCredentials>) -> Self {
        self.call = call;
        self
    }

    /// Connect to a server without transport security.
    pub async fn connect(uri: impl Into<String>) -> Result<Self> {
        let uri: String = uri.into();
        let channel = Channel::from_shared(uri)
            .map_err(|e| Error::Transport(e.to_string()))?
            .connect()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(Self::from_channel(channel))
    }
}

/// Builds [`TonicTransport`]s from the client configuration.
///
/// Every [`build`](TransportBuilder::build) dials a new channel with the
/// resolved [`Credentials`].
#[derive(Debug, Clone)]
pub struct TonicTransportBuilder {
    uri: Uri,
    origin: Option<Uri>,
    domain_name: Option<String>,
    credentials: Credentials,
    connect_timeout: Duration,
}

impl TonicTransportBuilder {
    /// Prepare a builder. Only validates addresses; nothing is dialed.
    pub fn new(config: &ClientConfig, credentials: Credentials) -> Result<Self> {
        let secure = credentials.is_secure();
        let uri = normalize_uri(&config.uri, secure)?;

        let authority = config.authority.as_deref().filter(|a| !a.is_empty());
        let origin = authority
            .map(|authority| {
                let scheme = uri.scheme_str().unwrap_or("http");
                format!("{scheme}://{authority}")
                    .parse::<Uri>()
                    .map_err(|e| Error::Config(format!("invalid authority {authority:?}: {e}")))
            })
            .transpose()?;

        let domain_name = origin
            .as_ref()
            .and_then(Uri::host)
            .or_else(|| uri.host())
            .map(str::to_string);

        Ok(Self {
            uri,
            origin,
            domain_name,
            credentials,
            connect_timeout: config.request_timeout,
        })
    }

    fn tls_config(&self) -> Option<ClientTlsConfig> {
        let tls = match &self.credentials.security {
            ChannelSecurity::Plaintext => return None,
            ChannelSecurity::PlatformDefault => ClientTlsConfig::new().with_native_roots(),
            ChannelSecurity::Tls(material) => {
                let mut tls = match &material.ca_cert {
                    Some(ca) => ClientTlsConfig::new().ca_certificate(Certificate::from_pem(ca)),
                    None => ClientTlsConfig::new().with_native_roots(),
                };
                if let Some((cert, key)) = &material.identity {
                    tls = tls.identity(Identity::from_pem(cert, key));
                }
                tls
            }
        };
        Some(match &self.domain_name {
            Some(domain) => tls.domain_name(domain.clone()),
            None => tls,
        })
    }
}

impl TransportBuilder for TonicTransportBuilder {
    type Transport = TonicTransport;

    async fn build(&self) -> Result<Self::Transport> {
        let mut endpoint = Endpoint::from(self.uri.clone()).connect_timeout(self.connect_timeout);
        if let Some(origin) = &self.origin {
            endpoint = endpoint.origin(origin.clone());
        }
        if let Some(tls) = self.tls_config() {
            endpoint = endpoint
                .tls_config(tls)
                .map_err(|e| Error::Transport(e.to_string()))?;
        }

        let channel = endpoint
            .connect()
            .await
            .map_err(|e| Error::Transport(format!("{}: {e}", self.uri)))?;
        tracing::info!(uri = %self.uri, "connected to CSDS server");

        Ok(TonicTransport::from_channel(channel).with_call_credentials(self.credentials.call.clone()))
    }
}

impl Transport for TonicTransport {
    type Stream = TonicCsdsStream;

    async fn new_stream(
        &self,
        path: &'static str,
        initial_requests: Vec<Bytes>,
    ) -> Result<Self::Stream> {
        let mut grpc = Grpc::new(self.channel.clone());

        grpc.ready()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let (tx, rx) = mpsc::channel::<Bytes>(REQUEST_CHANNEL_BUFFER_SIZE);

        // Queue the initial requests ahead of the channel so the first
        // message is available as soon as the stream is polled.
        let initial_stream = tokio_stream::iter(initial_requests);
        let channel_stream = tokio_stream::wrappers::ReceiverStream::new(rx);
        let request_stream = initial_stream.chain(channel_stream);

        let mut request = tonic::Request::new(request_stream);
        if let Some(call) = &self.call {
            call.apply(request.metadata_mut()).await?;
        }

        let response = grpc
            .streaming(request, PathAndQuery::from_static(path), BytesCodec)
            .await?;

        Ok(TonicCsdsStream {
            sender: tx,
            receiver: response.into_inner(),
        })
    }
}

/// A bidirectional CSDS stream backed by tonic.
#[derive(Debug)]
pub struct TonicCsdsStream {
    sender: mpsc::Sender<Bytes>,
    receiver: Streaming<Bytes>,
}

impl TransportStream for TonicCsdsStream {
    async fn send(&mut self, request: Bytes) -> Result<()> {
        self.sender
            .send(request)
            .await
            .map_err(|_| Error::StreamClosed)
    }

    async fn recv(&mut self) -> Result<Option<Bytes>> {
        Ok(self.receiver.message().await?)
    }
}
