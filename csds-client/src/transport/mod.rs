//! Provides abstraction for transport layers.

use crate::error::Result;
use bytes::Bytes;
use std::future::Future;

pub mod credentials;
pub mod tonic;

/// Factory for [`Transport`]s.
///
/// The session calls [`build`](Self::build) on every connection attempt, so
/// a broken channel is replaced rather than reused.
pub trait TransportBuilder: Send + Sync + 'static {
    /// The transport type produced by this builder.
    type Transport: Transport;

    /// Establish a channel to the CSDS server.
    fn build(&self) -> impl Future<Output = Result<Self::Transport>> + Send;
}

/// An established channel that can open CSDS streams.
pub trait Transport: Send + Sync + 'static {
    /// The stream type produced by this transport.
    type Stream: TransportStream;

    /// Opens a bidirectional stream on the gRPC method at `path`.
    ///
    /// `initial_requests` are queued before the stream is opened, for servers
    /// that hold back response headers until they see a request.
    fn new_stream(
        &self,
        path: &'static str,
        initial_requests: Vec<Bytes>,
    ) -> impl Future<Output = Result<Self::Stream>> + Send;
}

/// A bidirectional byte stream carrying serialized CSDS messages.
///
/// (De)serialization is left to the codec layer.
pub trait TransportStream: Send + 'static {
    /// Send a serialized status request.
    fn send(&mut self, request: Bytes) -> impl Future<Output = Result<()>> + Send;

    /// Receive a serialized status response.
    ///
    /// Returns:
    /// - `Ok(Some(bytes))` - Received a response.
    /// - `Ok(None)` - Stream closed normally.
    /// - `Err(_)` - Stream error (connection dropped, etc.)
    fn recv(&mut self) -> impl Future<Output = Result<Option<Bytes>>> + Send;
}
