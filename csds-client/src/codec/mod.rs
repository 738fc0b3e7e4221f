//! Codecs for encoding/decoding CSDS messages.
//!
//! The codec layer converts between the crate-owned message types
//! ([`StatusRequest`], [`NodeDump`]) and the wire format of one CSDS major
//! version. Everything above this layer depends only on the normalized
//! shape, so supporting another version means adding another [`CsdsCodec`].

use bytes::Bytes;

use crate::error::Result;
use crate::message::{NodeDump, StatusRequest};

mod convert;
mod dump;
pub mod v2;
pub mod v3;

pub use v2::V2Codec;
pub use v3::V3Codec;

/// Trait for encoding/decoding the messages of one CSDS major version.
pub trait CsdsCodec: Send + Sync + 'static {
    /// The decoded, version-specific response.
    type Response: Send + 'static;

    /// The gRPC path of the `StreamClientStatus` method for this version.
    fn rpc_path(&self) -> &'static str;

    /// Encode a [`StatusRequest`] to bytes.
    fn encode_request(&self, request: &StatusRequest) -> Result<Bytes>;

    /// Decode bytes into a version-specific response.
    ///
    /// Returns [`Error::Protocol`](crate::Error::Protocol) if the bytes are
    /// not a valid response envelope.
    fn decode_response(&self, bytes: Bytes) -> Result<Self::Response>;

    /// Flatten a response into one [`NodeDump`] per reported node.
    ///
    /// Resources of unknown types are passed through with no references.
    fn normalize(&self, response: Self::Response) -> Vec<NodeDump>;

    /// Decode and normalize in one step.
    fn decode_dumps(&self, bytes: Bytes) -> Result<Vec<NodeDump>> {
        self.decode_response(bytes).map(|r| self.normalize(r))
    }
}
