//! Transport seam.
//!
//! A [`Connector`] opens a channel for a connection's [`Settings`]; the
//! resulting [`Transport`] opens individual calls on it. The production
//! implementation is backed by a lazily connected tonic channel. Calls of every
//! shape go through the bidirectional streaming entry point with a
//! pass-through [`BytesCodec`], so the driver sees headers, each message and
//! the trailers separately and pulls messages one at a time.

use crate::call::MethodType;
use crate::error::BridgeError;
use crate::settings::{Compression, Settings};

use bytes::{Buf, BufMut, Bytes};
use futures::future::BoxFuture;
use http::uri::PathAndQuery;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::codec::{Codec, CompressionEncoding, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::metadata::MetadataMap;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tonic::{Status, Streaming};

/// Per-call options derived from the connection settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Deadline relative to call start.
    pub timeout: Option<Duration>,
    /// Encoding advertised for, and optionally applied to, messages.
    pub compression: Option<Compression>,
    /// Compress outbound messages with `compression`.
    pub compress_messages: bool,
    /// Maximum inbound message size.
    pub max_response_size: Option<usize>,
}

impl CallOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            timeout: settings.request_timeout(),
            compression: settings.compression(),
            compress_messages: settings.compress_messages(),
            max_response_size: settings.response_size_limit(),
        }
    }
}

/// Everything a transport needs to open a call.
#[derive(Debug)]
pub struct OutboundCall {
    /// `/package.Service/Method`.
    pub path: PathAndQuery,
    pub method_type: MethodType,
    /// Request headers in wire form.
    pub metadata: MetadataMap,
    /// Request messages; the stream ends when the sender is dropped (half-close).
    pub requests: UnboundedReceiver<Bytes>,
    pub options: CallOptions,
}

/// An opened call whose response headers have arrived.
pub struct InboundCall {
    pub headers: MetadataMap,
    pub messages: Box<dyn MessageStream>,
}

/// Pull-based response side of a call.
pub trait MessageStream: Send {
    /// Next response message, `None` once the server finished sending.
    ///
    /// A non-OK terminal status is returned as `Err`, carrying the trailers
    /// as its metadata.
    fn message(&mut self) -> BoxFuture<'_, Result<Option<Bytes>, Status>>;

    /// Trailers of a call that finished with an OK status. Discards any
    /// messages that were not pulled yet.
    fn trailers(&mut self) -> BoxFuture<'_, Result<Option<MetadataMap>, Status>>;
}

/// An open channel able to carry calls.
pub trait Transport: Send + Sync + 'static {
    /// Open a call. Resolves once the response headers arrive, or with the
    /// status of a call rejected before any headers.
    fn start(&self, call: OutboundCall) -> BoxFuture<'static, Result<InboundCall, Status>>;
}

/// Opens transports for connection settings.
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    /// Open a channel. Must not block on network I/O; the channel connects
    /// lazily. Called from within the bridge's runtime context.
    fn connect(&self, settings: &Settings) -> Result<Self::Transport, BridgeError>;
}

/// Codec passing message payloads through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl Codec for BytesCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = BytesCodec;
    type Decoder = BytesCodec;

    fn encoder(&mut self) -> Self::Encoder {
        BytesCodec
    }

    fn decoder(&mut self) -> Self::Decoder {
        BytesCodec
    }
}

impl Encoder for BytesCodec {
    type Item = Bytes;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        dst.put_slice(&item);
        Ok(())
    }
}

impl Decoder for BytesCodec {
    type Item = Bytes;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        let len = src.remaining();
        Ok(Some(src.copy_to_bytes(len)))
    }
}

impl MessageStream for Streaming<Bytes> {
    fn message(&mut self) -> BoxFuture<'_, Result<Option<Bytes>, Status>> {
        Box::pin(Streaming::message(self))
    }

    fn trailers(&mut self) -> BoxFuture<'_, Result<Option<MetadataMap>, Status>> {
        Box::pin(Streaming::trailers(self))
    }
}

fn encoding(compression: Compression) -> CompressionEncoding {
    match compression {
        Compression::Gzip => CompressionEncoding::Gzip,
        Compression::Zstd => CompressionEncoding::Zstd,
    }
}

/// Transport backed by a tonic channel.
#[derive(Debug, Clone)]
pub struct TonicTransport {
    channel: Channel,
}

impl TonicTransport {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

impl Transport for TonicTransport {
    fn start(&self, call: OutboundCall) -> BoxFuture<'static, Result<InboundCall, Status>> {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());

        if let Some(compression) = call.options.compression {
            let encoding = encoding(compression);
            grpc = grpc.accept_compressed(encoding);
            if call.options.compress_messages {
                grpc = grpc.send_compressed(encoding);
            }
        }
        if let Some(limit) = call.options.max_response_size {
            grpc = grpc.max_decoding_message_size(limit);
        }

        let mut request = tonic::Request::new(UnboundedReceiverStream::new(call.requests));
        *request.metadata_mut() = call.metadata;
        if let Some(timeout) = call.options.timeout {
            request.set_timeout(timeout);
        }

        let path = call.path;
        Box::pin(async move {
            grpc.ready()
                .await
                .map_err(|e| Status::unavailable(format!("channel not ready: {}", e)))?;

            let response = grpc.streaming(request, path, BytesCodec).await?;
            let (headers, messages, _) = response.into_parts();

            Ok(InboundCall {
                headers,
                messages: Box::new(messages),
            })
        })
    }
}

/// Connector producing lazily connected tonic channels.
#[derive(Debug, Clone, Copy, Default)]
pub struct TonicConnector;

impl TonicConnector {
    /// Build the channel endpoint for the given settings.
    pub fn endpoint(settings: &Settings) -> Result<Endpoint, BridgeError> {
        let mut endpoint = Endpoint::from_shared(settings.endpoint_uri())
            .map_err(|e| BridgeError::Configuration(format!("invalid endpoint: {}", e)))?;

        if !settings.insecure() {
            endpoint = endpoint
                .tls_config(ClientTlsConfig::new().with_native_roots())
                .map_err(|e| BridgeError::Configuration(format!("tls: {}", e)))?;
        }

        let keepalive = settings.keepalive();
        if let Some(interval) = keepalive.ping_interval() {
            endpoint = endpoint
                .http2_keep_alive_interval(interval)
                .keep_alive_timeout(keepalive.timeout)
                .keep_alive_while_idle(true);
        }

        Ok(endpoint)
    }
}

impl Connector for TonicConnector {
    type Transport = TonicTransport;

    fn connect(&self, settings: &Settings) -> Result<TonicTransport, BridgeError> {
        let channel = Self::endpoint(settings)?.connect_lazy();
        Ok(TonicTransport::new(channel))
    }
}
