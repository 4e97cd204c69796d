//! Call events delivered to the host.
//!
//! Events for one call id are emitted in order: `headers`, zero or more
//! `response`, then `error` (only on failure) followed by `trailers`.
//! Events of different calls are not ordered relative to each other.

use crate::CallId;
use crate::metadata::Metadata;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::{Serialize, Serializer};

/// An event for a single call.
///
/// Serializes to the host boundary shape, e.g.
/// `{"type":"response","id":42,"payload":"AQI="}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CallEvent {
    /// Response headers arrived.
    Headers { id: CallId, payload: Metadata },
    /// A response message arrived.
    Response {
        id: CallId,
        #[serde(serialize_with = "serialize_base64")]
        payload: Bytes,
    },
    /// The call closed; always the last event of a call.
    Trailers { id: CallId, payload: Metadata },
    /// The call closed with a non-OK status. Followed by `Trailers`.
    Error {
        id: CallId,
        error: String,
        code: i32,
        trailers: Metadata,
    },
}

impl CallEvent {
    /// The call this event belongs to.
    pub fn id(&self) -> CallId {
        match self {
            CallEvent::Headers { id, .. }
            | CallEvent::Response { id, .. }
            | CallEvent::Trailers { id, .. }
            | CallEvent::Error { id, .. } => *id,
        }
    }

    /// Boundary name of the event type.
    pub fn kind(&self) -> &'static str {
        match self {
            CallEvent::Headers { .. } => "headers",
            CallEvent::Response { .. } => "response",
            CallEvent::Trailers { .. } => "trailers",
            CallEvent::Error { .. } => "error",
        }
    }

    /// Whether this is the final event of its call.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallEvent::Trailers { .. })
    }
}

fn serialize_base64<S: Serializer>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(payload))
}

/// Receiver of call events.
///
/// Implementations must accept events from any thread. Events of one call are
/// always emitted from one task at a time, in order.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: CallEvent);
}

impl EventSink for tokio::sync::mpsc::UnboundedSender<CallEvent> {
    fn emit(&self, event: CallEvent) {
        if let Err(e) = self.send(event) {
            tracing::warn!(call_id = e.0.id(), "event receiver dropped, discarding event");
        }
    }
}

impl EventSink for crossbeam_channel::Sender<CallEvent> {
    fn emit(&self, event: CallEvent) {
        if let Err(e) = self.send(event) {
            tracing::warn!(call_id = e.0.id(), "event receiver dropped, discarding event");
        }
    }
}
