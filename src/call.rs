//! Per-call state machine and driver.
//!
//! A call moves through `Initiated → AwaitingHeaders → HeadersReceived →
//! Streaming → Closed`. The request side is closed independently: unary and
//! server-streaming calls half-close right after their single request, while
//! client-streaming calls half-close when the host finishes them. That is
//! reported as `HalfClosed` until the call closes.
//!
//! Inbound messages are flow controlled with credits. The driver pulls a
//! message only after taking a credit; each send grants one, and each
//! server-streaming response grants exactly one more once it has been
//! emitted.

use crate::event::{CallEvent, EventSink};
use crate::metadata;
use crate::registry::CallRegistry;
use crate::status;
use crate::transport::{OutboundCall, Transport};
use crate::{BridgeError, CallId};

use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;
use tonic::Status;
use tonic::metadata::MetadataMap;
use tracing::{debug, trace, warn};

/// Shape of a call.
///
/// Bidirectional streaming is expressed as a client-streaming call whose
/// responses are read while requests are still being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodType {
    Unary,
    ServerStreaming,
    ClientStreaming,
}

impl MethodType {
    /// Whether the server answers with a single message.
    pub fn is_single_response(self) -> bool {
        !matches!(self, MethodType::ServerStreaming)
    }
}

impl fmt::Display for MethodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MethodType::Unary => "unary",
            MethodType::ServerStreaming => "server-streaming",
            MethodType::ClientStreaming => "client-streaming",
        };
        write!(f, "{}", name)
    }
}

/// Observable lifecycle state of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Initiated,
    AwaitingHeaders,
    HeadersReceived,
    Streaming,
    HalfClosed,
    Closed,
}

/// Progress of the response side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Inbound {
    Initiated,
    AwaitingHeaders,
    HeadersReceived,
    Streaming,
    Closed,
}

/// Transport-independent call state machine.
///
/// Each transition returns the events it produces.
#[derive(Debug)]
pub struct CallMachine {
    id: CallId,
    method_type: MethodType,
    inbound: Inbound,
    half_closed: bool,
    responses: usize,
}

impl CallMachine {
    pub fn new(id: CallId, method_type: MethodType) -> Self {
        Self {
            id,
            method_type,
            inbound: Inbound::Initiated,
            half_closed: false,
            responses: 0,
        }
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn method_type(&self) -> MethodType {
        self.method_type
    }

    pub fn state(&self) -> CallState {
        match self.inbound {
            Inbound::Closed => CallState::Closed,
            _ if self.half_closed => CallState::HalfClosed,
            Inbound::Initiated => CallState::Initiated,
            Inbound::AwaitingHeaders => CallState::AwaitingHeaders,
            Inbound::HeadersReceived => CallState::HeadersReceived,
            Inbound::Streaming => CallState::Streaming,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inbound == Inbound::Closed
    }

    /// Number of response messages delivered so far.
    pub fn responses(&self) -> usize {
        self.responses
    }

    /// Whether the driver should stop pulling messages and wait for the
    /// terminal status.
    pub fn response_complete(&self) -> bool {
        self.method_type.is_single_response() && self.responses > 0
    }

    /// The call has been handed to the transport.
    pub fn on_start(&mut self) {
        if self.inbound == Inbound::Initiated {
            self.inbound = Inbound::AwaitingHeaders;
        }
    }

    /// Response headers arrived.
    pub fn on_headers(&mut self, headers: &MetadataMap) -> CallEvent {
        self.inbound = Inbound::HeadersReceived;
        CallEvent::Headers {
            id: self.id,
            payload: metadata::decode(headers),
        }
    }

    /// A response message arrived. Returns the event and whether one more
    /// message should be requested.
    pub fn on_message(&mut self, payload: Bytes) -> (CallEvent, bool) {
        self.inbound = Inbound::Streaming;
        self.responses += 1;
        let event = CallEvent::Response {
            id: self.id,
            payload,
        };
        (event, self.method_type == MethodType::ServerStreaming)
    }

    /// The request side was closed. Returns `false` if it already was, or
    /// if the call is closed.
    pub fn on_half_close(&mut self) -> bool {
        if self.half_closed || self.is_closed() {
            return false;
        }
        self.half_closed = true;
        true
    }

    /// The call reached its terminal status.
    ///
    /// A non-OK status produces an `error` event followed by a `trailers`
    /// event carrying the same trailers; an OK status only `trailers`.
    /// Returns nothing if the call was already closed.
    pub fn on_close(&mut self, status: &Status, trailers: &MetadataMap) -> Vec<CallEvent> {
        if self.is_closed() {
            return Vec::new();
        }
        self.inbound = Inbound::Closed;

        let trailers = metadata::decode(trailers);
        let mut events = Vec::with_capacity(2);

        if status.code() != tonic::Code::Ok {
            events.push(CallEvent::Error {
                id: self.id,
                error: status::describe(status),
                code: status.code() as i32,
                trailers: trailers.clone(),
            });
        }
        events.push(CallEvent::Trailers {
            id: self.id,
            payload: trailers,
        });

        events
    }
}

/// Live handle of a registered call, shared by caller threads and the driver.
pub struct CallHandle {
    id: CallId,
    method_type: MethodType,
    machine: Mutex<CallMachine>,
    requests: Mutex<Option<UnboundedSender<Bytes>>>,
    credits: Semaphore,
    cancelled: AtomicBool,
    cancel: Notify,
}

impl CallHandle {
    /// Create a handle and the receiving end of its request stream.
    pub fn new(id: CallId, method_type: MethodType) -> (Arc<Self>, UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(Self {
            id,
            method_type,
            machine: Mutex::new(CallMachine::new(id, method_type)),
            requests: Mutex::new(Some(tx)),
            credits: Semaphore::new(0),
            cancelled: AtomicBool::new(false),
            cancel: Notify::new(),
        });
        (handle, rx)
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn method_type(&self) -> MethodType {
        self.method_type
    }

    pub fn state(&self) -> CallState {
        self.machine.lock().state()
    }

    pub fn is_closed(&self) -> bool {
        self.machine.lock().is_closed()
    }

    /// Send one request message and apply the flow control of the call shape:
    /// every send requests one response message; unary and server-streaming
    /// calls then half-close.
    pub fn send_message(&self, payload: Bytes) -> Result<(), BridgeError> {
        {
            let requests = self.requests.lock();
            let tx = requests.as_ref().ok_or(BridgeError::CallClosed(self.id))?;
            tx.send(payload)
                .map_err(|_| BridgeError::CallClosed(self.id))?;
        }

        self.request(1);

        if self.method_type != MethodType::ClientStreaming {
            self.half_close();
        }

        Ok(())
    }

    /// Grant `n` inbound message credits.
    pub fn request(&self, n: usize) {
        trace!(call_id = self.id, credits = n, "requesting messages");
        self.credits.add_permits(n);
    }

    /// Close the request side. Returns `false` if the call is already closed.
    pub fn half_close(&self) -> bool {
        let mut machine = self.machine.lock();
        if machine.is_closed() {
            return false;
        }
        if machine.on_half_close() {
            debug!(call_id = self.id, "half-closed");
            self.requests.lock().take();
        }
        true
    }

    /// Cancel the call. Removal from the registry happens when the driver
    /// delivers the resulting close. Returns `false` if the call is already
    /// closed.
    pub fn cancel(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            debug!(call_id = self.id, "cancelling");
            self.cancel.notify_one();
        }
        true
    }

    async fn cancelled(&self) {
        self.cancel.notified().await;
    }

    async fn take_credit(&self) {
        if let Ok(permit) = self.credits.acquire().await {
            permit.forget();
        }
    }
}

impl fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallHandle")
            .field("id", &self.id)
            .field("method_type", &self.method_type)
            .field("state", &self.state())
            .finish()
    }
}

/// Terminal outcome of a call.
struct Closed {
    status: Status,
    trailers: MetadataMap,
}

impl Closed {
    fn ok(trailers: MetadataMap) -> Self {
        Self {
            status: status::ok(),
            trailers,
        }
    }

    fn from_status(status: Status) -> Self {
        let trailers = status.metadata().clone();
        Self { status, trailers }
    }
}

/// Everything the driver task needs, bundled so a start request can hand it
/// off in one piece.
pub struct CallDriver<T: Transport> {
    pub transport: Arc<T>,
    pub call: Arc<CallHandle>,
    pub outbound: OutboundCall,
    pub registry: Arc<CallRegistry>,
    pub sink: Arc<dyn EventSink>,
}

impl<T: Transport> CallDriver<T> {
    /// Run the call to completion, emitting its events in order.
    pub async fn run(self) {
        let CallDriver {
            transport,
            call,
            outbound,
            registry,
            sink,
        } = self;

        let timeout = outbound.options.timeout;
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut guard = CloseGuard {
            call: call.clone(),
            registry,
            sink: sink.clone(),
            done: false,
        };

        let closed = tokio::select! {
            biased;
            _ = call.cancelled() => Closed::from_status(status::cancelled()),
            _ = expire(deadline) => {
                Closed::from_status(status::deadline_exceeded(timeout.unwrap_or_default()))
            }
            closed = exchange(transport.as_ref(), &call, outbound, sink.as_ref()) => closed,
        };

        guard.close(closed);
    }
}

/// Removes the call from the registry and emits its terminal events.
///
/// If the driver is dropped before closing the call, because the transport
/// panicked or the task was aborted, the call is closed with `INTERNAL`.
struct CloseGuard {
    call: Arc<CallHandle>,
    registry: Arc<CallRegistry>,
    sink: Arc<dyn EventSink>,
    done: bool,
}

impl CloseGuard {
    fn close(&mut self, closed: Closed) {
        self.done = true;
        self.registry.remove(&self.call);

        let events = self
            .call
            .machine
            .lock()
            .on_close(&closed.status, &closed.trailers);
        debug!(
            call_id = self.call.id,
            code = closed.status.code() as i32,
            "call closed"
        );
        for event in events {
            emit(self.sink.as_ref(), event);
        }
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        if !self.done {
            warn!(call_id = self.call.id, "call driver stopped before the call closed");
            self.close(Closed::from_status(Status::internal(
                "call driver stopped unexpectedly",
            )));
        }
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn exchange<T: Transport>(
    transport: &T,
    call: &CallHandle,
    outbound: OutboundCall,
    sink: &dyn EventSink,
) -> Closed {
    call.machine.lock().on_start();

    let inbound = match transport.start(outbound).await {
        Ok(inbound) => inbound,
        Err(status) => return Closed::from_status(status),
    };

    let event = call.machine.lock().on_headers(&inbound.headers);
    emit(sink, event);

    let mut messages = inbound.messages;
    while !call.machine.lock().response_complete() {
        call.take_credit().await;

        match messages.message().await {
            Ok(Some(payload)) => {
                let (event, more) = call.machine.lock().on_message(payload);
                emit(sink, event);
                if more {
                    call.request(1);
                }
            }
            Ok(None) => break,
            Err(status) => return Closed::from_status(status),
        }
    }

    match messages.trailers().await {
        Ok(trailers) => Closed::ok(trailers.unwrap_or_default()),
        Err(status) => Closed::from_status(status),
    }
}

fn emit(sink: &dyn EventSink, event: CallEvent) {
    trace!(call_id = event.id(), kind = event.kind(), "emitting event");
    sink.emit(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    fn trailers() -> MetadataMap {
        let mut map = MetadataMap::new();
        map.insert("x-trailer", "t".parse().unwrap());
        map
    }

    #[test]
    fn test_method_type_single_response() {
        assert!(MethodType::Unary.is_single_response());
        assert!(MethodType::ClientStreaming.is_single_response());
        assert!(!MethodType::ServerStreaming.is_single_response());
    }

    #[test]
    fn test_method_type_display() {
        assert_eq!(MethodType::Unary.to_string(), "unary");
        assert_eq!(MethodType::ServerStreaming.to_string(), "server-streaming");
        assert_eq!(MethodType::ClientStreaming.to_string(), "client-streaming");
    }

    #[test]
    fn test_machine_new() {
        let machine = CallMachine::new(1, MethodType::Unary);
        assert_eq!(machine.id(), 1);
        assert_eq!(machine.method_type(), MethodType::Unary);
        assert_eq!(machine.state(), CallState::Initiated);
        assert_eq!(machine.responses(), 0);
        assert!(!machine.is_closed());
    }

    #[test]
    fn test_machine_progression() {
        let mut machine = CallMachine::new(1, MethodType::ServerStreaming);

        machine.on_start();
        assert_eq!(machine.state(), CallState::AwaitingHeaders);

        let event = machine.on_headers(&MetadataMap::new());
        assert_eq!(event.kind(), "headers");
        assert_eq!(machine.state(), CallState::HeadersReceived);

        let (event, more) = machine.on_message(Bytes::from_static(b"a"));
        assert_eq!(event.kind(), "response");
        assert!(more);
        assert_eq!(machine.state(), CallState::Streaming);
        assert!(!machine.response_complete());

        let events = machine.on_close(&status::ok(), &trailers());
        assert_eq!(events.len(), 1);
        assert_eq!(machine.state(), CallState::Closed);
    }

    #[test]
    fn test_machine_unary_does_not_request_more() {
        let mut machine = CallMachine::new(1, MethodType::Unary);
        machine.on_start();
        machine.on_headers(&MetadataMap::new());

        let (_, more) = machine.on_message(Bytes::from_static(b"a"));
        assert!(!more);
        assert!(machine.response_complete());
    }

    #[test]
    fn test_machine_client_streaming_does_not_request_more() {
        let mut machine = CallMachine::new(1, MethodType::ClientStreaming);
        let (_, more) = machine.on_message(Bytes::from_static(b"a"));
        assert!(!more);
    }

    #[test]
    fn test_machine_half_close() {
        let mut machine = CallMachine::new(1, MethodType::ClientStreaming);
        machine.on_start();
        machine.on_headers(&MetadataMap::new());
        machine.on_message(Bytes::from_static(b"a"));

        assert!(machine.on_half_close());
        assert_eq!(machine.state(), CallState::HalfClosed);
        assert!(!machine.on_half_close());

        machine.on_close(&status::ok(), &MetadataMap::new());
        assert_eq!(machine.state(), CallState::Closed);
        assert!(!machine.on_half_close());
    }

    #[test]
    fn test_machine_half_close_before_headers() {
        let mut machine = CallMachine::new(1, MethodType::Unary);
        machine.on_start();
        assert!(machine.on_half_close());
        assert_eq!(machine.state(), CallState::HalfClosed);

        machine.on_headers(&MetadataMap::new());
        assert_eq!(machine.state(), CallState::HalfClosed);
    }

    #[test]
    fn test_machine_close_ok_emits_trailers_only() {
        let mut machine = CallMachine::new(5, MethodType::Unary);
        let events = machine.on_close(&status::ok(), &trailers());

        assert_eq!(events.len(), 1);
        match &events[0] {
            CallEvent::Trailers { id, payload } => {
                assert_eq!(*id, 5);
                assert_eq!(payload.get("x-trailer"), Some("t"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_machine_close_error_emits_error_then_trailers() {
        let mut machine = CallMachine::new(5, MethodType::Unary);
        let status = Status::not_found("no such key");
        let events = machine.on_close(&status, &trailers());

        assert_eq!(events.len(), 2);
        match &events[0] {
            CallEvent::Error {
                id,
                error,
                code,
                trailers,
            } => {
                assert_eq!(*id, 5);
                assert_eq!(error, "NOT_FOUND: no such key");
                assert_eq!(*code, Code::NotFound as i32);
                assert_eq!(trailers.get("x-trailer"), Some("t"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match &events[1] {
            CallEvent::Trailers { payload, .. } => {
                assert_eq!(payload.get("x-trailer"), Some("t"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_machine_close_once() {
        let mut machine = CallMachine::new(5, MethodType::Unary);
        assert_eq!(machine.on_close(&status::ok(), &MetadataMap::new()).len(), 1);
        assert!(
            machine
                .on_close(&status::cancelled(), &MetadataMap::new())
                .is_empty()
        );
    }

    #[test]
    fn test_handle_unary_send_half_closes() {
        let (handle, mut rx) = CallHandle::new(1, MethodType::Unary);
        handle.send_message(Bytes::from_static(b"req")).unwrap();

        assert_eq!(handle.state(), CallState::HalfClosed);
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"req"));
        // sender dropped by the half-close
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert_eq!(handle.credits.available_permits(), 1);

        assert!(matches!(
            handle.send_message(Bytes::from_static(b"again")),
            Err(BridgeError::CallClosed(1))
        ));
    }

    #[test]
    fn test_handle_client_streaming_sends() {
        let (handle, mut rx) = CallHandle::new(2, MethodType::ClientStreaming);
        handle.send_message(Bytes::from_static(b"a")).unwrap();
        handle.send_message(Bytes::from_static(b"b")).unwrap();

        assert_eq!(handle.state(), CallState::Initiated);
        assert_eq!(handle.credits.available_permits(), 2);
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"a"));
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"b"));

        assert!(handle.half_close());
        assert_eq!(handle.state(), CallState::HalfClosed);
        assert!(handle.half_close());
        assert!(matches!(
            handle.send_message(Bytes::from_static(b"c")),
            Err(BridgeError::CallClosed(2))
        ));
    }

    #[test]
    fn test_handle_cancel() {
        let (handle, _rx) = CallHandle::new(3, MethodType::ServerStreaming);
        assert!(handle.cancel());
        assert!(handle.cancel());

        handle
            .machine
            .lock()
            .on_close(&status::cancelled(), &MetadataMap::new());
        assert!(!handle.cancel());
        assert!(!handle.half_close());
    }
}
