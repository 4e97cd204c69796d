//! Host-facing bridge operations.
//!
//! Every operation here is synchronous and returns without waiting on the
//! network. Outcomes of calls arrive later through the [`EventSink`].

use crate::call::{CallDriver, CallHandle, CallState, MethodType};
use crate::connection::ConnectionRegistry;
use crate::event::EventSink;
use crate::metadata::{self, Metadata};
use crate::registry::CallRegistry;
use crate::settings::{ConnectionConfig, Settings};
use crate::transport::{CallOptions, Connector, OutboundCall, TonicConnector};
use crate::{BridgeError, CallId, ConnectionId};

use bytes::Bytes;
use http::uri::PathAndQuery;
use std::sync::Arc;
use tokio::runtime::{Handle, Runtime};
use tracing::debug;

/// Executor the call drivers and channels run on.
enum Executor {
    Owned(Runtime),
    Shared(Handle),
}

impl Executor {
    fn handle(&self) -> &Handle {
        match self {
            Executor::Owned(runtime) => runtime.handle(),
            Executor::Shared(handle) => handle,
        }
    }
}

/// Bridges host requests onto gRPC calls.
///
/// Connections and calls are identified by integers the host chooses.
///
/// An owned runtime is shut down when the bridge is dropped, so a bridge
/// created with [`Bridge::new`] must not be dropped from within async code.
pub struct Bridge<C: Connector = TonicConnector> {
    executor: Executor,
    connections: ConnectionRegistry<C>,
    calls: Arc<CallRegistry>,
    sink: Arc<dyn EventSink>,
}

impl Bridge<TonicConnector> {
    /// Create a bridge backed by tonic channels, running on its own runtime.
    pub fn new(sink: impl EventSink) -> Result<Self, BridgeError> {
        Self::with_connector(TonicConnector, sink)
    }
}

impl<C: Connector> Bridge<C> {
    /// Create a bridge on its own multi-threaded runtime with one worker per
    /// available processing unit.
    pub fn with_connector(connector: C, sink: impl EventSink) -> Result<Self, BridgeError> {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name("grpc-bridge")
            .enable_all()
            .build()?;

        debug!(threads, "bridge runtime started");
        Ok(Self::build(Executor::Owned(runtime), connector, sink))
    }

    /// Create a bridge that runs on an existing runtime.
    pub fn with_handle(connector: C, sink: impl EventSink, handle: Handle) -> Self {
        Self::build(Executor::Shared(handle), connector, sink)
    }

    fn build(executor: Executor, connector: C, sink: impl EventSink) -> Self {
        Self {
            executor,
            connections: ConnectionRegistry::new(connector),
            calls: Arc::new(CallRegistry::new()),
            sink: Arc::new(sink),
        }
    }

    /// Create or replace connection `id`.
    pub fn configure_connection(
        &self,
        id: ConnectionId,
        config: &ConnectionConfig,
    ) -> Result<(), BridgeError> {
        // channels spawn their background tasks on the current runtime
        let _guard = self.executor.handle().enter();
        self.connections.configure(id, config)
    }

    /// Remove connection `id`. Does nothing if it does not exist.
    pub fn destroy_connection(&self, id: ConnectionId) {
        self.connections.destroy(id);
    }

    /// Settings snapshot of connection `id`.
    pub fn connection_settings(&self, id: ConnectionId) -> Option<Settings> {
        self.connections.settings(id)
    }

    /// Rebuild the channel of connection `id`. Returns `false` if it does not
    /// exist.
    pub fn reset_connection(&self, id: ConnectionId) -> Result<bool, BridgeError> {
        let _guard = self.executor.handle().enter();
        self.connections.reset(id)
    }

    /// Start a unary call with its single request message.
    pub fn start_unary(
        &self,
        call_id: CallId,
        connection_id: ConnectionId,
        path: &str,
        payload: Bytes,
        headers: &Metadata,
    ) -> Result<(), BridgeError> {
        self.start(
            MethodType::Unary,
            call_id,
            connection_id,
            path,
            payload,
            headers,
        )
    }

    /// Start a server-streaming call with its single request message.
    pub fn start_server_streaming(
        &self,
        call_id: CallId,
        connection_id: ConnectionId,
        path: &str,
        payload: Bytes,
        headers: &Metadata,
    ) -> Result<(), BridgeError> {
        self.start(
            MethodType::ServerStreaming,
            call_id,
            connection_id,
            path,
            payload,
            headers,
        )
    }

    /// Send one message on client-streaming call `call_id`, starting the call
    /// on first use. `connection_id`, `path` and `headers` only apply to the
    /// first send.
    pub fn send_client_streaming(
        &self,
        call_id: CallId,
        connection_id: ConnectionId,
        path: &str,
        payload: Bytes,
        headers: &Metadata,
    ) -> Result<(), BridgeError> {
        let (call, driver) = self.calls.get_or_try_insert(call_id, || {
            self.prepare(
                MethodType::ClientStreaming,
                call_id,
                connection_id,
                path,
                headers,
            )
        })?;

        if call.method_type() != MethodType::ClientStreaming {
            return Err(BridgeError::CallTypeMismatch {
                id: call_id,
                expected: MethodType::ClientStreaming,
                actual: call.method_type(),
            });
        }

        if let Some(driver) = driver {
            self.spawn(driver);
        }

        call.send_message(payload)
    }

    /// Half-close client-streaming call `call_id`. Returns whether the call
    /// was found.
    pub fn finish_client_streaming(&self, call_id: CallId) -> bool {
        self.calls.finish(call_id)
    }

    /// Cancel call `call_id`. Returns whether the call was found.
    pub fn cancel(&self, call_id: CallId) -> bool {
        self.calls.cancel(call_id)
    }

    pub fn contains_call(&self, call_id: CallId) -> bool {
        self.calls.contains(call_id)
    }

    pub fn call_state(&self, call_id: CallId) -> Option<CallState> {
        self.calls.get(call_id).map(|call| call.state())
    }

    pub fn active_calls(&self) -> usize {
        self.calls.len()
    }

    pub fn contains_connection(&self, id: ConnectionId) -> bool {
        self.connections.contains(id)
    }

    fn start(
        &self,
        method_type: MethodType,
        call_id: CallId,
        connection_id: ConnectionId,
        path: &str,
        payload: Bytes,
        headers: &Metadata,
    ) -> Result<(), BridgeError> {
        let (call, driver) = self.prepare(method_type, call_id, connection_id, path, headers)?;

        call.send_message(payload)?;
        self.calls.insert(call)?;
        self.spawn(driver);
        Ok(())
    }

    /// Resolve everything a call needs without registering it.
    fn prepare(
        &self,
        method_type: MethodType,
        call_id: CallId,
        connection_id: ConnectionId,
        path: &str,
        headers: &Metadata,
    ) -> Result<(Arc<CallHandle>, CallDriver<C::Transport>), BridgeError> {
        let connection = self.connections.get(connection_id)?;
        let path = method_path(path)?;
        let metadata = metadata::encode_request(headers)?;
        let options = CallOptions::from_settings(connection.settings());

        debug!(
            call_id,
            connection_id,
            path = path.as_str(),
            %method_type,
            timeout = ?options.timeout,
            "starting call"
        );

        let (call, requests) = CallHandle::new(call_id, method_type);
        let driver = CallDriver {
            transport: connection.transport().clone(),
            call: call.clone(),
            outbound: OutboundCall {
                path,
                method_type,
                metadata,
                requests,
                options,
            },
            registry: self.calls.clone(),
            sink: self.sink.clone(),
        };

        Ok((call, driver))
    }

    fn spawn(&self, driver: CallDriver<C::Transport>) {
        self.executor.handle().spawn(driver.run());
    }
}

/// Turn a host method name into a request path.
///
/// One leading `/` is accepted and the rest must be non-empty, so both
/// `pkg.Svc/Method` and `/pkg.Svc/Method` address the same method.
pub fn method_path(path: &str) -> Result<PathAndQuery, BridgeError> {
    let name = path.strip_prefix('/').unwrap_or(path);
    if name.is_empty() {
        return Err(BridgeError::InvalidPath(path.to_string()));
    }

    PathAndQuery::try_from(format!("/{}", name))
        .map_err(|_| BridgeError::InvalidPath(path.to_string()))
}
