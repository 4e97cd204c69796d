//! Long-lived channel connections keyed by host-assigned connection id.

use crate::settings::{ConnectionConfig, Settings};
use crate::transport::Connector;
use crate::{BridgeError, ConnectionId};

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// One configured channel and the settings it was created with.
///
/// Calls hold their own reference to the transport, so they outlive the
/// connection's registry entry.
#[derive(Debug)]
pub struct Connection<T> {
    id: ConnectionId,
    settings: Settings,
    transport: Arc<T>,
}

impl<T> Connection<T> {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }
}

/// Registry of active connections.
pub struct ConnectionRegistry<C: Connector> {
    connector: C,
    connections: RwLock<HashMap<ConnectionId, Arc<Connection<C::Transport>>>>,
}

impl<C: Connector> ConnectionRegistry<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Create the connection `id`, replacing any existing one.
    ///
    /// The previous connection is destroyed before the new configuration is
    /// validated, so a failed configure leaves `id` absent.
    pub fn configure(
        &self,
        id: ConnectionId,
        config: &ConnectionConfig,
    ) -> Result<(), BridgeError> {
        self.destroy(id);

        let settings = Settings::resolve(config)?;
        let transport = self.connector.connect(&settings)?;

        info!(
            connection_id = id,
            host = settings.host(),
            insecure = settings.insecure(),
            "connection configured"
        );

        let connection = Connection {
            id,
            settings,
            transport: Arc::new(transport),
        };
        self.connections.write().insert(id, Arc::new(connection));
        Ok(())
    }

    /// Drop the connection `id`. Calls already in flight keep the channel
    /// alive until they finish. Absent ids are ignored.
    pub fn destroy(&self, id: ConnectionId) {
        if self.connections.write().remove(&id).is_some() {
            info!(connection_id = id, "connection destroyed");
        }
    }

    /// Look up a connection for a call start.
    pub fn get(&self, id: ConnectionId) -> Result<Arc<Connection<C::Transport>>, BridgeError> {
        self.connections
            .read()
            .get(&id)
            .cloned()
            .ok_or(BridgeError::ConnectionNotFound(id))
    }

    /// Settings snapshot of connection `id`.
    pub fn settings(&self, id: ConnectionId) -> Option<Settings> {
        self.connections
            .read()
            .get(&id)
            .map(|connection| connection.settings.clone())
    }

    /// Replace the channel of connection `id` with a fresh one built from the
    /// same settings.
    ///
    /// Returns `false` if `id` is absent, or if it was destroyed or
    /// reconfigured while the new channel was being built. The newer entry
    /// is left in place in that case.
    pub fn reset(&self, id: ConnectionId) -> Result<bool, BridgeError> {
        let Ok(current) = self.get(id) else {
            return Ok(false);
        };

        let settings = current.settings.clone();
        let transport = self.connector.connect(&settings)?;
        let connection = Connection {
            id,
            settings,
            transport: Arc::new(transport),
        };

        let mut connections = self.connections.write();
        match connections.get(&id) {
            Some(entry) if Arc::ptr_eq(entry, &current) => {}
            _ => return Ok(false),
        }
        connections.insert(id, Arc::new(connection));
        info!(connection_id = id, "connection reset");
        Ok(true)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{InboundCall, OutboundCall, Transport};
    use futures::future::BoxFuture;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tonic::Status;

    #[derive(Debug)]
    struct NullTransport {
        generation: usize,
    }

    impl Transport for NullTransport {
        fn start(&self, _call: OutboundCall) -> BoxFuture<'static, Result<InboundCall, Status>> {
            Box::pin(async { Err(Status::unimplemented("null transport")) })
        }
    }

    #[derive(Default)]
    struct CountingConnector {
        connects: AtomicUsize,
        /// Connect number that waits on the barrier twice: once on entry
        /// and once before returning.
        pause: Option<(usize, Barrier)>,
    }

    impl Connector for CountingConnector {
        type Transport = NullTransport;

        fn connect(&self, _settings: &Settings) -> Result<NullTransport, BridgeError> {
            let generation = self.connects.fetch_add(1, Ordering::Relaxed);
            if let Some((paused, barrier)) = &self.pause {
                if *paused == generation {
                    barrier.wait();
                    barrier.wait();
                }
            }
            Ok(NullTransport { generation })
        }
    }

    fn registry() -> ConnectionRegistry<CountingConnector> {
        ConnectionRegistry::new(CountingConnector::default())
    }

    #[test]
    fn test_configure_and_get() {
        let registry = registry();
        registry
            .configure(1, &ConnectionConfig::new("localhost:50051").insecure(true))
            .unwrap();

        let connection = registry.get(1).unwrap();
        assert_eq!(connection.id(), 1);
        assert_eq!(connection.settings().host(), "localhost:50051");
        assert!(connection.settings().insecure());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_get_unknown() {
        let registry = registry();
        assert!(matches!(
            registry.get(9),
            Err(BridgeError::ConnectionNotFound(9))
        ));
    }

    #[test]
    fn test_configure_without_host() {
        let registry = registry();
        let err = registry.configure(2, &ConnectionConfig::default()).unwrap_err();

        assert!(matches!(err, BridgeError::Configuration(_)));
        assert!(!registry.contains(2));
        assert_eq!(registry.connector.connects.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_failed_reconfigure_removes_previous() {
        let registry = registry();
        registry.configure(1, &ConnectionConfig::new("localhost")).unwrap();

        assert!(registry.configure(1, &ConnectionConfig::default()).is_err());
        assert!(!registry.contains(1));
    }

    #[test]
    fn test_configure_replaces() {
        let registry = registry();
        registry.configure(1, &ConnectionConfig::new("first")).unwrap();
        let old = registry.get(1).unwrap();

        registry.configure(1, &ConnectionConfig::new("second")).unwrap();
        let new = registry.get(1).unwrap();

        assert_eq!(new.settings().host(), "second");
        assert_eq!(registry.len(), 1);
        // the old handle stays usable for calls that still hold it
        assert_eq!(old.settings().host(), "first");
    }

    #[test]
    fn test_destroy_idempotent() {
        let registry = registry();
        registry.destroy(1);

        registry.configure(1, &ConnectionConfig::new("localhost")).unwrap();
        registry.destroy(1);
        registry.destroy(1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_settings() {
        let registry = registry();
        assert!(registry.settings(1).is_none());

        registry
            .configure(
                1,
                &ConnectionConfig {
                    response_size_limit: Some(512),
                    ..ConnectionConfig::new("localhost")
                },
            )
            .unwrap();
        assert_eq!(registry.settings(1).unwrap().response_size_limit(), Some(512));
    }

    #[test]
    fn test_reset() {
        let registry = registry();
        assert!(!registry.reset(1).unwrap());

        registry.configure(1, &ConnectionConfig::new("localhost")).unwrap();
        assert_eq!(registry.get(1).unwrap().transport().generation, 0);

        assert!(registry.reset(1).unwrap());
        let connection = registry.get(1).unwrap();
        assert_eq!(connection.transport().generation, 1);
        assert_eq!(connection.settings().host(), "localhost");
    }

    #[test]
    fn test_reset_keeps_concurrent_configure() {
        let registry = ConnectionRegistry::new(CountingConnector {
            pause: Some((1, Barrier::new(2))),
            ..Default::default()
        });
        registry.configure(1, &ConnectionConfig::new("first")).unwrap();

        std::thread::scope(|scope| {
            let reset = scope.spawn(|| registry.reset(1));

            let (_, barrier) = registry.connector.pause.as_ref().unwrap();
            // reset is inside connect
            barrier.wait();
            registry.configure(1, &ConnectionConfig::new("second")).unwrap();
            barrier.wait();

            assert!(!reset.join().unwrap().unwrap());
        });

        let connection = registry.get(1).unwrap();
        assert_eq!(connection.settings().host(), "second");
        assert_eq!(connection.transport().generation, 2);
    }

    #[test]
    fn test_reset_after_destroy() {
        let registry = ConnectionRegistry::new(CountingConnector {
            pause: Some((1, Barrier::new(2))),
            ..Default::default()
        });
        registry.configure(1, &ConnectionConfig::new("first")).unwrap();

        std::thread::scope(|scope| {
            let reset = scope.spawn(|| registry.reset(1));

            let (_, barrier) = registry.connector.pause.as_ref().unwrap();
            barrier.wait();
            registry.destroy(1);
            barrier.wait();

            assert!(!reset.join().unwrap().unwrap());
        });

        assert!(!registry.contains(1));
    }
}
