//! Callback-style gRPC bridge.
//!
//! Exposes unary, server-streaming and client-streaming calls (bidirectional
//! streaming being a client-streaming call read while it is still sending) to
//! a host application as synchronous, non-blocking operations on integer
//! handles. Results come back as ordered [`CallEvent`]s per call, delivered to
//! an [`EventSink`]. Calls are multiplexed over a few long-lived channels.
//!
//! ```no_run
//! use bytes::Bytes;
//! use grpc_bridge::{Bridge, CallEvent, ConnectionConfig, Metadata};
//!
//! let (tx, rx) = crossbeam_channel::unbounded::<CallEvent>();
//! let bridge = Bridge::new(tx)?;
//!
//! bridge.configure_connection(1, &ConnectionConfig::new("localhost:50051").insecure(true))?;
//! bridge.start_unary(42, 1, "/pkg.Svc/Method", Bytes::from_static(&[1, 2]), &Metadata::new())?;
//!
//! for event in rx {
//!     let done = event.is_terminal();
//!     println!("{}", serde_json::to_string(&event)?);
//!     if done {
//!         break;
//!     }
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod bridge;
pub mod call;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod logging;
pub mod metadata;
pub mod registry;
pub mod settings;
pub mod status;
pub mod transport;

pub use bridge::Bridge;
pub use call::{CallState, MethodType};
pub use config::Config;
pub use error::BridgeError;
pub use event::{CallEvent, EventSink};
pub use metadata::Metadata;
pub use settings::{ConnectionConfig, Settings};
pub use transport::{Connector, TonicConnector, Transport};

/// Host-assigned connection identifier.
pub type ConnectionId = i64;

/// Host-assigned call identifier.
pub type CallId = i64;
