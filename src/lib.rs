//! DICOM networking core
//!
//! Association handling, a per-peer connection pool, the C-ECHO, C-FIND,
//! C-MOVE and C-STORE service users, and an inbound storage listener. The
//! wire protocol lives in the `dimse` crate; this crate decides what to send,
//! when, and how outcomes are reported.

pub mod association;
pub mod config;
pub mod directory;
pub mod events;
pub mod listener;
pub mod logging;
pub mod models;
pub mod pool;
pub mod services;
pub mod storage;
pub mod tasks;

#[cfg(test)]
mod test_support;

pub use association::{AssociationHandle, ConnectionState};
pub use config::{Config, ConfigError};
pub use directory::PeerDirectory;
pub use events::{EventBus, EventKind, EventSink, NetworkEvent, TracingSink};
pub use listener::StorageListener;
pub use models::{
    LocalIdentity, OperationOutcome, OperationStatus, Peer, QueryFilter, RemoteSeriesInfo,
    RemoteStudyInfo,
};
pub use pool::{ConnectionPool, PoolConfig, PoolStats};
pub use services::{EchoService, QueryService, RetrieveService, StoreReport, StoreService};
pub use tasks::{Cancellable, OperationRunner, OperationTask};
