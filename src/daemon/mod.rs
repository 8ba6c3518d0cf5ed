//! Daemon module - the request dispatch core.
//!
//! Provides:
//! - Transport channels (TCP, UDP, RDMA loopback) and 9P framing
//! - Duplicate request cache and retransmission handling
//! - 9P flush ordering
//! - Client leases and the grace period, backed by recovery stores
//! - The "fridge" worker pool
//! - Listener, reader and dispatch threads

pub mod connection;
pub mod dispatch;
pub mod drc;
pub mod flush;
pub mod fridge;
pub mod interp;
pub mod metrics;
pub mod proto;
pub mod recovery;
pub mod run;
pub mod server;
pub mod state;
pub mod transport;

pub use connection::{Connection, InflightGuard};
pub use dispatch::Dispatcher;
pub use drc::{AllocFailurePolicy, Drc, DrcError, DrcParams, DrcRegistry, DrcSettings};
pub use flush::{FlushHook, FlushOutcome, FlushRegistry};
pub use fridge::{Deferment, Fridge, FridgeCommand, FridgeError, FridgeParams, FridgeState};
pub use interp::{OpContext, OpHandler, OpOutcome, OpTable, Program};
pub use recovery::{RecoveryBackend, RecoveryError, RecoveryKind, SharedRecovery, open_backend};
pub use run::{Runtime, default_ops, run_server};
pub use server::Server;
pub use state::{ClientTable, GraceError, GraceManager, GracePhase, LeaseError};
pub use transport::{Channel, TransportError, TransportKind};
