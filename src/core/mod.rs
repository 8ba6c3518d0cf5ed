//! Core domain types shared by every subsystem.
//!
//! Module hierarchy follows type dependency order:
//! - time: Clock, WallClock (Layer 0)
//! - identity: NodeId, ConnectionId, ClientOwner, ClientId, FileHandle (Layer 1)
//! - limits: normative bounds (Layer 2)

pub mod error;
pub mod identity;
pub mod limits;
pub mod time;

pub use error::{CoreError, InvalidId};
pub use identity::{
    ClientId, ClientOwner, ConnectionId, FileHandle, MAX_FILE_HANDLE_BYTES, MAX_OWNER_BYTES,
    NodeId, Verifier,
};
pub use limits::{Limits, LimitsOverride};
pub use time::{Clock, ManualClock, SharedClock, SystemClock, WallClock, system_clock};
