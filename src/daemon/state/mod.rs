//! Client lease state and the grace period.

pub mod client;
pub mod grace;
pub mod lease;
pub mod reaper;

use thiserror::Error;

use crate::core::{ClientId, ClientOwner};
use crate::daemon::recovery::RecoveryError;
use crate::{Effect, Transience};

pub use client::{ClientLease, ClientRecord, ClientState, ClientTable, NoState, ReapReport, StateRelease};
pub use grace::{Admission, GraceManager, GraceParams, GracePhase};
pub use lease::Lease;
pub use reaper::Reaper;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LeaseError {
    #[error("client id {id} not found")]
    NotFound { id: ClientId },
    #[error("client id {id} has expired")]
    Expired { id: ClientId },
    #[error("client id {id} was replaced by a newer confirmation")]
    Stale { id: ClientId },
    #[error("client id {id} is in use by {reservations} operations")]
    Busy { id: ClientId, reservations: u32 },
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
}

impl LeaseError {
    pub fn transience(&self) -> Transience {
        match self {
            // A racing confirm may still establish the id.
            LeaseError::NotFound { .. } | LeaseError::Busy { .. } => Transience::Retryable,
            LeaseError::Expired { .. } | LeaseError::Stale { .. } => Transience::Permanent,
            LeaseError::Recovery(err) => err.transience(),
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            LeaseError::Recovery(err) => err.effect(),
            _ => Effect::None,
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GraceError {
    #[error("server is in its grace period; retry later")]
    InGrace,
    #[error("reclaim outside a grace period")]
    NoGrace,
    #[error("client {owner} has nothing to reclaim")]
    ReclaimBad { owner: ClientOwner },
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
}

impl GraceError {
    pub fn transience(&self) -> Transience {
        match self {
            GraceError::InGrace => Transience::Retryable,
            GraceError::NoGrace | GraceError::ReclaimBad { .. } => Transience::Permanent,
            GraceError::Recovery(err) => err.transience(),
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            GraceError::Recovery(err) => err.effect(),
            _ => Effect::None,
        }
    }
}
