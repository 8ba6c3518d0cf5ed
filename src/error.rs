use thiserror::Error;

use crate::config::ConfigError;
use crate::core::CoreError;
use crate::daemon::drc::DrcError;
use crate::daemon::fridge::FridgeError;
use crate::daemon::proto::ProtocolError;
use crate::daemon::recovery::RecoveryError;
use crate::daemon::state::{GraceError, LeaseError};
use crate::daemon::transport::TransportError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// What we know about side effects when an error is returned.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Effect {
    /// Definitely no side effects occurred.
    None,
    /// Side effects definitely occurred (locally or remotely).
    Some,
    /// We don't know if side effects occurred.
    Unknown,
}

impl Effect {
    pub fn as_str(self) -> &'static str {
        match self {
            Effect::None => "none",
            Effect::Some => "some",
            Effect::Unknown => "unknown",
        }
    }
}

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over canonical capability errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Drc(#[from] DrcError),

    #[error(transparent)]
    Fridge(#[from] FridgeError),

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error(transparent)]
    Grace(#[from] GraceError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error("failed to spawn {what} thread: {source}")]
    Spawn {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Core(e) => e.transience(),
            Error::Config(e) => e.transience(),
            Error::Drc(e) => e.transience(),
            Error::Fridge(e) => e.transience(),
            Error::Lease(e) => e.transience(),
            Error::Grace(e) => e.transience(),
            Error::Transport(e) => e.transience(),
            Error::Protocol(e) => e.transience(),
            Error::Recovery(e) => e.transience(),
            Error::Spawn { .. } => Transience::Retryable,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            Error::Core(e) => e.effect(),
            Error::Config(e) => e.effect(),
            Error::Drc(e) => e.effect(),
            Error::Fridge(e) => e.effect(),
            Error::Lease(e) => e.effect(),
            Error::Grace(e) => e.effect(),
            Error::Transport(e) => e.effect(),
            Error::Protocol(e) => e.effect(),
            Error::Recovery(e) => e.effect(),
            Error::Spawn { .. } => Effect::None,
        }
    }

    pub(crate) fn spawn(what: &'static str, source: std::io::Error) -> Self {
        Error::Spawn { what, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::core::NodeId;

    #[test]
    fn classification_follows_the_wrapped_error() {
        let err = Error::from(GraceError::InGrace);
        assert!(err.transience().is_retryable());
        assert_eq!(err.effect(), Effect::None);

        let err = Error::from(RecoveryError::NotMember {
            node: NodeId::numbered(3),
        });
        assert_eq!(err.transience(), Transience::Permanent);
        assert!(err.to_string().contains("not a member"));
    }
}
