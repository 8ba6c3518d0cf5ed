//! Duplicate request cache.
//!
//! Fingerprints map to in-flight or completed entries. A retransmitted call
//! whose original is still executing queues behind it; one whose original
//! completed is answered from the cached reply without reaching the handler.

pub mod key;
pub mod policy;
pub mod table;
pub mod tcp;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::Limits;
use crate::{Effect, Transience};

pub use key::{DrcScope, Fingerprint, RequestIdentity, payload_checksum};
pub use policy::cacheable;
pub use table::{Drc, DupWaiter, ExecuteToken, Resume, StartOutcome, TrackedEntry};
pub use tcp::{DrcRegistry, DrcSettings};

/// What to do when an entry cannot be allocated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocFailurePolicy {
    /// Execute the request without duplicate protection.
    #[default]
    FailOpen,
    /// Answer with a system error.
    FailClosed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrcParams {
    pub npart: usize,
    /// Retirement always runs above this size.
    pub maxsize: usize,
    /// Retirement runs above this size once the retire window closes.
    pub hiwat: usize,
    /// Live entries (in flight plus completed) beyond which allocation fails.
    pub hard_cap: usize,
    pub checksum: bool,
    /// Completed entries older than this are not replayed.
    pub max_age: Option<Duration>,
    pub on_alloc_failure: AllocFailurePolicy,
    pub max_dup_waiters: usize,
    pub retire_window_start_bias: u32,
    pub max_retire_per_finish: usize,
    pub checksum_prefix_bytes: usize,
}

impl DrcParams {
    pub fn tcp_default() -> Self {
        Self::with_limits(1, 1024, 64, true, None, &Limits::default())
    }

    pub fn udp_default() -> Self {
        Self::with_limits(
            7,
            32768,
            16384,
            true,
            Some(Duration::from_secs(600)),
            &Limits::default(),
        )
    }

    pub fn with_limits(
        npart: usize,
        maxsize: usize,
        hiwat: usize,
        checksum: bool,
        max_age: Option<Duration>,
        limits: &Limits,
    ) -> Self {
        Self {
            npart: npart.max(1),
            maxsize,
            hiwat: hiwat.min(maxsize),
            hard_cap: maxsize.saturating_mul(2).max(1),
            checksum,
            max_age,
            on_alloc_failure: AllocFailurePolicy::default(),
            max_dup_waiters: limits.max_dup_waiters,
            retire_window_start_bias: limits.retire_window_start_bias,
            max_retire_per_finish: limits.max_retire_per_finish.max(1),
            checksum_prefix_bytes: limits.checksum_prefix_bytes,
        }
    }

    pub fn with_hard_cap(mut self, hard_cap: usize) -> Self {
        self.hard_cap = hard_cap.max(1);
        self
    }

    /// Payload checksums on regardless of configuration.
    pub fn checksummed(mut self) -> Self {
        self.checksum = true;
        self
    }

    pub fn with_alloc_failure(mut self, policy: AllocFailurePolicy) -> Self {
        self.on_alloc_failure = policy;
        self
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DrcError {
    #[error("{drc} duplicate request cache full ({size} live entries)")]
    CacheFull { drc: &'static str, size: usize },
}

impl DrcError {
    pub fn transience(&self) -> Transience {
        match self {
            DrcError::CacheFull { .. } => Transience::Retryable,
        }
    }

    pub fn effect(&self) -> Effect {
        Effect::None
    }
}
