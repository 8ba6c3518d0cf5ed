//! Server-wide grace period.
//!
//! ```text
//! Normal --start_grace--> Entering --set_enforcing--> Enforcing --lift--> Lifting --> Normal
//! ```
//!
//! While `Entering`, non-reclaim state changes wait up to `entering_wait` for
//! the phase to settle and are then rejected. While `Enforcing` they are
//! rejected at once. The transition out of `Lifting` happens exactly once per
//! grace period: only the caller that moved the phase from `Enforcing` to
//! `Lifting` asks the backend to lift.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Condvar, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::GraceError;
use crate::core::{ClientOwner, FileHandle, SharedClock};
use crate::daemon::metrics;
use crate::daemon::recovery::{GraceHint, SharedRecovery};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GracePhase {
    Normal,
    Entering,
    Enforcing,
    Lifting,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GraceParams {
    /// Longest a grace period runs before lifting without every reclaim.
    pub grace_period: Duration,
    /// How long non-reclaim requests wait while grace is being entered.
    pub entering_wait: Duration,
    /// Skip grace entirely.
    pub graceless: bool,
}

impl Default for GraceParams {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(90),
            entering_wait: Duration::from_secs(1),
            graceless: false,
        }
    }
}

/// What the interpreter says about a request before it runs.
#[derive(Clone, Copy, Debug)]
pub struct Admission<'a> {
    pub mutates_state: bool,
    pub reclaim: bool,
    pub owner: Option<&'a ClientOwner>,
}

impl<'a> Admission<'a> {
    pub fn read_only() -> Self {
        Self {
            mutates_state: false,
            reclaim: false,
            owner: None,
        }
    }

    pub fn mutating() -> Self {
        Self {
            mutates_state: true,
            reclaim: false,
            owner: None,
        }
    }

    pub fn reclaim(owner: Option<&'a ClientOwner>) -> Self {
        Self {
            mutates_state: true,
            reclaim: true,
            owner,
        }
    }
}

#[derive(Debug)]
struct GraceInner {
    phase: GracePhase,
    started: Option<Instant>,
    deadline: Option<Instant>,
    expected: BTreeSet<ClientOwner>,
    reclaimed: BTreeSet<ClientOwner>,
    revoked: HashMap<ClientOwner, BTreeSet<FileHandle>>,
}

impl GraceInner {
    fn all_reclaimed(&self) -> bool {
        self.expected.iter().all(|owner| self.reclaimed.contains(owner))
    }
}

pub struct GraceManager {
    inner: Mutex<GraceInner>,
    changed: Condvar,
    params: RwLock<GraceParams>,
    backend: SharedRecovery,
    clock: SharedClock,
}

impl GraceManager {
    pub fn new(backend: SharedRecovery, clock: SharedClock, params: GraceParams) -> Self {
        Self {
            inner: Mutex::new(GraceInner {
                phase: GracePhase::Normal,
                started: None,
                deadline: None,
                expected: BTreeSet::new(),
                reclaimed: BTreeSet::new(),
                revoked: HashMap::new(),
            }),
            changed: Condvar::new(),
            params: RwLock::new(params),
            backend,
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GraceInner> {
        self.inner.lock().expect("grace lock poisoned")
    }

    fn params(&self) -> GraceParams {
        *self.params.read().expect("grace params lock poisoned")
    }

    pub fn set_params(&self, params: GraceParams) {
        *self.params.write().expect("grace params lock poisoned") = params;
    }

    pub fn backend(&self) -> &SharedRecovery {
        &self.backend
    }

    pub fn phase(&self) -> GracePhase {
        self.lock().phase
    }

    pub fn in_grace(&self) -> bool {
        self.phase() != GracePhase::Normal
    }

    /// Owners allowed to reclaim in the current grace period.
    pub fn expected(&self) -> Vec<ClientOwner> {
        self.lock().expected.iter().cloned().collect()
    }

    pub fn is_reclaim_candidate(&self, owner: &ClientOwner) -> bool {
        self.lock().expected.contains(owner)
    }

    /// True if `handle` was revoked from `owner` before the restart; such a
    /// handle may not be reclaimed.
    pub fn was_revoked(&self, owner: &ClientOwner, handle: &FileHandle) -> bool {
        self.lock()
            .revoked
            .get(owner)
            .is_some_and(|handles| handles.contains(handle))
    }

    /// Enter grace. Returns false if grace is disabled or already running.
    pub fn start_grace(&self, hint: Option<GraceHint>) -> Result<bool, GraceError> {
        let params = self.params();
        if params.graceless {
            tracing::info!("graceless mode; not entering grace");
            return Ok(false);
        }
        {
            let mut inner = self.lock();
            if inner.phase != GracePhase::Normal {
                tracing::debug!(phase = ?inner.phase, "grace already in progress");
                return Ok(false);
            }
            inner.phase = GracePhase::Entering;
            inner.started = Some(self.clock.now());
            inner.expected.clear();
            inner.reclaimed.clear();
            inner.revoked.clear();
        }

        if let Err(err) = self.enter(hint.as_ref()) {
            let mut inner = self.lock();
            inner.phase = GracePhase::Normal;
            inner.started = None;
            self.changed.notify_all();
            return Err(err);
        }
        metrics::grace_entered();
        self.lift_if_done()?;
        Ok(true)
    }

    fn enter(&self, hint: Option<&GraceHint>) -> Result<(), GraceError> {
        self.backend.begin_grace(hint)?;
        let mut expected = BTreeSet::new();
        let mut revoked: HashMap<ClientOwner, BTreeSet<FileHandle>> = HashMap::new();
        self.backend.enumerate_reclaim_candidates(&mut |candidate| {
            if !candidate.revoked.is_empty() {
                revoked
                    .entry(candidate.owner.clone())
                    .or_default()
                    .extend(candidate.revoked);
            }
            expected.insert(candidate.owner);
        })?;
        {
            let mut inner = self.lock();
            inner.expected = expected;
            inner.revoked = revoked;
        }
        self.backend.set_enforcing()?;

        let mut inner = self.lock();
        inner.phase = GracePhase::Enforcing;
        inner.deadline = Some(self.clock.now() + self.params().grace_period);
        tracing::info!(
            backend = self.backend.name(),
            candidates = inner.expected.len(),
            "grace period enforcing"
        );
        self.changed.notify_all();
        Ok(())
    }

    /// Gate a request on the grace phase.
    pub fn admit(&self, request: Admission<'_>) -> Result<(), GraceError> {
        if !request.mutates_state {
            return Ok(());
        }
        let mut inner = self.lock();
        if request.reclaim {
            if inner.phase == GracePhase::Normal {
                return Err(GraceError::NoGrace);
            }
            if let Some(owner) = request.owner
                && inner.phase != GracePhase::Entering
                && !inner.expected.contains(owner)
            {
                return Err(GraceError::ReclaimBad {
                    owner: owner.clone(),
                });
            }
            return Ok(());
        }

        if inner.phase == GracePhase::Entering {
            let wait = self.params().entering_wait;
            let (guard, _) = self
                .changed
                .wait_timeout_while(inner, wait, |inner| inner.phase == GracePhase::Entering)
                .expect("grace lock poisoned");
            inner = guard;
        }
        match inner.phase {
            GracePhase::Normal => Ok(()),
            GracePhase::Entering | GracePhase::Enforcing | GracePhase::Lifting => {
                metrics::grace_rejected();
                Err(GraceError::InGrace)
            }
        }
    }

    /// Note that `owner` finished reclaiming. Returns true if this lifted grace.
    pub fn reclaim_complete(&self, owner: &ClientOwner) -> Result<bool, GraceError> {
        {
            let mut inner = self.lock();
            if inner.phase == GracePhase::Normal {
                return Err(GraceError::NoGrace);
            }
            inner.reclaimed.insert(owner.clone());
            tracing::debug!(
                client = %owner,
                reclaimed = inner.reclaimed.len(),
                expected = inner.expected.len(),
                "reclaim complete"
            );
        }
        self.lift_if_done()
    }

    /// Periodic check: lift an expired or finished grace period, or join one a
    /// peer requested.
    pub fn tick(&self) -> Result<bool, GraceError> {
        match self.phase() {
            GracePhase::Normal => {
                if self.backend.maybe_start_grace()? {
                    tracing::info!("peer requested grace");
                    return self.start_grace(None);
                }
                Ok(false)
            }
            GracePhase::Enforcing => self.lift_if_done(),
            GracePhase::Entering | GracePhase::Lifting => Ok(false),
        }
    }

    fn lift_if_done(&self) -> Result<bool, GraceError> {
        let due = {
            let inner = self.lock();
            inner.phase == GracePhase::Enforcing
                && (inner.all_reclaimed()
                    || inner.deadline.is_some_and(|deadline| self.clock.now() >= deadline))
        };
        if !due {
            return Ok(false);
        }
        self.try_lift()
    }

    /// Leave grace if the backend agrees. Returns true for the single caller
    /// that completed the lift.
    pub fn try_lift(&self) -> Result<bool, GraceError> {
        {
            let mut inner = self.lock();
            if inner.phase != GracePhase::Enforcing {
                return Ok(false);
            }
            inner.phase = GracePhase::Lifting;
        }

        let lifted = match self.backend.try_lift_grace() {
            Ok(true) => self.backend.end_grace().map(|()| true),
            other => other,
        };
        let mut inner = self.lock();
        match lifted {
            Ok(true) => {
                let elapsed = inner
                    .started
                    .map(|started| self.clock.now().saturating_duration_since(started))
                    .unwrap_or_default();
                inner.phase = GracePhase::Normal;
                inner.started = None;
                inner.deadline = None;
                inner.expected.clear();
                inner.reclaimed.clear();
                inner.revoked.clear();
                self.changed.notify_all();
                metrics::grace_lifted(elapsed);
                tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "grace period lifted");
                Ok(true)
            }
            Ok(false) => {
                inner.phase = GracePhase::Enforcing;
                tracing::debug!("grace lift deferred by recovery backend");
                Ok(false)
            }
            Err(err) => {
                inner.phase = GracePhase::Enforcing;
                Err(err.into())
            }
        }
    }
}
