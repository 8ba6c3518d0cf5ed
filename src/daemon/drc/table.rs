//! Partitioned duplicate request table.
//!
//! Lock order: a partition lock and the completed-FIFO lock are never held at
//! the same time. Retirement pops victims from the FIFO, releases it, then
//! visits each victim's partition.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};

use super::key::{DrcScope, Fingerprint, RequestIdentity};
use super::{AllocFailurePolicy, DrcError, DrcParams};
use crate::core::{ConnectionId, SharedClock};
use crate::daemon::metrics;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct EntryHandle {
    partition: u32,
    slot: u32,
    generation: u32,
}

enum EntryState {
    InFlight {
        waiters: Vec<Sender<Resume>>,
    },
    Complete {
        status: u32,
        reply: Bytes,
        completed_at: Instant,
    },
}

struct Entry {
    fingerprint: Fingerprint,
    state: EntryState,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

#[derive(Default)]
struct Partition {
    index: HashMap<Fingerprint, u32>,
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl Partition {
    fn insert(&mut self, entry: Entry) -> (u32, u32) {
        let fingerprint = entry.fingerprint.clone();
        let slot = match self.free.pop() {
            Some(slot) => {
                let cell = &mut self.slots[slot as usize];
                cell.entry = Some(entry);
                slot
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                (self.slots.len() - 1) as u32
            }
        };
        self.index.insert(fingerprint, slot);
        (slot, self.slots[slot as usize].generation)
    }

    fn get_mut(&mut self, slot: u32, generation: u32) -> Option<&mut Entry> {
        let cell = self.slots.get_mut(slot as usize)?;
        if cell.generation != generation {
            return None;
        }
        cell.entry.as_mut()
    }

    fn remove(&mut self, slot: u32, generation: u32) -> Option<Entry> {
        let cell = self.slots.get_mut(slot as usize)?;
        if cell.generation != generation {
            return None;
        }
        let entry = cell.entry.take()?;
        cell.generation = cell.generation.wrapping_add(1);
        self.free.push(slot);
        self.index.remove(&entry.fingerprint);
        Some(entry)
    }

    fn live(&self) -> usize {
        self.index.len()
    }
}

#[derive(Default)]
struct Completed {
    fifo: VecDeque<(EntryHandle, Instant)>,
    retwnd: u32,
}

/// How a queued duplicate is resumed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resume {
    /// The original finished; send this reply.
    Replay { status: u32, reply: Bytes },
    /// The original was abandoned; call `start` again.
    Retry,
}

pub struct DupWaiter {
    rx: Receiver<Resume>,
}

impl DupWaiter {
    /// `None` on timeout. A dropped table resumes waiters with `Retry`.
    pub fn wait(&self, timeout: Duration) -> Option<Resume> {
        match self.rx.recv_timeout(timeout) {
            Ok(resume) => Some(resume),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Resume::Retry),
        }
    }
}

/// Proof that the caller owns execution of a fingerprint.
#[derive(Debug)]
pub struct ExecuteToken {
    handle: Option<EntryHandle>,
    fingerprint: Fingerprint,
}

impl ExecuteToken {
    /// False when the table could not allocate and failed open.
    pub fn is_tracked(&self) -> bool {
        self.handle.is_some()
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub(crate) fn untracked(fingerprint: Fingerprint) -> Self {
        Self {
            handle: None,
            fingerprint,
        }
    }
}

/// An execution token bound to its table. Dropping it unfinished abandons
/// the entry, so a call lost with its queued job resumes duplicates with
/// [`Resume::Retry`].
pub struct TrackedEntry {
    drc: Arc<Drc>,
    token: Option<ExecuteToken>,
}

impl TrackedEntry {
    pub fn new(drc: Arc<Drc>, token: ExecuteToken) -> Self {
        Self {
            drc,
            token: Some(token),
        }
    }

    pub fn drc(&self) -> &Arc<Drc> {
        &self.drc
    }

    /// Cache `reply` and resume queued duplicates with it.
    pub fn finish(mut self, status: u32, reply: Bytes) {
        if let Some(token) = self.token.take() {
            self.drc.finish(token, status, reply);
        }
    }

    pub fn abandon(mut self) {
        if let Some(token) = self.token.take() {
            self.drc.abandon(token);
        }
    }
}

impl Drop for TrackedEntry {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.drc.abandon(token);
        }
    }
}

impl std::fmt::Debug for TrackedEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedEntry")
            .field("drc", &self.drc.label())
            .field("token", &self.token)
            .finish()
    }
}

pub enum StartOutcome {
    Execute(ExecuteToken),
    /// The original is running. `None` means the waiter queue was full and
    /// this duplicate is dropped.
    AlreadyInProgress(Option<DupWaiter>),
    ReplayCompleted { status: u32, reply: Bytes },
}

impl std::fmt::Debug for StartOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartOutcome::Execute(token) => f.debug_tuple("Execute").field(token).finish(),
            StartOutcome::AlreadyInProgress(waiter) => f
                .debug_tuple("AlreadyInProgress")
                .field(&waiter.is_some())
                .finish(),
            StartOutcome::ReplayCompleted { status, reply } => f
                .debug_struct("ReplayCompleted")
                .field("status", status)
                .field("reply_len", &reply.len())
                .finish(),
        }
    }
}

enum Lookup {
    Hit(StartOutcome),
    Stale(EntryHandle),
    Miss,
}

pub struct Drc {
    label: &'static str,
    scope: DrcScope,
    origin: ConnectionId,
    params: RwLock<DrcParams>,
    partitions: Vec<Mutex<Partition>>,
    completed: Mutex<Completed>,
    size: AtomicUsize,
    clock: SharedClock,
}

impl Drc {
    /// `origin` is the connection id folded into connection-scoped
    /// fingerprints; a recycled table keeps the id it was created with.
    pub fn new(
        label: &'static str,
        scope: DrcScope,
        origin: ConnectionId,
        params: DrcParams,
        clock: SharedClock,
    ) -> Self {
        let npart = params.npart.max(1);
        Self {
            label,
            scope,
            origin,
            params: RwLock::new(params),
            partitions: (0..npart).map(|_| Mutex::new(Partition::default())).collect(),
            completed: Mutex::new(Completed::default()),
            size: AtomicUsize::new(0),
            clock,
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn scope(&self) -> DrcScope {
        self.scope
    }

    pub fn origin(&self) -> ConnectionId {
        self.origin
    }

    pub fn params(&self) -> DrcParams {
        *self.params.read().expect("drc params lock poisoned")
    }

    /// Apply reloaded tunables. The partition count is fixed at creation.
    pub fn retune(&self, mut params: DrcParams) {
        params.npart = self.partitions.len();
        *self.params.write().expect("drc params lock poisoned") = params;
    }

    /// Live entries, in flight and completed.
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn completed_len(&self) -> usize {
        self.completed.lock().expect("drc fifo lock poisoned").fifo.len()
    }

    pub fn retire_window(&self) -> u32 {
        self.completed.lock().expect("drc fifo lock poisoned").retwnd
    }

    pub fn fingerprint(&self, peer: SocketAddr, id: RequestIdentity, args: &[u8]) -> Fingerprint {
        let params = self.params();
        Fingerprint::build(
            self.scope,
            self.origin,
            peer,
            id,
            args,
            params.checksum,
            params.checksum_prefix_bytes,
        )
    }

    pub fn start(&self, fingerprint: Fingerprint) -> Result<StartOutcome, DrcError> {
        let params = self.params();
        if self.len() >= params.hard_cap {
            self.retire_oldest(params.max_retire_per_finish, None);
        }
        let now = self.clock.now();
        let index = self.partition_of(&fingerprint);
        let (outcome, duplicate) = {
            let mut part = self.partitions[index]
                .lock()
                .expect("drc partition lock poisoned");
            let mut found = lookup(&mut part, index, &fingerprint, now, &params);
            if let Lookup::Stale(handle) = found {
                if part.remove(handle.slot, handle.generation).is_some() {
                    self.size.fetch_sub(1, Ordering::AcqRel);
                }
                found = Lookup::Miss;
            }
            match found {
                Lookup::Hit(outcome) => (Ok(outcome), true),
                Lookup::Stale(_) | Lookup::Miss => {
                    (self.insert_locked(&mut part, index, fingerprint, &params), false)
                }
            }
        };
        if duplicate {
            self.note_duplicate(&params);
        }
        match &outcome {
            Ok(StartOutcome::Execute(_)) => metrics::drc_miss(self.label),
            Ok(StartOutcome::ReplayCompleted { .. }) => metrics::drc_replay(self.label),
            Ok(StartOutcome::AlreadyInProgress(Some(_))) => metrics::drc_in_progress(self.label),
            Ok(StartOutcome::AlreadyInProgress(None)) => metrics::drc_dup_dropped(self.label),
            Err(_) => {}
        }
        outcome
    }

    fn insert_locked(
        &self,
        part: &mut Partition,
        index: usize,
        fingerprint: Fingerprint,
        params: &DrcParams,
    ) -> Result<StartOutcome, DrcError> {
        let prior = self.size.fetch_add(1, Ordering::AcqRel);
        if prior >= params.hard_cap {
            self.size.fetch_sub(1, Ordering::AcqRel);
            metrics::drc_insert_failed(self.label);
            return match params.on_alloc_failure {
                AllocFailurePolicy::FailOpen => {
                    tracing::error!(
                        drc = self.label,
                        xid = fingerprint.xid(),
                        size = prior,
                        "duplicate request cache full; executing untracked"
                    );
                    Ok(StartOutcome::Execute(ExecuteToken::untracked(fingerprint)))
                }
                AllocFailurePolicy::FailClosed => {
                    tracing::error!(
                        drc = self.label,
                        xid = fingerprint.xid(),
                        size = prior,
                        "duplicate request cache full; rejecting"
                    );
                    Err(DrcError::CacheFull {
                        drc: self.label,
                        size: prior,
                    })
                }
            };
        }
        let (slot, generation) = part.insert(Entry {
            fingerprint: fingerprint.clone(),
            state: EntryState::InFlight {
                waiters: Vec::new(),
            },
        });
        Ok(StartOutcome::Execute(ExecuteToken {
            handle: Some(EntryHandle {
                partition: index as u32,
                slot,
                generation,
            }),
            fingerprint,
        }))
    }

    /// Record the reply after it was sent, wake queued duplicates and retire.
    pub fn finish(&self, token: ExecuteToken, status: u32, reply: Bytes) {
        let Some(handle) = token.handle else {
            return;
        };
        let now = self.clock.now();
        let waiters = {
            let mut part = self.partitions[handle.partition as usize]
                .lock()
                .expect("drc partition lock poisoned");
            let Some(entry) = part.get_mut(handle.slot, handle.generation) else {
                return;
            };
            let previous = std::mem::replace(
                &mut entry.state,
                EntryState::Complete {
                    status,
                    reply: reply.clone(),
                    completed_at: now,
                },
            );
            match previous {
                EntryState::InFlight { waiters } => waiters,
                EntryState::Complete { .. } => Vec::new(),
            }
        };
        for waiter in waiters {
            let _ = waiter.send(Resume::Replay {
                status,
                reply: reply.clone(),
            });
        }

        let params = self.params();
        let victims = {
            let mut completed = self.completed.lock().expect("drc fifo lock poisoned");
            completed.fifo.push_back((handle, now));
            completed.retwnd = completed.retwnd.saturating_sub(1);
            let size = self.len();
            let threshold = if size > params.maxsize {
                Some(params.maxsize)
            } else if completed.retwnd == 0 && size > params.hiwat {
                Some(params.hiwat)
            } else {
                None
            };
            match threshold {
                Some(threshold) => {
                    let count = (size - threshold).min(params.max_retire_per_finish);
                    pop_front(&mut completed.fifo, count)
                }
                None => Vec::new(),
            }
        };
        self.remove_victims(victims);
        metrics::set_drc_size(self.label, self.len());
    }

    /// Drop an in-flight entry whose reply could not be sent. Queued
    /// duplicates are told to start over.
    pub fn abandon(&self, token: ExecuteToken) {
        let Some(handle) = token.handle else {
            return;
        };
        let removed = {
            let mut part = self.partitions[handle.partition as usize]
                .lock()
                .expect("drc partition lock poisoned");
            part.remove(handle.slot, handle.generation)
        };
        let Some(entry) = removed else {
            return;
        };
        self.size.fetch_sub(1, Ordering::AcqRel);
        tracing::debug!(drc = self.label, xid = token.fingerprint.xid(), "abandoned entry");
        if let EntryState::InFlight { waiters } = entry.state {
            for waiter in waiters {
                let _ = waiter.send(Resume::Retry);
            }
        }
    }

    /// Remove completed entries oldest-first until at most `hiwat` remain.
    pub fn evict(&self) -> usize {
        let params = self.params();
        let mut retired = 0;
        while self.len() > params.hiwat {
            let excess = self.len() - params.hiwat;
            let removed = self.retire_oldest(excess, None);
            if removed == 0 {
                break;
            }
            retired += removed;
        }
        retired
    }

    /// Remove completed entries older than `max_age`.
    pub fn expire_aged(&self) -> usize {
        let Some(max_age) = self.params().max_age else {
            return 0;
        };
        let cutoff = self.clock.now().checked_sub(max_age);
        match cutoff {
            Some(cutoff) => self.retire_oldest(usize::MAX, Some(cutoff)),
            None => 0,
        }
    }

    fn retire_oldest(&self, limit: usize, older_than: Option<Instant>) -> usize {
        let mut total = 0;
        // Stale handles pop without removing anything; keep going until the
        // limit is met or the queue runs dry.
        while total < limit {
            let victims = {
                let mut completed = self.completed.lock().expect("drc fifo lock poisoned");
                let mut victims = Vec::new();
                while victims.len() < (limit - total).min(64) {
                    match completed.fifo.front() {
                        Some((_, at)) if older_than.is_some_and(|cutoff| *at > cutoff) => break,
                        Some(_) => {
                            if let Some((handle, _)) = completed.fifo.pop_front() {
                                victims.push(handle);
                            }
                        }
                        None => break,
                    }
                }
                victims
            };
            if victims.is_empty() {
                break;
            }
            total += self.remove_victims(victims);
        }
        if total > 0 {
            metrics::set_drc_size(self.label, self.len());
        }
        total
    }

    fn remove_victims(&self, victims: Vec<EntryHandle>) -> usize {
        let mut removed = 0;
        for handle in victims {
            let mut part = self.partitions[handle.partition as usize]
                .lock()
                .expect("drc partition lock poisoned");
            let complete = matches!(
                part.get_mut(handle.slot, handle.generation),
                Some(Entry {
                    state: EntryState::Complete { .. },
                    ..
                })
            );
            if complete && part.remove(handle.slot, handle.generation).is_some() {
                removed += 1;
                self.size.fetch_sub(1, Ordering::AcqRel);
            }
        }
        if removed > 0 {
            metrics::drc_retired(self.label, removed);
        }
        removed
    }

    fn note_duplicate(&self, params: &DrcParams) {
        let mut completed = self.completed.lock().expect("drc fifo lock poisoned");
        let cap = u32::try_from(params.maxsize).unwrap_or(u32::MAX);
        completed.retwnd = if completed.retwnd == 0 {
            params.retire_window_start_bias
        } else {
            completed.retwnd.saturating_add(2).min(cap)
        };
    }

    fn partition_of(&self, fingerprint: &Fingerprint) -> usize {
        fingerprint.xid() as usize % self.partitions.len()
    }

    /// Entries per partition; for diagnostics.
    pub fn partition_sizes(&self) -> Vec<usize> {
        self.partitions
            .iter()
            .map(|part| part.lock().expect("drc partition lock poisoned").live())
            .collect()
    }
}

fn lookup(
    part: &mut Partition,
    index: usize,
    fingerprint: &Fingerprint,
    now: Instant,
    params: &DrcParams,
) -> Lookup {
    let Some(&slot) = part.index.get(fingerprint) else {
        return Lookup::Miss;
    };
    let generation = part.slots[slot as usize].generation;
    let Some(entry) = part.get_mut(slot, generation) else {
        return Lookup::Miss;
    };
    match &mut entry.state {
        EntryState::InFlight { waiters } => {
            if waiters.len() < params.max_dup_waiters {
                let (tx, rx) = crossbeam::channel::bounded(1);
                waiters.push(tx);
                Lookup::Hit(StartOutcome::AlreadyInProgress(Some(DupWaiter { rx })))
            } else {
                Lookup::Hit(StartOutcome::AlreadyInProgress(None))
            }
        }
        EntryState::Complete {
            status,
            reply,
            completed_at,
        } => {
            let stale = params
                .max_age
                .is_some_and(|max_age| now.saturating_duration_since(*completed_at) >= max_age);
            if stale {
                Lookup::Stale(EntryHandle {
                    partition: index as u32,
                    slot,
                    generation,
                })
            } else {
                Lookup::Hit(StartOutcome::ReplayCompleted {
                    status: *status,
                    reply: reply.clone(),
                })
            }
        }
    }
}

fn pop_front(fifo: &mut VecDeque<(EntryHandle, Instant)>, count: usize) -> Vec<EntryHandle> {
    let count = count.min(fifo.len());
    fifo.drain(..count).map(|(handle, _)| handle).collect()
}
