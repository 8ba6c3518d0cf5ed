//! Elastic worker pool with run/pause/stop control ("fridge").
//!
//! Idle threads are frozen on their own condvar and handed work directly.
//! When no thread is idle and the pool is at `thr_max`, the deferment policy decides
//! whether work is queued, the submitter blocks, or submission fails.
//!
//! Pool states: `Running ⇄ Paused`, `Running | Paused → Stopped` (terminal). A
//! command that cannot complete immediately leaves the pool transitioning until the
//! last thread reaches the idle queue (pause) or exits (stop); other commands are
//! refused with [`FridgeError::Busy`] meanwhile.

use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crossbeam::channel;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::daemon::metrics;
use crate::error::{Effect, Transience};

pub type Job = Box<dyn FnOnce(&WorkContext) + Send + 'static>;
type Looper = Arc<dyn Fn(&WorkContext) + Send + Sync + 'static>;
type Completion = Box<dyn FnOnce() + Send + 'static>;

/// What to do with work when no thread can take it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Deferment {
    /// Append to an unbounded queue drained as threads free up.
    Queue,
    /// Block the submitter until a thread frees up or `timeout` passes.
    Block { timeout: Duration },
    /// Fail immediately with [`FridgeError::WouldBlock`].
    Fail,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefermentKind {
    Queue,
    Block,
    Fail,
}

#[derive(Clone, Debug)]
pub struct FridgeParams {
    pub thr_min: usize,
    /// Zero means unbounded.
    pub thr_max: usize,
    /// Idle time after which threads above `thr_min` exit. `None` keeps them forever.
    pub thread_delay: Option<Duration>,
    pub deferment: Deferment,
    pub max_spawn_per_start: usize,
}

impl FridgeParams {
    pub fn new(thr_max: usize, deferment: Deferment) -> Self {
        Self {
            thr_min: 0,
            thr_max,
            thread_delay: None,
            deferment,
            max_spawn_per_start: 50,
        }
    }

    pub fn with_min(mut self, thr_min: usize) -> Self {
        self.thr_min = thr_min;
        self
    }

    pub fn with_thread_delay(mut self, delay: Duration) -> Self {
        self.thread_delay = Some(delay);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FridgeState {
    Running,
    Paused,
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FridgeCommand {
    Run,
    Pause,
    Stop,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FridgeError {
    #[error("fridge {pool} is transitioning; {command:?} refused")]
    Busy {
        pool: String,
        command: FridgeCommand,
    },
    #[error("fridge {pool} is already {state:?}")]
    Already { pool: String, state: FridgeState },
    #[error("fridge {pool} cannot {command:?} from {state:?}")]
    Invalid {
        pool: String,
        command: FridgeCommand,
        state: FridgeState,
    },
    #[error("fridge {pool} has no thread available")]
    WouldBlock { pool: String },
    #[error("fridge {pool} is stopped")]
    Stopped { pool: String },
    #[error("fridge {pool}: {command:?} did not complete within {timeout:?}")]
    TimedOut {
        pool: String,
        command: FridgeCommand,
        timeout: Duration,
    },
    #[error("fridge {pool}: failed to spawn worker: {source}")]
    Spawn {
        pool: String,
        #[source]
        source: std::io::Error,
    },
    #[error("fridge {pool}: invalid parameters: {reason}")]
    InvalidParams { pool: String, reason: String },
}

impl FridgeError {
    pub fn transience(&self) -> Transience {
        match self {
            FridgeError::Busy { .. }
            | FridgeError::WouldBlock { .. }
            | FridgeError::TimedOut { .. }
            | FridgeError::Spawn { .. } => Transience::Retryable,
            FridgeError::Already { .. }
            | FridgeError::Invalid { .. }
            | FridgeError::Stopped { .. }
            | FridgeError::InvalidParams { .. } => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            // The command was accepted; only the wait gave up.
            FridgeError::TimedOut { .. } => Effect::Some,
            _ => Effect::None,
        }
    }
}

struct Transition {
    command: FridgeCommand,
    on_done: Option<Completion>,
}

struct WorkerSlot {
    cv: Arc<Condvar>,
    job: Option<Job>,
    idle: bool,
    looper: bool,
    /// Set by `run` to restart a frozen looper.
    restart: bool,
}

struct Inner {
    state: FridgeState,
    transition: Option<Transition>,
    threads: usize,
    next_thread: u64,
    slots: HashMap<u64, WorkerSlot>,
    idle: VecDeque<u64>,
    deferred: VecDeque<Job>,
    looper: Option<Looper>,
    wake_seq: u64,
}

struct Shared {
    name: String,
    params: FridgeParams,
    inner: Mutex<Inner>,
    /// Submitters blocked under [`Deferment::Block`].
    blocked: Condvar,
    /// Looper sleeps; signalled by [`Fridge::wake`] and by commands.
    loop_cv: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("fridge lock poisoned")
    }

    fn should_break(inner: &Inner) -> bool {
        inner.transition.is_some() || inner.state != FridgeState::Running
    }

    fn accepting(inner: &Inner) -> bool {
        inner.state == FridgeState::Running && inner.transition.is_none()
    }
}

/// Handle passed to every job.
pub struct WorkContext {
    shared: Arc<Shared>,
    thread: u64,
}

impl WorkContext {
    pub fn pool(&self) -> &str {
        &self.shared.name
    }

    pub fn thread(&self) -> u64 {
        self.thread
    }

    /// True once a pause or stop is pending; loopers must return promptly.
    pub fn should_break(&self) -> bool {
        Shared::should_break(&self.shared.lock())
    }

    /// Sleep up to `duration`, returning early on [`Fridge::wake`] or a command.
    ///
    /// Returns `true` when the looper should break.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut inner = self.shared.lock();
        let seq = inner.wake_seq;
        loop {
            if Shared::should_break(&inner) {
                return true;
            }
            if inner.wake_seq != seq {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .shared
                .loop_cv
                .wait_timeout(inner, deadline - now)
                .expect("fridge lock poisoned");
            inner = guard;
        }
    }
}

/// Cloneable handle to a worker pool.
#[derive(Clone)]
pub struct Fridge {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Fridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fridge")
            .field("name", &self.shared.name)
            .field("params", &self.shared.params)
            .finish()
    }
}

impl Fridge {
    pub fn new(name: impl Into<String>, params: FridgeParams) -> Result<Self, FridgeError> {
        let name = name.into();
        if params.thr_max != 0 && params.thr_min > params.thr_max {
            return Err(FridgeError::InvalidParams {
                pool: name,
                reason: format!(
                    "thr_min {} exceeds thr_max {}",
                    params.thr_min, params.thr_max
                ),
            });
        }
        Ok(Self {
            shared: Arc::new(Shared {
                name,
                params,
                inner: Mutex::new(Inner {
                    state: FridgeState::Running,
                    transition: None,
                    threads: 0,
                    next_thread: 0,
                    slots: HashMap::new(),
                    idle: VecDeque::new(),
                    deferred: VecDeque::new(),
                    looper: None,
                    wake_seq: 0,
                }),
                blocked: Condvar::new(),
                loop_cv: Condvar::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> FridgeState {
        self.shared.lock().state
    }

    pub fn is_transitioning(&self) -> bool {
        self.shared.lock().transition.is_some()
    }

    pub fn thread_count(&self) -> usize {
        self.shared.lock().threads
    }

    pub fn idle_count(&self) -> usize {
        self.shared.lock().idle.len()
    }

    pub fn deferred_count(&self) -> usize {
        self.shared.lock().deferred.len()
    }

    /// Submit one job.
    pub fn submit<F>(&self, job: F) -> Result<(), FridgeError>
    where
        F: FnOnce(&WorkContext) + Send + 'static,
    {
        self.submit_boxed(Box::new(job))
    }

    pub fn submit_boxed(&self, job: Job) -> Result<(), FridgeError> {
        let shared = &self.shared;
        let mut inner = shared.lock();
        self.reject_if_stopping(&inner)?;

        let job = match self.try_dispatch(&mut inner, job)? {
            None => return Ok(()),
            Some(job) => job,
        };

        match shared.params.deferment {
            Deferment::Queue => {
                inner.deferred.push_back(job);
                metrics::set_fridge_deferred(&shared.name, inner.deferred.len());
                Ok(())
            }
            Deferment::Fail => Err(FridgeError::WouldBlock {
                pool: shared.name.clone(),
            }),
            Deferment::Block { timeout } => {
                let deadline = Instant::now() + timeout;
                let mut job = job;
                loop {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(FridgeError::WouldBlock {
                            pool: shared.name.clone(),
                        });
                    }
                    let (guard, _) = shared
                        .blocked
                        .wait_timeout(inner, deadline - now)
                        .expect("fridge lock poisoned");
                    inner = guard;
                    self.reject_if_stopping(&inner)?;
                    job = match self.try_dispatch(&mut inner, job)? {
                        None => return Ok(()),
                        Some(job) => job,
                    };
                }
            }
        }
    }

    fn reject_if_stopping(&self, inner: &Inner) -> Result<(), FridgeError> {
        let stopping = matches!(
            inner.transition,
            Some(Transition {
                command: FridgeCommand::Stop,
                ..
            })
        );
        if inner.state == FridgeState::Stopped || stopping {
            return Err(FridgeError::Stopped {
                pool: self.shared.name.clone(),
            });
        }
        Ok(())
    }

    /// Hand `job` to an idle thread or a new one. Gives the job back if neither is
    /// possible (paused, transitioning, or at `thr_max`).
    fn try_dispatch(&self, inner: &mut Inner, job: Job) -> Result<Option<Job>, FridgeError> {
        if !Shared::accepting(inner) {
            return Ok(Some(job));
        }
        if let Some(id) = inner.idle.pop_front()
            && let Some(slot) = inner.slots.get_mut(&id)
        {
            slot.idle = false;
            slot.job = Some(job);
            slot.cv.notify_one();
            return Ok(None);
        }
        let max = self.shared.params.thr_max;
        if max == 0 || inner.threads < max {
            self.spawn_locked(inner, Some(job), false)?;
            return Ok(None);
        }
        Ok(Some(job))
    }

    fn spawn_locked(
        &self,
        inner: &mut Inner,
        first: Option<Job>,
        looper: bool,
    ) -> Result<(), FridgeError> {
        let id = inner.next_thread;
        inner.next_thread += 1;
        let cv = Arc::new(Condvar::new());
        let shared = Arc::clone(&self.shared);
        let thread_cv = Arc::clone(&cv);
        let spawned = std::thread::Builder::new()
            .name(format!("{}-{id}", self.shared.name))
            .spawn(move || worker_main(shared, id, thread_cv, first));
        match spawned {
            Ok(_) => {
                inner.threads += 1;
                inner.slots.insert(
                    id,
                    WorkerSlot {
                        cv,
                        job: None,
                        idle: false,
                        looper,
                        restart: false,
                    },
                );
                metrics::set_fridge_threads(&self.shared.name, inner.threads);
                Ok(())
            }
            Err(source) => {
                metrics::fridge_spawn_failed(&self.shared.name);
                tracing::error!(pool = %self.shared.name, "worker spawn failed: {source}");
                Err(FridgeError::Spawn {
                    pool: self.shared.name.clone(),
                    source,
                })
            }
        }
    }

    /// Start `thr_min` (at least one) looper threads running `looper` until told to
    /// break. Loopers restart on every `run`.
    pub fn populate<F>(&self, looper: F) -> Result<(), FridgeError>
    where
        F: Fn(&WorkContext) + Send + Sync + 'static,
    {
        let looper: Looper = Arc::new(looper);
        let mut inner = self.shared.lock();
        self.reject_if_stopping(&inner)?;
        inner.looper = Some(Arc::clone(&looper));
        let count = self.shared.params.thr_min.max(1);
        for _ in 0..count {
            let looper = Arc::clone(&looper);
            self.spawn_locked(&mut inner, Some(Box::new(move |ctx| looper(ctx))), true)?;
        }
        Ok(())
    }

    /// Interrupt loopers sleeping in [`WorkContext::sleep`].
    pub fn wake(&self) {
        let mut inner = self.shared.lock();
        inner.wake_seq = inner.wake_seq.wrapping_add(1);
        self.shared.loop_cv.notify_all();
    }

    pub fn run(&self) -> Result<(), FridgeError> {
        self.command(FridgeCommand::Run, None)
    }

    pub fn pause(&self) -> Result<(), FridgeError> {
        self.command(FridgeCommand::Pause, None)
    }

    pub fn stop(&self) -> Result<(), FridgeError> {
        self.command(FridgeCommand::Stop, None)
    }

    /// Issue `command` and wait until it completes.
    pub fn sync_command(
        &self,
        command: FridgeCommand,
        timeout: Duration,
    ) -> Result<(), FridgeError> {
        let (tx, rx) = channel::bounded(1);
        self.command(
            command,
            Some(Box::new(move || {
                let _ = tx.send(());
            })),
        )?;
        rx.recv_timeout(timeout)
            .map_err(|_| FridgeError::TimedOut {
                pool: self.shared.name.clone(),
                command,
                timeout,
            })
    }

    /// Issue `command`; `on_done` runs once the transition completes.
    pub fn command(
        &self,
        command: FridgeCommand,
        on_done: Option<Completion>,
    ) -> Result<(), FridgeError> {
        let shared = &self.shared;
        let mut inner = shared.lock();
        if inner.transition.is_some() {
            return Err(FridgeError::Busy {
                pool: shared.name.clone(),
                command,
            });
        }
        let state = inner.state;
        let mut discarded = VecDeque::new();
        let done = match (state, command) {
            (FridgeState::Running, FridgeCommand::Run)
            | (FridgeState::Paused, FridgeCommand::Pause)
            | (FridgeState::Stopped, FridgeCommand::Stop) => {
                return Err(FridgeError::Already {
                    pool: shared.name.clone(),
                    state,
                });
            }
            (FridgeState::Stopped, _) => {
                return Err(FridgeError::Invalid {
                    pool: shared.name.clone(),
                    command,
                    state,
                });
            }
            (FridgeState::Running, FridgeCommand::Pause) => {
                tracing::debug!(pool = %shared.name, "pausing");
                inner.transition = Some(Transition { command, on_done });
                shared.loop_cv.notify_all();
                shared.blocked.notify_all();
                if inner.idle.len() == inner.threads {
                    finish_transition(&mut inner)
                } else {
                    None
                }
            }
            (FridgeState::Paused, FridgeCommand::Run) => {
                tracing::debug!(pool = %shared.name, "resuming");
                inner.state = FridgeState::Running;
                self.resume_locked(&mut inner);
                shared.blocked.notify_all();
                on_done
            }
            (_, FridgeCommand::Stop) => {
                tracing::debug!(pool = %shared.name, threads = inner.threads, "stopping");
                inner.transition = Some(Transition { command, on_done });
                discarded = std::mem::take(&mut inner.deferred);
                let dropped = discarded.len();
                if dropped > 0 {
                    tracing::warn!(pool = %shared.name, dropped, "discarding deferred work on stop");
                    metrics::set_fridge_deferred(&shared.name, 0);
                }
                for slot in inner.slots.values() {
                    slot.cv.notify_one();
                }
                shared.loop_cv.notify_all();
                shared.blocked.notify_all();
                if inner.threads == 0 {
                    finish_transition(&mut inner)
                } else {
                    None
                }
            }
        };
        drop(inner);
        // Discarded jobs release what they captured outside the pool lock.
        drop(discarded);
        if let Some(done) = done {
            done();
        }
        Ok(())
    }

    /// Wake idle threads for deferred work and loopers, spawning more if the
    /// backlog exceeds the idle count.
    fn resume_locked(&self, inner: &mut Inner) {
        while !inner.deferred.is_empty() {
            let Some(id) = inner.idle.pop_front() else {
                break;
            };
            let job = inner.deferred.pop_front();
            if let Some(slot) = inner.slots.get_mut(&id) {
                slot.idle = false;
                slot.job = job;
                slot.cv.notify_one();
            }
        }
        let max = self.shared.params.thr_max;
        let mut spawned = 0;
        while !inner.deferred.is_empty()
            && spawned < self.shared.params.max_spawn_per_start
            && (max == 0 || inner.threads < max)
        {
            let job = inner.deferred.pop_front();
            if let Err(err) = self.spawn_locked(inner, job, false) {
                tracing::warn!(pool = %self.shared.name, "resume spawn failed: {err}");
                break;
            }
            spawned += 1;
        }
        metrics::set_fridge_deferred(&self.shared.name, inner.deferred.len());
        let frozen_loopers: Vec<u64> = inner
            .idle
            .iter()
            .copied()
            .filter(|id| inner.slots.get(id).is_some_and(|slot| slot.looper))
            .collect();
        for id in frozen_loopers {
            remove_idle(inner, id);
            if let Some(slot) = inner.slots.get_mut(&id) {
                slot.restart = true;
                slot.cv.notify_one();
            }
        }
    }
}

fn finish_transition(inner: &mut Inner) -> Option<Completion> {
    let transition = inner.transition.take()?;
    inner.state = match transition.command {
        FridgeCommand::Pause => FridgeState::Paused,
        FridgeCommand::Stop => FridgeState::Stopped,
        FridgeCommand::Run => FridgeState::Running,
    };
    transition.on_done
}

enum Next {
    Run(Job),
    Exit(Option<Completion>),
}

fn worker_main(shared: Arc<Shared>, id: u64, cv: Arc<Condvar>, first: Option<Job>) {
    let ctx = WorkContext {
        shared: Arc::clone(&shared),
        thread: id,
    };
    let mut next = first;
    loop {
        if let Some(job) = next.take() {
            if catch_unwind(AssertUnwindSafe(|| job(&ctx))).is_err() {
                tracing::error!(pool = %shared.name, thread = id, "job panicked");
            }
        }
        match next_job(&shared, id, &cv) {
            Next::Run(job) => next = Some(job),
            Next::Exit(done) => {
                if let Some(done) = done {
                    done();
                }
                return;
            }
        }
    }
}

fn next_job(shared: &Arc<Shared>, id: u64, cv: &Condvar) -> Next {
    let mut inner = shared.lock();
    loop {
        if inner.state == FridgeState::Stopped
            || matches!(
                inner.transition,
                Some(Transition {
                    command: FridgeCommand::Stop,
                    ..
                })
            )
        {
            return Next::Exit(retire_thread(shared, &mut inner, id));
        }

        if let Some(job) = inner.slots.get_mut(&id).and_then(|slot| slot.job.take()) {
            return Next::Run(job);
        }

        if Shared::accepting(&inner) {
            if let Some(job) = inner.deferred.pop_front() {
                remove_idle(&mut inner, id);
                metrics::set_fridge_deferred(&shared.name, inner.deferred.len());
                return Next::Run(job);
            }
            let restart = inner.slots.get_mut(&id).is_some_and(|slot| {
                let restart = slot.restart;
                slot.restart = false;
                restart
            });
            if restart && let Some(looper) = inner.looper.clone() {
                return Next::Run(Box::new(move |ctx| looper(ctx)));
            }
        }

        freeze(&mut inner, id);
        shared.blocked.notify_one();
        if let Some(Transition {
            command: FridgeCommand::Pause,
            ..
        }) = inner.transition
            && inner.idle.len() == inner.threads
            && let Some(done) = finish_transition(&mut inner)
        {
            drop(inner);
            done();
            inner = shared.lock();
            continue;
        }

        let (guard, timed_out) = match shared.params.thread_delay {
            Some(delay) => {
                let (guard, result) = cv
                    .wait_timeout(inner, delay)
                    .expect("fridge lock poisoned");
                (guard, result.timed_out())
            }
            None => (cv.wait(inner).expect("fridge lock poisoned"), false),
        };
        inner = guard;

        let still_idle = inner.slots.get(&id).is_some_and(|slot| slot.idle);
        if timed_out
            && still_idle
            && inner.threads > shared.params.thr_min
            && inner.transition.is_none()
        {
            tracing::trace!(pool = %shared.name, thread = id, "idle thread expiring");
            return Next::Exit(retire_thread(shared, &mut inner, id));
        }
    }
}

fn freeze(inner: &mut Inner, id: u64) {
    if let Some(slot) = inner.slots.get_mut(&id)
        && !slot.idle
    {
        slot.idle = true;
        inner.idle.push_back(id);
    }
}

fn remove_idle(inner: &mut Inner, id: u64) {
    if let Some(slot) = inner.slots.get_mut(&id) {
        slot.idle = false;
    }
    inner.idle.retain(|&idle| idle != id);
}

fn retire_thread(shared: &Shared, inner: &mut Inner, id: u64) -> Option<Completion> {
    remove_idle(inner, id);
    inner.slots.remove(&id);
    inner.threads = inner.threads.saturating_sub(1);
    metrics::set_fridge_threads(&shared.name, inner.threads);
    let stopping = matches!(
        inner.transition,
        Some(Transition {
            command: FridgeCommand::Stop,
            ..
        })
    );
    let pausing = matches!(
        inner.transition,
        Some(Transition {
            command: FridgeCommand::Pause,
            ..
        })
    );
    if (stopping && inner.threads == 0) || (pausing && inner.idle.len() == inner.threads) {
        return finish_transition(inner);
    }
    None
}
