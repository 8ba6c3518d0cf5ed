//! Clustered grace database and recovery backend.
//!
//! The database holds two epochs and a flag byte per member node:
//!
//! - `cur`: the epoch new client records are written under.
//! - `rec`: the epoch clients may reclaim from; `0` means no grace period.
//! - `NEED_GRACE`: the node still needs the cluster to stay in grace.
//! - `ENFORCING`: the node rejects non-reclaim state changes.
//!
//! Updates are read-modify-write with a version check. A lost race rereads
//! and retries after a short random backoff.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, TrySendError};
use nix::fcntl::{Flock, FlockArg};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::kv::{KvStore, load_map, store_map, write_atomic};
use super::{GraceHint, ReclaimCandidate, RecoveryBackend, RecoveryError, merge_candidates};
use crate::core::{ClientOwner, FileHandle, NodeId};

pub const NEED_GRACE: u8 = 0x1;
pub const ENFORCING: u8 = 0x2;

const DEFAULT_CAS_ATTEMPTS: u32 = 16;
const WATCH_POLL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraceDb {
    pub cur: u64,
    pub rec: u64,
    #[serde(default)]
    pub members: BTreeMap<NodeId, u8>,
}

impl Default for GraceDb {
    fn default() -> Self {
        Self {
            cur: 1,
            rec: 0,
            members: BTreeMap::new(),
        }
    }
}

impl GraceDb {
    pub fn in_grace(&self) -> bool {
        self.rec != 0
    }

    pub fn flags(&self, node: &NodeId) -> Option<u8> {
        self.members.get(node).copied()
    }

    fn require_members(&self, nodes: &[NodeId]) -> Result<(), RecoveryError> {
        match nodes.iter().find(|node| !self.members.contains_key(*node)) {
            Some(node) => Err(RecoveryError::NotMember { node: node.clone() }),
            None => Ok(()),
        }
    }

    fn lift_if_done(&mut self) {
        if self.rec != 0 && self.members.values().all(|flags| flags & NEED_GRACE == 0) {
            self.rec = 0;
        }
    }

    /// Request grace for `nodes`. Without `start`, joins only a grace period
    /// that is already running.
    pub fn join(&mut self, nodes: &[NodeId], start: bool) -> Result<bool, RecoveryError> {
        self.require_members(nodes)?;
        if self.rec == 0 && !start {
            return Ok(false);
        }
        let before = self.clone();
        if self.rec == 0 {
            self.rec = self.cur;
            self.cur += 1;
        }
        for node in nodes {
            if let Some(flags) = self.members.get_mut(node) {
                *flags |= NEED_GRACE | ENFORCING;
            }
        }
        Ok(*self != before)
    }

    /// Clear `NEED_GRACE` for `nodes`; the period ends once no member needs
    /// it. Refused while a grace period runs and some member is not yet
    /// enforcing.
    pub fn lift(&mut self, nodes: &[NodeId]) -> Result<bool, RecoveryError> {
        self.require_members(nodes)?;
        if self.rec != 0 && self.members.values().any(|flags| flags & ENFORCING == 0) {
            return Ok(false);
        }
        let before = self.clone();
        for node in nodes {
            if let Some(flags) = self.members.get_mut(node) {
                *flags &= !NEED_GRACE;
            }
        }
        self.lift_if_done();
        Ok(*self != before)
    }

    pub fn set_enforcing(&mut self, nodes: &[NodeId], on: bool) -> Result<bool, RecoveryError> {
        self.require_members(nodes)?;
        let before = self.clone();
        for node in nodes {
            if let Some(flags) = self.members.get_mut(node) {
                if on {
                    *flags |= ENFORCING;
                } else {
                    *flags &= !ENFORCING;
                }
            }
        }
        Ok(*self != before)
    }

    /// True when every member enforces; `node` must be a member.
    pub fn enforcing_check(&self, node: &NodeId) -> Result<bool, RecoveryError> {
        self.require_members(std::slice::from_ref(node))?;
        Ok(self.members.values().all(|flags| flags & ENFORCING != 0))
    }

    pub fn add(&mut self, nodes: &[NodeId]) -> Result<bool, RecoveryError> {
        if let Some(node) = nodes.iter().find(|node| self.members.contains_key(*node)) {
            return Err(RecoveryError::AlreadyMember { node: node.clone() });
        }
        for node in nodes {
            self.members.insert(node.clone(), ENFORCING);
        }
        Ok(!nodes.is_empty())
    }

    pub fn remove(&mut self, nodes: &[NodeId]) -> Result<bool, RecoveryError> {
        self.require_members(nodes)?;
        for node in nodes {
            self.members.remove(node);
        }
        self.lift_if_done();
        Ok(!nodes.is_empty())
    }

    pub fn dump(&self) -> String {
        let mut out = format!("cur={} rec={}\n", self.cur, self.rec);
        out.push_str("======================================================\n");
        for (node, flags) in &self.members {
            let need = if flags & NEED_GRACE != 0 { "N" } else { " " };
            let enforcing = if flags & ENFORCING != 0 { "E" } else { " " };
            let _ = writeln!(out, "{node}\t{need}{enforcing}");
        }
        out
    }
}

/// Versioned grace database plus objects for per-epoch client records.
pub trait ClusterStore: KvStore {
    fn load_db(&self) -> Result<(u64, GraceDb), RecoveryError>;

    /// Replace the database iff its version is still `version`.
    fn compare_and_swap(&self, version: u64, db: &GraceDb) -> Result<bool, RecoveryError>;

    fn notify(&self) -> Result<(), RecoveryError>;

    /// A channel that fires (coalesced) after database changes.
    fn subscribe(&self) -> Receiver<()>;
}

/// In-process store shared by several nodes; used in tests.
#[derive(Default)]
pub struct MemClusterStore {
    db: Mutex<(u64, GraceDb)>,
    objects: Mutex<HashMap<String, Vec<u8>>>,
    watchers: Mutex<Vec<Sender<()>>>,
}

impl MemClusterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemClusterStore {
    fn read_object(&self, name: &str) -> Result<Option<Vec<u8>>, RecoveryError> {
        Ok(self
            .objects
            .lock()
            .expect("cluster objects lock poisoned")
            .get(name)
            .cloned())
    }

    fn write_object(&self, name: &str, bytes: &[u8]) -> Result<(), RecoveryError> {
        self.objects
            .lock()
            .expect("cluster objects lock poisoned")
            .insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    fn remove_object(&self, name: &str) -> Result<(), RecoveryError> {
        self.objects
            .lock()
            .expect("cluster objects lock poisoned")
            .remove(name);
        Ok(())
    }
}

impl ClusterStore for MemClusterStore {
    fn load_db(&self) -> Result<(u64, GraceDb), RecoveryError> {
        Ok(self.db.lock().expect("cluster db lock poisoned").clone())
    }

    fn compare_and_swap(&self, version: u64, db: &GraceDb) -> Result<bool, RecoveryError> {
        let mut current = self.db.lock().expect("cluster db lock poisoned");
        if current.0 != version {
            return Ok(false);
        }
        *current = (version + 1, db.clone());
        Ok(true)
    }

    fn notify(&self) -> Result<(), RecoveryError> {
        self.watchers
            .lock()
            .expect("cluster watchers lock poisoned")
            .retain(|tx| !matches!(tx.try_send(()), Err(TrySendError::Disconnected(_))));
        Ok(())
    }

    fn subscribe(&self) -> Receiver<()> {
        let (tx, rx) = crossbeam::channel::bounded(1);
        self.watchers
            .lock()
            .expect("cluster watchers lock poisoned")
            .push(tx);
        rx
    }
}

#[derive(Serialize, Deserialize)]
struct DbFile {
    version: u64,
    db: GraceDb,
}

/// Grace database in a shared directory, serialized with `flock`.
pub struct FileClusterStore {
    dir: PathBuf,
    objects: super::kv::FileKvStore,
    closed: Arc<AtomicBool>,
}

impl FileClusterStore {
    pub fn open(dir: &Path) -> Result<Self, RecoveryError> {
        fs::create_dir_all(dir).map_err(|e| RecoveryError::io(dir, e))?;
        let objects = super::kv::FileKvStore::open(&dir.join("objects"))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            objects,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn db_path(&self) -> PathBuf {
        self.dir.join("grace.json")
    }

    fn lock(&self) -> Result<Flock<File>, RecoveryError> {
        let path = self.dir.join("grace.lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| RecoveryError::io(&path, e))?;
        Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| RecoveryError::Lock { path, errno })
    }
}

fn read_db_file(path: &Path) -> Result<(u64, GraceDb), RecoveryError> {
    match fs::read(path) {
        Ok(bytes) => {
            let file: DbFile =
                serde_json::from_slice(&bytes).map_err(|source| RecoveryError::Serde {
                    object: path.display().to_string(),
                    source,
                })?;
            Ok((file.version, file.db))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok((0, GraceDb::default())),
        Err(e) => Err(RecoveryError::io(path, e)),
    }
}

impl KvStore for FileClusterStore {
    fn read_object(&self, name: &str) -> Result<Option<Vec<u8>>, RecoveryError> {
        self.objects.read_object(name)
    }

    fn write_object(&self, name: &str, bytes: &[u8]) -> Result<(), RecoveryError> {
        self.objects.write_object(name, bytes)
    }

    fn remove_object(&self, name: &str) -> Result<(), RecoveryError> {
        self.objects.remove_object(name)
    }
}

impl ClusterStore for FileClusterStore {
    fn load_db(&self) -> Result<(u64, GraceDb), RecoveryError> {
        read_db_file(&self.db_path())
    }

    fn compare_and_swap(&self, version: u64, db: &GraceDb) -> Result<bool, RecoveryError> {
        let _lock = self.lock()?;
        let path = self.db_path();
        let (current, _) = read_db_file(&path)?;
        if current != version {
            return Ok(false);
        }
        let file = DbFile {
            version: version + 1,
            db: db.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&file).map_err(|source| RecoveryError::Serde {
            object: path.display().to_string(),
            source,
        })?;
        write_atomic(&path, &bytes)?;
        Ok(true)
    }

    /// Watchers poll the database version; nothing to signal.
    fn notify(&self) -> Result<(), RecoveryError> {
        Ok(())
    }

    fn subscribe(&self) -> Receiver<()> {
        let (tx, rx) = crossbeam::channel::bounded(1);
        let path = self.db_path();
        let closed = self.closed.clone();
        let spawned = thread::Builder::new()
            .name("grace-db-watch".to_string())
            .spawn(move || {
                let mut seen = read_db_file(&path).map(|(version, _)| version).ok();
                while !closed.load(Ordering::Acquire) {
                    thread::sleep(WATCH_POLL);
                    let version = read_db_file(&path).map(|(version, _)| version).ok();
                    if version != seen {
                        seen = version;
                        if let Err(TrySendError::Disconnected(_)) = tx.try_send(()) {
                            return;
                        }
                    }
                }
            });
        if let Err(err) = spawned {
            tracing::error!(error = %err, "failed to spawn grace db watcher");
        }
        rx
    }
}

impl Drop for FileClusterStore {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Grace database operations with bounded compare-and-swap retries.
#[derive(Clone)]
pub struct GraceDbClient {
    store: Arc<dyn ClusterStore>,
    max_attempts: u32,
}

impl GraceDbClient {
    pub fn new(store: Arc<dyn ClusterStore>) -> Self {
        Self {
            store,
            max_attempts: DEFAULT_CAS_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn read(&self) -> Result<GraceDb, RecoveryError> {
        Ok(self.store.load_db()?.1)
    }

    /// Apply `change` until it lands on an unchanged database version.
    pub fn update(
        &self,
        mut change: impl FnMut(&mut GraceDb) -> Result<bool, RecoveryError>,
    ) -> Result<GraceDb, RecoveryError> {
        for attempt in 1..=self.max_attempts {
            let (version, mut db) = self.store.load_db()?;
            if !change(&mut db)? {
                return Ok(db);
            }
            if self.store.compare_and_swap(version, &db)? {
                self.store.notify()?;
                return Ok(db);
            }
            let backoff = rand::rng().random_range(1..=10u64) * u64::from(attempt);
            tracing::debug!(attempt, backoff_ms = backoff, "grace db update raced; retrying");
            thread::sleep(Duration::from_millis(backoff));
        }
        Err(RecoveryError::Contended {
            attempts: self.max_attempts,
        })
    }

    pub fn join(&self, nodes: &[NodeId], start: bool) -> Result<GraceDb, RecoveryError> {
        self.update(|db| db.join(nodes, start))
    }

    pub fn lift(&self, nodes: &[NodeId]) -> Result<GraceDb, RecoveryError> {
        self.update(|db| db.lift(nodes))
    }

    pub fn enforcing_on(&self, nodes: &[NodeId]) -> Result<GraceDb, RecoveryError> {
        self.update(|db| db.set_enforcing(nodes, true))
    }

    pub fn enforcing_off(&self, nodes: &[NodeId]) -> Result<GraceDb, RecoveryError> {
        self.update(|db| db.set_enforcing(nodes, false))
    }

    pub fn enforcing_check(&self, node: &NodeId) -> Result<bool, RecoveryError> {
        self.read()?.enforcing_check(node)
    }

    pub fn add(&self, nodes: &[NodeId]) -> Result<GraceDb, RecoveryError> {
        self.update(|db| db.add(nodes))
    }

    pub fn remove(&self, nodes: &[NodeId]) -> Result<GraceDb, RecoveryError> {
        self.update(|db| db.remove(nodes))
    }

    pub fn dump(&self) -> Result<String, RecoveryError> {
        Ok(self.read()?.dump())
    }
}

/// Client record object for `node` in `epoch`.
pub fn record_object(epoch: u64, node: &NodeId) -> String {
    format!("rec-{epoch:016x}:{node}")
}

#[derive(Clone, Copy, Debug, Default)]
struct Epochs {
    /// Epoch new records are written under.
    cur: u64,
    /// Reclaim epoch of the grace period this node is in, 0 when none.
    rec: u64,
    /// Last reclaim epoch this node joined.
    joined: u64,
}

pub struct ClusterRecovery {
    client: GraceDbClient,
    store: Arc<dyn ClusterStore>,
    node: NodeId,
    epochs: Mutex<Epochs>,
    write: Mutex<()>,
    candidates: Mutex<Vec<ReclaimCandidate>>,
}

impl ClusterRecovery {
    /// Open the backend, adding `node` to the database if it is not a member.
    pub fn new(store: Arc<dyn ClusterStore>, node: NodeId) -> Result<Self, RecoveryError> {
        let client = GraceDbClient::new(store.clone());
        let db = client.update(|db| {
            if db.members.contains_key(&node) {
                Ok(false)
            } else {
                db.add(std::slice::from_ref(&node))
            }
        })?;
        tracing::info!(node = %node, cur = db.cur, rec = db.rec, "joined grace database");
        Ok(Self {
            client,
            store,
            node,
            epochs: Mutex::new(Epochs {
                cur: db.cur,
                rec: 0,
                joined: 0,
            }),
            write: Mutex::new(()),
            candidates: Mutex::new(Vec::new()),
        })
    }

    pub fn client(&self) -> &GraceDbClient {
        &self.client
    }

    fn epochs(&self) -> Epochs {
        *self.epochs.lock().expect("cluster epochs lock poisoned")
    }

    fn update_current(
        &self,
        apply: impl FnOnce(&mut super::RecoveryMap),
    ) -> Result<(), RecoveryError> {
        let _guard = self.write.lock().expect("cluster recovery lock poisoned");
        let object = record_object(self.epochs().cur, &self.node);
        let kv: &dyn KvStore = self.store.as_ref();
        let mut map = load_map(kv, &object)?;
        apply(&mut map);
        store_map(kv, &object, &map)
    }

    fn self_slice(&self) -> &[NodeId] {
        std::slice::from_ref(&self.node)
    }
}

impl RecoveryBackend for ClusterRecovery {
    fn name(&self) -> &'static str {
        "cluster"
    }

    fn record_client(&self, owner: &ClientOwner) -> Result<(), RecoveryError> {
        self.update_current(|map| map.insert(owner))
    }

    fn remove_client(&self, owner: &ClientOwner) -> Result<(), RecoveryError> {
        self.update_current(|map| {
            map.remove(owner);
        })
    }

    fn record_revoked_handle(
        &self,
        owner: &ClientOwner,
        handle: &FileHandle,
    ) -> Result<(), RecoveryError> {
        self.update_current(|map| map.revoke(owner, handle))
    }

    fn begin_grace(&self, hint: Option<&GraceHint>) -> Result<(), RecoveryError> {
        let _guard = self.write.lock().expect("cluster recovery lock poisoned");
        let db = self.client.join(self.self_slice(), true)?;
        let previous_cur = self.epochs().cur;
        let kv: &dyn KvStore = self.store.as_ref();

        let mut found = load_map(kv, &record_object(db.rec, &self.node))?.candidates()?;
        if let Some(GraceHint::Takeover { node }) = hint {
            found.extend(load_map(kv, &record_object(db.rec, node))?.candidates()?);
        }
        // Records written since the last grace carry over into the new epoch.
        if previous_cur != db.cur {
            let carried = load_map(kv, &record_object(previous_cur, &self.node))?;
            if previous_cur != db.rec {
                found.extend(carried.candidates()?);
            }
        }

        *self.epochs.lock().expect("cluster epochs lock poisoned") = Epochs {
            cur: db.cur,
            rec: db.rec,
            joined: db.rec,
        };
        let found = merge_candidates(found);
        tracing::info!(
            node = %self.node,
            cur = db.cur,
            rec = db.rec,
            candidates = found.len(),
            "joined cluster grace"
        );
        *self.candidates.lock().expect("recovery candidates lock poisoned") = found;
        Ok(())
    }

    fn enumerate_reclaim_candidates(
        &self,
        visit: &mut dyn FnMut(ReclaimCandidate),
    ) -> Result<(), RecoveryError> {
        let candidates = self
            .candidates
            .lock()
            .expect("recovery candidates lock poisoned")
            .clone();
        candidates.into_iter().for_each(visit);
        Ok(())
    }

    fn end_grace(&self) -> Result<(), RecoveryError> {
        let ended = {
            let mut epochs = self.epochs.lock().expect("cluster epochs lock poisoned");
            std::mem::replace(&mut epochs.rec, 0)
        };
        if ended != 0 {
            self.store.remove_object(&record_object(ended, &self.node))?;
        }
        self.candidates
            .lock()
            .expect("recovery candidates lock poisoned")
            .clear();
        Ok(())
    }

    fn set_enforcing(&self) -> Result<(), RecoveryError> {
        self.client.enforcing_on(self.self_slice()).map(|_| ())
    }

    fn is_enforcing(&self) -> Result<bool, RecoveryError> {
        self.client.enforcing_check(&self.node)
    }

    fn try_lift_grace(&self) -> Result<bool, RecoveryError> {
        let db = self.client.lift(self.self_slice())?;
        Ok(!db.in_grace())
    }

    fn maybe_start_grace(&self) -> Result<bool, RecoveryError> {
        let db = self.client.read()?;
        Ok(db.in_grace() && db.rec != self.epochs().joined)
    }

    fn watch(&self) -> Option<Receiver<()>> {
        Some(self.store.subscribe())
    }
}
