//! Single-node key/value recovery backend.
//!
//! Each generation is one object holding a [`RecoveryMap`]:
//! `<node>_recov` for current clients and `<node>_old` for the previous boot.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::{GraceHint, ReclaimCandidate, RecoveryBackend, RecoveryError, RecoveryMap, merge_candidates};
use crate::core::{ClientOwner, FileHandle, NodeId};

/// Whole-object store.
pub trait KvStore: Send + Sync {
    fn read_object(&self, name: &str) -> Result<Option<Vec<u8>>, RecoveryError>;

    fn write_object(&self, name: &str, bytes: &[u8]) -> Result<(), RecoveryError>;

    fn remove_object(&self, name: &str) -> Result<(), RecoveryError>;
}

/// Objects as files in one directory, replaced atomically.
pub struct FileKvStore {
    dir: PathBuf,
}

impl FileKvStore {
    pub fn open(dir: &Path) -> Result<Self, RecoveryError> {
        fs::create_dir_all(dir).map_err(|e| RecoveryError::io(dir, e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl KvStore for FileKvStore {
    fn read_object(&self, name: &str) -> Result<Option<Vec<u8>>, RecoveryError> {
        let path = self.path(name);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RecoveryError::io(path, e)),
        }
    }

    fn write_object(&self, name: &str, bytes: &[u8]) -> Result<(), RecoveryError> {
        write_atomic(&self.path(name), bytes)
    }

    fn remove_object(&self, name: &str) -> Result<(), RecoveryError> {
        let path = self.path(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RecoveryError::io(path, e)),
        }
    }
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), RecoveryError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp =
        tempfile::NamedTempFile::new_in(dir).map_err(|e| RecoveryError::io(dir, e))?;
    temp.write_all(bytes)
        .and_then(|()| temp.as_file().sync_all())
        .map_err(|e| RecoveryError::io(temp.path(), e))?;
    temp.persist(path)
        .map_err(|e| RecoveryError::io(path, e.error))?;
    Ok(())
}

pub(crate) fn load_map(store: &dyn KvStore, object: &str) -> Result<RecoveryMap, RecoveryError> {
    match store.read_object(object)? {
        Some(bytes) => RecoveryMap::decode(object, &bytes),
        None => Ok(RecoveryMap::default()),
    }
}

pub(crate) fn store_map(
    store: &dyn KvStore,
    object: &str,
    map: &RecoveryMap,
) -> Result<(), RecoveryError> {
    store.write_object(object, &map.encode(object)?)
}

pub struct KvRecovery {
    store: Arc<dyn KvStore>,
    node: NodeId,
    /// Serializes read-modify-write of this node's objects.
    write: Mutex<()>,
    candidates: Mutex<Vec<ReclaimCandidate>>,
}

impl KvRecovery {
    pub fn new(store: Arc<dyn KvStore>, node: NodeId) -> Self {
        Self {
            store,
            node,
            write: Mutex::new(()),
            candidates: Mutex::new(Vec::new()),
        }
    }

    fn current_object(node: &NodeId) -> String {
        format!("{node}_recov")
    }

    fn old_object(node: &NodeId) -> String {
        format!("{node}_old")
    }

    fn update_current(&self, apply: impl FnOnce(&mut RecoveryMap)) -> Result<(), RecoveryError> {
        let _guard = self.write.lock().expect("kv recovery lock poisoned");
        let object = Self::current_object(&self.node);
        let mut map = load_map(self.store.as_ref(), &object)?;
        apply(&mut map);
        store_map(self.store.as_ref(), &object, &map)
    }
}

impl RecoveryBackend for KvRecovery {
    fn name(&self) -> &'static str {
        "kv"
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
        let _guard = self.write.lock().expect("kv recovery lock poisoned");
        let store = self.store.as_ref();
        let current_name = Self::current_object(&self.node);
        let old_name = Self::old_object(&self.node);
        let old = load_map(store, &old_name)?;
        let current = load_map(store, &current_name)?;

        let mut found = old.candidates()?;
        found.extend(current.candidates()?);
        if let Some(GraceHint::Takeover { node }) = hint {
            found.extend(load_map(store, &Self::current_object(node))?.candidates()?);
        }

        store_map(store, &old_name, &current)?;
        store_map(store, &current_name, &RecoveryMap::default())?;

        let found = merge_candidates(found);
        tracing::info!(node = %self.node, candidates = found.len(), "grace recovery loaded");
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
        let _guard = self.write.lock().expect("kv recovery lock poisoned");
        self.store.remove_object(&Self::old_object(&self.node))?;
        self.candidates
            .lock()
            .expect("recovery candidates lock poisoned")
            .clear();
        Ok(())
    }
}
