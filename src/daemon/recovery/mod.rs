//! Durable client records for grace-period reclaim.
//!
//! Each node keeps two generations of client records: current (clients
//! confirmed since this boot) and old (clients from the previous boot, which
//! may reclaim). Starting a grace period turns both into reclaim candidates
//! and demotes current to old; ending it discards old.

pub mod cluster;
pub mod fs;
pub mod kv;

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{ClientOwner, CoreError, FileHandle, NodeId};
use crate::{Effect, Transience};

pub use cluster::{
    ClusterRecovery, ClusterStore, FileClusterStore, GraceDb, GraceDbClient, MemClusterStore,
};
pub use fs::FsRecovery;
pub use kv::{FileKvStore, KvRecovery, KvStore};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GraceHint {
    /// Take over a failed peer's clients in addition to our own.
    Takeover { node: NodeId },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReclaimCandidate {
    pub owner: ClientOwner,
    pub revoked: Vec<FileHandle>,
}

pub trait RecoveryBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn record_client(&self, owner: &ClientOwner) -> Result<(), RecoveryError>;

    fn remove_client(&self, owner: &ClientOwner) -> Result<(), RecoveryError>;

    fn record_revoked_handle(
        &self,
        owner: &ClientOwner,
        handle: &FileHandle,
    ) -> Result<(), RecoveryError>;

    /// Durably record that a grace period started and collect candidates.
    fn begin_grace(&self, hint: Option<&GraceHint>) -> Result<(), RecoveryError>;

    /// Visit the candidates collected by the last `begin_grace`.
    fn enumerate_reclaim_candidates(
        &self,
        visit: &mut dyn FnMut(ReclaimCandidate),
    ) -> Result<(), RecoveryError>;

    fn end_grace(&self) -> Result<(), RecoveryError>;

    fn set_enforcing(&self) -> Result<(), RecoveryError> {
        Ok(())
    }

    fn is_enforcing(&self) -> Result<bool, RecoveryError> {
        Ok(true)
    }

    /// Ask to leave grace. Clustered backends refuse until every member is
    /// done.
    fn try_lift_grace(&self) -> Result<bool, RecoveryError> {
        Ok(true)
    }

    /// True when shared state asks this node to enter grace.
    fn maybe_start_grace(&self) -> Result<bool, RecoveryError> {
        Ok(false)
    }

    /// Change notifications for shared grace state, if the backend has any.
    fn watch(&self) -> Option<crossbeam::channel::Receiver<()>> {
        None
    }
}

pub type SharedRecovery = Arc<dyn RecoveryBackend>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryKind {
    #[default]
    Fs,
    Kv,
    Cluster,
}

/// Open the configured backend rooted at `root`.
pub fn open_backend(
    kind: RecoveryKind,
    root: &Path,
    node: &NodeId,
    cluster_db: &Path,
) -> Result<SharedRecovery, RecoveryError> {
    let backend: SharedRecovery = match kind {
        RecoveryKind::Fs => Arc::new(FsRecovery::open(root, node.clone())?),
        RecoveryKind::Kv => Arc::new(KvRecovery::new(
            Arc::new(FileKvStore::open(root)?),
            node.clone(),
        )),
        RecoveryKind::Cluster => {
            let store: Arc<dyn ClusterStore> = Arc::new(FileClusterStore::open(cluster_db)?);
            Arc::new(ClusterRecovery::new(store, node.clone())?)
        }
    };
    tracing::info!(backend = backend.name(), root = %root.display(), node = %node, "recovery backend ready");
    Ok(backend)
}

/// Client records of one generation, keyed by owner recovery key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecoveryMap {
    clients: BTreeMap<String, ClientEntry>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientEntry {
    pub revoked: BTreeSet<String>,
}

impl RecoveryMap {
    pub fn decode(object: &str, bytes: &[u8]) -> Result<Self, RecoveryError> {
        serde_json::from_slice(bytes).map_err(|source| RecoveryError::Serde {
            object: object.to_string(),
            source,
        })
    }

    pub fn encode(&self, object: &str) -> Result<Vec<u8>, RecoveryError> {
        serde_json::to_vec_pretty(self).map_err(|source| RecoveryError::Serde {
            object: object.to_string(),
            source,
        })
    }

    pub fn insert(&mut self, owner: &ClientOwner) {
        self.clients.entry(owner.recovery_key()).or_default();
    }

    pub fn remove(&mut self, owner: &ClientOwner) -> bool {
        self.clients.remove(&owner.recovery_key()).is_some()
    }

    pub fn revoke(&mut self, owner: &ClientOwner, handle: &FileHandle) {
        self.clients
            .entry(owner.recovery_key())
            .or_default()
            .revoked
            .insert(handle.to_hex());
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn candidates(&self) -> Result<Vec<ReclaimCandidate>, RecoveryError> {
        self.clients
            .iter()
            .map(|(key, entry)| {
                let owner = ClientOwner::from_recovery_key(key)?;
                let revoked = entry
                    .revoked
                    .iter()
                    .map(|hex| FileHandle::from_hex(hex))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ReclaimCandidate { owner, revoked })
            })
            .collect()
    }
}

/// Merge candidates for the same owner, unioning revoked handles.
pub(crate) fn merge_candidates(candidates: Vec<ReclaimCandidate>) -> Vec<ReclaimCandidate> {
    let mut merged: BTreeMap<ClientOwner, BTreeSet<FileHandle>> = BTreeMap::new();
    for candidate in candidates {
        merged
            .entry(candidate.owner)
            .or_default()
            .extend(candidate.revoked);
    }
    merged
        .into_iter()
        .map(|(owner, revoked)| ReclaimCandidate {
            owner,
            revoked: revoked.into_iter().collect(),
        })
        .collect()
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RecoveryError {
    #[error("recovery io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("recovery object {object} is malformed: {source}")]
    Serde {
        object: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid recovery record: {0}")]
    InvalidRecord(#[from] CoreError),
    #[error("node {node} is not a member of the grace database")]
    NotMember { node: NodeId },
    #[error("node {node} is already a member of the grace database")]
    AlreadyMember { node: NodeId },
    #[error("grace database update contended after {attempts} attempts")]
    Contended { attempts: u32 },
    #[error("failed to lock {path:?}: {errno}")]
    Lock { path: PathBuf, errno: nix::errno::Errno },
}

impl RecoveryError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        RecoveryError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn transience(&self) -> Transience {
        match self {
            RecoveryError::Io { .. } => Transience::Unknown,
            RecoveryError::Contended { .. } | RecoveryError::Lock { .. } => Transience::Retryable,
            RecoveryError::Serde { .. }
            | RecoveryError::InvalidRecord(_)
            | RecoveryError::NotMember { .. }
            | RecoveryError::AlreadyMember { .. } => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            RecoveryError::Io { .. } => Effect::Unknown,
            _ => Effect::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovery_map_round_trips_candidates() {
        let owner = ClientOwner::new(b"client-a".to_vec()).unwrap();
        let handle = FileHandle::new(vec![1, 2, 3]).unwrap();
        let mut map = RecoveryMap::default();
        map.insert(&owner);
        map.revoke(&owner, &handle);
        let bytes = map.encode("test").unwrap();
        let decoded = RecoveryMap::decode("test", &bytes).unwrap();
        assert_eq!(
            decoded.candidates().unwrap(),
            vec![ReclaimCandidate {
                owner,
                revoked: vec![handle],
            }]
        );
    }

    #[test]
    fn merge_unions_revoked_handles() {
        let owner = ClientOwner::new(b"c".to_vec()).unwrap();
        let a = FileHandle::new(vec![1]).unwrap();
        let b = FileHandle::new(vec![2]).unwrap();
        let merged = merge_candidates(vec![
            ReclaimCandidate {
                owner: owner.clone(),
                revoked: vec![a.clone()],
            },
            ReclaimCandidate {
                owner: owner.clone(),
                revoked: vec![b.clone(), a.clone()],
            },
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].revoked, vec![a, b]);
    }
}
