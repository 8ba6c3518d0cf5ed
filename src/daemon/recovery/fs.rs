//! Directory-tree recovery backend.
//!
//! Layout under `<root>/<node>/`:
//!
//! ```text
//! v4recov/<owner-hex>/            client confirmed since this boot
//! v4recov/<owner-hex>/rev.<fh>    handle revoked from that client
//! v4old/...                       same shape, previous boot
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{GraceHint, ReclaimCandidate, RecoveryBackend, RecoveryError, merge_candidates};
use crate::core::{ClientOwner, FileHandle, NodeId};

const CURRENT_DIR: &str = "v4recov";
const OLD_DIR: &str = "v4old";
const REVOKED_PREFIX: &str = "rev.";

pub struct FsRecovery {
    root: PathBuf,
    node: NodeId,
    candidates: Mutex<Vec<ReclaimCandidate>>,
}

impl FsRecovery {
    pub fn open(root: &Path, node: NodeId) -> Result<Self, RecoveryError> {
        let recovery = Self {
            root: root.to_path_buf(),
            node,
            candidates: Mutex::new(Vec::new()),
        };
        ensure_dir(&recovery.current_dir())?;
        ensure_dir(&recovery.old_dir())?;
        Ok(recovery)
    }

    fn node_dir(&self, node: &NodeId) -> PathBuf {
        self.root.join(node.as_str())
    }

    fn current_dir(&self) -> PathBuf {
        self.node_dir(&self.node).join(CURRENT_DIR)
    }

    fn old_dir(&self) -> PathBuf {
        self.node_dir(&self.node).join(OLD_DIR)
    }

    fn client_dir(&self, owner: &ClientOwner) -> PathBuf {
        self.current_dir().join(owner.recovery_key())
    }
}

impl RecoveryBackend for FsRecovery {
    fn name(&self) -> &'static str {
        "fs"
    }

    fn record_client(&self, owner: &ClientOwner) -> Result<(), RecoveryError> {
        ensure_dir(&self.client_dir(owner))?;
        tracing::debug!(client = %owner, node = %self.node, "recorded client");
        Ok(())
    }

    fn remove_client(&self, owner: &ClientOwner) -> Result<(), RecoveryError> {
        remove_tree(&self.client_dir(owner))
    }

    fn record_revoked_handle(
        &self,
        owner: &ClientOwner,
        handle: &FileHandle,
    ) -> Result<(), RecoveryError> {
        let dir = self.client_dir(owner);
        ensure_dir(&dir)?;
        let path = dir.join(format!("{REVOKED_PREFIX}{}", handle.to_hex()));
        fs::write(&path, b"").map_err(|e| RecoveryError::io(&path, e))
    }

    fn begin_grace(&self, hint: Option<&GraceHint>) -> Result<(), RecoveryError> {
        let old_dir = self.old_dir();
        let current_dir = self.current_dir();
        let mut found = Vec::new();

        for (path, candidate) in read_generation(&old_dir)? {
            found.push(candidate);
            remove_tree(&path)?;
        }
        for (path, candidate) in read_generation(&current_dir)? {
            let Some(name) = path.file_name() else {
                continue;
            };
            let target = old_dir.join(name);
            fs::rename(&path, &target).map_err(|e| RecoveryError::io(&path, e))?;
            found.push(candidate);
        }
        if let Some(GraceHint::Takeover { node }) = hint {
            let peer_current = self.node_dir(node).join(CURRENT_DIR);
            for (_, candidate) in read_generation(&peer_current)? {
                found.push(candidate);
            }
        }

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
        for candidate in candidates {
            visit(candidate);
        }
        Ok(())
    }

    fn end_grace(&self) -> Result<(), RecoveryError> {
        let old_dir = self.old_dir();
        remove_tree(&old_dir)?;
        ensure_dir(&old_dir)?;
        self.candidates
            .lock()
            .expect("recovery candidates lock poisoned")
            .clear();
        Ok(())
    }
}

fn read_generation(dir: &Path) -> Result<Vec<(PathBuf, ReclaimCandidate)>, RecoveryError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(RecoveryError::io(dir, e)),
    };
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| RecoveryError::io(dir, e))?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        let owner = match ClientOwner::from_recovery_key(name) {
            Ok(owner) => owner,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "skipping unreadable client record");
                continue;
            }
        };
        let mut revoked = Vec::new();
        for file in fs::read_dir(&path).map_err(|e| RecoveryError::io(&path, e))? {
            let file = file.map_err(|e| RecoveryError::io(&path, e))?;
            let file_name = file.file_name();
            let Some(hex) = file_name
                .to_str()
                .and_then(|name| name.strip_prefix(REVOKED_PREFIX))
            else {
                continue;
            };
            revoked.push(FileHandle::from_hex(hex)?);
        }
        out.push((path, ReclaimCandidate { owner, revoked }));
    }
    Ok(out)
}

fn ensure_dir(path: &Path) -> Result<(), RecoveryError> {
    fs::create_dir_all(path).map_err(|e| RecoveryError::io(path, e))
}

fn remove_tree(path: &Path) -> Result<(), RecoveryError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(RecoveryError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    fn owner(name: &str) -> ClientOwner {
        ClientOwner::new(name.as_bytes().to_vec()).unwrap()
    }

    fn candidates(backend: &FsRecovery) -> Vec<ReclaimCandidate> {
        let mut out = Vec::new();
        backend
            .enumerate_reclaim_candidates(&mut |candidate| out.push(candidate))
            .unwrap();
        out
    }

    #[test]
    fn grace_promotes_current_and_drops_old() {
        let temp = TempDir::new().unwrap();
        let backend = FsRecovery::open(temp.path(), NodeId::numbered(0)).unwrap();
        backend.record_client(&owner("a")).unwrap();
        backend.record_client(&owner("b")).unwrap();
        backend.remove_client(&owner("b")).unwrap();

        backend.begin_grace(None).unwrap();
        let found = candidates(&backend);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].owner, owner("a"));
        assert!(backend.old_dir().join(owner("a").recovery_key()).exists());
        assert!(!backend.client_dir(&owner("a")).exists());

        // A second restart without reclaim still offers the old record once.
        backend.begin_grace(None).unwrap();
        assert_eq!(candidates(&backend).len(), 1);
        backend.begin_grace(None).unwrap();
        assert!(candidates(&backend).is_empty());
    }

    #[test]
    fn revoked_handles_travel_with_candidates() {
        let temp = TempDir::new().unwrap();
        let backend = FsRecovery::open(temp.path(), NodeId::numbered(0)).unwrap();
        let handle = FileHandle::new(vec![0xab, 0xcd]).unwrap();
        backend.record_client(&owner("a")).unwrap();
        backend.record_revoked_handle(&owner("a"), &handle).unwrap();
        backend.begin_grace(None).unwrap();
        assert_eq!(candidates(&backend)[0].revoked, vec![handle]);
        backend.end_grace().unwrap();
        assert!(candidates(&backend).is_empty());
        assert!(fs::read_dir(backend.old_dir()).unwrap().next().is_none());
    }

    #[test]
    fn takeover_reads_peer_records() {
        let temp = TempDir::new().unwrap();
        let peer = FsRecovery::open(temp.path(), NodeId::numbered(1)).unwrap();
        peer.record_client(&owner("peer-client")).unwrap();

        let backend = FsRecovery::open(temp.path(), NodeId::numbered(0)).unwrap();
        backend
            .begin_grace(Some(&GraceHint::Takeover {
                node: NodeId::numbered(1),
            }))
            .unwrap();
        let found = candidates(&backend);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].owner, owner("peer-client"));
    }
}
