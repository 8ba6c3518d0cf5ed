//! Layer 1: Identity atoms
//!
//! NodeId: cluster member name
//! ConnectionId: transport association identity (the DRC "epoch")
//! ClientOwner + Verifier: the client's self-chosen identity
//! ClientId: server-assigned lease identifier
//! FileHandle: opaque handle recorded on delegation revoke

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::{CoreError, InvalidId};

/// Cluster node name.
///
/// Used verbatim as a key in recovery objects, so it must be non-empty and free of
/// path separators and the `:` used in per-epoch object names.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    pub fn new(s: impl Into<String>) -> Result<Self, CoreError> {
        let s = s.into();
        if s.is_empty() {
            return Err(InvalidId::Node {
                raw: s,
                reason: "empty".into(),
            }
            .into());
        }
        if s.chars().any(|c| c == '/' || c == ':' || c.is_whitespace()) {
            return Err(InvalidId::Node {
                raw: s,
                reason: "must not contain '/', ':' or whitespace".into(),
            }
            .into());
        }
        Ok(Self(s))
    }

    /// Conventional name for a numbered node (`node<N>`).
    pub fn numbered(n: u32) -> Self {
        Self(format!("node{n}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for NodeId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NodeId> for String {
    fn from(value: NodeId) -> Self {
        value.0
    }
}

impl FromStr for NodeId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:?})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one transport association.
///
/// Allocated from a process-wide counter; never reused within a boot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Opaque owner string a client presents in its initial exchange.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientOwner(Vec<u8>);

/// Upper bound from the NFSv4 `NFS4_OPAQUE_LIMIT`.
pub const MAX_OWNER_BYTES: usize = 1024;

impl ClientOwner {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, CoreError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(InvalidId::ClientOwner {
                raw: String::new(),
                reason: "empty".into(),
            }
            .into());
        }
        if bytes.len() > MAX_OWNER_BYTES {
            return Err(InvalidId::ClientOwner {
                raw: hex::encode(&bytes[..16]),
                reason: format!("{} bytes exceeds {MAX_OWNER_BYTES}", bytes.len()),
            }
            .into());
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Stable key used by recovery backends.
    pub fn recovery_key(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn from_recovery_key(key: &str) -> Result<Self, CoreError> {
        let bytes = hex::decode(key).map_err(|e| InvalidId::ClientOwner {
            raw: key.to_string(),
            reason: e.to_string(),
        })?;
        Self::new(bytes)
    }
}

impl fmt::Debug for ClientOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) if s.chars().all(|c| !c.is_control()) => write!(f, "ClientOwner({s:?})"),
            _ => write!(f, "ClientOwner(0x{})", hex::encode(&self.0)),
        }
    }
}

impl fmt::Display for ClientOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) if s.chars().all(|c| !c.is_control()) => f.write_str(s),
            _ => write!(f, "0x{}", hex::encode(&self.0)),
        }
    }
}

/// Client boot verifier. A new value means the client rebooted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Verifier(pub [u8; 8]);

/// Server-assigned client id: boot epoch in the high half, counter in the low half.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(u64);

impl ClientId {
    pub fn new(epoch: u32, counter: u32) -> Self {
        Self(((epoch as u64) << 32) | counter as u64)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn epoch(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn counter(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({:#018x})", self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Opaque file handle (at most 128 bytes for NFSv4).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileHandle(Vec<u8>);

pub const MAX_FILE_HANDLE_BYTES: usize = 128;

impl FileHandle {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, CoreError> {
        let bytes = bytes.into();
        if bytes.is_empty() || bytes.len() > MAX_FILE_HANDLE_BYTES {
            return Err(InvalidId::FileHandle {
                raw: hex::encode(&bytes),
                reason: format!("length {} not in 1..={MAX_FILE_HANDLE_BYTES}", bytes.len()),
            }
            .into());
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn from_hex(raw: &str) -> Result<Self, CoreError> {
        let bytes = hex::decode(raw).map_err(|e| InvalidId::FileHandle {
            raw: raw.to_string(),
            reason: e.to_string(),
        })?;
        Self::new(bytes)
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileHandle({})", hex::encode(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_rejects_separators() {
        assert!(NodeId::new("node1").is_ok());
        assert!(NodeId::new("").is_err());
        assert!(NodeId::new("a/b").is_err());
        assert!(NodeId::new("rec:1").is_err());
        assert_eq!(NodeId::numbered(3).as_str(), "node3");
    }

    #[test]
    fn client_owner_recovery_key_roundtrip() {
        let owner = ClientOwner::new(b"linux-client\x00\x01".to_vec()).unwrap();
        let key = owner.recovery_key();
        assert_eq!(ClientOwner::from_recovery_key(&key).unwrap(), owner);
        assert!(format!("{owner:?}").starts_with("ClientOwner(0x"));
    }

    #[test]
    fn client_owner_bounds() {
        assert!(ClientOwner::new(Vec::new()).is_err());
        assert!(ClientOwner::new(vec![b'a'; MAX_OWNER_BYTES + 1]).is_err());
    }

    #[test]
    fn client_id_packs_epoch_and_counter() {
        let id = ClientId::new(0x5eed_0001, 42);
        assert_eq!(id.epoch(), 0x5eed_0001);
        assert_eq!(id.counter(), 42);
        assert_eq!(ClientId::from_raw(id.raw()), id);
    }

    #[test]
    fn file_handle_hex_roundtrip() {
        let fh = FileHandle::new(vec![1, 2, 3, 0xff]).unwrap();
        assert_eq!(FileHandle::from_hex(&fh.to_hex()).unwrap(), fh);
        assert!(FileHandle::new(Vec::new()).is_err());
    }
}
