//! Wire headers the dispatch core understands.
//!
//! Only the ONC RPC call header and the 9P message header are decoded here;
//! operation arguments stay opaque and belong to the interpreter.

pub mod ninep;
pub mod rpc;

use thiserror::Error;

use crate::{Effect, Transience};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("truncated {what} (xid {xid:?})")]
    Truncated {
        what: &'static str,
        xid: Option<u32>,
    },
    #[error("message {xid:#x} is not a call (msg_type {msg_type})")]
    NotCall { xid: u32, msg_type: u32 },
    #[error("rpc version {got} unsupported (xid {xid:#x})")]
    RpcVersion { xid: u32, got: u32 },
    #[error("auth body of {len} bytes exceeds limit (xid {xid:#x})")]
    AuthTooLong { xid: u32, len: usize },
    #[error("9P message of {len} bytes is shorter than its header")]
    NinePTooShort { len: usize },
    #[error("9P size {declared} disagrees with {actual} bytes received (tag {tag})")]
    NinePLengthMismatch {
        declared: u32,
        actual: usize,
        msg_type: u8,
        tag: u16,
    },
    #[error("malformed 9P {msg_type} body (tag {tag})")]
    NinePBody { msg_type: u8, tag: u16 },
}

impl ProtocolError {
    /// The request's xid when enough of the header survived to answer it.
    pub fn xid(&self) -> Option<u32> {
        match self {
            ProtocolError::Truncated { xid, .. } => *xid,
            ProtocolError::NotCall { xid, .. }
            | ProtocolError::RpcVersion { xid, .. }
            | ProtocolError::AuthTooLong { xid, .. } => Some(*xid),
            _ => None,
        }
    }

    /// The 9P tag when the header was readable.
    pub fn tag(&self) -> Option<u16> {
        match self {
            ProtocolError::NinePLengthMismatch { tag, .. }
            | ProtocolError::NinePBody { tag, .. } => Some(*tag),
            _ => None,
        }
    }

    pub fn transience(&self) -> Transience {
        Transience::Permanent
    }

    pub fn effect(&self) -> Effect {
        Effect::None
    }
}
