//! ONC RPC v2 call header parsing and reply encoding (RFC 5531).

use bytes::{BufMut, Bytes, BytesMut};

use super::ProtocolError;

pub const RPC_VERSION: u32 = 2;
pub const MAX_AUTH_BYTES: usize = 400;

const MSG_CALL: u32 = 0;
const MSG_REPLY: u32 = 1;
const MSG_ACCEPTED: u32 = 0;
const MSG_DENIED: u32 = 1;

pub const SUCCESS: u32 = 0;
pub const PROG_UNAVAIL: u32 = 1;
pub const PROG_MISMATCH: u32 = 2;
pub const PROC_UNAVAIL: u32 = 3;
pub const GARBAGE_ARGS: u32 = 4;
pub const SYSTEM_ERR: u32 = 5;

pub const RPC_MISMATCH: u32 = 0;
pub const AUTH_ERROR: u32 = 1;
pub const AUTH_BADCRED: u32 = 1;

pub const AUTH_NONE: u32 = 0;
pub const AUTH_SYS: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpaqueAuth {
    pub flavor: u32,
    pub body: Bytes,
}

impl OpaqueAuth {
    pub fn none() -> Self {
        Self {
            flavor: AUTH_NONE,
            body: Bytes::new(),
        }
    }

    pub fn sys(auth: &AuthSys) -> Self {
        let mut body = BytesMut::new();
        body.put_u32(auth.stamp);
        put_opaque(&mut body, auth.machine.as_bytes());
        body.put_u32(auth.uid);
        body.put_u32(auth.gid);
        body.put_u32(auth.gids.len() as u32);
        for gid in &auth.gids {
            body.put_u32(*gid);
        }
        Self {
            flavor: AUTH_SYS,
            body: body.freeze(),
        }
    }

    /// Decode an AUTH_SYS body; `None` for other flavors or malformed bodies.
    pub fn auth_sys(&self) -> Option<AuthSys> {
        if self.flavor != AUTH_SYS {
            return None;
        }
        let mut xdr = XdrReader::new(&self.body);
        let stamp = xdr.u32()?;
        let machine = String::from_utf8(xdr.opaque(255)?.to_vec()).ok()?;
        let uid = xdr.u32()?;
        let gid = xdr.u32()?;
        let count = xdr.u32()? as usize;
        if count > 16 {
            return None;
        }
        let gids = (0..count).map(|_| xdr.u32()).collect::<Option<Vec<_>>>()?;
        Some(AuthSys {
            stamp,
            machine,
            uid,
            gid,
            gids,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthSys {
    pub stamp: u32,
    pub machine: String,
    pub uid: u32,
    pub gid: u32,
    pub gids: Vec<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallHeader {
    pub xid: u32,
    pub prog: u32,
    pub vers: u32,
    pub proc_num: u32,
    pub cred: OpaqueAuth,
    pub verf: OpaqueAuth,
    /// Offset of the procedure arguments within the message.
    pub body_offset: usize,
}

impl CallHeader {
    pub fn parse(msg: &Bytes) -> Result<Self, ProtocolError> {
        let mut xdr = XdrReader::new(msg);
        let xid = xdr.u32().ok_or(ProtocolError::Truncated {
            what: "rpc xid",
            xid: None,
        })?;
        let truncated = |what| ProtocolError::Truncated {
            what,
            xid: Some(xid),
        };
        let msg_type = xdr.u32().ok_or_else(|| truncated("rpc msg_type"))?;
        if msg_type != MSG_CALL {
            return Err(ProtocolError::NotCall { xid, msg_type });
        }
        let rpcvers = xdr.u32().ok_or_else(|| truncated("rpc version"))?;
        if rpcvers != RPC_VERSION {
            return Err(ProtocolError::RpcVersion { xid, got: rpcvers });
        }
        let prog = xdr.u32().ok_or_else(|| truncated("rpc program"))?;
        let vers = xdr.u32().ok_or_else(|| truncated("rpc program version"))?;
        let proc_num = xdr.u32().ok_or_else(|| truncated("rpc procedure"))?;
        let cred = read_auth(&mut xdr, msg, xid, "rpc credential")?;
        let verf = read_auth(&mut xdr, msg, xid, "rpc verifier")?;
        Ok(Self {
            xid,
            prog,
            vers,
            proc_num,
            cred,
            verf,
            body_offset: xdr.position(),
        })
    }

    pub fn args(&self, msg: &Bytes) -> Bytes {
        msg.slice(self.body_offset.min(msg.len())..)
    }
}

fn read_auth(
    xdr: &mut XdrReader<'_>,
    msg: &Bytes,
    xid: u32,
    what: &'static str,
) -> Result<OpaqueAuth, ProtocolError> {
    let truncated = ProtocolError::Truncated {
        what,
        xid: Some(xid),
    };
    let flavor = xdr.u32().ok_or(truncated.clone())?;
    let len = xdr.peek_u32().ok_or(truncated.clone())? as usize;
    if len > MAX_AUTH_BYTES {
        return Err(ProtocolError::AuthTooLong { xid, len });
    }
    let start = xdr.position() + 4;
    xdr.opaque(MAX_AUTH_BYTES).ok_or(truncated)?;
    Ok(OpaqueAuth {
        flavor,
        body: msg.slice(start..start + len),
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyBody<'a> {
    Success(&'a [u8]),
    ProgUnavail,
    ProgMismatch { low: u32, high: u32 },
    ProcUnavail,
    GarbageArgs,
    SystemErr,
    RpcMismatch,
    AuthError { stat: u32 },
}

pub fn encode_reply(xid: u32, body: ReplyBody<'_>) -> Bytes {
    let mut out = BytesMut::with_capacity(24);
    out.put_u32(xid);
    out.put_u32(MSG_REPLY);
    match body {
        ReplyBody::RpcMismatch => {
            out.put_u32(MSG_DENIED);
            out.put_u32(RPC_MISMATCH);
            out.put_u32(RPC_VERSION);
            out.put_u32(RPC_VERSION);
        }
        ReplyBody::AuthError { stat } => {
            out.put_u32(MSG_DENIED);
            out.put_u32(AUTH_ERROR);
            out.put_u32(stat);
        }
        accepted => {
            out.put_u32(MSG_ACCEPTED);
            out.put_u32(AUTH_NONE);
            out.put_u32(0);
            match accepted {
                ReplyBody::Success(results) => {
                    out.put_u32(SUCCESS);
                    out.extend_from_slice(results);
                }
                ReplyBody::ProgUnavail => out.put_u32(PROG_UNAVAIL),
                ReplyBody::ProgMismatch { low, high } => {
                    out.put_u32(PROG_MISMATCH);
                    out.put_u32(low);
                    out.put_u32(high);
                }
                ReplyBody::ProcUnavail => out.put_u32(PROC_UNAVAIL),
                ReplyBody::GarbageArgs => out.put_u32(GARBAGE_ARGS),
                ReplyBody::SystemErr
                | ReplyBody::RpcMismatch
                | ReplyBody::AuthError { .. } => out.put_u32(SYSTEM_ERR),
            }
        }
    }
    out.freeze()
}

/// Build a call message; the client side of [`CallHeader::parse`].
pub fn encode_call(
    xid: u32,
    prog: u32,
    vers: u32,
    proc_num: u32,
    cred: &OpaqueAuth,
    args: &[u8],
) -> Bytes {
    let mut out = BytesMut::with_capacity(40 + cred.body.len() + args.len());
    out.put_u32(xid);
    out.put_u32(MSG_CALL);
    out.put_u32(RPC_VERSION);
    out.put_u32(prog);
    out.put_u32(vers);
    out.put_u32(proc_num);
    out.put_u32(cred.flavor);
    put_opaque(&mut out, &cred.body);
    out.put_u32(AUTH_NONE);
    out.put_u32(0);
    out.extend_from_slice(args);
    out.freeze()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplyStat {
    Accepted { stat: u32, results: Bytes },
    Denied { stat: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyView {
    pub xid: u32,
    pub stat: ReplyStat,
}

impl ReplyView {
    pub fn parse(msg: &Bytes) -> Result<Self, ProtocolError> {
        let mut xdr = XdrReader::new(msg);
        let truncated = |xid| ProtocolError::Truncated {
            what: "rpc reply",
            xid,
        };
        let xid = xdr.u32().ok_or(truncated(None))?;
        let msg_type = xdr.u32().ok_or(truncated(Some(xid)))?;
        if msg_type != MSG_REPLY {
            return Err(truncated(Some(xid)));
        }
        let stat = match xdr.u32().ok_or(truncated(Some(xid)))? {
            MSG_ACCEPTED => {
                xdr.u32().ok_or(truncated(Some(xid)))?;
                xdr.opaque(MAX_AUTH_BYTES).ok_or(truncated(Some(xid)))?;
                let stat = xdr.u32().ok_or(truncated(Some(xid)))?;
                ReplyStat::Accepted {
                    stat,
                    results: msg.slice(xdr.position()..),
                }
            }
            _ => ReplyStat::Denied {
                stat: xdr.u32().ok_or(truncated(Some(xid)))?,
            },
        };
        Ok(Self { xid, stat })
    }
}

fn put_opaque(out: &mut BytesMut, data: &[u8]) {
    out.put_u32(data.len() as u32);
    out.extend_from_slice(data);
    let pad = (4 - data.len() % 4) % 4;
    out.put_bytes(0, pad);
}

/// Big-endian XDR cursor.
pub(crate) struct XdrReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> XdrReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn peek_u32(&self) -> Option<u32> {
        let raw = self.buf.get(self.pos..self.pos + 4)?;
        Some(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub(crate) fn u32(&mut self) -> Option<u32> {
        let value = self.peek_u32()?;
        self.pos += 4;
        Some(value)
    }

    pub(crate) fn opaque(&mut self, max: usize) -> Option<&'a [u8]> {
        let len = self.peek_u32()? as usize;
        if len > max {
            return None;
        }
        let start = self.pos + 4;
        let padded = len + (4 - len % 4) % 4;
        let data = self.buf.get(start..start + len)?;
        if self.buf.len() < start + padded {
            return None;
        }
        self.pos = start + padded;
        Some(data)
    }
}
