//! Request dispatch: parse, deduplicate, execute, reply.
//!
//! The reader thread does everything up to the DRC decision and then hands
//! the request to the worker fridge. A worker gates it on the grace period,
//! runs the handler, sends the reply and only then records the completion,
//! so a reply that never left is never replayed.

use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::connection::{Connection, InflightGuard};
use super::drc::{Drc, RequestIdentity, Resume, StartOutcome, TrackedEntry, cacheable};
use super::flush::{FlushHook, FlushOutcome};
use super::fridge::{Fridge, FridgeError};
use super::interp::{GraceStatus, OpContext, OpHandler, OpOutcome, OpTable, RequestId, RpcLookup};
use super::metrics;
use super::proto::ProtocolError;
use super::proto::ninep::{self, NinePHeader};
use super::proto::rpc::{self, CallHeader, ReplyBody};
use super::state::{Admission, ClientTable, GraceManager};
use super::transport::Inbound;

/// How long a queued duplicate waits for its original before giving up.
pub const DEFAULT_DUP_WAIT: Duration = Duration::from_secs(30);

pub struct Dispatcher {
    ops: Arc<OpTable>,
    clients: Arc<ClientTable>,
    grace: Arc<GraceManager>,
    workers: Fridge,
    dup_wait: Duration,
}

/// A call that passed header checks and has a handler.
struct RpcCall {
    header: CallHeader,
    args: Bytes,
    peer: SocketAddr,
    handler: Arc<dyn OpHandler>,
    grace: GraceStatus,
}

impl Dispatcher {
    pub fn new(
        ops: Arc<OpTable>,
        clients: Arc<ClientTable>,
        grace: Arc<GraceManager>,
        workers: Fridge,
    ) -> Self {
        Self {
            ops,
            clients,
            grace,
            workers,
            dup_wait: DEFAULT_DUP_WAIT,
        }
    }

    pub fn with_dup_wait(mut self, dup_wait: Duration) -> Self {
        self.dup_wait = dup_wait;
        self
    }

    pub fn ops(&self) -> &Arc<OpTable> {
        &self.ops
    }

    pub fn clients(&self) -> &Arc<ClientTable> {
        &self.clients
    }

    pub fn grace(&self) -> &Arc<GraceManager> {
        &self.grace
    }

    pub fn workers(&self) -> &Fridge {
        &self.workers
    }

    /// Take one inbound message from `conn`'s reader.
    pub fn dispatch(self: &Arc<Self>, conn: &Arc<Connection>, inbound: Inbound) {
        let guard = conn.begin_request();
        if conn.kind().is_ninep() {
            self.dispatch_ninep(guard, inbound);
        } else {
            self.dispatch_rpc(guard, inbound);
        }
    }

    // =========================================================================
    // ONC RPC
    // =========================================================================

    fn dispatch_rpc(self: &Arc<Self>, guard: InflightGuard, inbound: Inbound) {
        let conn = guard.connection().clone();
        let header = match CallHeader::parse(&inbound.bytes) {
            Ok(header) => header,
            Err(err) => {
                self.reject_rpc_header(&conn, inbound.peer, &err);
                return;
            }
        };
        let (handler, grace) = match self.ops.lookup_rpc(header.prog, header.vers, header.proc_num) {
            RpcLookup::Found { handler, grace } => (handler.clone(), grace),
            RpcLookup::ProgUnavail => {
                send_rpc(&conn, inbound.peer, header.xid, ReplyBody::ProgUnavail);
                return;
            }
            RpcLookup::ProgMismatch { low, high } => {
                send_rpc(&conn, inbound.peer, header.xid, ReplyBody::ProgMismatch { low, high });
                return;
            }
            RpcLookup::ProcUnavail => {
                send_rpc(&conn, inbound.peer, header.xid, ReplyBody::ProcUnavail);
                return;
            }
        };
        let args = header.args(&inbound.bytes);
        let cached = cacheable(handler.flags().cacheable, &header, &args, handler.cacheable(&args));
        let call = RpcCall {
            header,
            args,
            peer: inbound.peer,
            handler,
            grace,
        };
        let drc = if cached { conn.drc() } else { None };
        match drc {
            Some(drc) => self.start_tracked(guard, call, drc),
            None => self.submit_rpc(guard, call, None),
        }
    }

    fn reject_rpc_header(&self, conn: &Connection, peer: SocketAddr, err: &ProtocolError) {
        let body = match err {
            ProtocolError::RpcVersion { .. } => Some(ReplyBody::RpcMismatch),
            ProtocolError::AuthTooLong { .. } => Some(ReplyBody::AuthError {
                stat: rpc::AUTH_BADCRED,
            }),
            ProtocolError::Truncated { .. } => Some(ReplyBody::GarbageArgs),
            _ => None,
        };
        match (err.xid(), body) {
            (Some(xid), Some(body)) => {
                tracing::debug!(conn = %conn.id(), xid, error = %err, "rejecting malformed call");
                send_rpc(conn, peer, xid, body);
            }
            _ => tracing::warn!(conn = %conn.id(), %peer, error = %err, "dropping unanswerable message"),
        }
    }

    fn start_tracked(self: &Arc<Self>, guard: InflightGuard, call: RpcCall, drc: Arc<Drc>) {
        let conn = guard.connection().clone();
        let fingerprint = drc.fingerprint(call.peer, RequestIdentity::from(&call.header), &call.args);
        match drc.start(fingerprint) {
            Ok(StartOutcome::Execute(token)) => {
                self.submit_rpc(guard, call, Some(TrackedEntry::new(drc, token)))
            }
            Ok(StartOutcome::ReplayCompleted { reply, .. }) => {
                tracing::debug!(conn = %conn.id(), xid = call.header.xid, "replaying cached reply");
                send_bytes(&conn, call.peer, &reply);
            }
            Ok(StartOutcome::AlreadyInProgress(Some(waiter))) => {
                let this = self.clone();
                let dup_wait = self.dup_wait;
                let xid = call.header.xid;
                let queued = self.workers.submit(move |_| match waiter.wait(dup_wait) {
                    Some(Resume::Replay { reply, .. }) => send_bytes(guard.connection(), call.peer, &reply),
                    Some(Resume::Retry) => this.start_tracked(guard, call, drc),
                    None => tracing::debug!(xid, "duplicate gave up waiting for original"),
                });
                if let Err(err) = queued {
                    tracing::warn!(conn = %conn.id(), xid, error = %err, "dropping duplicate");
                }
            }
            Ok(StartOutcome::AlreadyInProgress(None)) => {
                tracing::debug!(conn = %conn.id(), xid = call.header.xid, "duplicate dropped; waiter queue full");
            }
            Err(err) => {
                tracing::error!(conn = %conn.id(), xid = call.header.xid, error = %err, "rejecting call");
                send_rpc(&conn, call.peer, call.header.xid, ReplyBody::SystemErr);
            }
        }
    }

    fn submit_rpc(
        self: &Arc<Self>,
        guard: InflightGuard,
        call: RpcCall,
        tracked: Option<TrackedEntry>,
    ) {
        let this = self.clone();
        let conn = guard.connection().clone();
        let xid = call.header.xid;
        let peer = call.peer;
        // A job dropped unrun takes `tracked` with it, abandoning the entry.
        let submitted = self.workers.submit(move |_| {
            this.execute_rpc(guard, call, tracked);
        });
        if let Err(err) = submitted {
            self.refuse(&conn, xid, &err);
            send_rpc(&conn, peer, xid, ReplyBody::SystemErr);
        }
    }

    fn refuse(&self, conn: &Connection, xid: u32, err: &FridgeError) {
        tracing::error!(conn = %conn.id(), xid, error = %err, "worker pool refused request");
    }

    fn execute_rpc(
        &self,
        guard: InflightGuard,
        call: RpcCall,
        tracked: Option<TrackedEntry>,
    ) {
        let conn = guard.connection();
        let started = Instant::now();
        let xid = call.header.xid;
        let handler = &call.handler;
        let reclaim = handler.is_reclaim(&call.args);
        let owner = reclaim.then(|| handler.reclaim_owner(&call.args)).flatten();
        let admission = Admission {
            mutates_state: handler.flags().mutates_state,
            reclaim,
            owner: owner.as_ref(),
        };

        let (reply, status, keep) = match self.grace.admit(admission) {
            Err(err) => {
                let status = call.grace.for_error(&err);
                tracing::debug!(conn = %conn.id(), xid, op = handler.name(), error = %err, "grace rejected call");
                let outcome = OpOutcome::status_only(status);
                (rpc::encode_reply(xid, ReplyBody::Success(&outcome.body)), status, false)
            }
            Ok(()) => {
                let request = RequestId::Rpc {
                    xid,
                    prog: call.header.prog,
                    vers: call.header.vers,
                    proc_num: call.header.proc_num,
                };
                let mut ctx = OpContext::new(
                    conn,
                    call.peer,
                    request,
                    Some(&call.header.cred),
                    &self.clients,
                    &self.grace,
                );
                let outcome = catch_unwind(AssertUnwindSafe(|| handler.execute(&mut ctx, &call.args)));
                ctx.release_reservations();
                match outcome {
                    Ok(outcome) => (
                        rpc::encode_reply(xid, ReplyBody::Success(&outcome.body)),
                        outcome.status,
                        true,
                    ),
                    Err(_) => {
                        tracing::error!(conn = %conn.id(), xid, op = handler.name(), "handler panicked");
                        (rpc::encode_reply(xid, ReplyBody::SystemErr), rpc::SYSTEM_ERR, false)
                    }
                }
            }
        };

        let sent = conn.send(call.peer, &reply);
        metrics::request_executed(conn.kind().as_str(), started.elapsed());
        match (sent, tracked) {
            (Ok(()), Some(entry)) if keep => entry.finish(status, reply),
            (Ok(()), Some(entry)) => entry.abandon(),
            (Err(err), tracked) => {
                tracing::warn!(conn = %conn.id(), xid, error = %err, "reply send failed");
                if let Some(entry) = tracked {
                    entry.abandon();
                }
            }
            (Ok(()), None) => {}
        }
    }

    // =========================================================================
    // 9P
    // =========================================================================

    fn dispatch_ninep(self: &Arc<Self>, guard: InflightGuard, inbound: Inbound) {
        let conn = guard.connection().clone();
        let seq = conn.next_sequence();
        let header = match NinePHeader::parse(&inbound.bytes) {
            Ok(header) => header,
            Err(err) => {
                let tag = err.tag().unwrap_or(ninep::NOTAG);
                tracing::warn!(conn = %conn.id(), tag, error = %err, "malformed 9P header");
                send_bytes(&conn, inbound.peer, &ninep::encode_rlerror(tag, ninep::EINVAL));
                return;
            }
        };
        let Some(flush) = conn.flush_registry() else {
            tracing::error!(conn = %conn.id(), "9P connection without flush registry");
            return;
        };

        if header.is_flush() {
            let oldtag = match ninep::parse_tflush(&header, &inbound.bytes) {
                Ok(oldtag) => oldtag,
                Err(err) => {
                    tracing::warn!(conn = %conn.id(), tag = header.tag, error = %err, "malformed Tflush");
                    send_bytes(&conn, inbound.peer, &ninep::encode_rlerror(header.tag, ninep::EINVAL));
                    return;
                }
            };
            let peer = inbound.peer;
            let submitted = self.workers.submit(move |_| {
                let conn = guard.connection();
                if let Some(flush) = conn.flush_registry() {
                    match flush.flush(oldtag, seq) {
                        FlushOutcome::Flushed { seq: flushed } => {
                            tracing::debug!(conn = %conn.id(), tag = header.tag, oldtag, flushed, "flush complete");
                        }
                        FlushOutcome::NoMatch => {}
                    }
                }
                send_bytes(conn, peer, &ninep::encode_rflush(header.tag));
            });
            if let Err(err) = submitted {
                tracing::error!(conn = %conn.id(), tag = header.tag, error = %err, "worker pool refused flush");
                send_bytes(&conn, inbound.peer, &ninep::encode_rlerror(header.tag, ninep::EAGAIN));
            }
            return;
        }

        let hook = flush.register(header.tag, seq);
        let Some(handler) = self.ops.lookup_ninep(header.msg_type).cloned() else {
            send_bytes(&conn, inbound.peer, &ninep::encode_rlerror(header.tag, ninep::ENOTSUP));
            flush.complete(hook);
            return;
        };
        let this = self.clone();
        let peer = inbound.peer;
        let (tx, rx) = crossbeam::channel::bounded::<FlushHook>(1);
        let submitted = self.workers.submit(move |_| {
            if let Ok(hook) = rx.recv() {
                this.execute_ninep(guard, header, inbound.bytes, peer, handler, hook);
            }
        });
        match submitted {
            Ok(()) => {
                let _ = tx.send(hook);
            }
            Err(err) => {
                tracing::error!(conn = %conn.id(), tag = header.tag, error = %err, "worker pool refused request");
                send_bytes(&conn, peer, &ninep::encode_rlerror(header.tag, ninep::EAGAIN));
                flush.complete(hook);
            }
        }
    }

    fn execute_ninep(
        &self,
        guard: InflightGuard,
        header: NinePHeader,
        msg: Bytes,
        peer: SocketAddr,
        handler: Arc<dyn OpHandler>,
        hook: FlushHook,
    ) {
        let conn = guard.connection();
        let started = Instant::now();
        let body = msg.slice(ninep::HEADER_LEN..);
        let reclaim = handler.is_reclaim(&body);
        let owner = reclaim.then(|| handler.reclaim_owner(&body)).flatten();
        let admission = Admission {
            mutates_state: handler.flags().mutates_state,
            reclaim,
            owner: owner.as_ref(),
        };
        let reply = match self.grace.admit(admission) {
            Err(err) => {
                tracing::debug!(conn = %conn.id(), tag = header.tag, error = %err, "grace rejected request");
                ninep::encode_rlerror(header.tag, ninep::EAGAIN)
            }
            Ok(()) => {
                let request = RequestId::NineP {
                    tag: header.tag,
                    msg_type: header.msg_type,
                };
                let mut ctx = OpContext::new(conn, peer, request, None, &self.clients, &self.grace);
                let outcome = catch_unwind(AssertUnwindSafe(|| handler.execute(&mut ctx, &body)));
                ctx.release_reservations();
                match outcome {
                    Ok(outcome) if outcome.status == 0 => {
                        ninep::encode_message(header.msg_type.wrapping_add(1), header.tag, &outcome.body)
                    }
                    Ok(outcome) => ninep::encode_rlerror(header.tag, outcome.status),
                    Err(_) => {
                        tracing::error!(conn = %conn.id(), tag = header.tag, op = handler.name(), "handler panicked");
                        ninep::encode_rlerror(header.tag, ninep::EIO)
                    }
                }
            }
        };
        send_bytes(conn, peer, &reply);
        metrics::request_executed(conn.kind().as_str(), started.elapsed());
        // The reply is out; a flush waiting on this request may answer now.
        if let Some(flush) = conn.flush_registry() {
            flush.complete(hook);
        }
    }
}

fn send_rpc(conn: &Connection, peer: SocketAddr, xid: u32, body: ReplyBody<'_>) {
    send_bytes(conn, peer, &rpc::encode_reply(xid, body));
}

fn send_bytes(conn: &Connection, peer: SocketAddr, reply: &[u8]) {
    if let Err(err) = conn.send(peer, reply) {
        tracing::warn!(conn = %conn.id(), %peer, error = %err, "reply send failed");
    }
}
