#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

use nfsd_rs::config::Config;
use nfsd_rs::core::{ClientOwner, system_clock};
use nfsd_rs::daemon::interp::{GraceStatus, OpFlags};
use nfsd_rs::daemon::proto::rpc::{OpaqueAuth, ReplyStat, ReplyView, encode_call};
use nfsd_rs::daemon::state::NoState;
use nfsd_rs::daemon::transport::{Channel, Received, StreamChannel, TransportKind};
use nfsd_rs::daemon::{OpContext, OpHandler, OpOutcome, OpTable, Program, Runtime};

pub const TEST_PROG: u32 = 400_100;
pub const TEST_VERS: u32 = 1;
pub const PROC_MUTATE: u32 = 1;
pub const PROC_RECLAIM: u32 = 2;
pub const PROC_READ: u32 = 3;

const MAX_MSG: usize = 1 << 20;
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Counts executions. Calls whose arguments start with `hold` block until
/// [`Recorder::release`].
#[derive(Default)]
pub struct Recorder {
    runs: AtomicUsize,
    released: Mutex<bool>,
    cv: Condvar,
}

impl Recorder {
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn release(&self) {
        *self.released.lock().unwrap() = true;
        self.cv.notify_all();
    }

    pub fn wait_runs(&self, n: usize) -> bool {
        wait_for(REPLY_TIMEOUT, || self.runs() >= n)
    }
}

struct RecorderHandler {
    recorder: Arc<Recorder>,
    flags: OpFlags,
}

impl OpHandler for RecorderHandler {
    fn name(&self) -> &'static str {
        "recorder"
    }

    fn flags(&self) -> OpFlags {
        self.flags
    }

    fn execute(&self, _ctx: &mut OpContext<'_>, args: &Bytes) -> OpOutcome {
        self.recorder.runs.fetch_add(1, Ordering::SeqCst);
        if args.starts_with(b"hold") {
            let guard = self.recorder.released.lock().unwrap();
            let _guard = self.recorder.cv.wait_while(guard, |released| !*released).unwrap();
        }
        OpOutcome::ok(args.clone())
    }
}

/// Treats its arguments as a client owner and reports its reclaim done.
struct ReclaimDone;

impl OpHandler for ReclaimDone {
    fn name(&self) -> &'static str {
        "reclaim_complete"
    }

    fn flags(&self) -> OpFlags {
        OpFlags::RECLAIM
    }

    fn reclaim_owner(&self, args: &[u8]) -> Option<ClientOwner> {
        ClientOwner::new(args.to_vec()).ok()
    }

    fn execute(&self, ctx: &mut OpContext<'_>, args: &Bytes) -> OpOutcome {
        let Ok(owner) = ClientOwner::new(args.to_vec()) else {
            return OpOutcome::status_only(22);
        };
        match ctx.grace.reclaim_complete(&owner) {
            Ok(_) => OpOutcome::status_only(0),
            Err(err) => OpOutcome::status_only(GraceStatus::NFS4.for_error(&err)),
        }
    }
}

pub fn recorder_handler(recorder: &Arc<Recorder>, flags: OpFlags) -> Arc<dyn OpHandler> {
    Arc::new(RecorderHandler {
        recorder: recorder.clone(),
        flags,
    })
}

pub fn recorder_ops(recorder: &Arc<Recorder>) -> OpTable {
    OpTable::new().with_program(
        Program::new(TEST_PROG, GraceStatus::NFS4)
            .register(TEST_VERS, PROC_MUTATE, recorder_handler(recorder, OpFlags::MUTATE))
            .register(TEST_VERS, PROC_RECLAIM, Arc::new(ReclaimDone))
            .register(TEST_VERS, PROC_READ, recorder_handler(recorder, OpFlags::READ)),
    )
}

/// Loopback TCP only; tests that want UDP or 9P turn them on.
pub fn local_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.server.tcp_listen = vec!["127.0.0.1:0".into()];
    config.server.udp_listen = None;
    config.server.poll_interval_ms = 20;
    config.recovery.root = Some(root.to_path_buf());
    config.node.epoch = Some(7);
    config.logging.stdout = false;
    config
}

pub fn start(config: Config, ops: OpTable) -> Runtime {
    Runtime::start_with(config, ops, system_clock(), Arc::new(NoState)).expect("runtime start")
}

pub fn tcp_client(addr: SocketAddr) -> StreamChannel {
    StreamChannel::connect(addr, TransportKind::Tcp, MAX_MSG).expect("connect")
}

pub fn ninep_client(addr: SocketAddr) -> StreamChannel {
    StreamChannel::connect(addr, TransportKind::NinePTcp, MAX_MSG).expect("connect")
}

pub fn call(xid: u32, proc_num: u32, args: &[u8]) -> Bytes {
    encode_call(xid, TEST_PROG, TEST_VERS, proc_num, &OpaqueAuth::none(), args)
}

pub fn send(channel: &dyn Channel, to: SocketAddr, msg: &[u8]) {
    channel.send(to, msg).expect("send");
}

pub fn recv(channel: &dyn Channel) -> Bytes {
    let deadline = Instant::now() + REPLY_TIMEOUT;
    while Instant::now() < deadline {
        match channel.receive().expect("receive") {
            Received::Message(inbound) => return inbound.bytes,
            Received::WouldBlock => {}
            Received::Closed => panic!("channel closed while waiting for a reply"),
        }
    }
    panic!("no reply within {REPLY_TIMEOUT:?}");
}

pub fn exchange(channel: &dyn Channel, to: SocketAddr, msg: &[u8]) -> Bytes {
    send(channel, to, msg);
    recv(channel)
}

/// `(xid, accept stat, results)` of an accepted reply.
pub fn accepted(reply: &Bytes) -> (u32, u32, Bytes) {
    let view = ReplyView::parse(reply).expect("reply parses");
    match view.stat {
        ReplyStat::Accepted { stat, results } => (view.xid, stat, results),
        other => panic!("denied reply {other:?}"),
    }
}

pub fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    let mut backoff = Duration::from_millis(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(backoff);
        backoff = std::cmp::min(backoff.saturating_mul(2), Duration::from_millis(50));
    }
    condition()
}
