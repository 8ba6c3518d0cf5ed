//! Op table: which handler runs a decoded request, and the context it runs under.
//!
//! Handlers never see the DRC or the transport. They get an explicit
//! [`OpContext`] with the connection, the credential and the lease/grace state,
//! and return an [`OpOutcome`] the dispatcher caches and sends.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;

use super::connection::Connection;
use super::drc::policy::{NFS_PROGRAM, NFS_V4};
use super::proto::rpc::OpaqueAuth;
use super::state::{ClientLease, ClientTable, GraceError, GraceManager, LeaseError};
use crate::core::{ClientId, ClientOwner};

pub const NULL_PROC: u32 = 0;

pub const NFS4ERR_GRACE: u32 = 10013;
pub const NFS4ERR_NO_GRACE: u32 = 10033;
pub const NFS4ERR_RECLAIM_BAD: u32 = 10034;
pub const NFS3ERR_JUKEBOX: u32 = 10008;

/// Static properties of an operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpFlags {
    /// Enters the duplicate request cache.
    pub cacheable: bool,
    /// Changes client state; gated by the grace period.
    pub mutates_state: bool,
    /// Re-establishes state held before a restart.
    pub reclaim: bool,
}

impl OpFlags {
    pub const READ: OpFlags = OpFlags {
        cacheable: false,
        mutates_state: false,
        reclaim: false,
    };

    pub const MUTATE: OpFlags = OpFlags {
        cacheable: true,
        mutates_state: true,
        reclaim: false,
    };

    pub const RECLAIM: OpFlags = OpFlags {
        cacheable: true,
        mutates_state: true,
        reclaim: true,
    };
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpOutcome {
    pub status: u32,
    pub body: Bytes,
}

impl OpOutcome {
    pub fn new(status: u32, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(0, body)
    }

    /// A reply whose body is just the XDR status word.
    pub fn status_only(status: u32) -> Self {
        Self::new(status, Bytes::copy_from_slice(&status.to_be_bytes()))
    }
}

/// Wire identity of the request being executed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestId {
    Rpc { xid: u32, prog: u32, vers: u32, proc_num: u32 },
    NineP { tag: u16, msg_type: u8 },
}

/// Everything a handler may touch. Passed explicitly, never stashed in a
/// thread-local.
pub struct OpContext<'a> {
    pub conn: &'a Arc<Connection>,
    pub peer: SocketAddr,
    pub request: RequestId,
    pub cred: Option<&'a OpaqueAuth>,
    pub clients: &'a ClientTable,
    pub grace: &'a GraceManager,
    reserved: Vec<Arc<ClientLease>>,
}

impl<'a> OpContext<'a> {
    pub fn new(
        conn: &'a Arc<Connection>,
        peer: SocketAddr,
        request: RequestId,
        cred: Option<&'a OpaqueAuth>,
        clients: &'a ClientTable,
        grace: &'a GraceManager,
    ) -> Self {
        Self {
            conn,
            peer,
            request,
            cred,
            clients,
            grace,
            reserved: Vec::new(),
        }
    }

    /// Reserve `id`'s lease for the rest of this request. A lapsed lease is
    /// torn down and reported as expired.
    pub fn reserve_client(&mut self, id: ClientId) -> Result<Arc<ClientLease>, LeaseError> {
        let client = self.clients.lookup(id)?;
        if !self.clients.reserve_or_expire(&client) {
            return Err(LeaseError::Expired { id });
        }
        self.reserved.push(client.clone());
        Ok(client)
    }

    /// Drop every reservation taken through this context.
    pub fn release_reservations(&mut self) {
        for client in self.reserved.drain(..) {
            self.clients.release(&client);
        }
    }

    pub fn reserved(&self) -> usize {
        self.reserved.len()
    }
}

impl Drop for OpContext<'_> {
    fn drop(&mut self) {
        self.release_reservations();
    }
}

pub trait OpHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn flags(&self) -> OpFlags;

    /// Per-request reclaim marker; defaults to the static flag.
    fn is_reclaim(&self, _args: &[u8]) -> bool {
        self.flags().reclaim
    }

    /// The client a reclaim is made on behalf of. Grace admission refuses a
    /// reclaim from an owner the recovery records do not know.
    fn reclaim_owner(&self, _args: &[u8]) -> Option<ClientOwner> {
        None
    }

    /// Per-request cacheability; `None` keeps the static flag.
    fn cacheable(&self, _args: &[u8]) -> Option<bool> {
        None
    }

    fn execute(&self, ctx: &mut OpContext<'_>, args: &Bytes) -> OpOutcome;
}

/// Per-connection cleanup for protocols with connection-scoped state (9P fids).
pub trait ConnectionCleanup: Send + Sync {
    fn connection_closed(&self, conn: &Connection);
}

struct NullProc;

impl OpHandler for NullProc {
    fn name(&self) -> &'static str {
        "null"
    }

    fn flags(&self) -> OpFlags {
        OpFlags::READ
    }

    fn execute(&self, _ctx: &mut OpContext<'_>, _args: &Bytes) -> OpOutcome {
        OpOutcome::ok(Bytes::new())
    }
}

/// Statuses a program answers grace rejections with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GraceStatus {
    pub in_grace: u32,
    pub no_grace: u32,
    pub reclaim_bad: u32,
}

impl GraceStatus {
    pub const NFS4: GraceStatus = GraceStatus {
        in_grace: NFS4ERR_GRACE,
        no_grace: NFS4ERR_NO_GRACE,
        reclaim_bad: NFS4ERR_RECLAIM_BAD,
    };

    /// NFSv3 and side protocols have only "try again later".
    pub const JUKEBOX: GraceStatus = GraceStatus {
        in_grace: NFS3ERR_JUKEBOX,
        no_grace: NFS3ERR_JUKEBOX,
        reclaim_bad: NFS3ERR_JUKEBOX,
    };

    pub fn for_error(&self, err: &GraceError) -> u32 {
        match err {
            GraceError::NoGrace => self.no_grace,
            GraceError::ReclaimBad { .. } => self.reclaim_bad,
            _ => self.in_grace,
        }
    }
}

pub struct Program {
    prog: u32,
    versions: BTreeMap<u32, HashMap<u32, Arc<dyn OpHandler>>>,
    grace: GraceStatus,
}

impl Program {
    pub fn new(prog: u32, grace: GraceStatus) -> Self {
        Self {
            prog,
            versions: BTreeMap::new(),
            grace,
        }
    }

    pub fn prog(&self) -> u32 {
        self.prog
    }

    pub fn grace_status(&self) -> GraceStatus {
        self.grace
    }

    /// Register `handler` for `vers`/`proc_num`. Every version gets NULL.
    pub fn register(mut self, vers: u32, proc_num: u32, handler: Arc<dyn OpHandler>) -> Self {
        self.version(vers).insert(proc_num, handler);
        self
    }

    /// Advertise `vers` with only the NULL procedure.
    pub fn with_version(mut self, vers: u32) -> Self {
        self.version(vers);
        self
    }

    fn version(&mut self, vers: u32) -> &mut HashMap<u32, Arc<dyn OpHandler>> {
        self.versions.entry(vers).or_insert_with(|| {
            let mut procs: HashMap<u32, Arc<dyn OpHandler>> = HashMap::new();
            procs.insert(NULL_PROC, Arc::new(NullProc));
            procs
        })
    }

    fn version_range(&self) -> Option<(u32, u32)> {
        let low = *self.versions.keys().next()?;
        let high = *self.versions.keys().next_back()?;
        Some((low, high))
    }
}

pub enum RpcLookup<'a> {
    Found {
        handler: &'a Arc<dyn OpHandler>,
        grace: GraceStatus,
    },
    ProgUnavail,
    ProgMismatch { low: u32, high: u32 },
    ProcUnavail,
}

#[derive(Default)]
pub struct OpTable {
    programs: HashMap<u32, Program>,
    ninep: HashMap<u8, Arc<dyn OpHandler>>,
    cleanup: Vec<Arc<dyn ConnectionCleanup>>,
}

impl OpTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(mut self, program: Program) -> Self {
        self.programs.insert(program.prog, program);
        self
    }

    pub fn with_ninep(mut self, msg_type: u8, handler: Arc<dyn OpHandler>) -> Self {
        self.ninep.insert(msg_type, handler);
        self
    }

    pub fn with_cleanup(mut self, cleanup: Arc<dyn ConnectionCleanup>) -> Self {
        self.cleanup.push(cleanup);
        self
    }

    pub fn lookup_rpc(&self, prog: u32, vers: u32, proc_num: u32) -> RpcLookup<'_> {
        let Some(program) = self.programs.get(&prog) else {
            return RpcLookup::ProgUnavail;
        };
        let Some(procs) = program.versions.get(&vers) else {
            return match program.version_range() {
                Some((low, high)) => RpcLookup::ProgMismatch { low, high },
                None => RpcLookup::ProgUnavail,
            };
        };
        match procs.get(&proc_num) {
            Some(handler) => RpcLookup::Found {
                handler,
                grace: program.grace,
            },
            None => RpcLookup::ProcUnavail,
        }
    }

    pub fn lookup_ninep(&self, msg_type: u8) -> Option<&Arc<dyn OpHandler>> {
        self.ninep.get(&msg_type)
    }

    pub fn connection_closed(&self, conn: &Connection) {
        for cleanup in &self.cleanup {
            cleanup.connection_closed(conn);
        }
    }

    /// True when NFSv4 is registered; reload asks for grace only then.
    pub fn serves_nfs4(&self) -> bool {
        self.programs
            .get(&NFS_PROGRAM)
            .is_some_and(|program| program.versions.contains_key(&NFS_V4))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl OpHandler for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn flags(&self) -> OpFlags {
            OpFlags::MUTATE
        }

        fn execute(&self, _ctx: &mut OpContext<'_>, args: &Bytes) -> OpOutcome {
            OpOutcome::ok(args.clone())
        }
    }

    fn table() -> OpTable {
        OpTable::new().with_program(
            Program::new(100003, GraceStatus::NFS4)
                .register(3, 7, Arc::new(Echo))
                .register(4, 1, Arc::new(Echo)),
        )
    }

    #[test]
    fn lookup_reports_rpc_mismatches() {
        let table = table();
        assert!(matches!(table.lookup_rpc(100005, 3, 0), RpcLookup::ProgUnavail));
        assert!(matches!(
            table.lookup_rpc(100003, 2, 0),
            RpcLookup::ProgMismatch { low: 3, high: 4 }
        ));
        assert!(matches!(table.lookup_rpc(100003, 3, 9), RpcLookup::ProcUnavail));
        match table.lookup_rpc(100003, 4, 1) {
            RpcLookup::Found { handler, grace } => {
                assert_eq!(handler.name(), "echo");
                assert_eq!(grace, GraceStatus::NFS4);
            }
            _ => panic!("expected handler"),
        }
        assert!(table.serves_nfs4());
    }

    #[test]
    fn every_version_answers_null() {
        let table = table();
        for vers in [3, 4] {
            match table.lookup_rpc(100003, vers, NULL_PROC) {
                RpcLookup::Found { handler, .. } => {
                    assert_eq!(handler.name(), "null");
                    assert_eq!(handler.flags(), OpFlags::READ);
                }
                _ => panic!("expected NULL for version {vers}"),
            }
        }
    }

    #[test]
    fn grace_status_maps_errors() {
        let status = GraceStatus::NFS4;
        assert_eq!(status.for_error(&GraceError::InGrace), NFS4ERR_GRACE);
        assert_eq!(status.for_error(&GraceError::NoGrace), NFS4ERR_NO_GRACE);
        assert_eq!(OpOutcome::status_only(NFS4ERR_GRACE).body.len(), 4);
    }
}
