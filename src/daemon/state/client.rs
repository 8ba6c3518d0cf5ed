//! Client ids and the records that group them.
//!
//! Each owner has one [`ClientRecord`] holding at most one confirmed and one
//! unconfirmed [`ClientLease`]. Lookup tables hold `Arc`s; teardown is explicit
//! and always runs with no lease lock held.
//!
//! Lock order: `owners` before `ids`, then a record's `ids` lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::LeaseError;
use super::lease::Lease;
use crate::core::{ClientId, ClientOwner, FileHandle, SharedClock, Verifier};
use crate::daemon::metrics;
use crate::daemon::recovery::SharedRecovery;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    Unconfirmed,
    Confirmed,
    Expired,
    /// Replaced by a newer confirmed id for the same owner.
    Stale,
}

/// Releases protocol state (opens, locks, delegations) held under a client id.
pub trait StateRelease: Send + Sync {
    fn release_client_state(&self, client: &ClientLease);
}

/// Release hook for servers with no protocol state of their own.
#[derive(Debug, Default)]
pub struct NoState;

impl StateRelease for NoState {
    fn release_client_state(&self, _client: &ClientLease) {}
}

#[derive(Debug, Default)]
struct RecordIds {
    confirmed: Option<ClientId>,
    unconfirmed: Option<ClientId>,
}

impl RecordIds {
    fn is_empty(&self) -> bool {
        self.confirmed.is_none() && self.unconfirmed.is_none()
    }

    fn forget(&mut self, id: ClientId) {
        if self.confirmed == Some(id) {
            self.confirmed = None;
        }
        if self.unconfirmed == Some(id) {
            self.unconfirmed = None;
        }
    }
}

#[derive(Debug)]
pub struct ClientRecord {
    owner: ClientOwner,
    ids: Mutex<RecordIds>,
}

impl ClientRecord {
    pub fn owner(&self) -> &ClientOwner {
        &self.owner
    }

    pub fn confirmed(&self) -> Option<ClientId> {
        self.ids.lock().expect("client record lock poisoned").confirmed
    }

    pub fn unconfirmed(&self) -> Option<ClientId> {
        self.ids.lock().expect("client record lock poisoned").unconfirmed
    }
}

#[derive(Debug)]
pub struct ClientLease {
    id: ClientId,
    verifier: Verifier,
    lease: Lease,
    state: Mutex<ClientState>,
    record: Arc<ClientRecord>,
}

impl ClientLease {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn owner(&self) -> &ClientOwner {
        &self.record.owner
    }

    pub fn verifier(&self) -> Verifier {
        self.verifier
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    pub fn record(&self) -> &Arc<ClientRecord> {
        &self.record
    }

    pub fn state(&self) -> ClientState {
        *self.state.lock().expect("client state lock poisoned")
    }

    fn set_state(&self, state: ClientState) -> ClientState {
        std::mem::replace(&mut *self.state.lock().expect("client state lock poisoned"), state)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub marked: usize,
    pub expired: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Teardown {
    Expired,
    Destroyed,
    Replaced,
}

pub struct ClientTable {
    epoch: u32,
    counter: AtomicU32,
    lifetime: Duration,
    clock: SharedClock,
    recovery: SharedRecovery,
    release: Arc<dyn StateRelease>,
    owners: Mutex<HashMap<ClientOwner, Arc<ClientRecord>>>,
    ids: Mutex<HashMap<ClientId, Arc<ClientLease>>>,
}

impl ClientTable {
    pub fn new(
        epoch: u32,
        lifetime: Duration,
        clock: SharedClock,
        recovery: SharedRecovery,
        release: Arc<dyn StateRelease>,
    ) -> Self {
        Self {
            epoch,
            counter: AtomicU32::new(0),
            lifetime,
            clock,
            recovery,
            release,
            owners: Mutex::new(HashMap::new()),
            ids: Mutex::new(HashMap::new()),
        }
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    pub fn len(&self) -> usize {
        self.ids.lock().expect("client ids lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_id(&self) -> ClientId {
        ClientId::new(self.epoch, self.counter.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Initial exchange: allocate a fresh unconfirmed id for `owner`.
    ///
    /// A previous unconfirmed id of the same owner is discarded.
    pub fn create(&self, owner: ClientOwner, verifier: Verifier) -> Arc<ClientLease> {
        let id = self.next_id();
        let (client, replaced) = {
            let mut owners = self.owners.lock().expect("client owners lock poisoned");
            let record = owners
                .entry(owner.clone())
                .or_insert_with(|| {
                    Arc::new(ClientRecord {
                        owner,
                        ids: Mutex::new(RecordIds::default()),
                    })
                })
                .clone();
            let client = Arc::new(ClientLease {
                id,
                verifier,
                lease: Lease::new(self.clock.clone(), self.lifetime),
                state: Mutex::new(ClientState::Unconfirmed),
                record: record.clone(),
            });
            let mut ids = self.ids.lock().expect("client ids lock poisoned");
            ids.insert(id, client.clone());
            let replaced = record
                .ids
                .lock()
                .expect("client record lock poisoned")
                .unconfirmed
                .replace(id)
                .and_then(|old| ids.remove(&old));
            (client, replaced)
        };
        if let Some(old) = replaced {
            let _ = old.lease.force_expire();
            old.set_state(ClientState::Stale);
            self.release.release_client_state(&old);
        }
        metrics::client_created();
        tracing::debug!(client = %client.owner(), id = %id, "client id created");
        client
    }

    /// Confirm `id`, replacing any confirmed id its owner held before.
    pub fn confirm(&self, id: ClientId) -> Result<Arc<ClientLease>, LeaseError> {
        let client = self.lookup(id)?;
        match client.state() {
            ClientState::Confirmed => return Ok(client),
            ClientState::Unconfirmed => {}
            ClientState::Expired => return Err(LeaseError::Expired { id }),
            ClientState::Stale => return Err(LeaseError::Stale { id }),
        }
        // A confirmed client must be reclaimable after a restart.
        self.recovery.record_client(client.owner())?;
        let previous = {
            let mut ids = client.record.ids.lock().expect("client record lock poisoned");
            if ids.unconfirmed == Some(id) {
                ids.unconfirmed = None;
            }
            ids.confirmed.replace(id).filter(|old| *old != id)
        };
        client.set_state(ClientState::Confirmed);
        let previous = previous.and_then(|old| self.lookup(old).ok());
        if let Some(old) = previous {
            tracing::info!(client = %client.owner(), old = %old.id, new = %id, "client rebooted; dropping old id");
            self.teardown(&old, Teardown::Replaced);
        }
        client.lease.renew();
        tracing::info!(client = %client.owner(), id = %id, "client confirmed");
        Ok(client)
    }

    pub fn lookup(&self, id: ClientId) -> Result<Arc<ClientLease>, LeaseError> {
        self.ids
            .lock()
            .expect("client ids lock poisoned")
            .get(&id)
            .cloned()
            .ok_or(LeaseError::NotFound { id })
    }

    pub fn record(&self, owner: &ClientOwner) -> Option<Arc<ClientRecord>> {
        self.owners
            .lock()
            .expect("client owners lock poisoned")
            .get(owner)
            .cloned()
    }

    /// Client-requested teardown. Refused while an operation holds the lease.
    pub fn destroy(&self, id: ClientId) -> Result<(), LeaseError> {
        let client = self.lookup(id)?;
        client
            .lease
            .force_expire()
            .map_err(|reservations| LeaseError::Busy { id, reservations })?;
        self.teardown(&client, Teardown::Destroyed);
        Ok(())
    }

    /// Expire `client` if its lease has lapsed. Returns true if this call expired it.
    pub fn expire(&self, client: &Arc<ClientLease>) -> bool {
        if !client.lease.try_expire(false) {
            return false;
        }
        self.teardown(client, Teardown::Expired);
        true
    }

    /// Reserve the lease for an operation, tearing the client down if it lapsed.
    pub fn reserve_or_expire(&self, client: &Arc<ClientLease>) -> bool {
        if client.lease.reserve() {
            return true;
        }
        self.expire(client);
        false
    }

    /// Release a reservation taken by [`reserve_or_expire`](Self::reserve_or_expire).
    pub fn release(&self, client: &ClientLease) {
        if client.lease.release() {
            tracing::debug!(client = %client.owner(), id = %client.id, "lease pulled back from pending expiry");
        }
    }

    /// One reaper pass. Leases marked by the previous pass that are still
    /// lapsed expire; newly lapsed leases are marked.
    pub fn reap(&self) -> ReapReport {
        let clients: Vec<Arc<ClientLease>> = self
            .ids
            .lock()
            .expect("client ids lock poisoned")
            .values()
            .cloned()
            .collect();
        let mut report = ReapReport::default();
        for client in clients {
            if client.lease.try_expire(true) {
                self.teardown(&client, Teardown::Expired);
                report.expired += 1;
            } else if client.lease.mark_pending_expiry() {
                report.marked += 1;
            }
        }
        if report.expired > 0 || report.marked > 0 {
            tracing::debug!(marked = report.marked, expired = report.expired, "lease reap pass");
        }
        report
    }

    /// Durably note that `handle` was revoked from the client holding `id`.
    pub fn revoke_handle(&self, id: ClientId, handle: &FileHandle) -> Result<(), LeaseError> {
        let client = self.lookup(id)?;
        self.recovery.record_revoked_handle(client.owner(), handle)?;
        tracing::info!(client = %client.owner(), handle = ?handle, "handle revoked");
        Ok(())
    }

    fn teardown(&self, client: &Arc<ClientLease>, reason: Teardown) {
        {
            let mut owners = self.owners.lock().expect("client owners lock poisoned");
            let mut ids = self.ids.lock().expect("client ids lock poisoned");
            if ids.get(&client.id).is_some_and(|held| Arc::ptr_eq(held, client)) {
                ids.remove(&client.id);
            }
            let mut record_ids = client.record.ids.lock().expect("client record lock poisoned");
            record_ids.forget(client.id);
            if record_ids.is_empty()
                && owners
                    .get(client.owner())
                    .is_some_and(|record| Arc::ptr_eq(record, &client.record))
            {
                owners.remove(client.owner());
            }
        }
        let next = match reason {
            Teardown::Replaced => ClientState::Stale,
            Teardown::Expired | Teardown::Destroyed => ClientState::Expired,
        };
        let was = client.set_state(next);
        if was == ClientState::Confirmed && reason != Teardown::Replaced {
            if let Err(err) = self.recovery.remove_client(client.owner()) {
                tracing::warn!(client = %client.owner(), error = %err, "failed to remove client record");
            }
        }
        self.release.release_client_state(client);
        if reason == Teardown::Expired {
            metrics::lease_expired();
        }
        tracing::info!(client = %client.owner(), id = %client.id, ?reason, "client torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use tempfile::TempDir;

    use crate::core::{ManualClock, NodeId};
    use crate::daemon::recovery::{
        FsRecovery, GraceHint, ReclaimCandidate, RecoveryBackend, RecoveryError,
    };

    #[derive(Default)]
    struct CountingRelease(AtomicUsize);

    impl StateRelease for CountingRelease {
        fn release_client_state(&self, _client: &ClientLease) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        _temp: TempDir,
        clock: ManualClock,
        recovery: Arc<FsRecovery>,
        released: Arc<CountingRelease>,
        table: ClientTable,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let clock = ManualClock::new();
        let recovery = Arc::new(FsRecovery::open(temp.path(), NodeId::numbered(0)).unwrap());
        let released = Arc::new(CountingRelease::default());
        let table = ClientTable::new(
            7,
            Duration::from_secs(60),
            Arc::new(clock.clone()),
            recovery.clone(),
            released.clone(),
        );
        Fixture {
            _temp: temp,
            clock,
            recovery,
            released,
            table,
        }
    }

    fn owner(name: &str) -> ClientOwner {
        ClientOwner::new(name.as_bytes().to_vec()).unwrap()
    }

    fn recorded(recovery: &FsRecovery) -> Vec<ClientOwner> {
        recovery.begin_grace(None).unwrap();
        let mut out = Vec::new();
        recovery
            .enumerate_reclaim_candidates(&mut |c| out.push(c.owner))
            .unwrap();
        out
    }

    #[test]
    fn ids_carry_epoch() {
        let fx = fixture();
        let a = fx.table.create(owner("a"), Verifier([1; 8]));
        let b = fx.table.create(owner("b"), Verifier([1; 8]));
        assert_eq!(a.id().epoch(), 7);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.state(), ClientState::Unconfirmed);
    }

    #[test]
    fn confirm_records_and_replaces_previous_boot() {
        let fx = fixture();
        let first = fx.table.create(owner("a"), Verifier([1; 8]));
        fx.table.confirm(first.id()).unwrap();
        assert_eq!(first.record().confirmed(), Some(first.id()));

        let rebooted = fx.table.create(owner("a"), Verifier([2; 8]));
        assert_eq!(rebooted.record().unconfirmed(), Some(rebooted.id()));
        fx.table.confirm(rebooted.id()).unwrap();
        assert_eq!(first.state(), ClientState::Stale);
        assert!(matches!(fx.table.lookup(first.id()), Err(LeaseError::NotFound { .. })));
        assert_eq!(fx.released.0.load(Ordering::SeqCst), 1);
        assert_eq!(recorded(&fx.recovery), vec![owner("a")]);
    }

    struct UnwritableRecovery;

    impl RecoveryBackend for UnwritableRecovery {
        fn name(&self) -> &'static str {
            "unwritable"
        }

        fn record_client(&self, _owner: &ClientOwner) -> Result<(), RecoveryError> {
            Err(RecoveryError::io(
                "/unwritable",
                std::io::ErrorKind::PermissionDenied.into(),
            ))
        }

        fn remove_client(&self, _owner: &ClientOwner) -> Result<(), RecoveryError> {
            Ok(())
        }

        fn record_revoked_handle(
            &self,
            _owner: &ClientOwner,
            _handle: &FileHandle,
        ) -> Result<(), RecoveryError> {
            Ok(())
        }

        fn begin_grace(&self, _hint: Option<&GraceHint>) -> Result<(), RecoveryError> {
            Ok(())
        }

        fn enumerate_reclaim_candidates(
            &self,
            _visit: &mut dyn FnMut(ReclaimCandidate),
        ) -> Result<(), RecoveryError> {
            Ok(())
        }

        fn end_grace(&self) -> Result<(), RecoveryError> {
            Ok(())
        }
    }

    #[test]
    fn confirm_failing_to_record_leaves_client_unconfirmed() {
        let clock = ManualClock::new();
        let table = ClientTable::new(
            7,
            Duration::from_secs(60),
            Arc::new(clock),
            Arc::new(UnwritableRecovery),
            Arc::new(CountingRelease::default()),
        );
        let client = table.create(owner("a"), Verifier([1; 8]));
        assert!(matches!(
            table.confirm(client.id()),
            Err(LeaseError::Recovery(_))
        ));
        assert_eq!(client.state(), ClientState::Unconfirmed);
        assert_eq!(client.record().confirmed(), None);
        assert_eq!(client.record().unconfirmed(), Some(client.id()));
    }

    #[test]
    fn destroy_refused_while_reserved() {
        let fx = fixture();
        let client = fx.table.create(owner("a"), Verifier([0; 8]));
        fx.table.confirm(client.id()).unwrap();
        assert!(fx.table.reserve_or_expire(&client));
        assert!(matches!(
            fx.table.destroy(client.id()),
            Err(LeaseError::Busy { reservations: 1, .. })
        ));
        fx.table.release(&client);
        fx.table.destroy(client.id()).unwrap();
        assert!(fx.table.is_empty());
        assert!(fx.table.record(&owner("a")).is_none());
        assert!(recorded(&fx.recovery).is_empty());
    }

    #[test]
    fn reserve_or_expire_tears_down_lapsed_client() {
        let fx = fixture();
        let client = fx.table.create(owner("a"), Verifier([0; 8]));
        fx.table.confirm(client.id()).unwrap();
        fx.clock.advance(Duration::from_secs(61));
        assert!(!fx.table.reserve_or_expire(&client));
        assert_eq!(client.state(), ClientState::Expired);
        assert!(fx.table.is_empty());
        assert_eq!(fx.released.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reaper_expires_on_second_pass_unless_renewed() {
        let fx = fixture();
        let idle = fx.table.create(owner("idle"), Verifier([0; 8]));
        let busy = fx.table.create(owner("busy"), Verifier([0; 8]));
        fx.table.confirm(idle.id()).unwrap();
        fx.table.confirm(busy.id()).unwrap();

        fx.clock.advance(Duration::from_secs(61));
        assert_eq!(fx.table.reap(), ReapReport { marked: 2, expired: 0 });

        assert!(fx.table.reserve_or_expire(&busy));
        fx.table.release(&busy);

        assert_eq!(fx.table.reap(), ReapReport { marked: 0, expired: 1 });
        assert_eq!(idle.state(), ClientState::Expired);
        assert_eq!(busy.state(), ClientState::Confirmed);
        assert_eq!(fx.table.len(), 1);
    }

    #[test]
    fn revoke_needs_known_client() {
        let fx = fixture();
        let handle = FileHandle::new(vec![4, 2]).unwrap();
        assert!(matches!(
            fx.table.revoke_handle(ClientId::new(7, 99), &handle),
            Err(LeaseError::NotFound { .. })
        ));
        let client = fx.table.create(owner("a"), Verifier([0; 8]));
        fx.table.confirm(client.id()).unwrap();
        fx.table.revoke_handle(client.id(), &handle).unwrap();
    }
}
