use std::sync::Arc;

use tempfile::TempDir;

use nfsd_rs::core::{ClientOwner, Verifier};
use nfsd_rs::daemon::GracePhase;
use nfsd_rs::daemon::interp::{NFS4ERR_GRACE, NFS4ERR_RECLAIM_BAD};
use nfsd_rs::daemon::proto::rpc::SUCCESS;

use crate::fixtures::rig::{
    PROC_MUTATE, PROC_READ, PROC_RECLAIM, Recorder, accepted, call, exchange, local_config,
    recorder_ops, start, tcp_client,
};

#[test]
fn restart_gates_state_changes_until_the_last_reclaim() {
    let temp = TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::default());
    let owner = ClientOwner::new(b"client-a".to_vec()).unwrap();

    // First boot: nothing to reclaim, one client confirms.
    let config = local_config(temp.path());
    let runtime = start(config.clone(), recorder_ops(&recorder));
    assert_eq!(runtime.grace().phase(), GracePhase::Normal);
    let lease = runtime.clients().create(owner.clone(), Verifier([1; 8]));
    runtime.clients().confirm(lease.id()).unwrap();
    runtime.shutdown();

    // Second boot over the same records.
    let mut config = config;
    config.node.epoch = Some(8);
    let runtime = start(config, recorder_ops(&recorder));
    assert_eq!(runtime.grace().phase(), GracePhase::Enforcing);
    assert!(runtime.grace().is_reclaim_candidate(&owner));

    let addr = runtime.tcp_addrs()[0];
    let client = tcp_client(addr);
    let write = call(7, PROC_MUTATE, b"write");
    let (_, stat, results) = accepted(&exchange(&client, addr, &write));
    assert_eq!(stat, SUCCESS);
    assert_eq!(&results[..], &NFS4ERR_GRACE.to_be_bytes());
    assert_eq!(recorder.runs(), 0);

    // Reads are never gated.
    let (_, _, results) = accepted(&exchange(&client, addr, &call(8, PROC_READ, b"read")));
    assert_eq!(&results[..], b"read");

    let (_, _, results) =
        accepted(&exchange(&client, addr, &call(9, PROC_RECLAIM, owner.as_bytes())));
    assert_eq!(&results[..], &0u32.to_be_bytes());
    assert_eq!(runtime.grace().phase(), GracePhase::Normal);

    // The rejection was not cached: the retransmission now executes.
    let (_, _, results) = accepted(&exchange(&client, addr, &write));
    assert_eq!(&results[..], b"write");
    assert_eq!(recorder.runs(), 2);

    drop(client);
    runtime.shutdown();
}

#[test]
fn reclaim_from_unknown_client_is_refused() {
    let temp = TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::default());
    let known = ClientOwner::new(b"client-a".to_vec()).unwrap();

    let config = local_config(temp.path());
    let runtime = start(config.clone(), recorder_ops(&recorder));
    let lease = runtime.clients().create(known.clone(), Verifier([1; 8]));
    runtime.clients().confirm(lease.id()).unwrap();
    runtime.shutdown();

    let runtime = start(config, recorder_ops(&recorder));
    assert_eq!(runtime.grace().phase(), GracePhase::Enforcing);
    let addr = runtime.tcp_addrs()[0];
    let client = tcp_client(addr);

    let (_, stat, results) =
        accepted(&exchange(&client, addr, &call(1, PROC_RECLAIM, b"client-z")));
    assert_eq!(stat, SUCCESS);
    assert_eq!(&results[..], &NFS4ERR_RECLAIM_BAD.to_be_bytes());
    assert_eq!(runtime.grace().phase(), GracePhase::Enforcing);

    let (_, _, results) =
        accepted(&exchange(&client, addr, &call(2, PROC_RECLAIM, known.as_bytes())));
    assert_eq!(&results[..], &0u32.to_be_bytes());
    assert_eq!(runtime.grace().phase(), GracePhase::Normal);

    drop(client);
    runtime.shutdown();
}

#[test]
fn concurrent_reclaims_lift_grace_exactly_once() {
    let temp = TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::default());
    let owners: Vec<ClientOwner> = (0..8)
        .map(|i| ClientOwner::new(format!("client-{i}").into_bytes()).unwrap())
        .collect();

    let config = local_config(temp.path());
    let runtime = start(config.clone(), recorder_ops(&recorder));
    for (i, owner) in owners.iter().enumerate() {
        let lease = runtime.clients().create(owner.clone(), Verifier([i as u8; 8]));
        runtime.clients().confirm(lease.id()).unwrap();
    }
    runtime.shutdown();

    let runtime = start(config, recorder_ops(&recorder));
    assert_eq!(runtime.grace().expected().len(), owners.len());
    let grace = runtime.grace().clone();
    let lifts: usize = std::thread::scope(|scope| {
        let handles: Vec<_> = owners
            .iter()
            .map(|owner| {
                let grace = grace.clone();
                scope.spawn(move || grace.reclaim_complete(owner).unwrap())
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap() as usize)
            .sum()
    });
    assert_eq!(lifts, 1);
    assert_eq!(grace.phase(), GracePhase::Normal);
    assert!(!grace.try_lift().unwrap());
    runtime.shutdown();
}
