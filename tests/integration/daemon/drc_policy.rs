use std::sync::Arc;

use tempfile::TempDir;

use crate::fixtures::rig::{
    PROC_MUTATE, Recorder, accepted, call, exchange, local_config, recorder_ops, recv, send, start,
    tcp_client,
};
use nfsd_rs::daemon::AllocFailurePolicy;
use nfsd_rs::daemon::proto::rpc::{SUCCESS, SYSTEM_ERR};

/// One tracked entry fits; the held call occupies it.
fn full_cache(policy: AllocFailurePolicy) -> (TempDir, Arc<Recorder>, nfsd_rs::daemon::Runtime) {
    let temp = TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::default());
    let mut config = local_config(temp.path());
    config.drc.tcp.hard_cap = Some(1);
    config.drc.on_alloc_failure = policy;
    let runtime = start(config, recorder_ops(&recorder));
    (temp, recorder, runtime)
}

#[test]
fn full_cache_fails_open_by_default() {
    let (_temp, recorder, runtime) = full_cache(AllocFailurePolicy::default());
    let addr = runtime.tcp_addrs()[0];
    let client = tcp_client(addr);

    send(&client, addr, &call(1, PROC_MUTATE, b"hold"));
    assert!(recorder.wait_runs(1));
    let (xid, stat, results) = accepted(&exchange(&client, addr, &call(2, PROC_MUTATE, b"free")));
    assert_eq!((xid, stat), (2, SUCCESS));
    assert_eq!(&results[..], b"free");
    assert_eq!(recorder.runs(), 2);

    recorder.release();
    let (xid, stat, _) = accepted(&recv(&client));
    assert_eq!((xid, stat), (1, SUCCESS));

    // Nothing recorded the untracked call, so it runs again.
    exchange(&client, addr, &call(2, PROC_MUTATE, b"free"));
    assert_eq!(recorder.runs(), 3);
    drop(client);
    runtime.shutdown();
}

#[test]
fn full_cache_rejects_when_configured_closed() {
    let (_temp, recorder, runtime) = full_cache(AllocFailurePolicy::FailClosed);
    let addr = runtime.tcp_addrs()[0];
    let client = tcp_client(addr);

    send(&client, addr, &call(1, PROC_MUTATE, b"hold"));
    assert!(recorder.wait_runs(1));
    let (xid, stat, _) = accepted(&exchange(&client, addr, &call(2, PROC_MUTATE, b"free")));
    assert_eq!((xid, stat), (2, SYSTEM_ERR));
    assert_eq!(recorder.runs(), 1);

    recorder.release();
    let (xid, stat, _) = accepted(&recv(&client));
    assert_eq!((xid, stat), (1, SUCCESS));
    drop(client);
    runtime.shutdown();
}
