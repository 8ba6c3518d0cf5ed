use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use crate::fixtures::rig::{
    PROC_MUTATE, Recorder, accepted, call, exchange, local_config, recorder_ops, recv, send, start,
    tcp_client, wait_for,
};
use nfsd_rs::daemon::Runtime;
use nfsd_rs::daemon::fridge::DefermentKind;
use nfsd_rs::daemon::proto::rpc::{SUCCESS, SYSTEM_ERR};

fn single_worker(deferment: DefermentKind) -> (TempDir, Arc<Recorder>, Runtime) {
    let temp = TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::default());
    let mut config = local_config(temp.path());
    config.workers.thr_min = 1;
    config.workers.thr_max = 1;
    config.workers.deferment = deferment;
    let runtime = start(config, recorder_ops(&recorder));
    (temp, recorder, runtime)
}

#[test]
fn queued_requests_wait_for_the_only_worker() {
    let (_temp, recorder, runtime) = single_worker(DefermentKind::Queue);
    let addr = runtime.tcp_addrs()[0];
    let workers = runtime.server().dispatcher().workers();
    let client = tcp_client(addr);

    send(&client, addr, &call(1, PROC_MUTATE, b"hold"));
    assert!(recorder.wait_runs(1));
    send(&client, addr, &call(2, PROC_MUTATE, b"a"));
    send(&client, addr, &call(3, PROC_MUTATE, b"b"));
    assert!(wait_for(Duration::from_secs(5), || workers.deferred_count() == 2));
    assert_eq!(recorder.runs(), 1);
    assert_eq!(workers.thread_count(), 1);

    recorder.release();
    let mut answered = BTreeSet::new();
    for _ in 0..3 {
        let (xid, stat, _) = accepted(&recv(&client));
        assert_eq!(stat, SUCCESS);
        answered.insert(xid);
    }
    assert_eq!(answered, BTreeSet::from([1, 2, 3]));
    assert_eq!(recorder.runs(), 3);
    assert_eq!(workers.deferred_count(), 0);
    assert!(workers.thread_count() <= 1);
    drop(client);
    runtime.shutdown();
}

#[test]
fn fail_deferment_refuses_while_saturated() {
    let (_temp, recorder, runtime) = single_worker(DefermentKind::Fail);
    let addr = runtime.tcp_addrs()[0];
    let workers = runtime.server().dispatcher().workers();
    let client = tcp_client(addr);

    send(&client, addr, &call(1, PROC_MUTATE, b"hold"));
    assert!(recorder.wait_runs(1));
    let (xid, stat, _) = accepted(&exchange(&client, addr, &call(2, PROC_MUTATE, b"free")));
    assert_eq!((xid, stat), (2, SYSTEM_ERR));
    assert_eq!(recorder.runs(), 1);
    assert_eq!(workers.deferred_count(), 0);

    recorder.release();
    let (xid, stat, _) = accepted(&recv(&client));
    assert_eq!((xid, stat), (1, SUCCESS));

    // The refused call left nothing cached, so a retry executes.
    assert!(wait_for(Duration::from_secs(5), || workers.idle_count() == 1));
    let (xid, stat, results) = accepted(&exchange(&client, addr, &call(2, PROC_MUTATE, b"free")));
    assert_eq!((xid, stat), (2, SUCCESS));
    assert_eq!(&results[..], b"free");
    assert_eq!(recorder.runs(), 2);
    drop(client);
    runtime.shutdown();
}
