use std::time::Duration;

use tempfile::TempDir;

use crate::fixtures::rig::{
    PROC_MUTATE, PROC_READ, Recorder, accepted, call, exchange, local_config, recorder_ops, start,
    tcp_client, wait_for,
};
use nfsd_rs::daemon::proto::rpc::SUCCESS;
use nfsd_rs::daemon::transport::{Channel, UdpChannel};

#[test]
fn tcp_retransmission_executes_once_across_reconnect() {
    let temp = TempDir::new().unwrap();
    let recorder = std::sync::Arc::new(Recorder::default());
    let runtime = start(local_config(temp.path()), recorder_ops(&recorder));
    let addr = runtime.tcp_addrs()[0];
    let msg = call(42, PROC_MUTATE, b"create-file");

    let client = tcp_client(addr);
    let first = exchange(&client, addr, &msg);
    let (xid, stat, results) = accepted(&first);
    assert_eq!((xid, stat), (42, SUCCESS));
    assert_eq!(&results[..], b"create-file");
    assert_eq!(exchange(&client, addr, &msg), first);
    assert_eq!(recorder.runs(), 1);

    // Same client address, new connection: the parked table answers.
    drop(client);
    assert!(wait_for(Duration::from_secs(5), || runtime
        .server()
        .connections()
        .is_empty()));
    assert_eq!(runtime.drc().recycled_len(), 1);
    let client = tcp_client(addr);
    assert_eq!(exchange(&client, addr, &msg), first);
    assert_eq!(recorder.runs(), 1);
    assert_eq!(runtime.drc().recycled_len(), 0);

    drop(client);
    runtime.shutdown();
}

#[test]
fn reused_xid_from_a_new_connection_does_not_replay_another_call() {
    let temp = TempDir::new().unwrap();
    let recorder = std::sync::Arc::new(Recorder::default());
    let mut config = local_config(temp.path());
    config.drc.tcp.checksum = false;
    let runtime = start(config, recorder_ops(&recorder));
    let addr = runtime.tcp_addrs()[0];

    let client = tcp_client(addr);
    exchange(&client, addr, &call(42, PROC_MUTATE, b"WRITE file A"));
    drop(client);
    assert!(wait_for(Duration::from_secs(5), || runtime
        .server()
        .connections()
        .is_empty()));
    assert_eq!(runtime.drc().recycled_len(), 1);

    // Another client on the same host starts its own xid space at 42.
    let client = tcp_client(addr);
    let reply = exchange(&client, addr, &call(42, PROC_MUTATE, b"REMOVE file B"));
    let (xid, stat, results) = accepted(&reply);
    assert_eq!((xid, stat), (42, SUCCESS));
    assert_eq!(&results[..], b"REMOVE file B");
    assert_eq!(recorder.runs(), 2);

    drop(client);
    runtime.shutdown();
}

#[test]
fn udp_retransmission_is_answered_from_cache() {
    let temp = TempDir::new().unwrap();
    let recorder = std::sync::Arc::new(Recorder::default());
    let mut config = local_config(temp.path());
    config.server.udp_listen = Some("127.0.0.1:0".into());
    let runtime = start(config, recorder_ops(&recorder));
    let server = runtime.udp_addr().unwrap();

    let client = UdpChannel::bind("127.0.0.1:0".parse().unwrap(), 65_536).unwrap();
    let msg = call(42, PROC_MUTATE, b"write");
    let first = exchange(&client, server, &msg);
    assert_eq!(exchange(&client, server, &msg), first);
    assert_eq!(recorder.runs(), 1);

    // Same xid, different arguments: the checksum keeps it apart.
    let other = exchange(&client, server, &call(42, PROC_MUTATE, b"other"));
    assert_ne!(other, first);
    assert_eq!(recorder.runs(), 2);

    client.close();
    runtime.shutdown();
}

#[test]
fn non_cacheable_and_disabled_cache_execute_every_time() {
    let temp = TempDir::new().unwrap();
    let recorder = std::sync::Arc::new(Recorder::default());
    let mut config = local_config(temp.path());
    let runtime = start(config.clone(), recorder_ops(&recorder));
    let addr = runtime.tcp_addrs()[0];
    let client = tcp_client(addr);
    let read = call(9, PROC_READ, b"getattr");
    exchange(&client, addr, &read);
    exchange(&client, addr, &read);
    assert_eq!(recorder.runs(), 2);
    drop(client);
    runtime.shutdown();

    let temp = TempDir::new().unwrap();
    config.recovery.root = Some(temp.path().to_path_buf());
    config.drc.enabled = false;
    let runtime = start(config, recorder_ops(&recorder));
    let addr = runtime.tcp_addrs()[0];
    let client = tcp_client(addr);
    let write = call(10, PROC_MUTATE, b"write");
    exchange(&client, addr, &write);
    exchange(&client, addr, &write);
    assert_eq!(recorder.runs(), 4);
    drop(client);
    runtime.shutdown();
}
