use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use tempfile::TempDir;

use nfsd_rs::daemon::interp::OpFlags;
use nfsd_rs::daemon::proto::ninep::{self, ENOTSUP};
use nfsd_rs::daemon::{FlushHook, FlushOutcome, FlushRegistry, Runtime};

use crate::fixtures::rig::{
    Recorder, local_config, ninep_client, recorder_handler, recorder_ops, recv, send, start, wait_for,
};

const TREAD: u8 = 116;

fn ninep_runtime(temp: &TempDir, recorder: &Arc<Recorder>) -> Runtime {
    let mut config = local_config(temp.path());
    config.server.ninep_listen = Some("127.0.0.1:0".into());
    start(config, recorder_ops(recorder).with_ninep(TREAD, recorder_handler(recorder, OpFlags::READ)))
}

#[test]
fn flush_reply_follows_the_flushed_reply() {
    let temp = TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::default());
    let runtime = ninep_runtime(&temp, &recorder);
    let addr = runtime.ninep_addr().unwrap();
    let client = ninep_client(addr);

    send(&client, addr, &ninep::encode_message(TREAD, 5, b"hold"));
    assert!(recorder.wait_runs(1));
    send(&client, addr, &ninep::encode_tflush(6, 5));
    std::thread::sleep(Duration::from_millis(20));
    recorder.release();

    assert_eq!(&recv(&client)[..], &ninep::encode_message(TREAD + 1, 5, b"hold")[..]);
    assert_eq!(&recv(&client)[..], &ninep::encode_rflush(6)[..]);

    drop(client);
    runtime.shutdown();
}

#[test]
fn flush_of_unknown_tag_and_unknown_message_are_answered() {
    let temp = TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::default());
    let runtime = ninep_runtime(&temp, &recorder);
    let addr = runtime.ninep_addr().unwrap();
    let client = ninep_client(addr);

    send(&client, addr, &ninep::encode_tflush(1, 77));
    assert_eq!(&recv(&client)[..], &ninep::encode_rflush(1)[..]);

    send(&client, addr, &ninep::encode_message(200, 2, b""));
    assert_eq!(&recv(&client)[..], &ninep::encode_rlerror(2, ENOTSUP)[..]);

    send(&client, addr, &ninep::encode_message(TREAD, 3, b"data"));
    assert_eq!(&recv(&client)[..], &ninep::encode_message(TREAD + 1, 3, b"data")[..]);
    assert_eq!(recorder.runs(), 1);

    drop(client);
    runtime.shutdown();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn flush_claims_oldest_earlier_request_and_waits_for_it(
        tags in proptest::collection::vec(0u16..4, 1..12),
        oldtag in 0u16..4,
        cut in 0usize..13,
    ) {
        let registry = Arc::new(FlushRegistry::new(4));
        let hooks: Vec<FlushHook> = tags
            .iter()
            .enumerate()
            .map(|(i, tag)| registry.register(*tag, i as u64 + 1))
            .collect();
        // Requests with a lower sequence number arrived before the flush.
        let flush_seq = cut.min(tags.len()) as u64 + 1;
        let expected = tags
            .iter()
            .enumerate()
            .map(|(i, tag)| (i as u64 + 1, *tag))
            .filter(|(seq, tag)| *tag == oldtag && *seq < flush_seq)
            .map(|(seq, _)| seq)
            .min();

        let (tx, rx) = crossbeam::channel::bounded(1);
        let flusher = {
            let registry = registry.clone();
            std::thread::spawn(move || tx.send(registry.flush(oldtag, flush_seq)).unwrap())
        };

        match expected {
            None => {
                let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
                prop_assert_eq!(outcome, FlushOutcome::NoMatch);
                for hook in hooks {
                    registry.complete(hook);
                }
            }
            Some(victim) => {
                prop_assert!(wait_for(Duration::from_secs(5), || registry.claimed() == 1));
                let mut held = None;
                for hook in hooks {
                    if hook.seq() == victim {
                        held = Some(hook);
                    } else {
                        registry.complete(hook);
                    }
                }
                prop_assert!(rx.recv_timeout(Duration::from_millis(5)).is_err());
                registry.complete(held.unwrap());
                let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
                prop_assert_eq!(outcome, FlushOutcome::Flushed { seq: victim });
            }
        }
        flusher.join().unwrap();
        prop_assert_eq!(registry.pending(), 0);
    }
}
