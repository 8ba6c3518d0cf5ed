//! Per-connection 9P flush registry.
//!
//! Every admitted request registers `(tag, seq)`. A Tflush for `oldtag` with
//! its own sequence number `S` claims the oldest unclaimed pending request
//! with that tag and a sequence below `S`, then blocks until that request has
//! sent its reply. The flusher sleeps on its own handshake condvar paired with
//! the bucket mutex; completers only take the bucket lock.

use std::sync::{Arc, Condvar, Mutex};

struct FlushHandshake {
    done: Condvar,
}

struct PendingHook {
    seq: u64,
    tag: u16,
    claimed: Option<Arc<FlushHandshake>>,
}

#[derive(Default)]
struct Bucket {
    pending: Vec<PendingHook>,
    /// Handshakes whose request completed; removed by the woken flusher.
    completed: Vec<Arc<FlushHandshake>>,
}

/// Admission record for one request; hand back to [`FlushRegistry::complete`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a flush hook must be completed"]
pub struct FlushHook {
    tag: u16,
    seq: u64,
}

impl FlushHook {
    pub fn tag(&self) -> u16 {
        self.tag
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushOutcome {
    /// No older pending request carried the tag.
    NoMatch,
    /// The claimed request completed.
    Flushed { seq: u64 },
}

pub struct FlushRegistry {
    buckets: Vec<Mutex<Bucket>>,
}

impl FlushRegistry {
    pub fn new(buckets: usize) -> Self {
        Self {
            buckets: (0..buckets.max(1)).map(|_| Mutex::new(Bucket::default())).collect(),
        }
    }

    fn bucket(&self, tag: u16) -> &Mutex<Bucket> {
        &self.buckets[tag as usize % self.buckets.len()]
    }

    pub fn register(&self, tag: u16, seq: u64) -> FlushHook {
        self.bucket(tag)
            .lock()
            .expect("flush bucket lock poisoned")
            .pending
            .push(PendingHook {
                seq,
                tag,
                claimed: None,
            });
        FlushHook { tag, seq }
    }

    /// Remove the request's hook, signalling its flusher if it was claimed.
    pub fn complete(&self, hook: FlushHook) {
        let mut bucket = self.bucket(hook.tag).lock().expect("flush bucket lock poisoned");
        let Some(pos) = bucket
            .pending
            .iter()
            .position(|pending| pending.seq == hook.seq && pending.tag == hook.tag)
        else {
            return;
        };
        let pending = bucket.pending.swap_remove(pos);
        if let Some(handshake) = pending.claimed {
            handshake.done.notify_all();
            bucket.completed.push(handshake);
        }
    }

    /// Block until the request the flush claims has completed.
    pub fn flush(&self, tag: u16, seq: u64) -> FlushOutcome {
        let mut bucket = self.bucket(tag).lock().expect("flush bucket lock poisoned");
        let victim = bucket
            .pending
            .iter_mut()
            .filter(|pending| pending.tag == tag && pending.seq < seq && pending.claimed.is_none())
            .min_by_key(|pending| pending.seq);
        let Some(victim) = victim else {
            return FlushOutcome::NoMatch;
        };
        let claimed_seq = victim.seq;
        let handshake = Arc::new(FlushHandshake {
            done: Condvar::new(),
        });
        victim.claimed = Some(handshake.clone());
        tracing::debug!(tag, seq, claimed = claimed_seq, "flush claimed request");
        loop {
            if let Some(pos) = bucket
                .completed
                .iter()
                .position(|done| Arc::ptr_eq(done, &handshake))
            {
                bucket.completed.swap_remove(pos);
                return FlushOutcome::Flushed { seq: claimed_seq };
            }
            bucket = handshake.done.wait(bucket).expect("flush bucket lock poisoned");
        }
    }

    pub fn pending(&self) -> usize {
        self.buckets
            .iter()
            .map(|bucket| bucket.lock().expect("flush bucket lock poisoned").pending.len())
            .sum()
    }

    /// Pending requests a flush is waiting on.
    pub fn claimed(&self) -> usize {
        self.buckets
            .iter()
            .map(|bucket| {
                bucket
                    .lock()
                    .expect("flush bucket lock poisoned")
                    .pending
                    .iter()
                    .filter(|pending| pending.claimed.is_some())
                    .count()
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn flush_without_match_is_a_noop() {
        let registry = FlushRegistry::new(64);
        assert_eq!(registry.flush(3, 10), FlushOutcome::NoMatch);
        let hook = registry.register(3, 11);
        assert_eq!(registry.flush(3, 10), FlushOutcome::NoMatch);
        registry.complete(hook);
        assert_eq!(registry.pending(), 0);
    }

    #[test]
    fn flush_waits_for_completion() {
        let registry = Arc::new(FlushRegistry::new(64));
        let hook = registry.register(7, 1);
        let completed = Arc::new(AtomicBool::new(false));

        let flusher = {
            let registry = registry.clone();
            let completed = completed.clone();
            thread::spawn(move || {
                let outcome = registry.flush(7, 2);
                assert!(completed.load(Ordering::SeqCst));
                outcome
            })
        };
        while registry.claimed() < 1 {
            thread::sleep(Duration::from_millis(1));
        }
        completed.store(true, Ordering::SeqCst);
        registry.complete(hook);
        assert_eq!(flusher.join().unwrap(), FlushOutcome::Flushed { seq: 1 });
    }

    #[test]
    fn flush_claims_oldest_unclaimed_entry() {
        let registry = Arc::new(FlushRegistry::new(4));
        let first = registry.register(5, 1);
        let second = registry.register(5, 2);
        // Same bucket, different tag.
        let other = registry.register(9, 3);

        let a = {
            let registry = registry.clone();
            thread::spawn(move || registry.flush(5, 10))
        };
        while registry.claimed() < 1 {
            thread::sleep(Duration::from_millis(1));
        }
        let b = {
            let registry = registry.clone();
            thread::spawn(move || registry.flush(5, 11))
        };
        while registry.claimed() < 2 {
            thread::sleep(Duration::from_millis(1));
        }

        registry.complete(other);
        registry.complete(second);
        assert_eq!(b.join().unwrap(), FlushOutcome::Flushed { seq: 2 });
        registry.complete(first);
        assert_eq!(a.join().unwrap(), FlushOutcome::Flushed { seq: 1 });
        assert_eq!(registry.pending(), 0);
    }
}
