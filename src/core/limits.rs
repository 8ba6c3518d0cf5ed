//! Protocol and concurrency bounds (normative defaults).

use serde::{Deserialize, Serialize};

/// Bounds shared by the dispatch core.
///
/// Values are explicit about their units to avoid confusion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Largest request or reply accepted on any transport.
    pub max_msg_bytes: usize,
    /// Duplicates that may queue behind one in-flight DRC entry.
    pub max_dup_waiters: usize,
    /// Completed entries retired per `finish` call.
    pub max_retire_per_finish: usize,
    /// Initial retire window after the first duplicate hit.
    pub retire_window_start_bias: u32,
    /// Call body prefix folded into DRC checksums.
    pub checksum_prefix_bytes: usize,
    /// Flush registry buckets per connection.
    pub flush_buckets: usize,
    /// Threads spawned per fridge `run` to drain deferred work.
    pub max_spawn_per_start: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_msg_bytes: 1024 * 1024 + 64 * 1024,
            max_dup_waiters: 3,
            max_retire_per_finish: 5,
            retire_window_start_bias: 16,
            checksum_prefix_bytes: 256,
            flush_buckets: 64,
            max_spawn_per_start: 50,
        }
    }
}

impl Limits {
    /// Clamp values that would make the core misbehave.
    pub fn normalized(mut self) -> Self {
        if self.flush_buckets == 0 {
            self.flush_buckets = 1;
        }
        if self.max_msg_bytes < 64 {
            self.max_msg_bytes = 64;
        }
        if self.max_spawn_per_start == 0 {
            self.max_spawn_per_start = 1;
        }
        self
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsOverride {
    pub max_msg_bytes: Option<usize>,
    pub max_dup_waiters: Option<usize>,
    pub max_retire_per_finish: Option<usize>,
    pub retire_window_start_bias: Option<u32>,
    pub checksum_prefix_bytes: Option<usize>,
    pub flush_buckets: Option<usize>,
    pub max_spawn_per_start: Option<usize>,
}

impl LimitsOverride {
    pub fn apply_to(&self, target: &mut Limits) {
        if let Some(value) = self.max_msg_bytes {
            target.max_msg_bytes = value;
        }
        if let Some(value) = self.max_dup_waiters {
            target.max_dup_waiters = value;
        }
        if let Some(value) = self.max_retire_per_finish {
            target.max_retire_per_finish = value;
        }
        if let Some(value) = self.retire_window_start_bias {
            target.retire_window_start_bias = value;
        }
        if let Some(value) = self.checksum_prefix_bytes {
            target.checksum_prefix_bytes = value;
        }
        if let Some(value) = self.flush_buckets {
            target.flush_buckets = value;
        }
        if let Some(value) = self.max_spawn_per_start {
            target.max_spawn_per_start = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_clamps_degenerate_values() {
        let limits = Limits {
            flush_buckets: 0,
            max_msg_bytes: 1,
            max_spawn_per_start: 0,
            ..Limits::default()
        }
        .normalized();
        assert_eq!(limits.flush_buckets, 1);
        assert_eq!(limits.max_msg_bytes, 64);
        assert_eq!(limits.max_spawn_per_start, 1);
    }

    #[test]
    fn override_only_touches_set_fields() {
        let mut limits = Limits::default();
        let layer = LimitsOverride {
            max_dup_waiters: Some(5),
            ..LimitsOverride::default()
        };
        layer.apply_to(&mut limits);
        assert_eq!(limits.max_dup_waiters, 5);
        assert_eq!(limits.flush_buckets, 64);
    }
}
