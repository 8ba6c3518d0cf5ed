use std::str::FromStr;

use crate::core::NodeId;
use crate::daemon::drc::AllocFailurePolicy;
use crate::daemon::recovery::RecoveryKind;

use super::{Config, ConfigLayer};

/// Apply layers over the defaults, later layers winning.
pub fn merge_layers(layers: impl IntoIterator<Item = ConfigLayer>) -> Config {
    let mut config = Config::default();
    for layer in layers {
        layer.apply_to(&mut config);
    }
    config
}

pub fn apply_env_overrides(config: &mut Config) {
    apply_env_overrides_from(config, |key| std::env::var(key).ok());
}

/// Apply `NFSD_*` overrides read through `lookup`. Unparseable values are
/// ignored with a warning.
pub fn apply_env_overrides_from(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    let var = |key: &str| {
        lookup(key)
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
    };

    if let Some(raw) = var("NFSD_NODE") {
        match NodeId::new(raw) {
            Ok(node) => config.node.name = node,
            Err(err) => tracing::warn!("invalid NFSD_NODE, ignoring: {err}"),
        }
    }
    if let Some(epoch) = parsed::<u32>(&var, "NFSD_EPOCH") {
        config.node.epoch = Some(epoch);
    }

    if let Some(raw) = var("NFSD_TCP_LISTEN") {
        config.server.tcp_listen = raw
            .split(',')
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(raw) = var("NFSD_UDP_LISTEN") {
        config.server.udp_listen = (raw != "off").then_some(raw);
    }
    if let Some(raw) = var("NFSD_NINEP_LISTEN") {
        config.server.ninep_listen = (raw != "off").then_some(raw);
    }

    if let Some(enabled) = parsed::<bool>(&var, "NFSD_DRC_ENABLED") {
        config.drc.enabled = enabled;
    }
    if let Some(raw) = var("NFSD_DRC_ON_ALLOC_FAILURE") {
        match raw.as_str() {
            "fail_open" => config.drc.on_alloc_failure = AllocFailurePolicy::FailOpen,
            "fail_closed" => config.drc.on_alloc_failure = AllocFailurePolicy::FailClosed,
            other => tracing::warn!("invalid NFSD_DRC_ON_ALLOC_FAILURE `{other}`, ignoring"),
        }
    }

    if let Some(secs) = parsed::<u64>(&var, "NFSD_LEASE_LIFETIME_SECS") {
        config.lease.lifetime_secs = secs;
    }
    if let Some(secs) = parsed::<u64>(&var, "NFSD_GRACE_SECS") {
        config.lease.grace_secs = secs;
    }
    if let Some(graceless) = parsed::<bool>(&var, "NFSD_GRACELESS") {
        config.lease.graceless = graceless;
    }

    if let Some(max) = parsed::<usize>(&var, "NFSD_WORKERS_MAX") {
        config.workers.thr_max = max;
    }

    if let Some(raw) = var("NFSD_RECOVERY_BACKEND") {
        match raw.as_str() {
            "fs" => config.recovery.backend = RecoveryKind::Fs,
            "kv" => config.recovery.backend = RecoveryKind::Kv,
            "cluster" => config.recovery.backend = RecoveryKind::Cluster,
            other => tracing::warn!("invalid NFSD_RECOVERY_BACKEND `{other}`, ignoring"),
        }
    }
    if let Some(root) = var("NFSD_RECOVERY_ROOT") {
        config.recovery.root = Some(root.into());
    }
    if let Some(db) = var("NFSD_GRACE_DB") {
        config.recovery.cluster_db = Some(db.into());
    }
}

fn parsed<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = var(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!("invalid {key}, ignoring: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    use crate::config::{DrcConfigOverride, LeaseConfigOverride};

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn merge_layers_respects_precedence() {
        let user = ConfigLayer {
            lease: LeaseConfigOverride {
                lifetime_secs: Some(30),
                grace_secs: Some(45),
                ..LeaseConfigOverride::default()
            },
            ..ConfigLayer::default()
        };
        let explicit = ConfigLayer {
            lease: LeaseConfigOverride {
                lifetime_secs: Some(90),
                ..LeaseConfigOverride::default()
            },
            drc: DrcConfigOverride {
                enabled: Some(false),
                ..DrcConfigOverride::default()
            },
            ..ConfigLayer::default()
        };

        let config = merge_layers([user, explicit]);
        assert_eq!(config.lease.lifetime_secs, 90);
        assert_eq!(config.lease.grace_secs, 45);
        assert!(!config.drc.enabled);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = Config::default();
        apply_env_overrides_from(
            &mut config,
            env(&[
                ("NFSD_NODE", "beta"),
                ("NFSD_TCP_LISTEN", "127.0.0.1:1, 127.0.0.1:2"),
                ("NFSD_UDP_LISTEN", "off"),
                ("NFSD_DRC_ON_ALLOC_FAILURE", "fail_closed"),
                ("NFSD_GRACELESS", "true"),
                ("NFSD_RECOVERY_BACKEND", "kv"),
            ]),
        );
        assert_eq!(config.node.name.as_str(), "beta");
        assert_eq!(config.server.tcp_listen.len(), 2);
        assert!(config.server.udp_listen.is_none());
        assert_eq!(config.drc.on_alloc_failure, AllocFailurePolicy::FailClosed);
        assert!(config.lease.graceless);
        assert_eq!(config.recovery.backend, RecoveryKind::Kv);
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut config = Config::default();
        apply_env_overrides_from(
            &mut config,
            env(&[
                ("NFSD_NODE", "has/slash"),
                ("NFSD_LEASE_LIFETIME_SECS", "soon"),
                ("NFSD_RECOVERY_BACKEND", "tape"),
                ("NFSD_WORKERS_MAX", " "),
            ]),
        );
        let defaults = Config::default();
        assert_eq!(config.node.name, defaults.node.name);
        assert_eq!(config.lease.lifetime_secs, defaults.lease.lifetime_secs);
        assert_eq!(config.recovery.backend, defaults.recovery.backend);
        assert_eq!(config.workers.thr_max, defaults.workers.thr_max);
    }
}
