use std::fs;
use std::path::{Path, PathBuf};

use super::merge::{apply_env_overrides, merge_layers};
use super::{Config, ConfigError, ConfigLayer};

pub fn config_path() -> PathBuf {
    crate::paths::config_dir().join("config.toml")
}

/// Parse one config file. A missing file is `Ok(None)`.
pub fn load_layer(path: &Path) -> Result<Option<ConfigLayer>, ConfigError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    toml::from_str(&contents)
        .map(Some)
        .map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

pub fn load_user_config() -> Result<Option<ConfigLayer>, ConfigError> {
    load_layer(&config_path())
}

/// Defaults, then the user config, then `explicit`, then `NFSD_*` variables.
///
/// An explicit path must exist.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let user = load_user_config()?;
    let explicit = match explicit {
        Some(path) => Some(load_layer(path)?.ok_or_else(|| ConfigError::Read {
            path: path.to_path_buf(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        })?),
        None => None,
    };
    let mut config = merge_layers(user.into_iter().chain(explicit));
    apply_env_overrides(&mut config);
    Ok(config)
}

pub fn write_config(path: &Path, cfg: &Config) -> Result<(), ConfigError> {
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(dir).map_err(|source| ConfigError::Write {
        path: dir.to_path_buf(),
        source,
    })?;
    let contents = toml::to_string_pretty(cfg)?;
    let write_err = |source: std::io::Error| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    let temp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    fs::write(temp.path(), contents.as_bytes()).map_err(write_err)?;
    temp.persist(path).map_err(|err| write_err(err.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::core::NodeId;
    use crate::daemon::drc::AllocFailurePolicy;
    use crate::daemon::recovery::RecoveryKind;

    #[test]
    fn config_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.toml");
        let mut cfg = Config::default();
        cfg.node.name = NodeId::new("alpha").unwrap();
        cfg.server.tcp_listen = vec!["127.0.0.1:20490".into()];
        cfg.server.udp_listen = None;
        cfg.drc.on_alloc_failure = AllocFailurePolicy::FailClosed;
        cfg.drc.udp.checksum = false;
        cfg.recovery.backend = RecoveryKind::Cluster;
        cfg.lease.graceless = true;

        write_config(&path, &cfg).expect("write config");
        let loaded: Config = toml::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.node.name.as_str(), "alpha");
        assert_eq!(loaded.server.tcp_listen, vec!["127.0.0.1:20490".to_string()]);
        assert!(loaded.server.udp_listen.is_none());
        assert_eq!(loaded.drc.on_alloc_failure, AllocFailurePolicy::FailClosed);
        assert!(!loaded.drc.udp.checksum);
        assert_eq!(loaded.recovery.backend, RecoveryKind::Cluster);
        assert!(loaded.lease.graceless);
    }

    #[test]
    fn partial_layer_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nfsd.toml");
        fs::write(
            &path,
            "[drc]\nenabled = false\n[drc.tcp]\nsize = 10\n[lease]\nlifetime_secs = 5\n",
        )
        .unwrap();
        let layer = load_layer(&path).unwrap().unwrap();
        let config = merge_layers([layer]);
        assert!(!config.drc.enabled);
        assert_eq!(config.drc.tcp.size, 10);
        assert_eq!(config.drc.tcp.npart, Config::default().drc.tcp.npart);
        assert_eq!(config.lease.lifetime_secs, 5);
        assert!(load_layer(&dir.path().join("missing.toml")).unwrap().is_none());
    }

    #[test]
    fn malformed_layer_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[drc\n").unwrap();
        let err = load_layer(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn defaults_fail_open_with_udp_checksums() {
        let cfg = Config::default();
        assert_eq!(cfg.drc.on_alloc_failure, AllocFailurePolicy::FailOpen);
        assert!(cfg.drc.udp.checksum);
        let settings = cfg.drc.settings(&cfg.limits);
        assert!(settings.enabled);
        assert!(settings.udp.checksum);
        assert_eq!(settings.tcp.on_alloc_failure, AllocFailurePolicy::FailOpen);
    }
}
