use predicates::prelude::*;
use tempfile::TempDir;

use super::nfsd;

#[test]
fn show_prints_resolved_sections() {
    let home = TempDir::new().unwrap();
    nfsd(home.path())
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[server]"))
        .stdout(predicate::str::contains("[drc]"));
}

#[test]
fn init_refuses_to_overwrite_without_force() {
    let home = TempDir::new().unwrap();
    let path = home.path().join("nfsd.toml");
    let path_arg = path.to_str().unwrap();

    nfsd(home.path())
        .args(["config", "init", "--config", path_arg])
        .assert()
        .success()
        .stdout(predicate::str::contains("wrote"));
    assert!(path.exists());

    nfsd(home.path())
        .args(["config", "init", "--config", path_arg])
        .assert()
        .failure();

    nfsd(home.path())
        .args(["config", "init", "--force", "--config", path_arg])
        .assert()
        .success();
}

#[test]
fn explicit_file_layers_over_defaults() {
    let home = TempDir::new().unwrap();
    let path = home.path().join("nfsd.toml");
    std::fs::write(&path, "[server]\npoll_interval_ms = 75\n").unwrap();

    nfsd(home.path())
        .args(["config", "show", "--config", path.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("poll_interval_ms = 75"));
}

#[test]
fn path_honors_config_dir_override() {
    let home = TempDir::new().unwrap();
    let expected = home.path().join("config");
    nfsd(home.path())
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains(expected.to_str().unwrap()));
}
