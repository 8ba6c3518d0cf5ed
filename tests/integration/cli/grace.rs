use predicates::prelude::*;
use tempfile::TempDir;

use super::nfsd;

#[test]
fn start_opens_a_new_epoch_for_members() {
    let home = TempDir::new().unwrap();
    let db = home.path().join("grace");
    let db = db.to_str().unwrap();

    nfsd(home.path())
        .args(["grace", "--db", db, "add", "node0", "node1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("cur=1 rec=0"));
    nfsd(home.path())
        .args(["grace", "--db", db, "start", "node0"])
        .assert()
        .success();
    nfsd(home.path())
        .args(["grace", "--db", db, "dump"])
        .assert()
        .success()
        .stdout(predicate::str::contains("cur=2 rec=1"))
        .stdout(predicate::str::contains("node0\tNE"))
        .stdout(predicate::str::contains("node1\t E"));

    nfsd(home.path())
        .args(["grace", "--db", db, "lift", "node0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("cur=2 rec=0"));
}

#[test]
fn check_exits_nonzero_once_a_member_stops_enforcing() {
    let home = TempDir::new().unwrap();
    let db = home.path().join("grace");
    let db = db.to_str().unwrap();

    nfsd(home.path())
        .args(["grace", "--db", db, "add", "node0", "node1"])
        .assert()
        .success();
    nfsd(home.path())
        .args(["grace", "--db", db, "check", "node0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("enforcing"));

    nfsd(home.path())
        .args(["grace", "--db", db, "enforce", "--off", "node1"])
        .assert()
        .success();
    nfsd(home.path())
        .args(["grace", "--db", db, "check", "node0"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("not enforcing"));
}

#[test]
fn json_dump_and_unknown_member() {
    let home = TempDir::new().unwrap();
    let db = home.path().join("grace");
    let db = db.to_str().unwrap();

    nfsd(home.path())
        .args(["grace", "--db", db, "add", "node0"])
        .assert()
        .success();
    let output = nfsd(home.path())
        .args(["--json", "grace", "--db", db, "dump"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["cur"], 1);
    assert_eq!(value["members"]["node0"], 2);

    nfsd(home.path())
        .args(["grace", "--db", db, "join", "ghost"])
        .assert()
        .failure();
}
