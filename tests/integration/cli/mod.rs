use std::path::Path;

use assert_cmd::Command;

mod config;
mod grace;

/// `nfsd` with config and data directories confined to `home`.
fn nfsd(home: &Path) -> Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("nfsd");
    cmd.env("NFSD_CONFIG_DIR", home.join("config"));
    cmd.env("NFSD_DATA_DIR", home.join("data"));
    cmd.env_remove("LOG");
    cmd
}
