pub(super) mod config;
pub(super) mod grace;
pub(super) mod run;

pub use config::ConfigCmd;
pub use grace::{GraceArgs, GraceCmd};
