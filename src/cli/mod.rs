//! CLI surface for nfsd.
//!
//! `run` is the server itself; `config` and `grace` are offline tools that
//! never touch a running process.

use std::ffi::OsString;
use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand, builder::BoolishValueParser};

use crate::Result;

mod commands;

pub use commands::{ConfigCmd, GraceArgs, GraceCmd};

// =============================================================================
// Entry + global options
// =============================================================================

#[derive(Parser, Debug)]
#[command(
    name = "nfsd",
    version,
    about = "NFS and 9P request dispatch server",
    infer_subcommands = true,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Machine-readable JSON output where a command supports it.
    #[arg(
        long,
        global = true,
        default_value_t = false,
        num_args = 0..=1,
        value_parser = BoolishValueParser::new()
    )]
    pub json: bool,

    /// Config file layered over the user config.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log more (repeat for more).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the server in the foreground.
    Run,

    /// Inspect or create the config file.
    Config {
        #[command(subcommand)]
        cmd: ConfigCmd,
    },

    /// Administer a clustered grace database.
    Grace(GraceArgs),
}

// =============================================================================
// Dispatch
// =============================================================================

pub(crate) struct Ctx {
    pub config_path: Option<PathBuf>,
    pub json: bool,
}

pub fn parse_from<I, T>(args: I) -> Cli
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Cli::parse_from(args)
}

pub fn run(cli: Cli) -> Result<()> {
    let ctx = Ctx {
        config_path: cli.config,
        json: cli.json,
    };
    match cli.command {
        Commands::Run => commands::run::handle(&ctx),
        Commands::Config { cmd } => commands::config::handle(&ctx, cmd),
        Commands::Grace(args) => commands::grace::handle(&ctx, args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_grace_commands_with_nodes() {
        let cli = parse_from(["nfsd", "grace", "--db", "/tmp/g", "start", "node0", "node1"]);
        let Commands::Grace(args) = cli.command else {
            panic!("expected grace command");
        };
        assert_eq!(args.db, Some(PathBuf::from("/tmp/g")));
        match args.cmd {
            GraceCmd::Start { nodes } => {
                let names: Vec<_> = nodes.iter().map(|n| n.as_str()).collect();
                assert_eq!(names, ["node0", "node1"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn verbosity_counts_and_config_is_global() {
        let cli = parse_from(["nfsd", "-vv", "config", "show", "--config", "/etc/nfsd.toml"]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/nfsd.toml")));
        assert!(matches!(cli.command, Commands::Config { cmd: ConfigCmd::Show }));
    }

    #[test]
    fn invalid_node_name_is_rejected() {
        let err = Cli::try_parse_from(["nfsd", "grace", "add", "bad/name"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }
}
