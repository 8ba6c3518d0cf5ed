use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Subcommand};

use crate::Result;
use crate::cli::Ctx;
use crate::core::NodeId;
use crate::daemon::recovery::{FileClusterStore, GraceDb, GraceDbClient, RecoveryError};

#[derive(Args, Debug)]
pub struct GraceArgs {
    /// Grace database directory (default: `recovery.cluster_db` from config).
    #[arg(long, value_name = "PATH")]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: GraceCmd,
}

#[derive(Subcommand, Debug)]
pub enum GraceCmd {
    /// Print epochs and per-node flags.
    Dump,

    /// Start a grace period (or join the running one) for nodes.
    Start {
        #[arg(required = true)]
        nodes: Vec<NodeId>,
    },

    /// Join a running grace period; does nothing outside one.
    Join {
        #[arg(required = true)]
        nodes: Vec<NodeId>,
    },

    /// Clear the need-grace flag for nodes.
    Lift {
        #[arg(required = true)]
        nodes: Vec<NodeId>,
    },

    /// Set (or with `--off`, clear) the enforcing flag for nodes.
    Enforce {
        #[arg(long)]
        off: bool,
        #[arg(required = true)]
        nodes: Vec<NodeId>,
    },

    /// Exit non-zero unless every member enforces.
    Check { node: NodeId },

    /// Add nodes to the cluster.
    Add {
        #[arg(required = true)]
        nodes: Vec<NodeId>,
    },

    /// Remove nodes from the cluster.
    #[command(alias = "rm")]
    Remove {
        #[arg(required = true)]
        nodes: Vec<NodeId>,
    },
}

pub(crate) fn handle(ctx: &Ctx, args: GraceArgs) -> Result<()> {
    let dir = match args.db {
        Some(dir) => dir,
        None => crate::config::load(ctx.config_path.as_deref())?
            .recovery
            .cluster_db(),
    };
    let client = GraceDbClient::new(Arc::new(FileClusterStore::open(&dir)?));
    tracing::debug!(db = %dir.display(), "grace db opened");

    let db = match args.cmd {
        GraceCmd::Dump => client.read()?,
        GraceCmd::Start { nodes } => client.join(&nodes, true)?,
        GraceCmd::Join { nodes } => client.join(&nodes, false)?,
        GraceCmd::Lift { nodes } => client.lift(&nodes)?,
        GraceCmd::Enforce { off: false, nodes } => client.enforcing_on(&nodes)?,
        GraceCmd::Enforce { off: true, nodes } => client.enforcing_off(&nodes)?,
        GraceCmd::Add { nodes } => client.add(&nodes)?,
        GraceCmd::Remove { nodes } => client.remove(&nodes)?,
        GraceCmd::Check { node } => {
            let enforcing = client.enforcing_check(&node)?;
            println!("{}", if enforcing { "enforcing" } else { "not enforcing" });
            if !enforcing {
                std::process::exit(2);
            }
            return Ok(());
        }
    };
    print_db(&db, ctx.json)
}

fn print_db(db: &GraceDb, json: bool) -> Result<()> {
    if json {
        let rendered =
            serde_json::to_string_pretty(db).map_err(|source| RecoveryError::Serde {
                object: "grace db".to_string(),
                source,
            })?;
        println!("{rendered}");
    } else {
        print!("{}", db.dump());
    }
    Ok(())
}
