use std::io::ErrorKind;

use clap::Subcommand;

use crate::Result;
use crate::cli::Ctx;
use crate::config::{self, Config, ConfigError};

#[derive(Subcommand, Debug)]
pub enum ConfigCmd {
    /// Print the resolved config (defaults, files, then environment).
    Show,

    /// Write the default config to `--config` or the user config path.
    Init {
        /// Replace an existing file.
        #[arg(long)]
        force: bool,
    },

    /// Print where the user config lives.
    Path,
}

pub(crate) fn handle(ctx: &Ctx, cmd: ConfigCmd) -> Result<()> {
    match cmd {
        ConfigCmd::Show => {
            let resolved = config::load(ctx.config_path.as_deref())?;
            let rendered = toml::to_string_pretty(&resolved).map_err(ConfigError::from)?;
            print!("{rendered}");
        }
        ConfigCmd::Init { force } => {
            let path = ctx.config_path.clone().unwrap_or_else(config::config_path);
            if path.exists() && !force {
                return Err(ConfigError::Write {
                    path,
                    source: ErrorKind::AlreadyExists.into(),
                }
                .into());
            }
            config::write_config(&path, &Config::default())?;
            println!("wrote {}", path.display());
        }
        ConfigCmd::Path => println!("{}", config::config_path().display()),
    }
    Ok(())
}
