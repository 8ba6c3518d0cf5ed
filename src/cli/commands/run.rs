use crate::Result;
use crate::cli::Ctx;

pub(crate) fn handle(ctx: &Ctx) -> Result<()> {
    let config = crate::config::load(ctx.config_path.as_deref())?;
    crate::daemon::run_server(config, ctx.config_path.clone())
}
