use nfsd_rs::{cli, config, telemetry};

fn main() {
    let cli = cli::parse_from(std::env::args_os());

    let _telemetry_guard = init_tracing(cli.verbose, cli.config.as_deref());

    if let Err(e) = cli::run(cli) {
        tracing::error!(transience = ?e.transience(), effect = e.effect().as_str(), "error: {}", e);
        std::process::exit(1);
    }
}

fn init_tracing(verbose: u8, explicit: Option<&std::path::Path>) -> telemetry::TelemetryGuard {
    let cfg = match config::load(explicit) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("config load failed, using defaults: {err}");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };
    let telemetry_cfg = telemetry::TelemetryConfig::new(verbose, cfg.logging);
    telemetry::init(telemetry_cfg)
}
