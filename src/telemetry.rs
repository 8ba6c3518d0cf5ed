use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::config::{FileLoggingConfig, LogFormat, LogRotation, LoggingConfig};
use crate::paths;

const LOG_FILE_PREFIX: &str = "nfsd.log";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    pub verbosity: u8,
    pub logging: LoggingConfig,
}

impl TelemetryConfig {
    pub fn new(verbosity: u8, logging: LoggingConfig) -> Self {
        Self { verbosity, logging }
    }
}

/// Keeps the non-blocking file writers flushing until dropped.
pub struct TelemetryGuard {
    _guards: Vec<tracing_appender::non_blocking::WorkerGuard>,
}

/// Install the global subscriber. `LOG` overrides the verbosity-derived level;
/// the config's `filter` is used when `LOG` is unset.
pub fn init(config: TelemetryConfig) -> TelemetryGuard {
    let builder = EnvFilter::builder()
        .with_default_directive(level_from_verbosity(config.verbosity).into())
        .with_env_var("LOG");
    let filter = match (&config.logging.filter, std::env::var_os("LOG")) {
        (Some(directives), None) => builder.parse_lossy(directives),
        _ => builder.from_env_lossy(),
    };

    let mut guards = Vec::new();
    let mut layers: Vec<BoxedLayer> = Vec::new();

    if config.logging.stdout {
        layers.push(build_stdout_layer(config.logging.stdout_format));
    }

    let mut pruned = None;
    let mut setup_error = None;
    if config.logging.file.enabled {
        let dir = config.logging.file.dir.clone().unwrap_or_else(paths::log_dir);
        match fs::create_dir_all(&dir) {
            Ok(()) => {
                let retention = RetentionLimits::from_file_config(&config.logging.file);
                if retention.is_enabled() {
                    match prune_logs(&dir, LOG_FILE_PREFIX, retention, SystemTime::now()) {
                        Ok(removed) => pruned = Some(removed),
                        Err(err) => setup_error = Some(format!("log retention failed: {err}")),
                    }
                }
                let (layer, guard) = build_file_layer(&config.logging.file, &dir);
                layers.push(layer);
                guards.push(guard);
            }
            Err(err) => {
                setup_error = Some(format!("log dir init failed for {}: {err}", dir.display()));
            }
        }
    }

    layers.push(Box::new(filter));
    // A second init (tests, embedded use) keeps the first subscriber.
    let _ = Registry::default().with(layers).try_init();

    if let Some(removed) = pruned
        && removed > 0
    {
        tracing::info!(pruned = removed, "log retention applied");
    }
    if let Some(error) = setup_error {
        tracing::warn!("{error}");
    }

    TelemetryGuard { _guards: guards }
}

fn build_stdout_layer(format: LogFormat) -> BoxedLayer {
    match format {
        LogFormat::Tree => Box::new(
            tracing_tree::HierarchicalLayer::new(2)
                .with_writer(std::io::stderr)
                .with_thread_names(true),
        ),
        LogFormat::Pretty => Box::new(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(std::io::stderr)
                .with_thread_names(true),
        ),
        LogFormat::Compact => Box::new(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_thread_names(true),
        ),
        LogFormat::Json => Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_thread_names(true)
                .with_current_span(true),
        ),
    }
}

fn build_file_layer(
    config: &FileLoggingConfig,
    dir: &Path,
) -> (BoxedLayer, tracing_appender::non_blocking::WorkerGuard) {
    let rotation = match config.rotation {
        LogRotation::Daily => tracing_appender::rolling::Rotation::DAILY,
        LogRotation::Hourly => tracing_appender::rolling::Rotation::HOURLY,
        LogRotation::Minutely => tracing_appender::rolling::Rotation::MINUTELY,
        LogRotation::Never => tracing_appender::rolling::Rotation::NEVER,
    };
    let appender =
        tracing_appender::rolling::RollingFileAppender::new(rotation, dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer: BoxedLayer = match config.format {
        LogFormat::Tree => Box::new(
            tracing_tree::HierarchicalLayer::new(2)
                .with_ansi(false)
                .with_writer(writer),
        ),
        LogFormat::Pretty | LogFormat::Compact => Box::new(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_names(true),
        ),
        LogFormat::Json => Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_thread_names(true)
                .with_current_span(true),
        ),
    };
    (layer, guard)
}

fn level_from_verbosity(verbosity: u8) -> tracing::metadata::LevelFilter {
    match verbosity {
        0 => tracing::metadata::LevelFilter::WARN,
        1 => tracing::metadata::LevelFilter::INFO,
        2 => tracing::metadata::LevelFilter::DEBUG,
        _ => tracing::metadata::LevelFilter::TRACE,
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct RetentionLimits {
    max_age: Option<Duration>,
    max_files: Option<usize>,
}

impl RetentionLimits {
    fn from_file_config(config: &FileLoggingConfig) -> Self {
        Self {
            max_age: config
                .retention_max_age_days
                .map(|days| Duration::from_secs(days.saturating_mul(24 * 60 * 60))),
            max_files: config.retention_max_files,
        }
    }

    fn is_enabled(&self) -> bool {
        self.max_age.is_some() || self.max_files.is_some()
    }
}

/// Remove rotated logs past retention; returns how many were removed.
fn prune_logs(
    dir: &Path,
    prefix: &str,
    retention: RetentionLimits,
    now: SystemTime,
) -> std::io::Result<usize> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let matches = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(prefix));
        let meta = entry.metadata()?;
        if matches && meta.is_file() {
            entries.push((path, meta.modified().unwrap_or(now)));
        }
    }
    let doomed = select_expired(entries, retention, now);
    Ok(doomed
        .iter()
        .filter(|path| fs::remove_file(path).is_ok())
        .count())
}

fn select_expired(
    mut entries: Vec<(PathBuf, SystemTime)>,
    retention: RetentionLimits,
    now: SystemTime,
) -> Vec<PathBuf> {
    // Newest first, so everything past `max_files` is the tail.
    entries.sort_by(|a, b| b.1.cmp(&a.1));
    entries
        .into_iter()
        .enumerate()
        .filter(|(index, (_, modified))| {
            let too_old = retention.max_age.is_some_and(|max_age| {
                now.duration_since(*modified).unwrap_or(Duration::ZERO) > max_age
            });
            let too_many = retention.max_files.is_some_and(|max| *index >= max);
            too_old || too_many
        })
        .map(|(_, (path, _))| path)
        .collect()
}
