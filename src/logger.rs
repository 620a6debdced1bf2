use dirs::home_dir;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, time::FormatTime},
    prelude::*,
    EnvFilter,
};

pub fn setup_logging(verbose: bool) -> Result<WorkerGuard, io::Error> {
    setup_logging_with_output_format(verbose, false)
}

/// File logging always; stdout logging unless `json_output`, which keeps
/// stdout clean for machine-readable output.
pub fn setup_logging_with_output_format(
    verbose: bool,
    json_output: bool,
) -> Result<WorkerGuard, io::Error> {
    setup_logging_to(&get_log_file_path()?, verbose, json_output)
}

pub fn setup_logging_to(
    log_file: &Path,
    verbose: bool,
    json_output: bool,
) -> Result<WorkerGuard, io::Error> {
    if let Some(parent) = log_file.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file_appender = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = build_filter(verbose);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_timer(ChronoLocalTimer)
        .with_filter(env_filter.clone());

    // A subscriber may already be installed (tests); keep it.
    if json_output {
        let _ = tracing::subscriber::set_global_default(
            tracing_subscriber::registry().with(file_layer),
        );
    } else {
        let stdout_layer = fmt::layer()
            .with_writer(io::stdout)
            .with_ansi(true)
            .with_timer(ChronoLocalTimer)
            .with_filter(env_filter);

        let _ = tracing::subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(file_layer)
                .with(stdout_layer),
        );
    }

    Ok(guard)
}

fn build_filter(verbose: bool) -> EnvFilter {
    let log_level = if verbose { Level::DEBUG } else { Level::INFO };
    EnvFilter::new(format!(
        "fortune_sync={},warn",
        log_level.as_str().to_lowercase()
    ))
}

fn get_log_file_path() -> Result<PathBuf, io::Error> {
    let mut path = home_dir()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Could not find home directory"))?;

    path.push(".fortune-sync.log");
    Ok(path)
}

struct ChronoLocalTimer;

impl FormatTime for ChronoLocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = chrono::Local::now();
        write!(w, "{}", now.format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}
