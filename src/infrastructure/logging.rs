//! Logging setup on top of `tracing-subscriber`.

use crate::domain::settings::{FileLogSettings, LogRotation, LogSettings};
use std::fs;
use std::str::FromStr;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Keeps the non-blocking file writer alive; drop it last.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_logger(settings: &LogSettings) -> anyhow::Result<LoggingGuard> {
    let level_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::from_str(&settings.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer = settings.console.then(|| {
        fmt::layer()
            .with_writer(std::io::stdout)
            .with_file(settings.source_location)
            .with_line_number(settings.source_location)
            .with_ansi(settings.ansi_colors)
    });

    let (file_layer, file_guard) = match &settings.file {
        Some(file) => {
            let (writer, guard) = tracing_appender::non_blocking(file_appender(file)?);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_file(settings.source_location)
                .with_line_number(settings.source_location)
                .with_thread_ids(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(level_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    match &settings.file {
        Some(file) => tracing::info!(
            "Logging at {} to console and {}",
            settings.level,
            file.dir.display()
        ),
        None => tracing::info!("Logging at {}", settings.level),
    }

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

fn file_appender(file: &FileLogSettings) -> anyhow::Result<RollingFileAppender> {
    fs::create_dir_all(&file.dir)?;
    Ok(RollingFileAppender::new(
        rotation(file.rotation),
        &file.dir,
        &file.prefix,
    ))
}

fn rotation(kind: LogRotation) -> Rotation {
    match kind {
        LogRotation::Daily => Rotation::DAILY,
        LogRotation::Hourly => Rotation::HOURLY,
        LogRotation::Minutely => Rotation::MINUTELY,
        LogRotation::Never => Rotation::NEVER,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_mapping() {
        assert_eq!(rotation(LogRotation::Daily), Rotation::DAILY);
        assert_eq!(rotation(LogRotation::Hourly), Rotation::HOURLY);
        assert_eq!(rotation(LogRotation::Minutely), Rotation::MINUTELY);
        assert_eq!(rotation(LogRotation::Never), Rotation::NEVER);
    }

    #[test]
    fn test_file_appender_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = FileLogSettings {
            dir: dir.path().join("nested").join("logs"),
            ..FileLogSettings::default()
        };
        file_appender(&file).unwrap();
        assert!(file.dir.is_dir());
    }
}
