use std::fs::OpenOptions;
use std::path::Path;

use redox_log::{OutputBuilder, RedoxLogger};

pub fn output_level() -> log::LevelFilter {
    match std::env::var("FX3_LOG").as_deref() {
        Ok("trace") => log::LevelFilter::Trace,
        Ok("debug") => log::LevelFilter::Debug,
        Ok("warn") => log::LevelFilter::Warn,
        Ok("error") => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    }
}

pub fn file_level() -> log::LevelFilter {
    log::LevelFilter::Debug
}

/// Configures logging for one tool.
///
/// Everything at `output_level` or above goes to stderr with colors. When `logfile` is given, a
/// plain copy filtered at `file_level` is appended to it as well.
pub fn setup_logging(
    logfile: Option<&Path>,
    output_level: log::LevelFilter,
    file_level: log::LevelFilter,
) -> Result<(), log::SetLoggerError> {
    let mut logger = RedoxLogger::new().with_output(
        OutputBuilder::stderr()
            .with_filter(output_level)
            .with_ansi_escape_codes()
            .flush_on_newline(true)
            .build(),
    );

    if let Some(path) = logfile {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                logger = logger.with_output(
                    OutputBuilder::with_endpoint(file)
                        .with_filter(file_level)
                        .flush_on_newline(true)
                        .build(),
                )
            }
            Err(error) => eprintln!("Failed to open {}: {}", path.display(), error),
        }
    }

    logger.enable()?;
    Ok(())
}
