use crate::config::Config;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::EnvFilter;

const LOG_FILE_NAME: &str = "roster.log";

/// `--debug`/`ROSTER_DEBUG`, then `ROSTER_LOG_LEVEL`, then `info`.
/// `RUST_LOG` overrides all of them in [`init_logging`].
pub fn filter_directive(config: &Config) -> String {
    if config.debug {
        return "debug".to_string();
    }
    config
        .log_level
        .clone()
        .unwrap_or_else(|| "info".to_string())
}

/// Events go to stderr, and to `roster.log` under `log_dir` when one is set.
/// Stdout stays reserved for command output.
pub fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(config)));

    let (writer, log_file) = match open_log_file(Path::new(&config.log_dir)) {
        Ok(Some((path, file))) => (
            BoxMakeWriter::new(io::stderr.and(Arc::new(file))),
            Some(path),
        ),
        Ok(None) => (BoxMakeWriter::new(io::stderr), None),
        Err(err) => {
            eprintln!("roster: log file disabled: {err}");
            (BoxMakeWriter::new(io::stderr), None)
        }
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return;
    }
    if let Some(path) = log_file {
        tracing::debug!(event = "log_file_opened", path = %path.display());
    }
}

fn open_log_file(log_dir: &Path) -> io::Result<Option<(PathBuf, File)>> {
    if log_dir.as_os_str().is_empty() {
        return Ok(None);
    }
    std::fs::create_dir_all(log_dir)?;
    let path = log_dir.join(LOG_FILE_NAME);
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok(Some((path, file)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalArgs;

    fn config_with(debug: bool, level: Option<&str>) -> Config {
        let mut config = Config::resolve(&GlobalArgs::default(), |_| None);
        config.debug = debug;
        config.log_level = level.map(str::to_string);
        config
    }

    #[test]
    fn level_defaults_to_info_and_debug_wins() {
        assert_eq!(filter_directive(&config_with(false, None)), "info");
        assert_eq!(
            filter_directive(&config_with(false, Some("roster_sync=trace"))),
            "roster_sync=trace"
        );
        assert_eq!(filter_directive(&config_with(true, Some("warn"))), "debug");
    }

    #[test]
    fn log_file_is_created_inside_log_dir() {
        let dir = tempfile::tempdir().expect("temp dir");
        let nested = dir.path().join("logs");

        let (path, _file) = open_log_file(&nested)
            .expect("open log file")
            .expect("log dir configured");
        assert_eq!(path, nested.join("roster.log"));
        assert!(path.exists());

        assert!(open_log_file(Path::new("")).expect("no dir").is_none());
    }
}
