use std::{fs, io, path::PathBuf};

use anyhow::Context;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::vncproxy::config;

/// Keeps the non-blocking writer flushing; drop it only at process exit.
#[derive(Debug)]
pub struct LoggingRuntime {
    _guard: WorkerGuard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LogOutput {
    Stderr,
    Stdout,
    Discard,
    File(PathBuf),
}

impl LogOutput {
    fn parse(s: &str) -> Self {
        match s.trim() {
            "" | "stderr" => LogOutput::Stderr,
            "stdout" => LogOutput::Stdout,
            "discard" => LogOutput::Discard,
            path => LogOutput::File(PathBuf::from(path)),
        }
    }

    fn writer(&self) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
        let pair = match self {
            LogOutput::Stderr => tracing_appender::non_blocking(io::stderr()),
            LogOutput::Stdout => tracing_appender::non_blocking(io::stdout()),
            LogOutput::Discard => tracing_appender::non_blocking(io::sink()),
            LogOutput::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("logging: mkdir {}", parent.display()))?;
                }
                let file = fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("logging: open {}", path.display()))?;
                tracing_appender::non_blocking(file)
            }
        };
        Ok(pair)
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over `logging.level`.
pub fn init(logging: &config::LoggingConfig) -> anyhow::Result<LoggingRuntime> {
    let json = !logging.format.trim().eq_ignore_ascii_case("text");

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level_directive(&logging.level)))
        .context("logging: init filter")?;

    let (writer, guard) = LogOutput::parse(&logging.output).writer()?;

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(!json)
        .with_target(true)
        .with_file(logging.add_source)
        .with_line_number(logging.add_source);
    let layer = if json {
        layer.json().boxed()
    } else {
        layer.boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .context("logging: install subscriber")?;

    Ok(LoggingRuntime { _guard: guard })
}

fn level_directive(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    }
}
