use std::{fs, io, net::SocketAddr, path::PathBuf};

use anyhow::Context;
use clap::Parser;
use coordinator_config::Config;
use tracing::Subscriber;
use tracing_subscriber::{registry::LookupSpan, Layer};

mod log;

pub(crate) use log::LogLevel;

use self::log::LogStyle;

#[derive(Debug, Parser)]
#[command(name = "Schema Reporting Coordinator", version)]
/// Receives schema reports from GraphQL edge agents
pub struct Args {
    /// IP address on which the server will listen for incoming connections. Defaults to 127.0.0.1:4000.
    #[arg(short, long, env = "SCHEMA_REPORTING_LISTEN_ADDRESS")]
    pub listen_address: Option<SocketAddr>,
    /// Path to the TOML configuration file. A missing file means the defaults.
    #[arg(long, short, env = "SCHEMA_REPORTING_CONFIG_PATH", default_value = "./coordinator.toml")]
    pub config: PathBuf,
    /// Set the logging level
    #[arg(long = "log", env = "SCHEMA_REPORTING_LOG")]
    pub log_level: Option<LogLevel>,
    /// Set the style of log output
    #[arg(long, env = "SCHEMA_REPORTING_LOG_STYLE", value_enum, default_value = "text")]
    log_style: LogStyle,
}

impl Args {
    /// Reads and parses the configuration file.
    pub fn config(&self) -> anyhow::Result<Config> {
        let content = match fs::read_to_string(&self.config) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Config::default()),
            Err(e) => return Err(e).with_context(|| format!("reading {}", self.config.display())),
        };

        toml::from_str(&content).with_context(|| format!("parsing {}", self.config.display()))
    }

    pub fn log_format<S>(&self) -> Box<dyn Layer<S> + Send + Sync + 'static>
    where
        S: Subscriber + for<'span> LookupSpan<'span> + Send + Sync,
    {
        let layer = tracing_subscriber::fmt::layer();

        match self.log_style {
            // for interactive terminals we provide colored output
            LogStyle::Text if atty::is(atty::Stream::Stdout) => layer.with_ansi(true).boxed(),
            // for server logs, colors are off
            LogStyle::Text => layer.with_ansi(false).boxed(),
            LogStyle::Json => layer.json().boxed(),
        }
    }
}

pub(crate) fn parse() -> Args {
    Args::parse()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn args(config: PathBuf) -> Args {
        Args::parse_from(["schema-reporting-coordinator", "--config", config.to_str().unwrap()])
    }

    #[test]
    fn missing_config_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = args(dir.path().join("coordinator.toml")).config().unwrap();

        assert_eq!(config.graph.path, "/graphql");
    }

    #[test]
    fn config_file_is_parsed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[graph]\npath = \"/reporting\"").unwrap();

        let config = args(file.path().to_owned()).config().unwrap();

        assert_eq!(config.graph.path, "/reporting");
    }

    #[test]
    fn invalid_config_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[graph]\npth = \"/reporting\"").unwrap();

        let error = args(file.path().to_owned()).config().unwrap_err();

        assert!(format!("{error:#}").contains("unknown field `pth`"), "{error:#}");
    }

    #[test]
    fn log_flags() {
        let args = Args::parse_from(["schema-reporting-coordinator", "--log", "warn", "--log-style", "json"]);

        assert_eq!(args.log_level, Some(LogLevel::Warn));
        assert_eq!(args.log_style, LogStyle::Json);
    }

    #[test]
    fn log_defaults() {
        let args = Args::parse_from(["schema-reporting-coordinator"]);

        assert_eq!(args.log_level, None);
        assert_eq!(args.log_style, LogStyle::default());
    }
}
