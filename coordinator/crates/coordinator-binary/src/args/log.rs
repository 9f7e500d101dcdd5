use clap::ValueEnum;

/// Target prefixes of the coordinator's own crates, the binary and the redis backend included.
/// Everything else stays silent below [`LogLevel::Trace`].
const COORDINATOR_TARGETS: &[&str] = &["schema_reporting", "reporting_server"];

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub(crate) enum LogLevel {
    /// Completely disables logging
    Off,
    /// Only errors from the coordinator
    Error,
    /// Warnings and errors from the coordinator
    Warn,
    /// Info, warning and error messages from the coordinator
    #[default]
    Info,
    /// Debug, info, warning and error messages from the coordinator
    Debug,
    /// Trace, debug, info, warning and error messages from all dependencies
    Trace,
}

impl LogLevel {
    /// The `EnvFilter` directives for this level.
    pub(crate) fn filter(self) -> String {
        let level = match self {
            LogLevel::Off => return "off".to_owned(),
            LogLevel::Trace => return "trace".to_owned(),
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        };

        let mut directives = COORDINATOR_TARGETS
            .iter()
            .map(|target| format!("{target}={level}"))
            .collect::<Vec<_>>();

        directives.push("off".to_owned());
        directives.join(",")
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub(crate) enum LogStyle {
    /// Standard text, colored on interactive terminals
    #[default]
    Text,
    /// JSON objects, one per line
    Json,
}
