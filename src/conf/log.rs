use std::fmt::{Display, Formatter};

use log::LevelFilter;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        use LogLevel::*;
        match level {
            Off => LevelFilter::Off,
            Error => LevelFilter::Error,
            Warn => LevelFilter::Warn,
            Info => LevelFilter::Info,
            Debug => LevelFilter::Debug,
            Trace => LevelFilter::Trace,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use LogLevel::*;
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(Off),
            "error" => Ok(Error),
            "warn" => Ok(Warn),
            "info" => Ok(Info),
            "debug" => Ok(Debug),
            "trace" => Ok(Trace),
            _ => Err(format!("unknown log level `{}`", s)),
        }
    }
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConf {
    #[serde(default)]
    pub level: LogLevel,

    /// `stdout`, `stderr` or a file path.
    #[serde(default = "default_output")]
    pub output: String,
}

fn default_output() -> String {
    String::from("stdout")
}

impl Default for LogConf {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            output: default_output(),
        }
    }
}

impl LogConf {
    pub fn build(&self) -> std::io::Result<(LevelFilter, fern::Output)> {
        let output: fern::Output = match self.output.as_str() {
            "stdout" => std::io::stdout().into(),
            "stderr" => std::io::stderr().into(),
            path => fern::log_file(path)?.into(),
        };
        Ok((self.level.into(), output))
    }
}

impl Display for LogConf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "level={}, output={}", self.level, self.output)
    }
}
