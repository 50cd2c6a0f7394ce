//! Configuration.
//!
//! A config file is TOML, JSON is accepted as well:
//!
//! ```toml
//! [log]
//! level = "info"
//!
//! [relay]
//! ip_base = "127.1.2.0"
//!
//! [[forwards]]
//! name = "graphql"
//! kind = "kubernetes"
//! namespace = "backend"
//! labels = { app = "graphql" }
//! ports = ["8080:8000"]
//! ```

mod forward;
mod log;
mod relay;

pub use forward::ForwardConf;
pub use log::{LogConf, LogLevel};
pub use relay::RelayConf;

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::cmd::CmdOpts;
use crate::forward::ForwardSpec;

#[derive(Debug)]
pub enum ConfError {
    Read { path: String, error: std::io::Error },
    Parse { toml: String, json: String },
}

impl Display for ConfError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfError::Read { path, error } => write!(f, "unable to open {}: {}", path, error),
            ConfError::Parse { toml, json } => write!(
                f,
                "unable to parse config as toml ({}) or json ({})",
                toml.trim(),
                json.trim()
            ),
        }
    }
}

impl std::error::Error for ConfError {}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullConf {
    #[serde(default)]
    pub log: LogConf,

    #[serde(default)]
    pub relay: RelayConf,

    #[serde(default)]
    pub forwards: Vec<ForwardConf>,
}

impl FullConf {
    pub fn from_conf_file(file: &str) -> Result<Self, ConfError> {
        let conf = std::fs::read_to_string(file).map_err(|error| ConfError::Read {
            path: file.to_string(),
            error,
        })?;
        Self::from_conf_str(&conf)
    }

    pub fn from_conf_str(conf: &str) -> Result<Self, ConfError> {
        let toml_err = match toml::from_str(conf) {
            Ok(x) => return Ok(x),
            Err(e) => e,
        };
        serde_json::from_str(conf).map_err(|json_err| ConfError::Parse {
            toml: toml_err.to_string(),
            json: json_err.to_string(),
        })
    }

    /// Command line values win over the file.
    pub fn apply_cmd_opts(&mut self, opts: &CmdOpts) -> &mut Self {
        if let Some(level) = opts.log_level {
            self.log.level = level;
        }
        if let Some(output) = &opts.log_output {
            self.log.output = output.clone();
        }
        if opts.no_hosts {
            self.relay.manage_hosts = false;
        }
        if opts.no_alias {
            self.relay.alias_interface = false;
        }
        self
    }

    pub fn forward_specs(&self) -> Vec<ForwardSpec> {
        self.forwards.iter().cloned().map(ForwardSpec::from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const TOML_CONF: &str = r#"
[log]
level = "debug"
output = "stderr"

[relay]
ip_base = "127.9.0.0"
backoff_max_ms = 2000

[[forwards]]
name = "graphql"
kind = "kubernetes"
context = "staging"
namespace = "backend"
labels = { app = "graphql" }
hostname = "graphql.svc.local"
ports = ["8080:8000"]

[[forwards]]
name = "bastion"
type = "ssh"
remote = "root@bastion.tld"
ports = ["5432:5432"]
args = ["-i", "~/.ssh/id_ed25519"]
"#;

    #[test]
    fn parse_toml() {
        let conf = FullConf::from_conf_str(TOML_CONF).unwrap();
        assert_eq!(conf.log.level, LogLevel::Debug);
        assert_eq!(conf.log.output, "stderr");
        assert_eq!(conf.relay.ip_base, Ipv4Addr::new(127, 9, 0, 0));
        assert_eq!(conf.relay.backoff_max_ms, 2000);
        // untouched fields keep their defaults
        assert_eq!(conf.relay.port_start, 9400);
        assert!(conf.relay.manage_hosts);

        let specs = conf.forward_specs();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].kind, "kubernetes");
        assert_eq!(specs[0].context.as_deref(), Some("staging"));
        assert_eq!(specs[0].labels.get("app").map(String::as_str), Some("graphql"));
        assert_eq!(specs[1].kind, "ssh");
        assert_eq!(specs[1].args, vec!["-i", "~/.ssh/id_ed25519"]);
    }

    #[test]
    fn parse_json() {
        let conf = FullConf::from_conf_str(
            r#"{"forwards": [{"name": "api", "kind": "ssh-remote", "remote": "me@host", "ports": ["3000:3000"]}]}"#,
        )
        .unwrap();
        assert_eq!(conf.log, LogConf::default());
        assert_eq!(conf.forwards[0].kind, "ssh-remote");
        assert!(!conf.forwards[0].disable_proxy);
    }

    #[test]
    fn reject_garbage() {
        let err = FullConf::from_conf_str("forwards = [").unwrap_err();
        assert!(matches!(err, ConfError::Parse { .. }));
    }

    #[test]
    fn cmd_opts_override_file() {
        let mut conf = FullConf::from_conf_str(TOML_CONF).unwrap();
        conf.apply_cmd_opts(&CmdOpts {
            config: String::new(),
            log_level: Some(LogLevel::Warn),
            log_output: None,
            no_hosts: true,
            no_alias: true,
        });
        assert_eq!(conf.log.level, LogLevel::Warn);
        assert_eq!(conf.log.output, "stderr");
        assert!(!conf.relay.manage_hosts);
        assert!(!conf.relay.alias_interface);
    }
}
