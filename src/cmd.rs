//! Command line.

use clap::{Arg, ArgAction, ArgMatches, Command};

use crate::conf::LogLevel;
use crate::VERSION;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdOpts {
    pub config: String,
    pub log_level: Option<LogLevel>,
    pub log_output: Option<String>,
    pub no_hosts: bool,
    pub no_alias: bool,
}

pub fn build_cmd() -> Command {
    Command::new("burrow")
        .version(VERSION)
        .about("Local loopback relays and tunnels to remote services")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .help("use config file")
                .value_name("path")
                .required(true)
                .display_order(0),
        )
        .arg(
            Arg::new("log_level")
                .short('l')
                .long("log-level")
                .help("override log level")
                .value_name("level")
                .value_parser(["off", "error", "warn", "info", "debug", "trace"])
                .display_order(1),
        )
        .arg(
            Arg::new("log_output")
                .long("log-output")
                .help("override log output: stdout, stderr or a file path")
                .value_name("path")
                .display_order(2),
        )
        .arg(
            Arg::new("no_hosts")
                .long("no-hosts")
                .help("do not touch the hosts file")
                .action(ArgAction::SetTrue)
                .display_order(3),
        )
        .arg(
            Arg::new("no_alias")
                .long("no-alias")
                .help("do not add addresses to the loopback interface")
                .action(ArgAction::SetTrue)
                .display_order(4),
        )
}

pub fn scan() -> CmdOpts {
    from_matches(&build_cmd().get_matches())
}

pub fn from_matches(matches: &ArgMatches) -> CmdOpts {
    CmdOpts {
        config: matches.get_one::<String>("config").cloned().unwrap_or_default(),
        log_level: matches
            .get_one::<String>("log_level")
            .and_then(|level| level.parse().ok()),
        log_output: matches.get_one::<String>("log_output").cloned(),
        no_hosts: matches.get_flag("no_hosts"),
        no_alias: matches.get_flag("no_alias"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_args() {
        let matches = build_cmd()
            .try_get_matches_from(["burrow", "-c", "burrow.toml", "-l", "debug", "--no-hosts"])
            .unwrap();
        let opts = from_matches(&matches);
        assert_eq!(
            opts,
            CmdOpts {
                config: "burrow.toml".to_string(),
                log_level: Some(LogLevel::Debug),
                log_output: None,
                no_hosts: true,
                no_alias: false,
            }
        );
    }

    #[test]
    fn config_is_required() {
        assert!(build_cmd().try_get_matches_from(["burrow"]).is_err());
        assert!(build_cmd()
            .try_get_matches_from(["burrow", "-c", "x.toml", "-l", "loud"])
            .is_err());
    }
}
