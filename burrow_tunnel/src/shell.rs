//! `ssh` tunnels.
//!
//! One backend runs one `ssh -N` process carrying a single port mapping,
//! `-L` for local forwards and `-R` for remote ones.

use std::fmt::{Display, Formatter};
use std::io;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::process::Command;

use burrow_core::{PortPair, Signal};

use crate::{Backend, BackendError, ForwardKind};

pub const DEFAULT_PROGRAM: &str = "ssh";
pub const DEFAULT_FORWARD_HOSTNAME: &str = "127.0.0.1";

#[derive(Debug)]
pub enum ShellError {
    NoRemote,
    Spawn(io::Error),
    Exited { status: ExitStatus, stderr: String },
}

impl Display for ShellError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ShellError::NoRemote => write!(f, "no remote host specified"),
            ShellError::Spawn(e) => write!(f, "unable to run ssh: {}", e),
            ShellError::Exited { status, stderr } if stderr.is_empty() => write!(f, "ssh {}", status),
            ShellError::Exited { status, stderr } => write!(f, "ssh {}: {}", status, stderr),
        }
    }
}

impl std::error::Error for ShellError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ShellError::Spawn(e) => Some(e),
            _ => None,
        }
    }
}

pub struct ShellBackend {
    name: String,
    kind: ForwardKind,
    program: String,
    remote: String,
    ports: PortPair,
    forward_hostname: String,
    args: Vec<String>,
    ready: Signal,
    stop: Signal,
}

impl ShellBackend {
    /// `remote` is the ssh destination (`user@host`). With `ForwardKind::Ssh`,
    /// `ports.local` is opened here and reaches `forward_hostname:ports.remote`
    /// on the remote side; `ForwardKind::SshRemote` goes the other way round.
    pub fn new(
        name: impl Into<String>,
        kind: ForwardKind,
        remote: impl Into<String>,
        ports: PortPair,
        forward_hostname: Option<String>,
        args: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            program: DEFAULT_PROGRAM.to_string(),
            remote: remote.into(),
            ports,
            forward_hostname: forward_hostname
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| DEFAULT_FORWARD_HOSTNAME.to_string()),
            args,
            ready: Signal::new(),
            stop: Signal::new(),
        }
    }

    /// Run `program` instead of `ssh`, with the same arguments.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn ports(&self) -> PortPair {
        self.ports
    }

    pub fn command_args(&self) -> Vec<String> {
        let flag = match self.kind {
            ForwardKind::SshRemote => "-R",
            _ => "-L",
        };

        let mut args = vec![
            "-oUserKnownHostsFile=/dev/null".to_string(),
            "-oStrictHostKeyChecking=no".to_string(),
            "-N".to_string(),
            flag.to_string(),
            format!("{}:{}:{}", self.ports.local, self.forward_hostname, self.ports.remote),
            self.remote.clone(),
        ];
        args.extend(self.args.iter().cloned());
        args
    }

    async fn run(&self) -> Result<(), ShellError> {
        if self.remote.is_empty() {
            return Err(ShellError::NoRemote);
        }
        if self.stop.is_fired() {
            return Ok(());
        }

        let args = self.command_args();
        log::info!("[ssh]{} {}", self.program, args.join(" "));

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ShellError::Spawn)?;

        self.ready.fire();

        tokio::select! {
            output = child.wait_with_output() => {
                let output = output.map_err(ShellError::Spawn)?;
                if output.status.success() {
                    return Ok(());
                }
                Err(ShellError::Exited {
                    status: output.status,
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                })
            }
            // the child goes down with the dropped future
            _ = self.stop.wait() => Ok(()),
        }
    }
}

#[async_trait]
impl Backend for ShellBackend {
    fn kind(&self) -> ForwardKind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn forward(&self) -> Result<(), BackendError> {
        self.run().await.map_err(Into::into)
    }

    async fn stop(&self) {
        if self.stop.fire() {
            log::debug!("[ssh]stopping {} ({})", self.name, self.ports);
        }
    }

    fn ready(&self) -> &Signal {
        &self.ready
    }

    fn stop_signal(&self) -> &Signal {
        &self.stop
    }
}
