//! Tunnel backends.
//!
//! A [`Backend`] brings remote ports to the local machine: through a
//! cluster port-forward ([`cluster`]) or an `ssh` process ([`shell`]).
//! Backends are driven by a supervisor that calls [`Backend::forward`] again
//! whenever it returns, until [`Backend::stop`] is called.

pub mod cluster;
pub mod shell;

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use async_trait::async_trait;
use burrow_core::Signal;

pub use cluster::{ClusterApi, ClusterBackend, ClusterConnector, ClusterError, ClusterOpts};
pub use shell::{ShellBackend, ShellError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ForwardKind {
    /// Port-forward to a running pod.
    Kubernetes,
    /// Swap the deployment's container for an ssh sidecar, then
    /// port-forward to it.
    KubernetesRemote,
    /// `ssh -L`.
    Ssh,
    /// `ssh -R`.
    SshRemote,
}

impl ForwardKind {
    pub const ALL: [ForwardKind; 4] = [Self::Kubernetes, Self::KubernetesRemote, Self::Ssh, Self::SshRemote];

    pub const fn as_str(&self) -> &'static str {
        use ForwardKind::*;
        match self {
            Kubernetes => "kubernetes",
            KubernetesRemote => "kubernetes-remote",
            Ssh => "ssh",
            SshRemote => "ssh-remote",
        }
    }

    /// Whether local callers reach this kind through the relay.
    pub const fn is_proxified(&self) -> bool {
        !matches!(self, Self::SshRemote)
    }

    pub const fn is_cluster(&self) -> bool {
        matches!(self, Self::Kubernetes | Self::KubernetesRemote)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownKind(pub String);

impl Display for UnknownKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown forward type `{}`", self.0)
    }
}

impl std::error::Error for UnknownKind {}

impl FromStr for ForwardKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

impl Display for ForwardKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum BackendError {
    Cluster(ClusterError),
    Shell(ShellError),
}

impl Display for BackendError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::Cluster(e) => write!(f, "{}", e),
            BackendError::Shell(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for BackendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BackendError::Cluster(e) => Some(e),
            BackendError::Shell(e) => Some(e),
        }
    }
}

impl From<ClusterError> for BackendError {
    fn from(e: ClusterError) -> Self {
        BackendError::Cluster(e)
    }
}

impl From<ShellError> for BackendError {
    fn from(e: ShellError) -> Self {
        BackendError::Shell(e)
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> ForwardKind;

    fn name(&self) -> &str;

    /// Run one forwarding session.
    ///
    /// Returns `Ok` when the session ends normally or the backend is
    /// stopped, `Err` when it could not be established or broke.
    async fn forward(&self) -> Result<(), BackendError>;

    /// Stop the backend for good and undo what it changed remotely.
    async fn stop(&self);

    /// Fired once the backend accepted traffic for the first time.
    fn ready(&self) -> &Signal;

    fn stop_signal(&self) -> &Signal;

    /// Drop whatever a failed session left behind.
    fn reset(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_kinds() {
        for kind in ForwardKind::ALL {
            assert_eq!(kind.as_str().parse::<ForwardKind>(), Ok(kind));
        }
        assert_eq!(
            "kubernetes-local".parse::<ForwardKind>(),
            Err(UnknownKind("kubernetes-local".to_string()))
        );
    }

    #[test]
    fn only_ssh_remote_skips_the_relay() {
        let proxified: Vec<_> = ForwardKind::ALL.into_iter().filter(|k| k.is_proxified()).collect();
        assert_eq!(
            proxified,
            vec![ForwardKind::Kubernetes, ForwardKind::KubernetesRemote, ForwardKind::Ssh]
        );
    }
}
