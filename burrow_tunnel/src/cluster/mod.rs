//! Cluster port-forwards.
//!
//! The local variant forwards to the first running pod matching the label
//! selector. The remote variant first swaps the container image of the
//! first matching deployment for an ssh sidecar, then forwards to it; the
//! original container is put back on stop.

mod api;
pub mod memory;

#[cfg(feature = "kube")]
mod kubernetes;

pub use api::{ClusterApi, ClusterConnector, Duplex, StaticConnector};
pub use memory::MemoryCluster;

#[cfg(feature = "kube")]
pub use kubernetes::{KubeCluster, KubeConnector, KUBE_CONFIG_ENV};

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, ContainerPort, PodReadinessGate};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use burrow_core::tcp::run_relay;
use burrow_core::{PortPair, Signal, View};

use crate::{Backend, BackendError, ForwardKind};

/// Port the sidecar's sshd listens on.
pub const SIDECAR_PORT: u16 = 5022;
pub const PROXY_PORT_NAME: &str = "ssh-proxy";
pub const DEFAULT_SIDECAR_IMAGE: &str = "ekofr/monday-proxy";
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum ClusterError {
    NoSelector,
    NoRunningPod { selector: String },
    NoDeployment { selector: String },
    Bind { addr: SocketAddr, error: io::Error },
    Stream { pod: String, port: u16, reason: String },
    Api(String),
    Config(String),
}

impl Display for ClusterError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        use ClusterError::*;
        match self {
            NoSelector => write!(f, "no labels given to select pods"),
            NoRunningPod { selector } => write!(f, "no running pod matches `{}`", selector),
            NoDeployment { selector } => write!(f, "no deployment matches `{}`", selector),
            Bind { addr, error } => write!(f, "unable to listen on {}: {}", addr, error),
            Stream { pod, port, reason } => write!(f, "unable to forward to {}:{}: {}", pod, port, reason),
            Api(msg) => write!(f, "cluster api error: {}", msg),
            Config(msg) => write!(f, "unable to load cluster config: {}", msg),
        }
    }
}

impl std::error::Error for ClusterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClusterError::Bind { error, .. } => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClusterOpts {
    pub sidecar_image: String,
    /// How long the patched deployment gets to roll out before forwarding.
    pub settle_delay: Duration,
}

impl Default for ClusterOpts {
    fn default() -> Self {
        Self {
            sidecar_image: DEFAULT_SIDECAR_IMAGE.to_string(),
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }
}

/// `k=v,k=v`, in key order.
pub fn selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Original state of the patched deployment.
#[derive(Debug, Clone)]
struct DeploymentBackup {
    deployment: String,
    image: Option<String>,
    ports: Option<Vec<ContainerPort>>,
    readiness_gates: Option<Vec<PodReadinessGate>>,
}

pub struct ClusterBackend {
    name: String,
    kind: ForwardKind,
    api: Arc<dyn ClusterApi>,
    namespace: String,
    selector: String,
    ports: Vec<PortPair>,
    opts: ClusterOpts,
    view: Arc<dyn View>,
    backup: Mutex<Option<DeploymentBackup>>,
    conns: Mutex<Vec<AbortHandle>>,
    ready: Signal,
    stop: Signal,
}

impl ClusterBackend {
    /// Forward `ports` (`local:remote`) to the first running pod.
    pub fn local(
        name: impl Into<String>,
        api: Arc<dyn ClusterApi>,
        namespace: impl Into<String>,
        labels: &BTreeMap<String, String>,
        ports: Vec<PortPair>,
        view: Arc<dyn View>,
    ) -> Self {
        Self::build(
            name.into(),
            ForwardKind::Kubernetes,
            api,
            namespace.into(),
            labels,
            ports,
            ClusterOpts::default(),
            view,
        )
    }

    /// Forward `local_port` to the ssh sidecar injected in the first
    /// matching deployment.
    pub fn remote(
        name: impl Into<String>,
        api: Arc<dyn ClusterApi>,
        namespace: impl Into<String>,
        labels: &BTreeMap<String, String>,
        local_port: u16,
        opts: ClusterOpts,
        view: Arc<dyn View>,
    ) -> Self {
        let ports = vec![PortPair::new(local_port, SIDECAR_PORT)];
        Self::build(
            name.into(),
            ForwardKind::KubernetesRemote,
            api,
            namespace.into(),
            labels,
            ports,
            opts,
            view,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        name: String,
        kind: ForwardKind,
        api: Arc<dyn ClusterApi>,
        namespace: String,
        labels: &BTreeMap<String, String>,
        ports: Vec<PortPair>,
        opts: ClusterOpts,
        view: Arc<dyn View>,
    ) -> Self {
        let namespace = if namespace.is_empty() {
            "default".to_string()
        } else {
            namespace
        };
        Self {
            name,
            kind,
            api,
            namespace,
            selector: selector(labels),
            ports,
            opts,
            view,
            backup: Mutex::new(None),
            conns: Mutex::new(Vec::new()),
            ready: Signal::new(),
            stop: Signal::new(),
        }
    }

    pub fn ports(&self) -> &[PortPair] {
        &self.ports
    }

    pub fn selector(&self) -> &str {
        &self.selector
    }

    async fn forward_pod(&self) -> Result<(), ClusterError> {
        if self.selector.is_empty() {
            return Err(ClusterError::NoSelector);
        }

        let pods = self.api.list_pods(&self.namespace, &self.selector).await?;
        let pod = pods
            .into_iter()
            .filter(|p| p.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running"))
            .find_map(|p| p.metadata.name)
            .ok_or_else(|| ClusterError::NoRunningPod {
                selector: self.selector.clone(),
            })?;
        log::debug!("[cluster]{} resolved to pod {}/{}", self.name, self.namespace, pod);

        let mut listeners = Vec::with_capacity(self.ports.len());
        for pair in &self.ports {
            let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, pair.local));
            let lis = TcpListener::bind(addr)
                .await
                .map_err(|error| ClusterError::Bind { addr, error })?;
            listeners.push((lis, pair.remote));
        }

        self.ready.fire();
        self.view.info(&format!(
            "Forwarding {} to pod {} ({})",
            self.name,
            pod,
            self.ports.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(", ")
        ));

        let (err_tx, mut err_rx) = mpsc::channel(1);
        let accepts = listeners
            .into_iter()
            .map(|(lis, remote)| self.accept_loop(lis, &pod, remote, err_tx.clone()));

        tokio::select! {
            res = try_join_all(accepts) => res.map(|_| ()),
            Some(e) = err_rx.recv() => Err(e),
            _ = self.stop.wait() => Ok(()),
        }
    }

    async fn accept_loop(
        &self,
        lis: TcpListener,
        pod: &str,
        port: u16,
        errors: mpsc::Sender<ClusterError>,
    ) -> Result<(), ClusterError> {
        let addr = lis.local_addr().map_err(|error| ClusterError::Bind {
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            error,
        })?;

        loop {
            let (local, peer) = lis
                .accept()
                .await
                .map_err(|error| ClusterError::Bind { addr, error })?;

            let api = self.api.clone();
            let namespace = self.namespace.clone();
            let pod = pod.to_string();
            let errors = errors.clone();
            let handle = tokio::spawn(async move {
                let remote = match api.open_stream(&namespace, &pod, port).await {
                    Ok(x) => x,
                    Err(e) => {
                        // one report is enough to restart the session
                        let _ = errors.try_send(e);
                        return;
                    }
                };
                log::debug!("[cluster]{} => {}:{}", peer, pod, port);
                if let Err(e) = run_relay(local, remote).await {
                    log::debug!("[cluster]forward error: {}, ignored", e);
                }
            });
            self.track(handle.abort_handle());
        }
    }

    fn track(&self, handle: AbortHandle) {
        let mut conns = match self.conns.lock() {
            Ok(x) => x,
            Err(e) => e.into_inner(),
        };
        conns.retain(|h| !h.is_finished());
        conns.push(handle);
    }

    fn abort_connections(&self) {
        let conns = match self.conns.lock() {
            Ok(mut x) => std::mem::take(&mut *x),
            Err(e) => std::mem::take(&mut *e.into_inner()),
        };
        for conn in conns {
            conn.abort();
        }
    }

    fn lock_backup(&self) -> std::sync::MutexGuard<'_, Option<DeploymentBackup>> {
        match self.backup.lock() {
            Ok(x) => x,
            Err(e) => e.into_inner(),
        }
    }

    /// Swap the first matching deployment's container for the sidecar.
    ///
    /// Once a deployment is patched, later sessions keep patching that same
    /// one while it still matches.
    async fn inject_sidecar(&self) -> Result<(), ClusterError> {
        if self.selector.is_empty() {
            return Err(ClusterError::NoSelector);
        }

        let deployments = self.api.list_deployments(&self.namespace, &self.selector).await?;
        let patched = self.lock_backup().as_ref().map(|b| b.deployment.clone());
        let target = match patched {
            Some(name) => deployments
                .iter()
                .position(|d| d.metadata.name.as_deref() == Some(name.as_str()))
                .unwrap_or(0),
            None => 0,
        };
        let mut deployment = deployments
            .into_iter()
            .nth(target)
            .ok_or_else(|| ClusterError::NoDeployment {
                selector: self.selector.clone(),
            })?;

        let name = deployment.metadata.name.clone().unwrap_or_default();
        let readiness_gates = deployment
            .spec
            .as_mut()
            .and_then(|s| s.template.spec.as_mut())
            .and_then(|s| s.readiness_gates.take());
        let Some(container) = first_container(&mut deployment) else {
            return Err(ClusterError::NoDeployment {
                selector: self.selector.clone(),
            });
        };

        {
            let mut backup = self.lock_backup();
            if self.stop.is_fired() {
                return Ok(());
            }
            // the first sight of the deployment is its original state
            if backup.as_ref().map(|b| b.deployment.as_str()) != Some(name.as_str()) {
                *backup = Some(DeploymentBackup {
                    deployment: name.clone(),
                    image: container.image.clone(),
                    ports: container.ports.clone(),
                    readiness_gates,
                });
            }
        }

        container.image = Some(self.opts.sidecar_image.clone());
        let mut ports: Vec<ContainerPort> = container
            .ports
            .take()
            .unwrap_or_default()
            .into_iter()
            .filter(|p| p.name.as_deref() != Some(PROXY_PORT_NAME))
            .collect();
        ports.push(ContainerPort {
            name: Some(PROXY_PORT_NAME.to_string()),
            container_port: i32::from(SIDECAR_PORT),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        });
        container.ports = Some(ports);

        match self.api.replace_deployment(&self.namespace, &deployment).await {
            Ok(()) => self.view.info(&format!(
                "Deployment '{}' switched to the proxy sidecar for '{}'",
                name, self.name
            )),
            Err(e) => self.view.error(&format!(
                "An error has occurred while updating deployment '{}' for '{}': {}",
                name, self.name, e
            )),
        }

        // stopped while patching: the restore may have landed first
        if self.stop.is_fired() {
            self.restore().await;
        }
        Ok(())
    }

    /// Put the backed up container back. The backup is kept, so a failed
    /// restore can be tried again.
    async fn restore(&self) {
        let Some(backup) = self.lock_backup().clone() else {
            return;
        };

        let deployments = match self.api.list_deployments(&self.namespace, &self.selector).await {
            Ok(x) => x,
            Err(e) => {
                self.view.error(&format!(
                    "Unable to restore deployment '{}' of '{}': {}",
                    backup.deployment, self.name, e
                ));
                return;
            }
        };

        let Some(mut deployment) = deployments
            .into_iter()
            .find(|d| d.metadata.name.as_deref() == Some(backup.deployment.as_str()))
        else {
            self.view.error(&format!(
                "Unable to restore deployment '{}' of '{}': it no longer matches `{}`",
                backup.deployment, self.name, self.selector
            ));
            return;
        };

        if let Some(pod_spec) = deployment.spec.as_mut().and_then(|s| s.template.spec.as_mut()) {
            pod_spec.readiness_gates = backup.readiness_gates.clone();
        }
        let Some(container) = first_container(&mut deployment) else {
            return;
        };
        container.image = backup.image.clone();
        container.ports = backup.ports.clone();

        match self.api.replace_deployment(&self.namespace, &deployment).await {
            Ok(()) => self.view.info(&format!("Deployment '{}' restored", backup.deployment)),
            Err(e) => self.view.error(&format!(
                "An error has occurred while restoring deployment '{}': {}",
                backup.deployment, e
            )),
        }
    }

    async fn run(&self) -> Result<(), ClusterError> {
        if self.stop.is_fired() {
            return Ok(());
        }

        if self.kind == ForwardKind::KubernetesRemote {
            self.inject_sidecar().await?;

            tokio::select! {
                _ = tokio::time::sleep(self.opts.settle_delay) => {}
                _ = self.stop.wait() => return Ok(()),
            }
        }

        self.forward_pod().await
    }
}

fn first_container(deployment: &mut Deployment) -> Option<&mut Container> {
    deployment
        .spec
        .as_mut()?
        .template
        .spec
        .as_mut()?
        .containers
        .first_mut()
}

#[async_trait]
impl Backend for ClusterBackend {
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
        self.stop.fire();
        self.abort_connections();
        if self.kind == ForwardKind::KubernetesRemote {
            self.restore().await;
        }
    }

    fn ready(&self) -> &Signal {
        &self.ready
    }

    fn stop_signal(&self) -> &Signal {
        &self.stop
    }

    fn reset(&self) {
        self.abort_connections();
    }
}
