//! Forward orchestration.
//!
//! The [`Forwarder`] turns forward declarations into relay allocations and
//! tunnel backends, then keeps every backend alive with a supervisor until
//! it is stopped.

mod supervise;

pub use supervise::supervise;

use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;

use burrow_core::alloc::AllocError;
use burrow_core::endpoint::PortPairError;
use burrow_core::{Backoff, PortPair, Proxy, ProxyForward, Signal, View};
use burrow_tunnel::cluster::{self, ClusterApi, ClusterBackend, ClusterConnector, ClusterError, ClusterOpts};
use burrow_tunnel::{shell, Backend, ForwardKind, ShellBackend};

/// Destination of the ssh tunnels riding on an injected sidecar.
pub const SIDECAR_REMOTE: &str = "root@127.0.0.1";

/// A forward declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardSpec {
    pub name: String,
    /// `kubernetes`, `kubernetes-remote`, `ssh` or `ssh-remote`.
    pub kind: String,
    pub context: Option<String>,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    /// `user@host`, for ssh kinds.
    pub remote: String,
    pub hostname: Option<String>,
    pub proxy_hostname: Option<String>,
    pub forward_hostname: Option<String>,
    pub disable_proxy: bool,
    /// `local:remote` couples.
    pub ports: Vec<String>,
    pub args: Vec<String>,
}

#[derive(Debug)]
pub enum ForwardError {
    UnknownKind(String),
    DisabledKind(ForwardKind),
    NoLabels,
    NoPorts,
    InvalidPorts(PortPairError),
    Alloc(AllocError),
    Cluster(ClusterError),
}

impl Display for ForwardError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        use ForwardError::*;
        match self {
            UnknownKind(kind) => write!(f, "unknown forward type `{}`", kind),
            DisabledKind(kind) => write!(f, "forward type `{}` is not enabled", kind),
            NoLabels => write!(f, "no labels given to select pods"),
            NoPorts => write!(f, "no ports to forward"),
            InvalidPorts(e) => write!(f, "{}", e),
            Alloc(e) => write!(f, "{}", e),
            Cluster(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ForwardError {}

impl From<AllocError> for ForwardError {
    fn from(e: AllocError) -> Self {
        ForwardError::Alloc(e)
    }
}

impl From<ClusterError> for ForwardError {
    fn from(e: ClusterError) -> Self {
        ForwardError::Cluster(e)
    }
}

#[derive(Debug, Clone)]
pub struct BackoffOpts {
    pub min: Duration,
    pub max: Duration,
    pub factor: f64,
    pub jitter: bool,
}

impl Default for BackoffOpts {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(100),
            max: Duration::from_secs(10),
            factor: 2.0,
            jitter: true,
        }
    }
}

impl BackoffOpts {
    pub fn build(&self) -> Backoff {
        Backoff::new(self.min, self.max, self.factor, self.jitter)
    }
}

#[derive(Debug, Clone)]
pub struct ForwarderOpts {
    pub cluster: ClusterOpts,
    /// Waiting round for a sidecar to come up, an error is reported after
    /// each one.
    pub ready_timeout: Duration,
    pub backoff: BackoffOpts,
    pub ssh_program: String,
}

impl Default for ForwarderOpts {
    fn default() -> Self {
        Self {
            cluster: ClusterOpts::default(),
            ready_timeout: Duration::from_secs(120),
            backoff: BackoffOpts::default(),
            ssh_program: shell::DEFAULT_PROGRAM.to_string(),
        }
    }
}

/// Every backend, by forward name.
#[derive(Default)]
pub struct Registry {
    backends: Mutex<BTreeMap<String, Vec<Arc<dyn Backend>>>>,
}

impl Registry {
    pub fn register(&self, name: &str, backend: Arc<dyn Backend>) {
        self.lock().entry(name.to_string()).or_default().push(backend);
    }

    pub fn get(&self, name: &str) -> Vec<Arc<dyn Backend>> {
        self.lock().get(name).cloned().unwrap_or_default()
    }

    pub fn names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<Arc<dyn Backend>> {
        self.lock().values().flatten().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Vec<Arc<dyn Backend>>>> {
        match self.backends.lock() {
            Ok(x) => x,
            Err(e) => e.into_inner(),
        }
    }
}

/// Cluster connector available in this build, if any.
pub fn default_connector() -> Option<Arc<dyn ClusterConnector>> {
    cfg_if::cfg_if! {
        if #[cfg(feature = "kube")] {
            Some(Arc::new(cluster::KubeConnector))
        } else {
            None
        }
    }
}

/// Check a declaration: known and enabled kind, labels for cluster kinds,
/// at least one port, every port couple well formed.
pub fn validate(spec: &ForwardSpec, cluster_enabled: bool) -> Result<(ForwardKind, Vec<PortPair>), ForwardError> {
    let kind: ForwardKind = spec
        .kind
        .parse()
        .map_err(|_| ForwardError::UnknownKind(spec.kind.clone()))?;
    if kind.is_cluster() && !cluster_enabled {
        return Err(ForwardError::DisabledKind(kind));
    }
    if kind.is_cluster() && spec.labels.is_empty() {
        return Err(ForwardError::NoLabels);
    }
    if spec.ports.is_empty() {
        return Err(ForwardError::NoPorts);
    }
    let ports = spec
        .ports
        .iter()
        .map(|p| p.parse::<PortPair>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(ForwardError::InvalidPorts)?;
    Ok((kind, ports))
}

struct Plan {
    name: String,
    backends: Vec<Arc<dyn Backend>>,
}

pub struct Forwarder {
    proxy: Arc<Proxy>,
    view: Arc<dyn View>,
    connector: Option<Arc<dyn ClusterConnector>>,
    clusters: Mutex<HashMap<Option<String>, Arc<dyn ClusterApi>>>,
    opts: ForwarderOpts,
    registry: Registry,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: Signal,
}

impl Forwarder {
    /// Without a `connector`, cluster kinds are refused.
    pub fn new(
        proxy: Arc<Proxy>,
        view: Arc<dyn View>,
        connector: Option<Arc<dyn ClusterConnector>>,
        opts: ForwarderOpts,
    ) -> Self {
        Self {
            proxy,
            view,
            connector,
            clusters: Mutex::new(HashMap::new()),
            opts,
            registry: Registry::default(),
            tasks: Mutex::new(Vec::new()),
            stopped: Signal::new(),
        }
    }

    pub fn proxy(&self) -> &Arc<Proxy> {
        &self.proxy
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Set up every declaration, open the relay listeners, then start the
    /// backends.
    ///
    /// A declaration that cannot be set up is reported once and skipped,
    /// the others go on. Returns the number of declarations started.
    pub async fn forward_all(self: &Arc<Self>, specs: Vec<ForwardSpec>) -> usize {
        if self.stopped.is_fired() {
            return 0;
        }

        let prepared = join_all(specs.iter().map(|spec| self.prepare(spec))).await;

        let mut plans = Vec::with_capacity(prepared.len());
        for (spec, res) in specs.iter().zip(prepared) {
            match res {
                Ok(plan) => plans.push(plan),
                // the proxy already reported it
                Err(ForwardError::Alloc(_)) => {}
                Err(e) => self
                    .view
                    .error(&format!("Unable to forward '{}': {}", spec.name, e)),
            }
        }

        let opened = self.proxy.listen();
        log::debug!("[forward]{} relay listeners opened", opened);

        let started = plans.len();
        for plan in plans {
            let this = self.clone();
            let handle = tokio::spawn(async move { this.launch(plan).await });
            self.lock_tasks().push(handle);
        }
        started
    }

    async fn prepare(&self, spec: &ForwardSpec) -> Result<Plan, ForwardError> {
        let (kind, ports) = validate(spec, self.connector.is_some())?;

        let api = if kind.is_cluster() {
            Some(self.cluster(spec.context.as_deref()).await?)
        } else {
            None
        };

        let relayed = kind.is_proxified() && (kind == ForwardKind::KubernetesRemote || !spec.disable_proxy);

        let effective = if relayed {
            let mut effective = Vec::with_capacity(ports.len());
            // the sidecar's sshd is the only relayed port of a remote forward
            let sidecar = [PortPair::new(cluster::SIDECAR_PORT, cluster::SIDECAR_PORT)];
            let declared: &[PortPair] = match kind {
                ForwardKind::KubernetesRemote => &sidecar,
                _ => &ports,
            };
            let proxy_hostname = match kind {
                ForwardKind::KubernetesRemote => None,
                _ => spec.proxy_hostname.clone(),
            };

            for pair in declared {
                let forward = ProxyForward::new(
                    spec.name.clone(),
                    spec.hostname.clone(),
                    proxy_hostname.clone(),
                    Some(pair.local),
                    pair.remote,
                );
                let forward = self.proxy.add_forward(&spec.name, forward).await?;
                if let Some(pair) = forward.proxied_ports() {
                    effective.push(pair);
                }
            }
            effective
        } else {
            ports.clone()
        };

        let backends = self.instantiate(spec, kind, api, &ports, effective);
        for backend in &backends {
            self.registry.register(&spec.name, backend.clone());
        }

        Ok(Plan {
            name: spec.name.clone(),
            backends,
        })
    }

    fn instantiate(
        &self,
        spec: &ForwardSpec,
        kind: ForwardKind,
        api: Option<Arc<dyn ClusterApi>>,
        declared: &[PortPair],
        effective: Vec<PortPair>,
    ) -> Vec<Arc<dyn Backend>> {
        let shell = |kind: ForwardKind, remote: &str, pair: PortPair, args: Vec<String>| -> Arc<dyn Backend> {
            let backend = ShellBackend::new(
                spec.name.clone(),
                kind,
                remote,
                pair,
                spec.forward_hostname.clone(),
                args,
            )
            .with_program(self.opts.ssh_program.clone());
            Arc::new(backend)
        };

        match (kind, api) {
            (ForwardKind::Kubernetes, Some(api)) => {
                let backend: Arc<dyn Backend> = Arc::new(ClusterBackend::local(
                    spec.name.clone(),
                    api,
                    spec.namespace.clone(),
                    &spec.labels,
                    effective,
                    self.view.clone(),
                ));
                vec![backend]
            }
            (ForwardKind::KubernetesRemote, Some(api)) => {
                let sidecar_port = effective.first().map(|p| p.local).unwrap_or(cluster::SIDECAR_PORT);
                let sidecar: Arc<dyn Backend> = Arc::new(ClusterBackend::remote(
                    spec.name.clone(),
                    api,
                    spec.namespace.clone(),
                    &spec.labels,
                    sidecar_port,
                    self.opts.cluster.clone(),
                    self.view.clone(),
                ));
                let mut backends = vec![sidecar];
                for pair in declared {
                    let mut args = spec.args.clone();
                    args.extend(["-p".to_string(), sidecar_port.to_string()]);
                    backends.push(shell(ForwardKind::SshRemote, SIDECAR_REMOTE, *pair, args));
                }
                backends
            }
            (ForwardKind::Ssh, _) => effective
                .into_iter()
                .map(|pair| shell(ForwardKind::Ssh, &spec.remote, pair, spec.args.clone()))
                .collect(),
            (ForwardKind::SshRemote, _) => declared
                .iter()
                .map(|pair| shell(ForwardKind::SshRemote, &spec.remote, *pair, spec.args.clone()))
                .collect(),
            // cluster kinds always come with a client
            (_, None) => Vec::new(),
        }
    }

    async fn cluster(&self, context: Option<&str>) -> Result<Arc<dyn ClusterApi>, ForwardError> {
        let connector = match &self.connector {
            Some(x) => x,
            None => return Err(ForwardError::DisabledKind(ForwardKind::Kubernetes)),
        };

        let key = context.map(str::to_string);
        let cached = self.lock_clusters().get(&key).cloned();
        if let Some(api) = cached {
            return Ok(api);
        }

        let api = connector.connect(context).await?;
        // a concurrent declaration may have connected meanwhile, keep the first
        Ok(self.lock_clusters().entry(key).or_insert(api).clone())
    }

    /// Start the supervisors of a declaration, in order. Backends behind a
    /// sidecar only start once the sidecar is ready.
    async fn launch(self: Arc<Self>, plan: Plan) {
        let Plan { name, backends } = plan;

        for backend in backends {
            let gate = (backend.kind() == ForwardKind::KubernetesRemote).then(|| backend.clone());
            self.spawn_supervisor(backend);

            if let Some(gate) = gate {
                if !self.wait_ready(&name, gate.as_ref()).await {
                    return;
                }
            }
        }
    }

    async fn wait_ready(&self, name: &str, backend: &dyn Backend) -> bool {
        loop {
            tokio::select! {
                ready = backend.ready().wait_timeout(self.opts.ready_timeout) => {
                    if ready {
                        return true;
                    }
                    self.view.error(&format!(
                        "Sidecar for '{}' is still unreachable after {:?}, waiting",
                        name, self.opts.ready_timeout
                    ));
                }
                _ = backend.stop_signal().wait() => return false,
            }
        }
    }

    fn spawn_supervisor(&self, backend: Arc<dyn Backend>) {
        if self.stopped.is_fired() {
            return;
        }
        let handle = tokio::spawn(supervise(backend, self.opts.backoff.build(), self.view.clone()));
        self.lock_tasks().push(handle);
    }

    /// Stop every backend, then the relay.
    pub async fn stop(&self) {
        if !self.stopped.fire() {
            return;
        }

        let backends = self.registry.snapshot();
        join_all(backends.iter().map(|b| b.stop())).await;

        let tasks = std::mem::take(&mut *self.lock_tasks());
        for task in tasks {
            task.abort();
        }

        self.proxy.stop().await;
    }

    fn lock_clusters(&self) -> MutexGuard<'_, HashMap<Option<String>, Arc<dyn ClusterApi>>> {
        match self.clusters.lock() {
            Ok(x) => x,
            Err(e) => e.into_inner(),
        }
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.tasks.lock() {
            Ok(x) => x,
            Err(e) => e.into_inner(),
        }
    }
}
