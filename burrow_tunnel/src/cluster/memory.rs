//! A cluster living in memory.
//!
//! Pods and deployments are plain objects; port-forward streams are served
//! by dialing whatever local address a `(pod, port)` is routed to.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, Pod, PodReadinessGate, PodSpec, PodStatus, PodTemplateSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio::net::TcpStream;

use super::api::{ClusterApi, Duplex};
use super::ClusterError;

#[derive(Default)]
struct State {
    pods: Vec<Pod>,
    deployments: BTreeMap<(String, String), Deployment>,
    routes: HashMap<(String, u16), SocketAddr>,
    replaced: usize,
    fail_replace: bool,
    fail_list: bool,
}

#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<State>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pod(&self, namespace: &str, name: &str, labels: &[(&str, &str)], phase: &str) {
        let pod = Pod {
            metadata: meta(namespace, name, labels),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.lock().pods.push(pod);
    }

    pub fn add_deployment(&self, namespace: &str, name: &str, labels: &[(&str, &str)], image: &str, ports: &[u16]) {
        let container = Container {
            name: name.to_string(),
            image: Some(image.to_string()),
            ports: Some(
                ports
                    .iter()
                    .map(|p| ContainerPort {
                        container_port: i32::from(*p),
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        };
        let deployment = Deployment {
            metadata: meta(namespace, name, labels),
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    metadata: Some(meta(namespace, name, labels)),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        };
        self.lock()
            .deployments
            .insert((namespace.to_string(), name.to_string()), deployment);
    }

    /// Serve port-forwards to `pod:port` from `addr`.
    pub fn route(&self, pod: &str, port: u16, addr: SocketAddr) {
        self.lock().routes.insert((pod.to_string(), port), addr);
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.lock()
            .deployments
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn add_readiness_gate(&self, namespace: &str, name: &str, condition: &str) {
        let mut state = self.lock();
        let pod_spec = state
            .deployments
            .get_mut(&(namespace.to_string(), name.to_string()))
            .and_then(|d| d.spec.as_mut())
            .and_then(|s| s.template.spec.as_mut());
        if let Some(pod_spec) = pod_spec {
            pod_spec.readiness_gates.get_or_insert_with(Vec::new).push(PodReadinessGate {
                condition_type: condition.to_string(),
            });
        }
    }

    pub fn replace_count(&self) -> usize {
        self.lock().replaced
    }

    pub fn fail_replace(&self, fail: bool) {
        self.lock().fail_replace = fail;
    }

    /// Make deployment listings fail.
    pub fn fail_list(&self, fail: bool) {
        self.lock().fail_list = fail;
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(x) => x,
            Err(e) => e.into_inner(),
        }
    }
}

fn meta(namespace: &str, name: &str, labels: &[(&str, &str)]) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
        ..Default::default()
    }
}

/// Equality-based selectors only, `k=v,k=v`.
fn matches(meta: &ObjectMeta, namespace: &str, selector: &str) -> bool {
    if meta.namespace.as_deref().unwrap_or("default") != namespace {
        return false;
    }
    let labels = meta.labels.clone().unwrap_or_default();
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => labels.contains_key(term),
        })
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, ClusterError> {
        Ok(self
            .lock()
            .pods
            .iter()
            .filter(|p| matches(&p.metadata, namespace, selector))
            .cloned()
            .collect())
    }

    async fn list_deployments(&self, namespace: &str, selector: &str) -> Result<Vec<Deployment>, ClusterError> {
        let state = self.lock();
        if state.fail_list {
            return Err(ClusterError::Api("list refused".to_string()));
        }
        Ok(state
            .deployments
            .values()
            .filter(|d| matches(&d.metadata, namespace, selector))
            .cloned()
            .collect())
    }

    async fn replace_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<(), ClusterError> {
        let mut state = self.lock();
        if state.fail_replace {
            return Err(ClusterError::Api("replace refused".to_string()));
        }
        let name = deployment.metadata.name.clone().unwrap_or_default();
        let key = (namespace.to_string(), name.clone());
        if !state.deployments.contains_key(&key) {
            return Err(ClusterError::Api(format!("deployment {} not found", name)));
        }
        state.deployments.insert(key, deployment.clone());
        state.replaced += 1;
        Ok(())
    }

    async fn open_stream(&self, _namespace: &str, pod: &str, port: u16) -> Result<Box<dyn Duplex>, ClusterError> {
        let addr = self.lock().routes.get(&(pod.to_string(), port)).copied();
        let addr = addr.ok_or_else(|| ClusterError::Stream {
            pod: pod.to_string(),
            port,
            reason: "no route".to_string(),
        })?;

        let stream = TcpStream::connect(addr).await.map_err(|e| ClusterError::Stream {
            pod: pod.to_string(),
            port,
            reason: e.to_string(),
        })?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn selector_filters_by_labels_and_namespace() {
        let cluster = MemoryCluster::new();
        cluster.add_pod("default", "api-1", &[("app", "api"), ("tier", "web")], "Running");
        cluster.add_pod("default", "db-1", &[("app", "db")], "Running");
        cluster.add_pod("other", "api-2", &[("app", "api")], "Running");

        let pods = cluster.list_pods("default", "app=api").await.unwrap();
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].metadata.name.as_deref(), Some("api-1"));

        assert_eq!(cluster.list_pods("default", "app=api,tier=db").await.unwrap().len(), 0);
    }
}
