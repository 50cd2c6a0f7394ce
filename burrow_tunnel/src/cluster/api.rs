use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use tokio::io::{AsyncRead, AsyncWrite};

use super::ClusterError;

/// A bidirectional byte stream to a pod port.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Duplex for T {}

/// The slice of the cluster API the backends use.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, ClusterError>;

    async fn list_deployments(&self, namespace: &str, selector: &str) -> Result<Vec<Deployment>, ClusterError>;

    async fn replace_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<(), ClusterError>;

    /// Open a port-forward stream to `port` of `pod`.
    async fn open_stream(&self, namespace: &str, pod: &str, port: u16) -> Result<Box<dyn Duplex>, ClusterError>;
}

/// Builds a [`ClusterApi`] for a kubeconfig context, the current one when
/// `None`.
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(&self, context: Option<&str>) -> Result<Arc<dyn ClusterApi>, ClusterError>;
}

/// Hands out the same cluster whatever the context.
#[derive(Clone)]
pub struct StaticConnector(pub Arc<dyn ClusterApi>);

#[async_trait]
impl ClusterConnector for StaticConnector {
    async fn connect(&self, _context: Option<&str>) -> Result<Arc<dyn ClusterApi>, ClusterError> {
        Ok(self.0.clone())
    }
}
