use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, PostParams, Portforwarder};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::api::{ClusterApi, ClusterConnector, Duplex};
use super::ClusterError;

/// Points at a kubeconfig file to use instead of the default one.
pub const KUBE_CONFIG_ENV: &str = "BURROW_KUBE_CONFIG";

#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Load the kubeconfig and build a client for `context`.
    pub async fn connect(context: Option<&str>) -> Result<Self, ClusterError> {
        let kubeconfig = match std::env::var_os(KUBE_CONFIG_ENV) {
            Some(path) => Kubeconfig::read_from(path),
            None => Kubeconfig::read(),
        }
        .map_err(|e| ClusterError::Config(e.to_string()))?;

        let opts = KubeConfigOptions {
            context: context.map(str::to_string),
            ..Default::default()
        };
        let config = Config::from_custom_kubeconfig(kubeconfig, &opts)
            .await
            .map_err(|e| ClusterError::Config(e.to_string()))?;
        let client = Client::try_from(config).map_err(|e| ClusterError::Config(e.to_string()))?;

        Ok(Self::new(client))
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, ClusterError> {
        let list = self
            .pods(namespace)
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(api_error)?;
        Ok(list.items)
    }

    async fn list_deployments(&self, namespace: &str, selector: &str) -> Result<Vec<Deployment>, ClusterError> {
        let list = self
            .deployments(namespace)
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(api_error)?;
        Ok(list.items)
    }

    async fn replace_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<(), ClusterError> {
        let name = deployment.metadata.name.as_deref().unwrap_or_default();
        self.deployments(namespace)
            .replace(name, &PostParams::default(), deployment)
            .await
            .map_err(api_error)?;
        Ok(())
    }

    async fn open_stream(&self, namespace: &str, pod: &str, port: u16) -> Result<Box<dyn Duplex>, ClusterError> {
        let stream_error = |reason: String| ClusterError::Stream {
            pod: pod.to_string(),
            port,
            reason,
        };

        let mut forwarder = self
            .pods(namespace)
            .portforward(pod, &[port])
            .await
            .map_err(|e| stream_error(e.to_string()))?;
        let stream = forwarder
            .take_stream(port)
            .ok_or_else(|| stream_error("port not forwarded".to_string()))?;

        Ok(Box::new(KubeStream {
            stream: Box::new(stream),
            _forwarder: Box::new(forwarder),
        }))
    }
}

fn api_error(e: kube::Error) -> ClusterError {
    ClusterError::Api(e.to_string())
}

/// A port-forward stream, keeping its forwarder alive.
struct KubeStream {
    stream: Box<dyn Duplex>,
    _forwarder: Box<Portforwarder>,
}

impl AsyncRead for KubeStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for KubeStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.stream).poll_shutdown(cx)
    }
}

/// Connects to clusters through the local kubeconfig.
#[derive(Debug, Default, Clone, Copy)]
pub struct KubeConnector;

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(&self, context: Option<&str>) -> Result<Arc<dyn ClusterApi>, ClusterError> {
        let cluster = KubeCluster::connect(context).await?;
        Ok(Arc::new(cluster))
    }
}
