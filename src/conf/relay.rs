use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use burrow_core::alloc::{AllocatorOpts, DEFAULT_IP_BASE, PROXY_PORT_START};
use burrow_core::backoff;
use burrow_core::{Hostfile, HostsFile};
use burrow_tunnel::cluster::{ClusterOpts, DEFAULT_SIDECAR_IMAGE};
use burrow_tunnel::shell;

use crate::forward::{BackoffOpts, ForwarderOpts};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConf {
    pub ip_base: Ipv4Addr,

    pub port_start: u16,

    /// Add missing addresses to the loopback interface.
    pub alias_interface: bool,

    /// Publish forward host names in the hosts file.
    pub manage_hosts: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hosts_file: Option<String>,

    pub ssh_program: String,

    pub sidecar_image: String,

    pub settle_delay_ms: u64,

    pub ready_timeout_ms: u64,

    pub backoff_min_ms: u64,

    pub backoff_max_ms: u64,

    pub backoff_factor: f64,

    pub backoff_jitter: bool,
}

impl Default for RelayConf {
    fn default() -> Self {
        Self {
            ip_base: DEFAULT_IP_BASE,
            port_start: PROXY_PORT_START,
            alias_interface: true,
            manage_hosts: true,
            hosts_file: None,
            ssh_program: shell::DEFAULT_PROGRAM.to_string(),
            sidecar_image: DEFAULT_SIDECAR_IMAGE.to_string(),
            settle_delay_ms: 5_000,
            ready_timeout_ms: 120_000,
            backoff_min_ms: 100,
            backoff_max_ms: 10_000,
            backoff_factor: backoff::DEFAULT_FACTOR,
            backoff_jitter: true,
        }
    }
}

impl RelayConf {
    pub fn allocator_opts(&self) -> AllocatorOpts {
        AllocatorOpts {
            ip_base: self.ip_base,
            port_start: self.port_start,
            alias_interface: self.alias_interface,
            ..Default::default()
        }
    }

    pub fn hostfile(&self) -> Option<Arc<dyn Hostfile>> {
        if !self.manage_hosts {
            return None;
        }
        let hosts: Arc<dyn Hostfile> = match &self.hosts_file {
            Some(path) => Arc::new(HostsFile::with_path(PathBuf::from(path))),
            None => Arc::new(HostsFile::new()),
        };
        Some(hosts)
    }

    pub fn forwarder_opts(&self) -> ForwarderOpts {
        ForwarderOpts {
            cluster: ClusterOpts {
                sidecar_image: self.sidecar_image.clone(),
                settle_delay: Duration::from_millis(self.settle_delay_ms),
            },
            ready_timeout: Duration::from_millis(self.ready_timeout_ms),
            backoff: BackoffOpts {
                min: Duration::from_millis(self.backoff_min_ms),
                max: Duration::from_millis(self.backoff_max_ms),
                factor: self.backoff_factor,
                jitter: self.backoff_jitter,
            },
            ssh_program: self.ssh_program.clone(),
        }
    }
}
