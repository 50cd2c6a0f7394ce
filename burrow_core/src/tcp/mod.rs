//! TCP relay entrance.
//!
//! The [`Proxy`] owns every relay allocation. Each forward gets its own
//! loopback address and relay port; once [`Proxy::listen`] is called, every
//! connection accepted on `local_ip:local_port` is relayed to
//! `proxy_hostname:proxy_port`.

mod middle;
mod plain;
mod socket;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::alloc::{AllocError, Allocator};
use crate::endpoint::{ProxyForward, RemoteAddr};
use crate::hosts::Hostfile;
use crate::view::View;

use middle::connect_and_relay;

pub use plain::run_relay;

type ListenerKey = (String, u16);

#[derive(Default)]
struct Registered {
    forwards: BTreeMap<String, Vec<ProxyForward>>,
    hostnames: BTreeSet<String>,
}

pub struct Proxy {
    view: Arc<dyn View>,
    hostfile: Option<Arc<dyn Hostfile>>,
    allocator: Allocator,
    registered: Mutex<Registered>,
    // a `None` slot is a listener being bound
    listeners: Mutex<HashMap<ListenerKey, Option<JoinHandle<()>>>>,
    listening: Arc<AtomicBool>,
}

impl Proxy {
    pub fn new(view: Arc<dyn View>, hostfile: Option<Arc<dyn Hostfile>>, allocator: Allocator) -> Self {
        Self {
            view,
            hostfile,
            allocator,
            registered: Mutex::new(Registered::default()),
            listeners: Mutex::new(HashMap::new()),
            listening: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    /// Attribute a loopback address and a relay port to `forward`, and
    /// register it under `name`.
    ///
    /// Addresses are keyed by `name`: every forward of the same group shares
    /// one address. The completed forward is returned; on failure nothing is
    /// registered.
    pub async fn add_forward(&self, name: &str, mut forward: ProxyForward) -> Result<ProxyForward, AllocError> {
        if let Err(e) = self.allocate(name, &mut forward).await {
            self.view.error(&format!(
                "An error has occurred while generating IP address for '{}': {}",
                forward.name, e
            ));
            return Err(e);
        }

        let ip = forward.local_ip.map(|ip| ip.to_string()).unwrap_or_default();
        match (forward.local_port, forward.proxy_port) {
            (Some(_), Some(port)) => self.view.info(&format!(
                "Successfully mapped hostname '{}' with IP '{}' and port {}",
                forward.hostname(),
                ip,
                port
            )),
            _ => self.view.info(&format!(
                "Successfully mapped hostname '{}' with IP '{}'",
                forward.hostname(),
                ip
            )),
        }

        let new_hostname = {
            let mut registered = self.lock_registered();
            registered
                .forwards
                .entry(name.to_string())
                .or_default()
                .push(forward.clone());
            self.hostfile.is_some() && registered.hostnames.insert(forward.hostname().to_string())
        };

        if new_hostname {
            self.register_host(&forward).await;
        }

        Ok(forward)
    }

    async fn allocate(&self, name: &str, forward: &mut ProxyForward) -> Result<(), AllocError> {
        if forward.local_ip.is_none() {
            let (ip, _) = self.allocator.allocate_ip(name, forward.local_port).await?;
            forward.local_ip = Some(ip);
        }
        if forward.proxy_port.is_none() {
            forward.proxy_port = Some(self.allocator.allocate_port()?);
        }
        Ok(())
    }

    async fn register_host(&self, forward: &ProxyForward) {
        let (Some(hostfile), Some(ip)) = (&self.hostfile, forward.local_ip) else {
            return;
        };

        let mut entries = vec![ip.to_string()];
        // resolvers on macOS wait on a missing AAAA record before using the A one
        if cfg!(target_os = "macos") {
            let [a, b, c, d] = ip.octets();
            entries.push(format!("::{}:{}:{}:{}", a, b, c, d));
        }

        for entry in entries {
            if let Err(e) = hostfile.add_host(&entry, forward.hostname()).await {
                self.view.error(&format!(
                    "An error has occurred while trying to write host file for application '{}' (ip: {}): {}",
                    forward.name, entry, e
                ));
            }
        }
    }

    /// Every forward registered under `name`.
    pub fn forwards(&self, name: &str) -> Vec<ProxyForward> {
        self.lock_registered().forwards.get(name).cloned().unwrap_or_default()
    }

    /// Open a listener for every registered forward that has none yet.
    ///
    /// Listeners are keyed by `(name, local_port)`; a key is bound at most
    /// once, so calling this again only picks up forwards added since.
    /// Returns the number of listeners opened by this call.
    pub fn listen(self: &Arc<Self>) -> usize {
        let snapshot: Vec<(String, ProxyForward)> = {
            let registered = self.lock_registered();
            registered
                .forwards
                .iter()
                .flat_map(|(name, pfs)| pfs.iter().map(move |pf| (name.clone(), pf.clone())))
                .collect()
        };

        let mut opened = 0;
        for (name, forward) in snapshot {
            // no local port: the address only serves name resolution
            let (Some(ip), Some(port), Some(raddr)) = (forward.local_ip, forward.local_port, forward.upstream())
            else {
                continue;
            };

            let key = (name, port);
            {
                let mut listeners = self.lock_listeners();
                if listeners.contains_key(&key) {
                    continue;
                }
                listeners.insert(key.clone(), None);
            }

            let laddr = SocketAddr::from((ip, port));
            let lis = match socket::bind(&laddr) {
                Ok(lis) => lis,
                Err(e) => {
                    self.view.error(&format!(
                        "Could not create proxy listener for '{}' ({}): {}",
                        laddr,
                        forward.hostname(),
                        e
                    ));
                    self.lock_listeners().remove(&key);
                    continue;
                }
            };

            self.view.info(&format!(
                "Proxifying {} locally ({}) <-> forwarding to {}",
                forward.hostname(),
                laddr,
                raddr
            ));

            let handle = tokio::spawn(run_listener(
                lis,
                forward.hostname().to_string(),
                raddr,
                self.listening.clone(),
                self.view.clone(),
            ));
            self.lock_listeners().insert(key, Some(handle));
            opened += 1;
        }

        opened
    }

    pub fn listener_count(&self) -> usize {
        self.lock_listeners().values().filter(|h| h.is_some()).count()
    }

    /// Close every listener and remove every registered host name.
    pub async fn stop(&self) {
        self.listening.store(false, Ordering::Release);

        let handles: Vec<_> = self.lock_listeners().drain().collect();
        for ((name, port), handle) in handles {
            if let Some(handle) = handle {
                log::debug!("[tcp]closing listener {}:{}", name, port);
                handle.abort();
            }
        }

        let hostnames = std::mem::take(&mut self.lock_registered().hostnames);
        if let Some(hostfile) = &self.hostfile {
            for hostname in hostnames {
                if let Err(e) = hostfile.remove_host(&hostname).await {
                    self.view.error(&format!(
                        "An error has occurred while trying to remove host '{}' from file: {}",
                        hostname, e
                    ));
                }
            }
        }
    }

    fn lock_registered(&self) -> MutexGuard<'_, Registered> {
        match self.registered.lock() {
            Ok(x) => x,
            Err(e) => e.into_inner(),
        }
    }

    fn lock_listeners(&self) -> MutexGuard<'_, HashMap<ListenerKey, Option<JoinHandle<()>>>> {
        match self.listeners.lock() {
            Ok(x) => x,
            Err(e) => e.into_inner(),
        }
    }
}

async fn run_listener(
    lis: TcpListener,
    hostname: String,
    raddr: RemoteAddr,
    listening: Arc<AtomicBool>,
    view: Arc<dyn View>,
) {
    let raddr = Arc::new(raddr);
    let hostname = Arc::new(hostname);

    loop {
        let accepted = lis.accept().await;
        if !listening.load(Ordering::Acquire) {
            break;
        }

        let (local, addr) = match accepted {
            Ok(x) => x,
            Err(e) if e.kind() == ErrorKind::ConnectionAborted => {
                log::warn!("[tcp]failed to accept: {}", e);
                continue;
            }
            Err(e) => {
                view.error(&format!("Could not accept client connection for '{}': {}", hostname, e));
                return;
            }
        };

        // ignore error
        let _ = local.set_nodelay(true);

        let raddr = raddr.clone();
        let hostname = hostname.clone();
        let view = view.clone();
        tokio::spawn(async move {
            match connect_and_relay(local, &raddr).await {
                Ok(()) => log::debug!("[tcp]{} => {}, finish", addr, raddr),
                Err(e) => view.error(&format!(
                    "Error when dialing with target '{}' for '{}': {}",
                    raddr, hostname, e
                )),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::AllocatorOpts;
    use crate::view::MemoryView;

    use std::net::Ipv4Addr;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[derive(Default)]
    struct RecordingHosts {
        entries: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Hostfile for RecordingHosts {
        async fn add_host(&self, ip: &str, hostname: &str) -> std::io::Result<()> {
            self.entries.lock().unwrap().push((ip.to_string(), hostname.to_string()));
            Ok(())
        }

        async fn remove_host(&self, hostname: &str) -> std::io::Result<()> {
            self.entries.lock().unwrap().retain(|(_, h)| h != hostname);
            Ok(())
        }
    }

    fn allocator(base: Ipv4Addr) -> Allocator {
        Allocator::new(AllocatorOpts {
            ip_base: base,
            alias_interface: false,
            ..Default::default()
        })
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    async fn echo_server() -> u16 {
        let lis = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = lis.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = lis.accept().await.unwrap();
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn add_forward_allocates_address_and_port() {
        let view = Arc::new(MemoryView::new());
        let hosts = Arc::new(RecordingHosts::default());
        let hostfile: Arc<dyn Hostfile> = hosts.clone();
        let proxy = Proxy::new(view.clone(), Some(hostfile), allocator(Ipv4Addr::new(127, 1, 2, 0)));

        let a = proxy
            .add_forward("api", ProxyForward::new("api", None, None, Some(8080), 80))
            .await
            .unwrap();
        let b = proxy
            .add_forward("api", ProxyForward::new("api", None, None, Some(8443), 443))
            .await
            .unwrap();

        assert_eq!(a.local_ip, Some(Ipv4Addr::new(127, 1, 2, 1)));
        assert_eq!(b.local_ip, a.local_ip);
        assert_eq!(a.proxy_port, Some(9400));
        assert_eq!(b.proxy_port, Some(9401));
        assert_eq!(proxy.forwards("api").len(), 2);
        assert_eq!(
            view.messages()[0],
            "Successfully mapped hostname 'api' with IP '127.1.2.1' and port 9400"
        );

        // one host name, registered once
        let entries = hosts.entries.lock().unwrap().clone();
        assert_eq!(entries[0], ("127.1.2.1".to_string(), "api".to_string()));
        assert!(entries.iter().all(|(_, h)| h == "api"));

        proxy.stop().await;
        assert!(hosts.entries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn allocation_failure_is_reported() {
        let view = Arc::new(MemoryView::new());
        let proxy = Proxy::new(view.clone(), None, allocator(Ipv4Addr::new(127, 255, 255, 255)));

        let res = proxy
            .add_forward("api", ProxyForward::new("api", None, None, Some(8080), 80))
            .await;

        assert!(matches!(res, Err(AllocError::Exhausted { .. })));
        assert_eq!(view.errors().len(), 1);
        assert!(proxy.forwards("api").is_empty());
    }

    #[tokio::test]
    async fn relay_passes_bytes_through() {
        let _ = env_logger::try_init();

        let upstream = echo_server().await;
        let local_port = free_port();

        let view = Arc::new(MemoryView::new());
        let proxy = Arc::new(Proxy::new(view.clone(), None, allocator(Ipv4Addr::new(127, 0, 0, 0))));
        let pf = ProxyForward::new("echo", None, Some("127.0.0.1".into()), Some(local_port), upstream);
        let pf = proxy.add_forward("echo", pf).await.unwrap();
        assert_eq!(pf.proxy_port, Some(upstream));

        assert_eq!(proxy.listen(), 1);
        assert_eq!(proxy.listen(), 0);
        assert_eq!(proxy.listener_count(), 1);

        let mut client = TcpStream::connect((Ipv4Addr::new(127, 0, 0, 1), local_port)).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        // closing our side ends the relay, the upstream close comes back
        client.shutdown().await.unwrap();
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        proxy.stop().await;
        assert_eq!(proxy.listener_count(), 0);
        assert!(view.errors().is_empty());
    }

    #[tokio::test]
    async fn dial_failure_is_reported_per_connection() {
        let dead = free_port();
        let local_port = free_port();

        let view = Arc::new(MemoryView::new());
        let proxy = Arc::new(Proxy::new(view.clone(), None, allocator(Ipv4Addr::new(127, 0, 0, 0))));
        let pf = ProxyForward::new("dead", None, Some("127.0.0.1".into()), Some(local_port), dead);
        proxy.add_forward("dead", pf).await.unwrap();
        proxy.listen();

        for _ in 0..2 {
            let mut client = TcpStream::connect((Ipv4Addr::new(127, 0, 0, 1), local_port)).await.unwrap();
            let mut buf = [0u8; 1];
            let _ = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf)).await;
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(view.errors().len(), 2);
        // the listener survived both failures
        assert_eq!(proxy.listener_count(), 1);
        proxy.stop().await;
    }

    #[tokio::test]
    async fn bind_failure_only_affects_its_key() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken_port = taken.local_addr().unwrap().port();
        let free = free_port();

        let view = Arc::new(MemoryView::new());
        let proxy = Arc::new(Proxy::new(view.clone(), None, allocator(Ipv4Addr::new(127, 0, 0, 0))));
        let mut a = ProxyForward::new("a", None, Some("127.0.0.1".into()), Some(taken_port), 1);
        a.local_ip = Some(Ipv4Addr::LOCALHOST);
        let mut b = ProxyForward::new("b", None, Some("127.0.0.1".into()), Some(free), 1);
        b.local_ip = Some(Ipv4Addr::LOCALHOST);
        proxy.add_forward("a", a).await.unwrap();
        proxy.add_forward("b", b).await.unwrap();

        assert_eq!(proxy.listen(), 1);
        assert_eq!(view.errors().len(), 1);
        proxy.stop().await;
    }
}
