//! Loopback address and relay port allocation.
//!
//! Every forward name gets its own loopback address, handed out from
//! `ip_base` upwards. Relay ports come from a counter starting at
//! [`PROXY_PORT_START`]; neither is ever given back.

mod iface;

pub use iface::LoopbackInterface;

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;

use tokio::net::TcpStream;

/// First relay port.
pub const PROXY_PORT_START: u16 = 9400;

/// Address the allocation walk starts after.
pub const DEFAULT_IP_BASE: Ipv4Addr = Ipv4Addr::new(127, 1, 2, 0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    Exhausted { last: Ipv4Addr },
    PortsExhausted,
    InterfaceNotFound(String),
    AliasFailed { ip: Ipv4Addr, iface: String, reason: String },
    UnsupportedPlatform(&'static str),
}

impl Display for AllocError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        use AllocError::*;
        match self {
            Exhausted { last } => write!(f, "unable to find an available loopback address (last tried: {})", last),
            PortsExhausted => write!(f, "no relay port left to allocate"),
            InterfaceNotFound(msg) => write!(f, "unable to find loopback network interface: {}", msg),
            AliasFailed { ip, iface, reason } => write!(
                f,
                "cannot add address {} on network interface '{}': {}",
                ip, iface, reason
            ),
            UnsupportedPlatform(os) => write!(f, "adding loopback addresses is not supported on {}", os),
        }
    }
}

impl std::error::Error for AllocError {}

#[derive(Debug, Clone)]
pub struct AllocatorOpts {
    pub ip_base: Ipv4Addr,
    pub port_start: u16,
    /// Make sure each address is configured on the loopback interface
    /// before handing it out.
    pub alias_interface: bool,
    pub probe_timeout: Duration,
}

impl Default for AllocatorOpts {
    fn default() -> Self {
        Self {
            ip_base: DEFAULT_IP_BASE,
            port_start: PROXY_PORT_START,
            alias_interface: true,
            probe_timeout: Duration::from_millis(500),
        }
    }
}

#[derive(Debug)]
struct IpState {
    cursor: [u8; 4],
    attributed: HashMap<String, Ipv4Addr>,
}

#[derive(Debug)]
pub struct Allocator {
    ips: Mutex<IpState>,
    next_port: Mutex<Option<u16>>,
    iface: Option<Result<LoopbackInterface, AllocError>>,
    probe_timeout: Duration,
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new(AllocatorOpts::default())
    }
}

impl Allocator {
    /// The loopback interface is looked up once, here. A lookup failure is
    /// only reported when an address is requested.
    pub fn new(opts: AllocatorOpts) -> Self {
        let iface = opts.alias_interface.then(LoopbackInterface::discover);
        if let Some(Err(e)) = &iface {
            log::warn!("[alloc]{}", e);
        }

        Self {
            ips: Mutex::new(IpState {
                cursor: opts.ip_base.octets(),
                attributed: HashMap::new(),
            }),
            next_port: Mutex::new(Some(opts.port_start)),
            iface,
            probe_timeout: opts.probe_timeout,
        }
    }

    /// Address attributed to `name`, if any.
    pub fn attributed(&self, name: &str) -> Option<Ipv4Addr> {
        self.lock_ips().attributed.get(name).copied()
    }

    /// Address for `name`: the one it already has, or the next free one.
    ///
    /// A candidate is free when nothing accepts on `candidate:port`.
    /// The second value tells whether the address was attributed by this call.
    pub async fn allocate_ip(&self, name: &str, port: Option<u16>) -> Result<(Ipv4Addr, bool), AllocError> {
        loop {
            let candidate = {
                let mut state = self.lock_ips();
                if let Some(ip) = state.attributed.get(name) {
                    return Ok((*ip, false));
                }
                let next = next_ip(state.cursor);
                if next == state.cursor {
                    return Err(AllocError::Exhausted {
                        last: Ipv4Addr::from(next),
                    });
                }
                state.cursor = next;
                Ipv4Addr::from(next)
            };

            if let Some(iface) = &self.iface {
                let iface = iface.as_ref().map_err(Clone::clone)?;
                iface.ensure_address(candidate).await?;
            }

            if let Some(port) = port {
                if self.in_use(candidate, port).await {
                    log::debug!("[alloc]{}:{} already in use, skipping", candidate, port);
                    continue;
                }
            }

            let mut state = self.lock_ips();
            // a concurrent call for the same name may have won meanwhile
            if let Some(ip) = state.attributed.get(name) {
                return Ok((*ip, false));
            }
            state.attributed.insert(name.to_string(), candidate);
            log::debug!("[alloc]{} => {}", name, candidate);
            return Ok((candidate, true));
        }
    }

    pub fn allocate_port(&self) -> Result<u16, AllocError> {
        let mut next = match self.next_port.lock() {
            Ok(x) => x,
            Err(e) => e.into_inner(),
        };
        let port = next.ok_or(AllocError::PortsExhausted)?;
        *next = port.checked_add(1);
        Ok(port)
    }

    async fn in_use(&self, ip: Ipv4Addr, port: u16) -> bool {
        let addr = SocketAddr::from((ip, port));
        matches!(
            tokio::time::timeout(self.probe_timeout, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }

    fn lock_ips(&self) -> std::sync::MutexGuard<'_, IpState> {
        match self.ips.lock() {
            Ok(x) => x,
            Err(e) => e.into_inner(),
        }
    }
}

/// Next address after `a.b.c.d`.
///
/// `d` is incremented first, carrying into `c` then `b`; carried bytes
/// restart at 1. `a.255.255.255` is the last address and is returned
/// unchanged.
pub fn next_ip([a, b, c, d]: [u8; 4]) -> [u8; 4] {
    if b == 255 && c == 255 && d == 255 {
        [a, b, c, d]
    } else if c == 255 && d == 255 {
        [a, b + 1, 1, 1]
    } else if d == 255 {
        [a, b, c + 1, 1]
    } else {
        [a, b, c, d + 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn allocator(base: Ipv4Addr) -> Allocator {
        Allocator::new(AllocatorOpts {
            ip_base: base,
            alias_interface: false,
            ..Default::default()
        })
    }

    #[test]
    fn next_ip_carry() {
        let cases = [
            ([127, 0, 0, 1], [127, 0, 0, 2]),
            ([127, 0, 0, 254], [127, 0, 0, 255]),
            ([127, 0, 0, 255], [127, 0, 1, 1]),
            ([127, 0, 1, 255], [127, 0, 2, 1]),
            ([127, 0, 254, 255], [127, 0, 255, 1]),
            ([127, 0, 255, 254], [127, 0, 255, 255]),
            ([127, 0, 255, 255], [127, 1, 1, 1]),
            ([127, 255, 255, 254], [127, 255, 255, 255]),
            ([127, 255, 255, 255], [127, 255, 255, 255]),
        ];
        for (from, to) in cases {
            assert_eq!(next_ip(from), to, "from {:?}", from);
        }
    }

    #[tokio::test]
    async fn distinct_names_get_ascending_addresses() {
        let alloc = allocator(DEFAULT_IP_BASE);
        let (a, fresh_a) = alloc.allocate_ip("api", None).await.unwrap();
        let (b, fresh_b) = alloc.allocate_ip("db", None).await.unwrap();

        assert_eq!(a, Ipv4Addr::new(127, 1, 2, 1));
        assert_eq!(b, Ipv4Addr::new(127, 1, 2, 2));
        assert!(fresh_a && fresh_b);
    }

    #[tokio::test]
    async fn same_name_is_stable() {
        let alloc = allocator(DEFAULT_IP_BASE);
        let (first, _) = alloc.allocate_ip("api", Some(8080)).await.unwrap();
        let (second, fresh) = alloc.allocate_ip("api", Some(8081)).await.unwrap();

        assert_eq!(first, second);
        assert!(!fresh);
        assert_eq!(alloc.attributed("api"), Some(first));
    }

    // the whole 127.0.0.0/8 block is routed to `lo` on linux
    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn busy_address_is_skipped() {
        let busy = TcpListener::bind("127.1.2.1:0").await.unwrap();
        let port = busy.local_addr().unwrap().port();

        let alloc = allocator(DEFAULT_IP_BASE);
        let (ip, _) = alloc.allocate_ip("api", Some(port)).await.unwrap();
        assert_eq!(ip, Ipv4Addr::new(127, 1, 2, 2));
    }

    #[tokio::test]
    async fn exhaustion_is_an_error() {
        let alloc = allocator(Ipv4Addr::new(127, 255, 255, 254));
        let (ip, _) = alloc.allocate_ip("last", None).await.unwrap();
        assert_eq!(ip, Ipv4Addr::new(127, 255, 255, 255));

        let err = alloc.allocate_ip("one-too-many", None).await.unwrap_err();
        assert!(matches!(err, AllocError::Exhausted { .. }));
        // still exhausted
        assert!(alloc.allocate_ip("another", None).await.is_err());
    }

    #[test]
    fn ports_are_monotonic() {
        let alloc = allocator(DEFAULT_IP_BASE);
        let ports: Vec<_> = (0..3).map(|_| alloc.allocate_port().unwrap()).collect();
        assert_eq!(ports, vec![9400, 9401, 9402]);
    }

    #[test]
    fn ports_run_out() {
        let alloc = Allocator::new(AllocatorOpts {
            port_start: u16::MAX,
            alias_interface: false,
            ..Default::default()
        });
        assert_eq!(alloc.allocate_port(), Ok(u16::MAX));
        assert_eq!(alloc.allocate_port(), Err(AllocError::PortsExhausted));
    }
}
