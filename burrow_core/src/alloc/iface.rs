use std::net::Ipv4Addr;

use tokio::process::Command;

use super::AllocError;

/// The host's loopback interface, where forward addresses live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackInterface {
    name: String,
}

impl LoopbackInterface {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[cfg(unix)]
    pub fn discover() -> Result<Self, AllocError> {
        use nix::net::if_::InterfaceFlags;

        let addrs = nix::ifaddrs::getifaddrs().map_err(|e| AllocError::InterfaceNotFound(e.to_string()))?;
        addrs
            .into_iter()
            .find(|ifa| ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK))
            .map(|ifa| Self::new(ifa.interface_name))
            .ok_or_else(|| AllocError::InterfaceNotFound("no interface flagged as loopback".to_string()))
    }

    #[cfg(not(unix))]
    pub fn discover() -> Result<Self, AllocError> {
        Err(AllocError::UnsupportedPlatform(std::env::consts::OS))
    }

    /// Whether the interface already answers on `ip`.
    #[cfg(unix)]
    pub fn has_address(&self, ip: Ipv4Addr) -> Result<bool, AllocError> {
        let addrs = nix::ifaddrs::getifaddrs().map_err(|e| AllocError::InterfaceNotFound(e.to_string()))?;

        for ifa in addrs.filter(|ifa| ifa.interface_name == self.name) {
            let Some(addr) = ifa.address.as_ref().and_then(|a| a.as_sockaddr_in()) else {
                continue;
            };
            let addr = Ipv4Addr::from(addr.ip());
            if addr == ip {
                return Ok(true);
            }

            // linux routes the whole configured loopback network to the
            // interface, aliases are only needed outside of it
            #[cfg(target_os = "linux")]
            if let Some(mask) = ifa.netmask.as_ref().and_then(|m| m.as_sockaddr_in()) {
                let mask = u32::from(Ipv4Addr::from(mask.ip()));
                if u32::from(addr) & mask == u32::from(ip) & mask {
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }

    #[cfg(not(unix))]
    pub fn has_address(&self, _ip: Ipv4Addr) -> Result<bool, AllocError> {
        Err(AllocError::UnsupportedPlatform(std::env::consts::OS))
    }

    /// Add `ip` to the interface unless it is already there.
    pub async fn ensure_address(&self, ip: Ipv4Addr) -> Result<(), AllocError> {
        if self.has_address(ip)? {
            return Ok(());
        }

        let (program, args) = self.alias_command(ip)?;
        log::info!("[alloc]{} {}", program, args.join(" "));

        let output = Command::new(program)
            .args(&args)
            .output()
            .await
            .map_err(|e| self.alias_failed(ip, e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.alias_failed(ip, format!("{} ({})", output.status, stderr.trim())));
        }
        Ok(())
    }

    /// Command adding `ip` as an alias on this interface.
    pub fn alias_command(&self, ip: Ipv4Addr) -> Result<(&'static str, Vec<String>), AllocError> {
        let iface = self.name.clone();
        let ip = ip.to_string();

        cfg_if::cfg_if! {
            if #[cfg(target_os = "macos")] {
                Ok(("ifconfig", vec![iface, "alias".to_string(), ip, "up".to_string()]))
            } else if #[cfg(target_os = "linux")] {
                if on_path("ifconfig") {
                    Ok(("ifconfig", vec![iface, ip, "up".to_string()]))
                } else {
                    Ok(("ip", vec!["addr".to_string(), "add".to_string(), format!("{}/32", ip), "dev".to_string(), iface]))
                }
            } else {
                let _ = (iface, ip);
                Err(AllocError::UnsupportedPlatform(std::env::consts::OS))
            }
        }
    }

    fn alias_failed(&self, ip: Ipv4Addr, reason: String) -> AllocError {
        AllocError::AliasFailed {
            ip,
            iface: self.name.clone(),
            reason,
        }
    }
}

#[cfg(target_os = "linux")]
fn on_path(program: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn discover_loopback() {
        let iface = LoopbackInterface::discover().unwrap();
        assert!(!iface.name().is_empty());
        assert!(iface.has_address(Ipv4Addr::LOCALHOST).unwrap());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn linux_loopback_covers_whole_block() {
        let iface = LoopbackInterface::discover().unwrap();
        assert!(iface.has_address(Ipv4Addr::new(127, 1, 2, 1)).unwrap());
    }

    #[cfg(target_os = "macos")]
    #[test]
    fn macos_alias_command() {
        let iface = LoopbackInterface::new("lo0");
        let (program, args) = iface.alias_command(Ipv4Addr::new(127, 1, 2, 1)).unwrap();
        assert_eq!(program, "ifconfig");
        assert_eq!(args, vec!["lo0", "alias", "127.1.2.1", "up"]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn linux_alias_command() {
        let iface = LoopbackInterface::new("lo");
        let (program, args) = iface.alias_command(Ipv4Addr::new(127, 1, 2, 1)).unwrap();
        match program {
            "ifconfig" => assert_eq!(args, vec!["lo", "127.1.2.1", "up"]),
            "ip" => assert_eq!(args, vec!["addr", "add", "127.1.2.1/32", "dev", "lo"]),
            other => panic!("unexpected program {}", other),
        }
    }
}
