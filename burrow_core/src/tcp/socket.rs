use std::io::Result;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{lookup_host, TcpListener, TcpStream};

use crate::endpoint::RemoteAddr;

pub fn bind(laddr: &SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(*laddr), Type::STREAM, Some(Protocol::TCP))?;

    // ignore error
    let _ = socket.set_reuse_address(true);

    socket.set_nonblocking(true)?;
    socket.bind(&(*laddr).into())?;
    socket.listen(1024)?;

    TcpListener::from_std(socket.into())
}

pub async fn connect(raddr: &RemoteAddr) -> Result<TcpStream> {
    let mut last_err = None;

    for addr in resolve_addr(raddr).await? {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                log::debug!("[tcp]{} resolved as {}", raddr, addr);
                // ignore error
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }

    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "could not connect to any address")
    }))
}

async fn resolve_addr(raddr: &RemoteAddr) -> Result<Vec<SocketAddr>> {
    match raddr {
        RemoteAddr::SocketAddr(addr) => Ok(vec![*addr]),
        RemoteAddr::DomainName(host, port) => Ok(lookup_host((host.as_str(), *port)).await?.collect()),
    }
}
