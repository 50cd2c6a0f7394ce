use std::io::Result;

use tokio::net::TcpStream;

use super::plain;
use super::socket;

use crate::endpoint::RemoteAddr;

pub async fn connect_and_relay(local: TcpStream, raddr: &RemoteAddr) -> Result<()> {
    let local_peer = local.peer_addr()?;

    let remote = socket::connect(raddr).await?;
    log::info!("[tcp]{} => {} as {}", local_peer, raddr, remote.peer_addr()?);

    // ignore relay error
    match plain::run_tcp_relay(local, remote).await {
        Ok(()) => {
            log::debug!("[tcp]{} => {} closed", local_peer, raddr);
            Ok(())
        }
        Err(e) => {
            log::debug!("[tcp]forward error: {}, ignored", e);
            Ok(())
        }
    }
}
