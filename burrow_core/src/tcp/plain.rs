use std::io::Result;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Copy both directions until each side is drained. EOF on one side shuts
/// down the write half of the other.
#[inline]
pub async fn run_relay<A, B>(mut local: A, mut remote: B) -> Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    realm_io::bidi_copy(&mut local, &mut remote).await.map(|_| ())
}

#[inline]
#[cfg(target_os = "linux")]
pub async fn run_tcp_relay(mut local: TcpStream, mut remote: TcpStream) -> Result<()> {
    use std::io::ErrorKind;
    match realm_io::bidi_zero_copy(&mut local, &mut remote).await {
        Ok(_) => Ok(()),
        Err(ref e) if e.kind() == ErrorKind::InvalidInput => {
            realm_io::bidi_copy(&mut local, &mut remote).await.map(|_| ())
        }
        Err(e) => Err(e),
    }
}

#[inline]
#[cfg(not(target_os = "linux"))]
pub async fn run_tcp_relay(local: TcpStream, remote: TcpStream) -> Result<()> {
    run_relay(local, remote).await
}
