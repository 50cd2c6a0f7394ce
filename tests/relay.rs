use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use burrow::conf::FullConf;
use burrow::core::{Allocator, MemoryView, Proxy, ProxyForward};

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

async fn upstream(reply: &'static [u8]) -> u16 {
    let lis = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = lis.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = lis.accept().await.unwrap();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 64];
                let n = stream.read(&mut buf).await.unwrap();
                stream.write_all(reply).await.unwrap();
                stream.write_all(&buf[..n]).await.unwrap();
            });
        }
    });
    port
}

fn proxy_from_conf(view: Arc<MemoryView>) -> Arc<Proxy> {
    let conf = FullConf::from_conf_str(
        r#"
[relay]
ip_base = "127.0.0.0"
alias_interface = false
manage_hosts = false
"#,
    )
    .unwrap();
    Arc::new(Proxy::new(view, conf.relay.hostfile(), Allocator::new(conf.relay.allocator_opts())))
}

#[tokio::test]
async fn relay_pass_through() {
    let _ = env_logger::try_init();

    let upstream = upstream(b"pong:").await;
    let local_port = free_port();

    let view = Arc::new(MemoryView::new());
    let proxy = proxy_from_conf(view.clone());
    let forward = ProxyForward::new("svc", None, Some("127.0.0.1".to_string()), Some(local_port), upstream);
    let forward = proxy.add_forward("svc", forward).await.unwrap();
    assert_eq!(forward.local_ip, Some(Ipv4Addr::new(127, 0, 0, 1)));

    assert_eq!(proxy.listen(), 1);

    for _ in 0..3 {
        let mut client = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buf, b"pong:ping");
    }

    proxy.stop().await;
    assert!(view.errors().is_empty(), "{:?}", view.errors());
}

#[tokio::test]
async fn listen_is_idempotent() {
    let view = Arc::new(MemoryView::new());
    let proxy = proxy_from_conf(view.clone());

    let first = free_port();
    proxy
        .add_forward("svc", ProxyForward::new("svc", None, None, Some(first), 80))
        .await
        .unwrap();
    assert_eq!(proxy.listen(), 1);
    assert_eq!(proxy.listen(), 0);

    // a later forward gets its own listener, the first one is left alone
    let second = free_port();
    proxy
        .add_forward("svc", ProxyForward::new("svc", None, None, Some(second), 443))
        .await
        .unwrap();
    assert_eq!(proxy.listen(), 1);
    assert_eq!(proxy.listener_count(), 2);

    // the relay ports are distinct and ascending
    let ports: Vec<_> = proxy.forwards("svc").iter().filter_map(|f| f.proxy_port).collect();
    assert_eq!(ports, vec![9400, 9401]);

    proxy.stop().await;
    assert_eq!(proxy.listener_count(), 0);
    assert!(view.errors().is_empty(), "{:?}", view.errors());
}
