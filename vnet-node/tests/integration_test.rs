use anyhow::Result;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use vnet_core::{Event, Family, MsgFlags, NetworkId, Node, NodeConfig, Reachability, SocketType};
use vnet_node::config::DaemonConfig;
use vnet_node::runtime::run_node;

const NET: NetworkId = NetworkId(0x8056_c2e2_1c00_0001);

fn node_config(dir: &Path) -> NodeConfig {
    let mut cfg = NodeConfig::new(dir);
    cfg.udp_port = 0;
    cfg.bind_addr = "127.0.0.1".to_string();
    cfg.keepalive_interval = Duration::from_millis(100);
    cfg.peer_timeout = Duration::from_secs(5);
    cfg
}

fn free_udp_port() -> u16 {
    let sock = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    sock.local_addr().unwrap().port()
}

async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(15);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn is_direct(node: &Node, peer: vnet_core::NodeId) -> bool {
    node.peers()
        .iter()
        .any(|p| p.address == peer && p.reachability == Reachability::Direct)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_two_nodes_exchange_stream_data() -> Result<()> {
    let dir_a = tempfile::tempdir()?;
    let dir_b = tempfile::tempdir()?;

    let a = Node::start(node_config(dir_a.path()), None)?;
    let mut cfg_b = node_config(dir_b.path());
    cfg_b.bootstrap = vec![a.local_udp_addr().to_string()];
    let events_b = Arc::new(Mutex::new(Vec::new()));
    let sink = events_b.clone();
    let b = Node::start(
        cfg_b,
        Some(Arc::new(move |e: Event| sink.lock().unwrap().push(e))),
    )?;

    a.join(NET)?;
    b.join(NET)?;
    wait_for("direct path", || is_direct(&a, b.node_id()) && is_direct(&b, a.node_id())).await;
    wait_for("networks ready", || a.transport_is_ready(NET) && b.transport_is_ready(NET)).await;
    assert!(events_b
        .lock()
        .unwrap()
        .contains(&Event::PeerDirect(a.node_id())));

    // Server side on A, blocking calls on a plain thread.
    let sa = a.sockets().clone();
    let listener = sa.open(Family::Ipv6, SocketType::Stream, 0)?;
    sa.bind(listener, "[::]:8080".parse()?)?;
    sa.listen(listener, 4)?;
    let server = std::thread::spawn(move || -> vnet_core::Result<Vec<u8>> {
        let (conn, _) = sa.accept(listener)?;
        let request = sa.recv(conn, 1024, MsgFlags::empty())?;
        sa.send(conn, b"pong", MsgFlags::empty())?;
        sa.close(conn)?;
        Ok(request)
    });

    let target = SocketAddr::new(a.address(NET, Family::Ipv6).unwrap(), 8080);
    let sb = b.sockets().clone();
    let reply = tokio::task::spawn_blocking(move || -> vnet_core::Result<Vec<u8>> {
        let fd = sb.open(Family::Ipv6, SocketType::Stream, 0)?;
        sb.connect(fd, target)?;
        sb.send(fd, b"ping", MsgFlags::empty())?;
        let mut reply = Vec::new();
        loop {
            let chunk = sb.recv(fd, 1024, MsgFlags::empty())?;
            if chunk.is_empty() {
                break;
            }
            reply.extend_from_slice(&chunk);
        }
        sb.close(fd)?;
        Ok(reply)
    })
    .await??;

    assert_eq!(reply, b"pong");
    assert_eq!(server.join().unwrap()?, b"ping");

    tokio::task::spawn_blocking(move || {
        b.stop();
        a.stop();
    })
    .await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ipv4_datagrams_resolve_through_announcements() -> Result<()> {
    let dir_a = tempfile::tempdir()?;
    let dir_b = tempfile::tempdir()?;

    let a = Node::start(node_config(dir_a.path()), None)?;
    let mut cfg_b = node_config(dir_b.path());
    cfg_b.bootstrap = vec![a.local_udp_addr().to_string()];
    let b = Node::start(cfg_b, None)?;
    a.join(NET)?;
    b.join(NET)?;
    wait_for("ipv4 ready", || {
        a.address(NET, Family::Ipv4).is_some() && b.address(NET, Family::Ipv4).is_some()
    })
    .await;

    let a_ip = a.address(NET, Family::Ipv4).unwrap();
    let sa = a.sockets().clone();
    let rx = sa.open(Family::Ipv4, SocketType::Datagram, 0)?;
    sa.bind(rx, SocketAddr::new(a_ip, 5353))?;

    // B learns A's IPv4 address from A's announcement.
    let sb = b.sockets().clone();
    let tx = sb.open(Family::Ipv4, SocketType::Datagram, 0)?;
    let dest = SocketAddr::new(a_ip, 5353);
    wait_for("announcement", || sb.send_to(tx, b"hello", dest).is_ok()).await;

    let (data, from) = tokio::task::spawn_blocking(move || {
        sa.set_recv_timeout(rx, Some(Duration::from_secs(5)))?;
        sa.recv_from(rx, 64, MsgFlags::empty())
    })
    .await??;
    assert_eq!(data, b"hello");
    assert_eq!(Some(from.ip()), b.address(NET, Family::Ipv4));
    assert_ne!(from.ip(), IpAddr::from([0, 0, 0, 0]));

    tokio::task::spawn_blocking(move || {
        b.stop();
        a.stop();
    })
    .await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_run_node_echo_service() -> Result<()> {
    let dir_a = tempfile::tempdir()?;
    let dir_b = tempfile::tempdir()?;

    // Learn A's address up front so B can dial it.
    let first = Node::start(node_config(dir_a.path()), None)?;
    let a_id = first.node_id();
    tokio::task::spawn_blocking(move || first.stop()).await?;

    let port = free_udp_port();
    let mut cfg = DaemonConfig::default();
    cfg.node = node_config(dir_a.path());
    cfg.node.udp_port = port;
    cfg.networks = vec![NET];
    cfg.echo_port = Some(7);
    cfg.status_interval = Duration::from_millis(200);

    let (stop_tx, stop_rx) = watch::channel(false);
    let log = Arc::new(Mutex::new(Vec::<String>::new()));
    let log_sink = log.clone();
    let daemon = tokio::spawn(run_node(
        cfg,
        stop_rx,
        Box::new(move |m| {
            println!("[NODE] {m}");
            log_sink.lock().unwrap().push(m);
        }),
    ));

    let mut cfg_b = node_config(dir_b.path());
    cfg_b.bootstrap = vec![format!("127.0.0.1:{port}")];
    let b = Node::start(cfg_b, None)?;
    b.join(NET)?;
    wait_for("direct path", || is_direct(&b, a_id)).await;
    wait_for("network ready", || b.transport_is_ready(NET)).await;
    wait_for("echo service", || {
        log.lock()
            .unwrap()
            .iter()
            .any(|m| m.starts_with("Echo service listening") && m.contains('['))
    })
    .await;

    let target = SocketAddr::new(IpAddr::V6(vnet_core::rfc4193_addr(NET, a_id)), 7);
    let sb = b.sockets().clone();
    let echoed = tokio::task::spawn_blocking(move || -> vnet_core::Result<Vec<u8>> {
        let fd = sb.open(Family::Ipv6, SocketType::Stream, 0)?;
        sb.connect(fd, target)?;
        let payload = vec![0x5a; 10_000];
        let mut sent = 0;
        while sent < payload.len() {
            sent += sb.send(fd, &payload[sent..], MsgFlags::empty())?;
        }
        sb.shutdown(fd, std::net::Shutdown::Write)?;
        let mut got = Vec::new();
        loop {
            let chunk = sb.recv(fd, 4096, MsgFlags::empty())?;
            if chunk.is_empty() {
                break;
            }
            got.extend_from_slice(&chunk);
        }
        sb.close(fd)?;
        Ok(got)
    })
    .await??;
    assert_eq!(echoed, vec![0x5a; 10_000]);

    stop_tx.send(true)?;
    daemon.await??;
    tokio::task::spawn_blocking(move || b.stop()).await?;

    let log = log.lock().unwrap();
    assert!(log.iter().any(|m| m.starts_with(&format!("Node {a_id} started"))));
    assert!(log.iter().any(|m| m == "Stop requested"));
    Ok(())
}
