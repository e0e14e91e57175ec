use anyhow::{Context, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::thread;
use tokio::sync::{mpsc, watch};
use vnet_core::{Event, Family, MsgFlags, Node, SocketLayer, SocketType};

use crate::config::DaemonConfig;

pub type LogFn = Box<dyn Fn(String) + Send + Sync + 'static>;

const ECHO_BACKLOG: i32 = 16;
const ECHO_CHUNK: usize = 16 * 1024;

/// Start a node, join the configured networks and run until `stop` flips or
/// Ctrl+C arrives. The node is stopped before returning.
pub async fn run_node(cfg: DaemonConfig, mut stop: watch::Receiver<bool>, log: LogFn) -> Result<()> {
    let log = Arc::new(log);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();
    let observer = Arc::new(move |event: Event| {
        let _ = event_tx.send(event);
    });

    let node_cfg = cfg.node.clone();
    let storage = node_cfg.storage_path.display().to_string();
    // Start builds and hands off its own runtime, which must not be dropped
    // on an async worker if start fails.
    let node = tokio::task::spawn_blocking(move || Node::start(node_cfg, Some(observer)))
        .await
        .context("node start task failed")?
        .with_context(|| format!("failed to start node with storage {storage}"))?;

    (log.as_ref())(format!(
        "Node {} started: udp={} roots={} networks={}",
        node.node_id(),
        node.local_udp_addr(),
        cfg.node.roots.len(),
        cfg.networks.len()
    ));

    for nwid in &cfg.networks {
        node.join(*nwid)
            .with_context(|| format!("failed to join network {nwid}"))?;
        (log.as_ref())(format!("Joining network {nwid}"));
    }

    let mut echo_v4 = false;
    let mut echo_v6 = false;
    let mut status = tokio::time::interval(cfg.status_interval);
    status.tick().await;

    let result = loop {
        tokio::select! {
            _ = status.tick() => {
                let peers = node.peers();
                let direct = peers.iter().filter(|p| p.reachability == vnet_core::Reachability::Direct).count();
                (log.as_ref())(format!(
                    "Status: online={} peers={} direct={} networks={}",
                    node.is_online(),
                    peers.len(),
                    direct,
                    node.joined_networks().len()
                ));
            }
            Some(event) = event_rx.recv() => {
                (log.as_ref())(format!("Event: {event}"));
                let Some(port) = cfg.echo_port else {
                    continue;
                };
                let family = match event {
                    Event::NetworkReadyIpv4(_) if !echo_v4 => {
                        echo_v4 = true;
                        Family::Ipv4
                    }
                    Event::NetworkReadyIpv6(_) if !echo_v6 => {
                        echo_v6 = true;
                        Family::Ipv6
                    }
                    _ => continue,
                };
                match start_echo(node.sockets().clone(), family, port) {
                    Ok(addr) => (log.as_ref())(format!("Echo service listening on {addr}")),
                    Err(e) => break Err(e),
                }
            }
            _ = stop.changed() => {
                if *stop.borrow() {
                    (log.as_ref())("Stop requested".to_string());
                    break Ok(());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                (log.as_ref())("Ctrl+C received".to_string());
                break Ok(());
            }
        }
    };

    let stopping = node.clone();
    tokio::task::spawn_blocking(move || stopping.stop())
        .await
        .context("node stop task failed")?;
    (log.as_ref())(format!("Node {} stopped", node.node_id()));
    result
}

/// Listen on the wildcard address of `family` and echo every connection on
/// its own thread. Threads exit when their socket fails, which includes the
/// node stopping.
pub fn start_echo(sockets: SocketLayer, family: Family, port: u16) -> Result<SocketAddr> {
    let any = match family {
        Family::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        Family::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    let listener = sockets
        .open(family, SocketType::Stream, 0)
        .context("failed to open echo socket")?;
    let bound = sockets
        .bind(listener, SocketAddr::new(any, port))
        .with_context(|| format!("failed to bind echo service to port {port}"))?;
    sockets
        .listen(listener, ECHO_BACKLOG)
        .context("failed to listen on echo socket")?;

    thread::Builder::new()
        .name(format!("vnet-echo-{port}"))
        .spawn(move || {
            while let Ok((conn, from)) = sockets.accept(listener) {
                tracing::debug!(%from, "echo connection");
                let sockets = sockets.clone();
                let spawned = thread::Builder::new()
                    .name("vnet-echo-conn".to_string())
                    .spawn(move || echo(&sockets, conn));
                if let Err(e) = spawned {
                    tracing::warn!("failed to spawn echo thread: {e}");
                }
            }
            let _ = sockets.close(listener);
        })
        .context("failed to spawn echo thread")?;
    Ok(bound)
}

fn echo(sockets: &SocketLayer, conn: vnet_core::Handle) {
    loop {
        let data = match sockets.recv(conn, ECHO_CHUNK, MsgFlags::empty()) {
            Ok(data) if data.is_empty() => break,
            Ok(data) => data,
            Err(e) => {
                tracing::debug!("echo recv ended: {e}");
                break;
            }
        };
        let mut sent = 0;
        while sent < data.len() {
            match sockets.send(conn, &data[sent..], MsgFlags::empty()) {
                Ok(n) => sent += n,
                Err(e) => {
                    tracing::debug!("echo send failed: {e}");
                    let _ = sockets.close(conn);
                    return;
                }
            }
        }
    }
    let _ = sockets.close(conn);
}
