//! UDP discovery responder (C5), hub side.
//!
//! Listens on [`controledu_core::discovery::DISCOVERY_PORT`] for
//! broadcast/multicast probes and answers with this server's identity.
//! Joining the multicast group is best-effort: segments that filter
//! broadcast still reach the responder this way.

use std::net::{Ipv4Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use controledu_core::discovery::{
    format_reply, DISCOVERY_MULTICAST_GROUP, DISCOVERY_PORT, DISCOVER_REQUEST,
};

/// Bind the discovery socket, join the multicast group, and answer
/// probes until the process exits. Runs for the lifetime of the hub.
pub async fn run(hub_port: u16, server_id: String, server_name: String) -> std::io::Result<()> {
    let socket = bind_reusable(DISCOVERY_PORT)?;
    socket.set_broadcast(true)?;
    if let Err(err) = socket.join_multicast_v4(DISCOVERY_MULTICAST_GROUP, Ipv4Addr::UNSPECIFIED) {
        tracing::warn!(error = %err, "failed to join discovery multicast group, broadcast-only");
    }

    tracing::info!(port = DISCOVERY_PORT, "discovery responder listening");

    let mut buf = [0u8; 512];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(error = %err, "discovery recv error");
                continue;
            }
        };

        if &buf[..len] != DISCOVER_REQUEST {
            continue;
        }

        let local_host = preferred_local_interface(from).unwrap_or_else(|| from.ip().to_string());
        let reply = format_reply(&local_host, hub_port, &server_id, &server_name);
        if let Err(err) = socket.send_to(reply.as_bytes(), from).await {
            tracing::warn!(error = %err, peer = %from, "discovery reply send failed");
        }
    }
}

/// Learn which of our local interface addresses the probing `peer` would
/// reach us on, by UDP-"connect"ing an ephemeral socket toward it and
/// reading back the local address the kernel would route through (no
/// packet is actually sent; UDP connect just binds the route). Falls
/// back to the caller using `from.ip()` directly when this fails (e.g.
/// sandboxed network namespaces without a real route table).
fn preferred_local_interface(peer: SocketAddr) -> Option<String> {
    let probe = std::net::UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    probe.connect(peer).ok()?;
    let local = probe.local_addr().ok()?;
    let ip = local.ip();
    if ip.is_unspecified() {
        return None;
    }
    Some(ip.to_string())
}

/// `SO_REUSEADDR` bound UDP socket on `0.0.0.0:port`, handed off to tokio.
fn bind_reusable(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    let addr: std::net::SocketAddr = ([0, 0, 0, 0], port).into();
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}
