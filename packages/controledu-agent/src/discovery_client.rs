//! UDP discovery probe (C5), student side.
//!
//! Sends `DISCOVER_CONTROLEDU` in two bursts 120ms apart, to the global
//! broadcast address, the computed broadcast address of this host's
//! primary interface, and the discovery multicast group; collects
//! replies for `PROBE_TIMEOUT_MS` and ranks them (§4.4).
//!
//! True per-interface enumeration needs a platform network-interface
//! crate this workspace doesn't otherwise depend on; instead the probe
//! learns its one primary local address the same way the hub's
//! responder learns its reply address — a UDP "connect" toward a
//! well-known external host, which never sends a packet but makes the
//! kernel pick a route — and derives that interface's `/24` broadcast
//! address from it. This covers the single-NIC classroom LAN the spec
//! targets; multi-homed hosts may miss a secondary segment.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use controledu_core::discovery::{
    parse_reply, rank_candidates, DiscoveryCandidate, DiscoveryReply, DISCOVERY_MULTICAST_GROUP, DISCOVERY_PORT,
    DISCOVER_REQUEST, PROBE_BURST_GAP_MS, PROBE_TIMEOUT_MS,
};

/// Run one full discovery probe: two broadcast/multicast bursts, then
/// collect and rank replies for the remainder of the timeout budget.
pub async fn probe() -> std::io::Result<Vec<DiscoveryCandidate>> {
    let socket = bind_ephemeral()?;
    socket.set_broadcast(true)?;

    let destinations = broadcast_destinations();

    send_burst(&socket, &destinations).await;
    tokio::time::sleep(Duration::from_millis(PROBE_BURST_GAP_MS)).await;
    send_burst(&socket, &destinations).await;

    let local_subnets = primary_interface_subnet().into_iter().collect::<Vec<_>>();

    let mut replies = Vec::new();
    let deadline = Duration::from_millis(PROBE_TIMEOUT_MS);
    let mut buf = [0u8; 512];
    let collect_until = tokio::time::Instant::now() + deadline;

    loop {
        let remaining = collect_until.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _from))) => {
                if let Ok(text) = std::str::from_utf8(&buf[..len]) {
                    if let Some(reply) = parse_reply(text) {
                        replies.push(reply);
                    }
                }
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "discovery recv error");
                break;
            }
            Err(_) => break,
        }
    }

    dedupe_replies(&mut replies);
    Ok(rank_candidates(&replies, &local_subnets))
}

async fn send_burst(socket: &UdpSocket, destinations: &[SocketAddr]) {
    for dest in destinations {
        if let Err(err) = socket.send_to(DISCOVER_REQUEST, dest).await {
            tracing::debug!(error = %err, dest = %dest, "discovery probe send failed");
        }
    }
}

fn broadcast_destinations() -> Vec<SocketAddr> {
    let mut destinations = vec![
        SocketAddr::from((Ipv4Addr::BROADCAST, DISCOVERY_PORT)),
        SocketAddr::from((DISCOVERY_MULTICAST_GROUP, DISCOVERY_PORT)),
    ];
    if let Some((local, mask)) = primary_interface_subnet() {
        destinations.push(SocketAddr::from((directed_broadcast(local, mask), DISCOVERY_PORT)));
    }
    destinations
}

fn directed_broadcast(local: Ipv4Addr, mask: Ipv4Addr) -> Ipv4Addr {
    let host_bits = !u32::from(mask);
    Ipv4Addr::from(u32::from(local) | host_bits)
}

/// Learn this host's primary IPv4 address and assume a `/24` mask,
/// since the workspace has no interface-enumeration dependency to read
/// the real one.
fn primary_interface_subnet() -> Option<(Ipv4Addr, Ipv4Addr)> {
    let probe = std::net::UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    probe.connect(("8.8.8.8", 80)).ok()?;
    match probe.local_addr().ok()?.ip() {
        std::net::IpAddr::V4(v4) if !v4.is_unspecified() => Some((v4, Ipv4Addr::new(255, 255, 255, 0))),
        _ => None,
    }
}

fn bind_ephemeral() -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    let addr: SocketAddr = ([0, 0, 0, 0], 0).into();
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

fn dedupe_replies(replies: &mut Vec<DiscoveryReply>) {
    let mut seen = std::collections::HashSet::new();
    replies.retain(|reply| seen.insert((reply.server_id.clone(), reply.host.clone())));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directed_broadcast_slash_24() {
        let local = Ipv4Addr::new(192, 168, 1, 37);
        let mask = Ipv4Addr::new(255, 255, 255, 0);
        assert_eq!(directed_broadcast(local, mask), Ipv4Addr::new(192, 168, 1, 255));
    }

    #[test]
    fn test_dedupe_replies_keeps_first_per_server_host_pair() {
        let mut replies = vec![
            DiscoveryReply {
                host: "192.168.1.5".into(),
                port: 40556,
                server_id: "srv-1".into(),
                server_name: "Room".into(),
            },
            DiscoveryReply {
                host: "192.168.1.5".into(),
                port: 40556,
                server_id: "srv-1".into(),
                server_name: "Room".into(),
            },
        ];
        dedupe_replies(&mut replies);
        assert_eq!(replies.len(), 1);
    }
}
