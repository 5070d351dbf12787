//! # Discovery (C5) — shared wire format and scoring
//!
//! The UDP responder (hub) and the probe client (agent) live in their
//! respective binaries since they own actual sockets; this module holds
//! the parts that must agree byte-for-byte on both ends: the magic
//! request/response strings, the well-known ports, and the candidate
//! scoring function used to rank replies.

use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

/// UDP port the teacher hub's discovery responder listens on.
pub const DISCOVERY_PORT: u16 = 40555;
/// TCP port serving the teacher HTTP API and both hubs.
pub const HUB_PORT: u16 = 40556;
/// TCP port serving the student agent's loopback-only local HTTP API.
pub const STUDENT_LOCAL_PORT: u16 = 40557;
/// Multicast group the responder may additionally join to tolerate
/// broadcast-filtered network segments.
pub const DISCOVERY_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 77, 55);

/// Exact byte sequence a probe sends to request discovery.
pub const DISCOVER_REQUEST: &[u8] = b"DISCOVER_CONTROLEDU";
/// ASCII prefix of a responder's reply.
pub const DISCOVER_REPLY_PREFIX: &str = "CONTROLEDU_HERE";

/// Default time budget for a discovery probe to collect replies.
pub const PROBE_TIMEOUT_MS: u64 = 1500;
/// Gap between the two broadcast/multicast bursts a probe sends.
pub const PROBE_BURST_GAP_MS: u64 = 120;

/// One parsed discovery reply, before scoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryReply {
    pub host: String,
    pub port: u16,
    pub server_id: String,
    pub server_name: String,
}

/// A scored, deduplicated discovery candidate ready to present to the
/// user (or auto-select, if there is exactly one).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryCandidate {
    pub reply: DiscoveryReply,
    pub score: i32,
}

/// Parse `CONTROLEDU_HERE <host>:<port> <serverId> <serverName>`.
///
/// Tolerant of extra whitespace in `serverName`: the payload is split
/// into at most 4 whitespace-separated tokens, so the name may itself
/// contain spaces.
pub fn parse_reply(payload: &str) -> Option<DiscoveryReply> {
    let tokens: Vec<&str> = payload.trim().splitn(4, char::is_whitespace).collect();
    if tokens.len() != 4 || tokens[0] != DISCOVER_REPLY_PREFIX {
        return None;
    }
    let (host, port_str) = tokens[1].rsplit_once(':')?;
    let port: u16 = port_str.parse().ok()?;
    Some(DiscoveryReply {
        host: host.to_string(),
        port,
        server_id: tokens[2].to_string(),
        server_name: tokens[3].to_string(),
    })
}

/// Render a reply into the wire payload a responder sends back.
pub fn format_reply(host: &str, port: u16, server_id: &str, server_name: &str) -> String {
    format!("{DISCOVER_REPLY_PREFIX} {host}:{port} {server_id} {server_name}")
}

/// Score one candidate reply against the probing host's local interfaces.
///
/// +220 same IPv4 subnet as any local interface, +80 RFC-1918 private,
/// +20 not link-local (else −40), −100 loopback, −10 unparseable host.
pub fn score_candidate(host: &str, local_ipv4_subnets: &[(Ipv4Addr, Ipv4Addr)]) -> i32 {
    let Ok(addr) = host.parse::<IpAddr>() else {
        return -10;
    };

    let IpAddr::V4(v4) = addr else {
        return -10;
    };

    if v4.is_loopback() {
        return -100;
    }

    let mut score = 0;

    if local_ipv4_subnets
        .iter()
        .any(|(local, mask)| same_subnet(v4, *local, *mask))
    {
        score += 220;
    }

    if is_private_rfc1918(v4) {
        score += 80;
    }

    if v4.is_link_local() {
        score -= 40;
    } else {
        score += 20;
    }

    score
}

fn same_subnet(a: Ipv4Addr, b: Ipv4Addr, mask: Ipv4Addr) -> bool {
    let a = u32::from(a);
    let b = u32::from(b);
    let m = u32::from(mask);
    (a & m) == (b & m)
}

fn is_private_rfc1918(addr: Ipv4Addr) -> bool {
    let octets = addr.octets();
    match octets[0] {
        10 => true,
        172 => (16..=31).contains(&octets[1]),
        192 => octets[1] == 168,
        _ => false,
    }
}

/// Rank and deduplicate replies to one candidate per `server_id`, keeping
/// the highest-scoring reply for each; ties broken lexicographically on
/// host. Final list sorted by score (desc) then server_name.
pub fn rank_candidates(
    replies: &[DiscoveryReply],
    local_ipv4_subnets: &[(Ipv4Addr, Ipv4Addr)],
) -> Vec<DiscoveryCandidate> {
    use std::collections::HashMap;

    let mut best: HashMap<&str, DiscoveryCandidate> = HashMap::new();
    for reply in replies {
        let score = score_candidate(&reply.host, local_ipv4_subnets);
        let candidate = DiscoveryCandidate {
            reply: reply.clone(),
            score,
        };
        best.entry(reply.server_id.as_str())
            .and_modify(|existing| {
                if score > existing.score
                    || (score == existing.score && reply.host < existing.reply.host)
                {
                    *existing = candidate.clone();
                }
            })
            .or_insert(candidate);
    }

    let mut out: Vec<DiscoveryCandidate> = best.into_values().collect();
    out.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| a.reply.server_name.cmp(&b.reply.server_name))
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reply_basic() {
        let reply = parse_reply("CONTROLEDU_HERE 192.168.1.5:40556 srv-1 Room 204").unwrap();
        assert_eq!(reply.host, "192.168.1.5");
        assert_eq!(reply.port, 40556);
        assert_eq!(reply.server_id, "srv-1");
        assert_eq!(reply.server_name, "Room 204");
    }

    #[test]
    fn test_parse_reply_tolerates_extra_whitespace_in_name() {
        let reply = parse_reply("CONTROLEDU_HERE  10.0.0.2:40556   srv-2   Room   5B  ").unwrap();
        assert_eq!(reply.server_name, "Room   5B  ");
    }

    #[test]
    fn test_parse_reply_rejects_wrong_prefix() {
        assert!(parse_reply("SOMETHING_ELSE 1.2.3.4:1 a b").is_none());
    }

    #[test]
    fn test_round_trip_format_and_parse() {
        let payload = format_reply("10.0.0.2", 40556, "srv-9", "Lab 3");
        let reply = parse_reply(&payload).unwrap();
        assert_eq!(reply.host, "10.0.0.2");
        assert_eq!(reply.port, 40556);
        assert_eq!(reply.server_id, "srv-9");
        assert_eq!(reply.server_name, "Lab 3");
    }

    #[test]
    fn test_score_loopback_is_penalized() {
        assert_eq!(score_candidate("127.0.0.1", &[]), -100);
    }

    #[test]
    fn test_score_unparseable_host() {
        assert_eq!(score_candidate("not-an-ip", &[]), -10);
    }

    #[test]
    fn test_score_same_subnet_and_private() {
        let subnets = [(Ipv4Addr::new(192, 168, 1, 10), Ipv4Addr::new(255, 255, 255, 0))];
        let score = score_candidate("192.168.1.20", &subnets);
        // +220 same subnet, +80 private, +20 not link-local
        assert_eq!(score, 320);
    }

    #[test]
    fn test_score_link_local_penalized() {
        assert_eq!(score_candidate("169.254.1.1", &[]), -40);
    }

    #[test]
    fn test_score_public_address() {
        assert_eq!(score_candidate("8.8.8.8", &[]), 20);
    }

    #[test]
    fn test_rank_candidates_dedupes_and_sorts() {
        let subnets = [(Ipv4Addr::new(192, 168, 1, 10), Ipv4Addr::new(255, 255, 255, 0))];
        let replies = vec![
            DiscoveryReply {
                host: "8.8.8.8".into(),
                port: 40556,
                server_id: "srv-1".into(),
                server_name: "Room B".into(),
            },
            DiscoveryReply {
                host: "192.168.1.50".into(),
                port: 40556,
                server_id: "srv-1".into(),
                server_name: "Room B".into(),
            },
            DiscoveryReply {
                host: "192.168.1.51".into(),
                port: 40556,
                server_id: "srv-2".into(),
                server_name: "Room A".into(),
            },
        ];
        let ranked = rank_candidates(&replies, &subnets);
        // srv-1 should keep only its best (same-subnet) reply.
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].reply.server_name, "Room A");
        assert_eq!(ranked[1].reply.host, "192.168.1.50");
    }
}
