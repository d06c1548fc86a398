//! Destination filter: only globally routable unicast IPv4 targets may be
//! dialed.
//!
//! Every synthesized target passes through [`classify`] before the relay
//! opens an outbound connection. Without it, a crafted IPv6 destination
//! could make the relay reach loopback or internal services on the relay
//! host's network.

use ipnet::Ipv4Net;
use std::fmt;
use std::net::Ipv4Addr;

/// Why a destination was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DenyReason {
    /// `0.0.0.0/8`, "this network".
    Unspecified,
    /// RFC 1918 space.
    Private,
    /// `127.0.0.0/8`.
    Loopback,
    /// `169.254.0.0/16`.
    LinkLocal,
    /// `100.64.0.0/10`, carrier-grade NAT (RFC 6598).
    SharedAddressSpace,
    /// `192.0.0.0/24`, IETF protocol assignments.
    ProtocolAssignment,
    /// TEST-NET-1/2/3.
    Documentation,
    /// `198.18.0.0/15`.
    Benchmarking,
    /// `224.0.0.0/4`.
    Multicast,
    /// `240.0.0.0/4`.
    Reserved,
    /// `255.255.255.255`.
    Broadcast,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::Unspecified => "unspecified",
            DenyReason::Private => "private",
            DenyReason::Loopback => "loopback",
            DenyReason::LinkLocal => "link-local",
            DenyReason::SharedAddressSpace => "shared address space",
            DenyReason::ProtocolAssignment => "protocol assignment",
            DenyReason::Documentation => "documentation",
            DenyReason::Benchmarking => "benchmarking",
            DenyReason::Multicast => "multicast",
            DenyReason::Reserved => "reserved",
            DenyReason::Broadcast => "broadcast",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Denied(DenyReason),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed)
    }
}

/// Shorthand for a denied-table entry.
const fn net(a: u8, b: u8, c: u8, d: u8, prefix_len: u8) -> Ipv4Net {
    Ipv4Net::new_assert(Ipv4Addr::new(a, b, c, d), prefix_len)
}

/// Denied networks, most specific first where they overlap.
const DENIED: &[(Ipv4Net, DenyReason)] = &[
    (net(255, 255, 255, 255, 32), DenyReason::Broadcast),
    (net(0, 0, 0, 0, 8), DenyReason::Unspecified),
    (net(10, 0, 0, 0, 8), DenyReason::Private),
    (net(100, 64, 0, 0, 10), DenyReason::SharedAddressSpace),
    (net(127, 0, 0, 0, 8), DenyReason::Loopback),
    (net(169, 254, 0, 0, 16), DenyReason::LinkLocal),
    (net(172, 16, 0, 0, 12), DenyReason::Private),
    (net(192, 0, 0, 0, 24), DenyReason::ProtocolAssignment),
    (net(192, 0, 2, 0, 24), DenyReason::Documentation),
    (net(192, 168, 0, 0, 16), DenyReason::Private),
    (net(198, 18, 0, 0, 15), DenyReason::Benchmarking),
    (net(198, 51, 100, 0, 24), DenyReason::Documentation),
    (net(203, 0, 113, 0, 24), DenyReason::Documentation),
    (net(224, 0, 0, 0, 4), DenyReason::Multicast),
    (net(240, 0, 0, 0, 4), DenyReason::Reserved),
];

/// Anycast services inside `192.0.0.0/24` that are globally reachable
/// (PCP and TURN anycast, RFC 7723 / RFC 8155).
const GLOBAL_EXCEPTIONS: &[Ipv4Addr] = &[Ipv4Addr::new(192, 0, 0, 9), Ipv4Addr::new(192, 0, 0, 10)];

/// Classify a candidate target.
pub fn classify(addr: Ipv4Addr) -> Verdict {
    if GLOBAL_EXCEPTIONS.contains(&addr) {
        return Verdict::Allowed;
    }

    DENIED
        .iter()
        .find(|(network, _)| network.contains(&addr))
        .map_or(Verdict::Allowed, |&(_, reason)| Verdict::Denied(reason))
}

/// Shorthand for `classify(addr).is_allowed()`.
pub fn is_allowed(addr: Ipv4Addr) -> bool {
    classify(addr).is_allowed()
}
