//! Flow data model: raw kernel flow events and container-attributed flows.
//!
//! A [`FlowEvent`] is the unit emitted by a flow source: one connection
//! tracking entry as the kernel sees it, with cumulative byte and packet
//! counters for the original and reply directions. An [`AttributedFlow`] is
//! the same flow after it has been tied to a container endpoint; its
//! counters are remapped into the container's perspective (sent/received)
//! based on the traffic [`Direction`].

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};

/// The kind of lifecycle transition a flow event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowEventKind {
    /// The kernel started tracking a new flow.
    New,
    /// Counters or protocol state changed on a tracked flow.
    Update,
    /// The kernel stopped tracking the flow.
    Destroy,
}

impl fmt::Display for FlowEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlowEventKind::New => "NEW",
            FlowEventKind::Update => "UPDATE",
            FlowEventKind::Destroy => "DESTROY",
        };
        f.write_str(s)
    }
}

/// Layer-4 protocol of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    /// Any other IP protocol, carrying the kernel protocol number.
    Other(u8),
}

impl Protocol {
    /// Maps an IP protocol number to a [`Protocol`].
    pub fn from_number(proto: u8) -> Self {
        match proto {
            6 => Protocol::Tcp,
            17 => Protocol::Udp,
            1 => Protocol::Icmp,
            other => Protocol::Other(other),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
            Protocol::Icmp => f.write_str("icmp"),
            Protocol::Other(proto) => write!(f, "{proto}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown protocol `{0}`")]
pub struct ParseProtocolError(String);

impl FromStr for Protocol {
    type Err = ParseProtocolError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "icmp" => Ok(Protocol::Icmp),
            other => other
                .parse::<u8>()
                .map(Protocol::Other)
                .map_err(|_| ParseProtocolError(s.to_owned())),
        }
    }
}

impl serde::Serialize for Protocol {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// TCP connection state as tracked by the kernel.
///
/// `LastAck` and `TimeWait` are kept distinct even though both describe a
/// closing connection; the kernel distinguishes them and so do we.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpState {
    SynSent,
    SynRecv,
    Established,
    FinWait,
    CloseWait,
    LastAck,
    TimeWait,
    Close,
}

impl TcpState {
    /// Maps the kernel's numeric TCP conntrack state to a [`TcpState`].
    ///
    /// Returns `None` for states we do not track (`NONE`, `SYN_SENT2`, `MAX`).
    pub fn from_kernel(state: u8) -> Option<Self> {
        match state {
            1 => Some(TcpState::SynSent),
            2 => Some(TcpState::SynRecv),
            3 => Some(TcpState::Established),
            4 => Some(TcpState::FinWait),
            5 => Some(TcpState::CloseWait),
            6 => Some(TcpState::LastAck),
            7 => Some(TcpState::TimeWait),
            8 => Some(TcpState::Close),
            _ => None,
        }
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynRecv => "SYN_RECV",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait => "FIN_WAIT",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::LastAck => "LAST_ACK",
            TcpState::TimeWait => "TIME_WAIT",
            TcpState::Close => "CLOSE",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown tcp state `{0}`")]
pub struct ParseTcpStateError(String);

impl FromStr for TcpState {
    type Err = ParseTcpStateError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "SYN_SENT" => Ok(TcpState::SynSent),
            "SYN_RECV" => Ok(TcpState::SynRecv),
            "ESTABLISHED" => Ok(TcpState::Established),
            "FIN_WAIT" => Ok(TcpState::FinWait),
            "CLOSE_WAIT" => Ok(TcpState::CloseWait),
            "LAST_ACK" => Ok(TcpState::LastAck),
            "TIME_WAIT" => Ok(TcpState::TimeWait),
            "CLOSE" => Ok(TcpState::Close),
            _ => Err(ParseTcpStateError(s.to_owned())),
        }
    }
}

impl serde::Serialize for TcpState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A raw connection-tracking event as emitted by a flow source.
///
/// Byte and packet counters are cumulative for the lifetime of the flow and
/// nondecreasing per flow identifier. `orig` is traffic in the direction the
/// flow was initiated; `reply` is the return direction.
#[derive(Debug, Clone)]
pub struct FlowEvent {
    /// Stable identifier assigned by the source, unique per tracked flow.
    pub id: String,
    pub kind: FlowEventKind,
    pub protocol: Protocol,
    pub src_ip: IpAddr,
    /// Source port; 0 for protocols without ports (icmp).
    pub src_port: u16,
    pub dst_ip: IpAddr,
    /// Destination port; 0 for protocols without ports (icmp).
    pub dst_port: u16,
    /// Present only for tcp flows.
    pub tcp_state: Option<TcpState>,
    pub bytes_orig: u64,
    pub bytes_reply: u64,
    pub packets_orig: u64,
    pub packets_reply: u64,
    /// Seconds until the kernel expires the flow.
    pub timeout_seconds: u32,
    pub observed_at: DateTime<Utc>,
}

/// Which endpoint of the flow belongs to the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// The container initiated the flow (source endpoint).
    Egress,
    /// The flow targets the container (destination endpoint).
    Ingress,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Egress => f.write_str("egress"),
            Direction::Ingress => f.write_str("ingress"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown direction `{0}`")]
pub struct ParseDirectionError(String);

impl FromStr for Direction {
    type Err = ParseDirectionError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "egress" => Ok(Direction::Egress),
            "ingress" => Ok(Direction::Ingress),
            _ => Err(ParseDirectionError(s.to_owned())),
        }
    }
}

impl serde::Serialize for Direction {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A flow tied to a container endpoint, counters remapped by direction.
///
/// For egress traffic the container sent the `orig` counters and received
/// the `reply` counters; for ingress it is the inverse.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AttributedFlow {
    pub id: String,
    pub container_name: String,
    pub container_ip: IpAddr,
    pub protocol: Protocol,
    pub source_ip: IpAddr,
    pub source_port: u16,
    pub dest_ip: IpAddr,
    pub dest_port: u16,
    pub tcp_state: Option<TcpState>,
    pub direction: Direction,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub timeout_seconds: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl AttributedFlow {
    /// Builds an attributed flow from a raw event and an attribution decision.
    ///
    /// `first_seen` and `last_seen` are both set to the event's observation
    /// time; the registry preserves the earlier `first_seen` across updates
    /// of the same flow identifier.
    pub fn from_event(
        event: &FlowEvent,
        container_name: String,
        container_ip: IpAddr,
        direction: Direction,
    ) -> Self {
        let (bytes_sent, bytes_received, packets_sent, packets_received) = match direction {
            Direction::Egress => (
                event.bytes_orig,
                event.bytes_reply,
                event.packets_orig,
                event.packets_reply,
            ),
            Direction::Ingress => (
                event.bytes_reply,
                event.bytes_orig,
                event.packets_reply,
                event.packets_orig,
            ),
        };

        Self {
            id: event.id.clone(),
            container_name,
            container_ip,
            protocol: event.protocol,
            source_ip: event.src_ip,
            source_port: event.src_port,
            dest_ip: event.dst_ip,
            dest_port: event.dst_port,
            tcp_state: event.tcp_state,
            direction,
            bytes_sent,
            bytes_received,
            packets_sent,
            packets_received,
            timeout_seconds: event.timeout_seconds,
            first_seen: event.observed_at,
            last_seen: event.observed_at,
        }
    }
}
