//! Per-client delivery transports.

use std::fmt;
use std::net::SocketAddr;
use std::ops::BitOr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::stream::Stream;

static TRANSPORT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Set of lower transport protocols a media may be delivered over
/// (RFC 2326 §12.39 `lower-transport`).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LowerTransport(u8);

impl LowerTransport {
    pub const NONE: Self = Self(0);
    /// Unicast RTP over UDP.
    pub const UDP: Self = Self(1 << 0);
    /// Multicast RTP over UDP.
    pub const UDP_MCAST: Self = Self(1 << 1);
    /// RTP interleaved on the RTSP TCP connection.
    pub const TCP: Self = Self(1 << 2);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl Default for LowerTransport {
    fn default() -> Self {
        Self::UDP | Self::TCP
    }
}

impl BitOr for LowerTransport {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for LowerTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (Self::UDP, "UDP"),
            (Self::UDP_MCAST, "UDP_MCAST"),
            (Self::TCP, "TCP"),
        ]
        .into_iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| name)
        .collect();
        if names.is_empty() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// Negotiated RTP/RTCP transport parameters for one client of one stream.
///
/// ```text
/// Client → Server:
///   Transport: RTP/AVP;unicast;client_port=8000-8001
///
/// Server → Client:
///   Transport: RTP/AVP;unicast;client_port=8000-8001;server_port=5000-5001
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transport {
    pub lower: LowerTransport,
    /// Client's RTP receive port.
    pub client_rtp_port: u16,
    /// Client's RTCP receive port (typically `client_rtp_port + 1`).
    pub client_rtcp_port: u16,
    pub server_rtp_port: u16,
    pub server_rtcp_port: u16,
    /// Full socket address for RTP delivery (`client_ip:client_rtp_port`).
    pub client_addr: SocketAddr,
}

impl Transport {
    /// Unicast UDP delivery to `client_addr`, whose port is the client RTP port.
    pub fn udp(client_addr: SocketAddr, server_ports: (u16, u16)) -> Self {
        let client_rtp_port = client_addr.port();
        Self {
            lower: LowerTransport::UDP,
            client_rtp_port,
            client_rtcp_port: client_rtp_port.saturating_add(1),
            server_rtp_port: server_ports.0,
            server_rtcp_port: server_ports.1,
            client_addr,
        }
    }
}

/// A [`Transport`] bound to the [`Stream`] it delivers.
///
/// A media activates these when clients start playing and deactivates them
/// when they pause or leave; only transitions are counted.
pub struct StreamTransport {
    id: u64,
    stream: Arc<Stream>,
    transport: Transport,
    active: AtomicBool,
}

impl StreamTransport {
    pub fn new(stream: Arc<Stream>, transport: Transport) -> Arc<Self> {
        Arc::new(Self {
            id: TRANSPORT_COUNTER.fetch_add(1, Ordering::Relaxed),
            stream,
            transport,
            active: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stream(&self) -> &Arc<Stream> {
        &self.stream
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Activate or deactivate delivery. Returns `true` only when the state
    /// actually changed; the stream's transport list is updated accordingly.
    pub fn set_active(&self, active: bool) -> bool {
        if self.active.swap(active, Ordering::AcqRel) == active {
            return false;
        }
        if active {
            self.stream.add_transport(self.id, self.transport.clone());
        } else {
            self.stream.remove_transport(self.id);
        }
        tracing::debug!(
            transport = self.id,
            stream = self.stream.index(),
            client = %self.transport.client_addr,
            active,
            "transport state changed"
        );
        true
    }
}

impl fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamTransport")
            .field("id", &self.id)
            .field("stream", &self.stream.index())
            .field("transport", &self.transport)
            .field("active", &self.is_active())
            .finish()
    }
}
