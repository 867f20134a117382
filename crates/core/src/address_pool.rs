//! Server-side port allocation for stream delivery.
//!
//! A media only forwards its pool to every [`Stream`](crate::Stream) it owns;
//! streams ask the pool for a port pair when a client transport is set up.
//! Per RFC 3550 §11, RTP ports are even and RTCP = RTP + 1.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Lowest RTP port handed out by [`PortRangePool::new`].
pub const SERVER_PORT_MIN: u16 = 5000;
/// Highest RTP port handed out by [`PortRangePool::new`].
pub const SERVER_PORT_MAX: u16 = 65534;

/// Source of server (RTP, RTCP) port pairs.
pub trait AddressPool: Send + Sync + fmt::Debug {
    /// Hand out the next port pair, or `None` when the pool is empty.
    fn acquire_ports(&self) -> Option<(u16, u16)>;
}

/// Port pairs from a monotonic counter over a fixed range.
///
/// When the range is exhausted the counter wraps back to the start, so
/// pairs are reused rather than refused.
#[derive(Debug)]
pub struct PortRangePool {
    min: u16,
    max: u16,
    next: AtomicU32,
}

impl PortRangePool {
    /// A pool over `5000..=65534`.
    pub fn new() -> Self {
        Self::with_range(SERVER_PORT_MIN, SERVER_PORT_MAX)
    }

    /// A pool over `min..=max`. `min` is rounded up to the next even port.
    pub fn with_range(min: u16, max: u16) -> Self {
        let min = min.saturating_add(min % 2);
        Self {
            min,
            max: max.max(min),
            next: AtomicU32::new(u32::from(min)),
        }
    }
}

impl Default for PortRangePool {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressPool for PortRangePool {
    fn acquire_ports(&self) -> Option<(u16, u16)> {
        let min = u32::from(self.min);
        let max = u32::from(self.max);
        let next = self
            .next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |rtp| {
                let rtp = if rtp > max { min } else { rtp };
                Some(rtp + 2)
            })
            .ok()?;

        let rtp = if next > max {
            tracing::warn!(rtp = next, min, "port range exhausted, wrapping");
            min
        } else {
            next
        };

        let rtp = u16::try_from(rtp).ok()?;
        let rtcp = rtp.checked_add(1)?;
        tracing::trace!(rtp_port = rtp, rtcp_port = rtcp, "allocated server ports");
        Some((rtp, rtcp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_are_even_pairs() {
        let pool = PortRangePool::new();
        assert_eq!(pool.acquire_ports(), Some((5000, 5001)));
        assert_eq!(pool.acquire_ports(), Some((5002, 5003)));
    }

    #[test]
    fn odd_minimum_is_rounded_up() {
        let pool = PortRangePool::with_range(6001, 6010);
        assert_eq!(pool.acquire_ports(), Some((6002, 6003)));
    }

    #[test]
    fn exhausted_range_wraps() {
        let pool = PortRangePool::with_range(6000, 6002);
        assert_eq!(pool.acquire_ports(), Some((6000, 6001)));
        assert_eq!(pool.acquire_ports(), Some((6002, 6003)));
        assert_eq!(pool.acquire_ports(), Some((6000, 6001)));
    }

    #[test]
    fn top_of_port_space() {
        let pool = PortRangePool::with_range(65534, 65534);
        assert_eq!(pool.acquire_ports(), Some((65534, 65535)));
        assert_eq!(pool.acquire_ports(), Some((65534, 65535)));
    }
}
