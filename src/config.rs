use anyhow::bail;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

/// Fragment payload carried by a single PSH packet: a 1090-byte packet MTU
///  minus 14 bytes of framing headroom (integrity prefix, packet header and
///  the PSH fields).
pub const MAX_PACKET_PAYLOAD: usize = 1076;

/// Default number of fragments emitted per pacing burst.
pub const PARALLEL_COUNT: u16 = 92;

/// Scheduling grace before the receiver reacts to a fragment - gives normal
///  out-of-order arrival a chance before a hole is treated as loss.
pub const LATENCY: Duration = Duration::from_millis(35);

/// Largest single transfer. Fragment sequence numbers are 15-bit (the top bit
///  of a u16 is the run marker of the request codec), so a transfer can carry
///  at most 2^15 fragments.
pub const MAX_BUFFER_SIZE: usize = 32768 * MAX_PACKET_PAYLOAD;

/// Configuration of an endpoint. `default_ipv4` / `default_ipv6` give the
///  stock values; construct the struct directly to deviate.
pub struct FlowConfig {
    /// Local address the UDP socket binds to.
    pub bind_addr: SocketAddr,

    /// Destination used by `send` when the caller passes no peer.
    pub default_peer: Option<SocketAddr>,

    /// Number of fragments in flight per pacing burst. This value is also
    ///  carried in every PSH packet as a window hint, bounding how many holes
    ///  the receiver requests per REQ.
    pub parallel_count: u16,

    /// Estimated outgoing bandwidth in bytes per second. This is a static
    ///  pacing input, not a congestion-control signal: the pacing interval is
    ///  chosen so that bursts of `parallel_count` fragments average out to
    ///  roughly this rate.
    pub bandwidth: u64,

    /// Base round-trip estimate towards peers. The protocol works with the
    ///  effective RTT of `rtt + LATENCY` everywhere.
    pub rtt: Duration,

    /// How often the session tables are swept for idle entries.
    pub sweep_interval: Duration,

    /// Idle time after which a session is garbage-collected by the sweep.
    pub session_ttl: Duration,

    /// Grace period after delivery before a receiving session's transfer id
    ///  may be recycled for a fresh transfer from the same peer.
    pub delivered_recycle_after: Duration,

    /// Period of the FIN retry loop for completed transfers whose FIN has not
    ///  been acknowledged yet.
    pub finish_notify_period: Duration,

    /// How many times an unacknowledged FIN is retried before the completed
    ///  entry is given up on.
    pub finish_notify_limit: u32,

    /// How many hole-scan rounds without progress the receiver tolerates
    ///  before abandoning a partial transfer.
    pub hole_scan_retry_limit: u32,

    /// How many escalating silent waits the sender tolerates before declaring
    ///  a transfer timed out.
    pub stall_rounds: u32,
}

impl FlowConfig {
    pub fn default_ipv4(port: u16) -> FlowConfig {
        Self::defaults(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
    }

    pub fn default_ipv6(port: u16) -> FlowConfig {
        Self::defaults(SocketAddr::from((Ipv6Addr::LOCALHOST, port)))
    }

    fn defaults(bind_addr: SocketAddr) -> FlowConfig {
        FlowConfig {
            bind_addr,
            default_peer: None,
            parallel_count: PARALLEL_COUNT,
            bandwidth: 4 * 1024 * 1024,
            rtt: Duration::from_millis(200),
            sweep_interval: Duration::from_secs(30),
            session_ttl: Duration::from_secs(60 * 60),
            delivered_recycle_after: Duration::from_secs(30 * 60),
            finish_notify_period: Duration::from_secs(1),
            finish_notify_limit: 10,
            hole_scan_retry_limit: 10,
            stall_rounds: 3,
        }
    }

    /// Default peer for a caller-supplied port: unspecified addresses fall
    ///  back to the loopback address of the respective family.
    pub fn loopback_peer_v4(port: u16) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, port))
    }

    pub fn loopback_peer_v6(port: u16) -> SocketAddr {
        SocketAddr::from((Ipv6Addr::LOCALHOST, port))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.parallel_count == 0 {
            bail!("parallel_count must be at least 1");
        }
        if self.bandwidth == 0 {
            bail!("bandwidth must be non-zero");
        }
        if self.finish_notify_period.is_zero() || self.sweep_interval.is_zero() {
            bail!("periodic intervals must be non-zero");
        }
        Ok(())
    }

    /// The round-trip estimate the protocol actually schedules against.
    pub fn effective_rtt(&self) -> Duration {
        self.rtt + LATENCY
    }

    /// Bytes emitted per burst.
    pub fn parallel_size(&self) -> u64 {
        self.parallel_count as u64 * MAX_PACKET_PAYLOAD as u64
    }

    /// Pacing interval between bursts, derived from the bandwidth estimate.
    ///
    /// NB: a bandwidth at or below the burst size makes the divisor zero or
    ///  negative; that case deliberately falls through to the 1-second clamp
    ///  instead of being rejected.
    pub fn pacing_interval(&self) -> Duration {
        let parallel_size = self.parallel_size() as f64;
        let interval_ms = 1000.0 * parallel_size / (self.bandwidth as f64 - parallel_size);
        if !interval_ms.is_finite() || interval_ms <= 0.0 {
            return Duration::from_millis(1000);
        }
        Duration::from_secs_f64(interval_ms / 1000.0).max(Duration::from_millis(1))
    }

    /// Number of bursts that fit into one effective RTT - the multiplier for
    ///  the opening window. A tuning knob, never a correctness input.
    pub fn burst_frequency(&self) -> u32 {
        let interval = self.pacing_interval().as_secs_f64();
        let rtt = self.effective_rtt().as_secs_f64();
        ((rtt / interval).floor() as u32).max(1)
    }
}
