//! Static configuration.
//!
//! Compile-time table capacities live here as constants; everything that is
//! a tunable number rather than a capacity is a field of [`StackConfig`],
//! which the embedder composes once and hands to the stack at construction.

use crate::time::Duration;

/// Maximum number of interfaces the stack will accept.
pub const MAX_IFACE_COUNT: usize = 4;

/// Maximum number of concurrent reassembly entries.
pub const MAX_REASS_ENTRIES: usize = 4;

/// Maximum size of a reassembled datagram payload.
pub const MAX_REASS_SIZE: usize = 65515;

/// Maximum number of holes tracked per reassembly or receive window.
pub const ASSEMBLER_MAX_RANGES: usize = 8;

/// Maximum number of path-MTU cache entries.
pub const MAX_PMTU_ENTRIES: usize = 16;

/// Maximum number of per-interface protocol listeners.
pub const IFACE_MAX_LISTENER_COUNT: usize = 2;

/// Maximum number of TCP listeners.
pub const MAX_LISTENER_COUNT: usize = 8;

/// Smallest MTU the stack will operate with, and the floor for any
/// path-MTU estimate.
pub const MIN_MTU: u16 = 256;

/// Runtime configuration record.
///
/// All durations are on the monotonic clock of the embedding event loop.
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Bytes reserved in front of the IP header in every buffer handed to
    /// the driver (Ethernet framing by default).
    pub header_before_ip: usize,
    /// TTL used for ICMP messages originated by the stack.
    pub icmp_ttl: u8,
    /// Whether Echo Requests addressed to a broadcast address are answered.
    pub allow_broadcast_ping: bool,
    /// Upper bound applied to path-MTU estimates learned from ICMP.
    pub max_pmtu_estimate: u16,
    /// How long a path-MTU estimate stays fresh.
    pub pmtu_timeout: Duration,
    /// How long an incomplete reassembly entry is kept.
    pub reass_timeout: Duration,

    /// Number of ephemeral ports available to `connect`.
    pub tcp_num_ephemeral_ports: u16,
    /// Maximum number of live PCBs.
    pub tcp_max_pcbs: usize,
    /// Lower clamp for the retransmission timeout.
    pub tcp_min_rtx_time: Duration,
    /// Upper clamp for the retransmission timeout.
    pub tcp_max_rtx_time: Duration,
    /// Retransmission timeout before any RTT measurement exists.
    pub tcp_initial_rtx_time: Duration,
    /// Retransmission timeout for SYN and SYN-ACK segments.
    pub tcp_syn_rtx_time: Duration,
    /// SYN retransmissions before the connection attempt is abandoned.
    pub tcp_max_syn_rtx: u8,
    /// Data retransmissions before the connection is aborted.
    pub tcp_max_rtx: u8,
    /// How long a PCB may linger in FIN_WAIT_2.
    pub tcp_fin_wait2_time: Duration,
    /// The 2MSL TIME_WAIT hold time.
    pub tcp_time_wait_time: Duration,
    /// Delay applied by the short output timer.
    pub tcp_output_timer_ticks: Duration,
    /// Output retry delay after the driver reported a full queue.
    pub tcp_output_retry_full_ticks: Duration,
    /// Output retry delay after any other retriable driver failure.
    pub tcp_output_retry_other_ticks: Duration,
}

impl Default for StackConfig {
    fn default() -> StackConfig {
        StackConfig {
            header_before_ip: 14,
            icmp_ttl: 64,
            allow_broadcast_ping: false,
            max_pmtu_estimate: 65535,
            pmtu_timeout: Duration::from_secs(600),
            reass_timeout: Duration::from_secs(10),

            tcp_num_ephemeral_ports: 4096,
            tcp_max_pcbs: 64,
            tcp_min_rtx_time: Duration::from_millis(250),
            tcp_max_rtx_time: Duration::from_secs(60),
            tcp_initial_rtx_time: Duration::from_secs(1),
            tcp_syn_rtx_time: Duration::from_secs(1),
            tcp_max_syn_rtx: 5,
            tcp_max_rtx: 10,
            tcp_fin_wait2_time: Duration::from_secs(60),
            tcp_time_wait_time: Duration::from_secs(120),
            tcp_output_timer_ticks: Duration::from_millis(2),
            tcp_output_retry_full_ticks: Duration::from_millis(40),
            tcp_output_retry_other_ticks: Duration::from_millis(200),
        }
    }
}
