use core::fmt;

use crate::event::TimerToken;
use crate::storage::{Assembler, RingBuffer};
use crate::time::{Duration, Instant};
use crate::wire::{Ipv4Address, TcpSeqNumber};

use super::ListenerId;

/// The connection state, per RFC 793.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl State {
    /// Whether the handshake has completed.
    pub fn is_synchronized(&self) -> bool {
        !matches!(self, State::Closed | State::Listen | State::SynSent)
    }

    /// Whether segments with data or FIN may still be emitted.
    pub fn can_output(&self) -> bool {
        matches!(
            self,
            State::Established
                | State::CloseWait
                | State::FinWait1
                | State::Closing
                | State::LastAck
        )
    }

    /// Whether the peer may still deliver data to us.
    pub fn can_receive(&self) -> bool {
        matches!(self, State::Established | State::FinWait1 | State::FinWait2)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// PCB bit flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PcbFlags(u16);

impl PcbFlags {
    /// A FIN has been transmitted at least once.
    pub const FIN_SENT: u16 = 1 << 0;
    /// Close requested; a FIN still needs to go out.
    pub const FIN_PENDING: u16 = 1 << 1;
    /// An RTT sample is in flight.
    pub const RTT_PENDING: u16 = 1 << 2;
    /// `srtt`/`rttvar` hold at least one measurement.
    pub const RTT_VALID: u16 = 1 << 3;
    /// Input wants an ACK emitted.
    pub const ACK_PENDING: u16 = 1 << 4;
    /// The output timer is armed for a delayed send.
    pub const OUT_PENDING: u16 = 1 << 5;
    /// The output timer is armed for a driver retry.
    pub const OUT_RETRY: u16 = 1 << 6;
    /// The rtx timer is armed for retransmission or probing.
    pub const RTX_ACTIVE: u16 = 1 << 7;
    /// NewReno fast recovery is in progress.
    pub const RECOVER: u16 = 1 << 8;
    /// `cwnd` has been initialized for this connection.
    pub const CWND_INIT: u16 = 1 << 9;
    /// `cwnd` has grown since the last idle reset.
    pub const CWND_INCRD: u16 = 1 << 10;
    /// The rtx timer is armed as the idle timer.
    pub const IDLE_TIMER: u16 = 1 << 11;
    /// Window scaling was negotiated on the handshake.
    pub const WND_SCALE: u16 = 1 << 12;

    pub fn has(&self, flag: u16) -> bool {
        self.0 & flag != 0
    }

    pub fn set(&mut self, flag: u16) {
        self.0 |= flag;
    }

    pub fn clear(&mut self, flag: u16) {
        self.0 &= !flag;
    }
}

/// A protocol control block: the whole per-connection state.
///
/// Sequence-variable invariants (outside TIME_WAIT and CLOSED, under
/// modular comparison): `snd_una <= snd_nxt`, and `snd_nxt` never runs
/// past `snd_una + snd_buf.len()` plus one unit for a pending FIN.
/// `snd_cur`, the next-to-send cursor, is a byte offset from `snd_una`
/// into `snd_buf` and never exceeds its length.
#[derive(Debug)]
pub struct Pcb {
    pub state: State,
    pub local_addr: Ipv4Address,
    pub local_port: u16,
    pub remote_addr: Ipv4Address,
    pub remote_port: u16,

    // Sequence variables.
    pub snd_una: TcpSeqNumber,
    pub snd_nxt: TcpSeqNumber,
    pub snd_wnd: usize,
    pub snd_mss: u16,
    pub base_snd_mss: u16,
    pub rcv_nxt: TcpSeqNumber,
    /// The window edge last announced to the peer, in bytes beyond
    /// `rcv_nxt` (already scaled back up).
    pub rcv_ann_wnd: usize,
    pub rcv_wnd_shift: u8,
    pub snd_wnd_shift: u8,

    // Congestion control.
    pub cwnd: usize,
    pub ssthresh: usize,
    pub cwnd_acked: usize,
    pub recover: TcpSeqNumber,
    pub num_dupack: u8,
    pub rto: Duration,
    /// Smoothed RTT and its variance, in milliseconds.
    pub srtt: u32,
    pub rttvar: u32,
    pub rtt_test_seq: TcpSeqNumber,
    pub rtt_test_time: Instant,
    pub rtx_count: u8,

    // Buffers. `snd_buf` holds bytes from `snd_una` on; `snd_cur` is the
    // next-to-send offset into it. `rcv_buf` holds in-order received
    // bytes, with out-of-order ranges parked in its unallocated region
    // and tracked by `rcv_ranges` relative to `rcv_nxt`.
    pub snd_buf: RingBuffer<'static>,
    pub snd_cur: usize,
    /// Bytes before this send-buffer index are pushed: PSH is set and no
    /// output delay applies.
    pub snd_psh_index: usize,
    pub rcv_buf: RingBuffer<'static>,
    pub rcv_ranges: Assembler,
    /// The sequence number of a received FIN not yet consumed into
    /// `rcv_nxt`.
    pub rcv_fin_seq: Option<TcpSeqNumber>,

    pub flags: PcbFlags,
    /// The peer reset the connection or it was aborted locally.
    pub reset: bool,

    pub out_timer: TimerToken,
    pub rtx_timer: TimerToken,

    /// The listener this PCB counts against, until accepted.
    pub listener: Option<ListenerId>,
    /// A user handle is attached. When it goes away mid-close the PCB
    /// lingers in "no con" mode where at most a residual FIN is emitted.
    pub con_active: bool,
}

impl Pcb {
    /// A PCB at the start of its handshake, with buffers allocated and
    /// congestion variables at their initial values.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: State,
        local: (Ipv4Address, u16),
        remote: (Ipv4Address, u16),
        iss: TcpSeqNumber,
        rcv_nxt: TcpSeqNumber,
        snd_mss: u16,
        base_snd_mss: u16,
        snd_buf_size: usize,
        rcv_buf_size: usize,
        rto: Duration,
        out_timer: TimerToken,
        rtx_timer: TimerToken,
    ) -> Pcb {
        let mut flags = PcbFlags::default();
        flags.set(PcbFlags::CWND_INIT);
        Pcb {
            state,
            local_addr: local.0,
            local_port: local.1,
            remote_addr: remote.0,
            remote_port: remote.1,
            snd_una: iss,
            snd_nxt: iss,
            snd_wnd: 0,
            snd_mss,
            base_snd_mss,
            rcv_nxt,
            rcv_ann_wnd: 0,
            rcv_wnd_shift: 0,
            snd_wnd_shift: 0,
            cwnd: Pcb::initial_cwnd(snd_mss),
            ssthresh: super::MAX_ANN_WINDOW,
            cwnd_acked: 0,
            recover: iss,
            num_dupack: 0,
            rto,
            srtt: 0,
            rttvar: 0,
            rtt_test_seq: iss,
            rtt_test_time: Instant::ZERO,
            rtx_count: 0,
            snd_buf: RingBuffer::new(vec![0; snd_buf_size]),
            snd_cur: 0,
            snd_psh_index: 0,
            rcv_buf: RingBuffer::new(vec![0; rcv_buf_size]),
            rcv_ranges: Assembler::new(),
            rcv_fin_seq: None,
            flags,
            reset: false,
            out_timer,
            rtx_timer,
            listener: None,
            con_active: false,
        }
    }

    /// Bytes sent and not yet acknowledged.
    pub fn flight(&self) -> usize {
        self.snd_cur
    }

    /// Bytes queued but not yet sent.
    pub fn unsent(&self) -> usize {
        self.snd_buf.len() - self.snd_cur
    }

    /// Whether a sent FIN is still unacknowledged.
    pub fn fin_outstanding(&self) -> bool {
        self.flags.has(PcbFlags::FIN_SENT) && self.snd_nxt == self.snd_una + self.snd_cur + 1
    }

    /// Sequence units in flight, the FIN included.
    pub fn seq_flight(&self) -> usize {
        self.snd_nxt - self.snd_una
    }

    /// Whether the next byte to send falls in the pushed region.
    pub fn in_push_range(&self) -> bool {
        self.snd_cur < self.snd_psh_index
    }

    /// Fold an RTT measurement into `srtt`/`rttvar` and recompute `rto`
    /// (RFC 6298 shape), clamped to the configured bounds.
    pub fn update_rtt(&mut self, sample_ms: u32, min_rto: Duration, max_rto: Duration) {
        if self.flags.has(PcbFlags::RTT_VALID) {
            let delta = self.srtt.abs_diff(sample_ms);
            self.rttvar = (3 * self.rttvar + delta) / 4;
            self.srtt = (7 * self.srtt + sample_ms) / 8;
        } else {
            self.srtt = sample_ms;
            self.rttvar = sample_ms / 2;
            self.flags.set(PcbFlags::RTT_VALID);
        }
        let rto_ms = self.srtt as u64 + (4 * self.rttvar).max(1) as u64;
        self.rto = Duration::from_millis(rto_ms)
            .max(min_rto)
            .min(max_rto);
    }

    /// The initial congestion window for `snd_mss` (RFC 5681).
    pub fn initial_cwnd(snd_mss: u16) -> usize {
        let mss = snd_mss as usize;
        if mss > 2190 {
            2 * mss
        } else if mss > 1095 {
            3 * mss
        } else {
            4 * mss
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_rtt_estimator() {
        let min = Duration::from_millis(250);
        let max = Duration::from_secs(60);

        let mut pcb = dummy_pcb();
        pcb.update_rtt(100, min, max);
        assert_eq!(pcb.srtt, 100);
        assert_eq!(pcb.rttvar, 50);
        assert_eq!(pcb.rto, Duration::from_millis(300));

        pcb.update_rtt(200, min, max);
        // rttvar = (3*50 + 100)/4 = 62, srtt = (7*100 + 200)/8 = 112
        assert_eq!(pcb.rttvar, 62);
        assert_eq!(pcb.srtt, 112);
        assert_eq!(pcb.rto, Duration::from_millis(112 + 4 * 62));
    }

    #[test]
    fn test_rto_clamped() {
        let mut pcb = dummy_pcb();
        pcb.update_rtt(1, Duration::from_millis(250), Duration::from_secs(60));
        assert_eq!(pcb.rto, Duration::from_millis(250));
    }

    #[test]
    fn test_initial_cwnd_tiers() {
        assert_eq!(Pcb::initial_cwnd(1460), 3 * 1460);
        assert_eq!(Pcb::initial_cwnd(536), 4 * 536);
        assert_eq!(Pcb::initial_cwnd(4000), 2 * 4000);
    }

    fn dummy_pcb() -> Pcb {
        Pcb {
            state: State::Established,
            local_addr: Ipv4Address::new(10, 0, 0, 1),
            local_port: 1,
            remote_addr: Ipv4Address::new(10, 0, 0, 2),
            remote_port: 2,
            snd_una: TcpSeqNumber(0),
            snd_nxt: TcpSeqNumber(0),
            snd_wnd: 0,
            snd_mss: 536,
            base_snd_mss: 536,
            rcv_nxt: TcpSeqNumber(0),
            rcv_ann_wnd: 0,
            rcv_wnd_shift: 0,
            snd_wnd_shift: 0,
            cwnd: 0,
            ssthresh: 0,
            cwnd_acked: 0,
            recover: TcpSeqNumber(0),
            num_dupack: 0,
            rto: Duration::from_secs(1),
            srtt: 0,
            rttvar: 0,
            rtt_test_seq: TcpSeqNumber(0),
            rtt_test_time: Instant::ZERO,
            rtx_count: 0,
            snd_buf: RingBuffer::new(Vec::new()),
            snd_cur: 0,
            snd_psh_index: 0,
            rcv_buf: RingBuffer::new(Vec::new()),
            rcv_ranges: Assembler::new(),
            rcv_fin_seq: None,
            flags: PcbFlags::default(),
            reset: false,
            out_timer: crate::event::TimerQueue::new().insert(),
            rtx_timer: crate::event::TimerQueue::new().insert(),
            listener: None,
            con_active: true,
        }
    }
}
