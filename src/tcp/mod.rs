/*! The TCP protocol machine.

State lives in [PcbTable] slab entries; the modules around it implement
the RFC 793 lifecycle with RFC 6298 retransmission timing and RFC
5681/6582 NewReno congestion control:

* [input] — segment validation, demux, state dispatch, ACK processing,
  receive-side reassembly and window updates;
* [output] — send-queue drain, segmentation, retransmission, fast
  recovery, window probing and FIN sequencing;
* [api] — the user-facing listener/connection byte-stream surface.

Supported options are MSS and window scale, negotiated on the handshake
only. Every PCB owns two timers in the shared [TimerQueue]: a short
output timer (delayed send and driver retries) and the retransmission
timer, which doubles as the SYN, idle, window-probe and TIME_WAIT timer
depending on state.
*/

use std::collections::HashMap;

use crate::config::{StackConfig, MIN_MTU};
use crate::event::{TimerQueue, TimerToken};
use crate::iface::{IfaceId, IpDriver};
use crate::ip::Ip4Stack;
use crate::rand::Rand;
use crate::wire::{Ipv4Address, Ipv4Repr};

pub(crate) mod api;
pub(crate) mod input;
pub(crate) mod output;
pub(crate) mod pcb;
pub(crate) mod table;

pub use self::api::{ConnectOptions, ListenOptions};
pub use self::pcb::State;

use self::pcb::PcbFlags;
use self::table::PcbTable;

/// IPv4 plus TCP header bytes without options.
pub(crate) const IP4_TCP_HEADER_SIZE: u16 = 40;

/// The floor below which `snd_mss` never goes.
pub(crate) const MIN_SND_MSS: u16 = MIN_MTU - IP4_TCP_HEADER_SIZE;

/// MSS assumed for a peer that sent no option (RFC 1122).
pub(crate) const DEFAULT_MSS: u16 = 536;

/// The largest window the stack ever announces, pre-scaling.
pub(crate) const MAX_ANN_WINDOW: usize = 0x3fff_ffff;

/// Duplicate ACKs that trigger fast retransmit.
pub(crate) const DUP_ACK_THRESHOLD: u8 = 3;

/// TTL of emitted segments.
pub(crate) const TCP_TTL: u8 = 64;

/// Handle to one connection PCB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PcbId(pub(crate) usize);

/// Handle to one listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    Output,
    Rtx,
}

/// The TCP layer of the stack.
///
/// It deliberately does not own the IPv4 engine or the timer queue; every
/// operation borrows them from the embedder, which keeps the layers
/// independently borrowable from one event loop.
#[derive(Debug)]
pub struct TcpProto {
    pub(crate) table: PcbTable,
    pub(crate) timer_map: HashMap<TimerToken, (PcbId, TimerKind)>,
    pub(crate) rand: Rand,
}

impl TcpProto {
    pub fn new(config: &StackConfig, seed: u64) -> TcpProto {
        TcpProto {
            table: PcbTable::new(config.tcp_max_pcbs, config.tcp_num_ephemeral_ports),
            timer_map: HashMap::new(),
            rand: Rand::new(seed),
        }
    }

    /// Process one received TCP segment.
    pub fn process<D: IpDriver>(
        &mut self,
        ip: &mut Ip4Stack<D>,
        timers: &mut TimerQueue,
        iface: IfaceId,
        src_addr: Ipv4Address,
        dst_addr: Ipv4Address,
        segment: &[u8],
    ) {
        input::process(self, ip, timers, iface, src_addr, dst_addr, segment);
    }

    /// Dispatch a fired timer. Returns `false` when the token is not a
    /// TCP timer.
    pub fn handle_timer<D: IpDriver>(
        &mut self,
        ip: &mut Ip4Stack<D>,
        timers: &mut TimerQueue,
        token: TimerToken,
    ) -> bool {
        let Some(&(pcb_id, kind)) = self.timer_map.get(&token) else {
            return false;
        };
        if self.table.live_pcb(pcb_id).is_none() {
            return true;
        }
        match kind {
            TimerKind::Output => output::out_timer_handler(self, ip, timers, pcb_id),
            TimerKind::Rtx => output::rtx_timer_handler(self, ip, timers, pcb_id),
        }
        true
    }

    /// Fan a Destination Unreachable out to the affected connections.
    /// Only Fragmentation-Required with a lowered path-MTU estimate has an
    /// effect: every synchronized PCB towards the remote recomputes its
    /// send MSS.
    pub fn handle_dst_unreachable<D: IpDriver>(
        &mut self,
        ip: &mut Ip4Stack<D>,
        timers: &mut TimerQueue,
        inner: &Ipv4Repr,
        _transport: &[u8; 8],
        new_pmtu: Option<u16>,
    ) {
        let Some(pmtu) = new_pmtu else { return };
        for pcb_id in self.table.pcbs_towards(inner.dst_addr) {
            output::pcb_update_snd_mss(self, ip, timers, pcb_id, pmtu);
        }
    }

    /// A driver retry signal or an external wakeup wants the connection's
    /// output pipeline to run again.
    pub fn kick_output<D: IpDriver>(
        &mut self,
        ip: &mut Ip4Stack<D>,
        timers: &mut TimerQueue,
        pcb_id: PcbId,
    ) {
        if self.table.live_pcb(pcb_id).is_some() {
            output::pcb_output(self, ip, timers, pcb_id, false);
        }
    }

    pub(crate) fn register_timers(&mut self, pcb_id: PcbId) {
        let (out_timer, rtx_timer) = {
            let pcb = self.table.pcb(pcb_id);
            (pcb.out_timer, pcb.rtx_timer)
        };
        self.timer_map.insert(out_timer, (pcb_id, TimerKind::Output));
        self.timer_map.insert(rtx_timer, (pcb_id, TimerKind::Rtx));
    }

    /// Free a PCB's slab entry and timer slots; it must already be
    /// unlinked from demux and quota.
    pub(crate) fn release_pcb(&mut self, timers: &mut TimerQueue, pcb_id: PcbId) {
        let pcb = self.table.release(pcb_id, timers);
        self.timer_map.remove(&pcb.out_timer);
        self.timer_map.remove(&pcb.rtx_timer);
    }

    /// End a connection's protocol life. The slab entry survives in
    /// CLOSED while a user handle is attached, so the handle can observe
    /// the outcome; otherwise it is freed at once.
    pub(crate) fn terminate_pcb(&mut self, timers: &mut TimerQueue, pcb_id: PcbId, reset: bool) {
        self.table.unlink(pcb_id, timers);
        if self.table.pcb(pcb_id).con_active {
            let pcb = self.table.pcb_mut(pcb_id);
            pcb.state = State::Closed;
            pcb.reset = reset;
        } else {
            self.release_pcb(timers, pcb_id);
        }
    }

    /// Abort a PCB: emit an RST when the state is synchronized, then end
    /// it immediately.
    pub(crate) fn abort_pcb<D: IpDriver>(
        &mut self,
        ip: &mut Ip4Stack<D>,
        timers: &mut TimerQueue,
        pcb_id: PcbId,
        send_rst: bool,
    ) {
        let synchronized = {
            let pcb = self.table.pcb(pcb_id);
            pcb.state.is_synchronized() && pcb.state != State::TimeWait
        };
        if send_rst && synchronized {
            output::send_rst_for_pcb(self, ip, pcb_id);
        }
        self.terminate_pcb(timers, pcb_id, true);
    }

    /// Move an established-side PCB into TIME_WAIT: buffers are released
    /// and only the identity plus the 2MSL timer stay live.
    pub(crate) fn enter_time_wait<D: IpDriver>(
        &mut self,
        ip: &Ip4Stack<D>,
        timers: &mut TimerQueue,
        pcb_id: PcbId,
    ) {
        let time_wait = ip.config().tcp_time_wait_time;
        let now = ip.now();
        let pcb = self.table.pcb_mut(pcb_id);
        pcb.state = State::TimeWait;
        pcb.snd_buf = crate::storage::RingBuffer::new(Vec::new());
        pcb.rcv_buf = crate::storage::RingBuffer::new(Vec::new());
        pcb.rcv_ranges.clear();
        pcb.snd_cur = 0;
        pcb.flags.clear(PcbFlags::RTX_ACTIVE | PcbFlags::IDLE_TIMER | PcbFlags::OUT_PENDING);
        timers.unset(pcb.out_timer);
        timers.set(pcb.rtx_timer, now + time_wait);
    }
}
