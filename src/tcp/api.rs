//! The user-facing byte-stream surface: listeners and connections.
//!
//! Handles are plain ids into the PCB table. Events are poll-style: the
//! embedder drains [TcpProto::accept] after input processing and watches
//! [TcpProto::state] / [TcpProto::recv_available] / [TcpProto::send_capacity]
//! on its connections. Adoption is synchronous with respect to the event
//! loop: a connection must be accepted before the next
//! [TcpProto::abort_unaccepted] pass — the embedding loop runs one at the
//! top of every poll — or it is reset. Nothing stays half-owned in an
//! accept queue.

use std::collections::VecDeque;

use crate::error::IpErr;
use crate::event::TimerQueue;
use crate::iface::IpDriver;
use crate::ip::Ip4Stack;
use crate::wire::{Ipv4Address, TcpSeqNumber};

use super::input::wnd_shift_for;
use super::output;
use super::pcb::{Pcb, PcbFlags, State};
use super::table::Listener;
use super::{ListenerId, PcbId, TcpProto, IP4_TCP_HEADER_SIZE, MIN_SND_MSS};

/// Parameters of a [TcpProto::listen] call.
#[derive(Debug, Clone, Copy)]
pub struct ListenOptions {
    /// PCBs (SYN_RCVD included) this listener may hold at once.
    pub max_pcbs: usize,
    pub snd_buf_size: usize,
    pub rcv_buf_size: usize,
}

impl Default for ListenOptions {
    fn default() -> ListenOptions {
        ListenOptions {
            max_pcbs: 8,
            snd_buf_size: 16384,
            rcv_buf_size: 16384,
        }
    }
}

/// Parameters of a [TcpProto::connect] call.
#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    pub snd_buf_size: usize,
    pub rcv_buf_size: usize,
}

impl Default for ConnectOptions {
    fn default() -> ConnectOptions {
        ConnectOptions {
            snd_buf_size: 16384,
            rcv_buf_size: 16384,
        }
    }
}

impl TcpProto {
    /// Bind a listener to `(addr | any, port)`.
    pub fn listen(
        &mut self,
        addr: Option<Ipv4Address>,
        port: u16,
        options: ListenOptions,
    ) -> Result<ListenerId, IpErr> {
        self.table.insert_listener(Listener {
            addr,
            port,
            max_pcbs: options.max_pcbs,
            num_pcbs: 0,
            rcv_buf_size: options.rcv_buf_size,
            snd_buf_size: options.snd_buf_size,
            accept_queue: VecDeque::new(),
        })
    }

    /// Tear a listener down, aborting every PCB still counted against it.
    pub fn unlisten<D: IpDriver>(
        &mut self,
        ip: &mut Ip4Stack<D>,
        timers: &mut TimerQueue,
        listener_id: ListenerId,
    ) {
        let owned: Vec<PcbId> = self
            .table
            .pcbs
            .iter()
            .enumerate()
            .filter_map(|(at, slot)| {
                slot.as_ref()
                    .and_then(|pcb| (pcb.listener == Some(listener_id)).then_some(PcbId(at)))
            })
            .collect();
        for pcb_id in owned {
            self.abort_pcb(ip, timers, pcb_id, true);
        }
        self.table.remove_listener(listener_id);
    }

    /// Abort every established connection still waiting in an accept
    /// queue.
    ///
    /// Accepting is synchronous with respect to the event loop: the
    /// embedder drains [TcpProto::accept] after feeding input, and
    /// whatever is still queued when the next pass begins was not taken,
    /// so it is reset rather than left half-owned.
    pub fn abort_unaccepted<D: IpDriver>(
        &mut self,
        ip: &mut Ip4Stack<D>,
        timers: &mut TimerQueue,
    ) {
        let stale: Vec<PcbId> = self
            .table
            .listeners
            .iter()
            .flatten()
            .flat_map(|listener| listener.accept_queue.iter().copied())
            .collect();
        for pcb_id in stale {
            net_debug!("tcp: connection not accepted, aborting");
            self.abort_pcb(ip, timers, pcb_id, true);
        }
    }

    /// Pop one established connection off the accept queue, detaching it
    /// from the listener quota and attaching the user handle.
    pub fn accept(&mut self, listener_id: ListenerId) -> Option<PcbId> {
        let pcb_id = self.table.listener_mut(listener_id).accept_queue.pop_front()?;
        {
            let listener = self.table.listener_mut(listener_id);
            listener.num_pcbs -= 1;
        }
        let pcb = self.table.pcb_mut(pcb_id);
        pcb.listener = None;
        pcb.con_active = true;
        Some(pcb_id)
    }

    /// Open a connection towards `(remote_addr, remote_port)`; the PCB
    /// starts in SYN_SENT and becomes [State::Established] when the
    /// handshake completes.
    pub fn connect<D: IpDriver>(
        &mut self,
        ip: &mut Ip4Stack<D>,
        timers: &mut TimerQueue,
        remote_addr: Ipv4Address,
        remote_port: u16,
        options: ConnectOptions,
    ) -> Result<PcbId, IpErr> {
        let (iface_id, _) = ip.route(&remote_addr, None)?;
        let local_addr = ip
            .iface(iface_id)
            .addr()
            .map(|addr| addr.addr)
            .ok_or(IpErr::NonLocalSrc)?;
        let iface_mtu = ip.iface(iface_id).mtu();
        let local_port =
            self.table
                .alloc_ephemeral_port(local_addr, remote_addr, remote_port)?;

        let base_snd_mss = (iface_mtu - IP4_TCP_HEADER_SIZE).max(MIN_SND_MSS);
        let pmtu = ip.pmtu_for(remote_addr).unwrap_or(iface_mtu);
        let snd_mss = output::compute_snd_mss(base_snd_mss, pmtu);

        let iss = TcpSeqNumber(self.rand.rand_u32());
        let out_timer = timers.insert();
        let rtx_timer = timers.insert();
        let mut pcb = Pcb::new(
            State::SynSent,
            (local_addr, local_port),
            (remote_addr, remote_port),
            iss,
            TcpSeqNumber(0),
            snd_mss,
            base_snd_mss,
            options.snd_buf_size,
            options.rcv_buf_size,
            ip.config().tcp_syn_rtx_time,
            out_timer,
            rtx_timer,
        );
        // Offer window scaling; it binds if the SYN-ACK reciprocates.
        pcb.flags.set(PcbFlags::WND_SCALE);
        pcb.rcv_wnd_shift = wnd_shift_for(options.rcv_buf_size);
        pcb.con_active = true;

        let pcb_id = match self.table.insert(pcb) {
            Ok(pcb_id) => pcb_id,
            Err(err) => {
                timers.remove(out_timer);
                timers.remove(rtx_timer);
                return Err(err);
            }
        };
        self.register_timers(pcb_id);
        output::send_syn(self, ip, timers, pcb_id);
        Ok(pcb_id)
    }

    /// The connection state; stale handles read as [State::Closed].
    pub fn state(&self, conn: PcbId) -> State {
        self.table
            .live_pcb(conn)
            .map_or(State::Closed, |pcb| pcb.state)
    }

    /// Whether the connection ended by reset or abort rather than an
    /// orderly close.
    pub fn was_reset(&self, conn: PcbId) -> bool {
        self.table.live_pcb(conn).is_some_and(|pcb| pcb.reset)
    }

    /// Free space in the send buffer.
    pub fn send_capacity(&self, conn: PcbId) -> usize {
        self.table
            .live_pcb(conn)
            .map_or(0, |pcb| match pcb.state {
                State::Established | State::CloseWait
                    if !pcb.flags.has(PcbFlags::FIN_PENDING)
                        && !pcb.flags.has(PcbFlags::FIN_SENT) =>
                {
                    pcb.snd_buf.window()
                }
                _ => 0,
            })
    }

    /// Bytes ready for [TcpProto::recv].
    pub fn recv_available(&self, conn: PcbId) -> usize {
        self.table.live_pcb(conn).map_or(0, |pcb| pcb.rcv_buf.len())
    }

    /// The peer has closed its direction and everything it sent has been
    /// consumed.
    pub fn recv_finished(&self, conn: PcbId) -> bool {
        self.table.live_pcb(conn).is_some_and(|pcb| {
            pcb.rcv_buf.is_empty()
                && matches!(
                    pcb.state,
                    State::CloseWait
                        | State::Closing
                        | State::LastAck
                        | State::TimeWait
                        | State::Closed
                )
        })
    }

    /// Queue bytes on the send side; returns how many fit. Returns 0 when
    /// the connection cannot take data (not established, or already
    /// closed for sending).
    pub fn send<D: IpDriver>(
        &mut self,
        ip: &mut Ip4Stack<D>,
        timers: &mut TimerQueue,
        conn: PcbId,
        data: &[u8],
    ) -> usize {
        let queued = {
            let Some(pcb) = self.table.live_pcb_mut(conn) else {
                return 0;
            };
            if !matches!(pcb.state, State::Established | State::CloseWait)
                || pcb.flags.has(PcbFlags::FIN_PENDING)
                || pcb.flags.has(PcbFlags::FIN_SENT)
            {
                return 0;
            }
            pcb.snd_buf.enqueue_slice(data)
        };
        if queued > 0 {
            output::pcb_output(self, ip, timers, conn, false);
        }
        queued
    }

    /// Mark everything queued so far as pushed: PSH will be set and no
    /// output delay applies until it has all been sent.
    pub fn send_push<D: IpDriver>(
        &mut self,
        ip: &mut Ip4Stack<D>,
        timers: &mut TimerQueue,
        conn: PcbId,
    ) {
        {
            let Some(pcb) = self.table.live_pcb_mut(conn) else {
                return;
            };
            pcb.snd_psh_index = pcb.snd_buf.len();
        }
        output::pcb_output(self, ip, timers, conn, false);
    }

    /// Read received bytes; frees receive window. A significantly grown
    /// window is announced to the peer right away to keep data flowing.
    pub fn recv<D: IpDriver>(
        &mut self,
        ip: &mut Ip4Stack<D>,
        conn: PcbId,
        data: &mut [u8],
    ) -> usize {
        let (read, announce) = {
            let Some(pcb) = self.table.live_pcb_mut(conn) else {
                return 0;
            };
            let read = pcb.rcv_buf.dequeue_slice(data);
            let free = pcb.rcv_buf.window();
            let slack = free.saturating_sub(pcb.rcv_ann_wnd);
            let threshold = (pcb.snd_mss as usize).max(pcb.rcv_buf.capacity() / 8);
            (read, slack >= threshold && pcb.state.is_synchronized())
        };
        if announce {
            self.extend_rcv_wnd(ip, conn);
        }
        read
    }

    /// Announce the current receive window to the peer immediately.
    pub fn extend_rcv_wnd<D: IpDriver>(&mut self, ip: &mut Ip4Stack<D>, conn: PcbId) {
        let Some(pcb) = self.table.live_pcb_mut(conn) else {
            return;
        };
        if pcb.state.is_synchronized() && pcb.state != State::TimeWait {
            output::send_empty_ack(ip, pcb);
        }
    }

    /// Close the sending direction: a FIN is queued after any remaining
    /// data and the state machine advances towards TIME_WAIT or CLOSED.
    pub fn close<D: IpDriver>(
        &mut self,
        ip: &mut Ip4Stack<D>,
        timers: &mut TimerQueue,
        conn: PcbId,
    ) {
        let next = {
            let Some(pcb) = self.table.live_pcb(conn) else {
                return;
            };
            match pcb.state {
                State::SynSent | State::SynReceived => None,
                State::Established => Some(State::FinWait1),
                State::CloseWait => Some(State::LastAck),
                _ => return,
            }
        };
        match next {
            None => self.terminate_pcb(timers, conn, false),
            Some(state) => {
                {
                    let pcb = self.table.pcb_mut(conn);
                    pcb.state = state;
                    pcb.flags.set(PcbFlags::FIN_PENDING);
                    pcb.snd_psh_index = pcb.snd_buf.len();
                }
                output::pcb_output(self, ip, timers, conn, false);
            }
        }
    }

    /// Reset the connection immediately.
    pub fn abort<D: IpDriver>(
        &mut self,
        ip: &mut Ip4Stack<D>,
        timers: &mut TimerQueue,
        conn: PcbId,
    ) {
        if self.table.live_pcb(conn).is_some() {
            self.abort_pcb(ip, timers, conn, true);
        }
    }

    /// The user handle goes away. A connection mid-close without unsent
    /// data finishes its FIN exchange ownerless; anything else is reset.
    pub fn detach<D: IpDriver>(
        &mut self,
        ip: &mut Ip4Stack<D>,
        timers: &mut TimerQueue,
        conn: PcbId,
    ) {
        let decision = {
            let Some(pcb) = self.table.live_pcb_mut(conn) else {
                return;
            };
            pcb.con_active = false;
            match pcb.state {
                State::Closed => Decision::Release,
                State::TimeWait => Decision::Keep,
                State::FinWait1 | State::FinWait2 | State::Closing | State::LastAck => {
                    if pcb.unsent() > 0 {
                        Decision::Abort
                    } else {
                        Decision::Keep
                    }
                }
                _ => Decision::Abort,
            }
        };
        match decision {
            Decision::Release => self.release_pcb(timers, conn),
            Decision::Keep => (),
            Decision::Abort => self.abort_pcb(ip, timers, conn, true),
        }
    }
}

enum Decision {
    Release,
    Keep,
    Abort,
}
