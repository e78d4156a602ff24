use crate::event::TimerQueue;
use crate::iface::{IfaceId, IpDriver};
use crate::ip::Ip4Stack;
use crate::wire::{TcpControl, TcpPacket, TcpRepr, TcpSeqNumber};

use super::pcb::{Pcb, PcbFlags, State};
use super::{output, ListenerId, PcbId, TcpProto, DEFAULT_MSS, IP4_TCP_HEADER_SIZE, MIN_SND_MSS};
use crate::wire::Ipv4Address;

/// The receive window shift that keeps `buf_size` announceable in the
/// 16-bit window field (RFC 1323, shift capped at 14).
pub(crate) fn wnd_shift_for(buf_size: usize) -> u8 {
    let mut shift = 0;
    while shift < 14 && (buf_size >> shift) > 0xffff {
        shift += 1;
    }
    shift
}

/// Validate and dispatch one received segment.
pub(crate) fn process<D: IpDriver>(
    tcp: &mut TcpProto,
    ip: &mut Ip4Stack<D>,
    timers: &mut TimerQueue,
    iface: IfaceId,
    src_addr: Ipv4Address,
    dst_addr: Ipv4Address,
    segment: &[u8],
) {
    let packet = match TcpPacket::new_checked(segment) {
        Ok(packet) => packet,
        Err(_) => {
            net_debug!("tcp: truncated segment, dropped");
            return;
        }
    };
    if !packet.verify_checksum(&src_addr, &dst_addr) {
        net_debug!("tcp: checksum mismatch, dropped");
        return;
    }
    let repr = match TcpRepr::parse(&packet) {
        Ok(repr) => repr,
        Err(_) => {
            net_debug!("tcp: malformed segment, dropped");
            return;
        }
    };

    if let Some(pcb_id) = tcp
        .table
        .lookup(dst_addr, repr.dst_port, src_addr, repr.src_port)
    {
        if tcp.table.pcb(pcb_id).state == State::TimeWait {
            process_time_wait(tcp, ip, timers, iface, src_addr, dst_addr, &repr, pcb_id);
        } else {
            process_pcb(tcp, ip, timers, pcb_id, &repr);
        }
        return;
    }

    if repr.control == TcpControl::Syn && repr.ack_number.is_none() {
        if let Some(listener_id) = tcp.table.find_listener(dst_addr, repr.dst_port) {
            process_listen_syn(tcp, ip, timers, iface, listener_id, src_addr, dst_addr, &repr);
            return;
        }
    }

    if repr.control != TcpControl::Rst {
        output::send_rst_reply(
            ip,
            dst_addr,
            repr.dst_port,
            src_addr,
            repr.src_port,
            repr.seq_number,
            repr.segment_len(),
            repr.ack_number,
        );
    }
}

/// A segment hit a TIME_WAIT slot: re-ACK, die on RST, or recycle the
/// tuple for a fresh SYN with a forward sequence number.
#[allow(clippy::too_many_arguments)]
fn process_time_wait<D: IpDriver>(
    tcp: &mut TcpProto,
    ip: &mut Ip4Stack<D>,
    timers: &mut TimerQueue,
    iface: IfaceId,
    src_addr: Ipv4Address,
    dst_addr: Ipv4Address,
    repr: &TcpRepr<'_>,
    pcb_id: PcbId,
) {
    if repr.control == TcpControl::Rst {
        tcp.terminate_pcb(timers, pcb_id, true);
        return;
    }
    if repr.control == TcpControl::Syn
        && repr.ack_number.is_none()
        && repr.seq_number > tcp.table.pcb(pcb_id).rcv_nxt
    {
        tcp.terminate_pcb(timers, pcb_id, false);
        if let Some(listener_id) = tcp.table.find_listener(dst_addr, repr.dst_port) {
            process_listen_syn(tcp, ip, timers, iface, listener_id, src_addr, dst_addr, repr);
        }
        return;
    }
    output::send_empty_ack(ip, tcp.table.pcb_mut(pcb_id));
}

/// A SYN reached a listener: admit it against the quota and start the
/// server side of the handshake.
#[allow(clippy::too_many_arguments)]
fn process_listen_syn<D: IpDriver>(
    tcp: &mut TcpProto,
    ip: &mut Ip4Stack<D>,
    timers: &mut TimerQueue,
    iface: IfaceId,
    listener_id: ListenerId,
    src_addr: Ipv4Address,
    dst_addr: Ipv4Address,
    repr: &TcpRepr<'_>,
) {
    {
        let listener = tcp.table.listener(listener_id);
        if listener.num_pcbs >= listener.max_pcbs {
            net_debug!("tcp: listener quota full, SYN dropped");
            return;
        }
    }
    // Only accept connections to the address assigned on the ingress
    // interface (or the listener's bound address, which find_listener
    // already matched).
    match ip.iface(iface).addr() {
        Some(addr) if addr.addr == dst_addr => (),
        _ => return,
    }

    let iface_mtu = ip.iface(iface).mtu();
    let peer_mss = repr.max_seg_size.unwrap_or(DEFAULT_MSS);
    let base_snd_mss = peer_mss
        .min(iface_mtu - IP4_TCP_HEADER_SIZE)
        .max(MIN_SND_MSS);
    let pmtu = ip.pmtu_for(src_addr).unwrap_or(iface_mtu);
    let snd_mss = output::compute_snd_mss(base_snd_mss, pmtu);

    let (snd_buf_size, rcv_buf_size) = {
        let listener = tcp.table.listener(listener_id);
        (listener.snd_buf_size, listener.rcv_buf_size)
    };

    let iss = TcpSeqNumber(tcp.rand.rand_u32());
    let out_timer = timers.insert();
    let rtx_timer = timers.insert();
    let mut pcb = Pcb::new(
        State::SynReceived,
        (dst_addr, repr.dst_port),
        (src_addr, repr.src_port),
        iss,
        repr.seq_number + 1,
        snd_mss,
        base_snd_mss,
        snd_buf_size,
        rcv_buf_size,
        ip.config().tcp_syn_rtx_time,
        out_timer,
        rtx_timer,
    );
    // The window field of the SYN itself is never scaled.
    pcb.snd_wnd = repr.window_len as usize;
    if let Some(scale) = repr.window_scale {
        pcb.flags.set(PcbFlags::WND_SCALE);
        pcb.snd_wnd_shift = scale;
        pcb.rcv_wnd_shift = wnd_shift_for(rcv_buf_size);
    }
    pcb.listener = Some(listener_id);

    let pcb_id = match tcp.table.insert(pcb) {
        Ok(pcb_id) => pcb_id,
        Err(err) => {
            net_debug!("tcp: cannot admit connection: {}", err);
            timers.remove(out_timer);
            timers.remove(rtx_timer);
            return;
        }
    };
    tcp.table.listener_mut(listener_id).num_pcbs += 1;
    tcp.register_timers(pcb_id);
    output::send_syn(tcp, ip, timers, pcb_id);
}

fn process_pcb<D: IpDriver>(
    tcp: &mut TcpProto,
    ip: &mut Ip4Stack<D>,
    timers: &mut TimerQueue,
    pcb_id: PcbId,
    repr: &TcpRepr<'_>,
) {
    match tcp.table.pcb(pcb_id).state {
        State::SynSent => process_syn_sent(tcp, ip, timers, pcb_id, repr),
        State::SynReceived => process_syn_received(tcp, ip, timers, pcb_id, repr),
        State::Closed | State::Listen | State::TimeWait => (),
        _ => process_established(tcp, ip, timers, pcb_id, repr),
    }
}

fn process_syn_sent<D: IpDriver>(
    tcp: &mut TcpProto,
    ip: &mut Ip4Stack<D>,
    timers: &mut TimerQueue,
    pcb_id: PcbId,
    repr: &TcpRepr<'_>,
) {
    let snd_nxt = tcp.table.pcb(pcb_id).snd_nxt;
    match (repr.control, repr.ack_number) {
        (TcpControl::Syn, Some(ack)) if ack == snd_nxt => {
            let iface_mtu = {
                let remote = tcp.table.pcb(pcb_id).remote_addr;
                match ip.route(&remote, None) {
                    Ok((iface, _)) => ip.iface(iface).mtu(),
                    Err(_) => MIN_SND_MSS + IP4_TCP_HEADER_SIZE,
                }
            };
            let pmtu = {
                let remote = tcp.table.pcb(pcb_id).remote_addr;
                ip.pmtu_for(remote).unwrap_or(iface_mtu)
            };
            let initial_rto = ip.config().tcp_initial_rtx_time;
            let pcb = tcp.table.pcb_mut(pcb_id);

            pcb.snd_una = ack;
            pcb.rcv_nxt = repr.seq_number + 1;
            // The window of a SYN-ACK is unscaled.
            pcb.snd_wnd = repr.window_len as usize;

            let peer_mss = repr.max_seg_size.unwrap_or(DEFAULT_MSS);
            pcb.base_snd_mss = peer_mss
                .min(iface_mtu - IP4_TCP_HEADER_SIZE)
                .max(MIN_SND_MSS);
            pcb.snd_mss = output::compute_snd_mss(pcb.base_snd_mss, pmtu);

            // Window scaling binds only when both sides offered it.
            match repr.window_scale {
                Some(scale) if pcb.flags.has(PcbFlags::WND_SCALE) => {
                    pcb.snd_wnd_shift = scale;
                }
                _ => {
                    pcb.flags.clear(PcbFlags::WND_SCALE);
                    pcb.rcv_wnd_shift = 0;
                    pcb.snd_wnd_shift = 0;
                }
            }

            pcb.state = State::Established;
            pcb.cwnd = Pcb::initial_cwnd(pcb.snd_mss);
            pcb.rto = initial_rto;
            pcb.rtx_count = 0;
            timers.unset(pcb.rtx_timer);
            pcb.flags.clear(PcbFlags::RTX_ACTIVE);
            pcb.flags.set(PcbFlags::ACK_PENDING);
            output::pcb_output(tcp, ip, timers, pcb_id, false);
        }
        (TcpControl::Rst, Some(ack)) if ack == snd_nxt => {
            // Connection refused.
            tcp.terminate_pcb(timers, pcb_id, true);
        }
        (_, Some(ack)) if ack != snd_nxt => {
            let pcb = tcp.table.pcb(pcb_id);
            output::send_rst_reply(
                ip,
                pcb.local_addr,
                pcb.local_port,
                pcb.remote_addr,
                pcb.remote_port,
                repr.seq_number,
                repr.segment_len(),
                Some(ack),
            );
        }
        _ => (),
    }
}

fn process_syn_received<D: IpDriver>(
    tcp: &mut TcpProto,
    ip: &mut Ip4Stack<D>,
    timers: &mut TimerQueue,
    pcb_id: PcbId,
    repr: &TcpRepr<'_>,
) {
    match repr.control {
        TcpControl::Rst => {
            // The initiator went away; the embryonic PCB disappears.
            tcp.terminate_pcb(timers, pcb_id, true);
            return;
        }
        TcpControl::Syn => {
            // A retransmitted SYN of the same connection: repeat the
            // SYN-ACK.
            if repr.seq_number + 1 == tcp.table.pcb(pcb_id).rcv_nxt {
                output::send_syn(tcp, ip, timers, pcb_id);
            }
            return;
        }
        _ => (),
    }
    let Some(ack) = repr.ack_number else { return };
    let snd_nxt = tcp.table.pcb(pcb_id).snd_nxt;
    if ack != snd_nxt {
        let pcb = tcp.table.pcb(pcb_id);
        output::send_rst_reply(
            ip,
            pcb.local_addr,
            pcb.local_port,
            pcb.remote_addr,
            pcb.remote_port,
            repr.seq_number,
            repr.segment_len(),
            Some(ack),
        );
        return;
    }

    {
        let initial_rto = ip.config().tcp_initial_rtx_time;
        let pcb = tcp.table.pcb_mut(pcb_id);
        pcb.snd_una = ack;
        pcb.snd_wnd = (repr.window_len as usize) << pcb.snd_wnd_shift;
        pcb.state = State::Established;
        pcb.cwnd = Pcb::initial_cwnd(pcb.snd_mss);
        pcb.rto = initial_rto;
        pcb.rtx_count = 0;
        timers.unset(pcb.rtx_timer);
        pcb.flags.clear(PcbFlags::RTX_ACTIVE);
    }
    if let Some(listener_id) = tcp.table.pcb(pcb_id).listener {
        tcp.table
            .listener_mut(listener_id)
            .accept_queue
            .push_back(pcb_id);
    }
    // The handshake ACK may itself carry data.
    if !repr.payload.is_empty() || repr.control == TcpControl::Fin {
        process_established(tcp, ip, timers, pcb_id, repr);
    }
}

enum Disposition {
    Proceed,
    AckAndDrop,
    Drop,
    PeerReset,
    InWindowSyn,
}

fn process_established<D: IpDriver>(
    tcp: &mut TcpProto,
    ip: &mut Ip4Stack<D>,
    timers: &mut TimerQueue,
    pcb_id: PcbId,
    repr: &TcpRepr<'_>,
) {
    let seg_fin = repr.control == TcpControl::Fin;
    let seg_len = repr.payload.len() + seg_fin as usize;

    // Acceptability (RFC 793): some part of the segment must fall inside
    // the receive window.
    let disposition = {
        let pcb = tcp.table.pcb(pcb_id);
        let wnd = pcb.rcv_buf.window();
        let seq = repr.seq_number;
        let acceptable = if seg_len == 0 {
            if wnd == 0 {
                seq == pcb.rcv_nxt
            } else {
                pcb.rcv_nxt <= seq && seq < pcb.rcv_nxt + wnd
            }
        } else if wnd == 0 {
            false
        } else {
            seq + seg_len > pcb.rcv_nxt && seq < pcb.rcv_nxt + wnd
        };
        if !acceptable {
            if repr.control == TcpControl::Rst {
                Disposition::Drop
            } else {
                Disposition::AckAndDrop
            }
        } else {
            match repr.control {
                TcpControl::Rst => Disposition::PeerReset,
                TcpControl::Syn => Disposition::InWindowSyn,
                _ => Disposition::Proceed,
            }
        }
    };
    match disposition {
        Disposition::Drop => return,
        Disposition::AckAndDrop => {
            output::send_empty_ack(ip, tcp.table.pcb_mut(pcb_id));
            return;
        }
        Disposition::PeerReset => {
            net_debug!("tcp: connection reset by peer");
            tcp.terminate_pcb(timers, pcb_id, true);
            return;
        }
        Disposition::InWindowSyn => {
            tcp.abort_pcb(ip, timers, pcb_id, true);
            return;
        }
        Disposition::Proceed => (),
    }

    // Every synchronized segment must acknowledge something.
    let Some(ack) = repr.ack_number else { return };

    // ACK processing.
    enum AckKind {
        Ahead,
        New,
        Duplicate,
        Old,
    }
    let kind = {
        let pcb = tcp.table.pcb_mut(pcb_id);
        if ack > pcb.snd_nxt {
            AckKind::Ahead
        } else if ack > pcb.snd_una {
            AckKind::New
        } else if ack == pcb.snd_una {
            let wnd_update = (repr.window_len as usize) << pcb.snd_wnd_shift;
            if repr.payload.is_empty()
                && !seg_fin
                && wnd_update == pcb.snd_wnd
                && pcb.seq_flight() > 0
            {
                AckKind::Duplicate
            } else {
                pcb.snd_wnd = wnd_update;
                AckKind::Old
            }
        } else {
            AckKind::Old
        }
    };
    match kind {
        AckKind::Ahead => {
            output::send_empty_ack(ip, tcp.table.pcb_mut(pcb_id));
            return;
        }
        AckKind::New => {
            let fin_acked = output::handle_acked(tcp, ip, timers, pcb_id, ack);
            {
                let pcb = tcp.table.pcb_mut(pcb_id);
                pcb.snd_wnd = (repr.window_len as usize) << pcb.snd_wnd_shift;
            }
            if fin_acked {
                let state = tcp.table.pcb(pcb_id).state;
                match state {
                    State::FinWait1 => {
                        let fin_wait2 = ip.config().tcp_fin_wait2_time;
                        let now = ip.now();
                        let pcb = tcp.table.pcb_mut(pcb_id);
                        pcb.state = State::FinWait2;
                        // Bound the half-open wait.
                        timers.set(pcb.rtx_timer, now + fin_wait2);
                        pcb.flags.clear(PcbFlags::RTX_ACTIVE | PcbFlags::IDLE_TIMER);
                    }
                    State::Closing => {
                        tcp.enter_time_wait(ip, timers, pcb_id);
                    }
                    State::LastAck => {
                        tcp.terminate_pcb(timers, pcb_id, false);
                        return;
                    }
                    _ => (),
                }
            }
        }
        AckKind::Duplicate => {
            output::handle_dup_ack(tcp, ip, timers, pcb_id);
        }
        AckKind::Old => (),
    }

    // Data processing: place the payload relative to rcv_nxt, commit any
    // contiguous prefix, park the rest out of order.
    {
        let pcb = tcp.table.pcb_mut(pcb_id);
        let mut seq = repr.seq_number;
        let mut payload = repr.payload;
        let mut fin = seg_fin;

        if !payload.is_empty() && pcb.state.can_receive() {
            if seq < pcb.rcv_nxt {
                let trim = pcb.rcv_nxt - seq;
                if trim >= payload.len() {
                    payload = &[];
                } else {
                    payload = &payload[trim..];
                }
                seq = pcb.rcv_nxt;
            }
            let wnd = pcb.rcv_buf.window();
            let max_len = (pcb.rcv_nxt + wnd) - seq;
            if payload.len() > max_len {
                payload = &payload[..max_len];
                fin = false;
            }
            if !payload.is_empty() {
                let offset = seq - pcb.rcv_nxt;
                let wrote = pcb.rcv_buf.write_unallocated(offset, payload);
                if wrote == payload.len()
                    && pcb
                        .rcv_ranges
                        .add(offset as u32, (offset + payload.len()) as u32)
                        .is_ok()
                {
                    let advance = pcb.rcv_ranges.peek_front() as usize;
                    if advance > 0 {
                        pcb.rcv_ranges.advance_front(advance as u32);
                        pcb.rcv_buf.enqueue_unallocated(advance);
                        pcb.rcv_nxt += advance;
                    }
                }
                pcb.flags.set(PcbFlags::ACK_PENDING);
            }
        } else if !payload.is_empty() {
            // Data past the peer's FIN or into a closed direction: just
            // re-assert our state.
            pcb.flags.set(PcbFlags::ACK_PENDING);
        }

        if fin && pcb.state.can_receive() {
            pcb.rcv_fin_seq = Some(seq + payload.len());
        }
    }

    // Consume a FIN that all data has caught up with.
    let fin_transition = {
        let pcb = tcp.table.pcb_mut(pcb_id);
        match pcb.rcv_fin_seq {
            Some(fin_seq) if pcb.rcv_nxt == fin_seq && pcb.state.can_receive() => {
                pcb.rcv_nxt += 1;
                pcb.flags.set(PcbFlags::ACK_PENDING);
                Some(pcb.state)
            }
            _ => None,
        }
    };
    if let Some(state) = fin_transition {
        match state {
            State::Established => tcp.table.pcb_mut(pcb_id).state = State::CloseWait,
            State::FinWait1 => {
                let fin_done = {
                    let pcb = tcp.table.pcb(pcb_id);
                    pcb.flags.has(PcbFlags::FIN_SENT) && !pcb.fin_outstanding()
                };
                if fin_done {
                    tcp.enter_time_wait(ip, timers, pcb_id);
                } else {
                    tcp.table.pcb_mut(pcb_id).state = State::Closing;
                }
            }
            State::FinWait2 => tcp.enter_time_wait(ip, timers, pcb_id),
            _ => (),
        }
    }

    // Send what the segment made sendable, or at least the ACK it earned.
    output::pcb_output(tcp, ip, timers, pcb_id, false);
}
