use byteorder::{ByteOrder, NetworkEndian};

use crate::buf::BufRef;
use crate::checksum::{ChecksumAccumulator, ChecksumState};
use crate::error::IpErr;
use crate::event::TimerQueue;
use crate::iface::IpDriver;
use crate::ip::{Ip4Stack, PreparedSend, SendFlags};
use crate::wire::{
    IpProtocol, Ipv4Address, TcpControl, TcpPacket, TcpRepr, TcpSeqNumber, TCP_HEADER_LEN,
    TCP_MAX_HEADER_LEN,
};

use super::pcb::{Pcb, PcbFlags, State};
use super::{PcbId, TcpProto, IP4_TCP_HEADER_SIZE, MAX_ANN_WINDOW, MIN_SND_MSS, TCP_TTL};

const TCP_SEND_FLAGS: SendFlags = SendFlags {
    allow_broadcast: false,
    dont_fragment: true,
};

/// Clamp the effective send MSS between the configured base and the floor.
pub(crate) fn compute_snd_mss(base_snd_mss: u16, pmtu: u16) -> u16 {
    base_snd_mss
        .min(pmtu.saturating_sub(IP4_TCP_HEADER_SIZE))
        .max(MIN_SND_MSS)
}

/// Recompute the announced receive window and remember the edge announced.
pub(crate) fn announce_window(pcb: &mut Pcb) -> u16 {
    let free = pcb.rcv_buf.window().min(MAX_ANN_WINDOW);
    let wire = (free >> pcb.rcv_wnd_shift).min(0xffff);
    pcb.rcv_ann_wnd = wire << pcb.rcv_wnd_shift;
    wire as u16
}

fn emit_control<D: IpDriver>(
    ip: &mut Ip4Stack<D>,
    src_addr: Ipv4Address,
    dst_addr: Ipv4Address,
    repr: &TcpRepr<'_>,
) -> Result<(), IpErr> {
    debug_assert!(repr.payload.is_empty());
    let mut seg = [0u8; TCP_MAX_HEADER_LEN];
    let len = repr.buffer_len();
    {
        let mut packet = TcpPacket::new_unchecked(&mut seg[..len]);
        repr.emit(&mut packet, &src_addr, &dst_addr);
    }
    let chunks = [&seg[..len]];
    ip.send_dgram(
        src_addr,
        dst_addr,
        TCP_TTL,
        IpProtocol::Tcp,
        BufRef::new(&chunks, 0, len),
        None,
        None,
        TCP_SEND_FLAGS,
    )
}

/// Emit a bare ACK for the current receive state.
pub(crate) fn send_empty_ack<D: IpDriver>(ip: &mut Ip4Stack<D>, pcb: &mut Pcb) {
    let window_len = announce_window(pcb);
    let repr = TcpRepr {
        src_port: pcb.local_port,
        dst_port: pcb.remote_port,
        control: TcpControl::None,
        seq_number: pcb.snd_nxt,
        ack_number: Some(pcb.rcv_nxt),
        window_len,
        max_seg_size: None,
        window_scale: None,
        payload: &[],
    };
    if let Err(err) = emit_control(ip, pcb.local_addr, pcb.remote_addr, &repr) {
        net_debug!("tcp: ack not sent: {}", err);
    }
    pcb.flags.clear(PcbFlags::ACK_PENDING);
}

/// Send (or resend) the SYN or SYN-ACK of the handshake and arm the
/// retransmission timer on the SYN schedule.
pub(crate) fn send_syn<D: IpDriver>(
    tcp: &mut TcpProto,
    ip: &mut Ip4Stack<D>,
    timers: &mut TimerQueue,
    pcb_id: PcbId,
) {
    let now = ip.now();
    let our_mss = {
        let pcb = tcp.table.pcb(pcb_id);
        match ip.route(&pcb.remote_addr, None) {
            Ok((iface, _)) => ip.iface(iface).mtu() - IP4_TCP_HEADER_SIZE,
            Err(_) => MIN_SND_MSS,
        }
    };
    let pcb = tcp.table.pcb_mut(pcb_id);
    let syn_ack = pcb.state == State::SynReceived;
    // The window field of a handshake segment is never scaled.
    let window_len = pcb.rcv_buf.window().min(0xffff);
    pcb.rcv_ann_wnd = window_len;
    let offer_scale = pcb.flags.has(PcbFlags::WND_SCALE);
    let repr = TcpRepr {
        src_port: pcb.local_port,
        dst_port: pcb.remote_port,
        control: TcpControl::Syn,
        seq_number: pcb.snd_una,
        ack_number: syn_ack.then_some(pcb.rcv_nxt),
        window_len: window_len as u16,
        max_seg_size: Some(our_mss),
        window_scale: offer_scale.then_some(pcb.rcv_wnd_shift),
        payload: &[],
    };
    if let Err(err) = emit_control(ip, pcb.local_addr, pcb.remote_addr, &repr) {
        net_debug!("tcp: {} not sent: {}", if syn_ack { "syn-ack" } else { "syn" }, err);
    }
    pcb.snd_nxt = pcb.snd_una + 1;
    timers.set(pcb.rtx_timer, now + pcb.rto);
    pcb.flags.set(PcbFlags::RTX_ACTIVE);
}

/// Emit an RST carrying this connection's current sequence state.
pub(crate) fn send_rst_for_pcb<D: IpDriver>(
    tcp: &mut TcpProto,
    ip: &mut Ip4Stack<D>,
    pcb_id: PcbId,
) {
    let pcb = tcp.table.pcb(pcb_id);
    let repr = TcpRepr {
        src_port: pcb.local_port,
        dst_port: pcb.remote_port,
        control: TcpControl::Rst,
        seq_number: pcb.snd_nxt,
        ack_number: Some(pcb.rcv_nxt),
        window_len: 0,
        max_seg_size: None,
        window_scale: None,
        payload: &[],
    };
    let (src, dst) = (pcb.local_addr, pcb.remote_addr);
    if let Err(err) = emit_control(ip, src, dst, &repr) {
        net_debug!("tcp: rst not sent: {}", err);
    }
}

/// The RFC 793 reply to a segment that matches no PCB and no listener.
#[allow(clippy::too_many_arguments)]
pub(crate) fn send_rst_reply<D: IpDriver>(
    ip: &mut Ip4Stack<D>,
    local_addr: Ipv4Address,
    local_port: u16,
    remote_addr: Ipv4Address,
    remote_port: u16,
    seg_seq: TcpSeqNumber,
    seg_len: usize,
    seg_ack: Option<TcpSeqNumber>,
) {
    let repr = match seg_ack {
        Some(ack) => TcpRepr {
            src_port: local_port,
            dst_port: remote_port,
            control: TcpControl::Rst,
            seq_number: ack,
            ack_number: None,
            window_len: 0,
            max_seg_size: None,
            window_scale: None,
            payload: &[],
        },
        None => TcpRepr {
            src_port: local_port,
            dst_port: remote_port,
            control: TcpControl::Rst,
            seq_number: TcpSeqNumber(0),
            ack_number: Some(seg_seq + seg_len),
            window_len: 0,
            max_seg_size: None,
            window_scale: None,
            payload: &[],
        },
    };
    if let Err(err) = emit_control(ip, local_addr, remote_addr, &repr) {
        net_debug!("tcp: rst reply not sent: {}", err);
    }
}

/// The partial checksum over the pseudo-header fields that do not change
/// between this connection's segments.
fn pseudo_partial(pcb: &Pcb) -> ChecksumState {
    let mut accum = ChecksumAccumulator::new();
    accum.add_word32(pcb.local_addr.to_bits());
    accum.add_word32(pcb.remote_addr.to_bits());
    accum.add_word16(u8::from(IpProtocol::Tcp) as u16);
    accum.state()
}

/// Build and transmit one data-bearing segment (possibly carrying FIN)
/// whose payload is gathered from the send ring without copying.
#[allow(clippy::too_many_arguments)]
fn send_data_segment<D: IpDriver>(
    ip: &mut Ip4Stack<D>,
    pcb: &Pcb,
    prep: &PreparedSend,
    pseudo: ChecksumState,
    seq: TcpSeqNumber,
    seg_len: usize,
    fin: bool,
    psh: bool,
    window_len: u16,
) -> Result<(), IpErr> {
    let mut hdr = [0u8; TCP_HEADER_LEN];
    {
        let mut packet = TcpPacket::new_unchecked(&mut hdr[..]);
        packet.set_src_port(pcb.local_port);
        packet.set_dst_port(pcb.remote_port);
        packet.set_seq_number(seq);
        packet.set_ack_number(pcb.rcv_nxt);
        packet.clear_flags_set_header_len(TCP_HEADER_LEN as u8);
        packet.set_ack(true);
        packet.set_psh(psh);
        packet.set_fin(fin);
        packet.set_window_len(window_len);
        packet.set_urgent_at(0);
        packet.set_checksum(0);
    }

    let offset = seq - pcb.snd_una;
    let first = pcb.snd_buf.peek(offset, seg_len);
    let second = pcb.snd_buf.peek(offset + first.len(), seg_len - first.len());
    debug_assert_eq!(first.len() + second.len(), seg_len);

    let total = TCP_HEADER_LEN + seg_len;
    let chunks = [&hdr[..], first, second];
    let mut accum = ChecksumAccumulator::from_state(pseudo);
    accum.add_word16(total as u16);
    accum.add_ip_buf(BufRef::new(&chunks, 0, total));
    NetworkEndian::write_u16(&mut hdr[16..18], accum.checksum());

    let chunks = [&hdr[..], first, second];
    ip.send_fast(prep, BufRef::new(&chunks, 0, total), None)
}

enum SendError {
    Retriable(IpErr),
    Fatal,
}

/// Drain the send pipeline of one connection.
///
/// Emits as many segments as the send queue, the peer window and the
/// congestion window allow. Sub-MSS tails outside the pushed region are
/// delayed on the output timer unless `from_timer` says that timer has
/// already fired. Ends with a bare ACK when input wanted one and no data
/// segment carried it.
pub(crate) fn pcb_output<D: IpDriver>(
    tcp: &mut TcpProto,
    ip: &mut Ip4Stack<D>,
    timers: &mut TimerQueue,
    pcb_id: PcbId,
    from_timer: bool,
) {
    let now = ip.now();
    let (out_ticks, retry_full, retry_other) = {
        let config = ip.config();
        (
            config.tcp_output_timer_ticks,
            config.tcp_output_retry_full_ticks,
            config.tcp_output_retry_other_ticks,
        )
    };

    let (local_addr, remote_addr) = {
        let pcb = tcp.table.pcb_mut(pcb_id);
        if !pcb.state.can_output() {
            if pcb.flags.has(PcbFlags::ACK_PENDING) && pcb.state.is_synchronized() {
                send_empty_ack(ip, pcb);
            }
            return;
        }
        // An abandoned connection may emit nothing but a residual FIN.
        if !pcb.con_active && !pcb.flags.has(PcbFlags::FIN_PENDING) && !pcb.fin_outstanding() {
            return;
        }
        (pcb.local_addr, pcb.remote_addr)
    };

    let prep = match ip.prepare(
        local_addr,
        remote_addr,
        TCP_TTL,
        IpProtocol::Tcp,
        None,
        TCP_SEND_FLAGS,
    ) {
        Ok(prep) => prep,
        Err(err) => {
            net_debug!("tcp: no route for output ({}), aborting", err);
            tcp.abort_pcb(ip, timers, pcb_id, false);
            return;
        }
    };

    let mut fatal = false;
    {
        let pcb = tcp.table.pcb_mut(pcb_id);
        let pseudo = pseudo_partial(pcb);

        let mut sent_any = false;
        let mut error: Option<SendError> = None;
        loop {
            let mss = pcb.snd_mss as usize;
            let wnd_cap = pcb.snd_wnd.min(pcb.cwnd);
            let rem_wnd = wnd_cap.saturating_sub(pcb.flight());
            let avail = pcb.unsent();
            let seg_len = avail.min(rem_wnd).min(mss);
            let drains_queue = seg_len == avail;
            let fin = pcb.flags.has(PcbFlags::FIN_PENDING)
                && drains_queue
                && rem_wnd > seg_len;
            if seg_len == 0 && !fin {
                if pcb.snd_wnd == 0
                    && (avail > 0 || pcb.flags.has(PcbFlags::FIN_PENDING))
                    && pcb.flight() == 0
                    && !pcb.flags.has(PcbFlags::RTX_ACTIVE)
                {
                    // Zero window with data waiting: arm the probe.
                    timers.set(pcb.rtx_timer, now + pcb.rto);
                    pcb.flags.set(PcbFlags::RTX_ACTIVE);
                    pcb.flags.clear(PcbFlags::IDLE_TIMER);
                }
                break;
            }
            // Sub-MSS tail outside the pushed region: wait briefly for
            // more data instead of sending a small segment.
            if drains_queue
                && seg_len < mss
                && seg_len > 0
                && !fin
                && !pcb.flags.has(PcbFlags::FIN_PENDING)
                && !pcb.in_push_range()
                && !from_timer
            {
                if !pcb.flags.has(PcbFlags::OUT_PENDING) {
                    timers.set(pcb.out_timer, now + out_ticks);
                    pcb.flags.set(PcbFlags::OUT_PENDING);
                }
                break;
            }

            let seq = pcb.snd_una + pcb.snd_cur;
            let is_rtx = seq < pcb.snd_nxt;
            let psh = fin
                || drains_queue
                || (pcb.snd_psh_index > pcb.snd_cur
                    && pcb.snd_cur + seg_len >= pcb.snd_psh_index);
            let window_len = announce_window(pcb);
            match send_data_segment(ip, pcb, &prep, pseudo, seq, seg_len, fin, psh, window_len) {
                Ok(()) => {
                    sent_any = true;
                    if seg_len > 0 && !is_rtx && !pcb.flags.has(PcbFlags::RTT_PENDING) {
                        pcb.rtt_test_seq = seq;
                        pcb.rtt_test_time = now;
                        pcb.flags.set(PcbFlags::RTT_PENDING);
                    }
                    pcb.snd_cur += seg_len;
                    let mut end = seq + seg_len;
                    if fin {
                        pcb.flags.clear(PcbFlags::FIN_PENDING);
                        pcb.flags.set(PcbFlags::FIN_SENT);
                        end = end + 1;
                    }
                    if end > pcb.snd_nxt {
                        pcb.snd_nxt = end;
                    }
                    if !pcb.flags.has(PcbFlags::RTX_ACTIVE)
                        || pcb.flags.has(PcbFlags::IDLE_TIMER)
                    {
                        timers.set(pcb.rtx_timer, now + pcb.rto);
                        pcb.flags.set(PcbFlags::RTX_ACTIVE);
                        pcb.flags.clear(PcbFlags::IDLE_TIMER);
                    }
                    if fin {
                        break;
                    }
                }
                Err(IpErr::FragmentationNeeded) => {
                    // The path shrank under us; clamp and retry with the
                    // smaller MSS, or back off if that changes nothing.
                    let remote = pcb.remote_addr;
                    let old_mss = pcb.snd_mss;
                    if let Some(pmtu) = ip.handle_local_packet_too_big(remote) {
                        let new_mss = compute_snd_mss(pcb.base_snd_mss, pmtu);
                        if new_mss < old_mss {
                            pcb.snd_mss = new_mss;
                            pcb.cwnd = pcb.cwnd.max(new_mss as usize);
                            pcb.ssthresh = pcb.ssthresh.max(new_mss as usize);
                            continue;
                        }
                    }
                    error = Some(SendError::Retriable(IpErr::FragmentationNeeded));
                    break;
                }
                Err(err) if err.is_retriable() => {
                    error = Some(SendError::Retriable(err));
                    break;
                }
                Err(err) => {
                    net_debug!("tcp: output failed: {}", err);
                    error = Some(SendError::Fatal);
                    break;
                }
            }
        }

        match error {
            Some(SendError::Retriable(err)) => {
                let delay = if err == IpErr::OutputBufferFull {
                    retry_full
                } else {
                    retry_other
                };
                timers.set(pcb.out_timer, now + delay);
                pcb.flags.set(PcbFlags::OUT_RETRY);
            }
            Some(SendError::Fatal) => fatal = true,
            None => (),
        }

        if sent_any {
            pcb.flags.clear(PcbFlags::ACK_PENDING);
        } else if pcb.flags.has(PcbFlags::ACK_PENDING) {
            send_empty_ack(ip, pcb);
        }
    }

    if fatal {
        tcp.abort_pcb(ip, timers, pcb_id, false);
    }
}

/// Retransmit one segment from the head of the send queue (the oldest
/// unacknowledged data), FIN included when it is the only thing left.
fn retransmit_head<D: IpDriver>(ip: &mut Ip4Stack<D>, pcb: &mut Pcb) {
    let mss = pcb.snd_mss as usize;
    let seg_len = pcb.snd_buf.len().min(mss);
    let fin = pcb.flags.has(PcbFlags::FIN_SENT)
        && pcb.fin_outstanding()
        && seg_len == pcb.snd_buf.len();
    if seg_len == 0 && !fin {
        return;
    }
    let prep = match ip.prepare(
        pcb.local_addr,
        pcb.remote_addr,
        TCP_TTL,
        IpProtocol::Tcp,
        None,
        TCP_SEND_FLAGS,
    ) {
        Ok(prep) => prep,
        Err(_) => return,
    };
    let pseudo = pseudo_partial(pcb);
    let window_len = announce_window(pcb);
    let seq = pcb.snd_una;
    if let Err(err) =
        send_data_segment(ip, pcb, &prep, pseudo, seq, seg_len, fin, true, window_len)
    {
        net_debug!("tcp: retransmit failed: {}", err);
    }
}

/// Process an acceptable ACK advancing `snd_una`. Returns whether our FIN
/// was acknowledged by it.
pub(crate) fn handle_acked<D: IpDriver>(
    tcp: &mut TcpProto,
    ip: &mut Ip4Stack<D>,
    timers: &mut TimerQueue,
    pcb_id: PcbId,
    ack: TcpSeqNumber,
) -> bool {
    let now = ip.now();
    let (min_rtx, max_rtx) = {
        let config = ip.config();
        (config.tcp_min_rtx_time, config.tcp_max_rtx_time)
    };
    let pcb = tcp.table.pcb_mut(pcb_id);
    let mss = pcb.snd_mss as usize;

    let acked = ack - pcb.snd_una;
    let data_acked = acked.min(pcb.snd_buf.len());
    let fin_acked = pcb.flags.has(PcbFlags::FIN_SENT) && acked > data_acked;

    pcb.snd_una = ack;
    pcb.snd_buf.dequeue_advance(data_acked);
    pcb.snd_cur = pcb.snd_cur.saturating_sub(data_acked);
    pcb.snd_psh_index = pcb.snd_psh_index.saturating_sub(data_acked);

    // One RTT sample at a time; discard it if the timed byte was part of
    // a retransmission episode.
    if pcb.flags.has(PcbFlags::RTT_PENDING) && ack > pcb.rtt_test_seq {
        let sample = now - pcb.rtt_test_time;
        pcb.update_rtt(sample.total_millis() as u32, min_rtx, max_rtx);
        pcb.flags.clear(PcbFlags::RTT_PENDING);
    }
    pcb.rtx_count = 0;

    if pcb.flags.has(PcbFlags::RECOVER) {
        if ack >= pcb.recover {
            // Full acknowledgment: deflate and leave recovery.
            let flight = pcb.seq_flight();
            pcb.cwnd = pcb.ssthresh.min(mss + flight.max(mss));
            pcb.flags.clear(PcbFlags::RECOVER);
            pcb.num_dupack = 0;
        } else {
            // Partial acknowledgment: retransmit the next hole and
            // partially deflate.
            retransmit_head(ip, pcb);
            let deflate = acked.min(pcb.cwnd.saturating_sub(mss));
            pcb.cwnd -= deflate;
            if acked >= mss {
                pcb.cwnd += mss;
            }
        }
    } else {
        pcb.num_dupack = 0;
        if pcb.cwnd < pcb.ssthresh {
            // Slow start.
            pcb.cwnd += acked.min(mss);
        } else {
            // Congestion avoidance, one MSS per window's worth of ACKs.
            pcb.cwnd_acked += acked;
            if pcb.cwnd_acked >= pcb.cwnd {
                pcb.cwnd_acked = 0;
                pcb.cwnd += mss;
            }
        }
        pcb.flags.set(PcbFlags::CWND_INCRD);
    }

    if pcb.seq_flight() == 0 {
        // Everything delivered: the rtx timer becomes the idle timer.
        timers.set(pcb.rtx_timer, now + pcb.rto);
        pcb.flags.set(PcbFlags::IDLE_TIMER);
        pcb.flags.clear(PcbFlags::RTX_ACTIVE);
    } else {
        timers.set(pcb.rtx_timer, now + pcb.rto);
        pcb.flags.set(PcbFlags::RTX_ACTIVE);
        pcb.flags.clear(PcbFlags::IDLE_TIMER);
    }

    fin_acked
}

/// Feed the duplicate-ACK counter; the third one triggers NewReno fast
/// retransmit unless `recover` is still ahead of `snd_una`.
pub(crate) fn handle_dup_ack<D: IpDriver>(
    tcp: &mut TcpProto,
    ip: &mut Ip4Stack<D>,
    timers: &mut TimerQueue,
    pcb_id: PcbId,
) {
    {
        let pcb = tcp.table.pcb_mut(pcb_id);
        let mss = pcb.snd_mss as usize;
        pcb.num_dupack = pcb.num_dupack.saturating_add(1);
        if pcb.num_dupack == super::DUP_ACK_THRESHOLD {
            if pcb.flags.has(PcbFlags::RECOVER) || pcb.recover > pcb.snd_una {
                return;
            }
            let flight = pcb.seq_flight();
            pcb.ssthresh = (flight / 2).max(2 * mss);
            retransmit_head(ip, pcb);
            pcb.cwnd = pcb.ssthresh + 3 * mss;
            pcb.recover = pcb.snd_nxt;
            pcb.flags.set(PcbFlags::RECOVER);
            return;
        } else if pcb.num_dupack > super::DUP_ACK_THRESHOLD
            && pcb.flags.has(PcbFlags::RECOVER)
        {
            // Each further duplicate inflates the window by one segment.
            pcb.cwnd += mss;
        } else {
            return;
        }
    }
    // Inflation may have opened room for new data.
    pcb_output(tcp, ip, timers, pcb_id, false);
}

/// Shrink (or restore) the effective send MSS after a path-MTU change.
pub(crate) fn pcb_update_snd_mss<D: IpDriver>(
    tcp: &mut TcpProto,
    ip: &mut Ip4Stack<D>,
    timers: &mut TimerQueue,
    pcb_id: PcbId,
    pmtu: u16,
) {
    let shrunk = {
        let pcb = tcp.table.pcb_mut(pcb_id);
        let new_mss = compute_snd_mss(pcb.base_snd_mss, pmtu);
        let shrunk = new_mss < pcb.snd_mss;
        if new_mss != pcb.snd_mss {
            pcb.snd_mss = new_mss;
        }
        if shrunk {
            // Keep the congestion variables above the new segment size.
            pcb.cwnd = pcb.cwnd.max(new_mss as usize);
            pcb.ssthresh = pcb.ssthresh.max(new_mss as usize);
        }
        shrunk
    };
    if shrunk {
        // Smaller segments may fit the path where the last ones did not.
        pcb_output(tcp, ip, timers, pcb_id, true);
    }
}

/// The short output timer fired: a delayed sub-MSS send or a driver retry.
pub(crate) fn out_timer_handler<D: IpDriver>(
    tcp: &mut TcpProto,
    ip: &mut Ip4Stack<D>,
    timers: &mut TimerQueue,
    pcb_id: PcbId,
) {
    {
        let pcb = tcp.table.pcb_mut(pcb_id);
        pcb.flags.clear(PcbFlags::OUT_PENDING);
        pcb.flags.clear(PcbFlags::OUT_RETRY);
    }
    pcb_output(tcp, ip, timers, pcb_id, true);
}

/// Send a one-byte window probe from the head of the send queue.
fn send_window_probe<D: IpDriver>(ip: &mut Ip4Stack<D>, pcb: &mut Pcb) {
    let seg_len = pcb.snd_buf.len().min(1);
    let fin = seg_len == 0 && pcb.flags.has(PcbFlags::FIN_PENDING);
    if seg_len == 0 && !fin {
        return;
    }
    let prep = match ip.prepare(
        pcb.local_addr,
        pcb.remote_addr,
        TCP_TTL,
        IpProtocol::Tcp,
        None,
        TCP_SEND_FLAGS,
    ) {
        Ok(prep) => prep,
        Err(_) => return,
    };
    let pseudo = pseudo_partial(pcb);
    let window_len = announce_window(pcb);
    let seq = pcb.snd_una;
    if let Err(err) =
        send_data_segment(ip, pcb, &prep, pseudo, seq, seg_len, fin, true, window_len)
    {
        net_debug!("tcp: window probe not sent: {}", err);
        return;
    }
    if fin {
        pcb.flags.clear(PcbFlags::FIN_PENDING);
        pcb.flags.set(PcbFlags::FIN_SENT);
    }
    let end = seq + seg_len + if fin { 1 } else { 0 };
    if end > pcb.snd_nxt {
        pcb.snd_nxt = end;
    }
    if pcb.snd_cur == 0 && seg_len > 0 {
        pcb.snd_cur = seg_len;
    }
}

/// The retransmission timer fired. Depending on state and flags this is
/// the SYN retransmit, the TIME_WAIT or FIN_WAIT_2 expiry, the idle-window
/// reset, the zero-window probe, or a data retransmission.
pub(crate) fn rtx_timer_handler<D: IpDriver>(
    tcp: &mut TcpProto,
    ip: &mut Ip4Stack<D>,
    timers: &mut TimerQueue,
    pcb_id: PcbId,
) {
    let now = ip.now();
    let (max_rtx_time, max_syn_rtx, max_rtx) = {
        let config = ip.config();
        (
            config.tcp_max_rtx_time,
            config.tcp_max_syn_rtx,
            config.tcp_max_rtx,
        )
    };

    enum Action {
        Done,
        Free,
        Abort,
        Resend,
    }

    let action = {
        let pcb = tcp.table.pcb_mut(pcb_id);
        pcb.flags.clear(PcbFlags::RTX_ACTIVE);
        match pcb.state {
            State::TimeWait | State::FinWait2 => Action::Free,
            State::SynSent | State::SynReceived => {
                pcb.rtx_count += 1;
                if pcb.rtx_count > max_syn_rtx {
                    Action::Abort
                } else {
                    pcb.rto = (pcb.rto * 2).min(max_rtx_time);
                    pcb.flags.clear(PcbFlags::RTT_PENDING);
                    Action::Resend
                }
            }
            _ if pcb.flags.has(PcbFlags::IDLE_TIMER) => {
                // Quiescent past RTO: restart from the initial window.
                pcb.flags.clear(PcbFlags::IDLE_TIMER);
                if pcb.flags.has(PcbFlags::CWND_INCRD) {
                    pcb.cwnd = Pcb::initial_cwnd(pcb.snd_mss);
                    pcb.cwnd_acked = 0;
                    pcb.flags.clear(PcbFlags::CWND_INCRD);
                }
                Action::Done
            }
            _ if pcb.snd_wnd == 0
                && (pcb.snd_buf.len() > 0 || pcb.flags.has(PcbFlags::FIN_PENDING)) =>
            {
                // Zero-window probe; backed off on the same schedule as
                // data retransmission.
                send_window_probe(ip, pcb);
                pcb.rto = (pcb.rto * 2).min(max_rtx_time);
                timers.set(pcb.rtx_timer, now + pcb.rto);
                pcb.flags.set(PcbFlags::RTX_ACTIVE);
                Action::Done
            }
            _ if pcb.seq_flight() > 0 => {
                pcb.rtx_count += 1;
                if pcb.rtx_count > max_rtx {
                    Action::Abort
                } else {
                    let mss = pcb.snd_mss as usize;
                    if pcb.rtx_count == 1 {
                        pcb.ssthresh = (pcb.seq_flight() / 2).max(2 * mss);
                    }
                    pcb.cwnd = mss;
                    pcb.recover = pcb.snd_nxt;
                    pcb.flags.clear(PcbFlags::RECOVER);
                    pcb.num_dupack = 0;
                    pcb.cwnd_acked = 0;
                    // Requeue everything and resend from the head.
                    let fin_unacked = pcb.fin_outstanding();
                    pcb.snd_cur = 0;
                    if fin_unacked {
                        pcb.flags.clear(PcbFlags::FIN_SENT);
                        pcb.flags.set(PcbFlags::FIN_PENDING);
                    }
                    pcb.flags.clear(PcbFlags::RTT_PENDING);
                    pcb.rto = (pcb.rto * 2).min(max_rtx_time);
                    timers.set(pcb.rtx_timer, now + pcb.rto);
                    pcb.flags.set(PcbFlags::RTX_ACTIVE);
                    Action::Resend
                }
            }
            _ => Action::Done,
        }
    };

    match action {
        Action::Done => (),
        Action::Free => {
            tcp.terminate_pcb(timers, pcb_id, false);
        }
        Action::Abort => {
            net_debug!("tcp: retransmission limit reached, aborting");
            tcp.abort_pcb(ip, timers, pcb_id, true);
        }
        Action::Resend => {
            let state = tcp.table.pcb(pcb_id).state;
            if matches!(state, State::SynSent | State::SynReceived) {
                send_syn(tcp, ip, timers, pcb_id);
            } else {
                pcb_output(tcp, ip, timers, pcb_id, true);
            }
        }
    }
}
