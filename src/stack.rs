/*! One struct wiring the layers to a single event loop.

[NetStack] owns the IPv4 engine, the TCP machine and the timer queue, and
exposes the three calls an event loop needs: feed a received frame in,
dispatch expired timers, and ask when the next deadline is. Everything
else (listeners, connections, raw sends) goes through the [ip] and [tcp]
fields directly; they are deliberately public because the layers borrow
independently.

[ip]: crate::ip::Ip4Stack
[tcp]: crate::tcp::TcpProto
*/

use crate::config::StackConfig;
use crate::event::TimerQueue;
use crate::iface::{Iface, IfaceId, IpDriver};
use crate::ip::{Ip4Stack, RecvOutcome};
use crate::tcp::TcpProto;
use crate::time::Instant;
use crate::wire::IpProtocol;

pub struct NetStack<D: IpDriver> {
    pub ip: Ip4Stack<D>,
    pub tcp: TcpProto,
    pub timers: TimerQueue,
}

impl<D: IpDriver> NetStack<D> {
    pub fn new(config: StackConfig, seed: u64) -> NetStack<D> {
        NetStack {
            tcp: TcpProto::new(&config, seed ^ 0x9e37_79b9),
            ip: Ip4Stack::new(config, seed),
            timers: TimerQueue::new(),
        }
    }

    pub fn add_iface(&mut self, iface: Iface<D>) -> IfaceId {
        self.ip.add_iface(iface)
    }

    /// Feed one received IPv4 packet (header and payload) into the stack.
    pub fn process_frame(&mut self, now: Instant, iface: IfaceId, pkt: &[u8]) {
        self.ip.set_now(now);
        match self.ip.process_recv(iface, pkt) {
            RecvOutcome::Consumed => (),
            RecvOutcome::Transport {
                iface,
                src_addr,
                dst_addr,
                proto,
                payload,
            } => {
                if proto == IpProtocol::Tcp {
                    self.tcp.process(
                        &mut self.ip,
                        &mut self.timers,
                        iface,
                        src_addr,
                        dst_addr,
                        &payload,
                    );
                } else {
                    net_trace!("stack: no handler for {}", proto);
                }
            }
            RecvOutcome::DstUnreachable {
                inner,
                transport,
                new_pmtu,
                ..
            } => {
                self.tcp.handle_dst_unreachable(
                    &mut self.ip,
                    &mut self.timers,
                    &inner,
                    &transport,
                    new_pmtu,
                );
            }
        }
    }

    /// Run expired timers and age the reassembly table. Opens the pass by
    /// resetting any connection the embedder left unaccepted since input
    /// was processed.
    pub fn poll(&mut self, now: Instant) {
        self.ip.set_now(now);
        self.tcp.abort_unaccepted(&mut self.ip, &mut self.timers);
        self.ip.poll_reassembly();
        self.timers.start_dispatch(now);
        while let Some(token) = self.timers.next_expired() {
            if !self.tcp.handle_timer(&mut self.ip, &mut self.timers, token) {
                net_trace!("stack: unowned timer fired");
            }
        }
        self.timers.finish_dispatch();
    }

    /// The instant [poll] next has work to do.
    ///
    /// [poll]: #method.poll
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.timers.next_deadline(), self.ip.reassembly_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, None) => a,
            (None, b) => b,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::iface::HwType;
    use crate::tcp::pcb::Pcb;
    use crate::tcp::{ConnectOptions, ListenOptions, State};
    use crate::testutil::{CapturedFrames, MockDriver};
    use crate::time::Duration;
    use crate::wire::{
        Icmpv4DstUnreachable, Icmpv4Packet, Icmpv4Repr, IpProtocol, Ipv4Address, Ipv4Cidr,
        Ipv4Packet, Ipv4Repr, TcpControl, TcpPacket, TcpRepr, TcpSeqNumber,
    };
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const A_ADDR: Ipv4Address = Ipv4Address::new(10, 0, 0, 1);
    const B_ADDR: Ipv4Address = Ipv4Address::new(10, 0, 0, 2);

    fn make_stack(addr: Ipv4Address, mtu: u16, seed: u64) -> (NetStack<MockDriver>, IfaceId, CapturedFrames) {
        let mut stack = NetStack::new(StackConfig::default(), seed);
        let (driver, sent) = MockDriver::new();
        let mut iface = Iface::new(driver, HwType::Ethernet, mtu);
        iface.set_addr(Some(Ipv4Cidr::new(addr, 24)));
        let id = stack.add_iface(iface);
        (stack, id, sent)
    }

    /// A parsed view of one captured TCP frame.
    #[derive(Debug, Clone)]
    struct Seg {
        src_port: u16,
        dst_port: u16,
        seq: TcpSeqNumber,
        ack: Option<TcpSeqNumber>,
        syn: bool,
        fin: bool,
        rst: bool,
        window: u16,
        mss: Option<u16>,
        wscale: Option<u8>,
        payload: Vec<u8>,
    }

    fn parse_seg(frame: &[u8]) -> Option<Seg> {
        let ip = Ipv4Packet::new_checked(frame).ok()?;
        if ip.next_header() != IpProtocol::Tcp {
            return None;
        }
        let tcp = TcpPacket::new_checked(ip.payload()).ok()?;
        let mut mss = None;
        let mut wscale = None;
        let mut options = tcp.options();
        while let Ok((rest, option)) = crate::wire::TcpOption::parse(options) {
            match option {
                crate::wire::TcpOption::EndOfList => break,
                crate::wire::TcpOption::MaxSegmentSize(value) => mss = Some(value),
                crate::wire::TcpOption::WindowScale(value) => wscale = Some(value),
                _ => (),
            }
            if rest.is_empty() {
                break;
            }
            options = rest;
        }
        Some(Seg {
            src_port: tcp.src_port(),
            dst_port: tcp.dst_port(),
            seq: tcp.seq_number(),
            ack: tcp.ack().then(|| tcp.ack_number()),
            syn: tcp.syn(),
            fin: tcp.fin(),
            rst: tcp.rst(),
            window: tcp.window_len(),
            mss,
            wscale,
            payload: tcp.payload().to_vec(),
        })
    }

    /// Build one raw IPv4+TCP frame as a scripted peer would send it.
    #[allow(clippy::too_many_arguments)]
    fn peer_frame(
        src: (Ipv4Address, u16),
        dst: (Ipv4Address, u16),
        control: TcpControl,
        seq: TcpSeqNumber,
        ack: Option<TcpSeqNumber>,
        window: u16,
        mss: Option<u16>,
        wscale: Option<u8>,
        payload: &[u8],
    ) -> Vec<u8> {
        let repr = TcpRepr {
            src_port: src.1,
            dst_port: dst.1,
            control,
            seq_number: seq,
            ack_number: ack,
            window_len: window,
            max_seg_size: mss,
            window_scale: wscale,
            payload,
        };
        let mut frame = vec![0u8; 20 + repr.buffer_len()];
        let header = Ipv4Repr {
            src_addr: src.0,
            dst_addr: dst.0,
            next_header: IpProtocol::Tcp,
            payload_len: repr.buffer_len(),
            hop_limit: 64,
        };
        let mut packet = Ipv4Packet::new_unchecked(&mut frame[..]);
        header.emit(&mut packet);
        let mut tcp = TcpPacket::new_unchecked(packet.payload_mut());
        repr.emit(&mut tcp, &src.0, &dst.0);
        frame
    }

    fn drain(frames: &CapturedFrames) -> Vec<Seg> {
        frames
            .borrow_mut()
            .drain(..)
            .filter_map(|(bytes, _)| parse_seg(&bytes))
            .collect()
    }

    /// A stack under test with a hand-scripted remote endpoint.
    struct Scripted {
        stack: NetStack<MockDriver>,
        iface: IfaceId,
        sent: CapturedFrames,
        now: Instant,
        local_port: u16,
        peer_port: u16,
        peer_seq: TcpSeqNumber,
        peer_rcv_nxt: TcpSeqNumber,
    }

    impl Scripted {
        fn inject(&mut self, control: TcpControl, payload: &[u8], window: u16) {
            let frame = peer_frame(
                (B_ADDR, self.peer_port),
                (A_ADDR, self.local_port),
                control,
                self.peer_seq,
                Some(self.peer_rcv_nxt),
                window,
                None,
                None,
                payload,
            );
            self.peer_seq += payload.len() + control.len_in_seq();
            self.stack.process_frame(self.now, self.iface, &frame);
        }

        fn inject_ack(&mut self, ack: TcpSeqNumber, window: u16) {
            let frame = peer_frame(
                (B_ADDR, self.peer_port),
                (A_ADDR, self.local_port),
                TcpControl::None,
                self.peer_seq,
                Some(ack),
                window,
                None,
                None,
                &[],
            );
            self.stack.process_frame(self.now, self.iface, &frame);
        }

        fn advance(&mut self, millis: u64) {
            let until = self.now + Duration::from_millis(millis);
            while self.now < until {
                self.now += Duration::from_millis(1);
                self.stack.poll(self.now);
            }
        }
    }

    /// Drive the client side of a handshake against a scripted peer and
    /// return the established connection.
    fn scripted_client() -> (Scripted, crate::tcp::PcbId) {
        let (mut stack, iface, sent) = make_stack(A_ADDR, 1500, 11);
        let now = Instant::ZERO;
        stack.ip.set_now(now);
        let conn = stack
            .tcp
            .connect(
                &mut stack.ip,
                &mut stack.timers,
                B_ADDR,
                4000,
                ConnectOptions::default(),
            )
            .unwrap();

        let syns = drain(&sent);
        assert_eq!(syns.len(), 1);
        let syn = &syns[0];
        assert!(syn.syn && syn.ack.is_none());
        assert!(syn.mss.is_some());
        // Window scaling is always offered, and the SYN window is unscaled.
        assert!(syn.wscale.is_some());
        assert!(syn.window > 0);

        let mut scripted = Scripted {
            stack,
            iface,
            sent,
            now,
            local_port: syn.src_port,
            peer_port: 4000,
            peer_seq: TcpSeqNumber(90_000),
            peer_rcv_nxt: syn.seq + 1,
        };
        // SYN-ACK without a window-scale option: shifts stay zero.
        let frame = peer_frame(
            (B_ADDR, scripted.peer_port),
            (A_ADDR, scripted.local_port),
            TcpControl::Syn,
            scripted.peer_seq,
            Some(scripted.peer_rcv_nxt),
            0xffff,
            Some(1460),
            None,
            &[],
        );
        scripted.peer_seq += 1;
        scripted
            .stack
            .process_frame(scripted.now, scripted.iface, &frame);
        assert_eq!(scripted.stack.tcp.state(conn), State::Established);
        // The handshake-completing ACK.
        let acks = drain(&scripted.sent);
        assert!(acks.iter().any(|seg| seg.ack == Some(scripted.peer_seq)));
        (scripted, conn)
    }

    #[test]
    fn test_scripted_handshake_mss() {
        let (scripted, conn) = scripted_client();
        let pcb = scripted.stack.tcp.table.pcb(conn);
        // 1460 from the peer option, within MTU - 40.
        assert_eq!(pcb.snd_mss, 1460);
        assert_eq!(pcb.snd_wnd, 0xffff);
        assert_eq!(pcb.rcv_wnd_shift, 0);
        assert_eq!(pcb.snd_wnd_shift, 0);
    }

    #[test]
    fn test_peer_data_and_close() {
        let (mut scripted, conn) = scripted_client();

        scripted.inject(TcpControl::Psh, b"hello", 0xffff);
        let mut buf = [0u8; 16];
        let read = scripted.stack.tcp.recv(&mut scripted.stack.ip, conn, &mut buf);
        assert_eq!(&buf[..read], b"hello");
        assert!(drain(&scripted.sent)
            .iter()
            .any(|seg| seg.ack == Some(scripted.peer_seq)));

        // The peer closes; we land in CLOSE_WAIT with the stream drained.
        scripted.inject(TcpControl::Fin, &[], 0xffff);
        assert_eq!(scripted.stack.tcp.state(conn), State::CloseWait);
        assert!(scripted.stack.tcp.recv_finished(conn));

        // Our close emits the FIN; the peer's ACK of it ends the
        // connection without a reset.
        scripted.stack.tcp.close(
            &mut scripted.stack.ip,
            &mut scripted.stack.timers,
            conn,
        );
        assert_eq!(scripted.stack.tcp.state(conn), State::LastAck);
        let fin_seg = drain(&scripted.sent)
            .into_iter()
            .find(|seg| seg.fin)
            .expect("no fin emitted");
        scripted.inject_ack(fin_seg.seq + 1, 0xffff);
        assert_eq!(scripted.stack.tcp.state(conn), State::Closed);
        assert!(!scripted.stack.tcp.was_reset(conn));
    }

    #[test]
    fn test_fast_recovery_enter_and_exit() {
        let (mut scripted, conn) = scripted_client();
        let mss = 1460usize;

        // Fill enough to keep several segments in flight.
        let data = vec![0x42u8; 6 * mss];
        let queued = scripted.stack.tcp.send(
            &mut scripted.stack.ip,
            &mut scripted.stack.timers,
            conn,
            &data,
        );
        assert_eq!(queued, data.len());
        scripted.stack.tcp.send_push(
            &mut scripted.stack.ip,
            &mut scripted.stack.timers,
            conn,
        );

        // Initial window is three segments.
        let segs = drain(&scripted.sent);
        assert_eq!(segs.len(), 3);
        let first_seq = segs[0].seq;
        let flight = {
            let pcb = scripted.stack.tcp.table.pcb(conn);
            assert_eq!(pcb.flight(), 3 * mss);
            pcb.seq_flight()
        };

        // Three duplicate ACKs for the first byte.
        for _ in 0..3 {
            scripted.inject_ack(first_seq, 0xffff);
        }
        let rtx: Vec<Seg> = drain(&scripted.sent)
            .into_iter()
            .filter(|seg| !seg.payload.is_empty())
            .collect();
        assert!(rtx.iter().any(|seg| seg.seq == first_seq), "head retransmitted");

        let (ssthresh, cwnd, recover, snd_nxt) = {
            let pcb = scripted.stack.tcp.table.pcb(conn);
            (pcb.ssthresh, pcb.cwnd, pcb.recover, pcb.snd_nxt)
        };
        assert_eq!(ssthresh, (flight / 2).max(2 * mss));
        assert_eq!(cwnd, ssthresh + 3 * mss);
        // `recover` froze at the highest sequence sent when recovery was
        // entered; the inflated window may have sent new data past it.
        assert_eq!(recover, first_seq + 3 * mss);
        assert!(recover <= snd_nxt);

        // A full ACK deflates and exits recovery.
        scripted.inject_ack(snd_nxt, 0xffff);
        let pcb = scripted.stack.tcp.table.pcb(conn);
        assert_eq!(pcb.cwnd, ssthresh.min(2 * mss));
        assert_eq!(pcb.num_dupack, 0);
    }

    #[test]
    fn test_idle_cwnd_reset() {
        let (mut scripted, conn) = scripted_client();
        let mss = 1460usize;

        let data = vec![1u8; 2 * mss];
        scripted.stack.tcp.send(
            &mut scripted.stack.ip,
            &mut scripted.stack.timers,
            conn,
            &data,
        );
        let segs = drain(&scripted.sent);
        assert_eq!(segs.len(), 2);

        // Acknowledge everything; the connection grows its window and
        // goes quiet.
        let end = {
            let pcb = scripted.stack.tcp.table.pcb(conn);
            pcb.snd_nxt
        };
        scripted.inject_ack(end, 0xffff);
        let grown = scripted.stack.tcp.table.pcb(conn).cwnd;
        assert!(grown > Pcb::initial_cwnd(1460));

        // Idle past the RTO; the next send starts from the initial window.
        scripted.advance(5_000);
        let pcb = scripted.stack.tcp.table.pcb(conn);
        assert_eq!(pcb.cwnd, Pcb::initial_cwnd(1460));
    }

    #[test]
    fn test_zero_window_probe() {
        let (mut scripted, conn) = scripted_client();

        // The peer slams the window shut.
        scripted.inject_ack(
            {
                let pcb = scripted.stack.tcp.table.pcb(conn);
                pcb.snd_nxt
            },
            0,
        );
        let data = vec![9u8; 500];
        scripted.stack.tcp.send(
            &mut scripted.stack.ip,
            &mut scripted.stack.timers,
            conn,
            &data,
        );
        scripted.stack.tcp.send_push(
            &mut scripted.stack.ip,
            &mut scripted.stack.timers,
            conn,
        );
        assert!(drain(&scripted.sent).iter().all(|seg| seg.payload.is_empty()));

        // The rtx timer fires as a window probe carrying one byte.
        scripted.advance(5_000);
        let probes: Vec<Seg> = drain(&scripted.sent)
            .into_iter()
            .filter(|seg| !seg.payload.is_empty())
            .collect();
        assert!(!probes.is_empty());
        assert!(probes.iter().all(|seg| seg.payload.len() == 1));

        // Opening the window releases the rest.
        scripted.inject_ack(
            {
                let pcb = scripted.stack.tcp.table.pcb(conn);
                pcb.snd_una
            },
            0xffff,
        );
        let segs = drain(&scripted.sent);
        assert!(segs.iter().map(|seg| seg.payload.len()).sum::<usize>() >= 499);
    }

    #[test]
    fn test_pmtu_clamps_mss() {
        let (mut scripted, conn) = scripted_client();
        assert_eq!(scripted.stack.tcp.table.pcb(conn).snd_mss, 1460);

        // An ICMP Frag-Required quoting our connection, hinting 1000.
        let mut embedded = vec![0u8; 28];
        {
            let inner = Ipv4Repr {
                src_addr: A_ADDR,
                dst_addr: B_ADDR,
                next_header: IpProtocol::Tcp,
                payload_len: 8,
                hop_limit: 64,
            };
            inner.emit(&mut Ipv4Packet::new_unchecked(&mut embedded[..]));
        }
        let unreach = Icmpv4Repr::DstUnreachable {
            reason: Icmpv4DstUnreachable::FragRequired,
            mtu: 1000,
            data: &embedded,
        };
        let mut frame = vec![0u8; 20 + unreach.buffer_len()];
        {
            let header = Ipv4Repr {
                src_addr: Ipv4Address::new(10, 0, 0, 254),
                dst_addr: A_ADDR,
                next_header: IpProtocol::Icmp,
                payload_len: unreach.buffer_len(),
                hop_limit: 64,
            };
            let mut packet = Ipv4Packet::new_unchecked(&mut frame[..]);
            header.emit(&mut packet);
            let mut icmp = Icmpv4Packet::new_unchecked(packet.payload_mut());
            unreach.emit(&mut icmp);
        }
        scripted
            .stack
            .process_frame(scripted.now, scripted.iface, &frame);

        let pcb = scripted.stack.tcp.table.pcb(conn);
        assert_eq!(pcb.snd_mss, 1000 - 40);
        assert!(pcb.cwnd >= pcb.snd_mss as usize);
        assert!(pcb.ssthresh >= pcb.snd_mss as usize);
    }

    #[test]
    fn test_listener_quota() {
        let (mut stack, iface, sent) = make_stack(A_ADDR, 1500, 5);
        let now = Instant::ZERO;
        stack.ip.set_now(now);
        let listener = stack
            .tcp
            .listen(
                None,
                80,
                ListenOptions {
                    max_pcbs: 2,
                    ..ListenOptions::default()
                },
            )
            .unwrap();

        // Three SYNs from three remote ports; the third gets no SYN-ACK.
        for port in [5001u16, 5002, 5003] {
            let frame = peer_frame(
                (B_ADDR, port),
                (A_ADDR, 80),
                TcpControl::Syn,
                TcpSeqNumber(1000 + port as u32),
                None,
                4096,
                Some(1460),
                None,
                &[],
            );
            stack.process_frame(now, iface, &frame);
        }
        let syn_acks = drain(&sent);
        let syn_ack_ports: Vec<u16> = syn_acks
            .iter()
            .filter(|seg| seg.syn && seg.ack.is_some())
            .map(|seg| seg.dst_port)
            .collect();
        assert_eq!(syn_ack_ports, [5001, 5002]);

        // Completing the two handshakes fills the accept queue.
        for seg in syn_acks.iter().filter(|seg| seg.syn) {
            let frame = peer_frame(
                (B_ADDR, seg.dst_port),
                (A_ADDR, 80),
                TcpControl::None,
                TcpSeqNumber(1000 + seg.dst_port as u32) + 1,
                Some(seg.seq + 1),
                4096,
                None,
                None,
                &[],
            );
            stack.process_frame(now, iface, &frame);
        }
        let first = stack.tcp.accept(listener).unwrap();
        let second = stack.tcp.accept(listener).unwrap();
        assert!(stack.tcp.accept(listener).is_none());
        assert_eq!(stack.tcp.state(first), State::Established);
        assert_eq!(stack.tcp.state(second), State::Established);
    }

    #[test]
    fn test_unaccepted_connection_aborted() {
        let (mut stack, iface, sent) = make_stack(A_ADDR, 1500, 5);
        let now = Instant::ZERO;
        stack.ip.set_now(now);
        let listener = stack.tcp.listen(None, 80, ListenOptions::default()).unwrap();

        let syn = peer_frame(
            (B_ADDR, 9000),
            (A_ADDR, 80),
            TcpControl::Syn,
            TcpSeqNumber(500),
            None,
            4096,
            Some(1460),
            None,
            &[],
        );
        stack.process_frame(now, iface, &syn);
        let syn_ack = drain(&sent)
            .into_iter()
            .find(|seg| seg.syn)
            .expect("no syn-ack");
        let ack = peer_frame(
            (B_ADDR, 9000),
            (A_ADDR, 80),
            TcpControl::None,
            TcpSeqNumber(501),
            Some(syn_ack.seq + 1),
            4096,
            None,
            None,
            &[],
        );
        stack.process_frame(now, iface, &ack);

        // The embedder never drains the accept queue, so the next pass
        // resets the connection instead of keeping it half-owned.
        stack.poll(now + Duration::from_millis(1));
        let rsts: Vec<Seg> = drain(&sent).into_iter().filter(|seg| seg.rst).collect();
        assert_eq!(rsts.len(), 1);
        assert!(stack.tcp.accept(listener).is_none());

        // The quota slot is released: a fresh SYN gets a SYN-ACK again.
        let syn = peer_frame(
            (B_ADDR, 9001),
            (A_ADDR, 80),
            TcpControl::Syn,
            TcpSeqNumber(800),
            None,
            4096,
            Some(1460),
            None,
            &[],
        );
        stack.process_frame(now, iface, &syn);
        assert!(drain(&sent).iter().any(|seg| seg.syn && seg.ack.is_some()));
    }

    #[test]
    fn test_unmatched_segment_gets_rst() {
        let (mut stack, iface, sent) = make_stack(A_ADDR, 1500, 5);
        let now = Instant::ZERO;
        let frame = peer_frame(
            (B_ADDR, 1234),
            (A_ADDR, 4321),
            TcpControl::None,
            TcpSeqNumber(77),
            Some(TcpSeqNumber(88)),
            100,
            None,
            None,
            b"stray",
        );
        stack.process_frame(now, iface, &frame);
        let segs = drain(&sent);
        assert_eq!(segs.len(), 1);
        assert!(segs[0].rst);
        // RFC 793: the reset takes its sequence number from the ACK field.
        assert_eq!(segs[0].seq, TcpSeqNumber(88));
    }

    // ------------------------------------------------------------------
    // Two full stacks wired back to back over a lossy, delayed link.
    // ------------------------------------------------------------------

    struct TwoStacks {
        a: NetStack<MockDriver>,
        a_iface: IfaceId,
        a_sent: CapturedFrames,
        b: NetStack<MockDriver>,
        b_iface: IfaceId,
        b_sent: CapturedFrames,
        now: Instant,
        in_flight: Vec<(Instant, bool, Vec<u8>)>,
        rng: StdRng,
        loss_percent: u32,
        one_way_delay: Duration,
        /// (seq, len) of every data segment A transmitted.
        a_data_log: Vec<(u32, usize)>,
        force_drop_nth_data: Option<usize>,
        a_data_count: usize,
    }

    impl TwoStacks {
        fn new(seed: u64, loss_percent: u32, one_way_delay_ms: u64) -> TwoStacks {
            let (a, a_iface, a_sent) = make_stack(A_ADDR, 1500, seed);
            let (b, b_iface, b_sent) = make_stack(B_ADDR, 1500, seed + 1);
            TwoStacks {
                a,
                a_iface,
                a_sent,
                b,
                b_iface,
                b_sent,
                now: Instant::ZERO,
                in_flight: Vec::new(),
                rng: StdRng::seed_from_u64(seed),
                loss_percent,
                one_way_delay: Duration::from_millis(one_way_delay_ms),
                a_data_log: Vec::new(),
                force_drop_nth_data: None,
                a_data_count: 0,
            }
        }

        fn tick(&mut self) {
            self.now += Duration::from_millis(1);
            self.a.poll(self.now);
            self.b.poll(self.now);

            let outgoing_a: Vec<Vec<u8>> = self
                .a_sent
                .borrow_mut()
                .drain(..)
                .map(|(bytes, _)| bytes)
                .collect();
            for bytes in outgoing_a {
                if let Some(seg) = parse_seg(&bytes) {
                    if !seg.payload.is_empty() {
                        self.a_data_log.push((seg.seq.to_u32(), seg.payload.len()));
                        self.a_data_count += 1;
                        if self.force_drop_nth_data == Some(self.a_data_count) {
                            continue;
                        }
                    }
                }
                if self.rng.gen_range(0..100) < self.loss_percent {
                    continue;
                }
                self.in_flight
                    .push((self.now + self.one_way_delay, false, bytes));
            }
            let outgoing_b: Vec<Vec<u8>> = self
                .b_sent
                .borrow_mut()
                .drain(..)
                .map(|(bytes, _)| bytes)
                .collect();
            for bytes in outgoing_b {
                if self.rng.gen_range(0..100) < self.loss_percent {
                    continue;
                }
                self.in_flight
                    .push((self.now + self.one_way_delay, true, bytes));
            }

            let now = self.now;
            let due: Vec<(bool, Vec<u8>)> = {
                let mut due = Vec::new();
                self.in_flight.retain_mut(|(at, to_a, bytes)| {
                    if *at <= now {
                        due.push((*to_a, std::mem::take(bytes)));
                        false
                    } else {
                        true
                    }
                });
                due
            };
            for (to_a, bytes) in due {
                if to_a {
                    self.a.process_frame(now, self.a_iface, &bytes);
                } else {
                    self.b.process_frame(now, self.b_iface, &bytes);
                }
            }
        }
    }

    #[test]
    fn test_two_stack_handshake_with_window_scale() {
        let mut net = TwoStacks::new(21, 0, 5);
        let listener = net
            .b
            .tcp
            .listen(
                None,
                80,
                ListenOptions {
                    rcv_buf_size: 1 << 20,
                    ..ListenOptions::default()
                },
            )
            .unwrap();
        net.a.ip.set_now(net.now);
        let client = net
            .a
            .tcp
            .connect(
                &mut net.a.ip,
                &mut net.a.timers,
                B_ADDR,
                80,
                ConnectOptions {
                    rcv_buf_size: 1 << 18,
                    ..ConnectOptions::default()
                },
            )
            .unwrap();

        let mut server = None;
        for _ in 0..200 {
            net.tick();
            if server.is_none() {
                server = net.b.tcp.accept(listener);
            }
            if server.is_some() && net.a.tcp.state(client) == State::Established {
                break;
            }
        }
        let server = server.expect("no connection accepted");
        assert_eq!(net.a.tcp.state(client), State::Established);
        assert_eq!(net.b.tcp.state(server), State::Established);

        // Both sides offered window scaling, so the shifts bind pairwise.
        let a_pcb = net.a.tcp.table.pcb(client);
        let b_pcb = net.b.tcp.table.pcb(server);
        assert_eq!(a_pcb.rcv_wnd_shift, 3); // 256 KiB window needs shift 3
        assert_eq!(b_pcb.rcv_wnd_shift, 5); // 1 MiB window needs shift 5
        assert_eq!(a_pcb.snd_wnd_shift, b_pcb.rcv_wnd_shift);
        assert_eq!(b_pcb.snd_wnd_shift, a_pcb.rcv_wnd_shift);
    }

    #[test]
    fn test_lossy_bulk_transfer_and_close() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut net = TwoStacks::new(7, 5, 10);
        net.force_drop_nth_data = Some(3);

        let listener = net.b.tcp.listen(None, 80, ListenOptions::default()).unwrap();
        net.a.ip.set_now(net.now);
        let client = net
            .a
            .tcp
            .connect(
                &mut net.a.ip,
                &mut net.a.timers,
                B_ADDR,
                80,
                ConnectOptions::default(),
            )
            .unwrap();

        let payload: Vec<u8> = (0..40_000u32).map(|i| (i * 31 + 7) as u8).collect();
        let mut sent_cursor = 0;
        let mut received = Vec::new();
        let mut server = None;
        let mut client_closed = false;
        let mut server_closed = false;

        for _ in 0..120_000 {
            net.tick();
            if server.is_none() {
                server = net.b.tcp.accept(listener);
            }

            if net.a.tcp.state(client) == State::Established && sent_cursor < payload.len() {
                sent_cursor += net.a.tcp.send(
                    &mut net.a.ip,
                    &mut net.a.timers,
                    client,
                    &payload[sent_cursor..],
                );
                if sent_cursor == payload.len() {
                    net.a
                        .tcp
                        .send_push(&mut net.a.ip, &mut net.a.timers, client);
                }
            }

            if let Some(server) = server {
                let mut chunk = [0u8; 4096];
                loop {
                    let read = net.b.tcp.recv(&mut net.b.ip, server, &mut chunk);
                    if read == 0 {
                        break;
                    }
                    received.extend_from_slice(&chunk[..read]);
                }
                if !server_closed
                    && received.len() == payload.len()
                    && net.b.tcp.recv_finished(server)
                {
                    net.b.tcp.close(&mut net.b.ip, &mut net.b.timers, server);
                    server_closed = true;
                }
            }

            if !client_closed && sent_cursor == payload.len() {
                // Half-close once everything is queued.
                net.a.tcp.close(&mut net.a.ip, &mut net.a.timers, client);
                client_closed = true;
            }

            if client_closed && server_closed {
                let a_state = net.a.tcp.state(client);
                let b_state = net.b.tcp.state(server.unwrap());
                if matches!(a_state, State::TimeWait | State::Closed)
                    && matches!(b_state, State::Closed)
                {
                    break;
                }
            }
        }

        assert_eq!(received.len(), payload.len(), "stream length");
        assert_eq!(received, payload, "stream content");
        assert!(!net.a.tcp.was_reset(client));

        // The forced drop guarantees at least one retransmission.
        let mut seen = std::collections::HashSet::new();
        let mut retransmitted = false;
        for entry in &net.a_data_log {
            if !seen.insert(*entry) {
                retransmitted = true;
            }
        }
        assert!(retransmitted, "no retransmission observed");

        // Orderly close on both sides.
        let a_state = net.a.tcp.state(client);
        assert!(matches!(a_state, State::TimeWait | State::Closed));
        assert_eq!(net.b.tcp.state(server.unwrap()), State::Closed);
    }
}
