/*! The IPv4 engine.

Owns the interfaces and everything datagram-shaped: header construction
and validation, the routing decision, fragmentation on send, reassembly on
receive, the path-MTU cache, and the ICMP behaviors the stack implements
(echo and destination-unreachable).

Transport payloads are not interpreted here. [Ip4Stack::process_recv]
returns a [RecvOutcome] and the embedder forwards `Transport` and
`DstUnreachable` outcomes to the transport layer; this keeps the engine
free of an upward dependency.
*/

use std::borrow::Cow;

use crate::buf::{self, BufRef};
use crate::checksum::{ChecksumAccumulator, ChecksumState};
use crate::config::StackConfig;
use crate::error::IpErr;
use crate::iface::{Iface, IfaceId, IpDriver, RetryHandle};
use crate::rand::Rand;
use crate::time::Instant;
use crate::wire::{
    Icmpv4DstUnreachable, Icmpv4Message, Icmpv4Packet, IpProtocol, Ipv4Address, Ipv4AddressExt,
    Ipv4FragKey, Ipv4Packet, Ipv4Repr, IPV4_HEADER_LEN,
};

mod pmtu;
mod reassembly;

pub use self::pmtu::PmtuCache;
pub use self::reassembly::ReassemblyTable;

/// Headroom the stack itself reserves when building headers; the
/// configured `header_before_ip` must fit in it.
const MAX_HEADER_BEFORE_IP: usize = 32;

/// The most chunks a payload chain handed to the engine may have.
const MAX_CHAIN_CHUNKS: usize = 8;

/// Per-send policy switches.
#[derive(Debug, Default, Clone, Copy)]
pub struct SendFlags {
    /// Permit an all-ones or directed-broadcast destination.
    pub allow_broadcast: bool,
    /// Set DF; fail with [IpErr::FragmentationNeeded] instead of
    /// fragmenting.
    pub dont_fragment: bool,
}

/// What became of a received frame.
#[derive(Debug)]
pub enum RecvOutcome<'a> {
    /// Handled internally (ICMP, reassembly in progress) or dropped.
    Consumed,
    /// A complete datagram for a transport protocol.
    Transport {
        iface: IfaceId,
        src_addr: Ipv4Address,
        dst_addr: Ipv4Address,
        proto: IpProtocol,
        payload: Cow<'a, [u8]>,
    },
    /// A Destination Unreachable aimed at one of our earlier datagrams.
    DstUnreachable {
        code: Icmpv4DstUnreachable,
        mtu_hint: u16,
        /// The embedded header of the datagram that bounced.
        inner: Ipv4Repr,
        /// The first eight bytes of the embedded transport header.
        transport: [u8; 8],
        /// The new path-MTU estimate, when the hint lowered it.
        new_pmtu: Option<u16>,
    },
}

/// A routed destination with the fixed-field part of its header checksum
/// precomputed; see [Ip4Stack::prepare].
#[derive(Debug, Clone)]
pub struct PreparedSend {
    iface: IfaceId,
    next_hop: Ipv4Address,
    src_addr: Ipv4Address,
    dst_addr: Ipv4Address,
    ttl: u8,
    proto: IpProtocol,
    dont_fragment: bool,
    header_partial: ChecksumState,
    max_payload: usize,
}

impl PreparedSend {
    pub const fn iface(&self) -> IfaceId {
        self.iface
    }

    /// The largest payload [Ip4Stack::send_fast] will accept.
    pub const fn max_payload(&self) -> usize {
        self.max_payload
    }
}

/// The IPv4 layer of the stack.
pub struct Ip4Stack<D: IpDriver> {
    config: StackConfig,
    ifaces: Vec<Iface<D>>,
    next_ident: u16,
    reassembly: ReassemblyTable,
    pmtu: PmtuCache,
    now: Instant,
}

impl<D: IpDriver> Ip4Stack<D> {
    pub fn new(config: StackConfig, seed: u64) -> Ip4Stack<D> {
        assert!(
            config.header_before_ip <= MAX_HEADER_BEFORE_IP,
            "header_before_ip too large"
        );
        let mut rand = Rand::new(seed);
        Ip4Stack {
            reassembly: ReassemblyTable::new(config.reass_timeout),
            pmtu: PmtuCache::new(config.pmtu_timeout, config.max_pmtu_estimate),
            config,
            ifaces: Vec::new(),
            next_ident: rand.rand_u16(),
            now: Instant::ZERO,
        }
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    /// Register an interface; later-added interfaces win routing ties.
    pub fn add_iface(&mut self, iface: Iface<D>) -> IfaceId {
        assert!(self.ifaces.len() < crate::config::MAX_IFACE_COUNT);
        self.ifaces.push(iface);
        IfaceId(self.ifaces.len() - 1)
    }

    pub fn iface(&self, id: IfaceId) -> &Iface<D> {
        &self.ifaces[id.0]
    }

    pub fn iface_mut(&mut self, id: IfaceId) -> &mut Iface<D> {
        &mut self.ifaces[id.0]
    }

    /// Advance the engine's view of the monotonic clock.
    pub fn set_now(&mut self, now: Instant) {
        self.now = now;
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    /// Drop reassembly entries whose hold time ran out.
    pub fn poll_reassembly(&mut self) {
        let now = self.now;
        self.reassembly.poll(now);
    }

    /// When [poll_reassembly] next has work to do.
    ///
    /// [poll_reassembly]: #method.poll_reassembly
    pub fn reassembly_deadline(&self) -> Option<Instant> {
        self.reassembly.next_expiry()
    }

    /// Select the egress interface and next hop for `dst`.
    ///
    /// With an explicit interface the destination is accepted if it is the
    /// all-ones broadcast, inside the interface subnet, or the interface
    /// has a gateway. Otherwise the longest matching prefix across all
    /// interfaces wins, ties going to the most recently added; failing
    /// that, the most recently added interface with a gateway.
    pub fn route(
        &self,
        dst: &Ipv4Address,
        iface: Option<IfaceId>,
    ) -> Result<(IfaceId, Ipv4Address), IpErr> {
        if let Some(id) = iface {
            let ifc = &self.ifaces[id.0];
            if dst.is_broadcast() {
                return Ok((id, *dst));
            }
            if let Some(addr) = ifc.addr() {
                if addr.contains(dst) {
                    return Ok((id, *dst));
                }
            }
            if let Some(gateway) = ifc.gateway() {
                return Ok((id, gateway));
            }
            return Err(IpErr::NoIpRoute);
        }

        let mut best: Option<(usize, u8)> = None;
        for (at, ifc) in self.ifaces.iter().enumerate().rev() {
            if let Some(addr) = ifc.addr() {
                if addr.contains(dst) && best.map_or(true, |(_, prefix)| addr.prefix > prefix) {
                    best = Some((at, addr.prefix));
                }
            }
        }
        if let Some((at, _)) = best {
            return Ok((IfaceId(at), *dst));
        }
        for (at, ifc) in self.ifaces.iter().enumerate().rev() {
            if let Some(gateway) = ifc.gateway() {
                return Ok((IfaceId(at), gateway));
            }
        }
        Err(IpErr::NoIpRoute)
    }

    fn check_src_addr(&self, iface: IfaceId, src: &Ipv4Address) -> Result<(), IpErr> {
        match self.ifaces[iface.0].addr() {
            Some(addr) if addr.addr == *src => Ok(()),
            Some(_) => Err(IpErr::NonLocalSrc),
            None => Err(IpErr::NonLocalSrc),
        }
    }

    fn check_broadcast_policy(
        &self,
        iface: IfaceId,
        dst: &Ipv4Address,
        flags: SendFlags,
    ) -> Result<(), IpErr> {
        if flags.allow_broadcast {
            return Ok(());
        }
        if dst.is_broadcast() {
            return Err(IpErr::BroadcastRejected);
        }
        if let Some(addr) = self.ifaces[iface.0].addr() {
            if *dst == addr.bcast {
                return Err(IpErr::BroadcastRejected);
            }
        }
        Ok(())
    }

    fn take_ident(&mut self) -> u16 {
        let ident = self.next_ident;
        self.next_ident = self.next_ident.wrapping_add(1);
        ident
    }

    #[allow(clippy::too_many_arguments)]
    fn build_header(
        buf: &mut [u8],
        src_addr: Ipv4Address,
        dst_addr: Ipv4Address,
        ttl: u8,
        proto: IpProtocol,
        total_len: u16,
        ident: u16,
        df: bool,
        mf: bool,
        frag_offset: u16,
    ) {
        let mut packet = Ipv4Packet::new_unchecked(buf);
        packet.set_version(4);
        packet.set_header_len(IPV4_HEADER_LEN as u8);
        packet.set_dscp_ecn(0, 0);
        packet.set_total_len(total_len);
        packet.set_ident(ident);
        packet.set_flags_and_frag_offset(df, mf, frag_offset);
        packet.set_hop_limit(ttl);
        packet.set_next_header(proto);
        packet.set_src_addr(src_addr);
        packet.set_dst_addr(dst_addr);
        packet.fill_checksum();
    }

    /// Send one datagram, fragmenting if the interface MTU requires it and
    /// DF permits.
    #[allow(clippy::too_many_arguments)]
    pub fn send_dgram(
        &mut self,
        src_addr: Ipv4Address,
        dst_addr: Ipv4Address,
        ttl: u8,
        proto: IpProtocol,
        payload: BufRef<'_>,
        iface: Option<IfaceId>,
        retry: Option<&RetryHandle>,
        flags: SendFlags,
    ) -> Result<(), IpErr> {
        let (iface_id, next_hop) = self.route(&dst_addr, iface)?;
        self.check_src_addr(iface_id, &src_addr)?;
        self.check_broadcast_policy(iface_id, &dst_addr, flags)?;

        let total_len = IPV4_HEADER_LEN + payload.len();
        if total_len > 65535 {
            return Err(IpErr::PacketTooLarge);
        }

        let ident = self.take_ident();
        let hbi = self.config.header_before_ip;
        let mtu = self.ifaces[iface_id.0].mtu() as usize;
        let mut hdr_buf = [0u8; MAX_HEADER_BEFORE_IP + IPV4_HEADER_LEN];

        if total_len <= mtu {
            Self::build_header(
                &mut hdr_buf[hbi..hbi + IPV4_HEADER_LEN],
                src_addr,
                dst_addr,
                ttl,
                proto,
                total_len as u16,
                ident,
                flags.dont_fragment,
                false,
                0,
            );
            let mut storage: [&[u8]; MAX_CHAIN_CHUNKS] = [&[]; MAX_CHAIN_CHUNKS];
            let pkt = buf::chain(
                &hdr_buf[..hbi + IPV4_HEADER_LEN],
                hbi,
                total_len,
                &payload,
                &mut storage,
            );
            return self.ifaces[iface_id.0].send(pkt, next_hop, retry);
        }

        if flags.dont_fragment {
            return Err(IpErr::FragmentationNeeded);
        }

        // The non-final fragment payload length: the MTU rounded down so
        // the payload is a multiple of eight bytes.
        let frag_payload = (mtu - IPV4_HEADER_LEN) & !7;
        let mut pos = 0;
        while pos < payload.len() {
            let remaining = payload.len() - pos;
            let (flen, mf) = if IPV4_HEADER_LEN + remaining <= mtu {
                (remaining, false)
            } else {
                (frag_payload, true)
            };
            Self::build_header(
                &mut hdr_buf[hbi..hbi + IPV4_HEADER_LEN],
                src_addr,
                dst_addr,
                ttl,
                proto,
                (IPV4_HEADER_LEN + flen) as u16,
                ident,
                false,
                mf,
                pos as u16,
            );
            let part = payload.sub_from_to(pos, flen);
            let mut storage: [&[u8]; MAX_CHAIN_CHUNKS] = [&[]; MAX_CHAIN_CHUNKS];
            let pkt = buf::chain(
                &hdr_buf[..hbi + IPV4_HEADER_LEN],
                hbi,
                IPV4_HEADER_LEN + flen,
                &part,
                &mut storage,
            );
            // A driver failure aborts the remaining fragments.
            self.ifaces[iface_id.0].send(pkt, next_hop, retry)?;
            pos += flen;
        }
        Ok(())
    }

    /// Route once and precompute the fixed-field header checksum, so bulk
    /// senders pay O(1) header work per datagram.
    pub fn prepare(
        &mut self,
        src_addr: Ipv4Address,
        dst_addr: Ipv4Address,
        ttl: u8,
        proto: IpProtocol,
        iface: Option<IfaceId>,
        flags: SendFlags,
    ) -> Result<PreparedSend, IpErr> {
        let (iface_id, next_hop) = self.route(&dst_addr, iface)?;
        self.check_src_addr(iface_id, &src_addr)?;
        self.check_broadcast_policy(iface_id, &dst_addr, flags)?;
        let mtu = self.ifaces[iface_id.0].mtu() as usize;

        let mut accum = ChecksumAccumulator::new();
        accum.add_word16(0x4500); // version, IHL, DSCP/ECN
        accum.add_word16(if flags.dont_fragment { 0x4000 } else { 0 });
        accum.add_word16(((ttl as u16) << 8) | u8::from(proto) as u16);
        accum.add_word32(src_addr.to_bits());
        accum.add_word32(dst_addr.to_bits());

        Ok(PreparedSend {
            iface: iface_id,
            next_hop,
            src_addr,
            dst_addr,
            ttl,
            proto,
            dont_fragment: flags.dont_fragment,
            header_partial: accum.state(),
            max_payload: mtu - IPV4_HEADER_LEN,
        })
    }

    /// Emit one datagram along a prepared route. Oversized payloads fail
    /// with [IpErr::FragmentationNeeded]; the fast path never fragments.
    pub fn send_fast(
        &mut self,
        prep: &PreparedSend,
        payload: BufRef<'_>,
        retry: Option<&RetryHandle>,
    ) -> Result<(), IpErr> {
        if payload.len() > prep.max_payload {
            return Err(IpErr::FragmentationNeeded);
        }
        let ident = self.take_ident();
        let hbi = self.config.header_before_ip;
        let total_len = IPV4_HEADER_LEN + payload.len();
        let mut hdr_buf = [0u8; MAX_HEADER_BEFORE_IP + IPV4_HEADER_LEN];
        {
            let mut packet = Ipv4Packet::new_unchecked(&mut hdr_buf[hbi..hbi + IPV4_HEADER_LEN]);
            packet.set_version(4);
            packet.set_header_len(IPV4_HEADER_LEN as u8);
            packet.set_dscp_ecn(0, 0);
            packet.set_total_len(total_len as u16);
            packet.set_ident(ident);
            packet.set_flags_and_frag_offset(prep.dont_fragment, false, 0);
            packet.set_hop_limit(prep.ttl);
            packet.set_next_header(prep.proto);
            packet.set_src_addr(prep.src_addr);
            packet.set_dst_addr(prep.dst_addr);
            let mut accum = ChecksumAccumulator::from_state(prep.header_partial);
            accum.add_word16(total_len as u16);
            accum.add_word16(ident);
            packet.set_checksum(accum.checksum());
        }
        let mut storage: [&[u8]; MAX_CHAIN_CHUNKS] = [&[]; MAX_CHAIN_CHUNKS];
        let pkt = buf::chain(
            &hdr_buf[..hbi + IPV4_HEADER_LEN],
            hbi,
            total_len,
            &payload,
            &mut storage,
        );
        self.ifaces[prep.iface.0].send(pkt, prep.next_hop, retry)
    }

    /// The path-MTU estimate towards `remote`, creating an entry bounded
    /// by the egress interface MTU when none exists.
    pub fn pmtu_for(&mut self, remote: Ipv4Address) -> Result<u16, IpErr> {
        let (iface_id, _) = self.route(&remote, None)?;
        let mtu = self.ifaces[iface_id.0].mtu();
        let now = self.now;
        self.pmtu.get_or_insert(remote, mtu, now)
    }

    /// The driver refused a datagram with [IpErr::FragmentationNeeded]:
    /// clamp the path-MTU estimate to the interface MTU. Returns the new
    /// estimate when it changed.
    pub fn handle_local_packet_too_big(&mut self, remote: Ipv4Address) -> Option<u16> {
        let (iface_id, _) = self.route(&remote, None).ok()?;
        let mtu = self.ifaces[iface_id.0].mtu();
        let now = self.now;
        self.pmtu.handle_packet_too_big(remote, mtu, mtu, now)
    }

    /// Process one received IPv4 packet (header plus payload).
    ///
    /// The referenced memory need not outlive the call: a reassembled or
    /// internally handled datagram never borrows from `pkt`, and
    /// `Transport` payloads borrow only within the returned outcome.
    pub fn process_recv<'a>(&mut self, iface_id: IfaceId, pkt: &'a [u8]) -> RecvOutcome<'a> {
        let packet = match Ipv4Packet::new_checked(pkt) {
            Ok(packet) => packet,
            Err(_) => {
                net_debug!("ip: truncated or inconsistent header, dropped");
                return RecvOutcome::Consumed;
            }
        };
        if packet.version() != 4 {
            net_debug!("ip: version {} dropped", packet.version());
            return RecvOutcome::Consumed;
        }
        if !packet.verify_checksum() {
            net_debug!("ip: header checksum mismatch, dropped");
            return RecvOutcome::Consumed;
        }

        let header = Ipv4Repr {
            src_addr: packet.src_addr(),
            dst_addr: packet.dst_addr(),
            next_header: packet.next_header(),
            payload_len: packet.payload().len(),
            hop_limit: packet.hop_limit(),
        };

        let (header, payload): (Ipv4Repr, Cow<'a, [u8]>) =
            if packet.more_frags() || packet.frag_offset() != 0 {
                // Fragments are reassembled only for our assigned address.
                match self.ifaces[iface_id.0].addr() {
                    Some(addr) if addr.addr == header.dst_addr => (),
                    _ => return RecvOutcome::Consumed,
                }
                let key = Ipv4FragKey {
                    src_addr: header.src_addr,
                    dst_addr: header.dst_addr,
                    protocol: header.next_header,
                    ident: packet.ident(),
                };
                let now = self.now;
                match self.reassembly.process_fragment(
                    key,
                    header,
                    packet.frag_offset() as usize,
                    packet.more_frags(),
                    packet.payload(),
                    now,
                ) {
                    Some((header, data)) => (header, Cow::Owned(data)),
                    None => return RecvOutcome::Consumed,
                }
            } else {
                (header, Cow::Borrowed(packet.payload()))
            };

        if self.ifaces[iface_id.0].offer_to_listeners(&header, &payload) {
            return RecvOutcome::Consumed;
        }

        match header.next_header {
            IpProtocol::Icmp => self.process_icmp(iface_id, &header, &payload),
            proto => RecvOutcome::Transport {
                iface: iface_id,
                src_addr: header.src_addr,
                dst_addr: header.dst_addr,
                proto,
                payload,
            },
        }
    }

    fn process_icmp<'a>(
        &mut self,
        iface_id: IfaceId,
        header: &Ipv4Repr,
        payload: &[u8],
    ) -> RecvOutcome<'a> {
        let icmp = match Icmpv4Packet::new_checked(payload) {
            Ok(icmp) => icmp,
            Err(_) => {
                net_debug!("icmp: truncated, dropped");
                return RecvOutcome::Consumed;
            }
        };
        if !icmp.verify_checksum() {
            net_debug!("icmp: checksum mismatch, dropped");
            return RecvOutcome::Consumed;
        }

        match (icmp.msg_type(), icmp.msg_code()) {
            (Icmpv4Message::EchoRequest, 0) => {
                self.process_echo_request(iface_id, header, &icmp);
                RecvOutcome::Consumed
            }
            (Icmpv4Message::DstUnreachable, code) => {
                self.process_dst_unreachable(iface_id, Icmpv4DstUnreachable::from(code), &icmp)
            }
            _ => RecvOutcome::Consumed,
        }
    }

    fn process_echo_request(
        &mut self,
        iface_id: IfaceId,
        header: &Ipv4Repr,
        icmp: &Icmpv4Packet<&[u8]>,
    ) {
        if !header.src_addr.x_is_unicast() {
            return;
        }
        let Some(addr) = self.ifaces[iface_id.0].addr().copied() else {
            return;
        };
        let accepted = header.dst_addr == addr.addr
            || header.dst_addr.is_broadcast()
            || (header.dst_addr == addr.bcast && self.config.allow_broadcast_ping);
        if !accepted {
            return;
        }

        let mut reply = vec![0u8; 8 + icmp.data().len()];
        {
            let mut packet = Icmpv4Packet::new_unchecked(&mut reply[..]);
            packet.set_msg_type(Icmpv4Message::EchoReply);
            packet.set_msg_code(0);
            packet.set_rest_of_header(icmp.rest_of_header());
            packet.data_mut().copy_from_slice(icmp.data());
            packet.fill_checksum();
        }
        let chunks = [&reply[..]];
        let reply_buf = BufRef::new(&chunks, 0, reply.len());
        let result = self.send_dgram(
            addr.addr,
            header.src_addr,
            self.config.icmp_ttl,
            IpProtocol::Icmp,
            reply_buf,
            Some(iface_id),
            None,
            SendFlags::default(),
        );
        if let Err(err) = result {
            net_debug!("icmp: echo reply not sent: {}", err);
        }
    }

    fn process_dst_unreachable<'a>(
        &mut self,
        iface_id: IfaceId,
        code: Icmpv4DstUnreachable,
        icmp: &Icmpv4Packet<&[u8]>,
    ) -> RecvOutcome<'a> {
        let embedded = icmp.data();
        let inner_packet = Ipv4Packet::new_unchecked(embedded);
        if embedded.len() < IPV4_HEADER_LEN {
            return RecvOutcome::Consumed;
        }
        let inner_header_len = inner_packet.header_len() as usize;
        if inner_header_len < IPV4_HEADER_LEN || embedded.len() < inner_header_len + 8 {
            return RecvOutcome::Consumed;
        }
        let inner = Ipv4Repr {
            src_addr: inner_packet.src_addr(),
            dst_addr: inner_packet.dst_addr(),
            next_header: inner_packet.next_header(),
            payload_len: 8,
            hop_limit: inner_packet.hop_limit(),
        };
        let mut transport = [0u8; 8];
        transport.copy_from_slice(&embedded[inner_header_len..inner_header_len + 8]);

        let new_pmtu = if code == Icmpv4DstUnreachable::FragRequired {
            let iface_mtu = self.ifaces[iface_id.0].mtu();
            let now = self.now;
            self.pmtu
                .handle_packet_too_big(inner.dst_addr, icmp.unreach_mtu(), iface_mtu, now)
        } else {
            None
        };

        RecvOutcome::DstUnreachable {
            code,
            mtu_hint: icmp.unreach_mtu(),
            inner,
            transport,
            new_pmtu,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::iface::HwType;
    use crate::testutil::{CapturedFrames, MockDriver};
    use crate::wire::{Icmpv4Repr, Ipv4Cidr};

    const LOCAL: Ipv4Address = Ipv4Address::new(10, 0, 0, 1);
    const PEER: Ipv4Address = Ipv4Address::new(10, 0, 0, 2);

    fn stack_with_iface(mtu: u16) -> (Ip4Stack<MockDriver>, IfaceId, CapturedFrames) {
        let mut stack = Ip4Stack::new(StackConfig::default(), 1);
        let (driver, sent) = MockDriver::new();
        let mut iface = Iface::new(driver, HwType::Ethernet, mtu);
        iface.set_addr(Some(Ipv4Cidr::new(LOCAL, 24)));
        let id = stack.add_iface(iface);
        (stack, id, sent)
    }

    fn send_udp(
        stack: &mut Ip4Stack<MockDriver>,
        dst: Ipv4Address,
        data: &[u8],
        flags: SendFlags,
    ) -> Result<(), IpErr> {
        let chunks = [data];
        let payload = BufRef::new(&chunks, 0, data.len());
        stack.send_dgram(LOCAL, dst, 64, IpProtocol::Udp, payload, None, None, flags)
    }

    #[test]
    fn test_route_longest_prefix_and_recency() {
        let mut stack: Ip4Stack<MockDriver> = Ip4Stack::new(StackConfig::default(), 1);

        let mut wide = Iface::new(MockDriver::new().0, HwType::Ethernet, 1500);
        wide.set_addr(Some(Ipv4Cidr::new(Ipv4Address::new(10, 0, 0, 1), 16)));
        let wide_id = stack.add_iface(wide);

        let mut narrow = Iface::new(MockDriver::new().0, HwType::Ethernet, 1500);
        narrow.set_addr(Some(Ipv4Cidr::new(Ipv4Address::new(10, 0, 1, 1), 24)));
        let narrow_id = stack.add_iface(narrow);

        let mut tied = Iface::new(MockDriver::new().0, HwType::Ethernet, 1500);
        tied.set_addr(Some(Ipv4Cidr::new(Ipv4Address::new(10, 1, 0, 1), 16)));
        tied.set_gateway(Some(Ipv4Address::new(10, 1, 0, 254)));
        let tied_id = stack.add_iface(tied);

        // Longest prefix wins.
        let dst = Ipv4Address::new(10, 0, 1, 9);
        assert_eq!(stack.route(&dst, None), Ok((narrow_id, dst)));
        // Shorter prefix catches the rest of 10.0/16.
        let dst = Ipv4Address::new(10, 0, 2, 9);
        assert_eq!(stack.route(&dst, None), Ok((wide_id, dst)));
        // Off-subnet falls back to the most recent gateway interface.
        let dst = Ipv4Address::new(192, 168, 0, 1);
        assert_eq!(
            stack.route(&dst, None),
            Ok((tied_id, Ipv4Address::new(10, 1, 0, 254)))
        );

        // A tie in prefix length picks the most recently added.
        let mut tie_a = Iface::new(MockDriver::new().0, HwType::Ethernet, 1500);
        tie_a.set_addr(Some(Ipv4Cidr::new(Ipv4Address::new(10, 0, 1, 2), 24)));
        let tie_a_id = stack.add_iface(tie_a);
        let dst = Ipv4Address::new(10, 0, 1, 9);
        assert_eq!(stack.route(&dst, None), Ok((tie_a_id, dst)));
    }

    #[test]
    fn test_route_no_match() {
        let (stack, _, _) = stack_with_iface(1500);
        assert_eq!(
            stack.route(&Ipv4Address::new(192, 168, 9, 9), None),
            Err(IpErr::NoIpRoute)
        );
    }

    #[test]
    fn test_send_within_mtu() {
        let (mut stack, _, sent) = stack_with_iface(1500);
        let data = vec![0x5a; 100];
        send_udp(&mut stack, PEER, &data, SendFlags::default()).unwrap();

        let frames = sent.borrow();
        assert_eq!(frames.len(), 1);
        let (bytes, next_hop) = &frames[0];
        assert_eq!(*next_hop, PEER);
        let packet = Ipv4Packet::new_checked(&bytes[..]).unwrap();
        assert!(packet.verify_checksum());
        assert_eq!(packet.total_len() as usize, 120);
        assert_eq!(packet.payload(), &data[..]);
        assert!(!packet.more_frags());
        assert_eq!(packet.frag_offset(), 0);
    }

    #[test]
    fn test_ident_increments_per_send() {
        let (mut stack, _, sent) = stack_with_iface(1500);
        send_udp(&mut stack, PEER, &[1], SendFlags::default()).unwrap();
        send_udp(&mut stack, PEER, &[2], SendFlags::default()).unwrap();
        let frames = sent.borrow();
        let first = Ipv4Packet::new_checked(&frames[0].0[..]).unwrap().ident();
        let second = Ipv4Packet::new_checked(&frames[1].0[..]).unwrap().ident();
        assert_eq!(second, first.wrapping_add(1));
    }

    #[test]
    fn test_fragmentation_geometry() {
        // MTU 1280: non-final fragments carry (1280 - 20) & !7 = 1260
        // payload bytes, so a 3000-byte payload leaves at offsets 0, 1260
        // and 2520.
        let (mut stack, id, sent) = stack_with_iface(1280);
        let data: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        send_udp(&mut stack, PEER, &data, SendFlags::default()).unwrap();

        let frames = sent.borrow();
        assert_eq!(frames.len(), 3);
        let mut offsets = Vec::new();
        let mut reassembled = vec![0u8; 3000];
        for (at, (bytes, _)) in frames.iter().enumerate() {
            let packet = Ipv4Packet::new_checked(&bytes[..]).unwrap();
            assert!(packet.verify_checksum());
            assert!(bytes.len() <= 1280);
            assert_eq!(packet.more_frags(), at != frames.len() - 1);
            offsets.push(packet.frag_offset());
            let off = packet.frag_offset() as usize;
            reassembled[off..off + packet.payload().len()].copy_from_slice(packet.payload());
        }
        assert_eq!(offsets, [0, 1260, 2520]);
        assert_eq!(reassembled, data);
        drop(frames);

        // The receive side reassembles the same fragments back into one
        // datagram addressed to us.
        let mut frames = Vec::new();
        {
            let captured = sent.borrow();
            for (bytes, _) in captured.iter() {
                let mut copy = bytes.clone();
                let mut packet = Ipv4Packet::new_unchecked(&mut copy[..]);
                packet.set_dst_addr(LOCAL);
                packet.fill_checksum();
                frames.push(copy);
            }
        }
        let mut outcome = None;
        for frame in &frames {
            match stack.process_recv(id, frame) {
                RecvOutcome::Transport { payload, .. } => {
                    outcome = Some(payload.into_owned());
                }
                RecvOutcome::Consumed => (),
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(outcome.unwrap(), data);
    }

    #[test]
    fn test_fragment_count_formula() {
        for (mtu, len) in [(1280u16, 4000usize), (1500, 2000), (1500, 9000), (576, 1500)] {
            let (mut stack, _, sent) = stack_with_iface(mtu);
            let data = vec![7u8; len];
            send_udp(&mut stack, PEER, &data, SendFlags::default()).unwrap();
            let frag_unit = (mtu as usize - 20) & !7;
            let expected = if len + 20 <= mtu as usize {
                1
            } else {
                len.div_ceil(frag_unit)
            };
            assert_eq!(sent.borrow().len(), expected, "mtu={mtu} len={len}");
        }
    }

    #[test]
    fn test_dont_fragment_fails() {
        let (mut stack, _, sent) = stack_with_iface(1500);
        let data = vec![0; 2000];
        let flags = SendFlags {
            dont_fragment: true,
            ..SendFlags::default()
        };
        assert_eq!(
            send_udp(&mut stack, PEER, &data, flags),
            Err(IpErr::FragmentationNeeded)
        );
        assert!(sent.borrow().is_empty());
    }

    #[test]
    fn test_non_local_src_rejected() {
        let (mut stack, _, sent) = stack_with_iface(1500);
        let data = [1u8];
        let chunks = [&data[..]];
        let payload = BufRef::new(&chunks, 0, 1);
        assert_eq!(
            stack.send_dgram(
                Ipv4Address::new(192, 168, 0, 9),
                PEER,
                64,
                IpProtocol::Udp,
                payload,
                None,
                None,
                SendFlags::default(),
            ),
            Err(IpErr::NonLocalSrc)
        );
        assert!(sent.borrow().is_empty());
    }

    #[test]
    fn test_broadcast_policy() {
        let (mut stack, _, sent) = stack_with_iface(1500);
        let bcast = Ipv4Address::new(10, 0, 0, 255);
        assert_eq!(
            send_udp(&mut stack, bcast, &[1], SendFlags::default()),
            Err(IpErr::BroadcastRejected)
        );
        let flags = SendFlags {
            allow_broadcast: true,
            ..SendFlags::default()
        };
        send_udp(&mut stack, bcast, &[1], flags).unwrap();
        assert_eq!(sent.borrow().len(), 1);
    }

    #[test]
    fn test_prepared_send_matches_slow_path() {
        let (mut stack, _, sent) = stack_with_iface(1500);
        let flags = SendFlags {
            dont_fragment: true,
            ..SendFlags::default()
        };
        let prep = stack
            .prepare(LOCAL, PEER, 64, IpProtocol::Tcp, None, flags)
            .unwrap();
        let data = [0x17u8; 64];
        let chunks = [&data[..]];
        stack
            .send_fast(&prep, BufRef::new(&chunks, 0, data.len()), None)
            .unwrap();

        let frames = sent.borrow();
        let packet = Ipv4Packet::new_checked(&frames[0].0[..]).unwrap();
        assert!(packet.verify_checksum());
        assert!(packet.dont_frag());
        assert_eq!(packet.next_header(), IpProtocol::Tcp);
        assert_eq!(packet.payload(), &data[..]);

        // Oversized payloads are refused rather than fragmented.
        let big = vec![0u8; 1481];
        let chunks = [&big[..]];
        assert_eq!(
            stack.send_fast(&prep, BufRef::new(&chunks, 0, big.len()), None),
            Err(IpErr::FragmentationNeeded)
        );
    }

    #[test]
    fn test_echo_request_reply() {
        let (mut stack, id, sent) = stack_with_iface(1500);

        let echo = Icmpv4Repr::EchoRequest {
            ident: 0x77,
            seq_no: 3,
            data: b"ping-payload",
        };
        let mut request = vec![0u8; 20 + echo.buffer_len()];
        {
            let header = Ipv4Repr {
                src_addr: PEER,
                dst_addr: LOCAL,
                next_header: IpProtocol::Icmp,
                payload_len: echo.buffer_len(),
                hop_limit: 64,
            };
            let mut packet = Ipv4Packet::new_unchecked(&mut request[..]);
            header.emit(&mut packet);
            let mut icmp = Icmpv4Packet::new_unchecked(packet.payload_mut());
            echo.emit(&mut icmp);
        }

        match stack.process_recv(id, &request) {
            RecvOutcome::Consumed => (),
            other => panic!("unexpected outcome {other:?}"),
        }

        let frames = sent.borrow();
        assert_eq!(frames.len(), 1);
        let packet = Ipv4Packet::new_checked(&frames[0].0[..]).unwrap();
        assert_eq!(packet.dst_addr(), PEER);
        assert_eq!(packet.src_addr(), LOCAL);
        let icmp = Icmpv4Packet::new_checked(packet.payload()).unwrap();
        assert!(icmp.verify_checksum());
        assert_eq!(icmp.msg_type(), Icmpv4Message::EchoReply);
        assert_eq!(icmp.echo_ident(), 0x77);
        assert_eq!(icmp.echo_seq_no(), 3);
        assert_eq!(icmp.data(), b"ping-payload");
    }

    #[test]
    fn test_corrupt_header_dropped() {
        let (mut stack, id, sent) = stack_with_iface(1500);
        let header = Ipv4Repr {
            src_addr: PEER,
            dst_addr: LOCAL,
            next_header: IpProtocol::Udp,
            payload_len: 4,
            hop_limit: 64,
        };
        let mut bytes = vec![0u8; 24];
        header.emit(&mut Ipv4Packet::new_unchecked(&mut bytes[..]));
        bytes[8] ^= 0xff; // break the TTL under the checksum
        match stack.process_recv(id, &bytes) {
            RecvOutcome::Consumed => (),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(sent.borrow().is_empty());
    }

    #[test]
    fn test_frag_needed_lowers_pmtu() {
        let (mut stack, id, _) = stack_with_iface(1500);
        assert_eq!(stack.pmtu_for(PEER), Ok(1500));

        // Build an ICMP Frag-Required quoting one of our TCP datagrams.
        let mut embedded = vec![0u8; 28];
        {
            let inner = Ipv4Repr {
                src_addr: LOCAL,
                dst_addr: PEER,
                next_header: IpProtocol::Tcp,
                payload_len: 8,
                hop_limit: 64,
            };
            inner.emit(&mut Ipv4Packet::new_unchecked(&mut embedded[..]));
        }
        let unreach = Icmpv4Repr::DstUnreachable {
            reason: Icmpv4DstUnreachable::FragRequired,
            mtu: 1100,
            data: &embedded,
        };
        let mut bytes = vec![0u8; 20 + unreach.buffer_len()];
        {
            let header = Ipv4Repr {
                src_addr: Ipv4Address::new(10, 0, 0, 254),
                dst_addr: LOCAL,
                next_header: IpProtocol::Icmp,
                payload_len: unreach.buffer_len(),
                hop_limit: 64,
            };
            let mut packet = Ipv4Packet::new_unchecked(&mut bytes[..]);
            header.emit(&mut packet);
            let mut icmp = Icmpv4Packet::new_unchecked(packet.payload_mut());
            unreach.emit(&mut icmp);
        }

        match stack.process_recv(id, &bytes) {
            RecvOutcome::DstUnreachable {
                code,
                mtu_hint,
                inner,
                new_pmtu,
                ..
            } => {
                assert_eq!(code, Icmpv4DstUnreachable::FragRequired);
                assert_eq!(mtu_hint, 1100);
                assert_eq!(inner.dst_addr, PEER);
                assert_eq!(new_pmtu, Some(1100));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(stack.pmtu_for(PEER), Ok(1100));
    }

    #[test]
    fn test_driver_error_aborts_fragments() {
        let (mut stack, id, sent) = stack_with_iface(1280);
        stack.iface_mut(id).driver_mut().fail = Some(IpErr::OutputBufferFull);
        let data = vec![0u8; 3000];
        assert_eq!(
            send_udp(&mut stack, PEER, &data, SendFlags::default()),
            Err(IpErr::OutputBufferFull)
        );
        assert!(sent.borrow().is_empty());
    }
}
