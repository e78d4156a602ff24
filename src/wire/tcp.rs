use core::{cmp, fmt, ops};

use byteorder::{ByteOrder, NetworkEndian};

use super::ipv4::{Address, Protocol};
use super::{field, Error, Result};
use crate::buf::BufRef;
use crate::checksum::ChecksumAccumulator;

/// A TCP sequence number.
///
/// Comparisons are 32-bit modular: `a < b` means `a` precedes `b` on the
/// sequence circle, which is only meaningful for numbers less than half the
/// space apart. All sequence arithmetic in the stack goes through this type.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy, Hash)]
pub struct SeqNumber(pub u32);

impl SeqNumber {
    pub const fn to_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ops::Add<usize> for SeqNumber {
    type Output = SeqNumber;

    fn add(self, rhs: usize) -> SeqNumber {
        SeqNumber(self.0.wrapping_add(rhs as u32))
    }
}

impl ops::AddAssign<usize> for SeqNumber {
    fn add_assign(&mut self, rhs: usize) {
        *self = *self + rhs;
    }
}

impl ops::Sub<usize> for SeqNumber {
    type Output = SeqNumber;

    fn sub(self, rhs: usize) -> SeqNumber {
        SeqNumber(self.0.wrapping_sub(rhs as u32))
    }
}

impl ops::Sub for SeqNumber {
    type Output = usize;

    /// The distance from `rhs` forward to `self`; `rhs` must not be ahead.
    fn sub(self, rhs: SeqNumber) -> usize {
        debug_assert!(self >= rhs);
        self.0.wrapping_sub(rhs.0) as usize
    }
}

impl PartialOrd for SeqNumber {
    fn partial_cmp(&self, other: &SeqNumber) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SeqNumber {
    fn cmp(&self, other: &SeqNumber) -> cmp::Ordering {
        (self.0.wrapping_sub(other.0) as i32).cmp(&0)
    }
}

/// The length of a TCP header without options.
pub const HEADER_LEN: usize = 20;

/// The longest header the stack will ever emit (MSS plus window scale,
/// padded to a word).
pub const MAX_HEADER_LEN: usize = HEADER_LEN + 8;

/// A read/write wrapper around a TCP segment buffer.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

mod offsets {
    use super::field::Field;

    pub const SRC_PORT: Field = 0..2;
    pub const DST_PORT: Field = 2..4;
    pub const SEQ_NUM: Field = 4..8;
    pub const ACK_NUM: Field = 8..12;
    pub const FLAGS: Field = 12..14;
    pub const WIN_SIZE: Field = 14..16;
    pub const CHECKSUM: Field = 16..18;
    pub const URGENT: Field = 18..20;
}

const FLG_FIN: u16 = 0x001;
const FLG_SYN: u16 = 0x002;
const FLG_RST: u16 = 0x004;
const FLG_PSH: u16 = 0x008;
const FLG_ACK: u16 = 0x010;
const FLG_URG: u16 = 0x020;

impl<T: AsRef<[u8]>> Packet<T> {
    /// Imbue a raw octet buffer with TCP segment structure.
    pub const fn new_unchecked(buffer: T) -> Packet<T> {
        Packet { buffer }
    }

    /// Shorthand for a combination of [new_unchecked] and [check_len].
    ///
    /// [new_unchecked]: #method.new_unchecked
    /// [check_len]: #method.check_len
    pub fn new_checked(buffer: T) -> Result<Packet<T>> {
        let packet = Self::new_unchecked(buffer);
        packet.check_len()?;
        Ok(packet)
    }

    /// Ensure that no accessor method will panic.
    pub fn check_len(&self) -> Result<()> {
        let len = self.buffer.as_ref().len();
        if len < HEADER_LEN {
            return Err(Error);
        }
        let header_len = self.header_len() as usize;
        if header_len < HEADER_LEN || header_len > len {
            return Err(Error);
        }
        Ok(())
    }

    pub fn src_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[offsets::SRC_PORT])
    }

    pub fn dst_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[offsets::DST_PORT])
    }

    pub fn seq_number(&self) -> SeqNumber {
        SeqNumber(NetworkEndian::read_u32(
            &self.buffer.as_ref()[offsets::SEQ_NUM],
        ))
    }

    pub fn ack_number(&self) -> SeqNumber {
        SeqNumber(NetworkEndian::read_u32(
            &self.buffer.as_ref()[offsets::ACK_NUM],
        ))
    }

    fn flags(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[offsets::FLAGS])
    }

    pub fn fin(&self) -> bool {
        self.flags() & FLG_FIN != 0
    }

    pub fn syn(&self) -> bool {
        self.flags() & FLG_SYN != 0
    }

    pub fn rst(&self) -> bool {
        self.flags() & FLG_RST != 0
    }

    pub fn psh(&self) -> bool {
        self.flags() & FLG_PSH != 0
    }

    pub fn ack(&self) -> bool {
        self.flags() & FLG_ACK != 0
    }

    pub fn urg(&self) -> bool {
        self.flags() & FLG_URG != 0
    }

    /// The header length in bytes, as declared by the data offset field.
    pub fn header_len(&self) -> u8 {
        ((self.flags() >> 12) * 4) as u8
    }

    pub fn window_len(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[offsets::WIN_SIZE])
    }

    pub fn checksum(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[offsets::CHECKSUM])
    }

    /// The number of sequence units the segment occupies.
    pub fn segment_len(&self) -> usize {
        let data = self.buffer.as_ref();
        let mut len = data.len() - self.header_len() as usize;
        if self.syn() {
            len += 1;
        }
        if self.fin() {
            len += 1;
        }
        len
    }

    /// Validate the segment checksum against the pseudo-header.
    pub fn verify_checksum(&self, src_addr: &Address, dst_addr: &Address) -> bool {
        let data = self.buffer.as_ref();
        let mut accum = ChecksumAccumulator::new();
        accum.add_word32(src_addr.to_bits());
        accum.add_word32(dst_addr.to_bits());
        accum.add_word16(u8::from(Protocol::Tcp) as u16);
        accum.add_word16(data.len() as u16);
        let chunks = [data];
        accum.add_ip_buf(BufRef::new(&chunks, 0, data.len()));
        accum.checksum() == 0
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Packet<&'a T> {
    /// The option bytes between the fixed header and the payload.
    pub fn options(&self) -> &'a [u8] {
        &self.buffer.as_ref()[HEADER_LEN..self.header_len() as usize]
    }

    /// The segment payload.
    pub fn payload(&self) -> &'a [u8] {
        &self.buffer.as_ref()[self.header_len() as usize..]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    pub fn set_src_port(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[offsets::SRC_PORT], value)
    }

    pub fn set_dst_port(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[offsets::DST_PORT], value)
    }

    pub fn set_seq_number(&mut self, value: SeqNumber) {
        NetworkEndian::write_u32(&mut self.buffer.as_mut()[offsets::SEQ_NUM], value.0)
    }

    pub fn set_ack_number(&mut self, value: SeqNumber) {
        NetworkEndian::write_u32(&mut self.buffer.as_mut()[offsets::ACK_NUM], value.0)
    }

    /// Clear every flag and set the data offset in one store.
    pub fn clear_flags_set_header_len(&mut self, header_len: u8) {
        debug_assert!(header_len % 4 == 0);
        let raw = ((header_len / 4) as u16) << 12;
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[offsets::FLAGS], raw)
    }

    fn set_flag(&mut self, flag: u16, value: bool) {
        let raw = self.flags();
        let raw = if value { raw | flag } else { raw & !flag };
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[offsets::FLAGS], raw)
    }

    pub fn set_fin(&mut self, value: bool) {
        self.set_flag(FLG_FIN, value)
    }

    pub fn set_syn(&mut self, value: bool) {
        self.set_flag(FLG_SYN, value)
    }

    pub fn set_rst(&mut self, value: bool) {
        self.set_flag(FLG_RST, value)
    }

    pub fn set_psh(&mut self, value: bool) {
        self.set_flag(FLG_PSH, value)
    }

    pub fn set_ack(&mut self, value: bool) {
        self.set_flag(FLG_ACK, value)
    }

    pub fn set_window_len(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[offsets::WIN_SIZE], value)
    }

    pub fn set_checksum(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[offsets::CHECKSUM], value)
    }

    pub fn set_urgent_at(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[offsets::URGENT], value)
    }

    pub fn options_mut(&mut self) -> &mut [u8] {
        let header_len = self.header_len() as usize;
        &mut self.buffer.as_mut()[HEADER_LEN..header_len]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let header_len = self.header_len() as usize;
        &mut self.buffer.as_mut()[header_len..]
    }

    /// Compute and fill in the checksum over the whole (contiguous) segment.
    pub fn fill_checksum(&mut self, src_addr: &Address, dst_addr: &Address) {
        self.set_checksum(0);
        let checksum = {
            let data = self.buffer.as_ref();
            let mut accum = ChecksumAccumulator::new();
            accum.add_word32(src_addr.to_bits());
            accum.add_word32(dst_addr.to_bits());
            accum.add_word16(u8::from(Protocol::Tcp) as u16);
            accum.add_word16(data.len() as u16);
            let chunks = [data];
            accum.add_ip_buf(BufRef::new(&chunks, 0, data.len()));
            accum.checksum()
        };
        self.set_checksum(checksum);
    }
}

impl<T: AsRef<[u8]>> AsRef<[u8]> for Packet<T> {
    fn as_ref(&self) -> &[u8] {
        self.buffer.as_ref()
    }
}

/// A TCP header option.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TcpOption<'a> {
    EndOfList,
    NoOperation,
    MaxSegmentSize(u16),
    WindowScale(u8),
    Unknown { kind: u8, data: &'a [u8] },
}

impl<'a> TcpOption<'a> {
    /// Parse one option, returning it and the buffer past it.
    pub fn parse(buffer: &'a [u8]) -> Result<(&'a [u8], TcpOption<'a>)> {
        let (length, option);
        match *buffer.first().ok_or(Error)? {
            0 => {
                length = buffer.len();
                option = TcpOption::EndOfList;
            }
            1 => {
                length = 1;
                option = TcpOption::NoOperation;
            }
            kind => {
                length = *buffer.get(1).ok_or(Error)? as usize;
                let data = buffer.get(2..length).ok_or(Error)?;
                match (kind, length) {
                    (2, 4) => option = TcpOption::MaxSegmentSize(NetworkEndian::read_u16(data)),
                    (3, 3) => option = TcpOption::WindowScale(data[0]),
                    (2, _) | (3, _) => return Err(Error),
                    (_, _) => option = TcpOption::Unknown { kind, data },
                }
            }
        }
        Ok((&buffer[length..], option))
    }

    pub fn buffer_len(&self) -> usize {
        match self {
            TcpOption::EndOfList => 1,
            TcpOption::NoOperation => 1,
            TcpOption::MaxSegmentSize(_) => 4,
            TcpOption::WindowScale(_) => 3,
            TcpOption::Unknown { data, .. } => 2 + data.len(),
        }
    }

    /// Emit one option, returning the buffer past it.
    pub fn emit<'b>(&self, buffer: &'b mut [u8]) -> &'b mut [u8] {
        let length = self.buffer_len();
        match *self {
            TcpOption::EndOfList => {
                // Pad the rest of the option space.
                for byte in buffer.iter_mut() {
                    *byte = 0;
                }
                return &mut [];
            }
            TcpOption::NoOperation => buffer[0] = 1,
            TcpOption::MaxSegmentSize(value) => {
                buffer[0] = 2;
                buffer[1] = 4;
                NetworkEndian::write_u16(&mut buffer[2..4], value);
            }
            TcpOption::WindowScale(value) => {
                buffer[0] = 3;
                buffer[1] = 3;
                buffer[2] = value;
            }
            TcpOption::Unknown { kind, data } => {
                buffer[0] = kind;
                buffer[1] = length as u8;
                buffer[2..length].copy_from_slice(data);
            }
        }
        &mut buffer[length..]
    }
}

/// The control flags of a segment, reduced to the combinations the stack
/// emits.
#[derive(Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum Control {
    #[default]
    None,
    Psh,
    Syn,
    Fin,
    Rst,
}

impl Control {
    /// The number of sequence units the control part occupies.
    pub const fn len_in_seq(self) -> usize {
        match self {
            Control::Syn | Control::Fin => 1,
            _ => 0,
        }
    }
}

/// A high-level representation of a TCP segment header plus payload.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Repr<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub control: Control,
    pub seq_number: SeqNumber,
    pub ack_number: Option<SeqNumber>,
    pub window_len: u16,
    pub max_seg_size: Option<u16>,
    pub window_scale: Option<u8>,
    pub payload: &'a [u8],
}

impl<'a> Repr<'a> {
    /// Parse a TCP segment into a high-level representation.
    ///
    /// The checksum is not verified here; the input engine does that with
    /// its own drop policy.
    pub fn parse<T: AsRef<[u8]> + ?Sized>(packet: &Packet<&'a T>) -> Result<Repr<'a>> {
        if packet.src_port() == 0 || packet.dst_port() == 0 {
            return Err(Error);
        }

        let control = match (packet.syn(), packet.fin(), packet.rst(), packet.psh()) {
            (false, false, false, false) => Control::None,
            (false, false, false, true) => Control::Psh,
            (true, false, false, _) => Control::Syn,
            (false, true, false, _) => Control::Fin,
            (false, false, true, _) => Control::Rst,
            _ => return Err(Error),
        };
        let ack_number = if packet.ack() {
            Some(packet.ack_number())
        } else {
            None
        };

        let mut max_seg_size = None;
        let mut window_scale = None;
        let mut options = packet.options();
        while !options.is_empty() {
            let (next_options, option) = TcpOption::parse(options)?;
            match option {
                TcpOption::EndOfList => break,
                TcpOption::NoOperation => (),
                TcpOption::MaxSegmentSize(value) => max_seg_size = Some(value),
                TcpOption::WindowScale(value) => {
                    // RFC 1323: a shift above 14 is used as 14.
                    window_scale = Some(value.min(14));
                }
                _ => (),
            }
            options = next_options;
        }

        Ok(Repr {
            src_port: packet.src_port(),
            dst_port: packet.dst_port(),
            control,
            seq_number: packet.seq_number(),
            ack_number,
            window_len: packet.window_len(),
            max_seg_size,
            window_scale,
            payload: packet.payload(),
        })
    }

    /// The length of the header emitted from this representation.
    pub fn header_len(&self) -> usize {
        let mut length = HEADER_LEN;
        if self.max_seg_size.is_some() {
            length += 4;
        }
        if self.window_scale.is_some() {
            length += 3;
        }
        // Pad to a header word.
        (length + 3) & !3
    }

    /// The length of the whole segment emitted from this representation.
    pub fn buffer_len(&self) -> usize {
        self.header_len() + self.payload.len()
    }

    /// The number of sequence units the segment occupies.
    pub fn segment_len(&self) -> usize {
        self.payload.len() + self.control.len_in_seq()
    }

    /// Emit this representation into a packet, filling the checksum.
    pub fn emit<T: AsRef<[u8]> + AsMut<[u8]>>(
        &self,
        packet: &mut Packet<T>,
        src_addr: &Address,
        dst_addr: &Address,
    ) {
        packet.set_src_port(self.src_port);
        packet.set_dst_port(self.dst_port);
        packet.set_seq_number(self.seq_number);
        packet.set_ack_number(self.ack_number.unwrap_or(SeqNumber(0)));
        packet.set_window_len(self.window_len);
        packet.clear_flags_set_header_len(self.header_len() as u8);
        match self.control {
            Control::None => (),
            Control::Psh => packet.set_psh(true),
            Control::Syn => packet.set_syn(true),
            Control::Fin => packet.set_fin(true),
            Control::Rst => packet.set_rst(true),
        }
        packet.set_ack(self.ack_number.is_some());
        packet.set_urgent_at(0);

        {
            let mut options = packet.options_mut();
            if let Some(value) = self.max_seg_size {
                options = TcpOption::MaxSegmentSize(value).emit(options);
            }
            if let Some(value) = self.window_scale {
                options = TcpOption::WindowScale(value).emit(options);
            }
            if !options.is_empty() {
                TcpOption::EndOfList.emit(options);
            }
        }
        packet.payload_mut()[..self.payload.len()].copy_from_slice(self.payload);
        packet.fill_checksum(src_addr, dst_addr);
    }
}

impl fmt::Display for Repr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "TCP {}->{} seq={} ack={:?} win={} len={}",
            self.src_port,
            self.dst_port,
            self.seq_number,
            self.ack_number.map(|a| a.0),
            self.window_len,
            self.payload.len()
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SRC: Address = Address::new(192, 168, 1, 1);
    const DST: Address = Address::new(192, 168, 1, 2);

    #[test]
    fn test_seq_number_wraparound() {
        let a = SeqNumber(0xffff_fff0);
        let b = a + 0x20;
        assert!(b > a);
        assert_eq!(b - a, 0x20);
        assert_eq!(b.0, 0x10);
        assert!(SeqNumber(5) > SeqNumber(0xffff_fffa));
    }

    #[test]
    fn test_repr_round_trip_with_options() {
        let repr = Repr {
            src_port: 48896,
            dst_port: 80,
            control: Control::Syn,
            seq_number: SeqNumber(0x0123_4567),
            ack_number: None,
            window_len: 0x0123,
            max_seg_size: Some(1460),
            window_scale: Some(7),
            payload: &[],
        };
        assert_eq!(repr.header_len(), 28);

        let mut bytes = vec![0xa5; repr.buffer_len()];
        let mut packet = Packet::new_unchecked(&mut bytes[..]);
        repr.emit(&mut packet, &SRC, &DST);

        let packet = Packet::new_checked(&bytes[..]).unwrap();
        assert!(packet.verify_checksum(&SRC, &DST));
        assert_eq!(packet.segment_len(), 1);
        assert_eq!(Repr::parse(&packet).unwrap(), repr);
    }

    #[test]
    fn test_repr_round_trip_data() {
        let repr = Repr {
            src_port: 48896,
            dst_port: 80,
            control: Control::Psh,
            seq_number: SeqNumber(0x0123_4567),
            ack_number: Some(SeqNumber(0x89ab_cdef)),
            window_len: 0x0123,
            max_seg_size: None,
            window_scale: None,
            payload: b"abcdef",
        };
        let mut bytes = vec![0xa5; repr.buffer_len()];
        let mut packet = Packet::new_unchecked(&mut bytes[..]);
        repr.emit(&mut packet, &SRC, &DST);

        let packet = Packet::new_checked(&bytes[..]).unwrap();
        assert!(packet.verify_checksum(&SRC, &DST));
        assert!(packet.psh());
        assert!(packet.ack());
        assert_eq!(packet.payload(), b"abcdef");
        assert_eq!(Repr::parse(&packet).unwrap(), repr);
    }

    #[test]
    fn test_corrupt_checksum_detected() {
        let repr = Repr {
            src_port: 1,
            dst_port: 2,
            control: Control::None,
            seq_number: SeqNumber(1),
            ack_number: Some(SeqNumber(2)),
            window_len: 100,
            max_seg_size: None,
            window_scale: None,
            payload: b"xyz",
        };
        let mut bytes = vec![0; repr.buffer_len()];
        let mut packet = Packet::new_unchecked(&mut bytes[..]);
        repr.emit(&mut packet, &SRC, &DST);
        bytes[21] ^= 0x40;
        let packet = Packet::new_unchecked(&bytes[..]);
        assert!(!packet.verify_checksum(&SRC, &DST));
    }

    #[test]
    fn test_option_parse_malformed() {
        // Truncated MSS option.
        assert!(TcpOption::parse(&[2, 4, 0]).is_err());
        // Bad length for window scale.
        assert!(TcpOption::parse(&[3, 2, 0]).is_err());
    }
}
