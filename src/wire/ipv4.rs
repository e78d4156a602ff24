use core::fmt;

use byteorder::{ByteOrder, NetworkEndian};

use super::{field, Error, Result};
use crate::checksum::checksum_inverted;

pub use core::net::Ipv4Addr as Address;

pub const ADDR_SIZE: usize = 4;

/// The length of an IPv4 header without options.
pub const HEADER_LEN: usize = 20;

enum_with_unknown! {
    /// IP datagram encapsulated protocol.
    pub enum Protocol(u8) {
        Icmp = 0x01,
        Tcp  = 0x06,
        Udp  = 0x11
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Protocol::Icmp => write!(f, "ICMP"),
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Unknown(id) => write!(f, "0x{id:02x}"),
        }
    }
}

pub trait AddressExt {
    /// Construct an IPv4 address from a sequence of octets, in big-endian.
    ///
    /// # Panics
    /// The function panics if `data` is not four octets long.
    fn from_bytes(data: &[u8]) -> Self;

    /// Query whether the address is a unicast address.
    ///
    /// `x_` prefix avoids a collision with the still-unstable method in
    /// `core::net`.
    fn x_is_unicast(&self) -> bool;
}

impl AddressExt for Address {
    fn from_bytes(data: &[u8]) -> Address {
        let mut bytes = [0; ADDR_SIZE];
        bytes.copy_from_slice(data);
        Address::from_bits(u32::from_be_bytes(bytes))
    }

    fn x_is_unicast(&self) -> bool {
        !(self.is_broadcast() || self.is_multicast() || self.is_unspecified())
    }
}

/// A specification of an IPv4 CIDR block, containing an address and a
/// variable-length subnet masking prefix length.
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct Cidr {
    address: Address,
    prefix_len: u8,
}

impl Cidr {
    /// Create an IPv4 CIDR block from the given address and prefix length.
    ///
    /// # Panics
    /// This function panics if the prefix length is larger than 32.
    pub const fn new(address: Address, prefix_len: u8) -> Cidr {
        assert!(prefix_len <= 32);
        Cidr {
            address,
            prefix_len,
        }
    }

    /// Create a CIDR block from an address and a subnet mask, or `None`
    /// when the mask is not a valid prefix mask.
    pub fn from_netmask(address: Address, netmask: Address) -> Option<Cidr> {
        let mask = netmask.to_bits();
        if mask.leading_ones() + mask.trailing_zeros() == 32 {
            Some(Cidr {
                address,
                prefix_len: mask.leading_ones() as u8,
            })
        } else {
            None
        }
    }

    pub const fn address(&self) -> Address {
        self.address
    }

    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub const fn netmask(&self) -> Address {
        if self.prefix_len == 0 {
            return Address::from_bits(0);
        }
        Address::from_bits(!0u32 << (32 - self.prefix_len))
    }

    /// The directed broadcast address of this block.
    pub const fn broadcast(&self) -> Address {
        Address::from_bits(self.address.to_bits() | !self.netmask().to_bits())
    }

    /// Query whether `addr` falls within this block.
    pub const fn contains_addr(&self, addr: &Address) -> bool {
        let mask = self.netmask().to_bits();
        self.address.to_bits() & mask == addr.to_bits() & mask
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

/// The identity of an in-flight datagram, used to key reassembly.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy)]
pub struct Key {
    pub src_addr: Address,
    pub dst_addr: Address,
    pub protocol: Protocol,
    pub ident: u16,
}

/// A read/write wrapper around an IPv4 packet buffer.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

mod offsets {
    use super::field::Field;

    pub const VER_IHL: usize = 0;
    pub const DSCP_ECN: usize = 1;
    pub const LENGTH: Field = 2..4;
    pub const IDENT: Field = 4..6;
    pub const FLG_OFF: Field = 6..8;
    pub const TTL: usize = 8;
    pub const PROTOCOL: usize = 9;
    pub const CHECKSUM: Field = 10..12;
    pub const SRC_ADDR: Field = 12..16;
    pub const DST_ADDR: Field = 16..20;
}

const FLAG_DF: u16 = 0x4000;
const FLAG_MF: u16 = 0x2000;
const FRAG_OFF_MASK: u16 = 0x1fff;

impl<T: AsRef<[u8]>> Packet<T> {
    /// Imbue a raw octet buffer with IPv4 packet structure.
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
    ///
    /// Returns `Err(Error)` if the buffer is shorter than the declared
    /// header length, or the declared lengths are inconsistent.
    pub fn check_len(&self) -> Result<()> {
        let len = self.buffer.as_ref().len();
        if len < HEADER_LEN {
            return Err(Error);
        }
        let header_len = self.header_len() as usize;
        if header_len < HEADER_LEN || header_len > len {
            return Err(Error);
        }
        let total_len = self.total_len() as usize;
        if total_len < header_len || total_len > len {
            return Err(Error);
        }
        Ok(())
    }

    /// Consume the packet, returning the underlying buffer.
    pub fn into_inner(self) -> T {
        self.buffer
    }

    pub fn version(&self) -> u8 {
        self.buffer.as_ref()[offsets::VER_IHL] >> 4
    }

    /// The header length in bytes.
    pub fn header_len(&self) -> u8 {
        (self.buffer.as_ref()[offsets::VER_IHL] & 0x0f) * 4
    }

    pub fn dscp(&self) -> u8 {
        self.buffer.as_ref()[offsets::DSCP_ECN] >> 2
    }

    pub fn ecn(&self) -> u8 {
        self.buffer.as_ref()[offsets::DSCP_ECN] & 0x03
    }

    pub fn total_len(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[offsets::LENGTH])
    }

    pub fn ident(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[offsets::IDENT])
    }

    pub fn dont_frag(&self) -> bool {
        NetworkEndian::read_u16(&self.buffer.as_ref()[offsets::FLG_OFF]) & FLAG_DF != 0
    }

    pub fn more_frags(&self) -> bool {
        NetworkEndian::read_u16(&self.buffer.as_ref()[offsets::FLG_OFF]) & FLAG_MF != 0
    }

    /// The fragment offset, in octets.
    pub fn frag_offset(&self) -> u16 {
        (NetworkEndian::read_u16(&self.buffer.as_ref()[offsets::FLG_OFF]) & FRAG_OFF_MASK) << 3
    }

    pub fn hop_limit(&self) -> u8 {
        self.buffer.as_ref()[offsets::TTL]
    }

    pub fn next_header(&self) -> Protocol {
        Protocol::from(self.buffer.as_ref()[offsets::PROTOCOL])
    }

    pub fn checksum(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[offsets::CHECKSUM])
    }

    pub fn src_addr(&self) -> Address {
        Address::from_bytes(&self.buffer.as_ref()[offsets::SRC_ADDR])
    }

    pub fn dst_addr(&self) -> Address {
        Address::from_bytes(&self.buffer.as_ref()[offsets::DST_ADDR])
    }

    /// Validate the header checksum, options included.
    pub fn verify_checksum(&self) -> bool {
        let header = &self.buffer.as_ref()[..self.header_len() as usize];
        checksum_inverted(header) == 0
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Packet<&'a T> {
    /// The header options, if any.
    pub fn options(&self) -> &'a [u8] {
        &self.buffer.as_ref()[HEADER_LEN..self.header_len() as usize]
    }

    /// The payload following the header.
    pub fn payload(&self) -> &'a [u8] {
        let range = self.header_len() as usize..self.total_len() as usize;
        &self.buffer.as_ref()[range]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    pub fn set_version(&mut self, value: u8) {
        let data = self.buffer.as_mut();
        data[offsets::VER_IHL] = (data[offsets::VER_IHL] & 0x0f) | (value << 4);
    }

    pub fn set_header_len(&mut self, value: u8) {
        let data = self.buffer.as_mut();
        data[offsets::VER_IHL] = (data[offsets::VER_IHL] & 0xf0) | ((value / 4) & 0x0f);
    }

    pub fn set_dscp_ecn(&mut self, dscp: u8, ecn: u8) {
        self.buffer.as_mut()[offsets::DSCP_ECN] = (dscp << 2) | (ecn & 0x03);
    }

    pub fn set_total_len(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[offsets::LENGTH], value)
    }

    pub fn set_ident(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[offsets::IDENT], value)
    }

    pub fn set_flags_and_frag_offset(&mut self, df: bool, mf: bool, offset: u16) {
        debug_assert!(offset % 8 == 0);
        let mut raw = offset >> 3;
        if df {
            raw |= FLAG_DF;
        }
        if mf {
            raw |= FLAG_MF;
        }
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[offsets::FLG_OFF], raw)
    }

    pub fn set_hop_limit(&mut self, value: u8) {
        self.buffer.as_mut()[offsets::TTL] = value
    }

    pub fn set_next_header(&mut self, value: Protocol) {
        self.buffer.as_mut()[offsets::PROTOCOL] = value.into()
    }

    pub fn set_checksum(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[offsets::CHECKSUM], value)
    }

    pub fn set_src_addr(&mut self, value: Address) {
        self.buffer.as_mut()[offsets::SRC_ADDR].copy_from_slice(&value.octets())
    }

    pub fn set_dst_addr(&mut self, value: Address) {
        self.buffer.as_mut()[offsets::DST_ADDR].copy_from_slice(&value.octets())
    }

    /// Recompute and fill in the header checksum.
    pub fn fill_checksum(&mut self) {
        self.set_checksum(0);
        let checksum = {
            let header_len = self.header_len() as usize;
            checksum_inverted(&self.buffer.as_ref()[..header_len])
        };
        self.set_checksum(checksum);
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let range = self.header_len() as usize..self.total_len() as usize;
        &mut self.buffer.as_mut()[range]
    }
}

impl<T: AsRef<[u8]>> AsRef<[u8]> for Packet<T> {
    fn as_ref(&self) -> &[u8] {
        self.buffer.as_ref()
    }
}

/// A high-level representation of an IPv4 header, options excluded.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Repr {
    pub src_addr: Address,
    pub dst_addr: Address,
    pub next_header: Protocol,
    pub payload_len: usize,
    pub hop_limit: u8,
}

impl Repr {
    /// Parse an IPv4 packet into a high-level representation.
    ///
    /// Fragment and option information is not representable; the caller
    /// handles both before parsing.
    pub fn parse<T: AsRef<[u8]> + ?Sized>(packet: &Packet<&T>) -> Result<Repr> {
        if packet.version() != 4 {
            return Err(Error);
        }
        Ok(Repr {
            src_addr: packet.src_addr(),
            dst_addr: packet.dst_addr(),
            next_header: packet.next_header(),
            payload_len: packet.total_len() as usize - packet.header_len() as usize,
            hop_limit: packet.hop_limit(),
        })
    }

    /// The length of a header emitted from this representation.
    pub const fn buffer_len(&self) -> usize {
        HEADER_LEN
    }

    /// Emit this representation into a packet, filling the checksum.
    pub fn emit<T: AsRef<[u8]> + AsMut<[u8]>>(&self, packet: &mut Packet<T>) {
        packet.set_version(4);
        packet.set_header_len(HEADER_LEN as u8);
        packet.set_dscp_ecn(0, 0);
        packet.set_total_len((HEADER_LEN + self.payload_len) as u16);
        packet.set_ident(0);
        packet.set_flags_and_frag_offset(false, false, 0);
        packet.set_hop_limit(self.hop_limit);
        packet.set_next_header(self.next_header);
        packet.set_src_addr(self.src_addr);
        packet.set_dst_addr(self.dst_addr);
        packet.fill_checksum();
    }
}

impl fmt::Display for Repr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "IPv4 src={} dst={} proto={}",
            self.src_addr, self.dst_addr, self.next_header
        )
    }
}
