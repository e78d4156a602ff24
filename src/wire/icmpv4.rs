use core::fmt;

use byteorder::{ByteOrder, NetworkEndian};

use super::{field, Error, Result};
use crate::checksum::checksum_inverted;

enum_with_unknown! {
    /// Internet protocol control message type.
    pub enum Message(u8) {
        /// Echo reply
        EchoReply      =  0,
        /// Destination unreachable
        DstUnreachable =  3,
        /// Echo request
        EchoRequest    =  8
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Message::EchoReply => write!(f, "echo reply"),
            Message::DstUnreachable => write!(f, "destination unreachable"),
            Message::EchoRequest => write!(f, "echo request"),
            Message::Unknown(id) => write!(f, "{id}"),
        }
    }
}

enum_with_unknown! {
    /// Internet protocol control message subtype for type "Destination Unreachable".
    pub enum DstUnreachable(u8) {
        /// Destination network unreachable
        NetUnreachable   =  0,
        /// Destination host unreachable
        HostUnreachable  =  1,
        /// Destination protocol unreachable
        ProtoUnreachable =  2,
        /// Destination port unreachable
        PortUnreachable  =  3,
        /// Fragmentation required, and DF flag set
        FragRequired     =  4,
        /// Source route failed
        SrcRouteFailed   =  5
    }
}

/// A read/write wrapper around an ICMPv4 packet buffer.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

mod offsets {
    use super::field::{Field, Rest};

    pub const TYPE: usize = 0;
    pub const CODE: usize = 1;
    pub const CHECKSUM: Field = 2..4;

    pub const ECHO_IDENT: Field = 4..6;
    pub const ECHO_SEQNO: Field = 6..8;

    pub const UNREACH_MTU: Field = 6..8;

    pub const REST: Field = 4..8;
    pub const DATA: Rest = 8..;
}

/// The length of the fixed part of an ICMPv4 header.
pub const HEADER_LEN: usize = 8;

impl<T: AsRef<[u8]>> Packet<T> {
    /// Imbue a raw octet buffer with ICMPv4 packet structure.
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
        if self.buffer.as_ref().len() < HEADER_LEN {
            return Err(Error);
        }
        Ok(())
    }

    pub fn msg_type(&self) -> Message {
        Message::from(self.buffer.as_ref()[offsets::TYPE])
    }

    pub fn msg_code(&self) -> u8 {
        self.buffer.as_ref()[offsets::CODE]
    }

    pub fn checksum(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[offsets::CHECKSUM])
    }

    pub fn echo_ident(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[offsets::ECHO_IDENT])
    }

    pub fn echo_seq_no(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[offsets::ECHO_SEQNO])
    }

    /// The next-hop MTU field of a Fragmentation-Required message.
    pub fn unreach_mtu(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[offsets::UNREACH_MTU])
    }

    /// The four rest-of-header bytes following the checksum.
    pub fn rest_of_header(&self) -> [u8; 4] {
        let mut rest = [0; 4];
        rest.copy_from_slice(&self.buffer.as_ref()[offsets::REST]);
        rest
    }

    /// Validate the message checksum.
    pub fn verify_checksum(&self) -> bool {
        checksum_inverted(self.buffer.as_ref()) == 0
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Packet<&'a T> {
    /// The message body following the fixed header.
    pub fn data(&self) -> &'a [u8] {
        &self.buffer.as_ref()[offsets::DATA]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    pub fn set_msg_type(&mut self, value: Message) {
        self.buffer.as_mut()[offsets::TYPE] = value.into()
    }

    pub fn set_msg_code(&mut self, value: u8) {
        self.buffer.as_mut()[offsets::CODE] = value
    }

    pub fn set_checksum(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[offsets::CHECKSUM], value)
    }

    pub fn set_echo_ident(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[offsets::ECHO_IDENT], value)
    }

    pub fn set_echo_seq_no(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[offsets::ECHO_SEQNO], value)
    }

    pub fn set_rest_of_header(&mut self, rest: [u8; 4]) {
        self.buffer.as_mut()[offsets::REST].copy_from_slice(&rest)
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buffer.as_mut()[offsets::DATA]
    }

    /// Recompute and fill in the message checksum.
    pub fn fill_checksum(&mut self) {
        self.set_checksum(0);
        let checksum = checksum_inverted(self.buffer.as_ref());
        self.set_checksum(checksum);
    }
}

/// A high-level representation of the ICMPv4 messages the stack handles.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[non_exhaustive]
pub enum Repr<'a> {
    EchoRequest {
        ident: u16,
        seq_no: u16,
        data: &'a [u8],
    },
    EchoReply {
        ident: u16,
        seq_no: u16,
        data: &'a [u8],
    },
    DstUnreachable {
        reason: DstUnreachable,
        /// Next-hop MTU; meaningful only for [DstUnreachable::FragRequired].
        mtu: u16,
        /// The embedded IP header plus leading payload bytes.
        data: &'a [u8],
    },
}

impl<'a> Repr<'a> {
    /// Parse an ICMPv4 packet into a high-level representation.
    pub fn parse<T: AsRef<[u8]> + ?Sized>(packet: &Packet<&'a T>) -> Result<Repr<'a>> {
        match (packet.msg_type(), packet.msg_code()) {
            (Message::EchoRequest, 0) => Ok(Repr::EchoRequest {
                ident: packet.echo_ident(),
                seq_no: packet.echo_seq_no(),
                data: packet.data(),
            }),
            (Message::EchoReply, 0) => Ok(Repr::EchoReply {
                ident: packet.echo_ident(),
                seq_no: packet.echo_seq_no(),
                data: packet.data(),
            }),
            (Message::DstUnreachable, code) => Ok(Repr::DstUnreachable {
                reason: DstUnreachable::from(code),
                mtu: packet.unreach_mtu(),
                data: packet.data(),
            }),
            _ => Err(Error),
        }
    }

    /// The length of a packet emitted from this representation.
    pub fn buffer_len(&self) -> usize {
        match self {
            Repr::EchoRequest { data, .. }
            | Repr::EchoReply { data, .. }
            | Repr::DstUnreachable { data, .. } => HEADER_LEN + data.len(),
        }
    }

    /// Emit this representation into a packet, filling the checksum.
    pub fn emit<T: AsRef<[u8]> + AsMut<[u8]>>(&self, packet: &mut Packet<T>) {
        match *self {
            Repr::EchoRequest {
                ident,
                seq_no,
                data,
            } => {
                packet.set_msg_type(Message::EchoRequest);
                packet.set_msg_code(0);
                packet.set_echo_ident(ident);
                packet.set_echo_seq_no(seq_no);
                packet.data_mut()[..data.len()].copy_from_slice(data);
            }
            Repr::EchoReply {
                ident,
                seq_no,
                data,
            } => {
                packet.set_msg_type(Message::EchoReply);
                packet.set_msg_code(0);
                packet.set_echo_ident(ident);
                packet.set_echo_seq_no(seq_no);
                packet.data_mut()[..data.len()].copy_from_slice(data);
            }
            Repr::DstUnreachable { reason, mtu, data } => {
                packet.set_msg_type(Message::DstUnreachable);
                packet.set_msg_code(reason.into());
                let mut rest = [0u8; 4];
                NetworkEndian::write_u16(&mut rest[2..4], mtu);
                packet.set_rest_of_header(rest);
                packet.data_mut()[..data.len()].copy_from_slice(data);
            }
        }
        packet.fill_checksum();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_echo_round_trip() {
        let repr = Repr::EchoRequest {
            ident: 0x1234,
            seq_no: 0x5678,
            data: &[0xff; 6],
        };
        let mut bytes = vec![0xa5; repr.buffer_len()];
        let mut packet = Packet::new_unchecked(&mut bytes[..]);
        repr.emit(&mut packet);

        let packet = Packet::new_checked(&bytes[..]).unwrap();
        assert!(packet.verify_checksum());
        assert_eq!(Repr::parse(&packet).unwrap(), repr);
    }

    #[test]
    fn test_frag_required_mtu() {
        let embedded = [0u8; 28];
        let repr = Repr::DstUnreachable {
            reason: DstUnreachable::FragRequired,
            mtu: 1280,
            data: &embedded,
        };
        let mut bytes = vec![0; repr.buffer_len()];
        let mut packet = Packet::new_unchecked(&mut bytes[..]);
        repr.emit(&mut packet);

        let packet = Packet::new_checked(&bytes[..]).unwrap();
        assert_eq!(packet.unreach_mtu(), 1280);
        match Repr::parse(&packet).unwrap() {
            Repr::DstUnreachable { reason, mtu, .. } => {
                assert_eq!(reason, DstUnreachable::FragRequired);
                assert_eq!(mtu, 1280);
            }
            _ => unreachable!(),
        }
    }
}
