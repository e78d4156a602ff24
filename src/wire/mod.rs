/*! Low-level packet access and construction.

The `wire` module deals with packet *representation*, at two levels.

* The `Packet` family of structures wraps a byte buffer and provides
  typed accessors for the fields of one header, e.g. [Ipv4Packet] or
  [TcpPacket]. `Packet::new_checked` must be used on untrusted input; as
  long as it succeeded and the buffer is not modified, no accessor will
  panic. When emitting into a caller-sized buffer, `new_unchecked` is the
  correct constructor; a length check against stale buffer contents would
  be meaningless.

* The `Repr` family is a compact high-level representation that can be
  parsed from and emitted into a `Packet`, e.g. [Ipv4Repr] or [TcpRepr].
  `Repr::parse` never panics after a successful `check_len`, and
  `Repr::emit` never panics into a buffer of at least `buffer_len` bytes.

Checksums are always filled on emit and always verified explicitly by the
protocol engines, never implicitly by the parsers; a receive-side policy
decision (silent drop) belongs to the engine, not the representation.
*/

use core::fmt;

mod field {
    pub type Field = ::core::ops::Range<usize>;
    pub type Rest = ::core::ops::RangeFrom<usize>;
}

pub(crate) mod ipv4;
pub use self::ipv4::{
    Address as Ipv4Address, AddressExt as Ipv4AddressExt, Cidr as Ipv4Cidr, Key as Ipv4FragKey,
    Packet as Ipv4Packet, Protocol as IpProtocol, Repr as Ipv4Repr, HEADER_LEN as IPV4_HEADER_LEN,
};

mod icmpv4;
pub use self::icmpv4::{
    DstUnreachable as Icmpv4DstUnreachable, Message as Icmpv4Message, Packet as Icmpv4Packet,
    Repr as Icmpv4Repr,
};

mod tcp;
pub use self::tcp::{
    Control as TcpControl, Packet as TcpPacket, Repr as TcpRepr, SeqNumber as TcpSeqNumber,
    TcpOption, HEADER_LEN as TCP_HEADER_LEN, MAX_HEADER_LEN as TCP_MAX_HEADER_LEN,
};

/// Parsing a packet failed: it is malformed or not supported by the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error;

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wire::Error")
    }
}

pub type Result<T> = core::result::Result<T, Error>;
