/*! Interface state and the driver binding.

An [Iface] couples one IP-capable link to the stack: its MTU, hardware
kind, optional address assignment, optional gateway, and the driver that
actually moves packets. The driver side of the contract is the [IpDriver]
trait; the stack never sees link-layer framing, it only reserves
`header_before_ip` bytes of headroom in front of every IP header it hands
over.

Protocol listeners registered on an interface tap received datagrams ahead
of the regular transport dispatch; the first listener that reports the
packet consumed suppresses everything after it.
*/

use heapless::Vec;

use crate::buf::BufRef;
use crate::config::{IFACE_MAX_LISTENER_COUNT, MIN_MTU};
use crate::error::IpErr;
use crate::event::SignalHandle;
use crate::wire::{IpProtocol, Ipv4Address, Ipv4Cidr, Ipv4Repr};

/// Notified when a retriable driver failure clears; see
/// [IpDriver::send_ip4_packet].
pub type RetryHandle = SignalHandle;

/// Identifies one interface within the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IfaceId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwType {
    Ethernet,
    Loopback,
}

/// Link state as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverState {
    pub link_up: bool,
}

/// The contract a link driver implements towards the stack.
pub trait IpDriver {
    /// Transmit one IPv4 packet. `pkt` starts at the IP header;
    /// `header_before_ip` bytes in front of it are revealable within the
    /// first chunk for link framing. The referenced memory does not
    /// outlive the call.
    ///
    /// If the driver fails with a retriable error
    /// ([IpErr::ArpQueryInProgress], [IpErr::OutputBufferFull]) and
    /// `retry` was supplied, it must signal that handle exactly once when
    /// a retry has a chance of succeeding.
    fn send_ip4_packet(
        &mut self,
        pkt: BufRef<'_>,
        next_hop: Ipv4Address,
        retry: Option<&RetryHandle>,
    ) -> Result<(), IpErr>;

    fn driver_state(&self) -> DriverState;
}

/// An address assignment; all pieces are derived from one CIDR block and
/// are present together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IfaceAddr {
    pub addr: Ipv4Address,
    pub netmask: Ipv4Address,
    pub prefix: u8,
    pub bcast: Ipv4Address,
}

impl IfaceAddr {
    pub fn from_cidr(cidr: Ipv4Cidr) -> IfaceAddr {
        IfaceAddr {
            addr: cidr.address(),
            netmask: cidr.netmask(),
            prefix: cidr.prefix_len(),
            bcast: cidr.broadcast(),
        }
    }

    pub fn contains(&self, addr: &Ipv4Address) -> bool {
        let mask = self.netmask.to_bits();
        self.addr.to_bits() & mask == addr.to_bits() & mask
    }
}

/// A per-interface receive tap, consulted before transport dispatch.
pub trait ProtoListener {
    /// Returns `true` when the datagram was consumed.
    fn recv_ip4(&mut self, header: &Ipv4Repr, payload: &[u8]) -> bool;
}

/// One IP-capable link.
pub struct Iface<D> {
    mtu: u16,
    hw_type: HwType,
    addr: Option<IfaceAddr>,
    gateway: Option<Ipv4Address>,
    driver: D,
    listeners: Vec<(IpProtocol, Box<dyn ProtoListener>), IFACE_MAX_LISTENER_COUNT>,
}

impl<D: IpDriver> Iface<D> {
    /// Bind a driver as a new interface.
    ///
    /// # Panics
    /// Panics if `mtu` is below the minimum the stack operates with.
    pub fn new(driver: D, hw_type: HwType, mtu: u16) -> Iface<D> {
        assert!(mtu >= MIN_MTU, "interface MTU below minimum");
        Iface {
            mtu,
            hw_type,
            addr: None,
            gateway: None,
            driver,
            listeners: Vec::new(),
        }
    }

    pub const fn mtu(&self) -> u16 {
        self.mtu
    }

    pub const fn hw_type(&self) -> HwType {
        self.hw_type
    }

    pub const fn addr(&self) -> Option<&IfaceAddr> {
        self.addr.as_ref()
    }

    pub const fn gateway(&self) -> Option<Ipv4Address> {
        self.gateway
    }

    /// Assign or clear the interface address; the netmask, prefix and
    /// directed broadcast move together with it.
    pub fn set_addr(&mut self, cidr: Option<Ipv4Cidr>) {
        self.addr = cidr.map(IfaceAddr::from_cidr);
    }

    pub fn set_gateway(&mut self, gateway: Option<Ipv4Address>) {
        self.gateway = gateway;
    }

    pub fn driver_state(&self) -> DriverState {
        self.driver.driver_state()
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Register a receive tap for `proto`.
    pub fn add_listener(
        &mut self,
        proto: IpProtocol,
        listener: Box<dyn ProtoListener>,
    ) -> Result<(), IpErr> {
        self.listeners
            .push((proto, listener))
            .map_err(|_| IpErr::NoPcbAvailable)
    }

    /// Offer a received datagram to the taps; `true` when consumed.
    pub(crate) fn offer_to_listeners(&mut self, header: &Ipv4Repr, payload: &[u8]) -> bool {
        for (proto, listener) in self.listeners.iter_mut() {
            if *proto == header.next_header && listener.recv_ip4(header, payload) {
                return true;
            }
        }
        false
    }

    pub(crate) fn send(
        &mut self,
        pkt: BufRef<'_>,
        next_hop: Ipv4Address,
        retry: Option<&RetryHandle>,
    ) -> Result<(), IpErr> {
        if !self.driver.driver_state().link_up {
            return Err(IpErr::LinkDown);
        }
        self.driver.send_ip4_packet(pkt, next_hop, retry)
    }
}

impl<D> core::fmt::Debug for Iface<D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Iface")
            .field("mtu", &self.mtu)
            .field("hw_type", &self.hw_type)
            .field("addr", &self.addr)
            .field("gateway", &self.gateway)
            .finish()
    }
}
