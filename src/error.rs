use core::fmt;

/// Error kinds surfaced at the IP and TCP API boundaries.
///
/// The set is flat on purpose: every layer reports through the same
/// vocabulary, so a TCP caller can see a driver-level condition (say,
/// [`IpErr::OutputBufferFull`]) without translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpErr {
    /// Link-layer address resolution is in progress; retriable.
    ArpQueryInProgress,
    /// The caller reserved too little space in front of the IP header.
    NoHeaderSpace,
    /// The driver transmit queue is full; retriable.
    OutputBufferFull,
    /// Link-layer resolution is impossible for this next hop.
    NoHardwareRoute,
    /// No interface routes to the destination.
    NoIpRoute,
    /// The payload cannot fit even when fragmented.
    PacketTooLarge,
    /// The ephemeral port range is exhausted.
    NoPortAvailable,
    /// The PCB table is full.
    NoPcbAvailable,
    /// The path-MTU cache is full.
    NoMtuEntryAvailable,
    /// DF was set and the datagram exceeds the path MTU.
    FragmentationNeeded,
    /// The driver reported a hardware fault.
    HardwareError,
    /// The link is down.
    LinkDown,
    /// The destination is a broadcast address and broadcast was not allowed.
    BroadcastRejected,
    /// The source address is not assigned to the selected interface.
    NonLocalSrc,
    /// The local address/port tuple is already bound.
    AddrInUse,
}

impl IpErr {
    /// Whether the failure is inherently transient and a retry-request,
    /// if one was supplied, has been registered.
    pub const fn is_retriable(&self) -> bool {
        matches!(self, IpErr::ArpQueryInProgress | IpErr::OutputBufferFull)
    }
}

impl fmt::Display for IpErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpErr::ArpQueryInProgress => write!(f, "ARP query in progress"),
            IpErr::NoHeaderSpace => write!(f, "not enough header space reserved"),
            IpErr::OutputBufferFull => write!(f, "driver output buffer full"),
            IpErr::NoHardwareRoute => write!(f, "no hardware route"),
            IpErr::NoIpRoute => write!(f, "no IP route"),
            IpErr::PacketTooLarge => write!(f, "packet too large"),
            IpErr::NoPortAvailable => write!(f, "no ephemeral port available"),
            IpErr::NoPcbAvailable => write!(f, "no PCB available"),
            IpErr::NoMtuEntryAvailable => write!(f, "no path-MTU entry available"),
            IpErr::FragmentationNeeded => write!(f, "fragmentation needed but DF set"),
            IpErr::HardwareError => write!(f, "hardware error"),
            IpErr::LinkDown => write!(f, "link down"),
            IpErr::BroadcastRejected => write!(f, "broadcast destination rejected"),
            IpErr::NonLocalSrc => write!(f, "source address not local"),
            IpErr::AddrInUse => write!(f, "address in use"),
        }
    }
}

impl std::error::Error for IpErr {}
