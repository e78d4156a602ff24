use std::collections::{HashMap, VecDeque};

use crate::config::MAX_LISTENER_COUNT;
use crate::error::IpErr;
use crate::event::TimerQueue;
use crate::wire::Ipv4Address;

use super::pcb::{Pcb, State};
use super::{ListenerId, PcbId};

/// The first port of the ephemeral range.
pub(crate) const EPHEMERAL_PORT_BASE: u16 = 49152;

#[derive(Debug)]
pub(crate) struct Listener {
    pub addr: Option<Ipv4Address>,
    pub port: u16,
    /// How many PCBs (SYN_RCVD included) may count against this listener.
    pub max_pcbs: usize,
    pub num_pcbs: usize,
    pub rcv_buf_size: usize,
    pub snd_buf_size: usize,
    /// Established but not yet adopted connections.
    pub accept_queue: VecDeque<PcbId>,
}

type TupleKey = (Ipv4Address, u16, Ipv4Address, u16);

/// The PCB table: slab storage plus the 4-tuple demux index and the
/// listener table.
///
/// The listener table has a fixed capacity; the PCB slab grows only up to
/// the configured `max_pcbs`, enforced on every insertion.
#[derive(Debug)]
pub(crate) struct PcbTable {
    pub pcbs: Vec<Option<Pcb>>,
    free: Vec<usize>,
    lookup: HashMap<TupleKey, PcbId>,
    pub listeners: heapless::Vec<Option<Listener>, MAX_LISTENER_COUNT>,
    max_pcbs: usize,
    num_ephemeral: u16,
    next_ephemeral: u16,
}

impl PcbTable {
    pub fn new(max_pcbs: usize, num_ephemeral: u16) -> PcbTable {
        PcbTable {
            pcbs: Vec::new(),
            free: Vec::new(),
            lookup: HashMap::new(),
            listeners: heapless::Vec::new(),
            max_pcbs,
            num_ephemeral,
            next_ephemeral: EPHEMERAL_PORT_BASE,
        }
    }

    pub fn pcb(&self, id: PcbId) -> &Pcb {
        self.pcbs[id.0].as_ref().expect("stale PCB id")
    }

    pub fn pcb_mut(&mut self, id: PcbId) -> &mut Pcb {
        self.pcbs[id.0].as_mut().expect("stale PCB id")
    }

    pub fn live_pcb(&self, id: PcbId) -> Option<&Pcb> {
        self.pcbs.get(id.0).and_then(|slot| slot.as_ref())
    }

    pub fn live_pcb_mut(&mut self, id: PcbId) -> Option<&mut Pcb> {
        self.pcbs.get_mut(id.0).and_then(|slot| slot.as_mut())
    }

    /// Count of live PCBs.
    pub fn len(&self) -> usize {
        self.pcbs.len() - self.free.len()
    }

    /// Insert a fully formed PCB, indexing its 4-tuple.
    pub fn insert(&mut self, pcb: Pcb) -> Result<PcbId, IpErr> {
        if self.len() >= self.max_pcbs {
            return Err(IpErr::NoPcbAvailable);
        }
        let key = (
            pcb.local_addr,
            pcb.local_port,
            pcb.remote_addr,
            pcb.remote_port,
        );
        if self.lookup.contains_key(&key) {
            return Err(IpErr::AddrInUse);
        }
        let id = match self.free.pop() {
            Some(index) => {
                self.pcbs[index] = Some(pcb);
                PcbId(index)
            }
            None => {
                self.pcbs.push(Some(pcb));
                PcbId(self.pcbs.len() - 1)
            }
        };
        self.lookup.insert(key, id);
        Ok(id)
    }

    /// Detach a PCB from the demux index, its listener quota and its armed
    /// timers, leaving the slab entry in place. Idempotent.
    pub fn unlink(&mut self, id: PcbId, timers: &mut TimerQueue) {
        let (key, listener, out_timer, rtx_timer) = {
            let pcb = self.pcb(id);
            (
                (
                    pcb.local_addr,
                    pcb.local_port,
                    pcb.remote_addr,
                    pcb.remote_port,
                ),
                pcb.listener,
                pcb.out_timer,
                pcb.rtx_timer,
            )
        };
        if self.lookup.get(&key) == Some(&id) {
            self.lookup.remove(&key);
        }
        if let Some(listener_id) = listener {
            if let Some(listener) = self.listeners[listener_id.0].as_mut() {
                listener.num_pcbs -= 1;
                listener.accept_queue.retain(|&queued| queued != id);
            }
            self.pcb_mut(id).listener = None;
        }
        timers.unset(out_timer);
        timers.unset(rtx_timer);
    }

    /// Free a previously unlinked PCB's slab entry and timer slots.
    pub fn release(&mut self, id: PcbId, timers: &mut TimerQueue) -> Pcb {
        let pcb = self.pcbs[id.0].take().expect("stale PCB id");
        self.free.push(id.0);
        timers.remove(pcb.out_timer);
        timers.remove(pcb.rtx_timer);
        pcb
    }

    /// Find the established-side PCB for a 4-tuple.
    pub fn lookup(
        &self,
        local_addr: Ipv4Address,
        local_port: u16,
        remote_addr: Ipv4Address,
        remote_port: u16,
    ) -> Option<PcbId> {
        self.lookup
            .get(&(local_addr, local_port, remote_addr, remote_port))
            .copied()
    }

    /// Find a listener for `(local_addr, local_port)`: an exact address
    /// match wins over a wildcard one.
    pub fn find_listener(&self, local_addr: Ipv4Address, local_port: u16) -> Option<ListenerId> {
        let mut wildcard = None;
        for (at, listener) in self.listeners.iter().enumerate() {
            let Some(listener) = listener else { continue };
            if listener.port != local_port {
                continue;
            }
            match listener.addr {
                Some(addr) if addr == local_addr => return Some(ListenerId(at)),
                None => wildcard = Some(ListenerId(at)),
                _ => (),
            }
        }
        wildcard
    }

    pub fn listener(&self, id: ListenerId) -> &Listener {
        self.listeners[id.0].as_ref().expect("stale listener id")
    }

    pub fn listener_mut(&mut self, id: ListenerId) -> &mut Listener {
        self.listeners[id.0].as_mut().expect("stale listener id")
    }

    pub fn insert_listener(&mut self, listener: Listener) -> Result<ListenerId, IpErr> {
        let duplicate = self.listeners.iter().flatten().any(|existing| {
            existing.port == listener.port
                && (existing.addr.is_none()
                    || listener.addr.is_none()
                    || existing.addr == listener.addr)
        });
        if duplicate {
            return Err(IpErr::AddrInUse);
        }
        match self.listeners.iter().position(|slot| slot.is_none()) {
            Some(at) => {
                self.listeners[at] = Some(listener);
                Ok(ListenerId(at))
            }
            None => {
                let at = self.listeners.len();
                self.listeners
                    .push(Some(listener))
                    .map_err(|_| IpErr::NoPcbAvailable)?;
                Ok(ListenerId(at))
            }
        }
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> Listener {
        self.listeners[id.0].take().expect("stale listener id")
    }

    /// Allocate a local port for a connection towards `(remote, port)`,
    /// scanning the ephemeral range with wraparound.
    pub fn alloc_ephemeral_port(
        &mut self,
        local_addr: Ipv4Address,
        remote_addr: Ipv4Address,
        remote_port: u16,
    ) -> Result<u16, IpErr> {
        for _ in 0..self.num_ephemeral {
            let port = self.next_ephemeral;
            let next = self.next_ephemeral.wrapping_add(1);
            self.next_ephemeral = if next >= EPHEMERAL_PORT_BASE.wrapping_add(self.num_ephemeral)
                || next < EPHEMERAL_PORT_BASE
            {
                EPHEMERAL_PORT_BASE
            } else {
                next
            };
            if self
                .lookup(local_addr, port, remote_addr, remote_port)
                .is_none()
            {
                return Ok(port);
            }
        }
        Err(IpErr::NoPortAvailable)
    }

    /// Ids of every live PCB towards `remote`, for path-MTU fan-out.
    pub fn pcbs_towards(&self, remote: Ipv4Address) -> Vec<PcbId> {
        self.pcbs
            .iter()
            .enumerate()
            .filter_map(|(at, slot)| {
                slot.as_ref().and_then(|pcb| {
                    (pcb.remote_addr == remote && pcb.state.is_synchronized()
                        && pcb.state != State::TimeWait)
                        .then_some(PcbId(at))
                })
            })
            .collect()
    }
}
