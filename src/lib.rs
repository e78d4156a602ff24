/*! A user-space IPv4/TCP networking stack for embedding in applications.

The typical deployment bridges a host process to the operating system
through a TAP virtual Ethernet device: the embedder owns the event loop
and the link driver, the stack owns everything between the IP header and
the application byte stream.

The crate is layered the way the packets flow:

* [buf] — scatter/gather byte chains shared by every layer;
* [checksum] — the incremental Internet checksum engine;
* [wire] — typed packet access (IPv4, ICMPv4, TCP);
* [event] — the timer queue and the cross-thread signal bus the
  embedding event loop drives;
* [iface] — per-link state and the driver contract;
* [ip] — routing, fragmentation, reassembly, path-MTU, ICMP;
* [tcp] — the TCP protocol machine and its listener/connection surface;
* [stack] — one struct wiring the layers to a single event loop.

No threads are spawned and nothing is global: a [stack::NetStack] is a
plain value owned by its event loop, and the only cross-thread entry
point is the [event::SignalBus].
*/

#[macro_use]
mod macros;

pub mod buf;
pub mod checksum;
pub mod config;
pub mod error;
pub mod event;
pub mod iface;
pub mod ip;
mod rand;
pub mod stack;
pub mod storage;
pub mod tcp;
pub mod time;
pub mod wire;

#[cfg(test)]
mod testutil;
