use heapless::Vec;

use crate::config::{MAX_REASS_ENTRIES, MAX_REASS_SIZE};
use crate::storage::Assembler;
use crate::time::{Duration, Instant};
use crate::wire::{Ipv4FragKey, Ipv4Repr};

#[derive(Debug)]
struct ReassEntry {
    key: Ipv4FragKey,
    /// Header of the offset-zero fragment; a placeholder from whichever
    /// fragment arrived first until then.
    header: Ipv4Repr,
    have_first: bool,
    buffer: std::vec::Vec<u8>,
    ranges: Assembler,
    /// Known once the fragment without MF arrives.
    total_len: Option<usize>,
    expires_at: Instant,
}

enum Outcome {
    Continue,
    Discard,
}

/// Datagram reassembly, keyed by `(src, dst, proto, ident)`.
///
/// Capacity is static; when every slot is live the oldest entry is
/// dropped. Entries that outlive the timeout are purged lazily on access
/// and eagerly by [ReassemblyTable::poll].
#[derive(Debug)]
pub struct ReassemblyTable {
    entries: Vec<ReassEntry, MAX_REASS_ENTRIES>,
    timeout: Duration,
}

impl ReassemblyTable {
    pub fn new(timeout: Duration) -> ReassemblyTable {
        ReassemblyTable {
            entries: Vec::new(),
            timeout,
        }
    }

    /// Drop entries whose hold timer has run out.
    pub fn poll(&mut self, now: Instant) {
        let mut at = 0;
        while at < self.entries.len() {
            if self.entries[at].expires_at <= now {
                net_debug!("reass: entry timed out");
                self.entries.remove(at);
            } else {
                at += 1;
            }
        }
    }

    /// The next instant at which [poll] has work to do.
    ///
    /// [poll]: #method.poll
    pub fn next_expiry(&self) -> Option<Instant> {
        self.entries.iter().map(|e| e.expires_at).min()
    }

    fn entry_for(&mut self, key: Ipv4FragKey, header: Ipv4Repr, now: Instant) -> Option<usize> {
        if let Some(at) = self.entries.iter().position(|e| e.key == key) {
            return Some(at);
        }
        let fresh = ReassEntry {
            key,
            header,
            have_first: false,
            buffer: std::vec::Vec::new(),
            ranges: Assembler::new(),
            total_len: None,
            expires_at: now + self.timeout,
        };
        if self.entries.is_full() {
            // Drop the entry closest to expiry.
            let oldest = self
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.expires_at)
                .map(|(at, _)| at)?;
            net_debug!("reass: table full, dropping oldest entry");
            self.entries[oldest] = fresh;
            Some(oldest)
        } else {
            let _ = self.entries.push(fresh);
            Some(self.entries.len() - 1)
        }
    }

    /// Fold one fragment in. Returns the reassembled datagram header and
    /// payload when this fragment completed it.
    pub fn process_fragment(
        &mut self,
        key: Ipv4FragKey,
        header: Ipv4Repr,
        frag_offset: usize,
        more_frags: bool,
        payload: &[u8],
        now: Instant,
    ) -> Option<(Ipv4Repr, std::vec::Vec<u8>)> {
        self.poll(now);

        let end = frag_offset + payload.len();
        if end > MAX_REASS_SIZE {
            net_debug!("reass: datagram beyond maximum size, dropped");
            return None;
        }
        // Every fragment but the last carries a multiple of 8 bytes.
        if more_frags && payload.len() % 8 != 0 {
            net_debug!("reass: non-final fragment with ragged length, dropped");
            return None;
        }

        let at = self.entry_for(key, header, now)?;
        let outcome = {
            let entry = &mut self.entries[at];

            if frag_offset == 0 {
                entry.header = header;
                entry.have_first = true;
            }
            if !more_frags {
                match entry.total_len {
                    // Conflicting final fragments discard the entry.
                    Some(total) if total != end => Outcome::Discard,
                    _ => {
                        entry.total_len = Some(end);
                        Outcome::Continue
                    }
                }
            } else {
                Outcome::Continue
            }
        };

        match outcome {
            Outcome::Discard => {
                self.entries.remove(at);
                return None;
            }
            Outcome::Continue => (),
        }

        let complete = {
            let entry = &mut self.entries[at];
            if entry.buffer.len() < end {
                entry.buffer.resize(end, 0);
            }
            entry.buffer[frag_offset..end].copy_from_slice(payload);
            if entry.ranges.add(frag_offset as u32, end as u32).is_err() {
                net_debug!("reass: too many holes, fragment dropped");
                return None;
            }
            match entry.total_len {
                Some(total) => entry.have_first && entry.ranges.is_complete(total as u32),
                None => false,
            }
        };

        if complete {
            let mut entry = self.entries.remove(at);
            let total = entry.total_len.unwrap_or(0);
            entry.buffer.truncate(total);
            let mut header = entry.header;
            header.payload_len = total;
            Some((header, entry.buffer))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::wire::{IpProtocol, Ipv4Address};

    fn key(ident: u16) -> Ipv4FragKey {
        Ipv4FragKey {
            src_addr: Ipv4Address::new(10, 0, 0, 1),
            dst_addr: Ipv4Address::new(10, 0, 0, 2),
            protocol: IpProtocol::Udp,
            ident,
        }
    }

    fn header(payload_len: usize) -> Ipv4Repr {
        Ipv4Repr {
            src_addr: Ipv4Address::new(10, 0, 0, 1),
            dst_addr: Ipv4Address::new(10, 0, 0, 2),
            next_header: IpProtocol::Udp,
            payload_len,
            hop_limit: 64,
        }
    }

    #[test]
    fn test_in_order_reassembly() {
        let mut table = ReassemblyTable::new(Duration::from_secs(10));
        let now = Instant::ZERO;
        let data: std::vec::Vec<u8> = (0..32u8).collect();

        assert!(table
            .process_fragment(key(7), header(16), 0, true, &data[..16], now)
            .is_none());
        let (hdr, payload) = table
            .process_fragment(key(7), header(16), 16, false, &data[16..], now)
            .unwrap();
        assert_eq!(payload, data);
        assert_eq!(hdr.payload_len, 32);
    }

    #[test]
    fn test_out_of_order_and_interleaved() {
        let mut table = ReassemblyTable::new(Duration::from_secs(10));
        let now = Instant::ZERO;
        let a: std::vec::Vec<u8> = (0..48u8).collect();
        let b: std::vec::Vec<u8> = (100..148u8).collect();

        assert!(table
            .process_fragment(key(1), header(16), 32, false, &a[32..], now)
            .is_none());
        assert!(table
            .process_fragment(key(2), header(16), 16, true, &b[16..32], now)
            .is_none());
        assert!(table
            .process_fragment(key(1), header(16), 16, true, &a[16..32], now)
            .is_none());
        assert!(table
            .process_fragment(key(2), header(16), 0, true, &b[..16], now)
            .is_none());
        let (_, pa) = table
            .process_fragment(key(1), header(16), 0, true, &a[..16], now)
            .unwrap();
        let (_, pb) = table
            .process_fragment(key(2), header(16), 32, false, &b[32..], now)
            .unwrap();
        assert_eq!(pa, a);
        assert_eq!(pb, b);
    }

    #[test]
    fn test_timeout_discards() {
        let mut table = ReassemblyTable::new(Duration::from_secs(10));
        let data = [0u8; 16];
        assert!(table
            .process_fragment(key(1), header(16), 0, true, &data, Instant::ZERO)
            .is_none());
        assert_eq!(table.next_expiry(), Some(Instant::from_secs(10)));
        // After expiry, the final fragment alone does not complete anything.
        let later = Instant::from_secs(11);
        assert!(table
            .process_fragment(key(1), header(16), 16, false, &data, later)
            .is_none());
    }
}
