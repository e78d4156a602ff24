use heapless::Vec;

use crate::config::{MAX_PMTU_ENTRIES, MIN_MTU};
use crate::error::IpErr;
use crate::time::{Duration, Instant};
use crate::wire::Ipv4Address;

#[derive(Debug, Clone, Copy)]
struct PmtuEntry {
    remote: Ipv4Address,
    mtu: u16,
    stale_at: Instant,
}

/// Per-remote-address path-MTU estimates.
///
/// Estimates start at the interface MTU (clamped to the configured
/// ceiling) and only ever shrink, driven by ICMP Fragmentation-Required
/// hints and local driver refusals; they never drop below [MIN_MTU].
/// Entries age out after `timeout` and expired slots are recycled first
/// when the fixed-capacity table fills up.
#[derive(Debug)]
pub struct PmtuCache {
    entries: Vec<PmtuEntry, MAX_PMTU_ENTRIES>,
    timeout: Duration,
    max_estimate: u16,
}

impl PmtuCache {
    pub fn new(timeout: Duration, max_estimate: u16) -> PmtuCache {
        PmtuCache {
            entries: Vec::new(),
            timeout,
            max_estimate,
        }
    }

    fn position(&self, remote: &Ipv4Address) -> Option<usize> {
        self.entries.iter().position(|e| e.remote == *remote)
    }

    /// The current estimate for `remote`, if one is cached and fresh.
    pub fn query(&self, remote: &Ipv4Address, now: Instant) -> Option<u16> {
        self.position(remote)
            .map(|at| &self.entries[at])
            .filter(|e| e.stale_at > now)
            .map(|e| e.mtu)
    }

    /// The estimate for `remote`, creating an entry at `iface_mtu`
    /// (clamped to the ceiling) when none exists.
    pub fn get_or_insert(
        &mut self,
        remote: Ipv4Address,
        iface_mtu: u16,
        now: Instant,
    ) -> Result<u16, IpErr> {
        if let Some(at) = self.position(&remote) {
            let entry = &mut self.entries[at];
            if entry.stale_at <= now {
                // Expired: restart from the interface MTU.
                entry.mtu = iface_mtu.min(self.max_estimate);
            }
            entry.stale_at = now + self.timeout;
            return Ok(entry.mtu);
        }

        let fresh = PmtuEntry {
            remote,
            mtu: iface_mtu.min(self.max_estimate),
            stale_at: now + self.timeout,
        };
        if self.entries.is_full() {
            match self.entries.iter().position(|e| e.stale_at <= now) {
                Some(at) => self.entries[at] = fresh,
                None => return Err(IpErr::NoMtuEntryAvailable),
            }
        } else {
            // Capacity was just checked.
            let _ = self.entries.push(fresh);
        }
        Ok(fresh.mtu)
    }

    /// Apply an ICMP Fragmentation-Required hint (or a local driver
    /// refusal with `mtu_hint = iface_mtu`).
    ///
    /// The estimate is lowered to `min(iface_mtu, max(MIN_MTU, mtu_hint))`
    /// iff that is strictly smaller than the current one; a zero hint from
    /// a legacy router is accepted and lands on the floor. Returns the new
    /// estimate when it changed, so the caller can fan out to interested
    /// connections.
    pub fn handle_packet_too_big(
        &mut self,
        remote: Ipv4Address,
        mtu_hint: u16,
        iface_mtu: u16,
        now: Instant,
    ) -> Option<u16> {
        let at = self.position(&remote)?;
        let entry = &mut self.entries[at];
        let lowered = iface_mtu.min(mtu_hint.max(MIN_MTU));
        if lowered < entry.mtu {
            entry.mtu = lowered;
            entry.stale_at = now + self.timeout;
            net_debug!("pmtu: {} estimate lowered to {}", remote, lowered);
            Some(lowered)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const REMOTE: Ipv4Address = Ipv4Address::new(10, 0, 0, 99);

    fn cache() -> PmtuCache {
        PmtuCache::new(Duration::from_secs(600), 65535)
    }

    #[test]
    fn test_estimate_lowers_only() {
        let mut c = cache();
        let now = Instant::ZERO;
        assert_eq!(c.get_or_insert(REMOTE, 1500, now), Ok(1500));
        assert_eq!(c.handle_packet_too_big(REMOTE, 1300, 1500, now), Some(1300));
        // A larger hint does not raise the estimate back.
        assert_eq!(c.handle_packet_too_big(REMOTE, 1400, 1500, now), None);
        assert_eq!(c.query(&REMOTE, now), Some(1300));
    }

    #[test]
    fn test_zero_hint_clamps_to_floor() {
        let mut c = cache();
        let now = Instant::ZERO;
        c.get_or_insert(REMOTE, 1500, now).unwrap();
        assert_eq!(
            c.handle_packet_too_big(REMOTE, 0, 1500, now),
            Some(MIN_MTU)
        );
    }

    #[test]
    fn test_capacity_recycles_expired() {
        let mut c = cache();
        let now = Instant::ZERO;
        for i in 0..MAX_PMTU_ENTRIES {
            c.get_or_insert(Ipv4Address::new(10, 0, 1, i as u8), 1500, now)
                .unwrap();
        }
        assert_eq!(
            c.get_or_insert(REMOTE, 1500, now),
            Err(IpErr::NoMtuEntryAvailable)
        );
        // After the timeout every slot is reusable.
        let later = now + Duration::from_secs(601);
        assert_eq!(c.get_or_insert(REMOTE, 1500, later), Ok(1500));
    }

    #[test]
    fn test_expired_estimate_resets() {
        let mut c = cache();
        let now = Instant::ZERO;
        c.get_or_insert(REMOTE, 1500, now).unwrap();
        c.handle_packet_too_big(REMOTE, 600, 1500, now).unwrap();
        let later = now + Duration::from_secs(601);
        assert_eq!(c.get_or_insert(REMOTE, 1500, later), Ok(1500));
    }
}
