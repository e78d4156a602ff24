//! Shared test fixtures.

use std::cell::RefCell;
use std::rc::Rc;

use crate::buf::BufRef;
use crate::error::IpErr;
use crate::iface::{DriverState, IpDriver, RetryHandle};
use crate::wire::Ipv4Address;

/// Frames captured from a [MockDriver], shared with the test body.
pub type CapturedFrames = Rc<RefCell<Vec<(Vec<u8>, Ipv4Address)>>>;

/// A driver that records every packet it is asked to transmit.
pub struct MockDriver {
    pub sent: CapturedFrames,
    pub link_up: bool,
    /// When set, every send fails with this error.
    pub fail: Option<IpErr>,
}

impl MockDriver {
    pub fn new() -> (MockDriver, CapturedFrames) {
        let sent: CapturedFrames = Rc::new(RefCell::new(Vec::new()));
        (
            MockDriver {
                sent: sent.clone(),
                link_up: true,
                fail: None,
            },
            sent,
        )
    }
}

impl IpDriver for MockDriver {
    fn send_ip4_packet(
        &mut self,
        pkt: BufRef<'_>,
        next_hop: Ipv4Address,
        _retry: Option<&RetryHandle>,
    ) -> Result<(), IpErr> {
        if let Some(err) = self.fail {
            return Err(err);
        }
        let mut bytes = vec![0u8; pkt.len()];
        let mut cursor = pkt;
        cursor.take_into(&mut bytes);
        self.sent.borrow_mut().push((bytes, next_hop));
        Ok(())
    }

    fn driver_state(&self) -> DriverState {
        DriverState {
            link_up: self.link_up,
        }
    }
}
