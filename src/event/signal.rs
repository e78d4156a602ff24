use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Identifies one registered signal within a [SignalBus].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalToken(usize);

impl SignalToken {
    pub const fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Default)]
struct BusState {
    queued: Vec<bool>,
    pending: VecDeque<usize>,
}

struct Shared {
    state: Mutex<BusState>,
    wakeup: Box<dyn Fn() + Send + Sync>,
}

impl core::fmt::Debug for Shared {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Shared").field("state", &self.state).finish()
    }
}

/// The cross-thread half of a signal: raising it queues the token on the
/// bus and wakes the event loop once per empty-to-non-empty transition.
#[derive(Debug, Clone)]
pub struct SignalHandle {
    shared: Arc<Shared>,
    index: usize,
}

impl SignalHandle {
    /// Queue this signal for dispatch on the loop thread. Safe from any
    /// thread; idempotent between dispatches.
    pub fn signal(&self) {
        let wake = {
            let mut state = self.shared.state.lock().unwrap();
            if state.queued[self.index] {
                false
            } else {
                state.queued[self.index] = true;
                let was_empty = state.pending.is_empty();
                state.pending.push_back(self.index);
                was_empty
            }
        };
        if wake {
            (self.shared.wakeup)();
        }
    }

    pub const fn token(&self) -> SignalToken {
        SignalToken(self.index)
    }
}

/// A thread-safe wakeup queue.
///
/// Other threads raise registered signals through [SignalHandle]s; the loop
/// thread drains them with [SignalBus::dispatch]. Handlers run with the
/// internal mutex released, so they may themselves raise signals; a signal
/// raised while its own dispatch is in flight is delivered in the next
/// pass.
#[derive(Debug)]
pub struct SignalBus {
    shared: Arc<Shared>,
}

impl SignalBus {
    /// Create a bus whose `wakeup` is invoked (outside the lock) whenever
    /// the pending list transitions from empty to non-empty.
    pub fn new<W>(wakeup: W) -> SignalBus
    where
        W: Fn() + Send + Sync + 'static,
    {
        SignalBus {
            shared: Arc::new(Shared {
                state: Mutex::new(BusState::default()),
                wakeup: Box::new(wakeup),
            }),
        }
    }

    /// Register a new signal and hand out its raising half.
    pub fn register(&self) -> SignalHandle {
        let index = {
            let mut state = self.shared.state.lock().unwrap();
            state.queued.push(false);
            state.queued.len() - 1
        };
        SignalHandle {
            shared: self.shared.clone(),
            index,
        }
    }

    /// Withdraw a queued signal locally, without dispatching it.
    pub fn reset(&self, token: SignalToken) {
        let mut state = self.shared.state.lock().unwrap();
        if state.queued[token.0] {
            state.queued[token.0] = false;
            state.pending.retain(|&index| index != token.0);
        }
    }

    /// Drain the signals queued at the start of the pass, invoking
    /// `handler` for each with the mutex released. The handler returns
    /// `false` to stop early; undelivered signals stay queued.
    pub fn dispatch<F>(&self, mut handler: F)
    where
        F: FnMut(SignalToken) -> bool,
    {
        let mut batch = {
            let mut state = self.shared.state.lock().unwrap();
            let batch = core::mem::take(&mut state.pending);
            for &index in &batch {
                state.queued[index] = false;
            }
            batch
        };

        while let Some(index) = batch.pop_front() {
            if !handler(SignalToken(index)) {
                // Stopped: put the rest back at the front, oldest first.
                let mut state = self.shared.state.lock().unwrap();
                while let Some(index) = batch.pop_back() {
                    if !state.queued[index] {
                        state.queued[index] = true;
                        state.pending.push_front(index);
                    }
                }
                return;
            }
        }
    }

    /// Whether any signal is currently queued.
    pub fn has_pending(&self) -> bool {
        !self.shared.state.lock().unwrap().pending.is_empty()
    }
}
