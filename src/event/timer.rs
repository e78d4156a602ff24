use crate::time::Instant;

/// Identifies one timer in a [TimerQueue].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(usize);

impl TimerToken {
    pub const fn index(self) -> usize {
        self.0
    }
}

/// The timer lifecycle.
///
/// `Pending` timers compare on their deadline. During a dispatch pass,
/// expired timers are flipped to `Dispatch` one at a time and handed to the
/// owner; mutations made by handlers while the pass is open are recorded as
/// `TempSet`/`TempUnset` and applied when the pass closes. This keeps
/// iteration well-defined no matter what the handlers do to other timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Pending(Instant),
    Dispatch,
    TempUnset,
    TempSet(Instant),
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Free { next_free: Option<usize> },
    Used(State),
}

/// A queue of absolute deadlines on the monotonic clock.
///
/// Timers are slab entries owned by their creator; there are no stored
/// callbacks. A dispatch pass looks like:
///
/// ```ignore
/// timers.start_dispatch(now);
/// while let Some(token) = timers.next_expired() {
///     owner.handle_timer(token);   // may set/unset any timer
/// }
/// timers.finish_dispatch();
/// ```
#[derive(Debug)]
pub struct TimerQueue {
    slots: Vec<Slot>,
    first_free: Option<usize>,
    dispatching: bool,
    dispatch_now: Instant,
}

impl TimerQueue {
    pub fn new() -> TimerQueue {
        TimerQueue {
            slots: Vec::new(),
            first_free: None,
            dispatching: false,
            dispatch_now: Instant::ZERO,
        }
    }

    /// Allocate a timer in the unset state.
    pub fn insert(&mut self) -> TimerToken {
        match self.first_free {
            Some(index) => {
                let Slot::Free { next_free } = self.slots[index] else {
                    unreachable!("free list points at a used slot");
                };
                self.first_free = next_free;
                self.slots[index] = Slot::Used(State::Idle);
                TimerToken(index)
            }
            None => {
                self.slots.push(Slot::Used(State::Idle));
                TimerToken(self.slots.len() - 1)
            }
        }
    }

    /// Release a timer. Must not be called for the timer currently being
    /// dispatched.
    pub fn remove(&mut self, token: TimerToken) {
        debug_assert!(matches!(self.slots[token.0], Slot::Used(_)));
        self.slots[token.0] = Slot::Free {
            next_free: self.first_free,
        };
        self.first_free = Some(token.0);
    }

    fn state(&self, token: TimerToken) -> State {
        match self.slots[token.0] {
            Slot::Used(state) => state,
            Slot::Free { .. } => panic!("stale timer token"),
        }
    }

    fn set_state(&mut self, token: TimerToken, state: State) {
        self.slots[token.0] = Slot::Used(state);
    }

    /// Arm the timer with an absolute deadline, replacing any previous one.
    pub fn set(&mut self, token: TimerToken, deadline: Instant) {
        if self.dispatching {
            self.set_state(token, State::TempSet(deadline));
        } else {
            self.set_state(token, State::Pending(deadline));
        }
    }

    /// Disarm the timer. Valid from any context, including the timer's own
    /// dispatch.
    pub fn unset(&mut self, token: TimerToken) {
        if self.dispatching {
            match self.state(token) {
                State::Idle => (),
                _ => self.set_state(token, State::TempUnset),
            }
        } else {
            self.set_state(token, State::Idle);
        }
    }

    pub fn is_set(&self, token: TimerToken) -> bool {
        matches!(
            self.state(token),
            State::Pending(_) | State::Dispatch | State::TempSet(_)
        )
    }

    /// The armed deadline, if any.
    pub fn deadline(&self, token: TimerToken) -> Option<Instant> {
        match self.state(token) {
            State::Pending(deadline) | State::TempSet(deadline) => Some(deadline),
            _ => None,
        }
    }

    /// The earliest armed deadline across all timers; what the event loop
    /// should sleep until.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots
            .iter()
            .filter_map(|slot| match slot {
                Slot::Used(State::Pending(deadline)) => Some(*deadline),
                Slot::Used(State::TempSet(deadline)) => Some(*deadline),
                _ => None,
            })
            .min()
    }

    /// Open a dispatch pass: timers with `deadline <= now` become eligible.
    pub fn start_dispatch(&mut self, now: Instant) {
        debug_assert!(!self.dispatching);
        self.dispatching = true;
        self.dispatch_now = now;
    }

    /// The next expired timer in non-decreasing deadline order, flipped
    /// into the dispatch state. Returns `None` when the pass is drained.
    pub fn next_expired(&mut self) -> Option<TimerToken> {
        debug_assert!(self.dispatching);
        let mut best: Option<(usize, Instant)> = None;
        for (index, slot) in self.slots.iter().enumerate() {
            if let Slot::Used(State::Pending(deadline)) = slot {
                if *deadline <= self.dispatch_now
                    && best.map_or(true, |(_, b)| *deadline < b)
                {
                    best = Some((index, *deadline));
                }
            }
        }
        best.map(|(index, _)| {
            self.set_state(TimerToken(index), State::Dispatch);
            TimerToken(index)
        })
    }

    /// Close the dispatch pass, applying the batched handler intents:
    /// `TempSet` timers become pending, `TempUnset` and fired-but-untouched
    /// timers become idle.
    pub fn finish_dispatch(&mut self) {
        debug_assert!(self.dispatching);
        for slot in self.slots.iter_mut() {
            if let Slot::Used(state) = slot {
                match *state {
                    State::Dispatch | State::TempUnset => *state = State::Idle,
                    State::TempSet(deadline) => *state = State::Pending(deadline),
                    State::Idle | State::Pending(_) => (),
                }
            }
        }
        self.dispatching = false;
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}
