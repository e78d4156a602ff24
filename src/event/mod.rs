/*! Event-loop facing primitives.

The stack does not own an event loop; it exposes the two pieces an
embedding loop needs:

* a [TimerQueue] of absolute monotonic deadlines with two-phase dispatch,
  so timer handlers may freely mutate any timer, their own included;
* a [SignalBus] other threads use to schedule work on the loop thread,
  performing exactly one wakeup per empty-to-non-empty transition.

The expected loop shape is: drain expired timers in deadline order, drain
the signal bus, process I/O, then sleep until
[TimerQueue::next_deadline].
*/

mod signal;
mod timer;

pub use self::signal::{SignalBus, SignalHandle, SignalToken};
pub use self::timer::{TimerQueue, TimerToken};
