/*! Time structures.

The stack is driven by a monotonic clock supplied by the embedding event
loop. Two structures are provided:

* [Instant], an absolute point on that clock;
* [Duration], a relative span of time.

Both carry millisecond precision, which is sufficient for every protocol
timer in the stack (the shortest is the delayed-output tick).
*/

use core::{fmt, ops};

/// A point on the monotonic clock, expressed in milliseconds.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant {
    millis: i64,
}

impl Instant {
    pub const ZERO: Instant = Instant::from_millis_const(0);

    pub fn from_millis<T: Into<i64>>(millis: T) -> Instant {
        Instant {
            millis: millis.into(),
        }
    }

    pub const fn from_millis_const(millis: i64) -> Instant {
        Instant { millis }
    }

    pub fn from_secs<T: Into<i64>>(secs: T) -> Instant {
        Instant {
            millis: secs.into() * 1000,
        }
    }

    /// The number of whole seconds that have passed since the epoch.
    pub const fn secs(&self) -> i64 {
        self.millis / 1000
    }

    /// The fractional number of milliseconds that have passed since the epoch.
    pub const fn millis(&self) -> i64 {
        self.millis % 1000
    }

    /// The total number of milliseconds that have passed since the epoch.
    pub const fn total_millis(&self) -> i64 {
        self.millis
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{:03}s", self.secs(), self.millis())
    }
}

impl ops::Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Instant {
        Instant::from_millis(self.millis + rhs.total_millis() as i64)
    }
}

impl ops::AddAssign<Duration> for Instant {
    fn add_assign(&mut self, rhs: Duration) {
        self.millis += rhs.total_millis() as i64;
    }
}

impl ops::Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, rhs: Duration) -> Instant {
        Instant::from_millis(self.millis - rhs.total_millis() as i64)
    }
}

impl ops::Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, rhs: Instant) -> Duration {
        Duration::from_millis((self.millis - rhs.millis).unsigned_abs())
    }
}

/// A relative span of time, expressed in milliseconds.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Duration {
    millis: u64,
}

impl Duration {
    pub const ZERO: Duration = Duration::from_millis(0);

    pub const fn from_millis(millis: u64) -> Duration {
        Duration { millis }
    }

    pub const fn from_secs(secs: u64) -> Duration {
        Duration {
            millis: secs * 1000,
        }
    }

    /// The number of whole seconds in this `Duration`.
    pub const fn secs(&self) -> u64 {
        self.millis / 1000
    }

    /// The fractional number of milliseconds in this `Duration`.
    pub const fn millis(&self) -> u64 {
        self.millis % 1000
    }

    /// The total number of milliseconds in this `Duration`.
    pub const fn total_millis(&self) -> u64 {
        self.millis
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{:03}s", self.secs(), self.millis())
    }
}

impl ops::Add<Duration> for Duration {
    type Output = Duration;

    fn add(self, rhs: Duration) -> Duration {
        Duration::from_millis(self.millis + rhs.millis)
    }
}

impl ops::AddAssign<Duration> for Duration {
    fn add_assign(&mut self, rhs: Duration) {
        self.millis += rhs.millis;
    }
}

impl ops::Sub<Duration> for Duration {
    type Output = Duration;

    fn sub(self, rhs: Duration) -> Duration {
        Duration::from_millis(
            self.millis
                .checked_sub(rhs.millis)
                .expect("overflow when subtracting durations"),
        )
    }
}

impl ops::Mul<u32> for Duration {
    type Output = Duration;

    fn mul(self, rhs: u32) -> Duration {
        Duration::from_millis(self.millis * rhs as u64)
    }
}

impl ops::Div<u32> for Duration {
    type Output = Duration;

    fn div(self, rhs: u32) -> Duration {
        Duration::from_millis(self.millis / rhs as u64)
    }
}
