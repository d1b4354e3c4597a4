use rustix::time::{ClockId, Timespec};
use std::{marker::PhantomData, time::Duration};

/// Monotonic clock
#[derive(Debug)]
pub struct Monotonic;

/// Defines a clock with a specific kind
#[derive(Debug, Clone, Copy)]
pub struct Clock<Kind> {
    _kind: PhantomData<Kind>,
}

impl Clock<Monotonic> {
    /// Initialize a new clock
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Clock { _kind: PhantomData }
    }

    /// Returns the current time
    pub fn now(&self) -> Time<Monotonic> {
        rustix::time::clock_gettime(ClockId::Monotonic).into()
    }
}

/// A point in time for a clock with a specific kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Time<Kind> {
    tv_sec: i64,
    tv_nsec: u32,
    _kind: PhantomData<Kind>,
}

impl<Kind> Time<Kind> {
    /// Create a time from raw seconds and nanoseconds
    pub fn from_parts(tv_sec: i64, tv_nsec: u32) -> Self {
        Time {
            tv_sec,
            tv_nsec,
            _kind: PhantomData,
        }
    }

    /// Seconds part of this time
    pub fn tv_sec(&self) -> i64 {
        self.tv_sec
    }

    /// Nanoseconds part of this time
    pub fn tv_nsec(&self) -> u32 {
        self.tv_nsec
    }

    /// This time as a full nanosecond count
    pub fn as_nanos(&self) -> u64 {
        self.tv_sec as u64 * 1_000_000_000 + self.tv_nsec as u64
    }

    /// This time as a [`Duration`] since the clock epoch
    pub fn as_duration(&self) -> Duration {
        Duration::new(self.tv_sec as u64, self.tv_nsec)
    }
}

impl<Kind> From<Timespec> for Time<Kind> {
    fn from(tp: Timespec) -> Self {
        Time {
            tv_sec: tp.tv_sec as i64,
            tv_nsec: tp.tv_nsec as u32,
            _kind: PhantomData,
        }
    }
}
