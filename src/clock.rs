//! sd-spi-disk - Time source for bounded waits
//!
//! Every polling loop in the card driver is bounded by a wall-clock deadline
//! taken from an injected [`Clock`]. Tests drive the driver with a simulated
//! clock instead of burning real time.

/// A monotonic millisecond time source.
///
/// The driver only ever compares readings against each other, so the epoch is
/// irrelevant. The count must not go backwards while an operation is in
/// progress.
pub trait Clock {
    /// Milliseconds since some fixed, arbitrary point in the past.
    fn ticks_ms(&self) -> u64;
}

impl<T> Clock for &T
where
    T: Clock,
{
    fn ticks_ms(&self) -> u64 {
        (*self).ticks_ms()
    }
}

/// A deadline computed once at the start of a wait loop and checked on each
/// iteration.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone)]
pub struct Deadline {
    expires_at_ms: u64,
}

impl Deadline {
    /// Compute a deadline `timeout_ms` milliseconds from now.
    pub fn after<C: Clock>(clock: &C, timeout_ms: u32) -> Deadline {
        Deadline {
            expires_at_ms: clock.ticks_ms() + u64::from(timeout_ms),
        }
    }

    /// Has this deadline passed?
    pub fn expired<C: Clock>(&self, clock: &C) -> bool {
        clock.ticks_ms() >= self.expires_at_ms
    }
}
