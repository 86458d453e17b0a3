//! Time base shared between the timer event and the sampling task.
//!
//! All deadlines exchanged with the host are raw 32-bit tick counts of a
//! free-running 1 MHz counter. The counter wraps after ~71 minutes, so
//! instants must only ever be compared through [`is_before`].

/// Frequency of the system tick counter.
pub const TICK_HZ: u32 = 1_000_000;

pub type Instant = fugit::TimerInstantU32<TICK_HZ>;
pub type Duration = fugit::TimerDurationU32<TICK_HZ>;

/// Source of the current system time.
///
/// Reading the time must be atomic with respect to interrupts.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Return whether `a` lies before `b`, taking counter wrap-around into
/// account. Both instants must be less than half the counter range apart.
#[inline]
pub fn is_before(a: Instant, b: Instant) -> bool {
    (a.ticks().wrapping_sub(b.ticks()) as i32) < 0
}

/// Add a raw tick count to an instant, wrapping at the counter boundary.
#[inline]
pub fn add_ticks(instant: Instant, ticks: u32) -> Instant {
    Instant::from_ticks(instant.ticks().wrapping_add(ticks))
}
