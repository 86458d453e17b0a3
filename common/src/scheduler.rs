//! Periodic sample scheduling and the interrupt-to-task handoff.
//!
//! The timer event runs in interrupt context. It only touches the
//! [`SampleTimer`] of its sensor and posts to the sensor's [`SampleMailbox`].
//! The sampling task later takes the mailbox and performs the bus
//! transactions.
//!
//! The mailbox holds at most one pending sample. Posting while a sample is
//! still pending counts an overflow, the actual data backlog lives in the
//! chip and in the bulk buffer.

use core::cell::Cell;

use critical_section::Mutex;
use embedded_hal::digital::v2::InputPin;

use crate::clock::{add_ticks, Instant};

#[derive(Copy, Clone, Default, Debug, PartialEq, Eq)]
struct MailboxState {
    pending: bool,
    overflows: u16,
}

/// Single slot handoff between the timer event and the sampling task.
///
/// Every access runs inside a critical section.
pub struct SampleMailbox {
    state: Mutex<Cell<MailboxState>>,
}

impl Default for SampleMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleMailbox {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(Cell::new(MailboxState {
                pending: false,
                overflows: 0,
            })),
        }
    }

    /// Count an overflow if the previous sample was not consumed yet.
    ///
    /// Return whether an overflow was recorded.
    pub fn check_overflow(&self) -> bool {
        critical_section::with(|cs| {
            let cell = self.state.borrow(cs);
            let mut state = cell.get();
            if !state.pending {
                return false;
            }
            state.overflows = state.overflows.wrapping_add(1);
            cell.set(state);
            true
        })
    }

    /// Mark a sample as pending.
    pub fn post(&self) {
        critical_section::with(|cs| {
            let cell = self.state.borrow(cs);
            let mut state = cell.get();
            state.pending = true;
            cell.set(state);
        })
    }

    pub fn is_pending(&self) -> bool {
        critical_section::with(|cs| self.state.borrow(cs).get().pending)
    }

    /// Clear the pending flag and drain the overflow counter.
    ///
    /// Return the number of overflows since the last call.
    pub fn take(&self) -> u16 {
        critical_section::with(|cs| {
            let cell = self.state.borrow(cs);
            let overflows = cell.get().overflows;
            cell.set(MailboxState::default());
            overflows
        })
    }

    /// Drop any pending sample and overflow count.
    pub fn reset(&self) {
        critical_section::with(|cs| self.state.borrow(cs).set(MailboxState::default()))
    }
}

/// The next timer event to schedule.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Schedule {
    pub at: Instant,
    /// Identifies the arming this event belongs to
    pub epoch: u8,
}

/// Outcome of a timer event.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TimerEvent {
    /// The sampling task must be woken.
    pub wake: bool,
    pub next: Schedule,
}

/// The data ready line of a sensor.
///
/// The LDC1612 INTB pin is active low.
pub trait DataReady {
    fn is_asserted(&mut self) -> bool;
}

impl<P: InputPin> DataReady for P {
    fn is_asserted(&mut self) -> bool {
        // A failing pin read is treated as "not ready", the sample is picked
        // up on the next period
        self.is_low().unwrap_or(false)
    }
}

/// Fixed period sample timer of one sensor.
pub struct SampleTimer<P> {
    rest_ticks: u32,
    waketime: Instant,
    running: bool,
    epoch: u8,
    data_ready: Option<P>,
}

impl<P: DataReady> SampleTimer<P> {
    pub fn new(data_ready: Option<P>) -> Self {
        Self {
            rest_ticks: 0,
            waketime: Instant::from_ticks(0),
            running: false,
            epoch: 0,
            data_ready,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn rest_ticks(&self) -> u32 {
        self.rest_ticks
    }

    pub fn has_data_ready(&self) -> bool {
        self.data_ready.is_some()
    }

    /// Sample the data ready line, `None` when polling the status register.
    pub fn data_ready_asserted(&mut self) -> Option<bool> {
        self.data_ready.as_mut().map(|pin| pin.is_asserted())
    }

    /// Start sampling every `rest_ticks` ticks. A zero interval stops
    /// sampling.
    ///
    /// Any previously scheduled event is invalidated. Return the first event
    /// to schedule.
    pub fn arm(&mut self, mailbox: &SampleMailbox, now: Instant, rest_ticks: u32) -> Option<Schedule> {
        self.disarm(mailbox);
        if rest_ticks == 0 {
            return None;
        }
        self.rest_ticks = rest_ticks;
        self.waketime = add_ticks(now, rest_ticks);
        self.running = true;
        Some(Schedule {
            at: self.waketime,
            epoch: self.epoch,
        })
    }

    /// Stop sampling and invalidate the scheduled event.
    pub fn disarm(&mut self, mailbox: &SampleMailbox) {
        self.running = false;
        self.epoch = self.epoch.wrapping_add(1);
        mailbox.reset();
    }

    /// Handle the timer event of `epoch`.
    ///
    /// Stale events (from before the last `arm`/`disarm`) return `None` and
    /// must not be rescheduled.
    pub fn on_event(&mut self, mailbox: &SampleMailbox, epoch: u8) -> Option<TimerEvent> {
        if !self.running || epoch != self.epoch {
            return None;
        }
        if mailbox.check_overflow() {
            log::debug!("Sample overflow");
        }
        let wake = match self.data_ready.as_mut() {
            None => true,
            Some(pin) => pin.is_asserted(),
        };
        if wake {
            mailbox.post();
        }
        // Fixed period, measured from the previous deadline
        self.waketime = add_ticks(self.waketime, self.rest_ticks);
        Some(TimerEvent {
            wake,
            next: Schedule {
                at: self.waketime,
                epoch: self.epoch,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakePin(bool);

    impl DataReady for FakePin {
        fn is_asserted(&mut self) -> bool {
            self.0
        }
    }

    fn at(ticks: u32) -> Instant {
        Instant::from_ticks(ticks)
    }

    #[test]
    fn test_mailbox_counts_overflows() {
        let mailbox = SampleMailbox::new();
        assert!(!mailbox.check_overflow());
        mailbox.post();
        assert!(mailbox.is_pending());
        assert!(mailbox.check_overflow());
        assert!(mailbox.check_overflow());
        assert_eq!(mailbox.take(), 2);
        assert!(!mailbox.is_pending());
        assert_eq!(mailbox.take(), 0);
    }

    #[test]
    fn test_arm_schedules_first_event() {
        let mailbox = SampleMailbox::new();
        let mut timer: SampleTimer<FakePin> = SampleTimer::new(None);
        let schedule = timer.arm(&mailbox, at(1000), 250).unwrap();
        assert_eq!(schedule.at, at(1250));
        assert!(timer.is_running());
        assert_eq!(timer.rest_ticks(), 250);
    }

    #[test]
    fn test_arm_zero_stops() {
        let mailbox = SampleMailbox::new();
        let mut timer: SampleTimer<FakePin> = SampleTimer::new(None);
        let schedule = timer.arm(&mailbox, at(0), 100).unwrap();
        mailbox.post();
        assert_eq!(timer.arm(&mailbox, at(50), 0), None);
        assert!(!timer.is_running());
        assert!(!mailbox.is_pending());
        assert_eq!(timer.on_event(&mailbox, schedule.epoch), None);
    }

    #[test]
    fn test_polling_event_posts_and_reschedules_fixed_period() {
        let mailbox = SampleMailbox::new();
        let mut timer: SampleTimer<FakePin> = SampleTimer::new(None);
        let mut schedule = timer.arm(&mailbox, at(0), 100).unwrap();
        for n in 2..=5 {
            let event = timer.on_event(&mailbox, schedule.epoch).unwrap();
            assert!(event.wake);
            assert_eq!(event.next.at, at(100 * n));
            schedule = event.next;
        }
        assert!(mailbox.is_pending());
        // Three events fired while the first sample was still pending
        assert_eq!(mailbox.take(), 3);
    }

    #[test]
    fn test_data_ready_pin_gates_wakeup() {
        let mailbox = SampleMailbox::new();
        let mut timer = SampleTimer::new(Some(FakePin(false)));
        assert!(timer.has_data_ready());
        let schedule = timer.arm(&mailbox, at(0), 100).unwrap();

        let event = timer.on_event(&mailbox, schedule.epoch).unwrap();
        assert!(!event.wake);
        assert!(!mailbox.is_pending());

        timer.data_ready = Some(FakePin(true));
        assert_eq!(timer.data_ready_asserted(), Some(true));
        let event = timer.on_event(&mailbox, event.next.epoch).unwrap();
        assert!(event.wake);
        assert!(mailbox.is_pending());
    }

    #[test]
    fn test_stale_event_ignored_after_rearm() {
        let mailbox = SampleMailbox::new();
        let mut timer: SampleTimer<FakePin> = SampleTimer::new(None);
        let old = timer.arm(&mailbox, at(0), 100).unwrap();
        let new = timer.arm(&mailbox, at(10), 100).unwrap();
        assert_ne!(old.epoch, new.epoch);
        assert_eq!(timer.on_event(&mailbox, old.epoch), None);
        assert!(!mailbox.is_pending());
        let event = timer.on_event(&mailbox, new.epoch).unwrap();
        assert_eq!(event.next.at, at(210));
    }

    #[test]
    fn test_rearm_resets_overflows() {
        let mailbox = SampleMailbox::new();
        let mut timer: SampleTimer<FakePin> = SampleTimer::new(None);
        let schedule = timer.arm(&mailbox, at(0), 100).unwrap();
        let event = timer.on_event(&mailbox, schedule.epoch).unwrap();
        timer.on_event(&mailbox, event.next.epoch).unwrap();
        timer.arm(&mailbox, at(500), 100).unwrap();
        assert_eq!(mailbox.take(), 0);
    }
}
