//! RTIC Monotonic implementation for the STM32L0 TIM2 timer.
//!
//! TIM2 is a 16-bit timer on the STM32L0. It is prescaled to 1 MHz and
//! software-extended to 32 bit by incrementing an overflow counter every time
//! the timer overflows (every 65.5 ms). The extended counter wraps after ~71
//! minutes, the timing code in `eddyprobe_common::clock` copes with that.

use eddyprobe_common::clock::{self, TICK_HZ};
use rtic::Monotonic;
use stm32l0xx_hal::pac;

/// Frequency of the timer input clock (APB1 at HSI16).
const TIMER_CLOCK_HZ: u32 = 16_000_000;

/// Software-extended TIM2.
pub struct ExtendedTim2 {
    timer: pac::TIM2,
    overflow: u16,
}

impl ExtendedTim2 {
    pub fn init(timer: pac::TIM2) -> Self {
        // Enable and reset TIM2 in RCC
        //
        // Correctness: Since we only modify TIM2 related registers in the RCC
        // register block, and since we own pac::TIM2, we should be safe.
        unsafe {
            let rcc = &*pac::RCC::ptr();
            rcc.apb1enr.modify(|_, w| w.tim2en().set_bit());
            rcc.apb1rstr.modify(|_, w| w.tim2rst().set_bit());
            rcc.apb1rstr.modify(|_, w| w.tim2rst().clear_bit());
        }

        // Tick at TICK_HZ, count the full 16 bit range
        timer
            .psc
            .write(|w| unsafe { w.bits(TIMER_CLOCK_HZ / TICK_HZ - 1) });
        timer.arr.write(|w| unsafe { w.bits(0xffff) });

        // Load the prescaler, then drop the update flag caused by doing so
        timer.egr.write(|w| w.ug().set_bit());
        timer.sr.modify(|_, w| w.uif().clear_bit());

        // Enable the compare-match and the overflow interrupt
        timer
            .dier
            .modify(|_, w| w.cc1ie().set_bit().uie().set_bit());

        Self { timer, overflow: 0 }
    }

    fn is_overflow(&self) -> bool {
        self.timer.sr.read().uif().bit_is_set()
    }

    fn clear_overflow_flag(&self) {
        self.timer.sr.modify(|_, w| w.uif().clear_bit());
    }
}

impl Monotonic for ExtendedTim2 {
    // Since we are counting overflows we can't let RTIC disable the interrupt.
    const DISABLE_INTERRUPT_ON_EMPTY_QUEUE: bool = false;

    type Instant = clock::Instant;
    type Duration = clock::Duration;

    /// Return the current time.
    #[inline(always)]
    fn now(&mut self) -> Self::Instant {
        let counter = self.timer.cnt.read().bits() & 0xffff;

        // If the overflow bit is set, it means that `on_interrupt` (which
        // clears the flag) was not yet called. A small counter value tells
        // that the overflow happened before the counter was read.
        let overflow = if self.is_overflow() && counter < 0x8000 {
            self.overflow.wrapping_add(1)
        } else {
            self.overflow
        } as u32;

        Self::Instant::from_ticks((overflow << 16) | counter)
    }

    /// The time at time zero. Used by RTIC before the monotonic has been initialized.
    #[inline(always)]
    fn zero() -> Self::Instant {
        Self::Instant::from_ticks(0)
    }

    /// Start the counter.
    ///
    /// This method will be called exactly once by the RTIC runtime after
    /// `#[init]` returns and before tasks start.
    ///
    /// # Correctness
    ///
    /// The user may not call this method.
    unsafe fn reset(&mut self) {
        self.timer.cnt.write(|w| w.bits(0));
        self.timer.cr1.modify(|_, w| w.cen().set_bit());
    }

    /// Set the compare value of the timer interrupt.
    fn set_compare(&mut self, instant: Self::Instant) {
        let now = self.now();

        let compare_register_val = match instant.checked_duration_since(now) {
            // If the scheduled instant is too far in the future, we can't set
            // an exact deadline. Set it to 0, RTIC will handle re-scheduling
            // after the next overflow.
            Some(duration) if duration.ticks() > 0xffff => 0,

            // Instant is in the past. RTIC will handle this.
            None => 0,

            // Value will not overflow the 16-bit register.
            Some(_) => instant.ticks() & 0xffff,
        };

        self.timer
            .ccr1
            .write(|w| unsafe { w.bits(compare_register_val) });
    }

    /// Clear the compare interrupt flag.
    fn clear_compare_flag(&mut self) {
        self.timer.sr.modify(|_, w| w.cc1if().clear_bit());
    }

    /// Called at the end of the interrupt handler after all other operations
    /// have finished.
    fn on_interrupt(&mut self) {
        // If there was an overflow, increment the overflow counter.
        if self.is_overflow() {
            self.clear_overflow_flag();
            self.overflow = self.overflow.wrapping_add(1);
        }
    }
}
