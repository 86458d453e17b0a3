//! Homing state machine.
//!
//! A homing session is armed by the host with `setup_home`. Every decoded
//! sample is then passed to [`HomingEngine::check_sample`], which decides
//! whether the probe has reached the bed. The decision is signaled exactly
//! once per armed session through a [`TriggerSync`].
//!
//! Two detection methods are supported:
//!
//! - Threshold homing: trigger as soon as the raw frequency exceeds a
//!   host-provided threshold.
//! - Touch homing: trigger when the frequency curve flattens out after a steep
//!   rise, i.e. when the nozzle touches the bed and the probe stops
//!   approaching it. See [`TouchDetector`].

use core::convert::TryFrom;

use crate::clock::{is_before, Instant};
use crate::regression::SlidingWindowRegression;

/// Raw values above this have at least one of the four error bits of the
/// LDC1612 data register set.
pub const CORRUPTION_SENTINEL: u32 = 0x0fff_ffff;

/// Raw values are reduced modulo this before entering the regression.
pub const FREQ_MODULUS: u32 = 10_000_000;

/// Slope which starts the corner check.
pub const START_THRESHOLD_SLOPE: i32 = 1500;

/// Corner count which confirms a touch if the slope never got steep.
pub const BASE_TRIGGER_FACTOR: u32 = 27;

/// The synchronization primitive which halts axis motion.
pub trait TriggerSync {
    /// Signal the sync object `sync_oid` with `reason`.
    fn trigger(&mut self, sync_oid: u8, reason: u8);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum HomingMode {
    Threshold = 0,
    Touch = 1,
}

impl TryFrom<u8> for HomingMode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Threshold),
            1 => Ok(Self::Touch),
            other => Err(other),
        }
    }
}

/// Parameters of a `setup_home` request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HomingRequest {
    /// No trigger is allowed for samples taken before this instant.
    pub grace_deadline: Instant,
    /// Zero disarms the session.
    pub trigger_threshold: u32,
    pub sync_oid: u8,
    pub trigger_reason: u8,
    pub error_reason: u8,
    pub mode: HomingMode,
}

/// Session state. `Disabled` means the session can not trigger.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HomingState {
    Disabled,
    Threshold {
        awaiting_grace: bool,
    },
    Touch {
        awaiting_grace: bool,
        /// Set once the slope exceeded `START_THRESHOLD_SLOPE`, never cleared
        /// while the session is armed.
        checking: bool,
    },
}

/// Result of feeding one sample into the engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SampleOutcome {
    /// Session not armed, or sample identical to the previous one.
    Ignored,
    /// Sample was evaluated, no decision yet.
    Pending,
    Triggered { reason: u8 },
    Errored { reason: u8 },
}

/// Corner detection on top of the sliding window regression.
///
/// A "corner" sample is one where the signal is still rising (or flat) while
/// its slope is falling. A touch is confirmed once enough consecutive corner
/// samples have been seen, with steeper approaches needing fewer.
#[derive(Debug, Clone, Default)]
pub struct TouchDetector {
    regression: SlidingWindowRegression,
    /// Time axis of the regression, counts samples since arming
    sample_count: i32,
    corner_count: u32,
    last_slope: i32,
}

impl TouchDetector {
    pub const fn new() -> Self {
        Self {
            regression: SlidingWindowRegression::new(),
            sample_count: 0,
            corner_count: 0,
            last_slope: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn corner_count(&self) -> u32 {
        self.corner_count
    }

    pub fn last_slope(&self) -> i32 {
        self.last_slope
    }

    /// Feed a sample, return the current slope.
    ///
    /// `previous` is the raw value of the preceding sample.
    pub fn update(&mut self, previous: u32, data: u32) -> i32 {
        self.sample_count = self.sample_count.wrapping_add(1);
        let slope = self
            .regression
            .update(self.sample_count, (data % FREQ_MODULUS) as i32);
        self.corner_count = if slope < self.last_slope && previous <= data {
            self.corner_count.saturating_add(1)
        } else {
            0
        };
        self.last_slope = slope;
        slope
    }
}

/// Number of consecutive corner samples required at the given slope.
pub fn trigger_factor(slope: i32) -> u32 {
    if slope > 10_000 {
        3
    } else if slope > 8_500 {
        5
    } else if slope > 5_500 {
        15
    } else {
        BASE_TRIGGER_FACTOR
    }
}

/// Per-sensor homing session.
#[derive(Debug, Clone)]
pub struct HomingEngine {
    state: HomingState,
    /// Grace deadline while armed, time of the notification afterwards
    homing_clock: Instant,
    trigger_threshold: u32,
    sync_oid: Option<u8>,
    trigger_reason: u8,
    error_reason: u8,
    last_data: u32,
    touch: TouchDetector,
}

impl Default for HomingEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl HomingEngine {
    pub const fn new() -> Self {
        Self {
            state: HomingState::Disabled,
            homing_clock: Instant::from_ticks(0),
            trigger_threshold: 0,
            sync_oid: None,
            trigger_reason: 0,
            error_reason: 0,
            last_data: 0,
            touch: TouchDetector::new(),
        }
    }

    pub fn state(&self) -> HomingState {
        self.state
    }

    /// Return whether a notification may still be sent.
    pub fn can_trigger(&self) -> bool {
        self.state != HomingState::Disabled
    }

    /// The grace deadline while armed, or the time of the last notification.
    pub fn homing_clock(&self) -> Instant {
        self.homing_clock
    }

    pub fn sync_oid(&self) -> Option<u8> {
        self.sync_oid
    }

    pub fn touch(&self) -> &TouchDetector {
        &self.touch
    }

    /// Arm or disarm (zero threshold) the session.
    pub fn setup(&mut self, request: &HomingRequest) {
        self.trigger_threshold = request.trigger_threshold;
        if request.trigger_threshold == 0 {
            self.sync_oid = None;
            self.state = HomingState::Disabled;
            return;
        }
        self.homing_clock = request.grace_deadline;
        self.sync_oid = Some(request.sync_oid);
        self.trigger_reason = request.trigger_reason;
        self.error_reason = request.error_reason;
        self.last_data = 0;
        self.touch.reset();
        self.state = match request.mode {
            HomingMode::Threshold => HomingState::Threshold {
                awaiting_grace: true,
            },
            HomingMode::Touch => HomingState::Touch {
                awaiting_grace: true,
                checking: false,
            },
        };
    }

    /// Evaluate a raw sample taken at `now`.
    pub fn check_sample(
        &mut self,
        data: u32,
        now: Instant,
        sync: &mut impl TriggerSync,
    ) -> SampleOutcome {
        if self.state == HomingState::Disabled || data == self.last_data {
            return SampleOutcome::Ignored;
        }
        let previous = self.last_data;
        self.last_data = data;

        if data > CORRUPTION_SENTINEL {
            log::warn!("Sensor reports error (raw data {:#010x})", data);
            let reason = self.error_reason;
            self.notify(now, reason, sync);
            return SampleOutcome::Errored { reason };
        }

        let grace_over = !is_before(now, self.homing_clock);
        match self.state {
            HomingState::Disabled => SampleOutcome::Ignored,
            HomingState::Threshold { awaiting_grace } => {
                if awaiting_grace {
                    if !grace_over {
                        return SampleOutcome::Pending;
                    }
                    self.state = HomingState::Threshold {
                        awaiting_grace: false,
                    };
                }
                if data > self.trigger_threshold {
                    self.fire_trigger(now, sync)
                } else {
                    SampleOutcome::Pending
                }
            }
            HomingState::Touch {
                awaiting_grace,
                mut checking,
            } => {
                // Statistics are tracked during the grace window as well
                let slope = self.touch.update(previous, data);
                if awaiting_grace && !grace_over {
                    return SampleOutcome::Pending;
                }
                if !checking && slope > START_THRESHOLD_SLOPE {
                    log::debug!("Touch check started at slope {}", slope);
                    checking = true;
                }
                self.state = HomingState::Touch {
                    awaiting_grace: false,
                    checking,
                };
                if checking && self.touch.corner_count() > trigger_factor(slope) {
                    self.fire_trigger(now, sync)
                } else {
                    SampleOutcome::Pending
                }
            }
        }
    }

    fn fire_trigger(&mut self, now: Instant, sync: &mut impl TriggerSync) -> SampleOutcome {
        let reason = self.trigger_reason;
        log::debug!("Homing trigger at {} (reason {})", now.ticks(), reason);
        self.notify(now, reason, sync);
        SampleOutcome::Triggered { reason }
    }

    fn notify(&mut self, now: Instant, reason: u8, sync: &mut impl TriggerSync) {
        self.state = HomingState::Disabled;
        self.homing_clock = now;
        if let Some(sync_oid) = self.sync_oid {
            sync.trigger(sync_oid, reason);
        }
    }
}
