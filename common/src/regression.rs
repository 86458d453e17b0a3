//! Sliding window linear regression used for touch detection.
//!
//! The slope is updated in O(1) per sample by keeping running sums over the
//! window contents. Everything is computed with 32-bit integer arithmetic,
//! the detection thresholds are tuned against the truncation error of the
//! final division.

/// Number of samples in the regression window.
pub const WINDOW_SIZE: usize = 30;

const N: i32 = WINDOW_SIZE as i32;

/// Running sums over the samples currently resident in the window.
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq)]
pub struct Sums {
    pub x: i32,
    pub y: i32,
    pub xx: i32,
    pub xy: i32,
}

/// Fixed capacity ring of `(time, frequency)` pairs.
#[derive(Debug, Clone)]
pub struct SlidingWindowRegression {
    times: [i32; WINDOW_SIZE],
    freqs: [i32; WINDOW_SIZE],
    sums: Sums,
    /// Slot that will be overwritten by the next sample
    next: usize,
    /// Number of samples seen since the last reset, saturating at `WINDOW_SIZE`
    filled: usize,
}

impl Default for SlidingWindowRegression {
    fn default() -> Self {
        Self::new()
    }
}

impl SlidingWindowRegression {
    pub const fn new() -> Self {
        Self {
            times: [0; WINDOW_SIZE],
            freqs: [0; WINDOW_SIZE],
            sums: Sums {
                x: 0,
                y: 0,
                xx: 0,
                xy: 0,
            },
            next: 0,
            filled: 0,
        }
    }

    /// Clear the window and all running sums.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn sums(&self) -> Sums {
        self.sums
    }

    /// Return whether the window holds `WINDOW_SIZE` samples.
    pub fn is_full(&self) -> bool {
        self.filled == WINDOW_SIZE
    }

    /// Insert a sample, evicting the oldest one, and return the new slope.
    ///
    /// The slope is 0 until the window has been filled once.
    pub fn update(&mut self, t: i32, f: i32) -> i32 {
        let i = self.next;
        let (old_t, old_f) = (self.times[i], self.freqs[i]);

        // Empty slots hold zeros, so subtracting them is a no-op
        let sums = &mut self.sums;
        sums.x = sums.x.wrapping_sub(old_t).wrapping_add(t);
        sums.y = sums.y.wrapping_sub(old_f).wrapping_add(f);
        sums.xx = sums
            .xx
            .wrapping_sub(old_t.wrapping_mul(old_t))
            .wrapping_add(t.wrapping_mul(t));
        sums.xy = sums
            .xy
            .wrapping_sub(old_t.wrapping_mul(old_f))
            .wrapping_add(t.wrapping_mul(f));

        self.times[i] = t;
        self.freqs[i] = f;
        self.next = (i + 1) % WINDOW_SIZE;

        if self.filled < WINDOW_SIZE {
            self.filled += 1;
            if self.filled < WINDOW_SIZE {
                return 0;
            }
        }
        self.slope()
    }

    /// slope = (nΣxy - ΣxΣy) / (nΣx² - (Σx)²)
    fn slope(&self) -> i32 {
        let Sums { x, y, xx, xy } = self.sums;
        let numerator = N.wrapping_mul(xy).wrapping_sub(x.wrapping_mul(y));
        let denominator = N.wrapping_mul(xx).wrapping_sub(x.wrapping_mul(x));
        if denominator == 0 {
            return 0;
        }
        numerator.wrapping_div(denominator)
    }
}
