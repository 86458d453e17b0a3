#![cfg_attr(not(test), no_std)]
//! # Eddy Current Probe Core
//!
//! Sensor sampling, touch detection and homing logic of the LDC1612 probe
//! firmware. Nothing in here touches hardware directly: the I²C bus, the
//! data ready pins, the clock and the host link are passed in through
//! `embedded-hal` traits and small traits of this crate, so that the whole
//! sample path can be tested on the host.
//!
//! ## Sample Path
//!
//! ```text
//! timer event ──> SampleTimer ──> SampleMailbox ──> sampling task
//!                                                        │
//!                      Ldc1612 (status + data read) <────┤
//!                      BulkBuffer (append, flush)   <────┤
//!                      HomingEngine (check sample)  <────┘
//! ```

pub mod bulk;
pub mod clock;
pub mod homing;
pub mod ldc1612;
pub mod link;
pub mod pool;
pub mod protocol;
pub mod regression;
pub mod scheduler;
pub mod sensor;
