//! One configured eddy current sensor.

use core::fmt::Debug;

use embedded_hal::blocking::i2c::WriteRead;

use crate::bulk::{BulkBuffer, BulkSink, BulkStatus, BYTES_PER_SAMPLE};
use crate::clock::{Clock, Instant};
use crate::homing::{HomingEngine, HomingRequest, SampleOutcome, TriggerSync};
use crate::ldc1612::{decode_sample, BusError, BusFaultPolicy, Ldc1612, STATUS_UNREADCONV0};
use crate::scheduler::SampleMailbox;

/// Reply to a home state query.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HomeState {
    pub oid: u8,
    /// Whether the session can still trigger
    pub homing: bool,
    pub trigger_clock: u32,
}

/// What happened while processing a pending sample.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SampleReport {
    /// The chip had no unread conversion.
    NoData,
    /// A bus error was tolerated, the sample is lost.
    Dropped,
    Sample {
        data: u32,
        outcome: SampleOutcome,
        /// The bulk buffer was shipped after this sample.
        flushed: bool,
    },
}

/// Task context state of a sensor: the device handle, its bulk buffer and
/// its homing session.
pub struct SensorInstance {
    device: Ldc1612,
    has_data_ready: bool,
    bulk: BulkBuffer,
    homing: HomingEngine,
}

impl SensorInstance {
    pub fn new(device: Ldc1612, has_data_ready: bool) -> Self {
        Self {
            device,
            has_data_ready,
            bulk: BulkBuffer::new(),
            homing: HomingEngine::new(),
        }
    }

    pub fn device(&self) -> Ldc1612 {
        self.device
    }

    pub fn has_data_ready(&self) -> bool {
        self.has_data_ready
    }

    pub fn bulk(&self) -> &BulkBuffer {
        &self.bulk
    }

    pub fn homing(&self) -> &HomingEngine {
        &self.homing
    }

    /// Prepare the bulk buffer for a new measurement run.
    pub fn start_sampling(&mut self) {
        self.bulk.reset();
    }

    pub fn setup_home(&mut self, request: &HomingRequest) {
        self.homing.setup(request);
    }

    pub fn home_state(&self, oid: u8) -> HomeState {
        HomeState {
            oid,
            homing: self.homing.can_trigger(),
            trigger_clock: self.homing.homing_clock().ticks(),
        }
    }

    /// Read and process one pending sample.
    ///
    /// Clears the pending flag of `mailbox`. Bus errors are only returned
    /// if `policy` demands a shutdown.
    #[allow(clippy::too_many_arguments)]
    pub fn process_sample<I2C, E>(
        &mut self,
        oid: u8,
        i2c: &mut I2C,
        mailbox: &SampleMailbox,
        clock: &impl Clock,
        policy: BusFaultPolicy,
        sync: &mut impl TriggerSync,
        sink: &mut impl BulkSink,
    ) -> Result<SampleReport, BusError<E>>
    where
        I2C: WriteRead<Error = E>,
        E: Debug,
    {
        // Reading the status also releases the INTB line, so the pending
        // flag may only be cleared afterwards
        let status = self.device.read_status(i2c);
        let overflows = mailbox.take();
        self.bulk.add_overflows(overflows);

        let status = match status {
            Ok(status) => status,
            Err(e) => return handle_bus_fault(e, policy).map(|()| SampleReport::Dropped),
        };
        if status & STATUS_UNREADCONV0 == 0 {
            return Ok(SampleReport::NoData);
        }

        let sample = match self.device.read_sample(i2c) {
            Ok(sample) => sample,
            Err(e) => return handle_bus_fault(e, policy).map(|()| SampleReport::Dropped),
        };
        self.bulk.append(&sample);

        let data = decode_sample(&sample);
        let outcome = self.homing.check_sample(data, clock.now(), sync);

        let flushed = !self.bulk.has_room();
        if flushed {
            self.bulk.flush(oid, sink);
        }
        Ok(SampleReport::Sample {
            data,
            outcome,
            flushed,
        })
    }

    /// Status based on the data ready line, sampled at `time`.
    pub fn status_from_pin(&self, oid: u8, time: Instant, asserted: bool) -> BulkStatus {
        let fifo = if asserted { BYTES_PER_SAMPLE as u32 } else { 0 };
        self.bulk.status(oid, time, 0, fifo)
    }

    /// Status based on an extra status register read. The duration of the
    /// read is reported for latency estimation.
    pub fn status_polled<I2C, E>(
        &self,
        oid: u8,
        i2c: &mut I2C,
        clock: &impl Clock,
        policy: BusFaultPolicy,
    ) -> Result<BulkStatus, BusError<E>>
    where
        I2C: WriteRead<Error = E>,
        E: Debug,
    {
        let time1 = clock.now();
        let status = self.device.read_status(i2c);
        let time2 = clock.now();
        let status = match status {
            Ok(status) => status,
            Err(e) => {
                handle_bus_fault(e, policy)?;
                0
            }
        };
        let fifo = if status & STATUS_UNREADCONV0 != 0 {
            BYTES_PER_SAMPLE as u32
        } else {
            0
        };
        let query_ticks = time2.ticks().wrapping_sub(time1.ticks());
        Ok(self.bulk.status(oid, time1, query_ticks, fifo))
    }
}

fn handle_bus_fault<E: Debug>(error: BusError<E>, policy: BusFaultPolicy) -> Result<(), BusError<E>> {
    match policy {
        BusFaultPolicy::Tolerate => {
            log::warn!("{}", error);
            Ok(())
        }
        BusFaultPolicy::Shutdown => Err(error),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use core::cell::Cell;

    use crate::bulk::tests::RecordingSink;
    use crate::bulk::BULK_DATA_SIZE;
    use crate::homing::HomingMode;
    use crate::ldc1612::registers;
    use crate::ldc1612::tests::{FakeBus, Nack};

    pub(crate) const ADDR: u8 = 0x2a;

    /// Clock advancing by `step` ticks on every read.
    pub(crate) struct SteppingClock {
        pub ticks: Cell<u32>,
        pub step: u32,
    }

    impl SteppingClock {
        pub fn new(start: u32, step: u32) -> Self {
            Self {
                ticks: Cell::new(start),
                step,
            }
        }
    }

    impl Clock for SteppingClock {
        fn now(&self) -> Instant {
            let now = self.ticks.get();
            self.ticks.set(now.wrapping_add(self.step));
            Instant::from_ticks(now)
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingSync {
        pub calls: Vec<(u8, u8)>,
    }

    impl TriggerSync for RecordingSync {
        fn trigger(&mut self, sync_oid: u8, reason: u8) {
            self.calls.push((sync_oid, reason));
        }
    }

    fn ready_bus(data: u32) -> FakeBus {
        let mut bus = FakeBus::default();
        bus.set(ADDR, registers::STATUS, Some(STATUS_UNREADCONV0));
        bus.set_sample(ADDR, data);
        bus
    }

    #[test]
    fn test_process_sample_appends_and_clears_pending() {
        let mut sensor = SensorInstance::new(Ldc1612::new(ADDR), false);
        let mut bus = ready_bus(0x0012_3456);
        let mailbox = SampleMailbox::new();
        mailbox.post();
        mailbox.check_overflow();
        let clock = SteppingClock::new(0, 1);
        let mut sync = RecordingSync::default();
        let mut sink = RecordingSink::default();

        let report = sensor
            .process_sample(
                0,
                &mut bus,
                &mailbox,
                &clock,
                BusFaultPolicy::Shutdown,
                &mut sync,
                &mut sink,
            )
            .unwrap();
        assert_eq!(
            report,
            SampleReport::Sample {
                data: 0x0012_3456,
                outcome: SampleOutcome::Ignored,
                flushed: false,
            }
        );
        assert!(!mailbox.is_pending());
        assert_eq!(sensor.bulk().len(), BYTES_PER_SAMPLE);
        assert_eq!(sensor.bulk().possible_overflows(), 1);
        assert_eq!(bus.reads, vec![(ADDR, 0x18), (ADDR, 0x00), (ADDR, 0x01)]);
    }

    #[test]
    fn test_no_data_ready() {
        let mut sensor = SensorInstance::new(Ldc1612::new(ADDR), false);
        let mut bus = FakeBus::default();
        bus.set(ADDR, registers::STATUS, Some(0x0000));
        let mailbox = SampleMailbox::new();
        mailbox.post();
        let report = sensor
            .process_sample(
                0,
                &mut bus,
                &mailbox,
                &SteppingClock::new(0, 1),
                BusFaultPolicy::Shutdown,
                &mut RecordingSync::default(),
                &mut RecordingSink::default(),
            )
            .unwrap();
        assert_eq!(report, SampleReport::NoData);
        assert!(!mailbox.is_pending());
        assert!(sensor.bulk().is_empty());
    }

    #[test]
    fn test_flushes_before_buffer_would_overflow() {
        let mut sensor = SensorInstance::new(Ldc1612::new(ADDR), false);
        let mailbox = SampleMailbox::new();
        let clock = SteppingClock::new(0, 1);
        let mut sync = RecordingSync::default();
        let mut sink = RecordingSink::default();
        let samples_per_flush = BULK_DATA_SIZE / BYTES_PER_SAMPLE;

        for i in 0..2 * samples_per_flush as u32 {
            let mut bus = ready_bus(1000 + i);
            mailbox.post();
            sensor
                .process_sample(
                    5,
                    &mut bus,
                    &mailbox,
                    &clock,
                    BusFaultPolicy::Shutdown,
                    &mut sync,
                    &mut sink,
                )
                .unwrap();
        }
        assert_eq!(sink.flushes.len(), 2);
        assert_eq!(sink.flushes[0].0, 5);
        assert_eq!(sink.flushes[0].1, 0);
        assert_eq!(sink.flushes[1].1, 1);
        assert_eq!(sink.flushes[0].2.len(), BULK_DATA_SIZE);
        assert_eq!(&sink.flushes[0].2[..4], &1000u32.to_be_bytes());
        assert!(sensor.bulk().is_empty());
    }

    #[test]
    fn test_bus_fault_tolerated() {
        let mut sensor = SensorInstance::new(Ldc1612::new(ADDR), false);
        let mut bus = FakeBus::default();
        bus.set(ADDR, registers::STATUS, Some(STATUS_UNREADCONV0));
        bus.set(ADDR, registers::DATA0_MSB, None);
        let mailbox = SampleMailbox::new();
        mailbox.post();
        let report = sensor.process_sample(
            0,
            &mut bus,
            &mailbox,
            &SteppingClock::new(0, 1),
            BusFaultPolicy::Tolerate,
            &mut RecordingSync::default(),
            &mut RecordingSink::default(),
        );
        assert_eq!(report, Ok(SampleReport::Dropped));
        assert!(!mailbox.is_pending());
        assert!(sensor.bulk().is_empty());
    }

    #[test]
    fn test_bus_fault_shutdown() {
        let mut sensor = SensorInstance::new(Ldc1612::new(ADDR), false);
        let mut bus = FakeBus::default();
        let mailbox = SampleMailbox::new();
        mailbox.post();
        let report = sensor.process_sample(
            0,
            &mut bus,
            &mailbox,
            &SteppingClock::new(0, 1),
            BusFaultPolicy::Shutdown,
            &mut RecordingSync::default(),
            &mut RecordingSink::default(),
        );
        assert_eq!(
            report,
            Err(BusError {
                register: registers::STATUS,
                error: Nack
            })
        );
        // The pending flag is released even when the read fails
        assert!(!mailbox.is_pending());
    }

    #[test]
    fn test_homing_trigger_through_sample_path() {
        let mut sensor = SensorInstance::new(Ldc1612::new(ADDR), false);
        sensor.setup_home(&HomingRequest {
            grace_deadline: Instant::from_ticks(0),
            trigger_threshold: 2000,
            sync_oid: 3,
            trigger_reason: 1,
            error_reason: 2,
            mode: HomingMode::Threshold,
        });
        assert_eq!(
            sensor.home_state(9),
            HomeState {
                oid: 9,
                homing: true,
                trigger_clock: 0
            }
        );
        let mailbox = SampleMailbox::new();
        let clock = SteppingClock::new(100, 10);
        let mut sync = RecordingSync::default();
        let mut sink = RecordingSink::default();
        for data in [1000, 1500, 2500, 3000] {
            let mut bus = ready_bus(data);
            mailbox.post();
            sensor
                .process_sample(
                    9,
                    &mut bus,
                    &mailbox,
                    &clock,
                    BusFaultPolicy::Shutdown,
                    &mut sync,
                    &mut sink,
                )
                .unwrap();
        }
        assert_eq!(sync.calls, vec![(3, 1)]);
        assert_eq!(
            sensor.home_state(9),
            HomeState {
                oid: 9,
                homing: false,
                trigger_clock: 120
            }
        );
        // Sampling continues after the trigger
        assert_eq!(sensor.bulk().len(), 4 * BYTES_PER_SAMPLE);
    }

    #[test]
    fn test_status_polled_measures_latency() {
        let mut sensor = SensorInstance::new(Ldc1612::new(ADDR), false);
        let mut bus = ready_bus(1);
        let mailbox = SampleMailbox::new();
        let clock = SteppingClock::new(500, 7);
        sensor
            .process_sample(
                2,
                &mut bus,
                &mailbox,
                &clock,
                BusFaultPolicy::Shutdown,
                &mut RecordingSync::default(),
                &mut RecordingSink::default(),
            )
            .unwrap();
        let status = sensor
            .status_polled(2, &mut bus, &clock, BusFaultPolicy::Shutdown)
            .unwrap();
        assert_eq!(status.oid, 2);
        assert_eq!(status.clock, 507);
        assert_eq!(status.query_ticks, 7);
        assert_eq!(status.buffered, 2 * BYTES_PER_SAMPLE as u32);
    }

    #[test]
    fn test_status_from_pin() {
        let sensor = SensorInstance::new(Ldc1612::new(ADDR), true);
        let status = sensor.status_from_pin(1, Instant::from_ticks(42), true);
        assert_eq!(status.clock, 42);
        assert_eq!(status.query_ticks, 0);
        assert_eq!(status.buffered, BYTES_PER_SAMPLE as u32);
        let status = sensor.status_from_pin(1, Instant::from_ticks(42), false);
        assert_eq!(status.buffered, 0);
    }
}
