//! Registry of configured sensors, indexed by the host assigned object id.

use core::fmt;

use crate::ldc1612::Ldc1612;
use crate::scheduler::SampleMailbox;
use crate::sensor::SensorInstance;

/// Number of sensor slots of the firmware.
pub const MAX_SENSORS: usize = 4;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PoolError {
    /// The object id does not fit into the pool.
    OutOfRange(u8),
    AlreadyConfigured(u8),
    NotConfigured(u8),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRange(oid) => write!(f, "Object id {} out of range", oid),
            Self::AlreadyConfigured(oid) => write!(f, "Object id {} already configured", oid),
            Self::NotConfigured(oid) => write!(f, "Object id {} not configured", oid),
        }
    }
}

pub struct SensorPool<const N: usize = MAX_SENSORS> {
    sensors: [Option<SensorInstance>; N],
}

impl<const N: usize> Default for SensorPool<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> SensorPool<N> {
    pub fn new() -> Self {
        Self {
            sensors: core::array::from_fn(|_| None),
        }
    }

    fn slot(&self, oid: u8) -> Result<&Option<SensorInstance>, PoolError> {
        self.sensors
            .get(usize::from(oid))
            .ok_or(PoolError::OutOfRange(oid))
    }

    /// Create the sensor `oid`. Each id can only be configured once.
    pub fn config(
        &mut self,
        oid: u8,
        device: Ldc1612,
        has_data_ready: bool,
    ) -> Result<&mut SensorInstance, PoolError> {
        let slot = self
            .sensors
            .get_mut(usize::from(oid))
            .ok_or(PoolError::OutOfRange(oid))?;
        if slot.is_some() {
            return Err(PoolError::AlreadyConfigured(oid));
        }
        Ok(slot.insert(SensorInstance::new(device, has_data_ready)))
    }

    pub fn is_configured(&self, oid: u8) -> bool {
        matches!(self.slot(oid), Ok(Some(_)))
    }

    pub fn get(&self, oid: u8) -> Result<&SensorInstance, PoolError> {
        self.slot(oid)?
            .as_ref()
            .ok_or(PoolError::NotConfigured(oid))
    }

    pub fn get_mut(&mut self, oid: u8) -> Result<&mut SensorInstance, PoolError> {
        self.sensors
            .get_mut(usize::from(oid))
            .ok_or(PoolError::OutOfRange(oid))?
            .as_mut()
            .ok_or(PoolError::NotConfigured(oid))
    }

    /// Pick the next configured sensor with a pending sample, starting
    /// after `last`. Sensors are served round robin.
    pub fn next_pending(&self, mailboxes: &[SampleMailbox; N], last: Option<u8>) -> Option<u8> {
        let start = last.map_or(0, |oid| usize::from(oid) + 1);
        (start..start + N)
            .map(|i| i % N)
            .find(|&i| self.sensors[i].is_some() && mailboxes[i].is_pending())
            .map(|i| i as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rstest::rstest;

    use crate::bulk::tests::RecordingSink;
    use crate::bulk::{BULK_DATA_SIZE, BYTES_PER_SAMPLE};
    use crate::clock::{Clock, Instant};
    use crate::ldc1612::tests::FakeBus;
    use crate::ldc1612::{registers, BusFaultPolicy, STATUS_UNREADCONV0};
    use crate::scheduler::{DataReady, SampleTimer, Schedule};
    use crate::sensor::tests::{RecordingSync, SteppingClock};
    use crate::sensor::SampleReport;

    struct NoPin;

    impl DataReady for NoPin {
        fn is_asserted(&mut self) -> bool {
            false
        }
    }

    fn mailboxes() -> [SampleMailbox; MAX_SENSORS] {
        core::array::from_fn(|_| SampleMailbox::new())
    }

    #[test]
    fn test_config_once() {
        let mut pool: SensorPool = SensorPool::new();
        pool.config(1, Ldc1612::new(0x2a), false).unwrap();
        assert!(pool.is_configured(1));
        assert!(!pool.is_configured(0));
        assert!(matches!(
            pool.config(1, Ldc1612::new(0x2b), false),
            Err(PoolError::AlreadyConfigured(1))
        ));
        assert_eq!(pool.get(1).unwrap().device(), Ldc1612::new(0x2a));
    }

    #[rstest]
    #[case(0, Err(PoolError::NotConfigured(0)))]
    #[case(3, Err(PoolError::NotConfigured(3)))]
    #[case(4, Err(PoolError::OutOfRange(4)))]
    #[case(255, Err(PoolError::OutOfRange(255)))]
    fn test_lookup_errors(#[case] oid: u8, #[case] expected: Result<(), PoolError>) {
        let mut pool: SensorPool = SensorPool::new();
        assert_eq!(pool.get(oid).map(|_| ()), expected);
        assert_eq!(pool.get_mut(oid).map(|_| ()), expected);
    }

    #[test]
    fn test_error_message() {
        assert_eq!(
            PoolError::AlreadyConfigured(2).to_string(),
            "Object id 2 already configured"
        );
    }

    #[test]
    fn test_next_pending_round_robin() {
        let mut pool: SensorPool = SensorPool::new();
        let mailboxes = mailboxes();
        for oid in [0, 2, 3] {
            pool.config(oid, Ldc1612::new(0x2a), false).unwrap();
        }
        assert_eq!(pool.next_pending(&mailboxes, None), None);

        // Pending flag on an unconfigured slot is not served
        mailboxes[1].post();
        mailboxes[0].post();
        mailboxes[3].post();
        assert_eq!(pool.next_pending(&mailboxes, None), Some(0));
        assert_eq!(pool.next_pending(&mailboxes, Some(0)), Some(3));
        assert_eq!(pool.next_pending(&mailboxes, Some(3)), Some(0));
        mailboxes[0].take();
        assert_eq!(pool.next_pending(&mailboxes, Some(3)), Some(3));
    }

    /// Two sensors sampled through the full path: timer events post to the
    /// mailboxes, the task drains them in turn.
    #[test]
    fn test_sampling_two_sensors() {
        let mut pool: SensorPool = SensorPool::new();
        let mailboxes = mailboxes();
        let mut timers: [SampleTimer<NoPin>; MAX_SENSORS] =
            core::array::from_fn(|_| SampleTimer::new(None));
        let clock = SteppingClock::new(0, 1);
        let mut bus = FakeBus::default();
        for (oid, address) in [(0u8, 0x2a), (1, 0x2b)] {
            pool.config(oid, Ldc1612::new(address), false).unwrap();
            bus.set(address, registers::STATUS, Some(STATUS_UNREADCONV0));
            bus.set_sample(address, 0x0100_0000 + u32::from(address));
        }

        let mut schedules: Vec<(u8, Schedule)> = [0u8, 1]
            .iter()
            .map(|&oid| {
                pool.get_mut(oid).unwrap().start_sampling();
                let idx = usize::from(oid);
                let schedule = timers[idx].arm(&mailboxes[idx], clock.now(), 100).unwrap();
                (oid, schedule)
            })
            .collect();

        let mut sync = RecordingSync::default();
        let mut sink = RecordingSink::default();
        let samples_per_flush = BULK_DATA_SIZE / BYTES_PER_SAMPLE;
        let mut last = None;
        for _ in 0..samples_per_flush {
            for (oid, schedule) in schedules.iter_mut() {
                let idx = usize::from(*oid);
                let event = timers[idx].on_event(&mailboxes[idx], schedule.epoch).unwrap();
                *schedule = event.next;
            }
            while let Some(oid) = pool.next_pending(&mailboxes, last) {
                let report = pool
                    .get_mut(oid)
                    .unwrap()
                    .process_sample(
                        oid,
                        &mut bus,
                        &mailboxes[usize::from(oid)],
                        &clock,
                        BusFaultPolicy::Shutdown,
                        &mut sync,
                        &mut sink,
                    )
                    .unwrap();
                assert!(matches!(report, SampleReport::Sample { .. }));
                last = Some(oid);
            }
        }

        let mut flushed: Vec<u8> = sink.flushes.iter().map(|(oid, _, _)| *oid).collect();
        flushed.sort_unstable();
        assert_eq!(flushed, vec![0, 1]);
        for (oid, sequence, data) in &sink.flushes {
            assert_eq!(*sequence, 0);
            let address = if *oid == 0 { 0x2a } else { 0x2b };
            assert_eq!(&data[..4], &(0x0100_0000u32 + address).to_be_bytes());
        }
        for oid in [0, 1] {
            assert_eq!(pool.get(oid).unwrap().bulk().possible_overflows(), 0);
        }
        assert_eq!(schedules[0].1.at, Instant::from_ticks(100 * (samples_per_flush as u32 + 1)));
    }
}
