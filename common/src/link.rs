//! Outgoing side of the host link and the homing trigger output.

use embedded_hal::digital::v2::OutputPin;
use embedded_hal::serial::Write;

use crate::bulk::BulkSink;
use crate::homing::TriggerSync;
use crate::protocol::{Response, MAX_FRAME};

/// Frame encoder on top of a serial transmitter.
pub struct HostLink<W> {
    tx: W,
    write_errors: u32,
}

impl<W: Write<u8>> HostLink<W> {
    pub fn new(tx: W) -> Self {
        Self {
            tx,
            write_errors: 0,
        }
    }

    /// Number of bytes lost to transmitter errors.
    pub fn write_errors(&self) -> u32 {
        self.write_errors
    }

    /// Send a response, blocking until the whole frame is queued.
    pub fn send(&mut self, response: &Response<'_>) {
        let mut buf = [0; MAX_FRAME];
        let len = response.encode(&mut buf);
        for &byte in &buf[..len] {
            if nb::block!(self.tx.write(byte)).is_err() {
                self.write_errors = self.write_errors.wrapping_add(1);
            }
        }
    }

    pub fn into_inner(self) -> W {
        self.tx
    }
}

impl<W: Write<u8>> BulkSink for HostLink<W> {
    fn send_bulk_data(&mut self, oid: u8, sequence: u16, data: &[u8]) {
        self.send(&Response::BulkData {
            oid,
            sequence,
            data,
        });
    }
}

/// Trigger output towards the motion controller.
///
/// The line is asserted as soon as a homing session fires. The matching
/// `trigger` message for the host is kept until [`TriggerLine::take_fired`]
/// is called.
pub struct TriggerLine<P> {
    pin: P,
    fired: Option<(u8, u8)>,
}

impl<P: OutputPin> TriggerLine<P> {
    pub fn new(mut pin: P) -> Self {
        pin.set_low().ok();
        Self { pin, fired: None }
    }

    /// Deassert the line for a new homing session.
    pub fn release(&mut self) {
        self.pin.set_low().ok();
        self.fired = None;
    }

    /// Sync object id and reason of the last notification.
    pub fn take_fired(&mut self) -> Option<(u8, u8)> {
        self.fired.take()
    }
}

impl<P: OutputPin> TriggerSync for TriggerLine<P> {
    fn trigger(&mut self, sync_oid: u8, reason: u8) {
        self.pin.set_high().ok();
        self.fired = Some((sync_oid, reason));
    }
}
