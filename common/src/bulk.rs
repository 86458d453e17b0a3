//! Bulk sample buffer.
//!
//! Raw samples are collected in a small buffer and shipped to the host in
//! bulk. The host reconstructs sample timing from the sequence numbers and
//! from periodic status queries.

use crate::clock::Instant;

/// Size of a single raw LDC1612 sample.
pub const BYTES_PER_SAMPLE: usize = 4;

/// Capacity of the bulk buffer.
pub const BULK_DATA_SIZE: usize = 52;

/// Destination of flushed bulk data.
pub trait BulkSink {
    fn send_bulk_data(&mut self, oid: u8, sequence: u16, data: &[u8]);
}

/// Bulk status report, sent in reply to a status query.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BulkStatus {
    pub oid: u8,
    /// Time at which the status was sampled
    pub clock: u32,
    /// Duration of the status query, for host side latency estimation
    pub query_ticks: u32,
    pub next_sequence: u16,
    /// Bytes in the buffer plus bytes still pending in the chip
    pub buffered: u32,
    pub possible_overflows: u16,
}

pub struct BulkBuffer {
    data: [u8; BULK_DATA_SIZE],
    data_count: usize,
    sequence: u16,
    possible_overflows: u16,
}

impl Default for BulkBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl BulkBuffer {
    pub const fn new() -> Self {
        Self {
            data: [0; BULK_DATA_SIZE],
            data_count: 0,
            sequence: 0,
            possible_overflows: 0,
        }
    }

    pub fn reset(&mut self) {
        self.data_count = 0;
        self.sequence = 0;
        self.possible_overflows = 0;
    }

    pub fn len(&self) -> usize {
        self.data_count
    }

    pub fn is_empty(&self) -> bool {
        self.data_count == 0
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn possible_overflows(&self) -> u16 {
        self.possible_overflows
    }

    pub fn add_overflows(&mut self, count: u16) {
        self.possible_overflows = self.possible_overflows.wrapping_add(count);
    }

    /// Return whether another sample fits into the buffer.
    pub fn has_room(&self) -> bool {
        self.data_count + BYTES_PER_SAMPLE <= BULK_DATA_SIZE
    }

    /// Append a sample.
    ///
    /// Panics if the buffer is full, callers must flush first.
    pub fn append(&mut self, sample: &[u8; BYTES_PER_SAMPLE]) {
        assert!(self.has_room(), "Bulk buffer overflow");
        self.data[self.data_count..self.data_count + BYTES_PER_SAMPLE].copy_from_slice(sample);
        self.data_count += BYTES_PER_SAMPLE;
    }

    /// Ship the buffered data and clear it.
    pub fn flush(&mut self, oid: u8, sink: &mut impl BulkSink) {
        sink.send_bulk_data(oid, self.sequence, &self.data[..self.data_count]);
        self.data_count = 0;
        self.sequence = self.sequence.wrapping_add(1);
    }

    /// Build a status report. `fifo_bytes` are bytes not yet read from the
    /// chip.
    pub fn status(&self, oid: u8, time: Instant, query_ticks: u32, fifo_bytes: u32) -> BulkStatus {
        BulkStatus {
            oid,
            clock: time.ticks(),
            query_ticks,
            next_sequence: self.sequence,
            buffered: self.data_count as u32 + fifo_bytes,
            possible_overflows: self.possible_overflows,
        }
    }
}
