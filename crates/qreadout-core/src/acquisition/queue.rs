//! Per-stream raw record queue
//!
//! In digitizer mode each stream's records land here instead of in an
//! accumulator. The FIFO is allocated on the first push and doubles as it
//! fills, up to room for the whole acquisition (`record_length * num_records`
//! samples). When a socket sink is attached, records are converted to
//! physical units and forwarded immediately, bypassing the FIFO.

use super::sink::{self, SharedSink};
use crate::error::{DigitizerError, Result};
use crate::stream::identity::Stream;
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Records the FIFO is first sized for
const INITIAL_RECORDS: usize = 16;

/// Raw-mode FIFO for one stream
pub struct RecordQueue {
    stream: Stream,
    /// Samples per record for this stream
    record_length: usize,
    fixed_to_float: f64,
    /// Unallocated until the first buffered record
    fifo: Mutex<Option<HeapRb<i32>>>,
    /// Most samples the FIFO may ever hold
    capacity: usize,
    /// Lifetime count of pushed records, used for completion
    records_taken: AtomicU64,
    /// Whole records currently retrievable from the FIFO
    available_records: AtomicU64,
    sink: Option<SharedSink>,
}

impl RecordQueue {
    /// Create a queue able to hold every record of one acquisition
    ///
    /// # Arguments
    /// * `record_length` - global ADC record length
    /// * `num_records` - records expected over the acquisition
    /// * `sink` - forward records here instead of buffering them
    pub fn new(stream: Stream, record_length: usize, num_records: u64, sink: Option<SharedSink>) -> Self {
        let record_length = stream.record_length(record_length);
        // a forwarding queue never buffers
        let capacity = if sink.is_some() {
            0
        } else {
            usize::try_from(num_records)
                .ok()
                .and_then(|n| n.checked_mul(record_length))
                .unwrap_or(usize::MAX)
        };
        Self {
            stream,
            record_length,
            fixed_to_float: stream.fixed_to_float() as f64,
            fifo: Mutex::new(None),
            capacity,
            records_taken: AtomicU64::new(0),
            available_records: AtomicU64::new(0),
            sink,
        }
    }

    /// Buffer or forward one record
    ///
    /// Fails with [`DigitizerError::Transport`] if the socket write fails; the
    /// record is then not counted.
    pub fn push(&self, record: &[i32]) -> Result<()> {
        if record.len() != self.record_length {
            return Err(DigitizerError::RecordSize {
                sid: self.stream.id,
                expected: self.record_length,
                actual: record.len(),
            });
        }

        if let Some(sink) = &self.sink {
            let samples: Vec<f64> = record
                .iter()
                .map(|&x| x as f64 / self.fixed_to_float)
                .collect();
            let mut writer = sink
                .lock()
                .map_err(|_| DigitizerError::LockPoisoned(self.stream.id))?;
            if let Err(e) = sink::write_frame(&mut *writer, &samples) {
                tracing::error!(sid = %self.stream.id, error = %e, "Failed to forward record to socket");
                return Err(e.into());
            }
        } else {
            let mut fifo = self
                .fifo
                .lock()
                .map_err(|_| DigitizerError::LockPoisoned(self.stream.id))?;
            let Some(rb) = self.reserve(&mut fifo, record.len()) else {
                return Err(DigitizerError::QueueOverflow(self.stream.id));
            };
            rb.push_slice(record);
            self.sync_available(rb);
        }

        self.records_taken.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Drain up to `num_points` samples into `out`, scaled to physical units
    ///
    /// Stops early if the FIFO runs dry and returns the number of samples
    /// actually written; never reads past the true tail.
    pub fn get(&self, out: &mut [f64], num_points: usize) -> Result<usize> {
        let wanted = num_points.min(out.len());
        let mut raw = vec![0i32; wanted];
        let popped = {
            let mut fifo = self
                .fifo
                .lock()
                .map_err(|_| DigitizerError::LockPoisoned(self.stream.id))?;
            match fifo.as_mut() {
                Some(rb) => {
                    let popped = rb.pop_slice(&mut raw);
                    self.sync_available(rb);
                    popped
                }
                None => 0,
            }
        };

        for (slot, &x) in out.iter_mut().zip(&raw[..popped]) {
            *slot = x as f64 / self.fixed_to_float;
        }
        if popped < num_points {
            tracing::warn!(
                sid = %self.stream.id,
                requested = num_points,
                drained = popped,
                "Record queue drained short"
            );
        }
        Ok(popped)
    }

    /// Make room for `needed` more samples, growing the ring up to the cap
    ///
    /// Returns `None` when the acquisition's share of the FIFO is used up.
    fn reserve<'a>(&self, fifo: &'a mut Option<HeapRb<i32>>, needed: usize) -> Option<&'a mut HeapRb<i32>> {
        let occupied = fifo.as_ref().map_or(0, |rb| rb.occupied_len());
        if occupied.saturating_add(needed) > self.capacity {
            return None;
        }
        let current = fifo.as_ref().map_or(0, |rb| rb.capacity().get());
        if current - occupied < needed {
            let target = current
                .saturating_mul(2)
                .max(self.record_length.saturating_mul(INITIAL_RECORDS))
                .max(occupied + needed)
                .min(self.capacity);
            let mut grown = HeapRb::new(target);
            if let Some(old) = fifo.as_mut() {
                grown.push_iter(old.pop_iter());
            }
            tracing::trace!(sid = %self.stream.id, capacity = target, "Grew record FIFO");
            *fifo = Some(grown);
        }
        fifo.as_mut()
    }

    /// Whole records left in the FIFO; called with the lock held
    fn sync_available(&self, rb: &HeapRb<i32>) {
        let records = rb.occupied_len() / self.record_length.max(1);
        self.available_records.store(records as u64, Ordering::Release);
    }

    /// Samples retrievable right now (`available_records * record_length`)
    pub fn buffer_size(&self) -> usize {
        self.available_records() as usize * self.record_length
    }

    /// Samples physically sitting in the FIFO
    pub fn occupied(&self) -> usize {
        self.fifo
            .lock()
            .map(|f| f.as_ref().map_or(0, |rb| rb.occupied_len()))
            .unwrap_or(0)
    }

    pub fn records_taken(&self) -> u64 {
        self.records_taken.load(Ordering::Acquire)
    }

    pub fn available_records(&self) -> u64 {
        self.available_records.load(Ordering::Acquire)
    }

    pub fn record_length(&self) -> usize {
        self.record_length
    }

    pub fn is_forwarding(&self) -> bool {
        self.sink.is_some()
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }
}

impl std::fmt::Debug for RecordQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordQueue")
            .field("sid", &self.stream.id)
            .field("record_length", &self.record_length)
            .field("records_taken", &self.records_taken())
            .field("available_records", &self.available_records())
            .field("forwarding", &self.is_forwarding())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::sink::read_frame;
    use std::io::{self, Cursor, Write};
    use std::sync::Arc;

    fn physical() -> Stream {
        Stream::new(1, 0, 0, 2)
    }

    /// Clonable in-memory socket
    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_push_then_drain_in_order() {
        let stream = physical();
        let scale = stream.fixed_to_float() as i32;
        let queue = RecordQueue::new(stream, 128, 3, None);
        assert_eq!(queue.record_length(), 32);

        for k in 0..3 {
            let record: Vec<i32> = (0..32).map(|i| (k * 32 + i) * scale).collect();
            queue.push(&record).unwrap();
        }
        assert_eq!(queue.records_taken(), 3);
        assert_eq!(queue.available_records(), 3);
        assert_eq!(queue.buffer_size(), 96);

        let mut out = vec![0.0; 96];
        assert_eq!(queue.get(&mut out, 96).unwrap(), 96);
        for (i, v) in out.iter().enumerate() {
            assert_eq!(*v, i as f64);
        }
        assert_eq!(queue.available_records(), 0);
        assert_eq!(queue.buffer_size(), 0);
        // lifetime count is unaffected by draining
        assert_eq!(queue.records_taken(), 3);
    }

    #[test]
    fn test_drain_past_tail_stops_short() {
        let queue = RecordQueue::new(physical(), 128, 4, None);
        queue.push(&[8192; 32]).unwrap();

        let mut out = vec![-1.0; 64];
        assert_eq!(queue.get(&mut out, 64).unwrap(), 32);
        assert!(out[..32].iter().all(|&v| v == 1.0));
        // untouched past the true tail
        assert!(out[32..].iter().all(|&v| v == -1.0));
        assert_eq!(queue.available_records(), 0);
    }

    #[test]
    fn test_partial_drains_track_whole_records() {
        let queue = RecordQueue::new(physical(), 128, 2, None);
        queue.push(&[0; 32]).unwrap();
        queue.push(&[0; 32]).unwrap();

        let mut out = vec![0.0; 48];
        assert_eq!(queue.get(&mut out, 48).unwrap(), 48);
        assert_eq!(queue.available_records(), 0);
        assert_eq!(queue.occupied(), 16);

        // the rest of the second record, split across two reads
        assert_eq!(queue.get(&mut out, 8).unwrap(), 8);
        assert_eq!(queue.get(&mut out, 32).unwrap(), 8);
        assert_eq!(queue.occupied(), 0);
        assert_eq!(queue.available_records(), 0);
        assert_eq!(queue.buffer_size(), 0);
    }

    #[test]
    fn test_split_reads_of_whole_records() {
        let queue = RecordQueue::new(physical(), 128, 3, None);
        for _ in 0..3 {
            queue.push(&[0; 32]).unwrap();
        }
        let mut out = vec![0.0; 48];
        queue.get(&mut out, 16).unwrap();
        queue.get(&mut out, 16).unwrap();
        assert_eq!(queue.available_records(), 2);
        assert_eq!(queue.buffer_size(), 64);
    }

    #[test]
    fn test_fifo_allocated_lazily() {
        // room for a billion records is never reserved up front
        let queue = RecordQueue::new(physical(), 16384, 1_000_000_000, None);
        assert_eq!(queue.occupied(), 0);
        assert_eq!(queue.buffer_size(), 0);

        let record = vec![7; 4096];
        for _ in 0..40 {
            queue.push(&record).unwrap();
        }
        assert_eq!(queue.available_records(), 40);
        assert_eq!(queue.occupied(), 40 * 4096);
    }

    #[test]
    fn test_growth_keeps_order_and_cap() {
        let stream = physical();
        let scale = stream.fixed_to_float() as i32;
        let queue = RecordQueue::new(stream, 128, 40, None);
        let mut out = vec![0.0; 32];
        for k in 0..40 {
            queue.push(&[k * scale; 32]).unwrap();
            // drain one record mid-way so growth moves a wrapped ring
            if k == 10 {
                queue.get(&mut out, 32).unwrap();
                assert_eq!(out[0], 0.0);
            }
        }
        queue.push(&[0; 32]).unwrap();
        assert!(matches!(
            queue.push(&[0; 32]),
            Err(DigitizerError::QueueOverflow(_))
        ));

        queue.get(&mut out, 32).unwrap();
        assert_eq!(out[0], 1.0);
    }

    #[test]
    fn test_overflow_rejected() {
        let queue = RecordQueue::new(physical(), 128, 1, None);
        queue.push(&[0; 32]).unwrap();
        let err = queue.push(&[0; 32]).unwrap_err();
        assert!(matches!(err, DigitizerError::QueueOverflow(_)));
        assert_eq!(queue.records_taken(), 1);
    }

    #[test]
    fn test_wrong_record_size_rejected() {
        let queue = RecordQueue::new(physical(), 128, 1, None);
        assert!(matches!(
            queue.push(&[0; 31]),
            Err(DigitizerError::RecordSize { expected: 32, actual: 31, .. })
        ));
    }

    #[test]
    fn test_socket_forwarding_bypasses_fifo() {
        let stream = Stream::new(1, 1, 1, 2);
        let capture = Capture::default();
        let queue = RecordQueue::new(stream, 1024, 4, Some(sink::shared(capture.clone())));
        assert!(queue.is_forwarding());

        queue.push(&[1 << 19, -(1 << 18)]).unwrap();
        queue.push(&[3 << 19, 0]).unwrap();
        assert_eq!(queue.records_taken(), 2);
        assert_eq!(queue.available_records(), 0);
        assert_eq!(queue.occupied(), 0);

        let bytes = capture.0.lock().unwrap().clone();
        let mut reader = Cursor::new(bytes);
        assert_eq!(read_frame(&mut reader).unwrap(), vec![1.0, -0.5]);
        assert_eq!(read_frame(&mut reader).unwrap(), vec![3.0, 0.0]);
    }

    #[test]
    fn test_socket_failure_propagates() {
        let stream = Stream::new(1, 1, 1, 2);
        let queue = RecordQueue::new(stream, 1024, 4, Some(sink::shared(Broken)));
        let err = queue.push(&[0, 0]).unwrap_err();
        assert!(matches!(err, DigitizerError::Transport(_)));
        assert_eq!(queue.records_taken(), 0);
    }
}
