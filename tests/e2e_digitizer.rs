//! E2E tests for digitizer-mode acquisitions
//!
//! Raw records are queued per stream and drained by the reader, or forwarded
//! frame by frame to a registered socket.

use approx::assert_relative_eq;
use qreadout::acquisition::sink::read_frame;
use qreadout::{
    AcquisitionSettings, ChannelTriple, Digitizer, DigitizerError, DigitizerMode, StreamId,
    SyntheticSource,
};
use std::io::{self, Cursor, Write};
use std::sync::{Arc, Mutex};

/// Writer that keeps everything in a shared buffer
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

/// Writer whose peer has gone away
struct Hangup;

impl Write for Hangup {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer closed"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn digitizer_mode(triples: &[(u8, u8, u8)], settings: AcquisitionSettings) -> Digitizer {
    let mut digitizer = Digitizer::new();
    for &(a, b, c) in triples {
        digitizer.enable_stream(ChannelTriple::new(a, b, c)).unwrap();
    }
    digitizer.set_averager_settings(settings).unwrap();
    digitizer.set_mode(DigitizerMode::Digitizer).unwrap();
    digitizer
}

#[test]
fn test_queue_fills_and_drains() {
    let settings = AcquisitionSettings::new(128, 2, 1, 2);
    let mut digitizer = digitizer_mode(&[(1, 1, 1), (1, 0, 0)], settings);
    let source = SyntheticSource::new(&digitizer.streams(), settings);
    let port = digitizer.acquire().unwrap();

    assert!(!digitizer.data_available());
    assert_eq!(digitizer.num_new_records(), 0);

    for buffer in source.buffers() {
        port.deliver(&buffer).unwrap();
    }
    assert!(digitizer.is_done());
    assert!(digitizer.data_available());
    assert_eq!(digitizer.num_new_records(), 4);

    let sid = StreamId(0x111);
    let size = digitizer.buffer_size(&[sid]).unwrap();
    assert_eq!(size, 4 * 2);
    let mut records = vec![0.0; size];
    assert_eq!(digitizer.transfer_stream(sid, &mut records).unwrap(), 8);

    // first record: segment 0, round robin 0, dither +1
    let scale = (1u64 << 19) as f64;
    assert_relative_eq!(records[0], (0.25 * scale + 1.0) / scale, epsilon = 1e-12);
    assert_relative_eq!(records[1], (-0.25 * scale + 1.0) / scale, epsilon = 1e-12);
    // last record: segment 1, round robin 1, dither -1
    assert_relative_eq!(records[6], (0.5 * scale - 1.0) / scale, epsilon = 1e-12);

    assert_eq!(digitizer.buffer_size(&[sid]).unwrap(), 0);
    assert_eq!(digitizer.num_new_records(), 0);
    // the physical queue is still full
    assert!(digitizer.data_available());
}

#[test]
fn test_partial_drain_keeps_remaining_records() {
    let settings = AcquisitionSettings::new(128, 1, 1, 3);
    let mut digitizer = digitizer_mode(&[(1, 1, 1)], settings);
    let source = SyntheticSource::new(&digitizer.streams(), settings);
    let port = digitizer.acquire().unwrap();
    for buffer in source.buffers() {
        port.deliver(&buffer).unwrap();
    }

    let sid = StreamId(0x111);
    let mut one = vec![0.0; 2];
    assert_eq!(digitizer.transfer_stream(sid, &mut one).unwrap(), 2);
    assert_eq!(digitizer.buffer_size(&[sid]).unwrap(), 4);

    // asking for more than is queued returns what is there
    let mut rest = vec![0.0; 10];
    assert_eq!(digitizer.transfer_stream(sid, &mut rest).unwrap(), 4);
    assert_eq!(digitizer.transfer_stream(sid, &mut rest).unwrap(), 0);
}

#[test]
fn test_averaging_reads_rejected() {
    let mut digitizer = digitizer_mode(&[(1, 1, 1), (1, 2, 1)], AcquisitionSettings::default());
    digitizer.acquire().unwrap();
    let mut out = vec![0.0; 6];
    assert!(matches!(
        digitizer.transfer_variance(StreamId(0x111), &mut out),
        Err(DigitizerError::ModeError(_))
    ));
    assert!(matches!(
        digitizer.transfer_correlation(&[StreamId(0x111), StreamId(0x121)], &mut out),
        Err(DigitizerError::ModeError(_))
    ));
}

#[test]
fn test_socket_receives_one_frame_per_record() {
    let settings = AcquisitionSettings::new(256, 1, 1, 3);
    let mut digitizer = digitizer_mode(&[(1, 0, 0), (1, 1, 1)], settings);
    let capture = Capture::default();
    digitizer.register_socket(StreamId(0x100), capture.clone());

    let source = SyntheticSource::new(&digitizer.streams(), settings);
    let port = digitizer.acquire().unwrap();
    for buffer in source.buffers() {
        port.deliver(&buffer).unwrap();
    }
    assert!(digitizer.is_done());
    assert_eq!(digitizer.records_taken(StreamId(0x100)).unwrap(), 3);

    let bytes = capture.0.lock().unwrap().clone();
    let mut reader = Cursor::new(bytes);
    for dither in [1.0, -1.0, 1.0] {
        let frame = read_frame(&mut reader).unwrap();
        assert_eq!(frame.len(), 256 / 4);
        let scale = (1u64 << 13) as f64;
        assert_relative_eq!(frame[0], (0.5 * scale + dither) / scale, epsilon = 1e-12);
    }
    assert!(read_frame(&mut reader).is_err());

    // forwarded records never reach the queue; the other stream still queues
    assert_eq!(digitizer.buffer_size(&[StreamId(0x100)]).unwrap(), 0);
    assert_eq!(digitizer.buffer_size(&[StreamId(0x111)]).unwrap(), 6);
}

#[test]
fn test_broken_socket_is_a_transport_error() {
    let settings = AcquisitionSettings::new(128, 1, 1, 2);
    let mut digitizer = digitizer_mode(&[(1, 0, 0)], settings);
    digitizer.register_socket(StreamId(0x100), Hangup);

    let source = SyntheticSource::new(&digitizer.streams(), settings);
    let port = digitizer.acquire().unwrap();
    let first = source.trigger(0).remove(0);
    assert!(matches!(
        port.deliver(&first),
        Err(DigitizerError::Transport(_))
    ));
    // a failed send is not counted
    assert_eq!(digitizer.records_taken(StreamId(0x100)).unwrap(), 0);
}

#[test]
fn test_delivery_thread_stops_on_transport_failure() {
    let settings = AcquisitionSettings::new(128, 1, 1, 4);
    let mut digitizer = digitizer_mode(&[(1, 0, 0)], settings);
    digitizer.register_socket(StreamId(0x100), Hangup);

    let source = SyntheticSource::new(&digitizer.streams(), settings);
    let port = digitizer.acquire().unwrap();
    let (tx, rx) = crossbeam_channel::unbounded();
    for buffer in source.buffers() {
        tx.send(buffer).unwrap();
    }
    let mut handle = port.spawn(rx).unwrap();

    digitizer
        .wait_for_acquisition(std::time::Duration::from_secs(5))
        .unwrap();
    handle.stop();
    assert!(!digitizer.is_running());
    assert!(!digitizer.is_done());
    assert_eq!(handle.delivered(), 0);
}
