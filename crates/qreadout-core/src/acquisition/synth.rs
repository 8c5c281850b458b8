//! Deterministic synthetic packet source
//!
//! Stands in for the hardware delivery path: for every trigger it emits one
//! record per active stream, grouped by stream type and ordered by filter
//! position, exactly as the demultiplexer would.
//!
//! Segment `s` of every complex stream carries `level(s) - i level(s)` in
//! physical units, physical streams carry `level(s)`, and STATE streams
//! alternate `0`/`1` by segment. Even round robins add one fixed-point count
//! and odd ones subtract one, so variances are small but non-zero.

use super::packet::TaggedBuffer;
use super::settings::AcquisitionSettings;
use crate::stream::identity::{Stream, StreamType};
use crossbeam_channel::Sender;

/// Synthetic tagged-buffer generator for a fixed stream set
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    /// Streams sorted by type, then by ID (filter order)
    streams: Vec<(Stream, usize)>,
    settings: AcquisitionSettings,
}

impl SyntheticSource {
    pub fn new(streams: &[Stream], settings: AcquisitionSettings) -> Self {
        let mut sorted = streams.to_vec();
        sorted.sort_by_key(|s| (s.kind, s.id));
        sorted.dedup_by_key(|s| s.id);

        let mut streams = Vec::with_capacity(sorted.len());
        let mut position = 0;
        let mut last_kind = None;
        for stream in sorted {
            if last_kind != Some(stream.kind) {
                position = 0;
                last_kind = Some(stream.kind);
            }
            streams.push((stream, position));
            position += 1;
        }
        Self { streams, settings }
    }

    /// Physical-unit level of segment `segment`
    pub fn level(&self, segment: usize) -> f64 {
        0.5 * (segment + 1) as f64 / self.settings.num_segments.max(1) as f64
    }

    /// Segment a trigger lands in
    pub fn segment_of(&self, trigger: u64) -> usize {
        let waveforms = self.settings.num_waveforms.max(1) as u64;
        let segments = self.settings.num_segments.max(1) as u64;
        ((trigger / waveforms) % segments) as usize
    }

    fn round_robin_of(&self, trigger: u64) -> u64 {
        let per_round = (self.settings.num_waveforms * self.settings.num_segments).max(1) as u64;
        trigger / per_round
    }

    /// One record per stream for trigger `trigger`
    pub fn trigger(&self, trigger: u64) -> Vec<TaggedBuffer> {
        let segment = self.segment_of(trigger);
        let dither = if self.round_robin_of(trigger) % 2 == 0 { 1 } else { -1 };
        let level = self.level(segment);

        self.streams
            .iter()
            .map(|&(stream, position)| {
                let len = stream.record_length(self.settings.record_length);
                let scale = stream.fixed_to_float() as f64;
                let raw = (level * scale).round() as i32;
                match stream.kind {
                    StreamType::Physical => {
                        let samples = vec![(raw + dither) as i16; len];
                        TaggedBuffer::narrow(stream.kind, position, &samples)
                    }
                    StreamType::Demod => {
                        let samples: Vec<i16> = (0..len)
                            .map(|i| (if i % 2 == 0 { raw + dither } else { -raw + dither }) as i16)
                            .collect();
                        TaggedBuffer::narrow(stream.kind, position, &samples)
                    }
                    StreamType::State => {
                        let state = (segment % 2) as i32;
                        TaggedBuffer::wide(stream.kind, position, &vec![state; len])
                    }
                    StreamType::Result | StreamType::Correlated => {
                        let samples: Vec<i32> = (0..len)
                            .map(|i| if i % 2 == 0 { raw + dither } else { -raw + dither })
                            .collect();
                        TaggedBuffer::wide(stream.kind, position, &samples)
                    }
                }
            })
            .collect()
    }

    /// Every buffer of a full acquisition, trigger by trigger
    pub fn buffers(&self) -> impl Iterator<Item = TaggedBuffer> + '_ {
        (0..self.settings.num_records()).flat_map(move |t| self.trigger(t))
    }

    /// Send a full acquisition into `tx`
    ///
    /// Stops early if the receiver hangs up. Returns the number of buffers sent.
    pub fn run(&self, tx: &Sender<TaggedBuffer>) -> usize {
        let mut sent = 0;
        for buffer in self.buffers() {
            if tx.send(buffer).is_err() {
                tracing::debug!(sent, "Delivery channel closed, synthetic source stopping");
                break;
            }
            sent += 1;
        }
        sent
    }

    /// Spawn a thread running [`Self::run`]
    pub fn spawn(self, tx: Sender<TaggedBuffer>) -> std::io::Result<std::thread::JoinHandle<usize>> {
        std::thread::Builder::new()
            .name("synthetic-source".into())
            .spawn(move || self.run(&tx))
    }

    /// Buffers per trigger
    pub fn streams_per_trigger(&self) -> usize {
        self.streams.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mixed() -> Vec<Stream> {
        vec![
            Stream::new(1, 2, 1, 2),
            Stream::new(1, 0, 0, 2),
            Stream::new(1, 1, 1, 2),
            Stream::new(1, 1, 0, 2),
        ]
    }

    #[test]
    fn test_trigger_groups_by_type_in_filter_order() {
        let source = SyntheticSource::new(&mixed(), AcquisitionSettings::new(256, 2, 1, 1));
        let buffers = source.trigger(0);
        let tags: Vec<(StreamType, usize)> = buffers.iter().map(|b| (b.kind, b.position)).collect();
        assert_eq!(
            tags,
            vec![
                (StreamType::Physical, 0),
                (StreamType::Demod, 0),
                (StreamType::Result, 0),
                (StreamType::Result, 1),
            ]
        );
        assert_eq!(buffers[0].len(), 64);
        assert_eq!(buffers[1].len(), 16);
        assert_eq!(buffers[2].len(), 2);
    }

    #[test]
    fn test_segment_levels() {
        let source = SyntheticSource::new(&mixed(), AcquisitionSettings::new(256, 2, 2, 1));
        assert_eq!(source.segment_of(0), 0);
        assert_eq!(source.segment_of(1), 0);
        assert_eq!(source.segment_of(2), 1);
        assert_eq!(source.segment_of(4), 0);

        let result = source.trigger(2)[2].samples().unwrap();
        // level 0.5 at 2^19, plus the even-round dither
        assert_eq!(result, vec![(1 << 18) + 1, -(1 << 18) + 1]);
    }

    #[test]
    fn test_buffers_cover_full_acquisition() {
        let settings = AcquisitionSettings::new(128, 2, 2, 3);
        let source = SyntheticSource::new(&mixed(), settings);
        assert_eq!(source.buffers().count(), 12 * 4);
    }

    #[test]
    fn test_run_stops_when_receiver_drops() {
        let source = SyntheticSource::new(&mixed(), AcquisitionSettings::new(128, 1, 1, 10));
        let (tx, rx) = crossbeam_channel::bounded(1);
        drop(rx);
        assert_eq!(source.run(&tx), 0);
    }
}
