//! Per-acquisition dispatch arena
//!
//! A [`StreamRouter`] is built when an acquisition is armed and dropped on
//! the next reconfiguration. Its tables are sized once from the final
//! active-stream list and never grow, so the delivery thread and client
//! readers only ever contend on a single stream's slot.

use super::packet::TaggedBuffer;
use super::queue::RecordQueue;
use super::settings::{AcquisitionSettings, DigitizerMode};
use super::sink::SharedSink;
use crate::error::{DigitizerError, Result};
use crate::stats::accumulator::Accumulator;
use crate::stats::correlator::Correlator;
use crate::stream::combinations::combinations;
use crate::stream::identity::{Stream, StreamId, StreamType};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Lock a per-stream slot, mapping poison to an error
pub(crate) fn lock_slot<T>(slot: &Mutex<T>, sid: StreamId) -> Result<MutexGuard<'_, T>> {
    slot.lock().map_err(|_| DigitizerError::LockPoisoned(sid))
}

/// Routes tagged buffers to accumulators, correlators and record queues
pub struct StreamRouter {
    mode: DigitizerMode,
    num_records: u64,
    streams: BTreeMap<StreamId, Stream>,
    /// Stream IDs per type, indexed by filter position
    channels: HashMap<StreamType, Vec<StreamId>>,
    accumulators: HashMap<StreamId, Mutex<Accumulator>>,
    correlators: BTreeMap<Vec<StreamId>, Mutex<Correlator>>,
    queues: HashMap<StreamId, RecordQueue>,
    done: AtomicBool,
}

impl StreamRouter {
    /// Build every sink for one acquisition
    ///
    /// # Arguments
    /// * `streams` - active-stream registry; ascending ID order is filter order
    /// * `max_arity` - correlators are built for 2..=max_arity RESULT streams
    /// * `sockets` - raw-mode sinks to attach to matching record queues
    pub fn build(
        streams: &BTreeMap<StreamId, Stream>,
        settings: &AcquisitionSettings,
        mode: DigitizerMode,
        max_arity: usize,
        sockets: &HashMap<StreamId, SharedSink>,
    ) -> Self {
        let mut channels: HashMap<StreamType, Vec<StreamId>> = HashMap::new();
        for stream in streams.values() {
            channels.entry(stream.kind).or_default().push(stream.id);
        }
        for kind in StreamType::ALL {
            if let Some(ids) = channels.get(&kind) {
                tracing::debug!(kind = %kind, streams = ?ids, "Filter order");
            }
        }

        let num_records = settings.num_records();
        let accumulators = streams
            .values()
            .map(|s| {
                let acc = Accumulator::new(
                    *s,
                    settings.record_length,
                    settings.num_segments,
                    settings.num_waveforms,
                );
                (s.id, Mutex::new(acc))
            })
            .collect();

        let queues = streams
            .values()
            .map(|s| {
                let sink = sockets.get(&s.id).cloned();
                let queue = RecordQueue::new(*s, settings.record_length, num_records, sink);
                (s.id, queue)
            })
            .collect();

        let results: Vec<Stream> = channels
            .get(&StreamType::Result)
            .map(|ids| ids.iter().filter_map(|sid| streams.get(sid).copied()).collect())
            .unwrap_or_default();
        let mut correlators = BTreeMap::new();
        for arity in 2..=max_arity {
            for combo in combinations(results.len(), arity) {
                let members: Vec<Stream> = combo.iter().map(|&i| results[i]).collect();
                let corr = Correlator::new(&members, settings.num_segments, settings.num_waveforms);
                tracing::debug!(members = ?corr.members(), "Built correlator");
                correlators.insert(corr.members().to_vec(), Mutex::new(corr));
            }
        }

        tracing::debug!(
            mode = %mode,
            streams = streams.len(),
            correlators = correlators.len(),
            num_records,
            "Router built"
        );

        Self {
            mode,
            num_records,
            streams: streams.clone(),
            channels,
            accumulators,
            correlators,
            queues,
            done: AtomicBool::new(false),
        }
    }

    /// Map a filter position back to its stream ID
    pub fn resolve(&self, kind: StreamType, position: usize) -> Result<StreamId> {
        self.channels
            .get(&kind)
            .and_then(|ids| ids.get(position))
            .copied()
            .ok_or_else(|| DigitizerError::UnknownFilterPosition {
                kind: kind.to_string(),
                position,
            })
    }

    /// Dispatch one tagged buffer
    ///
    /// Records past the target count are dropped. Returns the resolved stream ID.
    pub fn on_buffer(&self, buffer: &TaggedBuffer) -> Result<StreamId> {
        let sid = self.resolve(buffer.kind, buffer.position)?;
        let record = buffer.samples()?;
        tracing::trace!(sid = %sid, samples = record.len(), "Dispatching buffer");

        match self.mode {
            DigitizerMode::Averager => {
                let slot = self.accumulator(sid)?;
                {
                    let mut acc = lock_slot(slot, sid)?;
                    if acc.records_taken() >= self.num_records {
                        return Ok(sid);
                    }
                    acc.accumulate(&record)?;
                }
                if buffer.kind == StreamType::Result {
                    for (members, corr) in &self.correlators {
                        if members.contains(&sid) {
                            lock_slot(corr, sid)?.accumulate(sid, &record)?;
                        }
                    }
                }
            }
            DigitizerMode::Digitizer => {
                let queue = self.queue(sid)?;
                if queue.records_taken() < self.num_records {
                    queue.push(&record)?;
                }
            }
        }
        Ok(sid)
    }

    /// True once every active stream has taken the target record count
    ///
    /// Latches: once true it stays true.
    pub fn check_done(&self) -> bool {
        if self.done.load(Ordering::Acquire) {
            return true;
        }
        let done = self
            .streams
            .keys()
            .all(|&sid| self.records_taken(sid).map(|n| n >= self.num_records).unwrap_or(false));
        if done {
            self.done.store(true, Ordering::Release);
            tracing::info!(num_records = self.num_records, "All streams reached target record count");
        }
        done
    }

    /// Records taken by the mode's sink for `sid`
    pub fn records_taken(&self, sid: StreamId) -> Result<u64> {
        match self.mode {
            DigitizerMode::Averager => Ok(lock_slot(self.accumulator(sid)?, sid)?.records_taken()),
            DigitizerMode::Digitizer => Ok(self.queue(sid)?.records_taken()),
        }
    }

    pub fn accumulator(&self, sid: StreamId) -> Result<&Mutex<Accumulator>> {
        self.accumulators
            .get(&sid)
            .ok_or(DigitizerError::StreamNotEnabled(sid))
    }

    /// Look up a correlator by its members, in any order
    pub fn correlator(&self, sids: &[StreamId]) -> Result<&Mutex<Correlator>> {
        let mut key = sids.to_vec();
        key.sort();
        self.correlators
            .get(&key)
            .ok_or(DigitizerError::UnknownCorrelator(key))
    }

    pub fn queue(&self, sid: StreamId) -> Result<&RecordQueue> {
        self.queues
            .get(&sid)
            .ok_or(DigitizerError::StreamNotEnabled(sid))
    }

    /// Stream IDs of one type in filter order
    pub fn channels(&self, kind: StreamType) -> &[StreamId] {
        self.channels.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Member sets of every correlator, sorted
    pub fn correlator_sets(&self) -> Vec<Vec<StreamId>> {
        self.correlators.keys().cloned().collect()
    }

    /// Largest accumulator record count
    pub fn max_records_taken(&self) -> u64 {
        self.accumulators
            .iter()
            .filter_map(|(&sid, slot)| lock_slot(slot, sid).ok().map(|a| a.records_taken()))
            .max()
            .unwrap_or(0)
    }

    /// Smallest count of whole records waiting in any queue
    pub fn min_available_records(&self) -> u64 {
        self.queues
            .values()
            .map(RecordQueue::available_records)
            .min()
            .unwrap_or(0)
    }

    /// True if any queue holds a whole record
    pub fn any_available(&self) -> bool {
        self.queues.values().any(|q| q.available_records() > 0)
    }

    pub fn mode(&self) -> DigitizerMode {
        self.mode
    }

    pub fn num_records(&self) -> u64 {
        self.num_records
    }
}

impl std::fmt::Debug for StreamRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRouter")
            .field("mode", &self.mode)
            .field("num_records", &self.num_records)
            .field("streams", &self.streams.keys().collect::<Vec<_>>())
            .field("correlators", &self.correlators.keys().collect::<Vec<_>>())
            .field("done", &self.done.load(Ordering::Relaxed))
            .finish()
    }
}
