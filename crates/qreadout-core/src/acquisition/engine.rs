//! Digitizer engine
//!
//! The [`Digitizer`] owns the active-stream registry, acquisition settings,
//! mode and socket registry. [`Digitizer::acquire`] builds a fresh
//! [`StreamRouter`] and hands back a [`DeliveryPort`], the only path through
//! which tagged buffers reach the router. The client keeps the `Digitizer`
//! and polls completion and pulls snapshots while the port is driven from
//! another thread, typically through [`DeliveryPort::spawn`].

use super::packet::TaggedBuffer;
use super::router::{lock_slot, StreamRouter};
use super::settings::{AcquisitionSettings, DigitizerMode};
use super::sink::{self, SharedSink};
use crate::error::{DigitizerError, Result};
use crate::stats::correlator::Correlator;
use crate::stream::identity::{ChannelTriple, Stream, StreamId};
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Poll interval of [`Digitizer::wait_for_acquisition`]
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long the delivery thread blocks before rechecking its stop flag
const DELIVERY_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Cloneable handle that feeds tagged buffers into the armed acquisition
#[derive(Clone, Debug)]
pub struct DeliveryPort {
    router: Arc<StreamRouter>,
    running: Arc<AtomicBool>,
}

impl DeliveryPort {
    /// Route one buffer, then stop the acquisition if every stream is done
    ///
    /// Buffers arriving after a stop are ignored.
    pub fn deliver(&self, buffer: &TaggedBuffer) -> Result<()> {
        if !self.running.load(Ordering::Acquire) {
            return Ok(());
        }
        let routed = self.router.on_buffer(buffer);
        if self.router.check_done() && self.running.swap(false, Ordering::AcqRel) {
            tracing::info!("Acquisition complete");
        }
        routed.map(|_| ())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawn a delivery thread draining `rx` into this port
    ///
    /// The thread exits when the acquisition stops, the channel disconnects,
    /// or the handle is stopped. A transport failure stops the acquisition,
    /// since records after it would be silently lost; other errors are
    /// logged and the offending buffer is skipped.
    pub fn spawn(self, rx: Receiver<TaggedBuffer>) -> Result<DeliveryHandle> {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag_clone = Arc::clone(&stop_flag);
        let delivered = Arc::new(AtomicU64::new(0));
        let delivered_clone = Arc::clone(&delivered);

        let thread = std::thread::Builder::new()
            .name("delivery".into())
            .spawn(move || {
                tracing::debug!("Delivery thread running");
                while !flag_clone.load(Ordering::Acquire) && self.is_running() {
                    let buffer = match rx.recv_timeout(DELIVERY_POLL_INTERVAL) {
                        Ok(buffer) => buffer,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    };
                    match self.deliver(&buffer) {
                        Ok(()) => {
                            delivered_clone.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e @ DigitizerError::Transport(_)) => {
                            tracing::error!(error = %e, "Stopping acquisition after transport failure");
                            self.running.store(false, Ordering::Release);
                            break;
                        }
                        Err(e) => {
                            tracing::error!(
                                kind = %buffer.kind,
                                position = buffer.position,
                                error = %e,
                                "Dropped buffer"
                            );
                        }
                    }
                }
                tracing::info!(
                    delivered = delivered_clone.load(Ordering::Relaxed),
                    "Delivery thread exited"
                );
            })?;

        Ok(DeliveryHandle {
            stop_flag,
            delivered,
            thread: Some(thread),
        })
    }
}

/// Handle returned by [`DeliveryPort::spawn`] to stop the delivery thread
pub struct DeliveryHandle {
    stop_flag: Arc<AtomicBool>,
    delivered: Arc<AtomicU64>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl DeliveryHandle {
    /// Stop the delivery thread and wait for it to finish
    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Release);
        if let Some(h) = self.thread.take() {
            let _ = h.join();
        }
    }

    /// Check if the delivery thread is still alive
    pub fn is_alive(&self) -> bool {
        self.thread
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Buffers routed without error so far
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

impl Drop for DeliveryHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Data-reduction front end for one digitizer card
pub struct Digitizer {
    streams: BTreeMap<StreamId, Stream>,
    settings: AcquisitionSettings,
    mode: DigitizerMode,
    sockets: HashMap<StreamId, SharedSink>,
    max_correlation_arity: usize,
    num_raw_integrators: u32,
    /// Router of the current (or last) acquisition
    router: Option<Arc<StreamRouter>>,
    running: Arc<AtomicBool>,
    /// Largest accumulator count seen by [`Self::num_new_records`]
    last_records_taken: u64,
    armed_at: Option<DateTime<Utc>>,
}

impl Digitizer {
    pub fn new() -> Self {
        Self {
            streams: BTreeMap::new(),
            settings: AcquisitionSettings::default(),
            mode: DigitizerMode::default(),
            sockets: HashMap::new(),
            max_correlation_arity: crate::DEFAULT_MAX_CORRELATION_ARITY,
            num_raw_integrators: crate::DEFAULT_RAW_INTEGRATORS,
            router: None,
            running: Arc::new(AtomicBool::new(false)),
            last_records_taken: 0,
            armed_at: None,
        }
    }

    /// Raw kernel integrators per module, used to classify raw-branch results
    pub fn with_raw_integrators(mut self, count: u32) -> Self {
        self.num_raw_integrators = count;
        self
    }

    fn ensure_idle(&self) -> Result<()> {
        if self.is_running() {
            return Err(DigitizerError::Busy);
        }
        Ok(())
    }

    /// Drop the current acquisition's sinks
    fn invalidate(&mut self) {
        if self.router.take().is_some() {
            tracing::debug!("Discarded acquisition state after reconfiguration");
        }
        self.last_records_taken = 0;
        self.armed_at = None;
    }

    // ---- stream registry ----

    /// Add a stream to the active registry
    pub fn enable_stream(&mut self, triple: ChannelTriple) -> Result<Stream> {
        self.ensure_idle()?;
        let triple = triple.validate()?;
        let ChannelTriple { a, b, c } = triple;
        let stream = Stream::new(a, b, c, self.num_raw_integrators);
        tracing::info!(stream = %triple, sid = %stream.id, kind = %stream.kind, "Enabled stream");
        self.streams.insert(stream.id, stream);
        self.invalidate();
        Ok(stream)
    }

    /// Remove a stream from the active registry
    pub fn disable_stream(&mut self, triple: ChannelTriple) -> Result<()> {
        self.ensure_idle()?;
        let sid = StreamId::from_triple(triple.validate()?);
        if self.streams.remove(&sid).is_none() {
            tracing::error!(stream = %triple, "Tried to disable a stream that was not enabled");
            return Err(DigitizerError::StreamNotEnabled(sid));
        }
        tracing::info!(stream = %triple, sid = %sid, "Disabled stream");
        self.invalidate();
        Ok(())
    }

    /// Enabled streams in ID order
    pub fn streams(&self) -> Vec<Stream> {
        self.streams.values().copied().collect()
    }

    pub fn is_enabled(&self, sid: StreamId) -> bool {
        self.streams.contains_key(&sid)
    }

    fn stream(&self, sid: StreamId) -> Result<&Stream> {
        self.streams.get(&sid).ok_or_else(|| {
            tracing::error!(sid = %sid, "Stream is not enabled");
            DigitizerError::StreamNotEnabled(sid)
        })
    }

    // ---- configuration ----

    /// Validate and apply acquisition settings
    ///
    /// Nothing changes if validation fails.
    pub fn set_averager_settings(&mut self, settings: AcquisitionSettings) -> Result<()> {
        self.ensure_idle()?;
        settings.validate()?;
        self.settings = settings;
        self.invalidate();
        tracing::info!(
            record_length = settings.record_length,
            num_segments = settings.num_segments,
            num_waveforms = settings.num_waveforms,
            round_robins = settings.round_robins,
            num_records = settings.num_records(),
            "Acquisition settings applied"
        );
        Ok(())
    }

    /// Shorthand for [`Self::set_averager_settings`]
    pub fn configure(
        &mut self,
        record_length: usize,
        num_segments: usize,
        num_waveforms: usize,
        round_robins: usize,
    ) -> Result<()> {
        self.set_averager_settings(AcquisitionSettings::new(
            record_length,
            num_segments,
            num_waveforms,
            round_robins,
        ))
    }

    pub fn settings(&self) -> AcquisitionSettings {
        self.settings
    }

    pub fn set_mode(&mut self, mode: DigitizerMode) -> Result<()> {
        self.ensure_idle()?;
        if self.mode != mode {
            tracing::info!(mode = %mode, "Digitizer mode changed");
            self.mode = mode;
            self.invalidate();
        }
        Ok(())
    }

    pub fn mode(&self) -> DigitizerMode {
        self.mode
    }

    /// Largest correlation arity; values below 2 disable correlators
    pub fn set_max_correlation_arity(&mut self, arity: usize) -> Result<()> {
        self.ensure_idle()?;
        self.max_correlation_arity = arity;
        self.invalidate();
        Ok(())
    }

    pub fn max_correlation_arity(&self) -> usize {
        self.max_correlation_arity
    }

    /// Forward raw records of `sid` to `writer` from the next acquisition on
    pub fn register_socket<W: Write + Send + 'static>(&mut self, sid: StreamId, writer: W) {
        tracing::info!(sid = %sid, "Registered socket");
        self.sockets.insert(sid, sink::shared(writer));
    }

    pub fn unregister_sockets(&mut self) {
        if !self.sockets.is_empty() {
            tracing::info!(count = self.sockets.len(), "Unregistered sockets");
        }
        self.sockets.clear();
    }

    // ---- acquisition lifecycle ----

    /// Build the acquisition's sinks and start accepting buffers
    pub fn acquire(&mut self) -> Result<DeliveryPort> {
        self.ensure_idle()?;
        self.settings.validate()?;
        if self.streams.is_empty() {
            tracing::warn!("Arming an acquisition with no enabled streams");
        }

        let router = Arc::new(StreamRouter::build(
            &self.streams,
            &self.settings,
            self.mode,
            self.max_correlation_arity,
            &self.sockets,
        ));
        // a fresh flag so ports of earlier acquisitions cannot stop this one
        let running = Arc::new(AtomicBool::new(true));
        self.router = Some(Arc::clone(&router));
        self.running = Arc::clone(&running);
        self.last_records_taken = 0;
        self.armed_at = Some(Utc::now());

        tracing::info!(
            mode = %self.mode,
            streams = self.streams.len(),
            num_records = self.settings.num_records(),
            "Acquisition armed"
        );
        if router.check_done() {
            running.store(false, Ordering::Release);
            tracing::info!("Acquisition complete on arming");
        }
        Ok(DeliveryPort { router, running })
    }

    /// Stop accepting buffers; collected data stays readable
    pub fn stop(&mut self) {
        if self.running.swap(false, Ordering::AcqRel) {
            tracing::info!("Acquisition stopped");
        }
    }

    /// Stop and forget every registered socket
    pub fn close(&mut self) {
        self.stop();
        self.unregister_sockets();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// True once every active stream reached the target record count
    pub fn is_done(&self) -> bool {
        self.router.as_ref().map(|r| r.check_done()).unwrap_or(false)
    }

    /// Block until the acquisition stops, polling every [`WAIT_POLL_INTERVAL`]
    pub fn wait_for_acquisition(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while self.is_running() {
            if Instant::now() > deadline {
                tracing::warn!(timeout = ?timeout, "Timed out waiting for acquisition");
                return Err(DigitizerError::Timeout(timeout));
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
        Ok(())
    }

    /// When the current acquisition was armed
    pub fn armed_at(&self) -> Option<DateTime<Utc>> {
        self.armed_at
    }

    fn router(&self) -> Result<&StreamRouter> {
        self.router.as_deref().ok_or(DigitizerError::NotArmed)
    }

    fn require_averager(&self, operation: &str) -> Result<()> {
        if self.mode == DigitizerMode::Digitizer {
            tracing::error!(operation, "Not available in digitizer mode");
            return Err(DigitizerError::ModeError(self.mode.to_string()));
        }
        Ok(())
    }

    // ---- progress ----

    pub fn records_taken(&self, sid: StreamId) -> Result<u64> {
        self.stream(sid)?;
        self.router()?.records_taken(sid)
    }

    /// New-data indicator for polling clients
    ///
    /// Averager mode: 1 if any accumulator advanced since the last call, else 0.
    /// Digitizer mode: the smallest count of whole records waiting in any queue.
    pub fn num_new_records(&mut self) -> u64 {
        let Some(router) = self.router.as_deref() else {
            return 0;
        };
        match self.mode {
            DigitizerMode::Averager => {
                let current = router.max_records_taken();
                let advanced = current > self.last_records_taken;
                self.last_records_taken = current;
                advanced as u64
            }
            DigitizerMode::Digitizer => router.min_available_records(),
        }
    }

    /// Averager mode always has data; digitizer mode needs one whole queued record
    pub fn data_available(&self) -> bool {
        match self.mode {
            DigitizerMode::Averager => true,
            DigitizerMode::Digitizer => self
                .router
                .as_deref()
                .map(StreamRouter::any_available)
                .unwrap_or(false),
        }
    }

    // ---- transfers ----

    /// Copy a stream's mean (averager) or drain its queued records (digitizer)
    ///
    /// Returns the number of values written. An undersized `out` is filled as
    /// far as it goes.
    pub fn transfer_stream(&self, sid: StreamId, out: &mut [f64]) -> Result<usize> {
        self.stream(sid)?;
        let router = self.router()?;
        match self.mode {
            DigitizerMode::Averager => {
                let acc = lock_slot(router.accumulator(sid)?, sid)?;
                warn_if_short(sid, out.len(), acc.buffer_size());
                Ok(acc.snapshot(out))
            }
            DigitizerMode::Digitizer => {
                let len = out.len();
                router.queue(sid)?.get(out, len)
            }
        }
    }

    pub fn transfer_variance(&self, sid: StreamId, out: &mut [f64]) -> Result<usize> {
        self.require_averager("transfer_variance")?;
        self.stream(sid)?;
        let acc = lock_slot(self.router()?.accumulator(sid)?, sid)?;
        warn_if_short(sid, out.len(), acc.variance_buffer_size());
        Ok(acc.snapshot_variance(out))
    }

    /// Copy the mean of the correlator over `sids` (any order)
    pub fn transfer_correlation(&self, sids: &[StreamId], out: &mut [f64]) -> Result<usize> {
        self.require_averager("transfer_correlation")?;
        let (sid, corr) = self.correlator(sids)?;
        let corr = lock_slot(corr, sid)?;
        warn_if_short(sid, out.len(), corr.buffer_size());
        Ok(corr.snapshot(out))
    }

    pub fn transfer_correlation_variance(&self, sids: &[StreamId], out: &mut [f64]) -> Result<usize> {
        self.require_averager("transfer_correlation_variance")?;
        let (sid, corr) = self.correlator(sids)?;
        let corr = lock_slot(corr, sid)?;
        warn_if_short(sid, out.len(), corr.variance_buffer_size());
        Ok(corr.snapshot_variance(out))
    }

    /// Resolve a correlator, keyed for lock errors by its smallest member
    fn correlator(&self, sids: &[StreamId]) -> Result<(StreamId, &Mutex<Correlator>)> {
        for &sid in sids {
            self.stream(sid)?;
        }
        let corr = self.router()?.correlator(sids)?;
        let first = sids.iter().min().copied().unwrap_or(StreamId(0));
        Ok((first, corr))
    }

    /// Length a mean/records transfer will fill
    ///
    /// One ID addresses a stream; several address their correlator.
    pub fn buffer_size(&self, sids: &[StreamId]) -> Result<usize> {
        match sids {
            [sid] => {
                self.stream(*sid)?;
                let router = self.router()?;
                match self.mode {
                    DigitizerMode::Averager => {
                        Ok(lock_slot(router.accumulator(*sid)?, *sid)?.buffer_size())
                    }
                    DigitizerMode::Digitizer => Ok(router.queue(*sid)?.buffer_size()),
                }
            }
            _ => {
                self.require_averager("buffer_size")?;
                let (sid, corr) = self.correlator(sids)?;
                Ok(lock_slot(corr, sid)?.buffer_size())
            }
        }
    }

    /// Length a variance transfer will fill
    pub fn variance_buffer_size(&self, sids: &[StreamId]) -> Result<usize> {
        self.require_averager("variance_buffer_size")?;
        match sids {
            [sid] => {
                self.stream(*sid)?;
                let acc = lock_slot(self.router()?.accumulator(*sid)?, *sid)?;
                Ok(acc.variance_buffer_size())
            }
            _ => {
                let (sid, corr) = self.correlator(sids)?;
                Ok(lock_slot(corr, sid)?.variance_buffer_size())
            }
        }
    }

    /// Samples per record of an enabled stream under the current settings
    pub fn record_length(&self, triple: ChannelTriple) -> Result<usize> {
        let stream = self.stream(StreamId::from_triple(triple.validate()?))?;
        Ok(stream.record_length(self.settings.record_length))
    }

    /// Member sets of the current acquisition's correlators
    pub fn correlator_sets(&self) -> Vec<Vec<StreamId>> {
        self.router
            .as_deref()
            .map(StreamRouter::correlator_sets)
            .unwrap_or_default()
    }
}

impl Default for Digitizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Digitizer {
    fn drop(&mut self) {
        self.close();
    }
}

fn warn_if_short(sid: StreamId, have: usize, need: usize) {
    if have < need {
        tracing::warn!(sid = %sid, have, need, "Output buffer too small, transfer truncated");
    }
}
