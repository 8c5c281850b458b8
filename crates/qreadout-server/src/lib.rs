//! Qreadout Server - REST control surface for the digitizer engine
//!
//! The [`Digitizer`] lives on a dedicated engine thread and is driven through
//! a command channel, so axum handlers never hold engine state across an
//! `.await`. Acquisitions are fed by the synthetic packet source.

pub mod api;

use axum::http::{header, HeaderValue};
use axum::Router;
use crossbeam_channel::bounded;
use qreadout_core::{
    AcquisitionSettings, ChannelTriple, DeliveryHandle, Digitizer, DigitizerError, DigitizerMode,
    Stream, StreamId, SyntheticSource,
};
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;

/// Buffers in flight between the synthetic source and the delivery thread
const DELIVERY_QUEUE_DEPTH: usize = 256;

type Reply<T> = oneshot::Sender<Result<T, DigitizerError>>;

/// Which snapshot a transfer command reads
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transfer {
    Mean,
    Variance,
    /// Drain queued raw records (digitizer mode)
    Records,
}

/// Commands sent to the engine thread
pub enum EngineCommand {
    EnableStream {
        triple: ChannelTriple,
        reply: Reply<Stream>,
    },
    DisableStream {
        triple: ChannelTriple,
        reply: Reply<()>,
    },
    SetSettings {
        settings: AcquisitionSettings,
        reply: Reply<AcquisitionSettings>,
    },
    SetMode {
        mode: DigitizerMode,
        reply: Reply<DigitizerMode>,
    },
    Acquire {
        reply: Reply<EngineStatus>,
    },
    Stop {
        reply: oneshot::Sender<EngineStatus>,
    },
    GetStatus {
        reply: oneshot::Sender<EngineStatus>,
    },
    TransferStream {
        sid: StreamId,
        what: Transfer,
        reply: Reply<Vec<f64>>,
    },
    TransferCorrelation {
        sids: Vec<StreamId>,
        what: Transfer,
        reply: Reply<Vec<f64>>,
    },
}

/// Per-stream progress in a status snapshot
#[derive(Clone, Debug, Serialize)]
pub struct StreamStatus {
    #[serde(flatten)]
    pub stream: Stream,
    pub records_taken: Option<u64>,
}

/// Engine status snapshot (safe to send between threads)
#[derive(Clone, Debug, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub done: bool,
    pub mode: DigitizerMode,
    pub settings: AcquisitionSettings,
    pub num_records: u64,
    pub streams: Vec<StreamStatus>,
    pub correlators: Vec<Vec<StreamId>>,
    pub armed_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Errors surfaced by [`EngineHandle`] calls
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Digitizer(#[from] DigitizerError),

    #[error("Engine thread died")]
    ThreadDied,
}

/// Engine-thread state: the digitizer plus the threads feeding it
struct EngineWorker {
    digitizer: Digitizer,
    delivery: Option<DeliveryHandle>,
    source: Option<std::thread::JoinHandle<usize>>,
}

impl EngineWorker {
    fn new() -> Self {
        Self {
            digitizer: Digitizer::new(),
            delivery: None,
            source: None,
        }
    }

    fn status(&self) -> EngineStatus {
        let dig = &self.digitizer;
        EngineStatus {
            running: dig.is_running(),
            done: dig.is_done(),
            mode: dig.mode(),
            settings: dig.settings(),
            num_records: dig.settings().num_records(),
            streams: dig
                .streams()
                .into_iter()
                .map(|stream| StreamStatus {
                    records_taken: dig.records_taken(stream.id).ok(),
                    stream,
                })
                .collect(),
            correlators: dig.correlator_sets(),
            armed_at: dig.armed_at(),
        }
    }

    /// Join feeder threads left over from a finished or stopped acquisition
    fn reap(&mut self) {
        if let Some(mut delivery) = self.delivery.take() {
            delivery.stop();
        }
        if let Some(source) = self.source.take() {
            match source.join() {
                Ok(sent) => tracing::debug!(sent, "Synthetic source joined"),
                Err(_) => tracing::error!("Synthetic source thread panicked"),
            }
        }
    }

    fn acquire(&mut self) -> Result<EngineStatus, DigitizerError> {
        if self.digitizer.is_running() {
            return Err(DigitizerError::Busy);
        }
        self.reap();
        let port = self.digitizer.acquire()?;
        let source = SyntheticSource::new(&self.digitizer.streams(), self.digitizer.settings());
        let (tx, rx) = bounded(DELIVERY_QUEUE_DEPTH);
        self.delivery = Some(port.spawn(rx)?);
        self.source = Some(source.spawn(tx)?);
        Ok(self.status())
    }

    fn stop(&mut self) -> EngineStatus {
        self.digitizer.stop();
        // the delivery thread drops its receiver on exit, which unblocks the source
        self.reap();
        self.status()
    }

    fn transfer_stream(&self, sid: StreamId, what: Transfer) -> Result<Vec<f64>, DigitizerError> {
        let dig = &self.digitizer;
        match (what, dig.mode()) {
            (Transfer::Mean, DigitizerMode::Averager) => {
                let mut out = vec![0.0; dig.buffer_size(&[sid])?];
                let n = dig.transfer_stream(sid, &mut out)?;
                out.truncate(n);
                Ok(out)
            }
            (Transfer::Records, DigitizerMode::Digitizer) => {
                let mut out = vec![0.0; dig.buffer_size(&[sid])?];
                let n = dig.transfer_stream(sid, &mut out)?;
                out.truncate(n);
                Ok(out)
            }
            (Transfer::Variance, _) => {
                let mut out = vec![0.0; dig.variance_buffer_size(&[sid])?];
                let n = dig.transfer_variance(sid, &mut out)?;
                out.truncate(n);
                Ok(out)
            }
            (_, mode) => Err(DigitizerError::ModeError(mode.to_string())),
        }
    }

    fn transfer_correlation(&self, sids: &[StreamId], what: Transfer) -> Result<Vec<f64>, DigitizerError> {
        let dig = &self.digitizer;
        match what {
            Transfer::Mean => {
                let mut out = vec![0.0; dig.buffer_size(sids)?];
                let n = dig.transfer_correlation(sids, &mut out)?;
                out.truncate(n);
                Ok(out)
            }
            Transfer::Variance => {
                let mut out = vec![0.0; dig.variance_buffer_size(sids)?];
                let n = dig.transfer_correlation_variance(sids, &mut out)?;
                out.truncate(n);
                Ok(out)
            }
            Transfer::Records => Err(DigitizerError::ModeError(dig.mode().to_string())),
        }
    }

    fn handle(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::EnableStream { triple, reply } => {
                let _ = reply.send(self.digitizer.enable_stream(triple));
            }
            EngineCommand::DisableStream { triple, reply } => {
                let _ = reply.send(self.digitizer.disable_stream(triple));
            }
            EngineCommand::SetSettings { settings, reply } => {
                let result = self
                    .digitizer
                    .set_averager_settings(settings)
                    .map(|()| self.digitizer.settings());
                let _ = reply.send(result);
            }
            EngineCommand::SetMode { mode, reply } => {
                let result = self.digitizer.set_mode(mode).map(|()| self.digitizer.mode());
                let _ = reply.send(result);
            }
            EngineCommand::Acquire { reply } => {
                let _ = reply.send(self.acquire());
            }
            EngineCommand::Stop { reply } => {
                let _ = reply.send(self.stop());
            }
            EngineCommand::GetStatus { reply } => {
                let _ = reply.send(self.status());
            }
            EngineCommand::TransferStream { sid, what, reply } => {
                let _ = reply.send(self.transfer_stream(sid, what));
            }
            EngineCommand::TransferCorrelation { sids, what, reply } => {
                let _ = reply.send(self.transfer_correlation(&sids, what));
            }
        }
    }
}

/// Handle to communicate with the engine thread
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    /// Spawn the engine on a dedicated thread and return a handle
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::channel::<EngineCommand>(32);

        std::thread::spawn(move || {
            let mut worker = EngineWorker::new();
            while let Some(cmd) = rx.blocking_recv() {
                worker.handle(cmd);
            }
            worker.stop();
            tracing::info!("Engine thread exiting");
        });

        Self { tx }
    }

    async fn call<T>(&self, cmd: impl FnOnce(oneshot::Sender<T>) -> EngineCommand) -> Result<T, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(cmd(reply))
            .await
            .map_err(|_| EngineError::ThreadDied)?;
        rx.await.map_err(|_| EngineError::ThreadDied)
    }

    async fn try_call<T>(&self, cmd: impl FnOnce(Reply<T>) -> EngineCommand) -> Result<T, EngineError> {
        Ok(self.call(cmd).await??)
    }

    pub async fn enable_stream(&self, triple: ChannelTriple) -> Result<Stream, EngineError> {
        self.try_call(|reply| EngineCommand::EnableStream { triple, reply }).await
    }

    pub async fn disable_stream(&self, triple: ChannelTriple) -> Result<(), EngineError> {
        self.try_call(|reply| EngineCommand::DisableStream { triple, reply }).await
    }

    pub async fn set_settings(&self, settings: AcquisitionSettings) -> Result<AcquisitionSettings, EngineError> {
        self.try_call(|reply| EngineCommand::SetSettings { settings, reply }).await
    }

    pub async fn set_mode(&self, mode: DigitizerMode) -> Result<DigitizerMode, EngineError> {
        self.try_call(|reply| EngineCommand::SetMode { mode, reply }).await
    }

    /// Arm an acquisition and start feeding it synthetic packets
    pub async fn acquire(&self) -> Result<EngineStatus, EngineError> {
        self.try_call(|reply| EngineCommand::Acquire { reply }).await
    }

    pub async fn stop(&self) -> Result<EngineStatus, EngineError> {
        self.call(|reply| EngineCommand::Stop { reply }).await
    }

    pub async fn get_status(&self) -> Result<EngineStatus, EngineError> {
        self.call(|reply| EngineCommand::GetStatus { reply }).await
    }

    pub async fn transfer_stream(&self, sid: StreamId, what: Transfer) -> Result<Vec<f64>, EngineError> {
        self.try_call(|reply| EngineCommand::TransferStream { sid, what, reply }).await
    }

    pub async fn transfer_correlation(&self, sids: Vec<StreamId>, what: Transfer) -> Result<Vec<f64>, EngineError> {
        self.try_call(|reply| EngineCommand::TransferCorrelation { sids, what, reply }).await
    }
}

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    /// Handle to engine thread
    pub engine: EngineHandle,
    /// Server configuration
    pub config: ServerConfig,
}

/// Server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,
    /// Bind address
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8930,
            bind_addr: "0.0.0.0".to_string(),
        }
    }
}

impl AppState {
    pub fn new(engine: EngineHandle, config: ServerConfig) -> Self {
        Self { engine, config }
    }
}

/// Build the Axum router with all routes
pub fn build_router(state: AppState) -> Router {
    use axum::routing::{get, post, put};

    Router::new()
        .route("/api/v1/status", get(api::get_status))
        .route(
            "/api/v1/streams",
            post(api::enable_stream).delete(api::disable_stream),
        )
        .route(
            "/api/v1/settings",
            get(api::get_settings).put(api::update_settings),
        )
        .route("/api/v1/mode", put(api::set_mode))
        .route("/api/v1/acquire", post(api::acquire))
        .route("/api/v1/stop", post(api::stop))
        .route("/api/v1/streams/{sid}/mean", get(api::stream_mean))
        .route("/api/v1/streams/{sid}/variance", get(api::stream_variance))
        .route("/api/v1/streams/{sid}/records", get(api::stream_records))
        .route("/api/v1/correlations/mean", get(api::correlation_mean))
        .route(
            "/api/v1/correlations/variance",
            get(api::correlation_variance),
        )
        .route("/api/v1/remote-url", get(api::get_remote_url))
        .layer(CorsLayer::permissive())
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .with_state(state)
}

/// Start the web server
pub async fn start_server(state: AppState) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.bind_addr, state.config.port);
    let app = build_router(state);

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "Qreadout server listening");

    axum::serve(listener, app).await?;
    Ok(())
}
