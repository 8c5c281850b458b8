//! Acquisition pipeline
//!
//! - [`settings`]: acquisition parameters, mode and persistence
//! - [`packet`]: tagged buffers handed over by the packet-delivery path
//! - [`queue`] and [`sink`]: raw record FIFO and socket framing
//! - [`router`]: per-acquisition dispatch arena
//! - [`engine`]: the [`Digitizer`](engine::Digitizer) controlling surface
//! - [`synth`]: deterministic packet source for tests and demos

pub mod engine;
pub mod packet;
pub mod queue;
pub mod router;
pub mod settings;
pub mod sink;
pub mod synth;
