//! session-relay-core - a hybrid control-plane/data-plane audio relay.
//!
//! Ingests UDP audio datagrams, maps sender timestamps onto the local
//! clock, paces their release through an adaptive jitter buffer, and
//! schedules subtitle edges alongside the audio they describe. The
//! reliable control channel (session setup/teardown) is external to
//! this crate; it is represented only by the [`negotiator::ControlPlaneTransport`]
//! trait seam.
//!
//! # Architecture
//!
//! - [`wire`]: UDP datagram encode/decode
//! - [`session`]: session identity, lifecycle, and the concurrent registry
//! - [`sync`]: per-session clock-offset baseline and network-condition estimate
//! - [`jitter`]: adaptive deadline-release buffer
//! - [`subtitle`]: subtitle show/hide edge scheduling
//! - [`receiver`]: the UDP ingest task
//! - [`pipeline`]: the per-session emission tick task
//! - [`negotiator`]: control-plane orchestration
//! - [`sink`]: downstream delivery trait seam
//! - [`config`]: validated runtime configuration
//! - [`error`]: centralized error types
//!
//! # Abstraction traits
//!
//! - [`TaskSpawner`](runtime::TaskSpawner): spawning background tasks
//! - [`Sink`](sink::Sink): delivering audio/subtitle events downstream
//! - [`ControlPlaneTransport`](negotiator::ControlPlaneTransport): the external broker connection
//!
//! Each has an in-memory or logging implementation usable without any
//! live runtime, broker, or sink.

#![warn(clippy::all)]

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod jitter;
pub mod negotiator;
pub mod pipeline;
pub mod protocol_constants;
pub mod receiver;
pub mod runtime;
pub mod session;
pub mod sink;
pub mod subtitle;
pub mod sync;
pub mod wire;

pub use bootstrap::{bootstrap_services, BootstrappedServices};
pub use config::Config;
pub use error::{ErrorCode, RelayError, RelayResult};
pub use negotiator::{ControlMessage, ControlPlaneTransport, InMemoryTransport, Negotiator};
pub use runtime::{TaskSpawner, TokioSpawner};
pub use session::{SessionRegistry, SessionState, SessionStats};
pub use sink::{LoggingSink, NoopSink, Sink, SinkEvent};
pub use wire::{AudioFormat, AudioPacket};
