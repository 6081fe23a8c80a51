//! Negotiator: the control-plane-facing orchestrator.
//!
//! Translates `SESSION_START`/`SESSION_END` into registry/pipeline
//! lifecycle calls. The actual broker connection is external and is
//! represented only by the [`ControlPlaneTransport`] trait seam, in the
//! same spirit as the host project's `TaskSpawner`/`IpDetector`/
//! `EventEmitter` seams - core logic runs end to end against an
//! in-memory test double, with a real broker client left as an
//! embedder's job.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::MemorySettings;
use crate::jitter::{JitterConfig, MemoryBudget};
use crate::pipeline;
use crate::protocol_constants::DRAIN_TIMEOUT_MS;
use crate::runtime::TaskSpawner;
use crate::session::{PipelineMessage, SessionRegistry, SessionStats};
use crate::sink::Sink;
use crate::wire::AudioFormat;

/// One control-plane message, JSON-encoded on the wire by whatever broker
/// client an embedder provides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    #[serde(rename = "SESSION_START")]
    SessionStart {
        session_id: String,
        audio_stream_port: u16,
        client_endpoint: String,
        expected_format: String,
        sample_rate: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        estimated_duration_ms: Option<u64>,
    },
    #[serde(rename = "SESSION_READY")]
    SessionReady {
        session_id: String,
        receiver_ready: bool,
        udp_endpoint: String,
        buffer_size_ms: u32,
    },
    #[serde(rename = "SESSION_END")]
    SessionEnd {
        session_id: String,
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        statistics: Option<SessionStatistics>,
    },
    #[serde(rename = "SESSION_ENDED")]
    SessionEnded {
        session_id: String,
        statistics: SessionStatistics,
    },
}

/// Serializable snapshot of [`SessionStats`] for the `SESSION_ENDED`
/// confirmation.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionStatistics {
    pub received: u64,
    pub lost: u64,
    pub duplicate: u64,
    pub reordered: u64,
    pub dropped_late: u64,
    pub dropped_overrun: u64,
    pub underruns: u64,
    pub overruns: u64,
}

impl From<&SessionStats> for SessionStatistics {
    fn from(s: &SessionStats) -> Self {
        Self {
            received: s.received,
            lost: s.lost,
            duplicate: s.duplicate,
            reordered: s.reordered,
            dropped_late: s.dropped_late,
            dropped_overrun: s.dropped_overrun,
            underruns: s.underruns,
            overruns: s.overruns,
        }
    }
}

/// Transport seam for the control plane. An embedder's broker client
/// implements this; nothing in this crate knows what broker sits behind
/// it.
#[async_trait]
pub trait ControlPlaneTransport: Send + Sync {
    async fn recv(&self) -> Option<ControlMessage>;
    async fn send(&self, msg: ControlMessage);
}

/// In-memory channel-backed transport, for tests and for embedding
/// without a real broker.
pub struct InMemoryTransport {
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<ControlMessage>>,
    outbound: mpsc::UnboundedSender<ControlMessage>,
}

impl InMemoryTransport {
    /// Builds a transport pair: (the negotiator's endpoint, a handle a
    /// test harness uses to drive it and observe replies).
    pub fn pair() -> (Arc<Self>, InMemoryTransportHandle) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            inbound: tokio::sync::Mutex::new(in_rx),
            outbound: out_tx,
        });
        let handle = InMemoryTransportHandle {
            inbound: in_tx,
            outbound: tokio::sync::Mutex::new(out_rx),
        };
        (transport, handle)
    }
}

#[async_trait]
impl ControlPlaneTransport for InMemoryTransport {
    async fn recv(&self) -> Option<ControlMessage> {
        self.inbound.lock().await.recv().await
    }

    async fn send(&self, msg: ControlMessage) {
        let _ = self.outbound.send(msg);
    }
}

/// Test/embedding harness side of an [`InMemoryTransport`] pair.
pub struct InMemoryTransportHandle {
    inbound: mpsc::UnboundedSender<ControlMessage>,
    outbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<ControlMessage>>,
}

impl InMemoryTransportHandle {
    pub fn push(&self, msg: ControlMessage) {
        let _ = self.inbound.send(msg);
    }

    pub async fn next_reply(&self) -> Option<ControlMessage> {
        self.outbound.lock().await.recv().await
    }
}

fn parse_format(tag: &str) -> Option<AudioFormat> {
    match tag {
        "pcm" => Some(AudioFormat::Pcm),
        "mp3" => Some(AudioFormat::Mp3),
        "opus" => Some(AudioFormat::Opus),
        _ => None,
    }
}

fn now_ms(epoch: Instant) -> u64 {
    Instant::now().saturating_duration_since(epoch).as_millis() as u64
}

/// Orchestrates the control-plane-driven half of a session's lifecycle:
/// registration, tick-task spawn, and teardown. Runs as one task reading
/// a [`ControlPlaneTransport`] until it closes.
pub struct Negotiator {
    registry: Arc<SessionRegistry>,
    transport: Arc<dyn ControlPlaneTransport>,
    spawner: Arc<dyn TaskSpawner>,
    sink: Arc<dyn Sink>,
    jitter_config: JitterConfig,
    memory: MemorySettings,
    receiver_endpoint: SocketAddr,
    epoch: Instant,
    root_cancel: CancellationToken,
    cancel_tokens: DashMap<String, CancellationToken>,
}

impl Negotiator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<SessionRegistry>,
        transport: Arc<dyn ControlPlaneTransport>,
        spawner: Arc<dyn TaskSpawner>,
        sink: Arc<dyn Sink>,
        jitter_config: JitterConfig,
        memory: MemorySettings,
        receiver_endpoint: SocketAddr,
        epoch: Instant,
        root_cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            transport,
            spawner,
            sink,
            jitter_config,
            memory,
            receiver_endpoint,
            epoch,
            root_cancel,
            cancel_tokens: DashMap::new(),
        }
    }

    /// Reads control messages until the transport closes or the root
    /// token is cancelled.
    pub async fn run(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.root_cancel.cancelled() => break,
                msg = self.transport.recv() => {
                    match msg {
                        Some(msg) => self.clone().handle_message(msg).await,
                        None => break,
                    }
                }
            }
        }
    }

    async fn handle_message(self: Arc<Self>, msg: ControlMessage) {
        match msg {
            ControlMessage::SessionStart {
                session_id,
                client_endpoint,
                expected_format,
                sample_rate,
                ..
            } => {
                self.start_session(session_id, client_endpoint, expected_format, sample_rate)
                    .await;
            }
            ControlMessage::SessionEnd {
                session_id, reason, ..
            } => {
                self.end_session(session_id, reason).await;
            }
            // Replies the negotiator itself never receives; ignored if an
            // embedder's broker loops them back.
            ControlMessage::SessionReady { .. } | ControlMessage::SessionEnded { .. } => {}
        }
    }

    async fn start_session(
        &self,
        session_id: String,
        client_endpoint: String,
        expected_format: String,
        sample_rate: u32,
    ) {
        let Some(format) = parse_format(&expected_format) else {
            log::warn!("SESSION_START for {session_id} named an unknown format {expected_format}");
            return;
        };
        let Ok(endpoint) = client_endpoint.parse::<SocketAddr>() else {
            log::warn!("SESSION_START for {session_id} had an unparsable endpoint {client_endpoint}");
            return;
        };

        tracing::info!(session_id = %session_id, %client_endpoint, sample_rate, "session_start");

        self.registry
            .register(&session_id, endpoint, format, sample_rate, now_ms(self.epoch));

        let (tx, rx) = mpsc::unbounded_channel();
        self.registry.set_inbound(&session_id, tx);

        let cancel = self.root_cancel.child_token();
        self.cancel_tokens.insert(session_id.clone(), cancel.clone());

        let registry = self.registry.clone();
        let sink = self.sink.clone();
        let jitter_config = self.jitter_config;
        let memory = MemoryBudget {
            per_session_bytes: self.memory.per_session_bytes,
            total_bytes: self.memory.total_bytes,
            total_buffered: self.registry.buffered_bytes_counter(),
        };
        let epoch = self.epoch;
        let pipeline_session_id = session_id.clone();

        self.spawner.spawn(async move {
            pipeline::run(
                pipeline_session_id,
                sample_rate,
                jitter_config,
                memory,
                rx,
                registry,
                sink,
                cancel,
                epoch,
            )
            .await;
        });

        self.transport
            .send(ControlMessage::SessionReady {
                session_id,
                receiver_ready: true,
                udp_endpoint: self.receiver_endpoint.to_string(),
                buffer_size_ms: self.jitter_config.target_buffer_ms as u32,
            })
            .await;
    }

    async fn end_session(&self, session_id: String, _reason: String) {
        self.registry
            .send_to_pipeline(&session_id, PipelineMessage::EndOfStream);

        let deadline = Instant::now() + Duration::from_millis(DRAIN_TIMEOUT_MS);
        while Instant::now() < deadline && self.registry.lookup(&session_id).is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Either the tick task drained and self-deregistered already (the
        // common path - its stats are waiting in `last_stats`), or it's
        // still running past the drain deadline and must be force-cancelled
        // and deregistered here instead.
        if let Some((_, cancel)) = self.cancel_tokens.remove(&session_id) {
            cancel.cancel();
        }
        let stats = self
            .registry
            .deregister(&session_id)
            .or_else(|| self.registry.take_final_stats(&session_id))
            .unwrap_or_default();

        tracing::info!(session_id = %session_id, received = stats.received, lost = stats.lost, "session_end");

        self.transport
            .send(ControlMessage::SessionEnded {
                session_id,
                statistics: SessionStatistics::from(&stats),
            })
            .await;
    }

    /// Periodically sweeps sessions that have gone idle past `timeout_ms`
    /// (no datagrams, no `SESSION_END`) and tears them down the same way an
    /// explicit end would - cancelling the tick task and sending the
    /// `SESSION_ENDED` confirmation - since their sender has vanished and
    /// nothing else will ever deregister them.
    pub async fn run_idle_sweep(self: Arc<Self>, interval_ms: u64, timeout_ms: u64) {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.root_cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let expired = self.registry.expire_idle(now_ms(self.epoch), timeout_ms);
                    for session_id in expired {
                        if let Some((_, cancel)) = self.cancel_tokens.remove(&session_id) {
                            cancel.cancel();
                        }
                        let stats = self.registry.take_final_stats(&session_id).unwrap_or_default();
                        tracing::info!(session_id = %session_id, "session_idle_timeout");
                        self.transport
                            .send(ControlMessage::SessionEnded {
                                session_id,
                                statistics: SessionStatistics::from(&stats),
                            })
                            .await;
                    }
                }
            }
        }
    }
}
