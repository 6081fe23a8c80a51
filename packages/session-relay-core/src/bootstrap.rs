//! Composition root: the single place where the receiver, registry,
//! negotiator, and their dependencies are instantiated and wired
//! together.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::RelayResult;
use crate::negotiator::{ControlPlaneTransport, InMemoryTransport, InMemoryTransportHandle, Negotiator};
use crate::receiver;
use crate::runtime::TokioSpawner;
use crate::session::SessionRegistry;
use crate::sink::Sink;

/// Container for all bootstrapped services. Dropping this does not stop
/// anything in flight - call [`BootstrappedServices::shutdown`] first.
#[derive(Clone)]
pub struct BootstrappedServices {
    /// Shared session state, written by the receiver and the negotiator.
    pub registry: Arc<SessionRegistry>,
    /// Control-plane orchestrator.
    pub negotiator: Arc<Negotiator>,
    /// Task spawner used for the receiver, negotiator, and per-session
    /// tick tasks.
    pub spawner: TokioSpawner,
    /// Root cancellation token; cancelling it tears down every
    /// in-flight session and the negotiator's read loop.
    pub cancel_token: CancellationToken,
    /// The address the UDP data-plane socket is bound to.
    pub udp_endpoint: SocketAddr,
}

impl BootstrappedServices {
    /// Cancels the root token, which cascades to the negotiator's loop
    /// and every per-session tick task. Idempotent.
    pub async fn shutdown(&self) {
        log::info!("beginning graceful shutdown");
        self.cancel_token.cancel();
        log::info!("shutdown signaled");
    }
}

/// Bootstraps the receiver, registry, and negotiator against a
/// caller-supplied control-plane transport and sink.
///
/// Wiring order matters - services are created in dependency order:
///
/// 1. Validate configuration (core-fatal if invalid).
/// 2. Bind the UDP data-plane socket (core-fatal if the bind fails).
/// 3. Create the session registry - the only thing the receiver and the
///    negotiator share.
/// 4. Create the task spawner and the root cancellation token.
/// 5. Spawn the receiver task (owns the socket).
/// 6. Wire and spawn the negotiator (owns the control-plane transport).
/// 7. Spawn the negotiator's idle-session sweep task.
pub async fn bootstrap_services(
    config: &Config,
    control_plane: Arc<dyn ControlPlaneTransport>,
    sink: Arc<dyn Sink>,
) -> RelayResult<BootstrappedServices> {
    config.validate()?;

    let bind_addr: SocketAddr = ([0, 0, 0, 0], config.udp_port).into();
    let socket = receiver::bind_socket(bind_addr)?;
    let udp_endpoint = socket.local_addr().unwrap_or(bind_addr);

    let registry = Arc::new(SessionRegistry::new());
    let spawner = TokioSpawner::current();
    let cancel_token = CancellationToken::new();
    let epoch = Instant::now();

    let receiver_registry = registry.clone();
    let receiver_cancel = cancel_token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = receiver_cancel.cancelled() => {}
            _ = receiver::run(socket, receiver_registry, epoch) => {}
        }
    });

    let negotiator = Arc::new(Negotiator::new(
        registry.clone(),
        control_plane,
        Arc::new(spawner.clone()),
        sink,
        config.jitter.to_jitter_config(),
        config.memory,
        udp_endpoint,
        epoch,
        cancel_token.clone(),
    ));
    tokio::spawn(negotiator.clone().run());
    tokio::spawn(
        negotiator
            .clone()
            .run_idle_sweep(config.session.cleanup_interval_ms, config.session.timeout_ms),
    );

    Ok(BootstrappedServices {
        registry,
        negotiator,
        spawner,
        cancel_token,
        udp_endpoint,
    })
}

/// Bootstraps against an in-memory control-plane transport instead of a
/// real broker client, returning the harness handle alongside the
/// services so a test (or an embedder without a broker yet) can drive
/// `SESSION_START`/`SESSION_END` directly.
pub async fn bootstrap_for_testing(
    config: &Config,
    sink: Arc<dyn Sink>,
) -> RelayResult<(BootstrappedServices, InMemoryTransportHandle)> {
    let (transport, handle) = InMemoryTransport::pair();
    let services = bootstrap_services(config, transport, sink).await?;
    Ok((services, handle))
}
