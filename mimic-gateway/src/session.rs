//! Session Controller (C9): owns the top-level cancellable context, the
//! accept loop for hijacked connections, and per-connection task
//! lifecycle.
//!
//! Grounded on `listener.rs`'s peek-then-dispatch accept loop and
//! `session.rs`'s panic-boundary/shutdown pattern, generalized from
//! "sessions keyed by id" to "one task per hijacked connection", using
//! `mimic-task`'s `Task`/`ChildTask`/`ShutdownSignal` for cancellation
//! fan-out.
//!
//! The kernel event tracker (C1/A4) runs alongside the live accept loop
//! rather than feeding it: the accept loop drives the actual proxying
//! socket for every hijacked connection in both modes (per §4.9, both
//! record and mock open or lazily prepare a destination dial), while C1
//! independently watches the kernel's own byte-count telemetry for that
//! same traffic to catch truncated/malformed connections the framed HTTP
//! read loop wouldn't otherwise notice. See DESIGN.md for the reasoning.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mimic_task::{spawn_task, ChildTask, ShutdownHandle, ShutdownSignal};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, info_span, warn, Instrument};

use crate::config::{Conf, RunMode};
use crate::error::EngineError;
use crate::http::HttpEngine;
use crate::kernel_event::ClockOffset;
use crate::kernel_event_source::{KernelEventSource, KernelEventStreams};
use crate::mock::{CaptureSink, MockStoreHandle};
use crate::protocol::{GenericFallbackPlugin, HttpPlugin, ProtocolRegistry};
use crate::resolver::{DestinationInfo, DestinationResolver};
use crate::target;
use crate::tracker::{ConnectionTracker, TrackerSweeper};

/// Per-mode collaborators the controller needs in addition to the shared
/// C1-C4 plumbing. Built by the binary entrypoint once `Conf` and (in
/// mock mode) the loaded mock set are available.
#[derive(Clone)]
pub enum ModeContext {
    Record { capture: Arc<CaptureSink> },
    Mock { store: MockStoreHandle },
}

pub struct SessionController {
    conf: Conf,
    tracker: ConnectionTracker,
    resolver: DestinationResolver,
    registry: Arc<ProtocolRegistry>,
    http_engine: Arc<HttpEngine>,
}

impl SessionController {
    pub fn new(conf: Conf) -> Self {
        let tracker = ConnectionTracker::new(conf.buffer_cap_bytes, conf.tracker_inactivity_threshold, ClockOffset::capture());
        let resolver = DestinationResolver::new();

        let mut registry = ProtocolRegistry::new();
        registry.register(Arc::new(HttpPlugin));
        registry.register(Arc::new(GenericFallbackPlugin));

        let http_engine = Arc::new(HttpEngine::new(conf.bypass_rules.clone(), conf.idle_read_deadline));

        Self {
            conf,
            tracker,
            resolver,
            registry: Arc::new(registry),
            http_engine,
        }
    }

    pub fn resolver(&self) -> DestinationResolver {
        self.resolver.clone()
    }

    pub fn tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    /// Runs the accept loop, the tracker sweeper, and (if supplied) the
    /// kernel event source until ctrl-c fires. Returns once every spawned
    /// task has wound down.
    ///
    /// `kernel_events` is `None` when nothing wires C1/A4 up to a real
    /// kernel hook (the hook itself is out of scope for this core, per
    /// §1); the accept loop and protocol engines run unaffected either
    /// way, since C1 only watches traffic, it never gates it.
    pub async fn run(self, mode: ModeContext, kernel_events: Option<KernelEventStreams>) -> anyhow::Result<()> {
        let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();
        let listener = TcpListener::bind(self.conf.listen_addr).await?;
        info!(addr = %self.conf.listen_addr, "listening for hijacked connections");

        let sweeper = TrackerSweeper::new(self.tracker.clone(), self.conf.tracker_sweep_interval, |record| {
            tracing::trace!(conn = ?record.id, "tracker drained a complete connection record");
        });
        let _sweeper_task = spawn_task(sweeper, shutdown_signal.clone());

        let _kernel_event_task = kernel_events
            .map(|streams| KernelEventSource::from_streams(streams, self.tracker.clone()))
            .map(|source| spawn_task(source, shutdown_signal.clone()));

        let mut connection_tasks: Vec<ChildTask<()>> = Vec::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(error) => {
                            warn!(%error, "accept failed");
                            continue;
                        }
                    };

                    let task = self.spawn_connection(stream, peer_addr, mode.clone(), shutdown_signal.clone());
                    connection_tasks.push(task);
                }
                _ = wait_for_ctrl_c() => {
                    info!("shutdown requested");
                    shutdown_handle.signal();
                    break;
                }
            }
        }

        for task in connection_tasks {
            let _ = task.join().await;
        }

        Ok(())
    }

    fn spawn_connection(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        mode: ModeContext,
        mut shutdown_signal: ShutdownSignal,
    ) -> ChildTask<()> {
        let resolver = self.resolver.clone();
        let registry = Arc::clone(&self.registry);
        let http_engine = Arc::clone(&self.http_engine);
        let run_mode = self.conf.run_mode;
        let idle_read_deadline = self.conf.idle_read_deadline;

        let span = info_span!("connection", peer = %peer_addr);

        ChildTask::spawn(
            async move {
                let outcome = tokio::select! {
                    result = handle_connection(stream, peer_addr, resolver, registry, http_engine, run_mode, idle_read_deadline, mode) => result,
                    _ = shutdown_signal.wait() => Ok(()),
                };

                if let Err(error) = outcome {
                    if error.is_expected_disconnect() {
                        tracing::info!(%error, "connection closed");
                    } else {
                        warn!(%error, "connection terminated with an error");
                    }
                }
            }
            .instrument(span),
        )
    }
}

async fn wait_for_ctrl_c() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "failed to listen for ctrl-c, shutdown must be triggered another way");
        std::future::pending::<()>().await;
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    resolver: DestinationResolver,
    registry: Arc<ProtocolRegistry>,
    http_engine: Arc<HttpEngine>,
    run_mode: RunMode,
    idle_read_deadline: Duration,
    mode: ModeContext,
) -> Result<(), EngineError> {
    let destination = resolver.resolve(peer_addr.port());
    let destination_port = destination.map(|d| d.port).unwrap_or(0);

    let mut peek_buf = [0u8; 4096];
    let n = tokio::time::timeout(idle_read_deadline, stream.peek(&mut peek_buf))
        .await
        .map_err(|_| EngineError::Cancelled)?
        .map_err(EngineError::from_io)?;

    let plugin_name = registry.dispatch(&peek_buf[..n]).map(|p| p.name());

    match (plugin_name, run_mode, mode) {
        (Some("http"), RunMode::Record, ModeContext::Record { capture }) => {
            let dest = destination.ok_or(EngineError::MatchNotFound)?;
            let server = target::dial(&dest.to_dest_addr()).await.map_err(EngineError::from_io)?;
            http_engine.run_record(stream, server, destination_port, &capture, crate::tracker::now_ms).await
        }
        (Some("http"), RunMode::Test, ModeContext::Mock { store }) => {
            http_engine
                .run_mock(stream, destination_port, &store, || dial_destination(destination))
                .await
        }
        _ => {
            // Unclassified or non-HTTP traffic: relay transparently to
            // the original destination, same as an explicit bypass.
            let dest = destination.ok_or(EngineError::MatchNotFound)?;
            let mut server = target::dial(&dest.to_dest_addr()).await.map_err(EngineError::from_io)?;
            tokio::io::copy_bidirectional(&mut stream, &mut server).await.map(|_| ()).map_err(EngineError::from_io)
        }
    }
}

async fn dial_destination(destination: Option<DestinationInfo>) -> Option<TcpStream> {
    let dest = destination?;
    target::dial(&dest.to_dest_addr()).await.ok()
}
