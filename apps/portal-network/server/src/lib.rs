//! Authoritative portal network server.
//!
//! Devices connect over TCP; their requests are queued onto a single tick
//! loop that owns the [`sim::Simulation`].

pub mod config;
pub mod devices;
pub mod net;
pub mod runtime;
pub mod sim;
pub mod sync;
pub mod telemetry;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::ServerConfig;
use crate::runtime::AuthoritativeLoop;
use crate::sim::Simulation;
use crate::sync::SyncService;

pub struct RunningServer {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    accept: JoinHandle<()>,
    simulation: JoinHandle<Simulation>,
}

impl RunningServer {
    /// Binds the listener and starts the accept and tick tasks.
    pub async fn spawn(config: &ServerConfig, sim: Simulation) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.listen_addr))?;
        let local_addr = listener.local_addr().context("listener has no local address")?;
        info!(%local_addr, "listening for devices");

        let (inbound_tx, inbound_rx) = mpsc::channel(net::INBOUND_QUEUE_LEN);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let tick_loop = AuthoritativeLoop::new(
            sim,
            SyncService::new(config.legacy_scan_radius),
            inbound_rx,
            config.save_interval_ticks,
        );
        let simulation = tokio::spawn(tick_loop.run(config.tick, shutdown_rx));
        let accept = tokio::spawn(net::accept_loop(listener, inbound_tx));

        Ok(Self {
            local_addr,
            shutdown: shutdown_tx,
            accept,
            simulation,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting devices, runs the final save and hands back the
    /// simulation.
    pub async fn shutdown(self) -> Result<Simulation> {
        self.accept.abort();
        let _ = self.shutdown.send(());
        self.simulation.await.context("authoritative loop panicked")
    }
}
