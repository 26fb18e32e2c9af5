use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, trace};

use crate::net::{Inbound, INBOUND_QUEUE_LEN};
use crate::sim::Simulation;
use crate::sync::SyncService;

/// Owns the simulation and is the only place it is mutated.
pub struct AuthoritativeLoop {
    sim: Simulation,
    sync: SyncService,
    inbound: mpsc::Receiver<Inbound>,
    save_interval_ticks: u64,
}

impl AuthoritativeLoop {
    pub fn new(
        sim: Simulation,
        sync: SyncService,
        inbound: mpsc::Receiver<Inbound>,
        save_interval_ticks: u64,
    ) -> Self {
        Self {
            sim,
            sync,
            inbound,
            save_interval_ticks: save_interval_ticks.max(1),
        }
    }

    /// One tick: queued requests, structural pass, status pushes, and a save
    /// when the interval comes round.
    pub fn step(&mut self) {
        // At most one queue's worth, so busy readers cannot stall the tick.
        let mut handled = 0usize;
        while handled < INBOUND_QUEUE_LEN {
            let Ok(event) = self.inbound.try_recv() else {
                break;
            };
            self.dispatch(event);
            handled += 1;
        }
        self.sim.tick();
        self.sync.flush_status(&mut self.sim);
        if handled > 0 {
            trace!(tick = self.sim.current_tick(), handled, "tick processed requests");
        }
        if self.sim.current_tick() % self.save_interval_ticks == 0 {
            self.save();
        }
    }

    fn dispatch(&mut self, event: Inbound) {
        match event {
            Inbound::Opened { session, outbound } => self.sync.open_session(session, outbound),
            Inbound::Message { session, message } => {
                self.sync.handle(&mut self.sim, session, message);
                // Replies to a request carry status produced by that request.
                self.sync.flush_status(&mut self.sim);
            }
            Inbound::Closed { session } => self.sync.close_session(session),
        }
    }

    fn save(&mut self) {
        if let Err(err) = self.sim.save() {
            error!(error = %err, "failed to save world");
        }
    }

    pub async fn run(mut self, tick: Duration, mut shutdown: oneshot::Receiver<()>) -> Simulation {
        let mut interval = time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(tick_ms = tick.as_millis() as u64, "authoritative loop started");
        loop {
            tokio::select! {
                _ = interval.tick() => self.step(),
                _ = &mut shutdown => break,
            }
        }
        self.save();
        info!(tick = self.sim.current_tick(), "authoritative loop stopped");
        self.sim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portal_network_core::{BlockPos, CoordinatorConfig};
    use portal_wire::{DeviceMessage, ServerMessage};
    use std::fs;
    use uuid::Uuid;

    #[test_timeout::timeout]
    fn step_dispatches_queued_requests_and_saves_on_interval() {
        let dir = std::env::temp_dir().join(format!("portal-runtime-{}", Uuid::new_v4()));
        let mut sim = Simulation::empty(&dir, CoordinatorConfig::default());
        sim.seed_demo().expect("seed");
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_LEN);
        let mut tick_loop = AuthoritativeLoop::new(sim, SyncService::new(4), inbound_rx, 2);

        let session = Uuid::new_v4();
        let (outbound_tx, mut outbound_rx) = mpsc::channel(8);
        inbound_tx
            .try_send(Inbound::Opened {
                session,
                outbound: outbound_tx,
            })
            .expect("queue open");
        inbound_tx
            .try_send(Inbound::Message {
                session,
                message: DeviceMessage::EndpointListRequest {
                    device_pos: BlockPos::new(10, 64, 12),
                },
            })
            .expect("queue list");

        tick_loop.step();
        assert!(matches!(
            outbound_rx.try_recv(),
            Ok(ServerMessage::EndpointListResponse { .. })
        ));
        assert!(!dir.join(crate::sim::WORLD_STATE_FILE_NAME).exists());

        tick_loop.step();
        assert!(dir.join(crate::sim::WORLD_STATE_FILE_NAME).exists());

        inbound_tx
            .try_send(Inbound::Closed { session })
            .expect("queue close");
        tick_loop.step();
        assert_eq!(tick_loop.sync.session_count(), 0);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test_timeout::timeout]
    fn full_inbound_queue_pushes_back_until_step_drains_it() {
        let dir = std::env::temp_dir().join(format!("portal-runtime-{}", Uuid::new_v4()));
        let mut sim = Simulation::empty(&dir, CoordinatorConfig::default());
        sim.seed_demo().expect("seed");
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_LEN);
        let mut tick_loop = AuthoritativeLoop::new(sim, SyncService::new(4), inbound_rx, 1000);

        let session = Uuid::new_v4();
        let (outbound_tx, mut outbound_rx) = mpsc::channel(INBOUND_QUEUE_LEN * 4);
        inbound_tx
            .try_send(Inbound::Opened {
                session,
                outbound: outbound_tx,
            })
            .expect("queue open");
        let list = || Inbound::Message {
            session,
            message: DeviceMessage::EndpointListRequest {
                device_pos: BlockPos::new(10, 64, 12),
            },
        };
        for _ in 1..INBOUND_QUEUE_LEN {
            inbound_tx.try_send(list()).expect("room in queue");
        }
        assert!(matches!(
            inbound_tx.try_send(list()),
            Err(mpsc::error::TrySendError::Full(_))
        ));

        tick_loop.step();
        inbound_tx.try_send(list()).expect("room after drain");

        let mut replies = 0;
        while let Ok(message) = outbound_rx.try_recv() {
            if matches!(message, ServerMessage::EndpointListResponse { .. }) {
                replies += 1;
            }
        }
        assert_eq!(replies, INBOUND_QUEUE_LEN - 1);

        let _ = fs::remove_dir_all(&dir);
    }
}
