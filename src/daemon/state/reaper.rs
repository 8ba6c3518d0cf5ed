//! Periodic housekeeping on a single looper thread.
//!
//! Each pass reaps lapsed leases, advances the grace period and sweeps the
//! DRCs (aged datagram entries and parked TCP tables).

use std::sync::Arc;
use std::time::Duration;

use super::{ClientTable, GraceManager};
use crate::daemon::drc::DrcRegistry;
use crate::daemon::fridge::{Deferment, Fridge, FridgeCommand, FridgeError, FridgeParams};

pub struct Reaper {
    fridge: Fridge,
}

impl Reaper {
    pub fn start(
        clients: Arc<ClientTable>,
        grace: Arc<GraceManager>,
        drc: Arc<DrcRegistry>,
        interval: Duration,
    ) -> Result<Self, FridgeError> {
        let fridge = Fridge::new("reaper", FridgeParams::new(1, Deferment::Fail).with_min(1))?;
        fridge.populate(move |ctx| {
            loop {
                pass(&clients, &grace, &drc);
                if ctx.sleep(interval) {
                    return;
                }
            }
        })?;
        tracing::info!(interval_ms = interval.as_millis() as u64, "reaper started");
        Ok(Self { fridge })
    }

    /// Run a pass now instead of waiting out the interval.
    pub fn kick(&self) {
        self.fridge.wake();
    }

    pub fn stop(&self, timeout: Duration) -> Result<(), FridgeError> {
        self.fridge.sync_command(FridgeCommand::Stop, timeout)
    }
}

pub fn pass(clients: &ClientTable, grace: &GraceManager, drc: &DrcRegistry) {
    clients.reap();
    if let Err(err) = grace.tick() {
        tracing::warn!(error = %err, "grace tick failed");
    }
    let (aged, recycled) = drc.sweep();
    if aged > 0 || recycled > 0 {
        tracing::debug!(aged, recycled, "drc sweep");
    }
}
