//! Power-state listener
//!
//! Dedicated loop that receives sleep/wake notifications and drives the
//! reconciler's suspend/resume transitions through its narrow
//! [`SuspendHandle`] interface. Every notification is acknowledged back
//! to the power-state service regardless of effect; the system stalls
//! the transition otherwise.

use crate::error::Result;
use crate::relay::reconciler::{SuspendGuard, SuspendHandle};
use crate::services::power::{PowerState, SharedPower};
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

/// Sleep/wake coordinator
pub struct PowerListener {
    power: SharedPower,
    suspend: SuspendHandle,
}

impl PowerListener {
    pub fn new(power: SharedPower, suspend: SuspendHandle) -> Self {
        PowerListener { power, suspend }
    }

    /// Waiting loop; runs until the stop signal fires.
    ///
    /// A failed acknowledge is fatal: the loop exits with the error so
    /// the daemon can surface it instead of silently stalling system
    /// sleep.
    pub async fn run(
        self,
        mut notifications: mpsc::UnboundedReceiver<PowerState>,
        mut stop_rx: watch::Receiver<bool>,
    ) -> Result<()> {
        // The bluetooth link enters a bad state if sessions survive into
        // a sleep transition, so suspension must finish before the
        // notification is acknowledged.
        let mut held: Option<SuspendGuard> = None;

        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                notification = notifications.recv() => match notification {
                    Some(state) => self.handle_notification(state, &mut held).await?,
                    None => {
                        error!("power notifications ended unexpectedly");
                        break;
                    }
                },
            }
        }

        // Resume on the way out so a stopped listener never leaves the
        // reconciler blocked.
        if let Some(guard) = held.take() {
            self.suspend.resume(guard);
        }

        Ok(())
    }

    async fn handle_notification(
        &self,
        state: PowerState,
        held: &mut Option<SuspendGuard>,
    ) -> Result<()> {
        if state.is_sleep_transition() {
            if held.is_none() {
                info!("sleep transition ({state:?}); suspending relay");
                *held = Some(self.suspend.suspend().await);
            }
        } else if let Some(guard) = held.take() {
            info!("system awake; resuming relay");
            self.suspend.resume(guard);
        }

        let mut power = self.power.lock().await;
        power.acknowledge(state)
    }
}
