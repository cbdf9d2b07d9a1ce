//! Power-state notifier interface
//!
//! Delivers coarse sleep/wake transitions. Every notification must be
//! acknowledged back or the system stalls the transition.

use crate::error::Result;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Module id this daemon registers under with the power-state service
pub const POWER_MODULE_ID: u32 = 123;

/// Sibling modules this daemon declares as dependencies
pub const SIBLING_MODULES: &[PowerModuleId] = &[
    PowerModuleId::Bluetooth,
    PowerModuleId::Audio,
    PowerModuleId::Fs,
    PowerModuleId::Uart,
    PowerModuleId::Btm,
    PowerModuleId::Ns,
];

/// Well-known sibling module identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerModuleId {
    Bluetooth,
    Audio,
    Fs,
    Uart,
    Btm,
    Ns,
}

/// Coarse power-state notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    /// Fully awake
    Awake,
    /// About to wake (still counts as a sleep transition in progress)
    ReadyAwaken,
    /// About to sleep
    ReadySleep,
    /// About to sleep, critical path
    ReadySleepCritical,
    /// About to wake, critical path
    ReadyAwakenCritical,
}

impl PowerState {
    /// True for every "ready" variant, i.e. a transition during which
    /// no session may exist and no transport open may race.
    pub fn is_sleep_transition(&self) -> bool {
        !matches!(self, PowerState::Awake)
    }
}

/// Power-state notifier primitives
pub trait PowerService: Send {
    /// Register as a dependent module with a fixed set of siblings
    fn register_module(&mut self, module_id: u32, deps: &[PowerModuleId]) -> Result<()>;

    /// Subscribe to power-state notifications
    fn subscribe(&mut self) -> mpsc::UnboundedReceiver<PowerState>;

    /// Acknowledge a notification back to the service
    fn acknowledge(&mut self, state: PowerState) -> Result<()>;
}

/// Shared handle to the power-state service
pub type SharedPower = Arc<Mutex<Box<dyn PowerService>>>;

/// Wrap a power service in a shared handle
pub fn shared(service: impl PowerService + 'static) -> SharedPower {
    Arc::new(Mutex::new(Box::new(service)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_transition_classification() {
        assert!(!PowerState::Awake.is_sleep_transition());
        assert!(PowerState::ReadySleep.is_sleep_transition());
        assert!(PowerState::ReadySleepCritical.is_sleep_transition());
        assert!(PowerState::ReadyAwaken.is_sleep_transition());
        assert!(PowerState::ReadyAwakenCritical.is_sleep_transition());
    }
}
