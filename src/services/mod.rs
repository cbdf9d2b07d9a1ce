//! External collaborator interfaces
//!
//! The relay core talks to four external services: the wireless
//! transport driver, the system audio capture source, the system
//! volume/mute service, and the power-state notifier. Each is modeled
//! as an injected trait object so the daemon can run against real
//! platform shims or the in-process simulated backend.

pub mod capture;
pub mod power;
pub mod sim;
pub mod sysaudio;
pub mod transport;
