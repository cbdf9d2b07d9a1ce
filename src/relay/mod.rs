//! Relay core
//!
//! Per-sink relay sessions, the device-set reconciler that creates and
//! destroys them, and the power-state listener that suspends the whole
//! relay across sleep transitions.

pub mod buffer_pool;
pub mod power_listener;
pub mod reconciler;
pub mod session;

pub use buffer_pool::BufferPool;
pub use power_listener::PowerListener;
pub use reconciler::{Reconciler, SuspendGuard, SuspendHandle};
pub use session::RelaySession;
