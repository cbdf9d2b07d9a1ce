//! # btrelay
//!
//! Relays live system audio capture to paired Bluetooth audio sinks.
//!
//! **Purpose:** keep one relay session per connected sink (pulling
//! released capture buffers, shaping them against the system volume,
//! and forwarding them over the wireless transport) while reconciling
//! the session set against the transport's connected-device list,
//! coordinating with sleep/wake transitions, and persisting the
//! preferred sink.
//!
//! **Architecture:** independent event-driven tokio tasks (power
//! listener, device-set reconciler, one worker per session) over
//! injected collaborator traits for the transport driver, capture
//! source, system volume service, and power-state notifier.

pub mod address;
pub mod config;
pub mod daemon;
pub mod error;
pub mod prefs;
pub mod relay;
pub mod services;
pub mod volume;

pub use address::DeviceAddress;
pub use config::RelayConfig;
pub use daemon::{RelayDaemon, RelayDeps};
pub use error::{Error, Result};
