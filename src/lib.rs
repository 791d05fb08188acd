//! # aquanet - reliable control plane for ESP-NOW style aquarium networks
//!
//! A hub coordinates a fleet of single-purpose aquarium nodes (lights, CO2
//! valves, heaters, feeders, dosers, filters, water sensors, repeaters) over a
//! lossy, connectionless 250-byte-frame radio link.
//!
//! ## Features
//!
//! - **Wire protocol**: fixed little-endian frames with an 8 byte header and typed bodies
//! - **Reliable messaging**: retry with exponential backoff, a cooperative retry queue,
//!   per-sender duplicate suppression and fragmented commands up to 512 bytes
//! - **Pairing**: node-side announce/ack/heartbeat state machine with local fail-safe
//! - **Fleet registry**: aquariums, devices, provisioning, schedules and persistence
//! - **Safety monitor**: heartbeat timeouts, water-parameter alerts, emergency shutdown
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use aquanet::config::Config;
//! use aquanet::hub::bootstrap;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let hub = bootstrap::build_hub(&config, None)?;
//!     let (_stop, shutdown) = tokio::sync::watch::channel(false);
//!     hub.run(shutdown).await
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`protocol`] - frame layout, addresses and message bodies
//! - [`transport`] - reliable messaging over a [`transport::link::LinkDriver`]
//! - [`peers`] - hub-side liveness registry
//! - [`node`] - pairing state machine and node runtime
//! - [`fleet`] - aquariums, devices, safety monitor
//! - [`schedule`] - timed device commands
//! - [`hub`] - network and watchdog loops
//! - [`config`] - TOML configuration
//!
//! ```text
//! radio driver ──► RX queue ──► Transport ──► FleetManager ──► Notifier
//!                                   ▲              │
//!                                   └── commands ◄─┘ (schedules, safety, operator)
//! ```

pub mod config;
pub mod errors;
pub mod fleet;
pub mod hub;
pub mod logutil;
pub mod metrics;
pub mod node;
pub mod peers;
pub mod persist;
pub mod protocol;
pub mod schedule;
pub mod transport;
pub mod validation;
