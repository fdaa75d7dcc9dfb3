//! pap-daemon - PAP control-plane daemon library
//!
//! Wires the [`pap_core`] modification core to the outside world: TOML
//! configuration, a SQLite-backed policy store, the Unix-socket PDP bus
//! endpoint and the lifecycle activator.
//!
//! # Modules
//!
//! - [`activator`]: ordered start/stop of all components
//! - [`bus`]: Unix-socket JSON-lines endpoint for the PDP topic
//! - [`config`]: daemon configuration
//! - [`store`]: durable policy store

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod activator;
pub mod bus;
pub mod config;
pub mod store;

pub use activator::PapActivator;
pub use bus::BusServer;
pub use config::PapConfig;
pub use store::SqlitePolicyStore;
