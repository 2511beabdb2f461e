//! Understudy: primary/standby failover for a fleet of chat-bot processes.
//!
//! A primary bot serves users; standbys launched from it watch the primary
//! and can be promoted by an operator when it fails. Processes coordinate
//! only through JSON documents in a shared state directory.

pub mod bot;
pub mod channel;
pub mod config;
pub mod credential;
pub mod error;
pub mod fleet;
pub mod health;
pub mod identity;
pub mod monitor;
pub mod process;
pub mod promotion;
pub mod state;
pub mod supervisor;
pub mod telemetry;
pub mod texts;

pub use error::FleetError;
