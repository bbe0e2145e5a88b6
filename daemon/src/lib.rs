//! CapGuard daemon: samples resource use of processes named by rules and
//! terminates them once they stay over their limits.

pub mod aggregator;
pub mod collector;
pub mod config;
pub mod control;
pub mod detector;
pub mod error;
pub mod executor;
pub mod monitor;
pub mod notifier;
pub mod protocol;
pub mod service;
pub mod socket;

pub use error::{Error, Result};
