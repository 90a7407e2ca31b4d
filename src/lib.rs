#![forbid(unsafe_code)]

//! Supervise fleets of worker processes, locally or on other hosts over
//! SSH, through a line-oriented stdout protocol.

pub mod config;
pub mod errors;
pub mod launcher;
pub mod logging;
pub mod observer;
pub mod process;
pub mod protocol;
pub mod registry;
pub mod signals;
pub mod worker;

pub use config::FleetConfig;
pub use errors::{AppError, Result};
