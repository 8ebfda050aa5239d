//! otb-device
//!
//! The production device behind the control surface: authenticates start
//! requests, admits one job at a time, and produces units on a fixed tick.
//!
//! - [`AuthGuard`]: key check and nonce replay window.
//! - [`JobSlot`] / [`JobGuard`]: the single admission slot and its RAII
//!   release.
//! - [`ProductionExecutor`]: `Idle → Running → Done` for one job.
//! - [`DeviceController`]: consumes surface events and wires the above.
//!
//! Rejections are device-local. The bridge never hears about them; it sees
//! a job that does not progress and times it out.

mod auth;
mod controller;
mod executor;
mod slot;

pub use auth::AuthGuard;
pub use controller::{DeviceController, DeviceSettings, EventOutcome};
pub use executor::{ExecutorState, Job, ProductionExecutor};
pub use slot::{JobGuard, JobSlot};

/// Why a start request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Another job holds the slot. Nothing on the surface is touched.
    Busy,
    WrongKey,
    /// The nonce is in the recent-accept history.
    ReplayedNonce(i16),
    /// Explicit addressing and the presence mask lacks this parameter.
    MissingParameter(&'static str),
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::Busy => write!(f, "device busy"),
            Rejection::WrongKey => write!(f, "authentication key mismatch"),
            Rejection::ReplayedNonce(n) => write!(f, "nonce {n} already used"),
            Rejection::MissingParameter(p) => write!(f, "start parameter not written: {p}"),
        }
    }
}

impl std::error::Error for Rejection {}
