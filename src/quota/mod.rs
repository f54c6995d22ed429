//! Quota module: credential selection and spend tracking
//!
//! The remote API meters calls per credential. The tracker hands out the
//! credential with the most budget left and reconciles its estimate with the
//! figures the API reports in-band.

mod credential;
mod tracker;

pub use credential::Credential;
pub use tracker::QuotaTracker;
