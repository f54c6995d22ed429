//! State module for tracking crawl progress
//!
//! # Components
//!
//! - `CrawlPhase`: the orchestrator's per-iteration state machine
//! - `CredentialState`: per-credential budget and reset window
//! - `QuotaHint`: in-band quota figures reported by the API

mod crawl_phase;
mod credential_state;

// Re-export main types
pub use crawl_phase::CrawlPhase;
pub use credential_state::{CredentialState, QuotaHint};
