//! Reachability probing
//!
//! A [`Prober`] answers one question per device per cycle: did the
//! address respond. Implementations must be safe to call concurrently for
//! many addresses at once.

mod ping;

pub use ping::{PingConfig, PingProber};

use async_trait::async_trait;

use crate::error::ProbeError;
use crate::models::Liveness;

/// Trait for reachability probe implementations
#[async_trait]
pub trait Prober: Send + Sync {
    /// Probe one address
    ///
    /// An unreachable host is `Ok(Liveness::Down)`. `Err` is reserved for
    /// failures of the probing mechanism itself.
    async fn probe(&self, address: &str) -> Result<Liveness, ProbeError>;
}
