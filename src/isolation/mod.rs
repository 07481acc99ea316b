//! Isolation-provider boundary
//!
//! The concrete isolation technology lives behind [`IsolationProvider`]:
//! the service only requires that creating a sandbox yields a duplex
//! message channel, and that tearing the channel down destroys the
//! sandbox. Providers own every detail of how the sandbox is built.

use async_trait::async_trait;

use crate::endowments::Endowments;
use crate::errors::Result;
use crate::transport::SandboxChannel;

pub mod inprocess;

pub use inprocess::InProcessProvider;

/// Everything a provider needs to create one sandbox
pub struct UnitSpec {
    /// Caller-supplied unit id, unique among live units
    pub unit_id: String,
    /// Granted capability table, already bridge-wrapped
    pub endowments: Endowments,
}

/// Creates sandboxes and hands back their message channels
#[async_trait]
pub trait IsolationProvider: Send + Sync + 'static {
    /// Create a sandbox for `spec` and return its duplex channel
    ///
    /// Fails with `ChannelSetup` when the sandbox cannot be created or
    /// does not become reachable. The sandbox must tie its own teardown
    /// to the channel: when the host closes its outbound half the sandbox
    /// is expected to shut down and drop its side, which the host then
    /// observes as channel closure.
    async fn create(&self, spec: UnitSpec) -> Result<SandboxChannel>;
}
