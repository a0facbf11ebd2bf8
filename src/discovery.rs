//! Zero-configuration discovery collaborator interface.
//!
//! Discovery (DNS-SD/Bonjour style) is consumed as an abstract interface:
//! the client resolves a (host, port) pair for [`crate::SERVICE_TYPE`], the
//! server advertises its own port under it. No resolver engine ships in
//! this crate — attach an implementation to enable discovery; leaving it
//! off makes the client dial its configured host/port directly and the
//! server skip advertisement.

use async_trait::async_trait;

use crate::error::Os2lError;

/// Resolves or advertises a (host, port) pair on the local network.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Resolve the address of a service advertised under `service_type`.
    async fn resolve(&self, service_type: &str) -> Result<(String, u16), Os2lError>;

    /// Advertise `service_type` on `port`; the returned handle withdraws it.
    async fn advertise(
        &self,
        service_type: &str,
        port: u16,
    ) -> Result<Box<dyn Advertisement>, Os2lError>;
}

/// A live service advertisement.
#[async_trait]
pub trait Advertisement: Send {
    /// Withdraw this advertisement from the network.
    async fn withdraw(&mut self);
}
