//! Capability interface to the mDNS resolver/responder.
//!
//! Every call registers interest and returns; replies arrive later on the
//! returned channels or futures. The engine is written against these traits
//! only, so any DNS-SD implementation (or a test double) can drive it.

pub mod mdns;
#[cfg(test)]
pub mod mock;

use std::time::Duration;
use anyhow::Result;
use futures::future::BoxFuture;
use shared::types::{Endpoint, ServiceIdentity};

/// Browse session notices
#[derive(Debug, Clone, PartialEq)]
pub enum BrowseNotice {
    Found(ServiceIdentity),
    Removed(ServiceIdentity),
}

/// Outcome of a successful address resolution
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub hostname: String,
    pub port: u16,
    /// Endpoints in the order the resolver produced them
    pub addresses: Vec<Endpoint>,
    /// Raw TXT bytes, when the resolver returned a record
    pub record: Option<Vec<u8>>,
}

/// Responder notices for one published service
#[derive(Debug, Clone, PartialEq)]
pub enum PublishNotice {
    /// The service is advertised on `port`
    Published { identity: ServiceIdentity, port: u16 },
    Failed(String),
    /// The responder's active TXT record changed from `old` to `new`
    RecordChanged { old: Vec<u8>, new: Vec<u8> },
    /// Withdrawal confirmed; nothing follows this notice
    Stopped,
}

/// Browsing side of the black-box service.
pub trait Resolver: Send + Sync + 'static {
    /// Start browsing `domain` (empty for the default) for `service_type`.
    fn search(&self, service_type: &str, domain: &str) -> Result<flume::Receiver<BrowseNotice>>;

    /// Resolve a found service. The future fails once `timeout` elapses.
    fn resolve(&self, identity: &ServiceIdentity, timeout: Duration) -> BoxFuture<'static, Result<Resolution>>;

    /// Receive the TXT bytes each time the service's record changes.
    fn monitor(&self, identity: &ServiceIdentity) -> Result<flume::Receiver<Vec<u8>>>;

    fn stop_monitoring(&self, identity: &ServiceIdentity);

    fn stop_search(&self, service_type: &str, domain: &str) -> Result<()>;
}

/// Advertising side of the black-box service.
pub trait Responder: Send + Sync + 'static {
    /// Advertise `identity`. With no `port` the responder accepts connections
    /// on an ephemeral port of its own and advertises that one.
    fn publish(
        &self,
        identity: &ServiceIdentity,
        port: Option<u16>,
        record: Vec<u8>,
    ) -> Result<flume::Receiver<PublishNotice>>;

    /// Replace the advertised TXT record.
    fn set_metadata_record(&self, identity: &ServiceIdentity, record: Vec<u8>) -> Result<()>;

    /// Request withdrawal; confirmation arrives as [`PublishNotice::Stopped`].
    fn stop_publishing(&self, identity: &ServiceIdentity) -> Result<()>;
}
