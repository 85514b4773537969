use std::fmt;
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use crate::protocol::DEFAULT_DOMAIN;
use crate::txt::MetadataRecord;

/// The (name, type, domain) triple naming one advertised service instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceIdentity {
    /// Instance name, e.g. "mDisco"
    pub name: String,

    /// Protocol and transport with trailing dot, e.g. "_http._tcp."
    pub service_type: String,

    /// Domain with trailing dot, e.g. "local.". Empty means the default domain.
    pub domain: String,
}

impl ServiceIdentity {
    pub fn new(
        name: impl Into<String>,
        service_type: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            service_type: service_type.into(),
            domain: domain.into(),
        }
    }

    /// Domain with the empty string mapped to "local."
    pub fn effective_domain(&self) -> &str {
        effective_domain(&self.domain)
    }

    /// Service type joined with its domain, e.g. "_http._tcp.local."
    pub fn type_domain(&self) -> String {
        type_domain(&self.service_type, &self.domain)
    }

    /// Full DNS-SD instance name, e.g. "mDisco._http._tcp.local."
    pub fn fullname(&self) -> String {
        format!("{}.{}", self.name, self.type_domain())
    }

    /// Inverse of [`ServiceIdentity::fullname`] for a known type/domain.
    /// Returns `None` when `fullname` is not an instance of `type_domain`.
    pub fn from_fullname(fullname: &str, service_type: &str, domain: &str) -> Option<Self> {
        let suffix = format!(".{}", type_domain(service_type, domain));
        let name = fullname.strip_suffix(suffix.as_str())?;
        if name.is_empty() {
            return None;
        }
        Some(Self::new(name, service_type, effective_domain(domain)))
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.name)
    }
}

pub fn effective_domain(domain: &str) -> &str {
    if domain.is_empty() {
        DEFAULT_DOMAIN
    } else {
        domain
    }
}

pub fn type_domain(service_type: &str, domain: &str) -> String {
    let service_type = if service_type.ends_with('.') {
        service_type.to_string()
    } else {
        format!("{}.", service_type)
    };
    format!("{}{}", service_type, effective_domain(domain))
}

/// One resolved socket endpoint, tagged by address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endpoint {
    V4(SocketAddrV4),
    V6(SocketAddrV6),
    /// A family the engine does not interpret (raw `sa_family` value)
    Other { family: u16 },
}

impl Endpoint {
    pub fn as_ipv4(&self) -> Option<SocketAddrV4> {
        match self {
            Endpoint::V4(addr) => Some(*addr),
            _ => None,
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Endpoint::V4(v4),
            SocketAddr::V6(v6) => Endpoint::V6(v6),
        }
    }
}

/// First IPv4 endpoint in list order, if any.
pub fn first_ipv4(endpoints: &[Endpoint]) -> Option<SocketAddrV4> {
    endpoints.iter().find_map(Endpoint::as_ipv4)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionState {
    Unresolved,
    Resolving,
    Resolved,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublicationState {
    Unpublished,
    Publishing,
    Published,
    Failed,
    Stopped,
}

/// A service found by a browse session.
/// Owned by the discoverer; everything outside it sees clones.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredService {
    pub identity: ServiceIdentity,

    pub state: ResolutionState,

    /// Resolved endpoints in the order the resolver reported them
    pub addresses: Vec<Endpoint>,

    pub hostname: Option<String>,

    pub port: Option<u16>,

    /// Last decoded TXT record, empty until one is seen
    #[serde(serialize_with = "serialize_record")]
    pub metadata: MetadataRecord,

    /// When the browse session first reported the service
    pub found_at: DateTime<Utc>,
}

impl DiscoveredService {
    pub fn new(identity: ServiceIdentity) -> Self {
        Self {
            identity,
            state: ResolutionState::Unresolved,
            addresses: Vec::new(),
            hostname: None,
            port: None,
            metadata: MetadataRecord::default(),
            found_at: Utc::now(),
        }
    }

    pub fn ipv4(&self) -> Option<SocketAddrV4> {
        first_ipv4(&self.addresses)
    }
}

/// The single service advertised by a publisher.
#[derive(Debug, Clone, Serialize)]
pub struct PublishedService {
    pub identity: ServiceIdentity,

    /// Port asked for; `None` means the responder listens on an ephemeral port
    pub requested_port: Option<u16>,

    /// Port actually advertised once published
    pub port: Option<u16>,

    #[serde(serialize_with = "serialize_record")]
    pub metadata: MetadataRecord,

    pub state: PublicationState,
}

impl PublishedService {
    pub fn new(identity: ServiceIdentity, requested_port: Option<u16>, metadata: MetadataRecord) -> Self {
        Self {
            identity,
            requested_port,
            port: None,
            metadata,
            state: PublicationState::Unpublished,
        }
    }
}

fn serialize_record<S: serde::Serializer>(record: &MetadataRecord, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_map(record.to_lossy_map())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_fullname_uses_default_domain() {
        let id = ServiceIdentity::new("mDisco", "_http._tcp.", "");
        assert_eq!(id.fullname(), "mDisco._http._tcp.local.");
        assert_eq!(id.type_domain(), "_http._tcp.local.");
    }

    #[test]
    fn test_from_fullname() {
        let id = ServiceIdentity::from_fullname("printer 2._ipp._tcp.local.", "_ipp._tcp.", "").unwrap();
        assert_eq!(id.name, "printer 2");
        assert_eq!(id.domain, "local.");
        assert!(ServiceIdentity::from_fullname("x._ssh._tcp.local.", "_ipp._tcp.", "").is_none());
    }

    #[test]
    fn test_first_ipv4_in_list_order() {
        let endpoints = vec![
            Endpoint::V6(SocketAddrV6::new(Ipv6Addr::LOCALHOST, 80, 0, 0)),
            Endpoint::Other { family: 18 },
            Endpoint::V4(SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 10), 80)),
            Endpoint::V4(SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 11), 80)),
        ];
        assert_eq!(
            first_ipv4(&endpoints),
            Some(SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 10), 80))
        );
        assert_eq!(first_ipv4(&endpoints[..2]), None);
    }
}
