use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex, PoisonError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use shared::txt::MetadataRecord;
use shared::types::ServiceIdentity;

/// Lifecycle events of a browse session, in delivery order.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    SearchStarted {
        service_type: String,
        domain: String,
    },
    SearchFailed {
        reason: String,
    },
    ServiceFound(ServiceIdentity),
    ServiceResolved {
        identity: ServiceIdentity,
        hostname: String,
        port: u16,
        /// First IPv4 endpoint reported; `None` when only other families came back
        ipv4: Option<SocketAddrV4>,
    },
    MetadataUpdated {
        identity: ServiceIdentity,
        record: MetadataRecord,
    },
    ResolveFailed {
        identity: ServiceIdentity,
        reason: String,
    },
    ServiceLost(ServiceIdentity),
    SearchStopped,
}

impl fmt::Display for DiscoveryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryEvent::SearchStarted { service_type, domain } => {
                write!(f, "Searching for \"{}\" in domain \"{}\"", service_type, domain)
            }
            DiscoveryEvent::SearchFailed { reason } => write!(f, "search failed: {}", reason),
            DiscoveryEvent::ServiceFound(id) => {
                write!(f, "{} found at \"{}{}\"", id, id.service_type, id.domain)
            }
            DiscoveryEvent::ServiceResolved { identity, hostname, port, ipv4 } => {
                write!(f, "{} resolved at \"{}\" on port {}", identity, hostname, port)?;
                match ipv4 {
                    Some(addr) => write!(f, ", IP: {}", addr),
                    None => write!(f, ", no IPv4 address"),
                }
            }
            DiscoveryEvent::MetadataUpdated { identity, record } => {
                write!(f, "{} TXT: {}", identity, record)
            }
            DiscoveryEvent::ResolveFailed { identity, reason } => {
                write!(f, "{} resolve failed: {}", identity, reason)
            }
            DiscoveryEvent::ServiceLost(id) => write!(f, "{} removed", id),
            DiscoveryEvent::SearchStopped => f.write_str("search stop"),
        }
    }
}

/// Lifecycle events of a published service, in delivery order.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishEvent {
    WillPublish(ServiceIdentity),
    Published {
        identity: ServiceIdentity,
        port: u16,
    },
    PublishFailed {
        reason: String,
    },
    WillUpdateMetadata,
    MetadataUpdateSent(MetadataRecord),
    MetadataUpdateFailed {
        reason: String,
    },
    MetadataChanged {
        old: MetadataRecord,
        new: MetadataRecord,
    },
    StopFailed {
        reason: String,
    },
    Stopped,
}

impl fmt::Display for PublishEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishEvent::WillPublish(_) => f.write_str("Gonna publish.."),
            PublishEvent::Published { identity, port } => write!(
                f,
                "Service published: {} at {}{} on port {}",
                identity.name, identity.service_type, identity.domain, port
            ),
            PublishEvent::PublishFailed { reason } => write!(f, "Publish failed: {}", reason),
            PublishEvent::WillUpdateMetadata => f.write_str("Gonna update TXT"),
            PublishEvent::MetadataUpdateSent(_) => f.write_str("TXT update sent"),
            PublishEvent::MetadataUpdateFailed { reason } => write!(f, "TXT update failed: {}", reason),
            PublishEvent::MetadataChanged { old, new } => write!(f, "old TXT: {}, new TXT: {}", old, new),
            PublishEvent::StopFailed { reason } => write!(f, "stop failed: {}", reason),
            PublishEvent::Stopped => f.write_str("stop"),
        }
    }
}

/// Receives a component's events in the order they happen.
pub trait EventSink<E>: Send + Sync + 'static {
    fn emit(&self, event: E);
}

impl<E: Send + 'static> EventSink<E> for mpsc::UnboundedSender<E> {
    fn emit(&self, event: E) {
        // A dropped receiver means nobody is listening any more
        let _ = self.send(event);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub at: DateTime<Utc>,
    pub source: &'static str,
    pub text: String,
}

/// Bounded, append-only event log shared by the sinks and the API.
#[derive(Clone)]
pub struct EventLog {
    lines: Arc<Mutex<VecDeque<LogLine>>>,
    capacity: usize,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity: capacity.max(1),
        }
    }

    pub fn append(&self, source: &'static str, text: impl Into<String>) {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(LogLine {
            at: Utc::now(),
            source,
            text: text.into(),
        });
    }

    pub fn lines(&self) -> Vec<LogLine> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

/// Writes every event to tracing and to the shared event log.
#[derive(Clone)]
pub struct LogSink {
    source: &'static str,
    log: EventLog,
}

impl LogSink {
    pub fn discovery(log: EventLog) -> Self {
        Self { source: "discovery", log }
    }

    pub fn service(log: EventLog) -> Self {
        Self { source: "service", log }
    }
}

impl EventSink<DiscoveryEvent> for LogSink {
    fn emit(&self, event: DiscoveryEvent) {
        match &event {
            DiscoveryEvent::SearchFailed { .. } | DiscoveryEvent::ResolveFailed { .. } => {
                tracing::warn!("[{}] {}", self.source, event)
            }
            _ => tracing::info!("[{}] {}", self.source, event),
        }
        self.log.append(self.source, event.to_string());
    }
}

impl EventSink<PublishEvent> for LogSink {
    fn emit(&self, event: PublishEvent) {
        match &event {
            PublishEvent::PublishFailed { .. }
            | PublishEvent::MetadataUpdateFailed { .. }
            | PublishEvent::StopFailed { .. } => tracing::warn!("[{}] {}", self.source, event),
            _ => tracing::info!("[{}] {}", self.source, event),
        }
        self.log.append(self.source, event.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_log_is_bounded() {
        let log = EventLog::new(2);
        log.append("discovery", "one");
        log.append("discovery", "two");
        log.append("service", "three");

        let lines = log.lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].text, "two");
        assert_eq!(lines[1].source, "service");
    }

    #[test]
    fn test_sink_writes_rendered_event() {
        let log = EventLog::new(10);
        let sink = LogSink::discovery(log.clone());
        sink.emit(DiscoveryEvent::ServiceResolved {
            identity: ServiceIdentity::new("nas", "_http._tcp.", "local."),
            hostname: "nas.local.".to_string(),
            port: 80,
            ipv4: Some(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 80)),
        });

        let lines = log.lines();
        assert_eq!(lines[0].source, "discovery");
        assert_eq!(lines[0].text, "{nas} resolved at \"nas.local.\" on port 80, IP: 10.0.0.2:80");
    }

    #[test]
    fn test_metadata_changed_rendering() {
        let old: MetadataRecord = [("hello", "")].into_iter().collect();
        let new: MetadataRecord = [("hello", "world")].into_iter().collect();
        let event = PublishEvent::MetadataChanged { old, new };
        assert_eq!(event.to_string(), "old TXT: {hello = }, new TXT: {hello = world}");
    }
}
