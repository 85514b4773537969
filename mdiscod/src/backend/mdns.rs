use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use anyhow::{bail, Context, Result};
use futures::future::BoxFuture;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo, TxtProperties, TxtProperty};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use shared::protocol::TXT_ENTRY_MAX_LEN;
use shared::types::{type_domain, Endpoint, ServiceIdentity};
use super::{BrowseNotice, PublishNotice, Resolution, Resolver, Responder};

/// Resolver and responder backed by an `mdns-sd` daemon.
///
/// mdns-sd resolves every service it finds on its own, so resolution here
/// means waiting for the daemon's answer to show up in the resolved cache.
pub struct MdnsBackend {
    daemon: ServiceDaemon,
    hostname: String,
    shared: Arc<Shared>,
}

struct Shared {
    /// Latest resolved info per full instance name
    resolved: watch::Sender<HashMap<String, ServiceInfo>>,
    monitors: Mutex<HashMap<String, flume::Sender<Vec<u8>>>>,
    registrations: Mutex<HashMap<String, Registration>>,
}

struct Registration {
    port: u16,
    record: Vec<u8>,
    notices: flume::Sender<PublishNotice>,
    /// Accept loop of listen-for-connections mode
    listener: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MdnsBackend {
    pub fn new(daemon: ServiceDaemon) -> Result<Self> {
        let host = hostname::get()
            .context("Failed to get system hostname")?
            .to_string_lossy()
            .to_string();

        let (resolved, _) = watch::channel(HashMap::new());
        Ok(Self {
            daemon,
            hostname: mdns_hostname(&host),
            shared: Arc::new(Shared {
                resolved,
                monitors: Mutex::new(HashMap::new()),
                registrations: Mutex::new(HashMap::new()),
            }),
        })
    }

    fn service_info(&self, identity: &ServiceIdentity, port: u16, record: &[u8]) -> Result<ServiceInfo> {
        let properties = txt_properties(record);

        let info = ServiceInfo::new(
            &identity.type_domain(),
            &identity.name,
            &self.hostname,
            "",
            port,
            properties,
        )
        .context("Failed to create ServiceInfo")?
        .enable_addr_auto();

        Ok(info)
    }

    /// Bind an ephemeral port and accept connections on it until cancelled.
    fn listen(&self, identity: &ServiceIdentity, cancel: CancellationToken) -> Result<u16> {
        let socket = std::net::TcpListener::bind(("0.0.0.0", 0)).context("Failed to bind listener")?;
        socket.set_nonblocking(true).context("Failed to make listener non-blocking")?;
        let port = socket.local_addr().context("Failed to read listener address")?.port();
        let listener = tokio::net::TcpListener::from_std(socket).context("Failed to register listener")?;

        let name = identity.fullname();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((_stream, peer)) => tracing::info!("{} accepted connection from {}", name, peer),
                        Err(e) => tracing::warn!("{} failed to accept: {}", name, e),
                    },
                    _ = cancel.cancelled() => break,
                }
            }
            tracing::debug!("{} stopped listening", name);
        });

        Ok(port)
    }

    fn register(
        &self,
        identity: &ServiceIdentity,
        port: Option<u16>,
        record: &[u8],
        listener: &CancellationToken,
    ) -> Result<u16> {
        let port = match port {
            Some(port) => port,
            None => self.listen(identity, listener.clone())?,
        };

        let info = self.service_info(identity, port, record)?;
        self.daemon
            .register(info)
            .context("Failed to register mDNS service")?;

        tracing::info!("Registered {} on port {}", identity.fullname(), port);
        Ok(port)
    }
}

impl Shared {
    fn on_resolved(&self, info: ServiceInfo) {
        let fullname = info.get_fullname().to_string();
        let record = encode_properties(info.get_properties());

        let mut previous = None;
        self.resolved.send_modify(|cache| {
            previous = cache
                .insert(fullname.clone(), info)
                .map(|old| encode_properties(old.get_properties()));
        });

        // A repeat resolution with a different TXT is a record change
        if let Some(old) = previous {
            if old != record {
                if let Some(tx) = lock(&self.monitors).get(&fullname) {
                    let _ = tx.send(record);
                }
            }
        }
    }

    fn forget(&self, fullname: &str) {
        self.resolved.send_modify(|cache| {
            cache.remove(fullname);
        });
    }
}

impl Resolver for MdnsBackend {
    fn search(&self, service_type: &str, domain: &str) -> Result<flume::Receiver<BrowseNotice>> {
        let ty = type_domain(service_type, domain);
        let events = self
            .daemon
            .browse(&ty)
            .with_context(|| format!("Failed to browse {}", ty))?;

        let (tx, rx) = flume::unbounded();
        let shared = self.shared.clone();
        let (service_type, domain) = (service_type.to_string(), domain.to_string());

        tokio::spawn(async move {
            while let Ok(event) = events.recv_async().await {
                match event {
                    ServiceEvent::ServiceFound(_, fullname) => {
                        let Some(identity) = ServiceIdentity::from_fullname(&fullname, &service_type, &domain) else {
                            tracing::debug!("Ignoring foreign instance {}", fullname);
                            continue;
                        };
                        if tx.send(BrowseNotice::Found(identity)).is_err() {
                            break;
                        }
                    }
                    ServiceEvent::ServiceResolved(info) => {
                        tracing::debug!("Resolved service: {}", info.get_fullname());
                        shared.on_resolved(info);
                    }
                    ServiceEvent::ServiceRemoved(_, fullname) => {
                        tracing::debug!("Service removed: {}", fullname);
                        shared.forget(&fullname);
                        if let Some(identity) = ServiceIdentity::from_fullname(&fullname, &service_type, &domain) {
                            let _ = tx.send(BrowseNotice::Removed(identity));
                        }
                    }
                    ServiceEvent::SearchStopped(ty) => {
                        tracing::debug!("Browse of {} stopped", ty);
                        break;
                    }
                    _ => {}
                }
            }
        });

        tracing::info!("Browsing {}", ty);
        Ok(rx)
    }

    fn resolve(&self, identity: &ServiceIdentity, timeout: Duration) -> BoxFuture<'static, Result<Resolution>> {
        let fullname = identity.fullname();
        let mut cache = self.shared.resolved.subscribe();

        Box::pin(async move {
            let resolution = match tokio::time::timeout(timeout, cache.wait_for(|c| c.contains_key(&fullname))).await {
                Ok(Ok(cache)) => cache.get(&fullname).map(resolution_from),
                Ok(Err(_)) => bail!("mDNS daemon went away while resolving {}", fullname),
                Err(_) => bail!("timed out after {:?}", timeout),
            };
            resolution.with_context(|| format!("{} vanished while resolving", fullname))
        })
    }

    fn monitor(&self, identity: &ServiceIdentity) -> Result<flume::Receiver<Vec<u8>>> {
        let (tx, rx) = flume::unbounded();
        lock(&self.shared.monitors).insert(identity.fullname(), tx);
        Ok(rx)
    }

    fn stop_monitoring(&self, identity: &ServiceIdentity) {
        lock(&self.shared.monitors).remove(&identity.fullname());
    }

    fn stop_search(&self, service_type: &str, domain: &str) -> Result<()> {
        let ty = type_domain(service_type, domain);
        self.daemon
            .stop_browse(&ty)
            .with_context(|| format!("Failed to stop browsing {}", ty))?;

        // A later session resolves from scratch
        self.shared.resolved.send_modify(|cache| {
            cache.retain(|fullname, _| !fullname.ends_with(ty.as_str()));
        });
        Ok(())
    }
}

impl Responder for MdnsBackend {
    fn publish(
        &self,
        identity: &ServiceIdentity,
        port: Option<u16>,
        record: Vec<u8>,
    ) -> Result<flume::Receiver<PublishNotice>> {
        let (tx, rx) = flume::unbounded();
        let listener = CancellationToken::new();

        match self.register(identity, port, &record, &listener) {
            Ok(port) => {
                lock(&self.shared.registrations).insert(
                    identity.fullname(),
                    Registration {
                        port,
                        record,
                        notices: tx.clone(),
                        listener,
                    },
                );
                let _ = tx.send(PublishNotice::Published {
                    identity: identity.clone(),
                    port,
                });
            }
            Err(e) => {
                listener.cancel();
                let _ = tx.send(PublishNotice::Failed(format!("{:#}", e)));
            }
        }

        Ok(rx)
    }

    fn set_metadata_record(&self, identity: &ServiceIdentity, record: Vec<u8>) -> Result<()> {
        let fullname = identity.fullname();
        let mut registrations = lock(&self.shared.registrations);
        let registration = registrations
            .get_mut(&fullname)
            .with_context(|| format!("{} is not published", fullname))?;

        // Registering the same name again replaces the advertised record
        let info = self.service_info(identity, registration.port, &record)?;
        self.daemon
            .register(info)
            .context("Failed to re-register with new TXT record")?;

        let old = std::mem::replace(&mut registration.record, record.clone());
        let _ = registration.notices.send(PublishNotice::RecordChanged { old, new: record });
        Ok(())
    }

    fn stop_publishing(&self, identity: &ServiceIdentity) -> Result<()> {
        let fullname = identity.fullname();
        let registration = lock(&self.shared.registrations)
            .remove(&fullname)
            .with_context(|| format!("{} is not published", fullname))?;
        registration.listener.cancel();

        let status = self
            .daemon
            .unregister(&fullname)
            .context("Failed to unregister mDNS service")?;

        tokio::spawn(async move {
            match status.recv_async().await {
                Ok(status) => tracing::info!("Unregistered {}: {:?}", fullname, status),
                Err(e) => tracing::warn!("No unregister status for {}: {}", fullname, e),
            }
            let _ = registration.notices.send(PublishNotice::Stopped);
        });

        Ok(())
    }
}

/// mdns-sd wants host names inside ".local."
fn mdns_hostname(host: &str) -> String {
    let host = host.trim_end_matches('.');
    if host.ends_with(".local") {
        format!("{}.", host)
    } else {
        format!("{}.local.", host)
    }
}

/// Split an encoded record into daemon properties. Values are passed on as
/// raw bytes and need not be UTF-8.
fn txt_properties(record: &[u8]) -> Vec<TxtProperty> {
    let mut properties = Vec::new();
    let mut rest = record;
    while let Some((&len, tail)) = rest.split_first() {
        let (entry, next) = tail.split_at((len as usize).min(tail.len()));
        rest = next;

        let (key, value) = match entry.iter().position(|b| *b == b'=') {
            Some(at) => (&entry[..at], &entry[at + 1..]),
            None => (entry, &[][..]),
        };
        if key.is_empty() {
            continue;
        }
        properties.push(TxtProperty::from((String::from_utf8_lossy(key).into_owned(), value)));
    }
    properties
}

fn encode_properties(properties: &TxtProperties) -> Vec<u8> {
    encode_entries(properties.iter().map(|prop| (prop.key(), prop.val())))
}

/// Back to TXT wire bytes. Bare keys stay bare, so every entry is exactly as
/// long as the daemon received it; entries that still do not fit one length
/// byte are dropped.
fn encode_entries<'a>(entries: impl Iterator<Item = (&'a str, Option<&'a [u8]>)>) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in entries {
        let mut entry = key.as_bytes().to_vec();
        if let Some(value) = value {
            entry.push(b'=');
            entry.extend_from_slice(value);
        }
        if entry.len() > TXT_ENTRY_MAX_LEN {
            tracing::warn!("Dropping {}-byte TXT entry {:?}", entry.len(), key);
            continue;
        }
        out.push(entry.len() as u8);
        out.extend_from_slice(&entry);
    }
    out
}

fn resolution_from(info: &ServiceInfo) -> Resolution {
    let port = info.get_port();
    let record = encode_properties(info.get_properties());
    Resolution {
        hostname: info.get_hostname().to_string(),
        port,
        addresses: info
            .get_addresses()
            .iter()
            .map(|ip| Endpoint::from(SocketAddr::new(*ip, port)))
            .collect(),
        // No TXT data means no record, not an empty one
        record: (!record.is_empty()).then_some(record),
    }
}
