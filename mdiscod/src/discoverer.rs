use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::Future;
use tokio::sync::{mpsc, oneshot};
use shared::txt;
use shared::types::{DiscoveredService, ResolutionState, ServiceIdentity};
use crate::backend::{BrowseNotice, Resolution, Resolver};
use crate::engine::StopHandle;
use crate::events::{DiscoveryEvent, EventSink};

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub service_type: String,
    /// Empty means the resolver's default domain
    pub domain: String,
    pub resolve_timeout: Duration,
}

enum Command {
    Snapshot(oneshot::Sender<Vec<DiscoveredService>>),
    Stop(StopHandle),
}

type ResolveFuture = Pin<Box<dyn Future<Output = (ServiceIdentity, Result<Resolution>)> + Send>>;

type RecordResult = (ServiceIdentity, flume::Receiver<Vec<u8>>, Result<Vec<u8>, flume::RecvError>);
type RecordFuture = Pin<Box<dyn Future<Output = RecordResult> + Send>>;

/// Same shape as a browse receive: the future owns its receiver and hands it
/// back so it can be queued again.
fn make_record_future(identity: ServiceIdentity, rx: flume::Receiver<Vec<u8>>) -> RecordFuture {
    Box::pin(async move {
        let result = rx.recv_async().await;
        (identity, rx, result)
    })
}

/// Handle to one browse session.
///
/// The session runs as its own task and owns the tracked services; the
/// handle only sends it commands. Dropping the handle stops the session
/// without a completion.
pub struct Discoverer {
    commands: mpsc::UnboundedSender<Command>,
}

impl Discoverer {
    /// Start browsing. `SearchStarted` is emitted before this returns; every
    /// later event comes from the session task.
    pub fn start<R: Resolver>(
        resolver: Arc<R>,
        settings: DiscoverySettings,
        sink: Arc<dyn EventSink<DiscoveryEvent>>,
    ) -> Self {
        sink.emit(DiscoveryEvent::SearchStarted {
            service_type: settings.service_type.clone(),
            domain: settings.domain.clone(),
        });

        let browse = match resolver.search(&settings.service_type, &settings.domain) {
            Ok(rx) => rx,
            Err(e) => {
                sink.emit(DiscoveryEvent::SearchFailed { reason: format!("{:#}", e) });
                // Disconnected at once, so the session just waits to be stopped
                flume::unbounded().1
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session {
            resolver,
            sink,
            settings,
            services: HashMap::new(),
        };
        tokio::spawn(session.run(browse, rx));

        Self { commands: tx }
    }

    /// Tracked services, sorted by name. Empty once the session has stopped.
    pub async fn snapshot(&self) -> Vec<DiscoveredService> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Snapshot(reply)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Tear the session down and then complete `done`. On a session that
    /// already stopped, `done` completes immediately.
    pub fn stop(&self, done: StopHandle) {
        if let Err(mpsc::error::SendError(command)) = self.commands.send(Command::Stop(done)) {
            if let Command::Stop(done) = command {
                tracing::debug!("Discoverer already stopped");
                done.complete();
            }
        }
    }
}

struct Session<R> {
    resolver: Arc<R>,
    sink: Arc<dyn EventSink<DiscoveryEvent>>,
    settings: DiscoverySettings,
    services: HashMap<ServiceIdentity, DiscoveredService>,
}

impl<R: Resolver> Session<R> {
    async fn run(
        mut self,
        browse: flume::Receiver<BrowseNotice>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let mut browsing = true;
        let mut resolving: FuturesUnordered<ResolveFuture> = FuturesUnordered::new();
        let mut records: FuturesUnordered<RecordFuture> = FuturesUnordered::new();

        let done = loop {
            tokio::select! {
                notice = browse.recv_async(), if browsing => {
                    match notice {
                        Ok(BrowseNotice::Found(identity)) => {
                            if let Some((resolve, monitor)) = self.on_found(identity.clone()) {
                                resolving.push(resolve);
                                if let Some(rx) = monitor {
                                    records.push(make_record_future(identity, rx));
                                }
                            }
                        }
                        Ok(BrowseNotice::Removed(identity)) => self.on_removed(&identity),
                        Err(_) => {
                            tracing::debug!("Browse channel for {} closed", self.settings.service_type);
                            browsing = false;
                        }
                    }
                }

                Some((identity, result)) = resolving.next() => {
                    self.on_resolved(identity, result);
                }

                Some((identity, rx, result)) = records.next() => {
                    if let Ok(bytes) = result {
                        if self.on_record(&identity, &bytes) {
                            records.push(make_record_future(identity, rx));
                        }
                    }
                }

                command = commands.recv() => {
                    match command {
                        Some(Command::Snapshot(reply)) => {
                            let _ = reply.send(self.snapshot());
                        }
                        Some(Command::Stop(done)) => break Some(done),
                        None => break None,
                    }
                }
            }
        };

        // Pending resolutions must never report against a stopped session
        drop(resolving);
        drop(records);
        self.shutdown();

        if let Some(done) = done {
            done.complete();
        }

        // Stops that queued up behind the first one
        commands.close();
        while let Ok(command) = commands.try_recv() {
            if let Command::Stop(done) = command {
                done.complete();
            }
        }
    }

    fn on_found(
        &mut self,
        identity: ServiceIdentity,
    ) -> Option<(ResolveFuture, Option<flume::Receiver<Vec<u8>>>)> {
        if self.services.contains_key(&identity) {
            tracing::debug!("{} already tracked", identity.fullname());
            return None;
        }

        self.services.insert(identity.clone(), DiscoveredService::new(identity.clone()));
        self.sink.emit(DiscoveryEvent::ServiceFound(identity.clone()));

        let monitor = match self.resolver.monitor(&identity) {
            Ok(rx) => Some(rx),
            Err(e) => {
                tracing::warn!("Failed to monitor {}: {:#}", identity.fullname(), e);
                None
            }
        };

        if let Some(service) = self.services.get_mut(&identity) {
            service.state = ResolutionState::Resolving;
        }
        let pending = self.resolver.resolve(&identity, self.settings.resolve_timeout);
        let resolve: ResolveFuture = Box::pin(async move { (identity, pending.await) });

        Some((resolve, monitor))
    }

    fn on_resolved(&mut self, identity: ServiceIdentity, result: Result<Resolution>) {
        let Some(service) = self.services.get_mut(&identity) else {
            tracing::debug!("Dropping resolution for untracked {}", identity.fullname());
            return;
        };

        match result {
            Ok(resolution) => {
                service.hostname = Some(resolution.hostname.clone());
                service.port = Some(resolution.port);
                service.addresses = resolution.addresses;
                service.state = ResolutionState::Resolved;

                self.sink.emit(DiscoveryEvent::ServiceResolved {
                    identity: identity.clone(),
                    hostname: resolution.hostname,
                    port: resolution.port,
                    ipv4: service.ipv4(),
                });

                if let Some(bytes) = resolution.record {
                    let record = txt::decode(&bytes);
                    service.metadata = record.clone();
                    self.sink.emit(DiscoveryEvent::MetadataUpdated { identity, record });
                }
            }
            Err(e) => {
                service.state = ResolutionState::Failed;
                self.services.remove(&identity);
                self.resolver.stop_monitoring(&identity);
                self.sink.emit(DiscoveryEvent::ResolveFailed {
                    identity,
                    reason: format!("{:#}", e),
                });
            }
        }
    }

    /// Returns whether the service is still tracked and worth monitoring.
    fn on_record(&mut self, identity: &ServiceIdentity, bytes: &[u8]) -> bool {
        let Some(service) = self.services.get_mut(identity) else {
            return false;
        };

        let record = txt::decode(bytes);
        service.metadata = record.clone();
        if service.state == ResolutionState::Resolved {
            self.sink.emit(DiscoveryEvent::MetadataUpdated {
                identity: identity.clone(),
                record,
            });
        } else {
            tracing::debug!("TXT for {} arrived before resolution", identity.fullname());
        }
        true
    }

    fn on_removed(&mut self, identity: &ServiceIdentity) {
        if self.services.remove(identity).is_some() {
            self.resolver.stop_monitoring(identity);
            self.sink.emit(DiscoveryEvent::ServiceLost(identity.clone()));
        }
    }

    fn snapshot(&self) -> Vec<DiscoveredService> {
        let mut services: Vec<_> = self.services.values().cloned().collect();
        services.sort_by(|a, b| a.identity.cmp(&b.identity));
        services
    }

    fn shutdown(&mut self) {
        for identity in self.services.keys() {
            self.resolver.stop_monitoring(identity);
        }
        self.services.clear();

        if let Err(e) = self.resolver.stop_search(&self.settings.service_type, &self.settings.domain) {
            tracing::warn!("Failed to stop browsing {}: {:#}", self.settings.service_type, e);
        }

        self.sink.emit(DiscoveryEvent::SearchStopped);
    }
}
