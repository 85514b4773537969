use std::fmt;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use shared::types::{DiscoveredService, PublishedService, ServiceIdentity};
use crate::backend::{Resolver, Responder};
use crate::config::Config;
use crate::discoverer::{Discoverer, DiscoverySettings};
use crate::events::{DiscoveryEvent, EventLog, EventSink, PublishEvent};
use crate::publisher::{PublishSettings, Publisher, SelfUpdate};

/// Single-use completion for a stop request.
///
/// `complete` consumes the handle, so it runs at most once; every stop path
/// in the engine completes its handle exactly once, after the shutdown it
/// guards has finished.
pub struct StopHandle(Box<dyn FnOnce() + Send + 'static>);

impl StopHandle {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    pub fn noop() -> Self {
        Self::new(|| {})
    }

    /// A handle paired with a receiver that resolves when it completes.
    pub fn channel() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let handle = Self::new(move || {
            let _ = tx.send(());
        });
        (handle, rx)
    }

    pub fn complete(self) {
        (self.0)()
    }
}

impl fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StopHandle")
    }
}

/// What the engine starts on each `start`.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub discovery: Option<DiscoverySettings>,
    pub publish: Option<PublishSettings>,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        let discovery = config.discovery.enabled.then(|| DiscoverySettings {
            service_type: config.discovery.service_type.clone(),
            domain: config.discovery.domain.clone(),
            resolve_timeout: config.discovery.resolve_timeout(),
        });

        let publish = config.publish.enabled.then(|| {
            let initial = &config.publish.initial_record;
            let update = &config.publish.self_update_record;
            PublishSettings {
                identity: ServiceIdentity::new(
                    config.publish.name.clone(),
                    config.publish.service_type.clone(),
                    config.publish.domain.clone(),
                ),
                port: config.publish.port,
                initial_record: (!initial.is_empty()).then(|| initial.clone().into()),
                self_update: (!update.is_empty()).then(|| SelfUpdate {
                    delay: config.publish.self_update_delay(),
                    record: update.clone().into(),
                }),
            }
        });

        Self { discovery, publish }
    }
}

/// Components of one running session. Either may be disabled.
struct Components {
    discoverer: Option<Discoverer>,
    publisher: Option<Publisher>,
}

enum EngineState {
    Stopped,
    Running(Components),
    /// Stop requested; the watch flips to true once both sides are quiet
    Stopping(watch::Receiver<bool>),
}

/// Owns one discoverer and one publisher and sequences their lifecycles.
pub struct Engine<B> {
    backend: Arc<B>,
    settings: EngineSettings,
    discovery_sink: Arc<dyn EventSink<DiscoveryEvent>>,
    publish_sink: Arc<dyn EventSink<PublishEvent>>,
    log: Option<EventLog>,
    state: EngineState,
}

impl<B: Resolver + Responder> Engine<B> {
    pub fn new(
        backend: Arc<B>,
        settings: EngineSettings,
        discovery_sink: Arc<dyn EventSink<DiscoveryEvent>>,
        publish_sink: Arc<dyn EventSink<PublishEvent>>,
    ) -> Self {
        Self {
            backend,
            settings,
            discovery_sink,
            publish_sink,
            log: None,
            state: EngineState::Stopped,
        }
    }

    /// Event log receiving restart separators
    pub fn with_log(mut self, log: EventLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, EngineState::Running(_))
    }

    /// Start a fresh discoverer and publisher. A stop still in flight is
    /// awaited first and a running session is stopped, so events of an
    /// earlier session never interleave with the new one.
    pub async fn start(&mut self) {
        self.quiesce().await;
        if self.is_running() {
            self.shutdown().await;
        }

        let discoverer = self.settings.discovery.clone().map(|settings| {
            Discoverer::start(self.backend.clone(), settings, self.discovery_sink.clone())
        });
        let publisher = self.settings.publish.clone().map(|settings| {
            Publisher::start(self.backend.clone(), settings, self.publish_sink.clone())
        });

        tracing::debug!(
            discovery = discoverer.is_some(),
            publish = publisher.is_some(),
            "Engine started"
        );
        self.state = EngineState::Running(Components { discoverer, publisher });
    }

    /// Stop the discoverer, then the publisher, then complete `done`.
    ///
    /// The publisher is not asked to stop until the discoverer has
    /// confirmed its own stop. Missing components are skipped.
    pub fn stop(&mut self, done: StopHandle) {
        match std::mem::replace(&mut self.state, EngineState::Stopped) {
            EngineState::Stopped => done.complete(),
            EngineState::Stopping(quiesced) => {
                tracing::debug!("Stop already in progress");
                let mut pending = quiesced.clone();
                tokio::spawn(async move {
                    let _ = pending.wait_for(|quiet| *quiet).await;
                    done.complete();
                });
                self.state = EngineState::Stopping(quiesced);
            }
            EngineState::Running(components) => {
                let (quiet_tx, quiet_rx) = watch::channel(false);
                // The caller hears first, so a following start sees its completion
                let done = StopHandle::new(move || {
                    done.complete();
                    let _ = quiet_tx.send(true);
                });
                Self::stop_components(components, done);
                self.state = EngineState::Stopping(quiet_rx);
            }
        }
    }

    fn stop_components(components: Components, done: StopHandle) {
        match (components.discoverer, components.publisher) {
            (Some(discoverer), Some(publisher)) => {
                discoverer.stop(StopHandle::new(move || publisher.stop(done)));
            }
            (Some(discoverer), None) => discoverer.stop(done),
            (None, Some(publisher)) => publisher.stop(done),
            (None, None) => done.complete(),
        }
    }

    /// Stop and wait until both components are quiet.
    pub async fn shutdown(&mut self) {
        let (done, stopped) = StopHandle::channel();
        self.stop(done);
        let _ = stopped.await;
        self.quiesce().await;
    }

    /// Stop, then start again once the old session is fully down.
    pub async fn restart(&mut self) {
        self.separator();
        let log = self.log.clone();
        let (done, stopped) = StopHandle::channel();
        self.stop(StopHandle::new(move || {
            if let Some(log) = log {
                log.append("engine", SEPARATOR);
            }
            done.complete();
        }));
        let _ = stopped.await;
        self.start().await;
    }

    pub async fn services(&self) -> Vec<DiscoveredService> {
        match &self.state {
            EngineState::Running(Components { discoverer: Some(discoverer), .. }) => {
                discoverer.snapshot().await
            }
            _ => Vec::new(),
        }
    }

    pub async fn publication(&self) -> Option<PublishedService> {
        match &self.state {
            EngineState::Running(Components { publisher: Some(publisher), .. }) => {
                publisher.snapshot().await
            }
            _ => None,
        }
    }

    async fn quiesce(&mut self) {
        if let EngineState::Stopping(quiesced) = &mut self.state {
            let _ = quiesced.wait_for(|quiet| *quiet).await;
            self.state = EngineState::Stopped;
        }
    }

    fn separator(&self) {
        if let Some(log) = &self.log {
            log.append("engine", SEPARATOR);
        }
    }
}

const SEPARATOR: &str = "------------------";
