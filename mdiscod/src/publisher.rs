use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use shared::txt::{self, MetadataRecord};
use shared::types::{PublicationState, PublishedService, ServiceIdentity};
use crate::backend::{PublishNotice, Responder};
use crate::engine::StopHandle;
use crate::events::{EventSink, PublishEvent};

#[derive(Debug, Clone)]
pub struct PublishSettings {
    pub identity: ServiceIdentity,
    /// `None` asks the responder to listen on a port of its own
    pub port: Option<u16>,
    pub initial_record: Option<MetadataRecord>,
    /// Record written once, `delay` after publication
    pub self_update: Option<SelfUpdate>,
}

#[derive(Debug, Clone)]
pub struct SelfUpdate {
    pub delay: Duration,
    pub record: MetadataRecord,
}

enum Command {
    Snapshot(oneshot::Sender<PublishedService>),
    Stop(StopHandle),
}

/// Handle to one advertised service.
///
/// A publisher publishes exactly once; after a failure or a stop a new
/// publisher is needed.
pub struct Publisher {
    commands: mpsc::UnboundedSender<Command>,
}

impl Publisher {
    /// Ask the responder to advertise the service. `WillPublish` is emitted
    /// before this returns.
    pub fn start<R: Responder>(
        responder: Arc<R>,
        settings: PublishSettings,
        sink: Arc<dyn EventSink<PublishEvent>>,
    ) -> Self {
        let mut service = PublishedService::new(
            settings.identity.clone(),
            settings.port,
            settings.initial_record.clone().unwrap_or_default(),
        );
        service.state = PublicationState::Publishing;
        sink.emit(PublishEvent::WillPublish(settings.identity.clone()));

        let notices = match responder.publish(&settings.identity, settings.port, service.metadata.encode()) {
            Ok(rx) => rx,
            Err(e) => {
                service.state = PublicationState::Failed;
                sink.emit(PublishEvent::PublishFailed { reason: format!("{:#}", e) });
                flume::unbounded().1
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session {
            responder,
            sink,
            self_update: settings.self_update,
            service,
            update_at: None,
            waiters: Vec::new(),
        };
        tokio::spawn(session.run(notices, rx));

        Self { commands: tx }
    }

    /// Current publication, or `None` once the publisher has stopped.
    pub async fn snapshot(&self) -> Option<PublishedService> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(Command::Snapshot(reply)).ok()?;
        rx.await.ok()
    }

    /// Withdraw the service; `done` completes once the responder confirms.
    /// Stops requested before confirmation all complete, in call order.
    pub fn stop(&self, done: StopHandle) {
        if let Err(mpsc::error::SendError(command)) = self.commands.send(Command::Stop(done)) {
            if let Command::Stop(done) = command {
                tracing::debug!("Publisher already stopped");
                done.complete();
            }
        }
    }
}

struct Session<R> {
    responder: Arc<R>,
    sink: Arc<dyn EventSink<PublishEvent>>,
    self_update: Option<SelfUpdate>,
    service: PublishedService,
    /// Deadline of the one-shot self-update, armed on publication
    update_at: Option<Instant>,
    /// Completions of stop requests still waiting for confirmation
    waiters: Vec<StopHandle>,
}

async fn fire_at(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => pending().await,
    }
}

impl<R: Responder> Session<R> {
    async fn run(
        mut self,
        notices: flume::Receiver<PublishNotice>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let mut listening = self.service.state == PublicationState::Publishing;
        let mut attached = true;

        loop {
            tokio::select! {
                notice = notices.recv_async(), if listening => {
                    match notice {
                        Ok(notice) => {
                            if self.on_notice(notice) {
                                break;
                            }
                        }
                        Err(_) => {
                            tracing::debug!("Responder channel for {} closed", self.service.identity.fullname());
                            listening = false;
                            if self.stopping() {
                                self.on_stopped();
                                break;
                            }
                        }
                    }
                }

                _ = fire_at(self.update_at), if self.update_at.is_some() => {
                    self.update_at = None;
                    self.send_self_update();
                }

                command = commands.recv(), if attached => {
                    match command {
                        Some(Command::Snapshot(reply)) => {
                            let _ = reply.send(self.service.clone());
                        }
                        Some(Command::Stop(done)) => {
                            if self.on_stop(done) {
                                break;
                            }
                        }
                        // Handle dropped: withdraw, nobody to tell
                        None => {
                            attached = false;
                            if self.on_stop(StopHandle::noop()) {
                                break;
                            }
                        }
                    }
                }

                else => break,
            }
        }

        commands.close();
        while let Ok(command) = commands.try_recv() {
            if let Command::Stop(done) = command {
                done.complete();
            }
        }
    }

    fn stopping(&self) -> bool {
        !self.waiters.is_empty()
    }

    /// Returns true when the session is finished and the loop should end.
    fn on_notice(&mut self, notice: PublishNotice) -> bool {
        match notice {
            PublishNotice::Published { identity, port } => {
                if self.service.state != PublicationState::Publishing {
                    tracing::debug!("Ignoring late publication of {}", identity.fullname());
                    return false;
                }
                self.service.state = PublicationState::Published;
                self.service.port = Some(port);
                self.sink.emit(PublishEvent::Published { identity, port });

                if let Some(update) = &self.self_update {
                    if !self.stopping() {
                        self.update_at = Some(Instant::now() + update.delay);
                    }
                }
                false
            }
            PublishNotice::Failed(reason) => {
                self.service.state = PublicationState::Failed;
                self.update_at = None;
                self.sink.emit(PublishEvent::PublishFailed { reason });
                // No confirmation will come for a service that never went out
                if self.stopping() {
                    self.finish();
                    return true;
                }
                false
            }
            PublishNotice::RecordChanged { old, new } => {
                self.sink.emit(PublishEvent::MetadataChanged {
                    old: txt::decode(&old),
                    new: txt::decode(&new),
                });
                false
            }
            PublishNotice::Stopped => {
                self.on_stopped();
                true
            }
        }
    }

    fn send_self_update(&mut self) {
        let Some(update) = &self.self_update else {
            return;
        };

        self.sink.emit(PublishEvent::WillUpdateMetadata);
        let record = update.record.clone();
        match self.responder.set_metadata_record(&self.service.identity, record.encode()) {
            Ok(()) => {
                self.service.metadata = record.clone();
                self.sink.emit(PublishEvent::MetadataUpdateSent(record));
            }
            Err(e) => {
                self.sink.emit(PublishEvent::MetadataUpdateFailed { reason: format!("{:#}", e) });
            }
        }
    }

    /// Returns true when the session is finished and the loop should end.
    fn on_stop(&mut self, done: StopHandle) -> bool {
        self.update_at = None;

        match self.service.state {
            PublicationState::Failed | PublicationState::Unpublished | PublicationState::Stopped => {
                done.complete();
                return true;
            }
            PublicationState::Publishing | PublicationState::Published => {}
        }

        let first = !self.stopping();
        self.waiters.push(done);
        if !first {
            tracing::debug!("Stop already requested for {}", self.service.identity.fullname());
            return false;
        }

        match self.responder.stop_publishing(&self.service.identity) {
            Ok(()) => false,
            Err(e) => {
                self.sink.emit(PublishEvent::StopFailed { reason: format!("{:#}", e) });
                self.finish();
                true
            }
        }
    }

    fn on_stopped(&mut self) {
        self.service.state = PublicationState::Stopped;
        self.update_at = None;
        self.sink.emit(PublishEvent::Stopped);
        self.finish();
    }

    fn finish(&mut self) {
        for done in self.waiters.drain(..) {
            done.complete();
        }
    }
}
