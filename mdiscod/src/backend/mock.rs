//! In-memory resolver/responder for tests.
//!
//! Every backend call is written to a [`Journal`]; [`JournalSink`] writes
//! component events to the same journal so tests can assert the relative
//! order of events and backend calls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use anyhow::{anyhow, bail, Result};
use futures::future::BoxFuture;
use shared::types::ServiceIdentity;
use super::{BrowseNotice, PublishNotice, Resolution, Resolver, Responder};
use crate::events::{DiscoveryEvent, EventSink, PublishEvent};

/// Port handed out when a publish asks the responder to pick one
pub const ASSIGNED_PORT: u16 = 49152;

#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }
}

pub struct JournalSink(pub Journal);

impl EventSink<DiscoveryEvent> for JournalSink {
    fn emit(&self, event: DiscoveryEvent) {
        self.0.record(format!("[discovery] {}", event));
    }
}

impl EventSink<PublishEvent> for JournalSink {
    fn emit(&self, event: PublishEvent) {
        self.0.record(format!("[service] {}", event));
    }
}

#[derive(Default)]
struct MockState {
    search: Option<(String, String)>,
    browse: Option<flume::Sender<BrowseNotice>>,
    resolutions: HashMap<String, std::result::Result<Resolution, String>>,
    monitors: HashMap<String, flume::Sender<Vec<u8>>>,
    publications: HashMap<String, flume::Sender<PublishNotice>>,
    records: HashMap<String, Vec<u8>>,
    fail_search: bool,
    fail_publish: Option<String>,
    refuse_publish: Option<String>,
    fail_stop: Option<String>,
    fail_set_record: Option<String>,
    hold_stops: bool,
    held: Vec<String>,
}

#[derive(Default)]
pub struct MockBackend {
    journal: Journal,
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal,
            state: Mutex::default(),
        }
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    /// Resolutions of `name` succeed with `resolution`. Unscripted names
    /// never resolve and run into the timeout.
    pub fn script_resolution(&self, name: &str, resolution: Resolution) {
        self.state.lock().unwrap().resolutions.insert(name.to_string(), Ok(resolution));
    }

    pub fn script_failure(&self, name: &str, reason: &str) {
        self.state.lock().unwrap().resolutions.insert(name.to_string(), Err(reason.to_string()));
    }

    pub fn fail_search(&self) {
        self.state.lock().unwrap().fail_search = true;
    }

    pub fn fail_publish(&self, reason: &str) {
        self.state.lock().unwrap().fail_publish = Some(reason.to_string());
    }

    /// `publish` itself returns an error instead of a notice channel
    pub fn refuse_publish(&self, reason: &str) {
        self.state.lock().unwrap().refuse_publish = Some(reason.to_string());
    }

    pub fn fail_stop(&self, reason: &str) {
        self.state.lock().unwrap().fail_stop = Some(reason.to_string());
    }

    pub fn fail_set_record(&self, reason: &str) {
        self.state.lock().unwrap().fail_set_record = Some(reason.to_string());
    }

    /// Withdrawals wait for [`MockBackend::confirm_stops`]
    pub fn hold_stops(&self) {
        self.state.lock().unwrap().hold_stops = true;
    }

    pub fn confirm_stops(&self) {
        let mut state = self.state.lock().unwrap();
        for fullname in std::mem::take(&mut state.held) {
            if let Some(tx) = state.publications.remove(&fullname) {
                self.journal.record("confirm_stop");
                let _ = tx.send(PublishNotice::Stopped);
            }
        }
    }

    pub fn identity(&self, name: &str) -> ServiceIdentity {
        let state = self.state.lock().unwrap();
        let (service_type, domain) = state.search.clone().unwrap_or_default();
        ServiceIdentity::new(name, service_type, domain)
    }

    /// Announce an instance to the running browse session.
    pub fn announce(&self, name: &str) {
        let identity = self.identity(name);
        let state = self.state.lock().unwrap();
        if let Some(tx) = &state.browse {
            let _ = tx.send(BrowseNotice::Found(identity));
        }
    }

    pub fn withdraw(&self, name: &str) {
        let identity = self.identity(name);
        let state = self.state.lock().unwrap();
        if let Some(tx) = &state.browse {
            let _ = tx.send(BrowseNotice::Removed(identity));
        }
    }

    /// Deliver a TXT change to whoever monitors `name`.
    pub fn push_record(&self, name: &str, record: Vec<u8>) {
        let state = self.state.lock().unwrap();
        if let Some(tx) = state.monitors.get(name) {
            let _ = tx.send(record);
        }
    }

    pub fn is_searching(&self) -> bool {
        self.state.lock().unwrap().browse.is_some()
    }

    pub fn is_monitoring(&self, name: &str) -> bool {
        self.state.lock().unwrap().monitors.contains_key(name)
    }

    pub fn is_published(&self, name: &str) -> bool {
        self.state.lock().unwrap().publications.keys().any(|fullname| fullname.starts_with(name))
    }
}

impl Resolver for MockBackend {
    fn search(&self, service_type: &str, domain: &str) -> Result<flume::Receiver<BrowseNotice>> {
        self.journal.record(format!("search {}", service_type));
        let mut state = self.state.lock().unwrap();
        if state.fail_search {
            bail!("browse refused");
        }
        let (tx, rx) = flume::unbounded();
        state.search = Some((service_type.to_string(), domain.to_string()));
        state.browse = Some(tx);
        Ok(rx)
    }

    fn resolve(&self, identity: &ServiceIdentity, timeout: Duration) -> BoxFuture<'static, Result<Resolution>> {
        self.journal.record(format!("resolve {}", identity.name));
        let scripted = self.state.lock().unwrap().resolutions.get(&identity.name).cloned();
        Box::pin(async move {
            match scripted {
                Some(Ok(resolution)) => Ok(resolution),
                Some(Err(reason)) => Err(anyhow!(reason)),
                None => {
                    let _ = tokio::time::timeout(timeout, std::future::pending::<()>()).await;
                    bail!("timed out after {:?}", timeout)
                }
            }
        })
    }

    fn monitor(&self, identity: &ServiceIdentity) -> Result<flume::Receiver<Vec<u8>>> {
        self.journal.record(format!("monitor {}", identity.name));
        let (tx, rx) = flume::unbounded();
        self.state.lock().unwrap().monitors.insert(identity.name.clone(), tx);
        Ok(rx)
    }

    fn stop_monitoring(&self, identity: &ServiceIdentity) {
        self.journal.record(format!("stop_monitoring {}", identity.name));
        self.state.lock().unwrap().monitors.remove(&identity.name);
    }

    fn stop_search(&self, service_type: &str, _domain: &str) -> Result<()> {
        self.journal.record(format!("stop_search {}", service_type));
        self.state.lock().unwrap().browse = None;
        Ok(())
    }
}

impl Responder for MockBackend {
    fn publish(
        &self,
        identity: &ServiceIdentity,
        port: Option<u16>,
        record: Vec<u8>,
    ) -> Result<flume::Receiver<PublishNotice>> {
        self.journal.record(format!("publish {}", identity.name));
        let mut state = self.state.lock().unwrap();
        if let Some(reason) = &state.refuse_publish {
            bail!("{}", reason);
        }
        let (tx, rx) = flume::unbounded();

        match state.fail_publish.clone() {
            Some(reason) => {
                let _ = tx.send(PublishNotice::Failed(reason));
            }
            None => {
                let fullname = identity.fullname();
                state.records.insert(fullname.clone(), record);
                state.publications.insert(fullname, tx.clone());
                let _ = tx.send(PublishNotice::Published {
                    identity: identity.clone(),
                    port: port.unwrap_or(ASSIGNED_PORT),
                });
            }
        }

        Ok(rx)
    }

    fn set_metadata_record(&self, identity: &ServiceIdentity, record: Vec<u8>) -> Result<()> {
        self.journal.record("set_metadata_record");
        let mut state = self.state.lock().unwrap();
        if let Some(reason) = &state.fail_set_record {
            bail!("{}", reason);
        }
        let fullname = identity.fullname();
        let Some(tx) = state.publications.get(&fullname).cloned() else {
            bail!("{} is not published", fullname);
        };
        let old = state.records.insert(fullname, record.clone()).unwrap_or_default();
        let _ = tx.send(PublishNotice::RecordChanged { old, new: record });
        Ok(())
    }

    fn stop_publishing(&self, identity: &ServiceIdentity) -> Result<()> {
        self.journal.record("stop_publishing");
        let mut state = self.state.lock().unwrap();
        if let Some(reason) = &state.fail_stop {
            bail!("{}", reason);
        }
        let fullname = identity.fullname();
        if state.hold_stops {
            state.held.push(fullname);
            return Ok(());
        }
        if let Some(tx) = state.publications.remove(&fullname) {
            let _ = tx.send(PublishNotice::Stopped);
        }
        Ok(())
    }
}
