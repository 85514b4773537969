use std::sync::Arc;
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tokio::sync::Mutex;
use shared::protocol::API_PREFIX;
use shared::types::{DiscoveredService, PublishedService};
use crate::backend::{Resolver, Responder};
use crate::engine::Engine;
use crate::events::{EventLog, LogLine};

pub struct AppState<B> {
    pub engine: Arc<Mutex<Engine<B>>>,
    pub log: EventLog,
}

// Derived Clone would require B: Clone
impl<B> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            log: self.log.clone(),
        }
    }
}

pub fn router<B: Resolver + Responder>(state: AppState<B>) -> Router {
    Router::new()
        .route(&format!("{}/log", API_PREFIX), get(get_log::<B>))
        .route(&format!("{}/services", API_PREFIX), get(get_services::<B>))
        .route(&format!("{}/publication", API_PREFIX), get(get_publication::<B>))
        .route(&format!("{}/restart", API_PREFIX), post(restart::<B>))
        .with_state(state)
}

async fn get_log<B: Resolver + Responder>(State(state): State<AppState<B>>) -> Json<Vec<LogLine>> {
    Json(state.log.lines())
}

async fn get_services<B: Resolver + Responder>(
    State(state): State<AppState<B>>,
) -> Json<Vec<DiscoveredService>> {
    Json(state.engine.lock().await.services().await)
}

async fn get_publication<B: Resolver + Responder>(
    State(state): State<AppState<B>>,
) -> Result<Json<PublishedService>, StatusCode> {
    state
        .engine
        .lock()
        .await
        .publication()
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn restart<B: Resolver + Responder>(State(state): State<AppState<B>>) -> StatusCode {
    tracing::info!("Restart requested over API");
    state.engine.lock().await.restart().await;
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::types::ServiceIdentity;
    use crate::backend::mock::MockBackend;
    use crate::engine::EngineSettings;
    use crate::events::LogSink;
    use crate::publisher::PublishSettings;

    fn state(log: &EventLog) -> AppState<MockBackend> {
        let settings = EngineSettings {
            discovery: None,
            publish: Some(PublishSettings {
                identity: ServiceIdentity::new("mDisco", "_http._tcp.", ""),
                port: Some(8080),
                initial_record: None,
                self_update: None,
            }),
        };
        let engine = Engine::new(
            Arc::new(MockBackend::new()),
            settings,
            Arc::new(LogSink::discovery(log.clone())),
            Arc::new(LogSink::service(log.clone())),
        )
        .with_log(log.clone());

        AppState {
            engine: Arc::new(Mutex::new(engine)),
            log: log.clone(),
        }
    }

    #[tokio::test]
    async fn test_publication_not_found_when_stopped() {
        let log = EventLog::new(100);
        let result = get_publication(State(state(&log))).await;
        assert_eq!(result.err(), Some(StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn test_publication_while_running() {
        let log = EventLog::new(100);
        let state = state(&log);
        state.engine.lock().await.start().await;

        let Json(service) = get_publication(State(state.clone())).await.unwrap();
        assert_eq!(service.identity.name, "mDisco");
        assert_eq!(service.requested_port, Some(8080));
    }

    #[tokio::test]
    async fn test_restart_returns_no_content_and_logs() {
        let log = EventLog::new(100);
        let state = state(&log);
        state.engine.lock().await.start().await;

        assert_eq!(restart(State(state.clone())).await, StatusCode::NO_CONTENT);
        assert!(state.engine.lock().await.is_running());

        let Json(lines) = get_log(State(state)).await;
        assert!(lines.iter().any(|line| line.source == "engine"));
        assert!(lines.iter().any(|line| line.source == "service" && line.text == "stop"));
    }

    #[tokio::test]
    async fn test_services_empty_without_discovery() {
        let log = EventLog::new(100);
        let state = state(&log);
        state.engine.lock().await.start().await;

        let Json(services) = get_services(State(state)).await;
        assert!(services.is_empty());
    }
}
