pub(crate) mod auth;
mod handlers;
mod router;

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::State,
    response::sse::{Event, Sse},
};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;

use crate::core::batch::BatchService;
use crate::core::lifecycle::LifecycleComponent;

pub struct ApiServer {
    service: Arc<BatchService>,
    log_tx: tokio::sync::broadcast::Sender<String>,
    api_host: String,
    api_port: u16,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) service: Arc<BatchService>,
    pub(crate) log_tx: tokio::sync::broadcast::Sender<String>,
    pub(crate) api_port: u16,
}

impl ApiServer {
    pub fn new(
        service: Arc<BatchService>,
        log_tx: tokio::sync::broadcast::Sender<String>,
        api_host: String,
        api_port: u16,
    ) -> Self {
        Self {
            service,
            log_tx,
            api_host,
            api_port,
        }
    }
}

// --- SSE daemon logs (used by router) ---

async fn sse_logs_endpoint(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.log_tx.subscribe();
    let stream = BroadcastStream::new(receiver).map(|msg| {
        match msg {
            Ok(log) => Ok(Event::default().data(log)), // SSE properly encodes this
            Err(_) => Ok(Event::default().data("Log stream lagged")),
        }
    });

    Sse::new(stream)
}

// --- Lifecycle implementation ---

#[async_trait]
impl LifecycleComponent for ApiServer {
    async fn on_init(&mut self) -> Result<()> {
        info!("API Server Interface initializing...");
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        let state = AppState {
            service: self.service.clone(),
            log_tx: self.log_tx.clone(),
            api_port: self.api_port,
        };
        let addr = format!("{}:{}", self.api_host, self.api_port);

        tokio::spawn(async move {
            let app = router::build_api_router(state);
            if let Ok(listener) = tokio::net::TcpListener::bind(&addr).await {
                info!("API Server running at http://{addr}");
                if let Err(e) = axum::serve(listener, app).await {
                    tracing::error!("API Server crashed: {}", e);
                }
            } else {
                tracing::error!("API Server failed to bind {addr}");
            }
        });
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("API Server Interface shutting down...");
        Ok(())
    }
}
