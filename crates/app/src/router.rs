use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use golive_core::guard::ReplayGuard;
use golive_discord::DiscordClient;
use golive_storage::Database;
use golive_twitch::{AppTokenCache, HelixClient, TwitchOAuthClient};
use golive_util::RateLimitConfig;

use crate::dispatch::{Clock, Dispatcher};
use crate::ratelimit::{caller_key, IngressLimits};
use crate::{telemetry, webhook};

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    webhook_secret: Arc<[u8]>,
    clock: Clock,
    guard: Arc<ReplayGuard>,
    limits: Arc<IngressLimits>,
    dispatcher: Dispatcher,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        metrics: PrometheusHandle,
        storage: Database,
        webhook_secret: Arc<[u8]>,
        helix: HelixClient,
        oauth: TwitchOAuthClient,
        discord: DiscordClient,
        rate_limits: RateLimitConfig,
        delivery_timeout: Duration,
    ) -> Self {
        let clock: Clock = Arc::new(Utc::now);
        let tokens = Arc::new(AppTokenCache::new(oauth));
        let dispatcher = Dispatcher::new(
            storage.clone(),
            helix,
            tokens,
            discord,
            clock.clone(),
            delivery_timeout,
        );
        Self {
            metrics,
            storage,
            webhook_secret,
            clock,
            guard: Arc::new(ReplayGuard::with_default_retention()),
            limits: Arc::new(IngressLimits::new(rate_limits)),
            dispatcher,
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.dispatcher = self.dispatcher.clone().with_clock(clock.clone());
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn webhook_secret(&self) -> Arc<[u8]> {
        self.webhook_secret.clone()
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn replay_guard(&self) -> Arc<ReplayGuard> {
        self.guard.clone()
    }

    pub fn limits(&self) -> Arc<IngressLimits> {
        self.limits.clone()
    }

    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }
}

pub fn app_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            api_rate_limit,
        ));

    Router::new()
        .merge(api)
        .route("/eventsub/webhook", post(webhook::handle))
        .with_state(state)
}

/// Admission control for the API routes; the webhook path carries its own
/// limiter checks inside the handler.
async fn api_rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let key = caller_key(request.headers());
    match state.limits().check_api(&key, state.now()) {
        Ok(()) => next.run(request).await,
        Err(problem) => problem.into_response(),
    }
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(Body::from(body))
        .unwrap()
}
