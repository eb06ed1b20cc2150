//! # routes
//!
//! Thin HTTP handlers. Every handler parses, calls one engine operation and
//! wraps the result in `{ "ok": true, ... }`; failures go through
//! [`crate::error::AppError`].

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::auth::require_api_key;
use crate::state::SharedState;

pub mod ledger;
pub mod market;
pub mod monitor;
pub mod positions;
pub mod signals;

pub fn router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Ingress ───────────────────────────────────────────────────────────
        .route("/api/signals/webhook",                 post(signals::receive_signal))
        // ── Collaborator feeds ────────────────────────────────────────────────
        .route("/api/market/context",                  post(market::publish_context).get(market::get_context))
        .route("/api/ledger/topup",                    post(ledger::top_up))
        .route("/api/positions/mark",                  post(positions::push_mark))
        .route("/api/positions/reconcile/:account_id", post(positions::reconcile))
        // ── Monitor ───────────────────────────────────────────────────────────
        .route("/ws/monitor",                          get(monitor::ws_monitor))
        .route("/api/monitor/classifier",              get(monitor::get_classifier_stats))
        .route("/api/monitor/positions",               get(monitor::get_open_positions))
        .route("/api/monitor/executions/:signal_id",   get(monitor::get_executions))
        .route("/health",                              get(monitor::health_check))
        // ── Middleware ────────────────────────────────────────────────────────
        .layer(axum::middleware::from_fn_with_state(state.clone(), require_api_key))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::credentials::StaticCredentialResolver;
    use crate::engine::ai::UnavailableJudgmentService;
    use crate::engine::classifier::AtomicClassifierMetrics;
    use crate::exchange::{paper::PaperAdapter, ExchangeRegistry};
    use crate::models::{Account, PlanTier};
    use crate::state::{AppState, Components};
    use crate::store::{MemoryStore, Store};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn state(api_key: Option<&str>) -> (Arc<MemoryStore>, SharedState) {
        let store = Arc::new(MemoryStore::new());
        let config = Config { api_key: api_key.map(str::to_string), ..Config::default() };
        let state = AppState::assemble(
            &config,
            Components {
                store: store.clone(),
                registry: ExchangeRegistry::new().with(Arc::new(PaperAdapter::new(1_000.0))),
                credentials: Arc::new(StaticCredentialResolver::new()),
                judgment: Arc::new(UnavailableJudgmentService),
                metrics: Arc::new(AtomicClassifierMetrics::default()),
            },
        );
        (store, state)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn api_key_is_enforced_except_on_health() {
        let (_, state) = state(Some("secret"));
        let app = router(state);

        let health = app.clone().oneshot(Request::get("/health").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        let denied = app
            .clone()
            .oneshot(Request::get("/api/monitor/classifier").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let allowed = app
            .oneshot(
                Request::get("/api/monitor/classifier")
                    .header("X-API-Key", "secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn webhook_runs_the_pipeline() {
        let (_, state) = state(None);
        let response = router(state)
            .oneshot(post_json(
                "/api/signals/webhook?source=tradingview",
                json!({ "symbol": "ETHUSDT", "action": "BUY", "price": 2800 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["ok"], true);
        assert_eq!(body["outcome"]["status"], "completed");
    }

    #[tokio::test]
    async fn webhook_rejects_non_json() {
        let (_, state) = state(None);
        let response = router(state)
            .oneshot(Request::post("/api/signals/webhook").body(Body::from("LONG BTC")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["ok"], false);
    }

    #[tokio::test]
    async fn top_up_errors_map_to_status_codes() {
        let (store, state) = state(None);
        let account = Account::new(PlanTier::Basic, "BRL");
        store.save_account(&account).await.unwrap();
        let app = router(state);

        let unknown = app
            .clone()
            .oneshot(post_json(
                "/api/ledger/topup",
                json!({ "account_id": uuid::Uuid::new_v4(), "amount": 10.0, "currency": "BRL" }),
            ))
            .await
            .unwrap();
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

        let mismatch = app
            .clone()
            .oneshot(post_json(
                "/api/ledger/topup",
                json!({ "account_id": account.id, "amount": 10.0, "currency": "USD" }),
            ))
            .await
            .unwrap();
        assert_eq!(mismatch.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let ok = app
            .oneshot(post_json(
                "/api/ledger/topup",
                json!({ "account_id": account.id, "amount": 10.0, "currency": "BRL" }),
            ))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(body_json(ok).await["receipt"]["credited"], 10.0);
    }

    #[tokio::test]
    async fn market_context_round_trips_through_the_feed() {
        let (_, state) = state(None);
        let app = router(state);
        let context = json!({
            "sentiment_index": 40.0,
            "trend": "BEARISH",
            "dominant_share_pct": 51.5,
            "refreshed_at": "2026-01-01T00:00:00Z",
        });

        let published = app.clone().oneshot(post_json("/api/market/context", context)).await.unwrap();
        assert_eq!(published.status(), StatusCode::OK);

        let read = app
            .oneshot(Request::get("/api/market/context").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(read).await["context"]["trend"], "BEARISH");
    }
}
