//! # state
//!
//! Shared application state: every pipeline stage, wired once at startup and
//! injected into handlers as `State<SharedState>`.
//!
//! [`build_state`] picks the concrete collaborators from [`Config`]
//! (store backend, credential source, reasoning provider, venues).
//! [`AppState::assemble`] takes them ready-made, which is what tests use.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::Config;
use crate::credentials::{CredentialResolver, HttpCredentialResolver, StaticCredentialResolver};
use crate::engine::ai::{LlmJudgmentService, UnavailableJudgmentService};
use crate::engine::classifier::{AtomicClassifierMetrics, ClassifierMetrics, SignalClassifier};
use crate::engine::decision::{DecisionEngine, JudgmentService};
use crate::engine::eligibility::EligibilityResolver;
use crate::engine::fanout::FanoutEngine;
use crate::engine::normalizer::SignalNormalizer;
use crate::engine::pipeline::SignalPipeline;
use crate::engine::tracker::PositionTracker;
use crate::events::Notifier;
use crate::exchange::binance::BinanceAdapter;
use crate::exchange::okx::OkxAdapter;
use crate::exchange::paper::PaperAdapter;
use crate::exchange::ExchangeRegistry;
use crate::ledger::{AccountLocks, Ledger};
use crate::models::MarketContextFeed;
use crate::store::{MemoryStore, Store};

/// Capacity of the notification channel; slow subscribers see `Lagged`.
const NOTIFY_CAPACITY: usize = 1024;

/// Externally supplied collaborators.
pub struct Components {
    pub store:       Arc<dyn Store>,
    pub registry:    ExchangeRegistry,
    pub credentials: Arc<dyn CredentialResolver>,
    pub judgment:    Arc<dyn JudgmentService>,
    pub metrics:     Arc<dyn ClassifierMetrics>,
}

// ─── AppState ─────────────────────────────────────────────────────────────────

pub struct AppState {
    pub api_key:  Option<String>,
    pub store:    Arc<dyn Store>,
    pub pipeline: SignalPipeline,
    /// Written by the market-context collaborator, read by the decision engine.
    pub market:   Arc<MarketContextFeed>,
    pub tracker:  Arc<PositionTracker>,
    pub ledger:   Arc<Ledger>,
    pub notifier: Notifier,
    pub started_at: DateTime<Utc>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn assemble(config: &Config, parts: Components) -> SharedState {
        let Components { store, registry, credentials, judgment, metrics } = parts;
        let notifier = Notifier::new(NOTIFY_CAPACITY);
        let market = Arc::new(MarketContextFeed::new());
        let locks = Arc::new(AccountLocks::new());

        let ledger = Arc::new(Ledger::new(store.clone(), locks.clone(), notifier.clone()));
        let tracker = Arc::new(PositionTracker::new(
            store.clone(),
            locks,
            ledger.clone(),
            registry.clone(),
            credentials.clone(),
            config.commission.clone(),
            notifier.clone(),
        ));
        let fanout = Arc::new(FanoutEngine::new(
            store.clone(),
            registry,
            credentials,
            tracker.clone(),
            notifier.clone(),
            config.order.clone(),
            config.fanout.clone(),
        ));
        let pipeline = SignalPipeline::new(
            SignalNormalizer::new(store.clone()),
            Arc::new(SignalClassifier::new(store.clone(), metrics, config.classifier.clone())),
            DecisionEngine::new(judgment, market.clone(), store.clone(), config.decision.timeout),
            EligibilityResolver::new(store.clone(), &config.pipeline.ledger_currency),
            fanout,
            store.clone(),
            notifier.clone(),
            config.pipeline.clone(),
        );

        Arc::new(Self {
            api_key: config.api_key.clone(),
            store,
            pipeline,
            market,
            tracker,
            ledger,
            notifier,
            started_at: Utc::now(),
        })
    }
}

// ─── Wiring from config ───────────────────────────────────────────────────────

async fn build_store(config: &Config) -> anyhow::Result<Arc<dyn Store>> {
    match &config.database_url {
        #[cfg(feature = "postgres")]
        Some(url) => {
            let store = crate::store::postgres::PgStore::connect(url).await?;
            info!("🐘 Using PostgreSQL store");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => {
            warn!("DATABASE_URL is set but the binary was built without `postgres` — using memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
        None => {
            info!("🧠 Using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

pub async fn build_state(config: &Config) -> anyhow::Result<SharedState> {
    let http = reqwest::Client::builder()
        .timeout(config.venues.request_timeout)
        .build()?;

    let store = build_store(config).await?;

    let registry = ExchangeRegistry::new()
        .with(Arc::new(BinanceAdapter::new(http.clone(), &config.venues, config.read_retry.clone())))
        .with(Arc::new(OkxAdapter::new(http.clone(), &config.venues, config.read_retry.clone())))
        .with(Arc::new(PaperAdapter::new(config.venues.paper_balance)));

    let credentials: Arc<dyn CredentialResolver> = match &config.credentials_url {
        Some(url) => {
            info!(url = %url, "🔑 Using credential service");
            Arc::new(HttpCredentialResolver::new(http.clone(), url, config.credentials_token.clone()))
        }
        None => {
            warn!("CREDENTIALS_URL not set — only paper accounts can trade");
            Arc::new(StaticCredentialResolver::new())
        }
    };

    let judgment: Arc<dyn JudgmentService> = match &config.decision.api_key {
        Some(key) => {
            info!(provider = %config.decision.provider, model = %config.decision.model, "🧠 Reasoning service configured");
            Arc::new(LlmJudgmentService::new(http, &config.decision, key.clone()))
        }
        None => {
            warn!("AI_API_KEY not set — every judgment call will fail closed");
            Arc::new(UnavailableJudgmentService)
        }
    };

    Ok(AppState::assemble(
        config,
        Components {
            store,
            registry,
            credentials,
            judgment,
            metrics: Arc::new(AtomicClassifierMetrics::default()),
        },
    ))
}
