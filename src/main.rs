//! # signal-relay — server binary
//!
//! ```text
//!  ┌──────────────┐  POST /api/signals/webhook  ┌──────────────────────────┐
//!  │  Alerting    │ ──────────────────────────▶ │ SignalPipeline           │
//!  │  source      │                             │ ├─ classifier / decision │ ──▶ Binance · OKX · Paper
//!  └──────────────┘                             │ ├─ fan-out               │
//!  ┌──────────────┐  POST /api/market/context   │ ├─ position tracker      │
//!  │  Market feed │ ──────────────────────────▶ │ └─ ledger                │
//!  └──────────────┘  POST /api/positions/mark   └────────────┬─────────────┘
//!  ┌──────────────┐  POST /api/ledger/topup                  │ notifications
//!  │  Payments    │ ─────────────────────────▶               ▼
//!  └──────────────┘                              ws://host/ws/monitor
//! ```
//!
//! ## Environment Variables
//!
//! | Variable          | Default         | Description                          |
//! |-------------------|-----------------|--------------------------------------|
//! | `BIND_ADDR`       | `0.0.0.0:3000`  | Address Axum listens on              |
//! | `API_KEY`         | *(empty)*       | `X-API-Key` for every route but `/health` |
//! | `DATABASE_URL`    | *(none)*        | PostgreSQL (feature `postgres`)      |
//! | `CREDENTIALS_URL` | *(none)*        | Credential service base URL          |
//! | `AI_API_KEY`      | *(none)*        | Reasoning service key; unset = fail closed |
//! | `RUST_LOG`        | `signal_relay=debug` | Tracing filter                  |
//!
//! Everything else is listed on the config structs in `config.rs`.

use std::net::SocketAddr;

use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use signal_relay::config::Config;
use signal_relay::routes::router;
use signal_relay::state::build_state;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Load .env ──────────────────────────────────────────────────────────
    dotenvy::dotenv().ok();

    // ── 2. Structured logging ─────────────────────────────────────────────────
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive("signal_relay=debug".parse()?)
                .add_directive("tower_http=info".parse()?),
        )
        .init();

    info!(r#"

  ╔═══════════════════════════════════════════════════════╗
  ║              SIGNAL RELAY — Fan-Out Core              ║
  ║   Gate · Decide · Fan out · Track · Settle            ║
  ╚═══════════════════════════════════════════════════════╝"#);

    // ── 3. Config + shared state ──────────────────────────────────────────────
    let config = Config::from_env()?;
    let state = build_state(&config).await?;
    if state.api_key.is_none() {
        info!("🔓 API_KEY not set — running in dev mode (no auth)");
    }

    // ── 4. Router ─────────────────────────────────────────────────────────────
    let app = router(state);

    // ── 5. Bind & Serve ───────────────────────────────────────────────────────
    let addr: SocketAddr = config.bind_addr.parse()?;
    info!(?addr, "🚀 Signal relay starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
