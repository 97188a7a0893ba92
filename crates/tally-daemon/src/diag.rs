//! Diagnostic HTTP surface.
//!
//! Read-only status endpoints plus the one manual trigger, consumed by
//! operational tooling. Nothing here contains reconciliation logic: the
//! resync endpoint funnels into the same [`Scheduler::run_week`] path the
//! timer uses.
//!
//! Routes:
//!
//! - `GET /healthz` - liveness and uptime
//! - `GET /signer` - signer authorization check against the contract
//! - `GET /weeks/{week}/status` - phase, per-player sync rows, last outcome
//! - `POST /weeks/{week}/resync` - run a pass now, bypassing the timer

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Serialize;
use serde_json::json;
use tally_core::chain::ChainClient;
use tally_core::ledger::{PlayerWeekScore, ScoreLedger};
use tally_core::schedule::{Phase, TimeSource};
use tally_core::sync::PassReport;

use crate::scheduler::Scheduler;
use crate::state::SharedState;

/// Everything the diagnostic handlers need.
pub struct DiagContext {
    /// Shared daemon state.
    pub state: SharedState,
    /// Score ledger (read-only access here).
    pub ledger: ScoreLedger,
    /// Chain gateway, for the signer passthrough.
    pub chain: Arc<dyn ChainClient>,
    /// Scheduler, for manual resync triggers.
    pub scheduler: Arc<Scheduler>,
    /// Clock shared with the scheduler.
    pub time: Arc<dyn TimeSource>,
}

/// Builds the diagnostic router.
pub fn router(ctx: Arc<DiagContext>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/signer", get(signer))
        .route("/weeks/{week}/status", get(week_status))
        .route("/weeks/{week}/resync", post(resync))
        .with_state(ctx)
}

#[derive(Debug, Serialize)]
struct WeekStatusResponse {
    week: u64,
    phase: Phase,
    players: Vec<PlayerWeekScore>,
    last_pass: Option<PassReport>,
}

async fn healthz(State(ctx): State<Arc<DiagContext>>) -> Response {
    let uptime = ctx.state.uptime_secs(ctx.time.now());
    axum::Json(json!({ "status": "ok", "uptime_secs": uptime })).into_response()
}

async fn signer(State(ctx): State<Arc<DiagContext>>) -> Response {
    match ctx.chain.verify_signer().await {
        Ok(check) => axum::Json(check).into_response(),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            axum::Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn week_status(
    State(ctx): State<Arc<DiagContext>>,
    Path(week): Path<u64>,
) -> Response {
    let week_row = match ctx.ledger.get_week_async(week).await {
        Ok(Some(row)) => row,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                axum::Json(json!({ "error": format!("unknown week {week}") })),
            )
                .into_response();
        },
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(json!({ "error": e.to_string() })),
            )
                .into_response();
        },
    };

    let players = match ctx.ledger.week_rows_async(week).await {
        Ok(rows) => rows,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(json!({ "error": e.to_string() })),
            )
                .into_response();
        },
    };

    let response = WeekStatusResponse {
        week,
        phase: week_row.phase_at(ctx.time.now()),
        players,
        last_pass: ctx.state.last_report(week).await,
    };
    axum::Json(response).into_response()
}

async fn resync(State(ctx): State<Arc<DiagContext>>, Path(week): Path<u64>) -> Response {
    // Manual triggers wait for the week lock, so the response always
    // reflects a pass that ran after this request arrived.
    match ctx.scheduler.run_week(week, true).await {
        Some(report) => axum::Json(report).into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(json!({ "error": "scheduler did not run the pass" })),
        )
            .into_response(),
    }
}
