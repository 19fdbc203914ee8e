//! Prometheus text exposition over HTTP.
//!
//! `GET /metrics` renders the current store snapshot; anything else gets the
//! router's 404/405. Rendering is a pure function so the format is testable
//! without a listener.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::get;
use tokio_util::sync::CancellationToken;

use crate::config::MetricsMode;
use crate::state::{Status, Store, TargetStatus};

const CONTENT_TYPE_TEXT: &str = "text/plain; version=0.0.4";

#[derive(Clone)]
struct MetricsState {
    mode: MetricsMode,
    store: Arc<Store>,
}

/// Serve `/metrics` on `addr` until cancellation.
///
/// A bind failure is returned to the caller; the entry point treats it as
/// fatal.
pub async fn serve(
    addr: &str,
    mode: MetricsMode,
    store: Arc<Store>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let state = MetricsState { mode, store };
    let app = Router::new()
        .route("/metrics", get(handle_metrics))
        .with_state(state);

    let bind_addr = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("metrics listening on {bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn handle_metrics(State(state): State<MetricsState>) -> impl IntoResponse {
    let body = render_metrics(state.mode, &state.store.snapshot());
    ([(CONTENT_TYPE, CONTENT_TYPE_TEXT)], body)
}

/// Render a snapshot in the exposition format for the given mode.
pub fn render_metrics(mode: MetricsMode, snapshot: &[TargetStatus]) -> String {
    let mut out = String::new();
    match mode {
        MetricsMode::PerTarget => write_per_target(&mut out, snapshot),
        MetricsMode::Aggregated => write_aggregated(&mut out, snapshot),
        MetricsMode::Both => {
            write_aggregated(&mut out, snapshot);
            write_per_target(&mut out, snapshot);
        }
        MetricsMode::Disabled => {}
    }
    out
}

fn write_aggregated(out: &mut String, snapshot: &[TargetStatus]) {
    use std::fmt::Write;

    let mut ok = 0usize;
    let mut warn = 0usize;
    let mut down = 0usize;
    let mut unknown = 0usize;
    for target in snapshot {
        match target.status {
            Status::Ok => ok += 1,
            Status::Warn => warn += 1,
            Status::Down => down += 1,
            Status::Unknown => unknown += 1,
        }
    }

    let _ = writeln!(out, "deadman_targets_total {}", snapshot.len());
    let _ = writeln!(out, "deadman_targets_ok {ok}");
    let _ = writeln!(out, "deadman_targets_warn {warn}");
    let _ = writeln!(out, "deadman_targets_down {down}");
    let _ = writeln!(out, "deadman_targets_unknown {unknown}");
}

fn write_per_target(out: &mut String, snapshot: &[TargetStatus]) {
    use std::fmt::Write;

    // Name order keeps scrape output stable between requests.
    let mut targets: Vec<&TargetStatus> = snapshot.iter().collect();
    targets.sort_by(|a, b| a.name.cmp(&b.name));

    for target in targets {
        let labels = format!(
            "target=\"{}\",address=\"{}\",group=\"{}\"",
            escape_label(&target.name),
            escape_label(&target.address),
            escape_label(&target.group),
        );
        let up = u8::from(target.status == Status::Ok);
        let _ = writeln!(out, "deadman_target_up{{{labels}}} {up}");
        if !target.last_rtt.is_zero() {
            let _ = writeln!(
                out,
                "deadman_target_rtt_ms{{{labels}}} {}",
                target.last_rtt.as_millis()
            );
        }
    }
}

/// Escape a label value per the exposition rules.
fn escape_label(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
