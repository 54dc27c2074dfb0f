//! Gateway method handlers.

use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pixelwall_canvas::{Canvas, CanvasError, Point};
use pixelwall_core::protocol::GatewayFrame;
use pixelwall_core::types::Participant;

use crate::connection::Session;
use crate::error::CoordinatorError;
use crate::events::spawn_forwarder;
use crate::group::{GroupKind, GroupSpec, PaintOutcome};
use crate::state::GatewayState;

/// Method names advertised in the hello frame.
pub const METHODS: &[&str] = &[
    "groups.list",
    "group.create",
    "group.join",
    "group.leave",
    "group.paint",
    "group.stroke",
    "group.members",
    "group.contributors",
    "group.background",
    "group.message",
    "group.timeouts",
    "group.enable",
    "group.disable",
    "group.clear",
    "group.export",
    "group.remove",
];

const DEFAULT_BACKGROUND: &str = "#FFFFFF";
const MAX_MESSAGE_LEN: usize = 500;

#[derive(Debug, Deserialize)]
struct GroupParams {
    group: String,
}

#[derive(Debug, Deserialize)]
struct CreateParams {
    group: String,
    width: Option<u32>,
    height: Option<u32>,
    layers: Option<usize>,
    background_color: Option<String>,
    /// Uploaded drawing indexed `[layer][x][y]`.
    cells: Option<Vec<Vec<Vec<String>>>>,
    #[serde(default)]
    contributors: Vec<Participant>,
}

#[derive(Debug, Deserialize)]
struct PaintParams {
    group: String,
    #[serde(default)]
    layer: usize,
    x: i64,
    y: i64,
    color: String,
}

#[derive(Debug, Deserialize)]
struct StrokeParams {
    group: String,
    #[serde(default)]
    layer: usize,
    color: String,
    points: Vec<Point>,
}

#[derive(Debug, Deserialize)]
struct BackgroundParams {
    group: String,
    color: String,
}

#[derive(Debug, Deserialize)]
struct MessageParams {
    group: String,
    text: String,
}

#[derive(Debug, Deserialize)]
struct ExportParams {
    group: String,
    title: String,
    #[serde(default = "default_public")]
    is_public: bool,
}

fn default_public() -> bool {
    true
}

/// Dispatch a method request and return the response frame.
pub async fn dispatch_method(
    state: &Arc<GatewayState>,
    session: &mut Session,
    request_id: &str,
    method: &str,
    params: Option<serde_json::Value>,
) -> GatewayFrame {
    debug!(conn_id = %session.conn_id, method, "Dispatching method");

    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    let response = dispatch_method_inner(state, session, request_id, method, params).await;

    #[cfg(feature = "metrics")]
    crate::metrics::record_request(method, start.elapsed().as_secs_f64());

    response
}

async fn dispatch_method_inner(
    state: &Arc<GatewayState>,
    session: &mut Session,
    request_id: &str,
    method: &str,
    params: Option<serde_json::Value>,
) -> GatewayFrame {
    match method {
        "groups.list" => handle_groups_list(state, request_id).await,
        "group.create" => handle_create(state, session, request_id, params).await,
        "group.join" => handle_join(state, session, request_id, params).await,
        "group.leave" => handle_leave(state, session, request_id, params).await,
        "group.paint" => handle_paint(state, session, request_id, params).await,
        "group.stroke" => handle_stroke(state, session, request_id, params).await,
        "group.members" => handle_members(state, request_id, params).await,
        "group.contributors" => handle_contributors(state, request_id, params).await,
        "group.background" => handle_background(state, session, request_id, params).await,
        "group.message" => handle_message(state, session, request_id, params).await,
        "group.timeouts" => handle_timeouts(state, session, request_id, params).await,
        "group.enable" | "group.disable" | "group.clear" | "group.export" | "group.remove"
            if !session.participant.is_admin =>
        {
            warn!(conn_id = %session.conn_id, method, "Admin method refused");
            error_response(request_id, "forbidden", &format!("{method} requires an admin"))
        }
        "group.enable" => handle_set_enabled(state, request_id, params, true).await,
        "group.disable" => handle_set_enabled(state, request_id, params, false).await,
        "group.clear" => handle_clear(state, request_id, params).await,
        "group.export" => handle_export(state, session, request_id, params).await,
        "group.remove" => handle_remove(state, session, request_id, params).await,
        _ => error_response(
            request_id,
            "method_not_found",
            &format!("Unknown method: {method}"),
        ),
    }
}

fn parse_params<T: DeserializeOwned>(params: Option<serde_json::Value>) -> Result<T, String> {
    serde_json::from_value(params.unwrap_or_default()).map_err(|e| e.to_string())
}

// ============================================================
// Discovery
// ============================================================

async fn handle_groups_list(state: &Arc<GatewayState>, request_id: &str) -> GatewayFrame {
    let groups = state.registry.list_group_summaries().await;
    ok_response(request_id, json!({ "groups": groups }))
}

async fn handle_members(
    state: &Arc<GatewayState>,
    request_id: &str,
    params: Option<serde_json::Value>,
) -> GatewayFrame {
    let params: GroupParams = match parse_params(params) {
        Ok(p) => p,
        Err(e) => return error_response(request_id, "invalid_params", &e),
    };
    match state.registry.members(&params.group).await {
        Ok(members) => ok_response(request_id, json!({ "members": members })),
        Err(e) => coordinator_error(request_id, &e),
    }
}

async fn handle_contributors(
    state: &Arc<GatewayState>,
    request_id: &str,
    params: Option<serde_json::Value>,
) -> GatewayFrame {
    let params: GroupParams = match parse_params(params) {
        Ok(p) => p,
        Err(e) => return error_response(request_id, "invalid_params", &e),
    };
    match state.registry.contributors(&params.group).await {
        Ok(contributors) => ok_response(request_id, json!({ "contributors": contributors })),
        Err(e) => coordinator_error(request_id, &e),
    }
}

// ============================================================
// Membership
// ============================================================

/// Join `group` and start forwarding its events to this connection.
async fn join_group(
    state: &Arc<GatewayState>,
    session: &mut Session,
    group: &str,
) -> Result<serde_json::Value, CoordinatorError> {
    let joined = state
        .registry
        .add_connection(&session.conn_id, &session.participant, group)
        .await?;
    if let Some(previous) = &joined.left {
        session.untrack(previous);
    }

    if joined.newly_joined || !session.is_tracking(group) {
        let cancel = CancellationToken::new();
        spawn_forwarder(
            state.registry.clone(),
            group.to_string(),
            joined.events,
            session.event_tx.clone(),
            cancel.clone(),
            joined.seq,
        );
        session.track(group, cancel);
    }

    let window = state
        .registry
        .time_remaining(group, session.participant.id, Utc::now())
        .await?;
    Ok(json!({
        "group": group,
        "seq": joined.seq,
        "sync": joined.sync,
        "window": window,
    }))
}

async fn handle_join(
    state: &Arc<GatewayState>,
    session: &mut Session,
    request_id: &str,
    params: Option<serde_json::Value>,
) -> GatewayFrame {
    let params: GroupParams = match parse_params(params) {
        Ok(p) => p,
        Err(e) => return error_response(request_id, "invalid_params", &e),
    };
    match join_group(state, session, &params.group).await {
        Ok(payload) => ok_response(request_id, payload),
        Err(e) => coordinator_error(request_id, &e),
    }
}

async fn handle_create(
    state: &Arc<GatewayState>,
    session: &mut Session,
    request_id: &str,
    params: Option<serde_json::Value>,
) -> GatewayFrame {
    let params: CreateParams = match parse_params(params) {
        Ok(p) => p,
        Err(e) => return error_response(request_id, "invalid_params", &e),
    };
    let limits = state.config.groups();

    let background = params
        .background_color
        .unwrap_or_else(|| DEFAULT_BACKGROUND.to_string());
    let width = params.width.unwrap_or(limits.default_width);
    let height = params.height.unwrap_or(limits.default_height);
    let layers = params
        .cells
        .as_ref()
        .map(Vec::len)
        .or(params.layers)
        .unwrap_or(1);

    if width > limits.max_dimension || height > limits.max_dimension {
        return error_response(
            request_id,
            "invalid_canvas",
            &format!("Canvas may be at most {0}x{0}", limits.max_dimension),
        );
    }
    if layers > limits.max_layers {
        return error_response(
            request_id,
            "invalid_canvas",
            &format!("Canvas may have at most {} layers", limits.max_layers),
        );
    }
    let cells = u64::from(width) * u64::from(height) * layers as u64;
    if cells > limits.max_cells {
        return error_response(
            request_id,
            "invalid_canvas",
            &format!("Canvas may have at most {} cells, got {cells}", limits.max_cells),
        );
    }

    let canvas = match &params.cells {
        Some(cells) => Canvas::layered_from_cells(width, height, cells, background),
        None => Canvas::layered(width, height, layers, background),
    };
    let canvas = match canvas {
        Ok(c) => c,
        Err(e) => return coordinator_error(request_id, &CoordinatorError::from(e)),
    };

    let spec = GroupSpec {
        canvas,
        kind: GroupKind::AdHoc,
        rate_limit: limits.rate_limit,
        contributors: params.contributors,
    };
    if let Err(e) = state.registry.create_group(&params.group, spec).await {
        return coordinator_error(request_id, &e);
    }
    info!(conn_id = %session.conn_id, group = %params.group, "Group created by client");

    // The creator joins straight away.
    match join_group(state, session, &params.group).await {
        Ok(payload) => ok_response(request_id, payload),
        Err(e) => coordinator_error(request_id, &e),
    }
}

async fn handle_leave(
    state: &Arc<GatewayState>,
    session: &mut Session,
    request_id: &str,
    params: Option<serde_json::Value>,
) -> GatewayFrame {
    let params: GroupParams = match parse_params(params) {
        Ok(p) => p,
        Err(e) => return error_response(request_id, "invalid_params", &e),
    };
    match state
        .registry
        .remove_connection(&session.conn_id, &params.group)
        .await
    {
        Ok(_) => {
            session.untrack(&params.group);
            ok_response(request_id, json!({ "left": params.group }))
        }
        Err(e) => coordinator_error(request_id, &e),
    }
}

// ============================================================
// Painting
// ============================================================

/// Paint rejections are answered to the caller only, as a normal response.
fn paint_response(request_id: &str, result: Result<PaintOutcome, CoordinatorError>) -> GatewayFrame {
    match result {
        Ok(outcome) => {
            #[cfg(feature = "metrics")]
            crate::metrics::record_paint(outcome.reason().unwrap_or("applied"));

            let mut payload = json!({
                "applied": outcome.applied(),
                "window": outcome.window(),
            });
            if let Some(reason) = outcome.reason() {
                payload["reason"] = json!(reason);
            }
            ok_response(request_id, payload)
        }
        Err(
            e @ (CoordinatorError::Disabled(_)
            | CoordinatorError::Canvas(
                CanvasError::OutOfBounds { .. } | CanvasError::LayerOutOfBounds { .. },
            )),
        ) => {
            #[cfg(feature = "metrics")]
            crate::metrics::record_paint(e.code());

            ok_response(
                request_id,
                json!({
                    "applied": false,
                    "reason": e.code(),
                    "message": e.to_string(),
                    "window": [],
                }),
            )
        }
        Err(e) => coordinator_error(request_id, &e),
    }
}

async fn handle_paint(
    state: &Arc<GatewayState>,
    session: &mut Session,
    request_id: &str,
    params: Option<serde_json::Value>,
) -> GatewayFrame {
    let params: PaintParams = match parse_params(params) {
        Ok(p) => p,
        Err(e) => return error_response(request_id, "invalid_params", &e),
    };
    let result = state
        .registry
        .paint(
            &session.conn_id,
            &params.group,
            params.layer,
            params.x,
            params.y,
            &params.color,
            Utc::now(),
        )
        .await;
    paint_response(request_id, result)
}

async fn handle_stroke(
    state: &Arc<GatewayState>,
    session: &mut Session,
    request_id: &str,
    params: Option<serde_json::Value>,
) -> GatewayFrame {
    let params: StrokeParams = match parse_params(params) {
        Ok(p) => p,
        Err(e) => return error_response(request_id, "invalid_params", &e),
    };
    let result = state
        .registry
        .paint_stroke(
            &session.conn_id,
            &params.group,
            params.layer,
            &params.color,
            &params.points,
            Utc::now(),
        )
        .await;
    paint_response(request_id, result)
}

async fn handle_timeouts(
    state: &Arc<GatewayState>,
    session: &mut Session,
    request_id: &str,
    params: Option<serde_json::Value>,
) -> GatewayFrame {
    let params: GroupParams = match parse_params(params) {
        Ok(p) => p,
        Err(e) => return error_response(request_id, "invalid_params", &e),
    };
    match state
        .registry
        .time_remaining(&params.group, session.participant.id, Utc::now())
        .await
    {
        Ok(window) => ok_response(request_id, json!({ "window": window })),
        Err(e) => coordinator_error(request_id, &e),
    }
}

// ============================================================
// Member actions
// ============================================================

async fn handle_background(
    state: &Arc<GatewayState>,
    session: &mut Session,
    request_id: &str,
    params: Option<serde_json::Value>,
) -> GatewayFrame {
    let params: BackgroundParams = match parse_params(params) {
        Ok(p) => p,
        Err(e) => return error_response(request_id, "invalid_params", &e),
    };
    let result = match state.registry.member_group(&session.conn_id, &params.group).await {
        Ok((_, group)) => group.lock().await.set_background(&params.color),
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => ok_response(request_id, json!({ "color": params.color })),
        Err(e) => coordinator_error(request_id, &e),
    }
}

async fn handle_message(
    state: &Arc<GatewayState>,
    session: &mut Session,
    request_id: &str,
    params: Option<serde_json::Value>,
) -> GatewayFrame {
    let params: MessageParams = match parse_params(params) {
        Ok(p) => p,
        Err(e) => return error_response(request_id, "invalid_params", &e),
    };
    let text = params.text.trim();
    if text.is_empty() || text.chars().count() > MAX_MESSAGE_LEN {
        return error_response(
            request_id,
            "invalid_params",
            &format!("Message must be 1-{MAX_MESSAGE_LEN} characters"),
        );
    }
    match state.registry.member_group(&session.conn_id, &params.group).await {
        Ok((participant, group)) => {
            let seq = group.lock().await.relay_message(&participant, text);
            ok_response(request_id, json!({ "seq": seq }))
        }
        Err(e) => coordinator_error(request_id, &e),
    }
}

// ============================================================
// Admin
// ============================================================

async fn handle_set_enabled(
    state: &Arc<GatewayState>,
    request_id: &str,
    params: Option<serde_json::Value>,
    enabled: bool,
) -> GatewayFrame {
    let params: GroupParams = match parse_params(params) {
        Ok(p) => p,
        Err(e) => return error_response(request_id, "invalid_params", &e),
    };
    let group = match state.registry.get_group(&params.group).await {
        Ok(g) => g,
        Err(e) => return coordinator_error(request_id, &e),
    };
    let changed = {
        let mut group = group.lock().await;
        if enabled { group.enable() } else { group.disable() }
    };
    info!(group = %params.group, enabled, changed, "Group state toggled");
    ok_response(request_id, json!({ "enabled": enabled, "changed": changed }))
}

async fn handle_clear(
    state: &Arc<GatewayState>,
    request_id: &str,
    params: Option<serde_json::Value>,
) -> GatewayFrame {
    let params: GroupParams = match parse_params(params) {
        Ok(p) => p,
        Err(e) => return error_response(request_id, "invalid_params", &e),
    };
    match state.registry.get_group(&params.group).await {
        Ok(group) => {
            group.lock().await.clear();
            ok_response(request_id, json!({ "cleared": params.group }))
        }
        Err(e) => coordinator_error(request_id, &e),
    }
}

/// Persist the canvas, then reset it.
///
/// Painting is paused while the store runs. The canvas is only cleared if it
/// is still exactly what was saved; a failed save leaves it as is.
async fn handle_export(
    state: &Arc<GatewayState>,
    session: &mut Session,
    request_id: &str,
    params: Option<serde_json::Value>,
) -> GatewayFrame {
    let params: ExportParams = match parse_params(params) {
        Ok(p) => p,
        Err(e) => return error_response(request_id, "invalid_params", &e),
    };
    let group = match state.registry.get_group(&params.group).await {
        Ok(g) => g,
        Err(e) => return coordinator_error(request_id, &e),
    };

    let (request, revision, paused) = {
        let mut locked = group.lock().await;
        let request = match locked.export_as_artwork(
            &params.title,
            &session.participant,
            params.is_public,
            Utc::now(),
        ) {
            Ok(r) => r,
            Err(e) => return coordinator_error(request_id, &e),
        };
        let paused = locked.disable();
        (request, locked.revision(), paused)
    };

    let saved = state.artworks.save(&request).await;

    let cleared = {
        let mut locked = group.lock().await;
        let cleared = saved.is_ok() && locked.revision() == revision;
        if cleared {
            locked.clear();
        }
        if paused {
            locked.enable();
        }
        cleared
    };

    match saved {
        Ok(artwork_id) => {
            if cleared {
                info!(group = %params.group, artwork_id = %artwork_id, "Artwork exported");
            } else {
                warn!(group = %params.group, artwork_id = %artwork_id, "Canvas changed during export, not cleared");
            }
            ok_response(
                request_id,
                json!({ "artwork_id": artwork_id, "cleared": cleared }),
            )
        }
        Err(e) => {
            warn!(group = %params.group, %e, "Artwork export failed");
            #[cfg(feature = "metrics")]
            crate::metrics::record_error("persistence_error");
            error_response(request_id, "persistence_error", &e.to_string())
        }
    }
}

async fn handle_remove(
    state: &Arc<GatewayState>,
    session: &mut Session,
    request_id: &str,
    params: Option<serde_json::Value>,
) -> GatewayFrame {
    let params: GroupParams = match parse_params(params) {
        Ok(p) => p,
        Err(e) => return error_response(request_id, "invalid_params", &e),
    };
    match state.registry.remove_group(&params.group).await {
        Ok(evicted) => {
            session.untrack(&params.group);
            ok_response(
                request_id,
                json!({ "removed": params.group, "evicted": evicted.len() }),
            )
        }
        Err(e) => coordinator_error(request_id, &e),
    }
}

// ============================================================
// Helpers
// ============================================================

fn ok_response(id: &str, payload: serde_json::Value) -> GatewayFrame {
    GatewayFrame::ok(id, payload)
}

fn error_response(id: &str, code: &str, message: &str) -> GatewayFrame {
    GatewayFrame::error(id, code, message)
}

fn coordinator_error(id: &str, error: &CoordinatorError) -> GatewayFrame {
    #[cfg(feature = "metrics")]
    crate::metrics::record_error(error.code());
    error_response(id, error.code(), &error.to_string())
}
