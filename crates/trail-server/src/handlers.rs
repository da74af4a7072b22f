//! RPC method handlers, one per facade query.

use std::sync::Arc;

use serde_json::json;
use trail_core::ids::{SessionId, TabId};
use trail_engine::{MetadataUpdate, Trail};
use trail_telemetry::TelemetryGuard;

use crate::compat;
use crate::rpc::{self, RpcResponse};

const DEFAULT_VISIT_LIMIT: u32 = 50;
const DEFAULT_SESSION_LIMIT: u32 = 50;
const DEFAULT_TAG_LIMIT: u32 = 100;
const DEFAULT_SEARCH_LIMIT: u32 = 50;
const DEFAULT_LOG_LIMIT: u32 = 100;

/// Shared state available to all RPC handlers.
pub struct HandlerState {
    pub trail: Arc<Trail>,
    pub telemetry: Option<Arc<TelemetryGuard>>,
}

impl HandlerState {
    pub fn new(trail: Arc<Trail>) -> Self {
        Self {
            trail,
            telemetry: None,
        }
    }

    pub fn with_telemetry(trail: Arc<Trail>, telemetry: Arc<TelemetryGuard>) -> Self {
        Self {
            trail,
            telemetry: Some(telemetry),
        }
    }
}

/// Dispatch an RPC method to its handler.
///
/// Params are normalized to snake_case before routing.
pub fn dispatch(
    state: &HandlerState,
    method: &str,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let params = compat::normalize_params(params);

    match method {
        // Objects
        "object.get" => object_get(state, &params, id),
        "object.relationships" => object_relationships(state, &params, id),
        "object.updateMetadata" => object_update_metadata(state, &params, id),
        "object.visits" => object_visits(state, &params, id),

        // Sessions
        "session.objects" => session_objects(state, &params, id),
        "session.markSaved" => session_mark_saved(state, &params, id),
        "session.rename" => session_rename(state, &params, id),
        "session.list" => session_list(state, &params, id),

        "state.current" => state_current(state, id),
        "tags.list" => tags_list(state, &params, id),
        "tabs.search" => tabs_search(state, &params, id),
        "diagnostics.recent" => diagnostics_recent(state, &params, id),
        "logging.setLevel" => logging_set_level(state, &params, id),
        "logging.levels" => logging_levels(state, id),
        "health" | "system.ping" => health(state, id),

        _ => RpcResponse::method_not_found(id, method),
    }
}

/// `id` or `object_id`, whichever the caller sent.
fn object_id_param(params: &serde_json::Value) -> Result<&str, String> {
    rpc::optional_str(params, "object_id")
        .or_else(|| rpc::optional_str(params, "id"))
        .ok_or_else(|| "Missing required parameter: id".to_string())
}

fn tab_id_param(params: &serde_json::Value) -> Result<TabId, String> {
    let raw = rpc::require_str(params, "tab_id")?;
    if !TabId::matches(raw) {
        return Err(format!("not a tab id: {raw}"));
    }
    Ok(TabId::from_raw(raw))
}

fn session_id_param(params: &serde_json::Value) -> Result<SessionId, String> {
    let raw = rpc::require_str(params, "session_id")?;
    if !SessionId::matches(raw) {
        return Err(format!("not a session id: {raw}"));
    }
    Ok(SessionId::from_raw(raw))
}

fn object_get(state: &HandlerState, params: &serde_json::Value, id: Option<serde_json::Value>) -> RpcResponse {
    let object_id = match object_id_param(params) {
        Ok(v) => v,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.trail.get_object(object_id) {
        Ok(Some(object)) => RpcResponse::from_value(id, &object),
        Ok(None) => RpcResponse::not_found(id, format!("object {object_id}")),
        Err(e) => RpcResponse::from_engine(id, &e),
    }
}

fn object_relationships(
    state: &HandlerState,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let tab_id = match tab_id_param(params) {
        Ok(v) => v,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.trail.get_all_relationships(&tab_id) {
        Ok(relationships) => RpcResponse::from_value(id, &relationships),
        Err(e) => RpcResponse::from_engine(id, &e),
    }
}

fn object_update_metadata(
    state: &HandlerState,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let object_id = match object_id_param(params) {
        Ok(v) => v,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let update: MetadataUpdate = match serde_json::from_value(params.clone()) {
        Ok(u) => u,
        Err(e) => return RpcResponse::invalid_params(id, e.to_string()),
    };
    match state.trail.update_metadata(object_id, update) {
        Ok(object) => RpcResponse::from_value(id, &object),
        Err(e) => RpcResponse::from_engine(id, &e),
    }
}

fn object_visits(state: &HandlerState, params: &serde_json::Value, id: Option<serde_json::Value>) -> RpcResponse {
    let tab_id = match tab_id_param(params) {
        Ok(v) => v,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let limit = rpc::optional_u32(params, "limit").unwrap_or(DEFAULT_VISIT_LIMIT);
    match state.trail.get_visit_history(&tab_id, limit) {
        Ok(visits) => RpcResponse::success(id, json!({ "visits": visits })),
        Err(e) => RpcResponse::from_engine(id, &e),
    }
}

fn session_objects(state: &HandlerState, params: &serde_json::Value, id: Option<serde_json::Value>) -> RpcResponse {
    let session_id = match session_id_param(params) {
        Ok(v) => v,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.trail.get_objects_in_session(&session_id) {
        Ok(objects) => RpcResponse::success(id, json!({ "objects": objects })),
        Err(e) => RpcResponse::from_engine(id, &e),
    }
}

fn session_mark_saved(
    state: &HandlerState,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let session_id = match session_id_param(params) {
        Ok(v) => v,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.trail.mark_saved(&session_id) {
        Ok(()) => RpcResponse::success(id, json!({ "saved": true })),
        Err(e) => RpcResponse::from_engine(id, &e),
    }
}

/// `name: null` or a blank name clears it.
fn session_rename(state: &HandlerState, params: &serde_json::Value, id: Option<serde_json::Value>) -> RpcResponse {
    let session_id = match session_id_param(params) {
        Ok(v) => v,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let name = rpc::optional_str(params, "name");
    match state.trail.rename_session(&session_id, name) {
        Ok(()) => RpcResponse::success(id, json!({ "renamed": true })),
        Err(e) => RpcResponse::from_engine(id, &e),
    }
}

fn session_list(state: &HandlerState, params: &serde_json::Value, id: Option<serde_json::Value>) -> RpcResponse {
    let limit = rpc::optional_u32(params, "limit").unwrap_or(DEFAULT_SESSION_LIMIT);
    let offset = rpc::optional_u32(params, "offset").unwrap_or(0);
    match state.trail.list_sessions(limit, offset) {
        Ok(sessions) => RpcResponse::success(id, json!({ "sessions": sessions })),
        Err(e) => RpcResponse::from_engine(id, &e),
    }
}

fn state_current(state: &HandlerState, id: Option<serde_json::Value>) -> RpcResponse {
    let trail = &state.trail;
    let session = match trail.current_session_id() {
        Some(session_id) => match trail.get_session(&session_id) {
            Ok(s) => Some(s),
            Err(e) => return RpcResponse::from_engine(id, &e),
        },
        None => None,
    };
    RpcResponse::success(
        id,
        json!({
            "session": session,
            "activeTabId": trail.active_object_id(),
            "activeWindowId": trail.active_window_id(),
        }),
    )
}

fn tags_list(state: &HandlerState, params: &serde_json::Value, id: Option<serde_json::Value>) -> RpcResponse {
    let limit = rpc::optional_u32(params, "limit").unwrap_or(DEFAULT_TAG_LIMIT);
    match state.trail.list_tags(limit) {
        Ok(tags) => RpcResponse::success(id, json!({ "tags": tags })),
        Err(e) => RpcResponse::from_engine(id, &e),
    }
}

fn tabs_search(state: &HandlerState, params: &serde_json::Value, id: Option<serde_json::Value>) -> RpcResponse {
    let query = match rpc::require_str(params, "query") {
        Ok(q) => q,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let limit = rpc::optional_u32(params, "limit").unwrap_or(DEFAULT_SEARCH_LIMIT);
    match state.trail.search_tabs(query, limit) {
        Ok(tabs) => RpcResponse::success(id, json!({ "tabs": tabs })),
        Err(e) => RpcResponse::from_engine(id, &e),
    }
}

/// Recent warn+ log records. Empty when telemetry was not initialized.
fn diagnostics_recent(
    state: &HandlerState,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let level = rpc::optional_str(params, "level");
    let limit = rpc::optional_u32(params, "limit").unwrap_or(DEFAULT_LOG_LIMIT) as usize;
    let records = state
        .telemetry
        .as_ref()
        .map(|t| t.recent().query(level, limit))
        .unwrap_or_default();
    RpcResponse::success(id, json!({ "records": records }))
}

fn logging_set_level(
    state: &HandlerState,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let Some(telemetry) = &state.telemetry else {
        return RpcResponse::internal_error(id, "telemetry not initialized");
    };
    let module = match rpc::require_str(params, "module") {
        Ok(m) => m,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let level: tracing::Level = match rpc::require_str(params, "level").map(str::parse) {
        Ok(Ok(l)) => l,
        Ok(Err(_)) => return RpcResponse::invalid_params(id, "level must be one of trace, debug, info, warn, error"),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    telemetry.set_module_level(module, level);
    logging_levels(state, id)
}

fn logging_levels(state: &HandlerState, id: Option<serde_json::Value>) -> RpcResponse {
    let levels: serde_json::Map<String, serde_json::Value> = state
        .telemetry
        .as_ref()
        .map(|t| t.module_levels())
        .unwrap_or_default()
        .into_iter()
        .map(|(module, level)| (module, json!(level.to_string().to_lowercase())))
        .collect();
    RpcResponse::success(id, json!({ "levels": levels }))
}

fn health(state: &HandlerState, id: Option<serde_json::Value>) -> RpcResponse {
    let ctx = state.trail.context();
    let (status, store) = match ctx.db.probe() {
        Ok(()) => ("healthy", "ok".to_string()),
        Err(e) => ("degraded", e.to_string()),
    };
    RpcResponse::success(
        id,
        json!({
            "status": status,
            "store": store,
            "sessionId": state.trail.current_session_id(),
            "pendingWrites": ctx.queue.pending_len(),
            "pendingUpdates": state.trail.pending_updates(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use trail_core::clock::ManualClock;
    use trail_core::events::{LiveSnapshot, TabSnapshot, WindowSnapshot};
    use trail_core::model::WindowKind;
    use trail_engine::TrailSettings;
    use trail_store::Database;

    async fn state() -> HandlerState {
        let trail = Trail::with_database(
            TrailSettings::default(),
            Database::in_memory().unwrap(),
            Arc::new(ManualClock::at_epoch_millis(1_700_000_000_000)),
            None,
        );
        let snapshot = LiveSnapshot {
            windows: vec![WindowSnapshot {
                volatile_id: 1,
                kind: WindowKind::Normal,
                focused: true,
                tabs: vec![TabSnapshot {
                    volatile_id: 10,
                    window_volatile_id: 1,
                    url: "https://rust-lang.org/learn".into(),
                    title: "Learn Rust".into(),
                    active: true,
                    ..Default::default()
                }],
            }],
        };
        trail.reconcile(&snapshot).await.unwrap();
        HandlerState::new(Arc::new(trail))
    }

    fn tab_id(state: &HandlerState) -> String {
        state.trail.context().resolve_tab(10).unwrap().unwrap().to_string()
    }

    fn ok(resp: RpcResponse) -> serde_json::Value {
        assert!(resp.success, "{:?}", resp.error);
        resp.result.unwrap()
    }

    fn err_code(resp: RpcResponse) -> String {
        assert!(!resp.success);
        resp.error.unwrap().code
    }

    #[tokio::test]
    async fn object_get_accepts_camel_case_id() {
        let state = state().await;
        let id = tab_id(&state);
        let result = ok(dispatch(&state, "object.get", &json!({"objectId": id}), Some(json!(1))));
        assert_eq!(result["object"], "tab");
        assert_eq!(result["id"], id);
    }

    #[tokio::test]
    async fn object_get_unknown_and_malformed() {
        let state = state().await;
        let missing = TabId::new().to_string();
        let resp = dispatch(&state, "object.get", &json!({"id": missing}), None);
        assert_eq!(err_code(resp), "NOT_FOUND");
        let resp = dispatch(&state, "object.get", &json!({"id": "garbage"}), None);
        assert_eq!(err_code(resp), "INVALID_PARAMS");
        let resp = dispatch(&state, "object.get", &json!({}), None);
        assert_eq!(err_code(resp), "INVALID_PARAMS");
    }

    #[tokio::test]
    async fn update_metadata_then_list_tags() {
        let state = state().await;
        let id = tab_id(&state);
        let result = ok(dispatch(
            &state,
            "object.updateMetadata",
            &json!({"id": id, "tags": [" work ", "work", "read"], "notes": "later"}),
            None,
        ));
        assert_eq!(result["tags"], json!(["work", "read"]));

        let tags = ok(dispatch(&state, "tags.list", &json!({}), None));
        assert_eq!(tags["tags"].as_array().unwrap().len(), 2);

        // notes: null clears; tags untouched when absent
        let result = ok(dispatch(&state, "object.updateMetadata", &json!({"id": id, "notes": null}), None));
        assert!(result["notes"].is_null());
        assert_eq!(result["tags"], json!(["work", "read"]));
    }

    #[tokio::test]
    async fn session_round_trip() {
        let state = state().await;
        let current = ok(dispatch(&state, "state.current", &json!({}), None));
        let session_id = current["session"]["id"].as_str().unwrap().to_string();
        assert_eq!(current["activeTabId"], tab_id(&state));

        ok(dispatch(&state, "session.rename", &json!({"sessionId": session_id, "name": "Research"}), None));
        ok(dispatch(&state, "session.markSaved", &json!({"sessionId": session_id}), None));
        let listed = ok(dispatch(&state, "session.list", &json!({"limit": 10}), None));
        assert_eq!(listed["sessions"][0]["name"], "Research");

        let objects = ok(dispatch(&state, "session.objects", &json!({"session_id": session_id}), None));
        assert_eq!(objects["objects"].as_array().unwrap().len(), 2);

        let missing = SessionId::new().to_string();
        let resp = dispatch(&state, "session.markSaved", &json!({"sessionId": missing}), None);
        assert_eq!(err_code(resp), "NOT_FOUND");
    }

    #[tokio::test]
    async fn visits_relationships_and_search() {
        let state = state().await;
        let id = tab_id(&state);
        let visits = ok(dispatch(&state, "object.visits", &json!({"tabId": id}), None));
        assert_eq!(visits["visits"].as_array().unwrap().len(), 1);

        ok(dispatch(&state, "object.relationships", &json!({"tabId": id}), None));

        let found = ok(dispatch(&state, "tabs.search", &json!({"query": "learn"}), None));
        assert_eq!(found["tabs"].as_array().unwrap().len(), 1);
        let resp = dispatch(&state, "tabs.search", &json!({"query": "  "}), None);
        assert_eq!(err_code(resp), "INVALID_PARAMS");
    }

    #[tokio::test]
    async fn health_and_unknown_method() {
        let state = state().await;
        let result = ok(dispatch(&state, "health", &json!({}), Some(json!("h"))));
        assert_eq!(result["status"], "healthy");

        let records = ok(dispatch(&state, "diagnostics.recent", &json!({}), None));
        assert_eq!(records["records"], json!([]));

        let levels = ok(dispatch(&state, "logging.levels", &json!({}), None));
        assert_eq!(levels["levels"], json!({}));
        let resp = dispatch(&state, "logging.setLevel", &json!({"module": "trail_engine", "level": "debug"}), None);
        assert_eq!(err_code(resp), "INTERNAL_ERROR");

        let resp = dispatch(&state, "nope.nothing", &json!({}), None);
        assert_eq!(err_code(resp), "METHOD_NOT_FOUND");
    }
}
