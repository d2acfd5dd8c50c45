use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{State, get, post};
use std::sync::Arc;

use super::TenantAuth;
use crate::config::Config;
use crate::db::Db;
use crate::models::{ClaimRequest, TokenRequest, UnbindRequest};
use crate::pairing::{self, ClaimError, IssueError};
use crate::relay_log::RelayLog;
use crate::route_key::Channel;

type ApiError = (Status, Json<serde_json::Value>);

fn validation(message: &str) -> ApiError {
    (
        Status::BadRequest,
        Json(serde_json::json!({"ok": false, "error": message})),
    )
}

fn internal(message: &str) -> ApiError {
    (
        Status::InternalServerError,
        Json(serde_json::json!({"ok": false, "error": message})),
    )
}

/// Active bindings for the calling tenant, with the session keys mapped to
/// each (dashboards render these next to the tenant's own session ids).
#[get("/v1/pairings")]
pub fn list_pairings(
    db: &State<Db>,
    auth: TenantAuth,
) -> Result<Json<serde_json::Value>, ApiError> {
    let bindings = db
        .list_active_bindings(&auth.0.id)
        .map_err(|e| internal(&e.to_string()))?;
    let mut items = Vec::with_capacity(bindings.len());
    for binding in bindings {
        let session_keys = db
            .session_keys_for_binding(&binding.binding_id)
            .unwrap_or_default();
        items.push(serde_json::json!({
            "bindingId": binding.binding_id,
            "channel": binding.channel,
            "scope": binding.scope,
            "routeKey": binding.route_key,
            "sessionKeys": session_keys,
        }));
    }
    Ok(Json(serde_json::json!({"items": items})))
}

#[post("/v1/pairings/token", format = "json", data = "<body>")]
pub fn issue_pairing_token(
    db: &State<Db>,
    config: &State<Config>,
    auth: TenantAuth,
    body: Json<TokenRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let channel_name = match body.channel.as_deref() {
        Some(c) if !c.is_empty() => c,
        _ => return Err(validation("channel required")),
    };
    let Some(channel) = Channel::parse(channel_name) else {
        return Err(validation("unsupported channel"));
    };
    if let Some(ttl) = body.ttl_sec
        && ttl <= 0
    {
        return Err(validation("ttlSec must be positive"));
    }

    let issued = pairing::issue_token(
        db,
        config,
        &auth.0,
        channel,
        body.session_key.as_deref(),
        body.route_key.as_deref(),
        body.ttl_sec,
    )
    .map_err(|e| match e {
        IssueError::Validation(message) => validation(&message),
        IssueError::RouteBound => (
            Status::Conflict,
            Json(serde_json::json!({"ok": false, "error": "route already has a pairing in progress"})),
        ),
        IssueError::Db(message) => internal(&message),
    })?;

    let mut response = serde_json::json!({
        "ok": true,
        "channel": channel.as_str(),
        "token": issued.token,
        "expiresAtMs": issued.expires_at_ms,
    });
    if let Some(cmd) = issued.start_command {
        response["startCommand"] = serde_json::json!(cmd);
    }
    if let Some(link) = issued.deep_link {
        response["deepLink"] = serde_json::json!(link);
    }
    Ok(Json(response))
}

#[post("/v1/pairings/claim", format = "json", data = "<body>")]
pub fn claim_pairing(
    db: &State<Db>,
    log: &State<Arc<RelayLog>>,
    auth: TenantAuth,
    body: Json<ClaimRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let code = match body.code.as_deref().map(str::trim) {
        Some(code) if !code.is_empty() => code,
        _ => return Err(validation("code required")),
    };

    let result = pairing::claim_code(db, log, &auth.0, code, body.session_key.as_deref())
        .map_err(|e| match e {
            ClaimError::NotFound => (
                Status::NotFound,
                Json(serde_json::json!({"ok": false, "error": "code not found or expired"})),
            ),
            ClaimError::Conflict => (
                Status::Conflict,
                Json(serde_json::json!({"ok": false, "error": "code already claimed"})),
            ),
            ClaimError::Db(message) => internal(&message),
        })?;

    Ok(Json(serde_json::json!({
        "ok": true,
        "bindingId": result.binding.binding_id,
        "channel": result.binding.channel,
        "scope": result.binding.scope,
        "routeKey": result.binding.route_key,
        "sessionKey": result.session_key,
    })))
}

#[post("/v1/pairings/unbind", format = "json", data = "<body>")]
pub fn unbind_pairing(
    db: &State<Db>,
    log: &State<Arc<RelayLog>>,
    auth: TenantAuth,
    body: Json<UnbindRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let binding_id = match body.binding_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => id,
        _ => return Err(validation("bindingId required")),
    };

    let removed = db
        .deactivate_binding(&auth.0.id, binding_id)
        .map_err(|e| internal(&e.to_string()))?;
    if !removed {
        return Err((
            Status::NotFound,
            Json(serde_json::json!({"ok": false, "error": "binding not found"})),
        ));
    }

    db.audit(
        &auth.0.id,
        "unbind",
        &serde_json::json!({"bindingId": binding_id}),
    );
    log.event(
        "unbind",
        serde_json::json!({"tenantId": auth.0.id, "bindingId": binding_id}),
    );
    Ok(Json(serde_json::json!({"ok": true})))
}
