use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{State, get, post};
use std::sync::Arc;

use super::TenantAuth;
use crate::db::Db;
use crate::models::InboundTargetRequest;
use crate::relay_log::RelayLog;

#[get("/v1/tenant/inbound-target")]
pub fn get_inbound_target(auth: TenantAuth) -> Json<serde_json::Value> {
    let tenant = auth.0;
    match tenant.inbound_url {
        Some(url) => Json(serde_json::json!({
            "ok": true,
            "configured": true,
            "inboundUrl": url,
            "inboundTimeoutMs": tenant.inbound_timeout_ms,
        })),
        None => Json(serde_json::json!({"ok": true, "configured": false})),
    }
}

#[post("/v1/tenant/inbound-target", format = "json", data = "<body>")]
pub fn set_inbound_target(
    db: &State<Db>,
    log: &State<Arc<RelayLog>>,
    auth: TenantAuth,
    body: Json<InboundTargetRequest>,
) -> Result<Json<serde_json::Value>, (Status, Json<serde_json::Value>)> {
    let tenant = auth.0;
    let inbound_url = match body.inbound_url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => url.to_string(),
        _ => {
            return Err((
                Status::BadRequest,
                Json(serde_json::json!({"ok": false, "error": "inboundUrl required"})),
            ));
        }
    };
    if let Some(timeout) = body.inbound_timeout_ms
        && timeout <= 0
    {
        return Err((
            Status::BadRequest,
            Json(serde_json::json!({"ok": false, "error": "inboundTimeoutMs must be positive"})),
        ));
    }

    let updated = db
        .set_inbound_target(&tenant.id, &inbound_url, body.inbound_timeout_ms)
        .map_err(|e| {
            (
                Status::InternalServerError,
                Json(serde_json::json!({"ok": false, "error": e.to_string()})),
            )
        })?;
    if !updated {
        return Err((
            Status::NotFound,
            Json(serde_json::json!({"ok": false, "error": "tenant not found"})),
        ));
    }

    log.event(
        "inbound_target_updated",
        serde_json::json!({"tenantId": tenant.id, "inboundUrl": inbound_url}),
    );

    let refreshed = db.find_tenant(&tenant.id).ok().flatten();
    let timeout = refreshed
        .map(|t| t.inbound_timeout_ms)
        .unwrap_or(tenant.inbound_timeout_ms);
    Ok(Json(serde_json::json!({
        "ok": true,
        "inboundUrl": inbound_url,
        "inboundTimeoutMs": timeout,
    })))
}
