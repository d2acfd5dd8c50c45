use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{State, post};
use std::sync::Arc;

use super::AdminAuth;
use crate::db::{self, Db};
use crate::models::BootstrapRequest;
use crate::relay_log::RelayLog;

/// Upsert a tenant and its inbound target. The inbound token is generated on
/// first insert and returned so the tenant app can verify forwards; later
/// bootstraps keep it stable.
#[post("/v1/admin/tenants/bootstrap", format = "json", data = "<body>")]
pub fn bootstrap_tenant(
    db: &State<Db>,
    log: &State<Arc<RelayLog>>,
    _admin: AdminAuth,
    body: Json<BootstrapRequest>,
) -> Result<Json<serde_json::Value>, (Status, Json<serde_json::Value>)> {
    let tenant_id = match body.tenant_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => return Err(validation("tenantId required")),
    };
    let api_key = match body.api_key.as_deref() {
        Some(key) if !key.is_empty() => key,
        _ => return Err(validation("apiKey required")),
    };
    let inbound_url = match body.inbound_url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => url.to_string(),
        _ => return Err(validation("inboundUrl required")),
    };
    if let Some(timeout) = body.inbound_timeout_ms
        && timeout <= 0
    {
        return Err(validation("inboundTimeoutMs must be positive"));
    }

    let api_key_hash = db::hash_secret(api_key);
    // The key hash is unique across tenants; refuse to steal another's key.
    match db.find_tenant_by_key_hash(&api_key_hash) {
        Ok(Some(existing)) if existing.id != tenant_id => {
            return Err((
                Status::Conflict,
                Json(serde_json::json!({"ok": false, "error": "apiKey already in use"})),
            ));
        }
        Ok(_) => {}
        Err(e) => return Err(internal(&e.to_string())),
    }

    let name = body.name.clone().unwrap_or_else(|| tenant_id.clone());
    let tenant = db
        .upsert_tenant(
            &tenant_id,
            &name,
            &api_key_hash,
            Some(&inbound_url),
            body.inbound_timeout_ms,
        )
        .map_err(|e| internal(&e.to_string()))?;

    log.event(
        "tenant_bootstrapped",
        serde_json::json!({"tenantId": tenant.id, "inboundUrl": tenant.inbound_url}),
    );

    Ok(Json(serde_json::json!({
        "ok": true,
        "tenantId": tenant.id,
        "name": tenant.name,
        "inboundUrl": tenant.inbound_url,
        "inboundTimeoutMs": tenant.inbound_timeout_ms,
        "inboundToken": tenant.inbound_token,
    })))
}

fn validation(message: &str) -> (Status, Json<serde_json::Value>) {
    (
        Status::BadRequest,
        Json(serde_json::json!({"ok": false, "error": message})),
    )
}

fn internal(message: &str) -> (Status, Json<serde_json::Value>) {
    (
        Status::InternalServerError,
        Json(serde_json::json!({"ok": false, "error": message})),
    )
}
