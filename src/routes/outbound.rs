use rocket::http::{ContentType, Status};
use rocket::serde::json::Json;
use rocket::{State, post};
use std::sync::Arc;

use super::{IdempotencyKey, TenantAuth};
use crate::config::Config;
use crate::db::{self, Db};
use crate::dispatch::Dispatcher;
use crate::idempotency::{Admission, CachedResponse, InflightMap, await_joined};
use crate::models::{SendRequest, TypingRequest};
use crate::relay_log::RelayLog;
use crate::route_key::Channel;

/// Raw-body JSON responder: replayed idempotent responses must be
/// byte-identical, so the handler works in strings, not re-serialized values.
fn respond(status: u16, body: String) -> (Status, (ContentType, String)) {
    (
        Status::from_code(status).unwrap_or(Status::InternalServerError),
        (ContentType::JSON, body),
    )
}

#[post("/v1/mux/outbound/send", format = "json", data = "<body>")]
pub async fn outbound_send(
    db: &State<Db>,
    config: &State<Config>,
    log: &State<Arc<RelayLog>>,
    inflight: &State<InflightMap>,
    dispatcher: &State<Dispatcher>,
    auth: TenantAuth,
    idem: IdempotencyKey,
    body: String,
) -> (Status, (ContentType, String)) {
    let tenant = auth.0;
    // The fingerprint is the exact request text; parsing comes second.
    let fingerprint = body.as_str();
    let request: SendRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(_) => {
            return respond(
                400,
                serde_json::json!({"ok": false, "error": "invalid JSON body"}).to_string(),
            );
        }
    };

    let Some(key) = idem.0 else {
        let outcome = dispatcher.dispatch_send(db, log, &tenant, &request).await;
        return respond(outcome.status, outcome.body.to_string());
    };

    let now = db::now_ms();
    db.purge_expired_idempotency(now).ok();
    match db.get_idempotency(&tenant.id, &key) {
        Ok(Some(row)) => {
            if row.request_fingerprint == fingerprint {
                return respond(row.response_status, row.response_body);
            }
            return respond(
                409,
                serde_json::json!({"ok": false, "error": "idempotency key reused with different payload"})
                    .to_string(),
            );
        }
        Ok(None) => {}
        Err(e) => {
            log.relay_error("idempotency lookup", &e.to_string());
            return respond(
                500,
                serde_json::json!({"ok": false, "error": e.to_string()}).to_string(),
            );
        }
    }

    match inflight.begin(&tenant.id, &key, fingerprint) {
        Admission::Conflict => respond(
            409,
            serde_json::json!({"ok": false, "error": "idempotency key reused with different payload"})
                .to_string(),
        ),
        Admission::Join(rx) => match await_joined(rx).await {
            Some(cached) => respond(cached.status, cached.body),
            None => respond(
                500,
                serde_json::json!({"ok": false, "error": "coalesced dispatch aborted"}).to_string(),
            ),
        },
        Admission::Dispatch => {
            // Another owner may have persisted its row between our cache miss
            // and this registration; honor it instead of re-dispatching.
            if let Ok(Some(row)) = db.get_idempotency(&tenant.id, &key) {
                inflight.abandon(&tenant.id, &key);
                if row.request_fingerprint == fingerprint {
                    return respond(row.response_status, row.response_body);
                }
                return respond(
                    409,
                    serde_json::json!({"ok": false, "error": "idempotency key reused with different payload"})
                        .to_string(),
                );
            }
            let outcome = dispatcher.dispatch_send(db, log, &tenant, &request).await;
            let body_text = outcome.body.to_string();
            if outcome.cacheable()
                && let Err(e) = db.put_idempotency(
                    &tenant.id,
                    &key,
                    fingerprint,
                    outcome.status,
                    &body_text,
                    now + config.idempotency_ttl_ms,
                )
            {
                log.relay_error("idempotency store", &e.to_string());
            }
            inflight.complete(
                &tenant.id,
                &key,
                CachedResponse {
                    status: outcome.status,
                    body: body_text.clone(),
                },
            );
            respond(outcome.status, body_text)
        }
    }
}

#[post("/v1/mux/outbound/typing", format = "json", data = "<body>")]
pub async fn outbound_typing(
    db: &State<Db>,
    dispatcher: &State<Dispatcher>,
    auth: TenantAuth,
    body: Json<TypingRequest>,
) -> (Status, (ContentType, String)) {
    let channel_name = match body.channel.as_deref() {
        Some(c) if !c.is_empty() => c,
        _ => {
            return respond(
                400,
                serde_json::json!({"ok": false, "error": "channel required"}).to_string(),
            );
        }
    };
    let Some(channel) = Channel::parse(channel_name) else {
        return respond(
            400,
            serde_json::json!({"ok": false, "error": "unsupported channel"}).to_string(),
        );
    };
    let session_key = match body.session_key.as_deref() {
        Some(s) if !s.is_empty() => s,
        _ => {
            return respond(
                400,
                serde_json::json!({"ok": false, "error": "sessionKey required"}).to_string(),
            );
        }
    };

    let outcome = dispatcher
        .dispatch_typing(db, &auth.0, channel, session_key)
        .await;
    respond(outcome.status, outcome.body.to_string())
}
