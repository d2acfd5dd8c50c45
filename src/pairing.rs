use crate::config::Config;
use crate::db::{self, CodeClaimOutcome, Db};
use crate::models::{Binding, Tenant};
use crate::relay_log::RelayLog;
use crate::route_key::{Channel, DiscordTarget, Route, discord_session_key, parse_route_key, telegram_session_key, whatsapp_session_key};

/// Find a pairing token in user text: `/start mpt_…` or an inline `mpt_…`
/// anywhere in the message.
pub fn extract_pairing_token(text: &str) -> Option<String> {
    text.split_whitespace()
        .find(|word| word.starts_with("mpt_") && word.len() > "mpt_".len())
        .map(|word| word.to_string())
}

/// Scope label recorded on a binding, derived from its route shape.
pub fn scope_for_route(route: &Route) -> &'static str {
    match route {
        Route::Telegram(t) if t.topic_id.is_some() => "topic",
        Route::Telegram(_) => "chat",
        Route::Discord(d) => match d.target {
            DiscordTarget::Dm { .. } => "dm",
            DiscordTarget::Guild { .. } => "guild",
        },
        Route::WhatsApp(_) => "chat",
    }
}

/// Default session key for a route, used when the tenant never named one.
pub fn default_session_key(route: &Route, chat_type: &str) -> String {
    match route {
        Route::Telegram(t) => telegram_session_key(chat_type, &t.chat_id, t.topic_id.as_deref()),
        Route::Discord(d) => discord_session_key(&d.target),
        Route::WhatsApp(w) => whatsapp_session_key(&w.chat_jid),
    }
}

/// The session key inbound envelopes carry for a binding: the tenant's most
/// recently upserted key, falling back to the route's deterministic default.
pub fn binding_session_key(
    db: &Db,
    binding: &Binding,
    route: &Route,
    chat_type: &str,
) -> Result<String, String> {
    let keys = db
        .session_keys_for_binding(&binding.binding_id)
        .map_err(|e| e.to_string())?;
    Ok(keys
        .into_iter()
        .next()
        .unwrap_or_else(|| default_session_key(route, chat_type)))
}

pub struct Redemption {
    pub binding: Binding,
    pub session_key: String,
}

/// Telegram/WhatsApp in-situ redemption: the route is derived from the chat
/// the token arrived in. Consumes the token atomically, then creates the
/// binding (or reuses this tenant's existing one) and upserts a session route.
/// Returns None when the token is invalid, expired, spent, for another
/// channel, or the route belongs to a different tenant.
pub fn redeem_in_situ(
    db: &Db,
    log: &RelayLog,
    token_text: &str,
    route: &Route,
    chat_type: &str,
    context_json: &str,
) -> Result<Option<Redemption>, String> {
    let channel = route.channel();
    let now = db::now_ms();
    let hash = db::hash_secret(token_text);
    let Some(token) = db
        .consume_pairing_token(&hash, channel.as_str(), None, now)
        .map_err(|e| e.to_string())?
    else {
        return Ok(None);
    };

    let route_key = route.to_key();
    let binding = match db
        .find_open_binding_by_route(channel.as_str(), &route_key)
        .map_err(|e| e.to_string())?
    {
        Some(existing) if existing.tenant_id == token.tenant_id => {
            if existing.status == "pending" {
                db.activate_binding(&existing.binding_id)
                    .map_err(|e| e.to_string())?;
            }
            db.find_binding(&existing.binding_id)
                .map_err(|e| e.to_string())?
                .ok_or_else(|| "binding vanished mid-redemption".to_string())?
        }
        Some(_other_tenant) => {
            // Token was spent on a route someone else owns. Burned by design of
            // the conditional UPDATE ordering; the user sees the invalid notice.
            log.event(
                "pairing_token_rejected",
                serde_json::json!({"tenantId": token.tenant_id, "channel": channel.as_str(), "reason": "route bound to another tenant"}),
            );
            return Ok(None);
        }
        None => {
            let binding_id = db::generate_binding_id();
            db.insert_binding(
                &binding_id,
                &token.tenant_id,
                channel.as_str(),
                scope_for_route(route),
                &route_key,
                "active",
            )
            .map_err(|e| e.to_string())?;
            Binding {
                binding_id,
                tenant_id: token.tenant_id.clone(),
                channel: channel.as_str().to_string(),
                scope: scope_for_route(route).to_string(),
                route_key: route_key.clone(),
                status: "active".to_string(),
            }
        }
    };

    let session_key = token
        .session_key
        .clone()
        .unwrap_or_else(|| default_session_key(route, chat_type));
    db.upsert_session_route(
        &token.tenant_id,
        channel.as_str(),
        &session_key,
        &binding.binding_id,
        context_json,
    )
    .map_err(|e| e.to_string())?;
    db.record_token_consumption(&hash, &binding.binding_id, &route_key)
        .map_err(|e| e.to_string())?;
    db.audit(
        &token.tenant_id,
        "pairing_token_redeemed",
        &serde_json::json!({
            "bindingId": binding.binding_id,
            "channel": channel.as_str(),
            "routeKey": route_key,
            "sessionKey": session_key,
        }),
    );
    log.event(
        "pairing_token_redeemed",
        serde_json::json!({"tenantId": token.tenant_id, "channel": channel.as_str(), "bindingId": binding.binding_id}),
    );
    Ok(Some(Redemption {
        binding,
        session_key,
    }))
}

/// Discord redemption: the pending binding already names tenant and route;
/// the token must belong to that tenant or the conditional UPDATE matches
/// nothing. Activates the binding and upserts a session route.
pub fn redeem_pending_discord(
    db: &Db,
    log: &RelayLog,
    token_text: &str,
    binding: &Binding,
) -> Result<Option<Redemption>, String> {
    let now = db::now_ms();
    let hash = db::hash_secret(token_text);
    let Some(token) = db
        .consume_pairing_token(&hash, "discord", Some(&binding.tenant_id), now)
        .map_err(|e| e.to_string())?
    else {
        return Ok(None);
    };

    if binding.status == "pending" {
        db.activate_binding(&binding.binding_id)
            .map_err(|e| e.to_string())?;
    }
    let session_key = token.session_key.clone().unwrap_or_else(|| {
        parse_route_key(&binding.route_key)
            .map(|r| default_session_key(&r, "direct"))
            .unwrap_or_else(|| format!("dc:binding:{}", binding.binding_id))
    });
    db.upsert_session_route(
        &binding.tenant_id,
        "discord",
        &session_key,
        &binding.binding_id,
        "{}",
    )
    .map_err(|e| e.to_string())?;
    db.record_token_consumption(&hash, &binding.binding_id, &binding.route_key)
        .map_err(|e| e.to_string())?;
    db.audit(
        &binding.tenant_id,
        "pairing_token_redeemed",
        &serde_json::json!({
            "bindingId": binding.binding_id,
            "channel": "discord",
            "routeKey": binding.route_key,
            "sessionKey": session_key,
        }),
    );
    log.event(
        "pairing_token_redeemed",
        serde_json::json!({"tenantId": binding.tenant_id, "channel": "discord", "bindingId": binding.binding_id}),
    );
    let activated = db
        .find_binding(&binding.binding_id)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| "binding vanished mid-redemption".to_string())?;
    Ok(Some(Redemption {
        binding: activated,
        session_key,
    }))
}

pub struct IssuedToken {
    pub token: String,
    pub expires_at_ms: i64,
    pub start_command: Option<String>,
    pub deep_link: Option<String>,
}

pub enum IssueError {
    Validation(String),
    /// Discord DM route already has a pending or active binding.
    RouteBound,
    Db(String),
}

/// Issue a one-time pairing token. Discord tokens also create the pending
/// binding for the DM route they will activate.
pub fn issue_token(
    db: &Db,
    config: &Config,
    tenant: &Tenant,
    channel: Channel,
    session_key: Option<&str>,
    route_key: Option<&str>,
    ttl_sec: Option<i64>,
) -> Result<IssuedToken, IssueError> {
    let now = db::now_ms();
    db.purge_expired_tokens(now)
        .map_err(|e| IssueError::Db(e.to_string()))?;

    let ttl = ttl_sec
        .unwrap_or(config.pairing_token_ttl_sec)
        .clamp(1, config.pairing_token_ttl_max_sec);
    let expires_at_ms = now + ttl * 1000;

    if channel == Channel::Discord {
        let key = route_key
            .ok_or_else(|| IssueError::Validation("routeKey required for discord".to_string()))?;
        let route = parse_route_key(key)
            .ok_or_else(|| IssueError::Validation("routeKey unparseable".to_string()))?;
        match &route {
            Route::Discord(d) if matches!(d.target, DiscordTarget::Dm { .. }) => {}
            _ => {
                return Err(IssueError::Validation(
                    "discord pairing supports dm routes only".to_string(),
                ));
            }
        }
        if db
            .find_open_binding_by_route("discord", key)
            .map_err(|e| IssueError::Db(e.to_string()))?
            .is_some()
        {
            return Err(IssueError::RouteBound);
        }
        let binding_id = db::generate_binding_id();
        db.insert_binding(&binding_id, &tenant.id, "discord", "dm", key, "pending")
            .map_err(|e| IssueError::Db(e.to_string()))?;
    } else if route_key.is_some() {
        return Err(IssueError::Validation(
            "routeKey is only accepted for discord".to_string(),
        ));
    }

    let token = db::generate_pairing_token();
    db.insert_pairing_token(
        &db::hash_secret(&token),
        &tenant.id,
        channel.as_str(),
        session_key,
        now,
        expires_at_ms,
    )
    .map_err(|e| IssueError::Db(e.to_string()))?;
    db.audit(
        &tenant.id,
        "pairing_token_issued",
        &serde_json::json!({
            "channel": channel.as_str(),
            "sessionKey": session_key,
            "expiresAtMs": expires_at_ms,
        }),
    );

    let (start_command, deep_link) = if channel == Channel::Telegram {
        let cmd = Some(format!("/start {token}"));
        let link = config
            .telegram
            .bot_username
            .as_deref()
            .map(|u| format!("https://t.me/{u}?start={token}"));
        (cmd, link)
    } else {
        (None, None)
    };

    Ok(IssuedToken {
        token,
        expires_at_ms,
        start_command,
        deep_link,
    })
}

pub struct ClaimResult {
    pub binding: Binding,
    pub session_key: String,
}

pub enum ClaimError {
    /// Absent or expired code.
    NotFound,
    /// Already claimed, or the route is actively bound elsewhere.
    Conflict,
    Db(String),
}

/// Claim a seeded pairing code: atomic claim, active binding, session route.
pub fn claim_code(
    db: &Db,
    log: &RelayLog,
    tenant: &Tenant,
    code: &str,
    session_key: Option<&str>,
) -> Result<ClaimResult, ClaimError> {
    let now = db::now_ms();
    let row = match db
        .claim_pairing_code(code, &tenant.id, now)
        .map_err(|e| ClaimError::Db(e.to_string()))?
    {
        CodeClaimOutcome::Claimed(row) => row,
        CodeClaimOutcome::NotFound => return Err(ClaimError::NotFound),
        CodeClaimOutcome::AlreadyClaimed => return Err(ClaimError::Conflict),
    };

    let binding_id = db::generate_binding_id();
    if db
        .insert_binding(
            &binding_id,
            &tenant.id,
            &row.channel,
            &row.scope,
            &row.route_key,
            "active",
        )
        .is_err()
    {
        // The route is already actively bound (unique active-route index).
        return Err(ClaimError::Conflict);
    }

    let session_key = session_key.map(|s| s.to_string()).unwrap_or_else(|| {
        parse_route_key(&row.route_key)
            .map(|r| default_session_key(&r, "group"))
            .unwrap_or_else(|| format!("bind:{binding_id}"))
    });
    db.upsert_session_route(&tenant.id, &row.channel, &session_key, &binding_id, "{}")
        .map_err(|e| ClaimError::Db(e.to_string()))?;
    db.audit(
        &tenant.id,
        "pairing_claimed",
        &serde_json::json!({
            "code": code,
            "bindingId": binding_id,
            "channel": row.channel,
            "routeKey": row.route_key,
            "sessionKey": session_key,
        }),
    );
    log.event(
        "pairing_claimed",
        serde_json::json!({"tenantId": tenant.id, "channel": row.channel, "bindingId": binding_id}),
    );

    Ok(ClaimResult {
        binding: Binding {
            binding_id,
            tenant_id: tenant.id.clone(),
            channel: row.channel,
            scope: row.scope,
            route_key: row.route_key,
            status: "active".to_string(),
        },
        session_key,
    })
}
