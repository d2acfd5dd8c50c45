//! Outbound dispatch: validate the send request, resolve the session route,
//! translate into the provider call, and shape the HTTP response.
//!
//! The dispatcher owns no HTTP plumbing of its own. It returns a
//! status + JSON body pair that the route handler (and the idempotency cache)
//! treat as the canonical response.

use serde_json::{Value, json};
use std::sync::Arc;

use crate::db::Db;
use crate::models::{Binding, SendRequest, Tenant};
use crate::providers::discord::DiscordClient;
use crate::providers::telegram::TelegramClient;
use crate::providers::whatsapp::WhatsAppRuntime;
use crate::providers::ProviderError;
use crate::relay_log::RelayLog;
use crate::route_key::{Channel, DiscordRoute, DiscordTarget, Route, TelegramRoute, WhatsAppRoute, parse_route_key};

/// The response a dispatch produced: exactly what goes on the wire (and into
/// the idempotency cache when cacheable).
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub status: u16,
    pub body: Value,
}

impl DispatchOutcome {
    fn ok(body: Value) -> DispatchOutcome {
        DispatchOutcome { status: 200, body }
    }

    fn bad_request(error: &str) -> DispatchOutcome {
        DispatchOutcome {
            status: 400,
            body: json!({"ok": false, "error": error}),
        }
    }

    fn route_not_bound() -> DispatchOutcome {
        DispatchOutcome {
            status: 403,
            body: json!({"ok": false, "error": "route not bound", "code": "ROUTE_NOT_BOUND"}),
        }
    }

    fn forbidden(error: &str) -> DispatchOutcome {
        DispatchOutcome {
            status: 403,
            body: json!({"ok": false, "error": error}),
        }
    }

    fn upstream(error: ProviderError) -> DispatchOutcome {
        DispatchOutcome {
            status: 502,
            body: json!({"ok": false, "error": error.message, "details": error.details}),
        }
    }

    fn internal(error: &str) -> DispatchOutcome {
        DispatchOutcome {
            status: 500,
            body: json!({"ok": false, "error": error}),
        }
    }

    /// 502s (and 500s) are never cached: the caller retries them with the
    /// same idempotency key and gets a fresh dispatch.
    pub fn cacheable(&self) -> bool {
        self.status < 500
    }
}

const TELEGRAM_RAW_METHODS: [&str; 5] = [
    "sendMessage",
    "sendPhoto",
    "sendChatAction",
    "editMessageText",
    "answerCallbackQuery",
];

/// Methods that address a thread inside a forum chat.
fn telegram_method_supports_thread(method: &str) -> bool {
    matches!(method, "sendMessage" | "sendPhoto" | "sendChatAction")
}

/// Enforce route coordinates on a raw Telegram body: `chat_id` always comes
/// from the binding (except `answerCallbackQuery`, which has no chat), and
/// `message_thread_id` is injected from the route or request when the caller
/// left it out. Everything else passes through verbatim.
pub fn merge_telegram_body(
    method: &str,
    raw_body: &Value,
    route: &TelegramRoute,
    request_thread_id: Option<&str>,
) -> Value {
    let mut body = if raw_body.is_object() {
        raw_body.clone()
    } else {
        json!({})
    };
    if method != "answerCallbackQuery" {
        body["chat_id"] = json!(route.chat_id);
    }
    if telegram_method_supports_thread(method) && body.get("message_thread_id").is_none() {
        let thread = route
            .topic_id
            .as_deref()
            .or(request_thread_id)
            .and_then(|t| t.parse::<i64>().ok());
        if let Some(thread) = thread {
            body["message_thread_id"] = json!(thread);
        }
    }
    body
}

/// Message bodies for a typed Discord send: first message carries the text as
/// content (caption) plus the first media embed; remaining media go out as
/// separate messages.
pub fn build_discord_messages(
    text: Option<&str>,
    media_urls: &[String],
    reply_to: Option<&str>,
) -> Vec<Value> {
    let mut messages = Vec::new();
    if media_urls.is_empty() {
        let mut message = json!({"content": text.unwrap_or("")});
        if let Some(reply) = reply_to {
            message["message_reference"] = json!({"message_id": reply});
        }
        messages.push(message);
        return messages;
    }
    for (index, url) in media_urls.iter().enumerate() {
        let mut message = json!({"embeds": [{"image": {"url": url}}]});
        if index == 0 {
            if let Some(text) = text {
                message["content"] = json!(text);
            }
            if let Some(reply) = reply_to {
                message["message_reference"] = json!({"message_id": reply});
            }
        }
        messages.push(message);
    }
    messages
}

pub struct Dispatcher {
    pub telegram: Option<TelegramClient>,
    pub discord: Option<DiscordClient>,
    pub whatsapp: Arc<dyn WhatsAppRuntime>,
}

impl Dispatcher {
    /// `/v1/mux/outbound/send`, after authn and idempotency admission.
    pub async fn dispatch_send(
        &self,
        db: &Db,
        log: &RelayLog,
        tenant: &Tenant,
        request: &SendRequest,
    ) -> DispatchOutcome {
        let Some(channel_name) = request.channel.as_deref().filter(|c| !c.is_empty()) else {
            return DispatchOutcome::bad_request("channel required");
        };
        let Some(channel) = Channel::parse(channel_name) else {
            return DispatchOutcome::bad_request("unsupported channel");
        };
        let Some(session_key) = request.session_key.as_deref().filter(|s| !s.is_empty()) else {
            return DispatchOutcome::bad_request("sessionKey required");
        };

        if request.is_typing_action() {
            return self.dispatch_typing(db, tenant, channel, session_key).await;
        }

        let has_content = request.text.as_deref().is_some_and(|t| !t.is_empty())
            || !request.all_media_urls().is_empty()
            || request.raw.is_some();
        if !has_content {
            return DispatchOutcome::bad_request("text, mediaUrl, or raw required");
        }

        let (binding, route) = match self.resolve(db, tenant, channel, session_key) {
            Ok(Some(found)) => found,
            Ok(None) => return DispatchOutcome::route_not_bound(),
            Err(e) => {
                log.relay_error("outbound route resolve", &e);
                return DispatchOutcome::internal(&e);
            }
        };

        let outcome = match route {
            Route::Telegram(route) => self.send_telegram(request, &route).await,
            Route::Discord(route) => self.send_discord(request, &route).await,
            Route::WhatsApp(route) => self.send_whatsapp(request, &route).await,
        };
        if outcome.status == 200 {
            log.event(
                "outbound_sent",
                json!({
                    "tenantId": tenant.id,
                    "channel": channel.as_str(),
                    "bindingId": binding.binding_id,
                    "sessionKey": session_key,
                    "messageId": outcome.body.get("messageId"),
                }),
            );
        }
        outcome
    }

    /// `/v1/mux/outbound/typing` and `op:"action"` sends.
    pub async fn dispatch_typing(
        &self,
        db: &Db,
        tenant: &Tenant,
        channel: Channel,
        session_key: &str,
    ) -> DispatchOutcome {
        let (_binding, route) = match self.resolve(db, tenant, channel, session_key) {
            Ok(Some(found)) => found,
            Ok(None) => return DispatchOutcome::route_not_bound(),
            Err(e) => return DispatchOutcome::internal(&e),
        };
        match route {
            Route::Telegram(route) => {
                let Some(client) = self.telegram.as_ref() else {
                    return DispatchOutcome::bad_request("telegram is not configured");
                };
                let body = merge_telegram_body(
                    "sendChatAction",
                    &json!({"action": "typing"}),
                    &route,
                    None,
                );
                match client.call("sendChatAction", &body).await {
                    Ok(_) => DispatchOutcome::ok(json!({"ok": true})),
                    Err(e) => DispatchOutcome::upstream(e),
                }
            }
            Route::Discord(route) => {
                let Some(client) = self.discord.as_ref() else {
                    return DispatchOutcome::bad_request("discord is not configured");
                };
                let channel_id = match self.discord_target_channel(client, &route, None).await {
                    Ok(id) => id,
                    Err(outcome) => return *outcome,
                };
                match client.trigger_typing(&channel_id).await {
                    Ok(()) => DispatchOutcome::ok(json!({"ok": true})),
                    Err(e) => DispatchOutcome::upstream(e),
                }
            }
            Route::WhatsApp(route) => match self.whatsapp.send_typing(&route.chat_jid).await {
                Ok(()) => DispatchOutcome::ok(json!({"ok": true})),
                Err(e) => DispatchOutcome::upstream(e),
            },
        }
    }

    fn resolve(
        &self,
        db: &Db,
        tenant: &Tenant,
        channel: Channel,
        session_key: &str,
    ) -> Result<Option<(Binding, Route)>, String> {
        let Some((_, binding)) = db
            .resolve_session_route(&tenant.id, channel.as_str(), session_key)
            .map_err(|e| e.to_string())?
        else {
            return Ok(None);
        };
        let Some(route) = parse_route_key(&binding.route_key) else {
            return Err(format!("stored route key unparseable: {}", binding.route_key));
        };
        if route.channel() != channel {
            return Err(format!(
                "binding {} channel mismatch: {} vs {}",
                binding.binding_id,
                route.channel(),
                channel
            ));
        }
        Ok(Some((binding, route)))
    }

    async fn send_telegram(
        &self,
        request: &SendRequest,
        route: &TelegramRoute,
    ) -> DispatchOutcome {
        let Some(client) = self.telegram.as_ref() else {
            return DispatchOutcome::bad_request("telegram is not configured");
        };
        let Some(raw) = request.raw.as_ref().and_then(|r| r.telegram.as_ref()) else {
            return DispatchOutcome::bad_request("raw.telegram required");
        };
        if !TELEGRAM_RAW_METHODS.contains(&raw.method.as_str()) {
            return DispatchOutcome::bad_request("unsupported telegram method");
        }
        let body = merge_telegram_body(
            &raw.method,
            &raw.body,
            route,
            request.thread_id.as_deref(),
        );
        match client.call(&raw.method, &body).await {
            Ok(result) => {
                let message_id = result
                    .get("message_id")
                    .map(|id| match id {
                        Value::Number(n) => n.to_string(),
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    });
                let provider_ids: Vec<String> = message_id.iter().cloned().collect();
                DispatchOutcome::ok(json!({
                    "ok": true,
                    "messageId": message_id,
                    "chatId": route.chat_id,
                    "providerMessageIds": provider_ids,
                }))
            }
            Err(e) => DispatchOutcome::upstream(e),
        }
    }

    /// The channel a guild/DM route actually posts to. Guild routes verify the
    /// requested channel belongs to the bound guild; DM routes ignore `to`.
    async fn discord_target_channel(
        &self,
        client: &DiscordClient,
        route: &DiscordRoute,
        requested_to: Option<&str>,
    ) -> Result<String, Box<DispatchOutcome>> {
        match &route.target {
            DiscordTarget::Dm { user_id } => client
                .dm_channel_id(user_id)
                .await
                .map_err(|e| Box::new(DispatchOutcome::upstream(e))),
            DiscordTarget::Guild {
                guild_id,
                channel_id,
                thread_id,
            } => {
                let target = requested_to
                    .map(|t| t.to_string())
                    .or_else(|| thread_id.clone())
                    .or_else(|| channel_id.clone());
                let Some(target) = target else {
                    return Err(Box::new(DispatchOutcome::bad_request(
                        "guild binding has no channel; pass `to`",
                    )));
                };
                match client.guild_of_channel(&target).await {
                    Ok(owner) if owner == *guild_id => Ok(target),
                    Ok(_) => Err(Box::new(DispatchOutcome::forbidden(
                        "channel is outside the bound guild",
                    ))),
                    Err(e) => Err(Box::new(DispatchOutcome::upstream(e))),
                }
            }
        }
    }

    async fn send_discord(&self, request: &SendRequest, route: &DiscordRoute) -> DispatchOutcome {
        let Some(client) = self.discord.as_ref() else {
            return DispatchOutcome::bad_request("discord is not configured");
        };
        let channel_id = match self
            .discord_target_channel(client, route, request.to.as_deref())
            .await
        {
            Ok(id) => id,
            Err(outcome) => return *outcome,
        };

        let raw_discord = request.raw.as_ref().and_then(|r| r.discord.as_ref());

        // Verbatim body wins over the typed path.
        if let Some(body) = raw_discord.and_then(|d| d.body.as_ref()) {
            return match client.create_message(&channel_id, body).await {
                Ok(result) => {
                    let id = result.get("id").and_then(Value::as_str).map(String::from);
                    let provider_ids: Vec<String> = id.iter().cloned().collect();
                    DispatchOutcome::ok(json!({
                        "ok": true,
                        "messageId": id,
                        "channelId": channel_id,
                        "providerMessageIds": provider_ids,
                    }))
                }
                Err(e) => DispatchOutcome::upstream(e),
            };
        }

        let (text, media_urls, reply_to) = match raw_discord.and_then(|d| d.send.as_ref()) {
            Some(send) => {
                let mut urls = Vec::new();
                if let Some(u) = &send.media_url {
                    urls.push(u.clone());
                }
                if let Some(more) = &send.media_urls {
                    urls.extend(more.iter().cloned());
                }
                (send.text.clone(), urls, send.reply_to.clone())
            }
            None => (
                request.text.clone(),
                request.all_media_urls(),
                request.reply_to_id.clone(),
            ),
        };

        let bodies = build_discord_messages(text.as_deref(), &media_urls, reply_to.as_deref());
        let mut provider_ids: Vec<String> = Vec::new();
        let mut partial = false;
        for (index, body) in bodies.iter().enumerate() {
            match client.create_message(&channel_id, body).await {
                Ok(result) => {
                    if let Some(id) = result.get("id").and_then(Value::as_str) {
                        provider_ids.push(id.to_string());
                    }
                }
                Err(e) => {
                    if index == 0 {
                        return DispatchOutcome::upstream(e);
                    }
                    partial = true;
                    break;
                }
            }
        }
        let mut body = json!({
            "ok": true,
            "messageId": provider_ids.first(),
            "channelId": channel_id,
            "providerMessageIds": provider_ids,
        });
        if partial {
            body["partial"] = json!(true);
        }
        DispatchOutcome::ok(body)
    }

    async fn send_whatsapp(&self, request: &SendRequest, route: &WhatsAppRoute) -> DispatchOutcome {
        let media_urls = request.all_media_urls();
        let text = request.text.as_deref().filter(|t| !t.is_empty());
        let mut provider_ids: Vec<String> = Vec::new();
        let mut partial = false;

        if media_urls.is_empty() {
            match self.whatsapp.send_message(&route.chat_jid, text, None).await {
                Ok(id) => provider_ids.push(id),
                Err(e) => return DispatchOutcome::upstream(e),
            }
        } else {
            // Media in order: caption rides the first item only.
            for (index, url) in media_urls.iter().enumerate() {
                let caption = if index == 0 { text } else { None };
                match self
                    .whatsapp
                    .send_message(&route.chat_jid, caption, Some(url))
                    .await
                {
                    Ok(id) => provider_ids.push(id),
                    Err(e) => {
                        if index == 0 {
                            return DispatchOutcome::upstream(e);
                        }
                        partial = true;
                        break;
                    }
                }
            }
        }

        let mut body = json!({
            "ok": true,
            "messageId": provider_ids.first(),
            "toJid": route.chat_jid,
            "providerMessageIds": provider_ids,
        });
        if partial {
            body["partial"] = json!(true);
        }
        DispatchOutcome::ok(body)
    }
}
