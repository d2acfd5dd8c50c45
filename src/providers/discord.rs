//! Discord REST client and per-binding inbound poller.
//!
//! No gateway connection: each pending/active Discord binding is polled over
//! REST (`GET /channels/{id}/messages?after=…`) on a fixed interval. Offsets
//! are per-binding snowflakes and advance only after an acked forward.

use base64::Engine;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::PairingMessages;
use crate::db::Db;
use crate::envelope::{Attachment, Envelope};
use crate::forward::InboundForwarder;
use crate::models::Binding;
use crate::pairing;
use crate::providers::{ProviderError, fetch_bytes_capped, infer_image_mime};
use crate::relay_log::RelayLog;
use crate::route_key::{DiscordTarget, Route, parse_route_key};

const OFFSET_PROVIDER: &str = "discord";
const POLL_PAGE_LIMIT: u32 = 50;
const DM_CHANNEL_CACHE_TTL: Duration = Duration::from_secs(600);
const GUILD_OF_CHANNEL_CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct DcMessage {
    pub id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub author: Option<DcAuthor>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub attachments: Vec<DcAttachment>,
}

#[derive(Debug, Deserialize)]
pub struct DcAuthor {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub bot: bool,
}

#[derive(Debug, Deserialize)]
pub struct DcAttachment {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub size: Option<i64>,
}

struct TimedCache {
    entries: Mutex<HashMap<String, (Instant, String)>>,
    ttl: Duration,
}

impl TimedCache {
    fn new(ttl: Duration) -> TimedCache {
        TimedCache {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key)
            .filter(|(at, _)| at.elapsed() < self.ttl)
            .map(|(_, v)| v.clone())
    }

    fn put(&self, key: &str, value: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), (Instant::now(), value.to_string()));
    }
}

pub struct DiscordClient {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
    dm_channels: TimedCache,
    guild_of_channel: TimedCache,
}

impl DiscordClient {
    pub fn new(api_base: &str, bot_token: &str) -> DiscordClient {
        DiscordClient {
            client: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            bot_token: bot_token.to_string(),
            dm_channels: TimedCache::new(DM_CHANNEL_CACHE_TTL),
            guild_of_channel: TimedCache::new(GUILD_OF_CHANNEL_CACHE_TTL),
        }
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, ProviderError> {
        let url = format!("{}{}", self.api_base, path);
        let mut request = self
            .client
            .request(method.clone(), &url)
            .header("Authorization", format!("Bot {}", self.bot_token));
        if let Some(b) = body {
            request = request.json(b);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::transport(format!("discord {method} {path}: {e}")))?;
        let status = response.status();
        let payload: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(ProviderError::new(
                format!("discord {method} {path} returned HTTP {status}"),
                payload,
            ));
        }
        Ok(payload)
    }

    pub async fn create_message(
        &self,
        channel_id: &str,
        body: &Value,
    ) -> Result<Value, ProviderError> {
        self.request(
            reqwest::Method::POST,
            &format!("/channels/{channel_id}/messages"),
            Some(body),
        )
        .await
    }

    pub async fn trigger_typing(&self, channel_id: &str) -> Result<(), ProviderError> {
        self.request(
            reqwest::Method::POST,
            &format!("/channels/{channel_id}/typing"),
            Some(&json!({})),
        )
        .await
        .map(|_| ())
    }

    /// DM channel for a user, via `POST /users/@me/channels` with a 10 min cache.
    pub async fn dm_channel_id(&self, user_id: &str) -> Result<String, ProviderError> {
        if let Some(hit) = self.dm_channels.get(user_id) {
            return Ok(hit);
        }
        let channel = self
            .request(
                reqwest::Method::POST,
                "/users/@me/channels",
                Some(&json!({"recipient_id": user_id})),
            )
            .await?;
        let id = channel
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::new("discord DM channel has no id", channel.clone()))?
            .to_string();
        self.dm_channels.put(user_id, &id);
        Ok(id)
    }

    /// Which guild a channel belongs to, via `GET /channels/{id}` with a 30 s
    /// cache. Channels without a guild (DMs) resolve to an empty string.
    pub async fn guild_of_channel(&self, channel_id: &str) -> Result<String, ProviderError> {
        if let Some(hit) = self.guild_of_channel.get(channel_id) {
            return Ok(hit);
        }
        let channel = self
            .request(reqwest::Method::GET, &format!("/channels/{channel_id}"), None)
            .await?;
        let guild_id = channel
            .get("guild_id")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        self.guild_of_channel.put(channel_id, &guild_id);
        Ok(guild_id)
    }

    /// Raw message page after a snowflake. Returns raw JSON objects so the
    /// envelope keeps the full provider payload.
    pub async fn channel_messages_after(
        &self,
        channel_id: &str,
        after: Option<&str>,
    ) -> Result<Vec<Value>, ProviderError> {
        let mut path = format!("/channels/{channel_id}/messages?limit={POLL_PAGE_LIMIT}");
        if let Some(after) = after {
            path.push_str(&format!("&after={after}"));
        }
        let payload = self.request(reqwest::Method::GET, &path, None).await?;
        match payload {
            Value::Array(items) => Ok(items),
            _ => Ok(Vec::new()),
        }
    }

    pub async fn download_attachment(&self, url: &str, cap: usize) -> Result<Vec<u8>, String> {
        let (bytes, _) = fetch_bytes_capped(&self.client, url, cap).await?;
        Ok(bytes)
    }
}

/// Snowflakes are u64; ascending numeric order is chronological order.
pub fn sort_snowflakes_ascending(messages: &mut [Value]) {
    messages.sort_by_key(|m| {
        m.get("id")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0)
    });
}

pub struct DiscordPoller {
    pub db: Db,
    pub client: DiscordClient,
    pub forwarder: InboundForwarder,
    pub log: Arc<RelayLog>,
    pub account_id: String,
    pub media_max_bytes: usize,
    pub messages: PairingMessages,
    pub poll_interval_ms: u64,
}

impl DiscordPoller {
    /// One pass over every pending/active Discord binding. A failed forward
    /// stops that binding's loop for this pass; other bindings continue.
    pub async fn run_pass(&self) -> Result<(), String> {
        let bindings = self
            .db
            .list_discord_poll_bindings()
            .map_err(|e| e.to_string())?;
        for binding in bindings {
            if let Err(e) = self.poll_binding(&binding).await {
                self.log.relay_error(
                    "discord binding poll",
                    &format!("{}: {e}", binding.binding_id),
                );
            }
        }
        Ok(())
    }

    pub async fn run_loop(self, running: Arc<AtomicBool>) {
        while running.load(Ordering::Relaxed) {
            if let Err(e) = self.run_pass().await {
                self.log.relay_error("discord poll pass", &e);
            }
            tokio::time::sleep(Duration::from_millis(self.poll_interval_ms)).await;
        }
    }

    /// The channel to poll for a binding: DM channel (cached lookup) or the
    /// stored guild channel/thread. Guild bindings without a channel have no
    /// pollable surface.
    async fn inbound_channel(&self, binding: &Binding) -> Result<Option<String>, String> {
        let route = parse_route_key(&binding.route_key)
            .ok_or_else(|| format!("unparseable route key {}", binding.route_key))?;
        let Route::Discord(discord) = route else {
            return Err(format!("non-discord route on binding {}", binding.binding_id));
        };
        match discord.target {
            DiscordTarget::Dm { user_id } => self
                .client
                .dm_channel_id(&user_id)
                .await
                .map(Some)
                .map_err(|e| e.to_string()),
            DiscordTarget::Guild {
                channel_id,
                thread_id,
                ..
            } => Ok(thread_id.or(channel_id)),
        }
    }

    async fn poll_binding(&self, binding: &Binding) -> Result<(), String> {
        let Some(channel_id) = self.inbound_channel(binding).await? else {
            return Ok(());
        };
        let after = self
            .db
            .get_offset(OFFSET_PROVIDER, &binding.binding_id)
            .map_err(|e| e.to_string())?;
        let mut page = self
            .client
            .channel_messages_after(&channel_id, after.as_deref())
            .await
            .map_err(|e| e.to_string())?;
        sort_snowflakes_ascending(&mut page);

        for raw in page {
            let message: DcMessage = match serde_json::from_value(raw.clone()) {
                Ok(m) => m,
                Err(e) => {
                    self.log
                        .relay_error("discord message parse", &e.to_string());
                    if let Some(id) = raw.get("id").and_then(Value::as_str) {
                        self.commit_offset(binding, id)?;
                    }
                    continue;
                }
            };

            // Bot and authorless messages are acked without forwarding so the
            // page never replays them.
            let author_id = message.author.as_ref().and_then(|a| a.id.clone());
            let is_bot = message.author.as_ref().map(|a| a.bot).unwrap_or(true);
            if is_bot || author_id.is_none() {
                self.commit_offset(binding, &message.id)?;
                continue;
            }

            if binding.status == "pending" {
                if let Some(token) = pairing::extract_pairing_token(&message.content) {
                    let redeemed =
                        pairing::redeem_pending_discord(&self.db, &self.log, &token, binding)?;
                    let notice = if redeemed.is_some() {
                        &self.messages.success
                    } else {
                        &self.messages.invalid
                    };
                    self.send_notice(&channel_id, notice).await;
                    self.commit_offset(binding, &message.id)?;
                    if redeemed.is_some() {
                        // The binding row in hand is stale now; the next pass
                        // polls it as active.
                        return Ok(());
                    }
                    continue;
                }
                self.commit_offset(binding, &message.id)?;
                continue;
            }

            let envelope = self
                .build_envelope(binding, &channel_id, &raw, &message)
                .await?;
            let tenant = self
                .db
                .find_tenant(&binding.tenant_id)
                .map_err(|e| e.to_string())?
                .ok_or_else(|| format!("tenant {} missing", binding.tenant_id))?;
            if let Err(e) = self.forwarder.forward(&tenant, &envelope).await {
                // Not acked; retry from this message next pass.
                return Err(format!("forward failed at message {}: {e}", message.id));
            }
            self.log.event(
                "inbound_forwarded",
                json!({"tenantId": binding.tenant_id, "channel": "discord", "eventId": envelope.event_id, "kind": "message"}),
            );
            self.commit_offset(binding, &message.id)?;
        }
        Ok(())
    }

    fn commit_offset(&self, binding: &Binding, message_id: &str) -> Result<(), String> {
        self.db
            .set_offset(OFFSET_PROVIDER, &binding.binding_id, message_id)
            .map_err(|e| e.to_string())
    }

    async fn build_envelope(
        &self,
        binding: &Binding,
        channel_id: &str,
        raw: &Value,
        message: &DcMessage,
    ) -> Result<Envelope, String> {
        let route = parse_route_key(&binding.route_key)
            .ok_or_else(|| format!("unparseable route key {}", binding.route_key))?;
        let (chat_type, guild_id, thread_id) = match &route {
            Route::Discord(d) => match &d.target {
                DiscordTarget::Dm { .. } => ("direct", None, None),
                DiscordTarget::Guild {
                    guild_id,
                    thread_id,
                    ..
                } => ("group", Some(guild_id.clone()), thread_id.clone()),
            },
            _ => ("direct", None, None),
        };
        let session_key = pairing::binding_session_key(&self.db, binding, &route, chat_type)?;

        let author = message.author.as_ref();
        let timestamp_ms = message
            .timestamp
            .as_deref()
            .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.timestamp_millis())
            .unwrap_or_else(crate::db::now_ms);

        let mut envelope = Envelope::new(
            "discord",
            "message",
            raw.clone(),
            session_key,
            message.content.clone(),
            author.and_then(|a| a.id.clone()).unwrap_or_default(),
            self.account_id.clone(),
            self.account_id.clone(),
            chat_type.to_string(),
            message.id.clone(),
            timestamp_ms,
        );
        envelope.thread_id = thread_id;

        let mut attachments: Vec<Attachment> = Vec::new();
        let mut media_summary: Vec<Value> = Vec::new();
        for attachment in &message.attachments {
            let Some(url) = attachment.url.as_deref() else {
                continue;
            };
            let file_name = attachment
                .filename
                .clone()
                .unwrap_or_else(|| "attachment".to_string());
            let mime = attachment
                .content_type
                .clone()
                .or_else(|| infer_image_mime(&file_name).map(|m| m.to_string()));
            let is_image = mime.as_deref().is_some_and(|m| m.starts_with("image/"));
            let within_cap = attachment
                .size
                .is_none_or(|s| s as usize <= self.media_max_bytes);
            if is_image && within_cap {
                match self
                    .client
                    .download_attachment(url, self.media_max_bytes)
                    .await
                {
                    Ok(bytes) => {
                        attachments.push(Attachment {
                            kind: "image".to_string(),
                            mime_type: mime.unwrap_or_else(|| "image/jpeg".to_string()),
                            file_name,
                            content: base64::engine::general_purpose::STANDARD.encode(&bytes),
                        });
                        continue;
                    }
                    Err(e) => {
                        self.log.relay_error("discord attachment download", &e);
                    }
                }
            }
            media_summary.push(json!({
                "url": url,
                "fileName": file_name,
                "contentType": attachment.content_type,
                "size": attachment.size,
            }));
        }

        envelope.channel_data = json!({
            "discord": {
                "channelId": channel_id,
                "guildId": guild_id,
                "author": author.map(|a| json!({"id": a.id, "username": a.username})),
                "media": if media_summary.is_empty() { Value::Null } else { Value::Array(media_summary) },
            }
        });
        if !attachments.is_empty() {
            envelope.attachments = Some(attachments);
        }
        Ok(envelope)
    }

    async fn send_notice(&self, channel_id: &str, text: &str) {
        if let Err(e) = self
            .client
            .create_message(channel_id, &json!({"content": text}))
            .await
        {
            self.log
                .relay_error("discord pairing notice", &e.to_string());
        }
    }
}
