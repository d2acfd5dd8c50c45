//! Telegram Bot API client and inbound long-poller.
//!
//! Inbound uses `getUpdates` with a provider-side timeout; updates are acked
//! (offset advanced) one at a time, only after the tenant forward returns 2xx.
//! A failed forward halts the pass so no later update is acked before an
//! earlier one.

use base64::Engine;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::PairingMessages;
use crate::db::Db;
use crate::envelope::{Attachment, Envelope};
use crate::forward::InboundForwarder;
use crate::pairing;
use crate::providers::{ProviderError, fetch_bytes_capped};
use crate::relay_log::RelayLog;
use crate::route_key::{Route, TelegramRoute};

const OFFSET_PROVIDER: &str = "telegram";
const OFFSET_SCOPE: &str = "global";
const LONG_POLL_TIMEOUT_SEC: u64 = 25;
const PASS_ERROR_BACKOFF_SECS: u64 = 3;

#[derive(Debug, Deserialize)]
struct TgResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TgUpdate {
    pub update_id: i64,
    pub message: Option<TgMessage>,
    pub edited_message: Option<TgMessage>,
    pub callback_query: Option<TgCallbackQuery>,
}

#[derive(Debug, Deserialize)]
pub struct TgMessage {
    pub message_id: i64,
    pub from: Option<TgUser>,
    pub chat: TgChat,
    pub date: i64,
    pub text: Option<String>,
    pub caption: Option<String>,
    #[serde(default)]
    pub message_thread_id: Option<i64>,
    #[serde(default)]
    pub is_topic_message: Option<bool>,
    #[serde(default)]
    pub photo: Option<Vec<TgPhotoSize>>,
    #[serde(default)]
    pub document: Option<TgDocument>,
    #[serde(default)]
    pub video: Option<Value>,
    #[serde(default)]
    pub animation: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct TgUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TgChat {
    pub id: i64,
    #[serde(rename = "type")]
    pub chat_type: String,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TgPhotoSize {
    pub file_id: String,
    #[serde(default)]
    pub file_size: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct TgDocument {
    pub file_id: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct TgCallbackQuery {
    pub id: String,
    pub from: TgUser,
    #[serde(default)]
    pub message: Option<TgMessage>,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgFile {
    #[serde(default)]
    file_path: Option<String>,
}

pub struct TelegramClient {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
}

impl TelegramClient {
    pub fn new(api_base: &str, bot_token: &str) -> TelegramClient {
        TelegramClient {
            client: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            bot_token: bot_token.to_string(),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token, method)
    }

    /// POST a Bot API method and unwrap the `{ok, result, description}` shell.
    pub async fn call(&self, method: &str, body: &Value) -> Result<Value, ProviderError> {
        let response = self
            .client
            .post(self.method_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::transport(format!("telegram {method}: {e}")))?;
        let status = response.status();
        let payload: Value = response.json().await.unwrap_or(Value::Null);
        let parsed: TgResponse<Value> = serde_json::from_value(payload.clone())
            .unwrap_or(TgResponse { ok: false, result: None, description: None });
        if !status.is_success() || !parsed.ok {
            let description = parsed
                .description
                .unwrap_or_else(|| format!("telegram {method} returned HTTP {status}"));
            return Err(ProviderError::new(description, payload));
        }
        Ok(parsed.result.unwrap_or(Value::Null))
    }

    /// Long-poll for updates. Returns raw update objects so callers keep the
    /// full provider payload alongside the typed view.
    pub async fn get_updates(
        &self,
        offset: i64,
        timeout_sec: u64,
    ) -> Result<Vec<Value>, ProviderError> {
        let body = json!({
            "offset": offset,
            "timeout": timeout_sec,
            "allowed_updates": ["message", "edited_message", "callback_query"],
        });
        let result = self.call("getUpdates", &body).await?;
        match result {
            Value::Array(items) => Ok(items),
            _ => Ok(Vec::new()),
        }
    }

    /// Resolve a file_id to bytes, bounded by `cap`.
    pub async fn download_file(&self, file_id: &str, cap: usize) -> Result<Vec<u8>, String> {
        let info = self
            .call("getFile", &json!({"file_id": file_id}))
            .await
            .map_err(|e| e.to_string())?;
        let file: TgFile = serde_json::from_value(info).map_err(|e| e.to_string())?;
        let path = file.file_path.ok_or("getFile returned no file_path")?;
        let url = format!("{}/file/bot{}/{}", self.api_base, self.bot_token, path);
        let (bytes, _) = fetch_bytes_capped(&self.client, &url, cap).await?;
        Ok(bytes)
    }
}

pub struct TelegramPoller {
    pub db: Db,
    pub client: TelegramClient,
    pub forwarder: InboundForwarder,
    pub log: Arc<RelayLog>,
    pub account_id: String,
    pub media_max_bytes: usize,
    pub messages: PairingMessages,
}

impl TelegramPoller {
    /// Cold start: when no offset is stored, record the newest update id so
    /// the backlog accumulated while the mux was down is skipped.
    pub async fn bootstrap_offset(&self) -> Result<(), String> {
        if self
            .db
            .get_offset(OFFSET_PROVIDER, OFFSET_SCOPE)
            .map_err(|e| e.to_string())?
            .is_some()
        {
            return Ok(());
        }
        let latest = self
            .client
            .get_updates(-1, 0)
            .await
            .map_err(|e| e.to_string())?;
        let last_id = latest
            .iter()
            .filter_map(|u| u.get("update_id").and_then(Value::as_i64))
            .max()
            .unwrap_or(0);
        self.db
            .set_offset(OFFSET_PROVIDER, OFFSET_SCOPE, &last_id.to_string())
            .map_err(|e| e.to_string())
    }

    fn last_update_id(&self) -> Result<i64, String> {
        Ok(self
            .db
            .get_offset(OFFSET_PROVIDER, OFFSET_SCOPE)
            .map_err(|e| e.to_string())?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0))
    }

    /// One long-poll pass. Updates are processed in `update_id` order and the
    /// offset advances per acked update; a forward failure aborts the pass.
    pub async fn run_pass(&self) -> Result<(), String> {
        self.run_pass_with_timeout(LONG_POLL_TIMEOUT_SEC).await
    }

    pub async fn run_pass_with_timeout(&self, timeout_sec: u64) -> Result<(), String> {
        let offset = self.last_update_id()? + 1;
        let updates = self
            .client
            .get_updates(offset, timeout_sec)
            .await
            .map_err(|e| e.to_string())?;
        for raw in updates {
            let update: TgUpdate = match serde_json::from_value(raw.clone()) {
                Ok(u) => u,
                Err(e) => {
                    // Malformed update: ack and move on, or it blocks forever.
                    if let Some(id) = raw.get("update_id").and_then(Value::as_i64) {
                        self.log.relay_error(
                            "telegram update parse",
                            &format!("update {id}: {e}"),
                        );
                        self.db
                            .set_offset(OFFSET_PROVIDER, OFFSET_SCOPE, &id.to_string())
                            .map_err(|e| e.to_string())?;
                    }
                    continue;
                }
            };
            self.process_update(&raw, &update).await?;
            self.db
                .set_offset(OFFSET_PROVIDER, OFFSET_SCOPE, &update.update_id.to_string())
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    pub async fn run_loop(self, running: Arc<AtomicBool>) {
        if let Err(e) = self.bootstrap_offset().await {
            self.log.relay_error("telegram bootstrap", &e);
        }
        while running.load(Ordering::Relaxed) {
            if let Err(e) = self.run_pass().await {
                self.log.relay_error("telegram poll pass", &e);
                tokio::time::sleep(std::time::Duration::from_secs(PASS_ERROR_BACKOFF_SECS)).await;
            }
        }
    }

    /// Returns Err only when a tenant forward failed (the update must not be
    /// acked). Every drop/notice path returns Ok.
    async fn process_update(&self, raw: &Value, update: &TgUpdate) -> Result<(), String> {
        if let Some(message) = update.message.as_ref() {
            return self.process_message(raw, message, "message").await;
        }
        if let Some(message) = update.edited_message.as_ref() {
            return self.process_message(raw, message, "edited").await;
        }
        if let Some(callback) = update.callback_query.as_ref() {
            return self.process_callback(raw, callback).await;
        }
        Ok(())
    }

    fn topic_id_of(message: &TgMessage) -> Option<String> {
        if message.is_topic_message.unwrap_or(false) {
            message.message_thread_id.map(|t| t.to_string())
        } else {
            None
        }
    }

    /// Topic-specific binding first, chat-wide fallback.
    fn resolve_binding(
        &self,
        chat_id: &str,
        topic_id: Option<&str>,
    ) -> Result<Option<(crate::models::Binding, Route)>, String> {
        if let Some(topic) = topic_id {
            let route = Route::Telegram(TelegramRoute {
                account: self.account_id.clone(),
                chat_id: chat_id.to_string(),
                topic_id: Some(topic.to_string()),
            });
            if let Some(binding) = self
                .db
                .find_active_binding_by_route("telegram", &route.to_key())
                .map_err(|e| e.to_string())?
            {
                return Ok(Some((binding, route)));
            }
        }
        let route = Route::Telegram(TelegramRoute {
            account: self.account_id.clone(),
            chat_id: chat_id.to_string(),
            topic_id: None,
        });
        Ok(self
            .db
            .find_active_binding_by_route("telegram", &route.to_key())
            .map_err(|e| e.to_string())?
            .map(|b| (b, route)))
    }

    async fn process_message(
        &self,
        raw: &Value,
        message: &TgMessage,
        kind: &str,
    ) -> Result<(), String> {
        let chat_id = message.chat.id.to_string();
        let topic_id = Self::topic_id_of(message);
        let text = message
            .text
            .clone()
            .or_else(|| message.caption.clone())
            .unwrap_or_default();

        match self.resolve_binding(&chat_id, topic_id.as_deref())? {
            Some((binding, route)) => {
                // Already bound: a stray pairing token is just message text.
                let session_key = self.session_key_for(&binding, &route, &message.chat.chat_type)?;
                let envelope = self
                    .build_message_envelope(raw, message, kind, &session_key, topic_id.as_deref())
                    .await;
                if envelope.body.is_empty()
                    && envelope.attachments.as_ref().is_none_or(|a| a.is_empty())
                {
                    return Ok(());
                }
                self.forward_to_tenant(&binding.tenant_id, &envelope).await
            }
            None => {
                if let Some(token) = pairing::extract_pairing_token(&text) {
                    let route = Route::Telegram(TelegramRoute {
                        account: self.account_id.clone(),
                        chat_id: chat_id.clone(),
                        topic_id: topic_id.clone(),
                    });
                    let context = json!({
                        "telegram": {"chatId": chat_id, "chatType": message.chat.chat_type, "topicId": topic_id}
                    });
                    let redeemed = pairing::redeem_in_situ(
                        &self.db,
                        &self.log,
                        &token,
                        &route,
                        &message.chat.chat_type,
                        &context.to_string(),
                    )?;
                    let notice = if redeemed.is_some() {
                        &self.messages.success
                    } else {
                        &self.messages.invalid
                    };
                    self.send_notice(&chat_id, topic_id.as_deref(), notice).await;
                } else if text.starts_with('/') {
                    self.send_notice(&chat_id, topic_id.as_deref(), &self.messages.unpaired)
                        .await;
                }
                // Unbound non-command chatter is dropped.
                Ok(())
            }
        }
    }

    async fn process_callback(&self, raw: &Value, callback: &TgCallbackQuery) -> Result<(), String> {
        let Some(message) = callback.message.as_ref() else {
            return Ok(());
        };
        let chat_id = message.chat.id.to_string();
        let topic_id = Self::topic_id_of(message);

        match self.resolve_binding(&chat_id, topic_id.as_deref())? {
            Some((binding, route)) => {
                let session_key = self.session_key_for(&binding, &route, &message.chat.chat_type)?;
                let data = callback.data.clone().unwrap_or_default();
                let mut envelope = Envelope::new(
                    "telegram",
                    "callback",
                    raw.clone(),
                    session_key,
                    data.clone(),
                    callback.from.id.to_string(),
                    self.account_id.clone(),
                    self.account_id.clone(),
                    chat_type_label(&message.chat.chat_type),
                    message.message_id.to_string(),
                    message.date * 1000,
                );
                envelope.thread_id = topic_id.clone();
                envelope.channel_data = json!({
                    "telegram": {
                        "chatId": chat_id,
                        "chatType": message.chat.chat_type,
                        "callbackQueryId": callback.id,
                        "callbackData": data,
                        "from": user_json(Some(&callback.from)),
                        "topicId": topic_id,
                    }
                });
                self.forward_to_tenant(&binding.tenant_id, &envelope).await?;
                // Ack the spinner; failure here never un-acks the forward.
                self.client
                    .call(
                        "answerCallbackQuery",
                        &json!({"callback_query_id": callback.id}),
                    )
                    .await
                    .ok();
                Ok(())
            }
            None => {
                self.client
                    .call(
                        "answerCallbackQuery",
                        &json!({
                            "callback_query_id": callback.id,
                            "text": self.messages.invalid,
                            "show_alert": false,
                        }),
                    )
                    .await
                    .ok();
                Ok(())
            }
        }
    }

    fn session_key_for(
        &self,
        binding: &crate::models::Binding,
        route: &Route,
        chat_type: &str,
    ) -> Result<String, String> {
        pairing::binding_session_key(&self.db, binding, route, chat_type)
    }

    async fn build_message_envelope(
        &self,
        raw: &Value,
        message: &TgMessage,
        kind: &str,
        session_key: &str,
        topic_id: Option<&str>,
    ) -> Envelope {
        let chat_id = message.chat.id.to_string();
        let body = message
            .text
            .clone()
            .or_else(|| message.caption.clone())
            .unwrap_or_default();
        let from = message
            .from
            .as_ref()
            .map(|u| u.id.to_string())
            .unwrap_or_default();

        let mut envelope = Envelope::new(
            "telegram",
            kind,
            raw.clone(),
            session_key.to_string(),
            body,
            from,
            self.account_id.clone(),
            self.account_id.clone(),
            chat_type_label(&message.chat.chat_type),
            message.message_id.to_string(),
            message.date * 1000,
        );
        envelope.thread_id = topic_id.map(|t| t.to_string());

        let mut media_summary: Vec<Value> = Vec::new();
        let mut attachments: Vec<Attachment> = Vec::new();

        // Largest photo rendition only (Telegram sorts renditions ascending).
        if let Some(photo) = message.photo.as_ref()
            && let Some(largest) = photo.last()
        {
            if largest
                .file_size
                .is_none_or(|s| s as usize <= self.media_max_bytes)
            {
                match self
                    .client
                    .download_file(&largest.file_id, self.media_max_bytes)
                    .await
                {
                    Ok(bytes) => attachments.push(Attachment {
                        kind: "image".to_string(),
                        mime_type: "image/jpeg".to_string(),
                        file_name: "photo.jpg".to_string(),
                        content: base64::engine::general_purpose::STANDARD.encode(&bytes),
                    }),
                    Err(e) => {
                        self.log.relay_error("telegram photo download", &e);
                        media_summary.push(json!({"kind": "photo", "error": "download failed"}));
                    }
                }
            } else {
                media_summary.push(json!({"kind": "photo", "skipped": "over size cap"}));
            }
        }

        if let Some(document) = message.document.as_ref() {
            let mime = document.mime_type.clone().unwrap_or_default();
            let is_image = mime.starts_with("image/");
            let within_cap = document
                .file_size
                .is_none_or(|s| s as usize <= self.media_max_bytes);
            if is_image && within_cap {
                match self
                    .client
                    .download_file(&document.file_id, self.media_max_bytes)
                    .await
                {
                    Ok(bytes) => attachments.push(Attachment {
                        kind: "image".to_string(),
                        mime_type: mime.clone(),
                        file_name: document
                            .file_name
                            .clone()
                            .unwrap_or_else(|| "document".to_string()),
                        content: base64::engine::general_purpose::STANDARD.encode(&bytes),
                    }),
                    Err(e) => {
                        self.log.relay_error("telegram document download", &e);
                        media_summary.push(json!({"kind": "document", "mimeType": mime, "error": "download failed"}));
                    }
                }
            } else {
                media_summary.push(json!({
                    "kind": "document",
                    "mimeType": mime,
                    "fileName": document.file_name,
                    "fileSize": document.file_size,
                }));
            }
        }

        // Videos and animations are summarized, never downloaded.
        if message.video.is_some() {
            media_summary.push(json!({"kind": "video"}));
        }
        if message.animation.is_some() {
            media_summary.push(json!({"kind": "animation"}));
        }

        envelope.channel_data = json!({
            "telegram": {
                "chatId": chat_id,
                "chatType": message.chat.chat_type,
                "chatTitle": message.chat.title,
                "from": user_json(message.from.as_ref()),
                "topicId": topic_id,
                "media": if media_summary.is_empty() { Value::Null } else { Value::Array(media_summary) },
            }
        });
        if !attachments.is_empty() {
            envelope.attachments = Some(attachments);
        }
        envelope
    }

    async fn forward_to_tenant(&self, tenant_id: &str, envelope: &Envelope) -> Result<(), String> {
        let tenant = self
            .db
            .find_tenant(tenant_id)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("tenant {tenant_id} missing"))?;
        self.forwarder
            .forward(&tenant, envelope)
            .await
            .map_err(|e| e.to_string())?;
        self.log.event(
            "inbound_forwarded",
            json!({"tenantId": tenant_id, "channel": "telegram", "eventId": envelope.event_id, "kind": envelope.event.kind}),
        );
        Ok(())
    }

    /// Best-effort user notice into the chat; failures are logged, never fatal.
    async fn send_notice(&self, chat_id: &str, topic_id: Option<&str>, text: &str) {
        let mut body = json!({"chat_id": chat_id, "text": text});
        if let Some(topic) = topic_id
            && let Ok(id) = topic.parse::<i64>()
        {
            body["message_thread_id"] = json!(id);
        }
        if let Err(e) = self.client.call("sendMessage", &body).await {
            self.log
                .relay_error("telegram pairing notice", &e.to_string());
        }
    }
}

fn chat_type_label(telegram_type: &str) -> String {
    match telegram_type {
        "private" => "direct".to_string(),
        "channel" => "channel".to_string(),
        _ => "group".to_string(),
    }
}

fn user_json(user: Option<&TgUser>) -> Value {
    match user {
        Some(u) => json!({"id": u.id.to_string(), "username": u.username, "firstName": u.first_name}),
        None => Value::Null,
    }
}
