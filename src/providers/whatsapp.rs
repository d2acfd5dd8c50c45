//! WhatsApp integration seam.
//!
//! The mux never speaks the WhatsApp Web protocol itself; a session library
//! owns the socket and auth state. Everything the mux needs from it is behind
//! `WhatsAppRuntime`, supplied at construction time: production wires the
//! real library, tests wire a fake. Inbound messages are snapshotted into the
//! durable queue by the listener; the queue worker does the forwarding.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::db::{self, Db};
use crate::providers::ProviderError;
use crate::relay_log::RelayLog;

/// Snapshot of one inbound WhatsApp message, as captured by the listener
/// callback. This is what lands in `whatsapp_inbound_queue.payload_json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaInboundMessage {
    pub account_id: String,
    pub chat_jid: String,
    #[serde(default)]
    pub message_id: Option<String>,
    pub from: String,
    pub body: String,
    pub timestamp_ms: i64,
    /// Path of a media file the listener wrote, if any.
    #[serde(default)]
    pub media_path: Option<String>,
    #[serde(default)]
    pub media_mime: Option<String>,
    #[serde(default)]
    pub media_file_name: Option<String>,
    #[serde(default)]
    pub raw: serde_json::Value,
}

pub type WaListener = Arc<dyn Fn(WaInboundMessage) + Send + Sync>;

/// The session library surface. `set_active_listener` registers the inbound
/// callback; `monitor_inbox` runs the library's event pump until shutdown.
#[async_trait]
pub trait WhatsAppRuntime: Send + Sync {
    fn set_active_listener(&self, listener: WaListener);
    async fn monitor_inbox(&self) -> Result<(), String>;
    /// Send one message; returns the provider message id.
    async fn send_message(
        &self,
        chat_jid: &str,
        text: Option<&str>,
        media_url: Option<&str>,
    ) -> Result<String, ProviderError>;
    async fn send_typing(&self, chat_jid: &str) -> Result<(), ProviderError>;
}

/// Stand-in runtime when no WhatsApp session is configured: sends fail with a
/// clear error and the inbox pump exits immediately.
pub struct DisabledWhatsAppRuntime;

#[async_trait]
impl WhatsAppRuntime for DisabledWhatsAppRuntime {
    fn set_active_listener(&self, _listener: WaListener) {}

    async fn monitor_inbox(&self) -> Result<(), String> {
        Ok(())
    }

    async fn send_message(
        &self,
        _chat_jid: &str,
        _text: Option<&str>,
        _media_url: Option<&str>,
    ) -> Result<String, ProviderError> {
        Err(ProviderError::new(
            "whatsapp runtime not configured",
            serde_json::Value::Null,
        ))
    }

    async fn send_typing(&self, _chat_jid: &str) -> Result<(), ProviderError> {
        Err(ProviderError::new(
            "whatsapp runtime not configured",
            serde_json::Value::Null,
        ))
    }
}

/// Dedupe key for a listener snapshot: `account:chatJid:messageId`, or a
/// synthetic suffix when the library delivered no id.
pub fn dedupe_key(message: &WaInboundMessage) -> String {
    match message.message_id.as_deref() {
        Some(id) if !id.is_empty() => {
            format!("{}:{}:{}", message.account_id, message.chat_jid, id)
        }
        _ => format!(
            "{}:{}:synthetic:{}",
            message.account_id,
            message.chat_jid,
            uuid::Uuid::new_v4()
        ),
    }
}

/// Listener-side enqueue. Duplicate deliveries from the library are absorbed
/// by the unique dedupe key.
pub fn enqueue_inbound(db: &Db, log: &RelayLog, message: &WaInboundMessage) {
    let key = dedupe_key(message);
    let payload = match serde_json::to_string(message) {
        Ok(p) => p,
        Err(e) => {
            log.relay_error("whatsapp enqueue serialize", &e.to_string());
            return;
        }
    };
    match db.enqueue_whatsapp(&key, &payload, db::now_ms()) {
        Ok(true) => log.event(
            "whatsapp_enqueued",
            json!({"dedupeKey": key, "chatJid": message.chat_jid}),
        ),
        Ok(false) => {}
        Err(e) => log.relay_error("whatsapp enqueue", &e.to_string()),
    }
}
