//! Durable retry worker for WhatsApp inbound messages.
//!
//! The listener only snapshots into `whatsapp_inbound_queue`; this worker
//! pulls due rows in id order, forwards them, and either deletes (acked) or
//! defers with exponential backoff. Rows are independent: one tenant's outage
//! never blocks another row.

use base64::Engine;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::config::PairingMessages;
use crate::db::{self, Db};
use crate::envelope::{Attachment, Envelope};
use crate::forward::InboundForwarder;
use crate::models::WaQueueRow;
use crate::pairing;
use crate::providers::whatsapp::{WaInboundMessage, WhatsAppRuntime};
use crate::relay_log::RelayLog;
use crate::route_key::{Route, WhatsAppRoute, whatsapp_session_key};

const WORKER_IDLE_SLEEP_MS: u64 = 1000;
const BACKOFF_EXPONENT_CAP: u32 = 10;

/// `min(max, initial * 2^min(attempt, 10))`
pub fn retry_delay_ms(attempt_count: i64, initial_ms: i64, max_ms: i64) -> i64 {
    let exponent = (attempt_count.max(0) as u32).min(BACKOFF_EXPONENT_CAP);
    initial_ms.saturating_mul(1i64 << exponent).min(max_ms)
}

pub struct WaQueueWorker {
    pub db: Db,
    pub forwarder: InboundForwarder,
    pub runtime: Arc<dyn WhatsAppRuntime>,
    pub log: Arc<RelayLog>,
    pub media_max_bytes: usize,
    pub messages: PairingMessages,
    pub batch_size: i64,
    pub retry_initial_ms: i64,
    pub retry_max_ms: i64,
}

impl WaQueueWorker {
    /// Process one batch of due rows. Row-level failures defer that row and
    /// keep going; only a DB-level failure aborts the pass.
    pub async fn run_pass(&self) -> Result<(), String> {
        let now = db::now_ms();
        let rows = self
            .db
            .due_whatsapp_rows(now, self.batch_size)
            .map_err(|e| e.to_string())?;
        for row in rows {
            self.process_row(&row).await?;
        }
        Ok(())
    }

    pub async fn run_loop(self, running: Arc<AtomicBool>) {
        while running.load(Ordering::Relaxed) {
            if let Err(e) = self.run_pass().await {
                self.log.relay_error("whatsapp queue pass", &e);
            }
            tokio::time::sleep(Duration::from_millis(WORKER_IDLE_SLEEP_MS)).await;
        }
    }

    async fn process_row(&self, row: &WaQueueRow) -> Result<(), String> {
        let message: WaInboundMessage = match serde_json::from_str(&row.payload_json) {
            Ok(m) => m,
            Err(e) => {
                // Unreadable snapshot can never succeed; drop it.
                self.log.relay_error(
                    "whatsapp queue payload parse",
                    &format!("row {}: {e}", row.id),
                );
                return self.db.delete_whatsapp_row(row.id).map_err(|e| e.to_string());
            }
        };

        let route = Route::WhatsApp(WhatsAppRoute {
            account: message.account_id.clone(),
            chat_jid: message.chat_jid.clone(),
        });
        let binding = self
            .db
            .find_active_binding_by_route("whatsapp", &route.to_key())
            .map_err(|e| e.to_string())?;

        let Some(binding) = binding else {
            if let Some(token) = pairing::extract_pairing_token(&message.body) {
                let chat_type = if message.chat_jid.ends_with("@g.us") {
                    "group"
                } else {
                    "direct"
                };
                let context = json!({"whatsapp": {"chatJid": message.chat_jid, "accountId": message.account_id}});
                let redeemed = pairing::redeem_in_situ(
                    &self.db,
                    &self.log,
                    &token,
                    &route,
                    chat_type,
                    &context.to_string(),
                )?;
                let notice = if redeemed.is_some() {
                    &self.messages.success
                } else {
                    &self.messages.invalid
                };
                if let Err(e) = self
                    .runtime
                    .send_message(&message.chat_jid, Some(notice), None)
                    .await
                {
                    self.log
                        .relay_error("whatsapp pairing notice", &e.to_string());
                }
            }
            // Unbound chatter (token or not) is finished either way.
            return self.db.delete_whatsapp_row(row.id).map_err(|e| e.to_string());
        };

        let envelope = self.build_envelope(&binding, &message)?;
        let tenant = self
            .db
            .find_tenant(&binding.tenant_id)
            .map_err(|e| e.to_string())?;
        let forward_result = match tenant {
            Some(tenant) => self
                .forwarder
                .forward(&tenant, &envelope)
                .await
                .map_err(|e| e.to_string()),
            None => Err(format!("tenant {} missing", binding.tenant_id)),
        };

        match forward_result {
            Ok(()) => {
                self.log.event(
                    "inbound_forwarded",
                    json!({"tenantId": binding.tenant_id, "channel": "whatsapp", "eventId": envelope.event_id, "dedupeKey": row.dedupe_key}),
                );
                self.db.delete_whatsapp_row(row.id).map_err(|e| e.to_string())
            }
            Err(reason) => {
                let delay =
                    retry_delay_ms(row.attempt_count, self.retry_initial_ms, self.retry_max_ms);
                self.db
                    .defer_whatsapp_row(row.id, db::now_ms() + delay, &reason)
                    .map_err(|e| e.to_string())?;
                self.log.event(
                    "whatsapp_deferred",
                    json!({"dedupeKey": row.dedupe_key, "attemptCount": row.attempt_count + 1, "delayMs": delay, "error": reason}),
                );
                Ok(())
            }
        }
    }

    fn build_envelope(
        &self,
        binding: &crate::models::Binding,
        message: &WaInboundMessage,
    ) -> Result<Envelope, String> {
        let chat_type = if message.chat_jid.ends_with("@g.us") {
            "group"
        } else {
            "direct"
        };
        let route = Route::WhatsApp(WhatsAppRoute {
            account: message.account_id.clone(),
            chat_jid: message.chat_jid.clone(),
        });
        let session_key = pairing::binding_session_key(&self.db, binding, &route, chat_type)
            .unwrap_or_else(|_| whatsapp_session_key(&message.chat_jid));

        let mut envelope = Envelope::new(
            "whatsapp",
            "message",
            message.raw.clone(),
            session_key,
            message.body.clone(),
            message.from.clone(),
            message.account_id.clone(),
            message.account_id.clone(),
            chat_type.to_string(),
            message
                .message_id
                .clone()
                .unwrap_or_else(|| format!("synthetic:{}", uuid::Uuid::new_v4())),
            message.timestamp_ms,
        );

        let mut media_summary: Vec<Value> = Vec::new();
        let mut attachments: Vec<Attachment> = Vec::new();
        if let Some(path) = message.media_path.as_deref() {
            let mime = message.media_mime.clone().unwrap_or_default();
            let file_name = message
                .media_file_name
                .clone()
                .unwrap_or_else(|| "media".to_string());
            if mime.starts_with("image/") {
                match std::fs::read(path) {
                    Ok(bytes) if bytes.len() <= self.media_max_bytes => {
                        attachments.push(Attachment {
                            kind: "image".to_string(),
                            mime_type: mime.clone(),
                            file_name,
                            content: base64::engine::general_purpose::STANDARD.encode(&bytes),
                        });
                    }
                    Ok(bytes) => {
                        media_summary.push(json!({"mimeType": mime, "fileName": file_name, "size": bytes.len(), "skipped": "over size cap"}));
                    }
                    Err(e) => {
                        self.log.relay_error("whatsapp media read", &e.to_string());
                        media_summary
                            .push(json!({"mimeType": mime, "fileName": file_name, "error": "read failed"}));
                    }
                }
            } else {
                media_summary.push(json!({"mimeType": mime, "fileName": file_name, "path": path}));
            }
        }

        envelope.channel_data = json!({
            "whatsapp": {
                "chatJid": message.chat_jid,
                "accountId": message.account_id,
                "media": if media_summary.is_empty() { Value::Null } else { Value::Array(media_summary) },
            }
        });
        if !attachments.is_empty() {
            envelope.attachments = Some(attachments);
        }
        Ok(envelope)
    }
}
