use serde::Serialize;

/// Normalized inbound event the mux posts to a tenant's inbound URL.
/// Shape is identical across providers; only `channel` and the
/// `channelData.<provider>` sub-object vary. `body` carries the user text
/// bit-for-bit — no trimming anywhere on this path.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub event_id: String,
    pub channel: String,
    pub event: EnvelopeEvent,
    pub raw: serde_json::Value,
    pub session_key: String,
    pub body: String,
    pub from: String,
    pub to: String,
    pub account_id: String,
    pub chat_type: String,
    pub message_id: String,
    pub timestamp_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub channel_data: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeEvent {
    pub kind: String,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,
    pub mime_type: String,
    pub file_name: String,
    /// base64 of the downloaded bytes.
    pub content: String,
}

impl Envelope {
    /// Construct with a fresh event id and the raw provider event duplicated
    /// into both `event.raw` and the top-level `raw` (older tenant SDKs read
    /// the top-level field).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channel: &str,
        kind: &str,
        raw: serde_json::Value,
        session_key: String,
        body: String,
        from: String,
        to: String,
        account_id: String,
        chat_type: String,
        message_id: String,
        timestamp_ms: i64,
    ) -> Envelope {
        Envelope {
            event_id: format!("evt_{:032x}", uuid::Uuid::new_v4().as_u128()),
            channel: channel.to_string(),
            event: EnvelopeEvent {
                kind: kind.to_string(),
                raw: raw.clone(),
            },
            raw,
            session_key,
            body,
            from,
            to,
            account_id,
            chat_type,
            message_id,
            timestamp_ms,
            thread_id: None,
            channel_data: serde_json::json!({}),
            attachments: None,
        }
    }
}
