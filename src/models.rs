use serde::{Deserialize, Serialize};

// --- Persistence rows ---

#[derive(Debug, Clone)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub api_key_hash: String,
    pub status: String,
    pub inbound_url: Option<String>,
    pub inbound_token: Option<String>,
    pub inbound_timeout_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Binding {
    pub binding_id: String,
    pub tenant_id: String,
    pub channel: String,
    pub scope: String,
    pub route_key: String,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct SessionRoute {
    pub tenant_id: String,
    pub channel: String,
    pub session_key: String,
    pub binding_id: String,
    pub channel_context_json: String,
}

#[derive(Debug, Clone)]
pub struct PairingCodeRow {
    pub code: String,
    pub channel: String,
    pub route_key: String,
    pub scope: String,
    pub expires_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct PairingTokenRow {
    pub token_hash: String,
    pub tenant_id: String,
    pub channel: String,
    pub session_key: Option<String>,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct IdempotencyRow {
    pub tenant_id: String,
    pub key: String,
    pub request_fingerprint: String,
    pub response_status: u16,
    pub response_body: String,
    pub expires_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct WaQueueRow {
    pub id: i64,
    pub dedupe_key: String,
    pub payload_json: String,
    pub next_attempt_at_ms: i64,
    pub attempt_count: i64,
    pub last_error: Option<String>,
}

// --- HTTP request bodies ---
// Every field is optional at the serde layer; handlers validate presence so
// the error is a 400 naming the field instead of a parser rejection.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapRequest {
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub api_key: Option<String>,
    pub inbound_url: Option<String>,
    #[serde(default)]
    pub inbound_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundTargetRequest {
    pub inbound_url: Option<String>,
    #[serde(default)]
    pub inbound_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    pub channel: Option<String>,
    #[serde(default)]
    pub session_key: Option<String>,
    /// Discord only: the DM route the pending binding is created for.
    #[serde(default)]
    pub route_key: Option<String>,
    #[serde(default)]
    pub ttl_sec: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    pub code: Option<String>,
    #[serde(default)]
    pub session_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnbindRequest {
    pub binding_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingRequest {
    pub channel: Option<String>,
    pub session_key: Option<String>,
}

/// `/v1/mux/outbound/send` body. Parsed from the raw JSON text the handler
/// fingerprints; unknown fields are ignored for routing but survive in the
/// fingerprint.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    #[serde(default)]
    pub request_id: Option<String>,
    pub channel: Option<String>,
    pub session_key: Option<String>,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub media_urls: Option<Vec<String>>,
    #[serde(default)]
    pub reply_to_id: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub channel_data: Option<serde_json::Value>,
    #[serde(default)]
    pub raw: Option<RawPayload>,
    #[serde(default)]
    pub poll: Option<serde_json::Value>,
    #[serde(default)]
    pub op: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
}

impl SendRequest {
    /// Ordered media urls: `mediaUrl` first, then `mediaUrls`.
    pub fn all_media_urls(&self) -> Vec<String> {
        let mut urls = Vec::new();
        if let Some(u) = &self.media_url {
            urls.push(u.clone());
        }
        if let Some(more) = &self.media_urls {
            urls.extend(more.iter().cloned());
        }
        urls
    }

    pub fn is_typing_action(&self) -> bool {
        self.op.as_deref() == Some("action") || self.action.as_deref() == Some("typing")
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct RawPayload {
    #[serde(default)]
    pub telegram: Option<RawTelegram>,
    #[serde(default)]
    pub discord: Option<RawDiscord>,
}

#[derive(Debug, Deserialize)]
pub struct RawTelegram {
    pub method: String,
    #[serde(default)]
    pub body: serde_json::Value,
}

#[derive(Debug, Deserialize, Default)]
pub struct RawDiscord {
    /// Posted verbatim to `/channels/{id}/messages`.
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    /// Typed send via the Discord client.
    #[serde(default)]
    pub send: Option<RawDiscordSend>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawDiscordSend {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub media_urls: Option<Vec<String>>,
    #[serde(default)]
    pub reply_to: Option<String>,
}
