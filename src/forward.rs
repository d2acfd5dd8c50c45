use crate::envelope::Envelope;
use crate::models::Tenant;
use std::time::Duration;

/// Why a tenant forward did not land. Every variant is retryable from the
/// caller's point of view; the offset/queue row stays put either way.
#[derive(Debug)]
pub enum ForwardError {
    /// Tenant has no inbound URL configured yet.
    NotConfigured,
    /// Tenant answered outside 2xx.
    Status(u16),
    /// Transport-level failure (connect, timeout, TLS).
    Transport(String),
}

impl std::fmt::Display for ForwardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForwardError::NotConfigured => write!(f, "tenant inbound target not configured"),
            ForwardError::Status(code) => write!(f, "tenant inbound returned HTTP {code}"),
            ForwardError::Transport(e) => write!(f, "tenant inbound transport error: {e}"),
        }
    }
}

/// Posts envelopes to tenant inbound URLs. One shared client; the per-tenant
/// timeout is applied per request.
pub struct InboundForwarder {
    client: reqwest::Client,
}

impl Default for InboundForwarder {
    fn default() -> Self {
        Self::new()
    }
}

impl InboundForwarder {
    pub fn new() -> InboundForwarder {
        InboundForwarder {
            client: reqwest::Client::new(),
        }
    }

    /// Deliver one envelope. Success is any 2xx within the tenant's timeout.
    pub async fn forward(&self, tenant: &Tenant, envelope: &Envelope) -> Result<(), ForwardError> {
        let url = tenant
            .inbound_url
            .as_deref()
            .ok_or(ForwardError::NotConfigured)?;
        let timeout = Duration::from_millis(tenant.inbound_timeout_ms.max(1) as u64);

        let mut request = self
            .client
            .post(url)
            .timeout(timeout)
            .header("Content-Type", "application/json")
            .json(envelope);
        if let Some(token) = tenant.inbound_token.as_deref() {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| ForwardError::Transport(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ForwardError::Status(response.status().as_u16()))
        }
    }
}
