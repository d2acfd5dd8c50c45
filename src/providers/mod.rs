pub mod discord;
pub mod telegram;
pub mod whatsapp;

/// A provider call that failed. `details` is whatever the provider returned
/// (JSON body or text), surfaced verbatim in 502 responses.
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub message: String,
    pub details: serde_json::Value,
}

impl ProviderError {
    pub fn new(message: impl Into<String>, details: serde_json::Value) -> ProviderError {
        ProviderError {
            message: message.into(),
            details,
        }
    }

    pub fn transport(message: impl std::fmt::Display) -> ProviderError {
        ProviderError {
            message: message.to_string(),
            details: serde_json::Value::Null,
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Download a media URL with a byte cap. Returns the bytes and the
/// content type the server claimed, if any. Oversized bodies are an error;
/// attachments beyond the cap are summarized, never forwarded.
pub async fn fetch_bytes_capped(
    client: &reqwest::Client,
    url: &str,
    cap: usize,
) -> Result<(Vec<u8>, Option<String>), String> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| format!("media fetch failed: {e}"))?;
    if !response.status().is_success() {
        return Err(format!("media fetch returned HTTP {}", response.status()));
    }
    if let Some(len) = response.content_length()
        && len as usize > cap
    {
        return Err(format!("media exceeds cap ({len} > {cap} bytes)"));
    }
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let bytes = response
        .bytes()
        .await
        .map_err(|e| format!("media read failed: {e}"))?;
    if bytes.len() > cap {
        return Err(format!("media exceeds cap ({} > {cap} bytes)", bytes.len()));
    }
    Ok((bytes.to_vec(), content_type))
}

/// "photo.jpg" → image/jpeg-ish guess used when the provider omits a mime.
pub fn infer_image_mime(file_name: &str) -> Option<&'static str> {
    let lower = file_name.to_lowercase();
    if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        Some("image/jpeg")
    } else if lower.ends_with(".png") {
        Some("image/png")
    } else if lower.ends_with(".gif") {
        Some("image/gif")
    } else if lower.ends_with(".webp") {
        Some("image/webp")
    } else {
        None
    }
}
