use serde::Deserialize;
use std::collections::HashSet;
use std::env;

/// Process-wide configuration, read once at startup and frozen.
///
/// Environment variables:
/// - `DATABASE_PATH` — SQLite file (default: data/mux.db)
/// - `LOG_PATH` — JSON-lines event log (default: data/mux.log)
/// - `ADMIN_TOKEN` — bearer for admin endpoints; unset disables them (404)
/// - `TENANT_SEED_JSON` — `[{id,name,apiKey,inboundUrl?,inboundTimeoutMs?}]`
/// - `PAIRING_CODE_SEED_JSON` — `[{code,channel,routeKey,scope,expiresAtMs?}]`
/// - `IDEMPOTENCY_TTL_MS` — outbound replay-cache TTL (default: 600000)
/// - `PAIRING_TOKEN_TTL_SEC` / `PAIRING_TOKEN_TTL_MAX_SEC` — token lifetimes
/// - `TELEGRAM_ENABLED` / `DISCORD_ENABLED` / `WHATSAPP_ENABLED` — inbound loops
/// - `TELEGRAM_BOT_TOKEN`, `DISCORD_BOT_TOKEN` — provider credentials
/// - `TELEGRAM_API_BASE`, `DISCORD_API_BASE` — overridable for testing
/// - `TELEGRAM_BOT_USERNAME` — enables the t.me deep link on token issuance
/// - `*_ACCOUNT_ID` — account segment used in route keys (default: "default")
/// - `MEDIA_MAX_BYTES` — attachment download cap (default: 5 MiB)
/// - `DISCORD_POLL_INTERVAL_MS` — fixed poll interval (default: 2000)
/// - `WA_QUEUE_BATCH_SIZE`, `WA_RETRY_INITIAL_MS`, `WA_RETRY_MAX_MS` — retry queue
/// - `WA_AUTH_DIR` — directory owned by the WhatsApp session library
/// - `PAIRING_MSG_SUCCESS` / `PAIRING_MSG_INVALID` / `PAIRING_MSG_UNPAIRED` — notices
pub struct Config {
    pub database_path: String,
    pub log_path: String,
    pub admin_token: Option<String>,
    pub tenant_seeds: Vec<TenantSeed>,
    pub code_seeds: Vec<PairingCodeSeed>,
    pub idempotency_ttl_ms: i64,
    pub pairing_token_ttl_sec: i64,
    pub pairing_token_ttl_max_sec: i64,
    pub media_max_bytes: usize,
    pub telegram: TelegramConfig,
    pub discord: DiscordConfig,
    pub whatsapp: WhatsAppConfig,
    pub messages: PairingMessages,
}

pub struct TelegramConfig {
    pub poll_enabled: bool,
    pub bot_token: Option<String>,
    pub api_base: String,
    pub account_id: String,
    pub bot_username: Option<String>,
}

pub struct DiscordConfig {
    pub poll_enabled: bool,
    pub bot_token: Option<String>,
    pub api_base: String,
    pub account_id: String,
    pub poll_interval_ms: u64,
}

pub struct WhatsAppConfig {
    pub enabled: bool,
    pub account_id: String,
    pub auth_dir: Option<String>,
    pub queue_batch_size: i64,
    pub retry_initial_ms: i64,
    pub retry_max_ms: i64,
}

/// User-facing pairing notices, localizable via env.
#[derive(Clone)]
pub struct PairingMessages {
    pub success: String,
    pub invalid: String,
    pub unpaired: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TenantSeed {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub api_key: String,
    #[serde(default)]
    pub inbound_url: Option<String>,
    #[serde(default)]
    pub inbound_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PairingCodeSeed {
    pub code: String,
    pub channel: String,
    pub route_key: String,
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default)]
    pub expires_at_ms: Option<i64>,
}

fn default_scope() -> String {
    "chat".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_path: "data/mux.db".to_string(),
            log_path: "data/mux.log".to_string(),
            admin_token: None,
            tenant_seeds: Vec::new(),
            code_seeds: Vec::new(),
            idempotency_ttl_ms: 600_000,
            pairing_token_ttl_sec: 600,
            pairing_token_ttl_max_sec: 3600,
            media_max_bytes: 5 * 1024 * 1024,
            telegram: TelegramConfig {
                poll_enabled: false,
                bot_token: None,
                api_base: "https://api.telegram.org".to_string(),
                account_id: "default".to_string(),
                bot_username: None,
            },
            discord: DiscordConfig {
                poll_enabled: false,
                bot_token: None,
                api_base: "https://discord.com/api/v10".to_string(),
                account_id: "default".to_string(),
                poll_interval_ms: 2000,
            },
            whatsapp: WhatsAppConfig {
                enabled: false,
                account_id: "default".to_string(),
                auth_dir: None,
                queue_batch_size: 25,
                retry_initial_ms: 5000,
                retry_max_ms: 300_000,
            },
            messages: PairingMessages {
                success: "Paired. This chat is now connected.".to_string(),
                invalid: "That pairing token is invalid or expired.".to_string(),
                unpaired: "This chat is not paired yet. Ask your service for a pairing token and send it here.".to_string(),
            },
        }
    }
}

impl Config {
    /// Read configuration from the environment. Invalid values are startup
    /// errors, not silent defaults: numeric envs must be positive integers and
    /// seed JSON must parse with unique ids/keys/codes.
    pub fn from_env() -> Result<Config, String> {
        let mut config = Config::default();

        if let Ok(v) = env::var("DATABASE_PATH") {
            config.database_path = v;
        }
        if let Ok(v) = env::var("LOG_PATH") {
            config.log_path = v;
        }
        if let Ok(v) = env::var("ADMIN_TOKEN")
            && !v.is_empty()
        {
            config.admin_token = Some(v);
        }

        if let Some(n) = positive_int("IDEMPOTENCY_TTL_MS")? {
            config.idempotency_ttl_ms = n;
        }
        if let Some(n) = positive_int("PAIRING_TOKEN_TTL_SEC")? {
            config.pairing_token_ttl_sec = n;
        }
        if let Some(n) = positive_int("PAIRING_TOKEN_TTL_MAX_SEC")? {
            config.pairing_token_ttl_max_sec = n;
        }
        if config.pairing_token_ttl_sec > config.pairing_token_ttl_max_sec {
            return Err("PAIRING_TOKEN_TTL_SEC exceeds PAIRING_TOKEN_TTL_MAX_SEC".to_string());
        }
        if let Some(n) = positive_int("MEDIA_MAX_BYTES")? {
            config.media_max_bytes = n as usize;
        }

        config.telegram.poll_enabled = flag("TELEGRAM_ENABLED");
        if let Ok(v) = env::var("TELEGRAM_BOT_TOKEN")
            && !v.is_empty()
        {
            config.telegram.bot_token = Some(v);
        }
        if let Ok(v) = env::var("TELEGRAM_API_BASE") {
            config.telegram.api_base = v.trim_end_matches('/').to_string();
        }
        if let Ok(v) = env::var("TELEGRAM_ACCOUNT_ID") {
            config.telegram.account_id = v;
        }
        if let Ok(v) = env::var("TELEGRAM_BOT_USERNAME")
            && !v.is_empty()
        {
            config.telegram.bot_username = Some(v.trim_start_matches('@').to_string());
        }

        config.discord.poll_enabled = flag("DISCORD_ENABLED");
        if let Ok(v) = env::var("DISCORD_BOT_TOKEN")
            && !v.is_empty()
        {
            config.discord.bot_token = Some(v);
        }
        if let Ok(v) = env::var("DISCORD_API_BASE") {
            config.discord.api_base = v.trim_end_matches('/').to_string();
        }
        if let Ok(v) = env::var("DISCORD_ACCOUNT_ID") {
            config.discord.account_id = v;
        }
        if let Some(n) = positive_int("DISCORD_POLL_INTERVAL_MS")? {
            config.discord.poll_interval_ms = n as u64;
        }

        config.whatsapp.enabled = flag("WHATSAPP_ENABLED");
        if let Ok(v) = env::var("WHATSAPP_ACCOUNT_ID") {
            config.whatsapp.account_id = v;
        }
        if let Ok(v) = env::var("WA_AUTH_DIR")
            && !v.is_empty()
        {
            config.whatsapp.auth_dir = Some(v);
        }
        if let Some(n) = positive_int("WA_QUEUE_BATCH_SIZE")? {
            config.whatsapp.queue_batch_size = n;
        }
        if let Some(n) = positive_int("WA_RETRY_INITIAL_MS")? {
            config.whatsapp.retry_initial_ms = n;
        }
        if let Some(n) = positive_int("WA_RETRY_MAX_MS")? {
            config.whatsapp.retry_max_ms = n;
        }

        if let Ok(v) = env::var("PAIRING_MSG_SUCCESS")
            && !v.is_empty()
        {
            config.messages.success = v;
        }
        if let Ok(v) = env::var("PAIRING_MSG_INVALID")
            && !v.is_empty()
        {
            config.messages.invalid = v;
        }
        if let Ok(v) = env::var("PAIRING_MSG_UNPAIRED")
            && !v.is_empty()
        {
            config.messages.unpaired = v;
        }

        if let Ok(raw) = env::var("TENANT_SEED_JSON")
            && !raw.trim().is_empty()
        {
            config.tenant_seeds = parse_tenant_seeds(&raw)?;
        }
        if let Ok(raw) = env::var("PAIRING_CODE_SEED_JSON")
            && !raw.trim().is_empty()
        {
            config.code_seeds = parse_code_seeds(&raw)?;
        }

        Ok(config)
    }
}

/// Truthy env flag: set and not "0"/"false".
fn flag(name: &str) -> bool {
    env::var(name)
        .map(|v| v != "0" && v.to_lowercase() != "false" && !v.is_empty())
        .unwrap_or(false)
}

/// Parse an env var as a positive integer. Absent → None; present-but-invalid
/// is a startup error.
fn positive_int(name: &str) -> Result<Option<i64>, String> {
    match env::var(name) {
        Err(_) => Ok(None),
        Ok(raw) => match raw.trim().parse::<i64>() {
            Ok(n) if n > 0 => Ok(Some(n)),
            _ => Err(format!("{name} must be a positive integer, got {raw:?}")),
        },
    }
}

pub fn parse_tenant_seeds(raw: &str) -> Result<Vec<TenantSeed>, String> {
    let seeds: Vec<TenantSeed> =
        serde_json::from_str(raw).map_err(|e| format!("TENANT_SEED_JSON: {e}"))?;
    let mut ids = HashSet::new();
    let mut keys = HashSet::new();
    for seed in &seeds {
        if seed.id.trim().is_empty() {
            return Err("TENANT_SEED_JSON: tenant id must be non-empty".to_string());
        }
        if seed.api_key.trim().is_empty() {
            return Err(format!("TENANT_SEED_JSON: tenant {} has empty apiKey", seed.id));
        }
        if !ids.insert(seed.id.clone()) {
            return Err(format!("TENANT_SEED_JSON: duplicate tenant id {}", seed.id));
        }
        if !keys.insert(seed.api_key.clone()) {
            return Err(format!("TENANT_SEED_JSON: duplicate apiKey for tenant {}", seed.id));
        }
        if let Some(t) = seed.inbound_timeout_ms
            && t <= 0
        {
            return Err(format!("TENANT_SEED_JSON: tenant {} inboundTimeoutMs must be positive", seed.id));
        }
    }
    Ok(seeds)
}

pub fn parse_code_seeds(raw: &str) -> Result<Vec<PairingCodeSeed>, String> {
    let seeds: Vec<PairingCodeSeed> =
        serde_json::from_str(raw).map_err(|e| format!("PAIRING_CODE_SEED_JSON: {e}"))?;
    let mut codes = HashSet::new();
    for seed in &seeds {
        if seed.code.trim().is_empty() {
            return Err("PAIRING_CODE_SEED_JSON: code must be non-empty".to_string());
        }
        if !codes.insert(seed.code.clone()) {
            return Err(format!("PAIRING_CODE_SEED_JSON: duplicate code {}", seed.code));
        }
        if crate::route_key::parse_route_key(&seed.route_key).is_none() {
            return Err(format!(
                "PAIRING_CODE_SEED_JSON: code {} has unparseable routeKey {}",
                seed.code, seed.route_key
            ));
        }
    }
    Ok(seeds)
}
