use base64::Engine;
use rand::RngCore;
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};
use std::sync::Mutex;

use crate::models::{
    Binding, IdempotencyRow, PairingCodeRow, PairingTokenRow, SessionRoute, Tenant, WaQueueRow,
};

pub struct Db {
    pub conn: Mutex<Connection>,
}

/// Generate a binding id: `bind_<32 hex chars>`
pub fn generate_binding_id() -> String {
    format!("bind_{:032x}", uuid::Uuid::new_v4().as_u128())
}

/// Generate a tenant inbound token: `mit_<32 hex chars>`. Returned once from
/// admin bootstrap; the mux presents it as bearer on every tenant forward.
pub fn generate_inbound_token() -> String {
    format!("mit_{:032x}", uuid::Uuid::new_v4().as_u128())
}

/// Generate a pairing token: `mpt_` + base64url of 24 random bytes.
/// Only the SHA-256 of the full string is ever stored.
pub fn generate_pairing_token() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "mpt_{}",
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
    )
}

/// SHA-256 hex of a secret (API keys, pairing tokens).
pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Outcome of an atomic pairing-code claim.
pub enum CodeClaimOutcome {
    Claimed(PairingCodeRow),
    /// Absent or expired.
    NotFound,
    /// Exists, unexpired, but already claimed.
    AlreadyClaimed,
}

impl Db {
    pub fn new(path: &str) -> Self {
        let conn = Connection::open(path).expect("Failed to open database");
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )
        .expect("Failed to set pragmas");
        let db = Db {
            conn: Mutex::new(conn),
        };
        db.migrate();
        db
    }

    fn migrate(&self) {
        let conn = self.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tenants (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                api_key_hash TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL DEFAULT 'active',
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tenants_status ON tenants(status);

            CREATE TABLE IF NOT EXISTS pairing_codes (
                code TEXT PRIMARY KEY,
                channel TEXT NOT NULL,
                route_key TEXT NOT NULL,
                scope TEXT NOT NULL DEFAULT 'chat',
                expires_at_ms INTEGER NOT NULL,
                claimed_by_tenant_id TEXT,
                claimed_at_ms INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_pairing_codes_expiry ON pairing_codes(expires_at_ms);

            CREATE TABLE IF NOT EXISTS pairing_tokens (
                token_hash TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                session_key TEXT,
                created_at_ms INTEGER NOT NULL,
                expires_at_ms INTEGER NOT NULL,
                consumed_at_ms INTEGER,
                consumed_binding_id TEXT,
                consumed_route_key TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_pairing_tokens_tenant
                ON pairing_tokens(tenant_id, channel, expires_at_ms);

            CREATE TABLE IF NOT EXISTS bindings (
                binding_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                scope TEXT NOT NULL DEFAULT 'chat',
                route_key TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_bindings_tenant ON bindings(tenant_id, channel);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_bindings_active_route
                ON bindings(channel, route_key) WHERE status = 'active';

            CREATE TABLE IF NOT EXISTS session_routes (
                tenant_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                session_key TEXT NOT NULL,
                binding_id TEXT NOT NULL,
                channel_context_json TEXT NOT NULL DEFAULT '{}',
                updated_at_ms INTEGER NOT NULL,
                PRIMARY KEY (tenant_id, channel, session_key)
            );
            CREATE INDEX IF NOT EXISTS idx_session_routes_binding ON session_routes(binding_id);

            CREATE TABLE IF NOT EXISTS idempotency_keys (
                tenant_id TEXT NOT NULL,
                key TEXT NOT NULL,
                request_fingerprint TEXT NOT NULL,
                response_status INTEGER NOT NULL,
                response_body TEXT NOT NULL,
                expires_at_ms INTEGER NOT NULL,
                PRIMARY KEY (tenant_id, key)
            );
            CREATE INDEX IF NOT EXISTS idx_idempotency_expiry ON idempotency_keys(expires_at_ms);

            CREATE TABLE IF NOT EXISTS provider_offsets (
                provider TEXT NOT NULL,
                scope TEXT NOT NULL,
                offset_value TEXT NOT NULL,
                updated_at_ms INTEGER NOT NULL,
                PRIMARY KEY (provider, scope)
            );

            CREATE TABLE IF NOT EXISTS whatsapp_inbound_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                dedupe_key TEXT NOT NULL UNIQUE,
                payload_json TEXT NOT NULL,
                next_attempt_at_ms INTEGER NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_wa_queue_due
                ON whatsapp_inbound_queue(next_attempt_at_ms, id);

            CREATE TABLE IF NOT EXISTS audit_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_tenant ON audit_logs(tenant_id, created_at_ms);",
        )
        .expect("Failed to run migrations");

        // Inbound-target columns arrived after the first tenants schema.
        // ALTER is idempotent via .ok() (duplicate-column errors ignored).
        conn.execute_batch("ALTER TABLE tenants ADD COLUMN inbound_url TEXT;")
            .ok();
        conn.execute_batch("ALTER TABLE tenants ADD COLUMN inbound_token TEXT;")
            .ok();
        conn.execute_batch(
            "ALTER TABLE tenants ADD COLUMN inbound_timeout_ms INTEGER NOT NULL DEFAULT 15000;",
        )
        .ok();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // --- Tenants ---

    /// Admin bootstrap / seed upsert. Keeps the existing inbound token when the
    /// tenant already has one; generates it on first insert.
    pub fn upsert_tenant(
        &self,
        id: &str,
        name: &str,
        api_key_hash: &str,
        inbound_url: Option<&str>,
        inbound_timeout_ms: Option<i64>,
    ) -> rusqlite::Result<Tenant> {
        let conn = self.lock();
        let now = now_ms();
        let existing: Option<(Option<String>, i64)> = conn
            .query_row(
                "SELECT inbound_token, inbound_timeout_ms FROM tenants WHERE id = ?1",
                params![id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;

        match existing {
            Some((token, old_timeout)) => {
                let token = token.unwrap_or_else(generate_inbound_token);
                let timeout = inbound_timeout_ms.unwrap_or(old_timeout);
                conn.execute(
                    "UPDATE tenants SET name = ?2, api_key_hash = ?3, status = 'active',
                            inbound_url = COALESCE(?4, inbound_url),
                            inbound_token = ?5, inbound_timeout_ms = ?6, updated_at_ms = ?7
                     WHERE id = ?1",
                    params![id, name, api_key_hash, inbound_url, token, timeout, now],
                )?;
            }
            None => {
                let token = generate_inbound_token();
                let timeout = inbound_timeout_ms.unwrap_or(15_000);
                conn.execute(
                    "INSERT INTO tenants (id, name, api_key_hash, status, inbound_url, inbound_token,
                                          inbound_timeout_ms, created_at_ms, updated_at_ms)
                     VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?6, ?7, ?7)",
                    params![id, name, api_key_hash, inbound_url, token, timeout, now],
                )?;
            }
        }
        let tenant = conn.query_row(
            "SELECT id, name, api_key_hash, status, inbound_url, inbound_token, inbound_timeout_ms
             FROM tenants WHERE id = ?1",
            params![id],
            tenant_from_row,
        )?;
        Ok(tenant)
    }

    pub fn find_tenant(&self, id: &str) -> rusqlite::Result<Option<Tenant>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, name, api_key_hash, status, inbound_url, inbound_token, inbound_timeout_ms
             FROM tenants WHERE id = ?1",
            params![id],
            tenant_from_row,
        )
        .optional()
    }

    /// Active tenant whose API-key hash matches. The authn lookup.
    pub fn find_tenant_by_key_hash(&self, api_key_hash: &str) -> rusqlite::Result<Option<Tenant>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, name, api_key_hash, status, inbound_url, inbound_token, inbound_timeout_ms
             FROM tenants WHERE api_key_hash = ?1 AND status = 'active'",
            params![api_key_hash],
            tenant_from_row,
        )
        .optional()
    }

    pub fn set_inbound_target(
        &self,
        tenant_id: &str,
        inbound_url: &str,
        inbound_timeout_ms: Option<i64>,
    ) -> rusqlite::Result<bool> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE tenants SET inbound_url = ?2,
                    inbound_timeout_ms = COALESCE(?3, inbound_timeout_ms),
                    updated_at_ms = ?4
             WHERE id = ?1",
            params![tenant_id, inbound_url, inbound_timeout_ms, now_ms()],
        )?;
        Ok(changed > 0)
    }

    // --- Pairing codes ---

    /// Seed insert: codes are insert-if-absent, never overwritten.
    pub fn seed_pairing_code(
        &self,
        code: &str,
        channel: &str,
        route_key: &str,
        scope: &str,
        expires_at_ms: i64,
    ) -> rusqlite::Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO pairing_codes (code, channel, route_key, scope, expires_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![code, channel, route_key, scope, expires_at_ms],
        )?;
        Ok(())
    }

    /// Atomic claim: succeeds only while unclaimed and unexpired.
    pub fn claim_pairing_code(
        &self,
        code: &str,
        tenant_id: &str,
        now: i64,
    ) -> rusqlite::Result<CodeClaimOutcome> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE pairing_codes SET claimed_by_tenant_id = ?2, claimed_at_ms = ?3
             WHERE code = ?1 AND claimed_by_tenant_id IS NULL AND expires_at_ms > ?3",
            params![code, tenant_id, now],
        )?;
        if changed == 0 {
            let claimed: Option<bool> = conn
                .query_row(
                    "SELECT claimed_by_tenant_id IS NOT NULL FROM pairing_codes
                     WHERE code = ?1 AND expires_at_ms > ?2",
                    params![code, now],
                    |r| r.get(0),
                )
                .optional()?;
            return Ok(match claimed {
                Some(true) => CodeClaimOutcome::AlreadyClaimed,
                // Unclaimed-but-unexpired with changes=0 can't happen; treat as absent.
                _ => CodeClaimOutcome::NotFound,
            });
        }
        let row = conn.query_row(
            "SELECT code, channel, route_key, scope, expires_at_ms FROM pairing_codes WHERE code = ?1",
            params![code],
            |r| {
                Ok(PairingCodeRow {
                    code: r.get(0)?,
                    channel: r.get(1)?,
                    route_key: r.get(2)?,
                    scope: r.get(3)?,
                    expires_at_ms: r.get(4)?,
                })
            },
        )?;
        Ok(CodeClaimOutcome::Claimed(row))
    }

    // --- Pairing tokens ---

    pub fn insert_pairing_token(
        &self,
        token_hash: &str,
        tenant_id: &str,
        channel: &str,
        session_key: Option<&str>,
        created_at_ms: i64,
        expires_at_ms: i64,
    ) -> rusqlite::Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO pairing_tokens (token_hash, tenant_id, channel, session_key, created_at_ms, expires_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![token_hash, tenant_id, channel, session_key, created_at_ms, expires_at_ms],
        )?;
        Ok(())
    }

    /// Atomic single-use consumption, scoped to the channel the token was
    /// issued for (and, when given, the tenant — the Discord redemption path
    /// refuses another tenant's token). Returns the token row when this call
    /// won the race; None when absent, expired, consumed, or out of scope.
    pub fn consume_pairing_token(
        &self,
        token_hash: &str,
        channel: &str,
        tenant_id: Option<&str>,
        now: i64,
    ) -> rusqlite::Result<Option<PairingTokenRow>> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE pairing_tokens SET consumed_at_ms = ?2
             WHERE token_hash = ?1 AND channel = ?3 AND (?4 IS NULL OR tenant_id = ?4)
               AND consumed_at_ms IS NULL AND expires_at_ms > ?2",
            params![token_hash, now, channel, tenant_id],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        conn.query_row(
            "SELECT token_hash, tenant_id, channel, session_key, created_at_ms, expires_at_ms
             FROM pairing_tokens WHERE token_hash = ?1",
            params![token_hash],
            |r| {
                Ok(PairingTokenRow {
                    token_hash: r.get(0)?,
                    tenant_id: r.get(1)?,
                    channel: r.get(2)?,
                    session_key: r.get(3)?,
                    created_at_ms: r.get(4)?,
                    expires_at_ms: r.get(5)?,
                })
            },
        )
        .optional()
    }

    /// Record what a consumed token produced.
    pub fn record_token_consumption(
        &self,
        token_hash: &str,
        binding_id: &str,
        route_key: &str,
    ) -> rusqlite::Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE pairing_tokens SET consumed_binding_id = ?2, consumed_route_key = ?3
             WHERE token_hash = ?1",
            params![token_hash, binding_id, route_key],
        )?;
        Ok(())
    }

    /// Lazy purge of expired, never-consumed tokens.
    pub fn purge_expired_tokens(&self, now: i64) -> rusqlite::Result<usize> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM pairing_tokens WHERE consumed_at_ms IS NULL AND expires_at_ms <= ?1",
            params![now],
        )
    }

    // --- Bindings ---

    pub fn insert_binding(
        &self,
        binding_id: &str,
        tenant_id: &str,
        channel: &str,
        scope: &str,
        route_key: &str,
        status: &str,
    ) -> rusqlite::Result<()> {
        let conn = self.lock();
        let now = now_ms();
        conn.execute(
            "INSERT INTO bindings (binding_id, tenant_id, channel, scope, route_key, status, created_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![binding_id, tenant_id, channel, scope, route_key, status, now],
        )?;
        Ok(())
    }

    pub fn find_binding(&self, binding_id: &str) -> rusqlite::Result<Option<Binding>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT binding_id, tenant_id, channel, scope, route_key, status
             FROM bindings WHERE binding_id = ?1",
            params![binding_id],
            binding_from_row,
        )
        .optional()
    }

    pub fn find_active_binding_by_route(
        &self,
        channel: &str,
        route_key: &str,
    ) -> rusqlite::Result<Option<Binding>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT binding_id, tenant_id, channel, scope, route_key, status
             FROM bindings WHERE channel = ?1 AND route_key = ?2 AND status = 'active'",
            params![channel, route_key],
            binding_from_row,
        )
        .optional()
    }

    /// Pending-or-active lookup, newest first. The Discord pre-issue conflict
    /// check and the pollers both use this.
    pub fn find_open_binding_by_route(
        &self,
        channel: &str,
        route_key: &str,
    ) -> rusqlite::Result<Option<Binding>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT binding_id, tenant_id, channel, scope, route_key, status
             FROM bindings WHERE channel = ?1 AND route_key = ?2 AND status IN ('pending', 'active')
             ORDER BY created_at_ms DESC LIMIT 1",
            params![channel, route_key],
            binding_from_row,
        )
        .optional()
    }

    /// pending → active. Returns false when the row is not pending.
    pub fn activate_binding(&self, binding_id: &str) -> rusqlite::Result<bool> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE bindings SET status = 'active', updated_at_ms = ?2
             WHERE binding_id = ?1 AND status = 'pending'",
            params![binding_id, now_ms()],
        )?;
        Ok(changed > 0)
    }

    pub fn list_active_bindings(&self, tenant_id: &str) -> rusqlite::Result<Vec<Binding>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT binding_id, tenant_id, channel, scope, route_key, status
             FROM bindings WHERE tenant_id = ?1 AND status = 'active'
             ORDER BY created_at_ms ASC",
        )?;
        let rows = stmt.query_map(params![tenant_id], binding_from_row)?;
        rows.collect()
    }

    /// Every Discord binding the poller should watch (pending ones are polled
    /// for their pairing token, active ones for messages).
    pub fn list_discord_poll_bindings(&self) -> rusqlite::Result<Vec<Binding>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT binding_id, tenant_id, channel, scope, route_key, status
             FROM bindings WHERE channel = 'discord' AND status IN ('pending', 'active')
             ORDER BY created_at_ms ASC",
        )?;
        let rows = stmt.query_map([], binding_from_row)?;
        rows.collect()
    }

    /// Unbind: set inactive and drop dependent session routes in one
    /// transaction. Returns false when the binding is not this tenant's or is
    /// already inactive.
    pub fn deactivate_binding(&self, tenant_id: &str, binding_id: &str) -> rusqlite::Result<bool> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE bindings SET status = 'inactive', updated_at_ms = ?3
             WHERE binding_id = ?1 AND tenant_id = ?2 AND status != 'inactive'",
            params![binding_id, tenant_id, now_ms()],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        tx.execute(
            "DELETE FROM session_routes WHERE binding_id = ?1",
            params![binding_id],
        )?;
        tx.commit()?;
        Ok(true)
    }

    // --- Session routes ---

    pub fn upsert_session_route(
        &self,
        tenant_id: &str,
        channel: &str,
        session_key: &str,
        binding_id: &str,
        channel_context_json: &str,
    ) -> rusqlite::Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO session_routes (tenant_id, channel, session_key, binding_id, channel_context_json, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(tenant_id, channel, session_key)
             DO UPDATE SET binding_id = ?4, channel_context_json = ?5, updated_at_ms = ?6",
            params![tenant_id, channel, session_key, binding_id, channel_context_json, now_ms()],
        )?;
        Ok(())
    }

    /// Forward resolution: session route joined with its active binding.
    pub fn resolve_session_route(
        &self,
        tenant_id: &str,
        channel: &str,
        session_key: &str,
    ) -> rusqlite::Result<Option<(SessionRoute, Binding)>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT s.tenant_id, s.channel, s.session_key, s.binding_id, s.channel_context_json,
                    b.binding_id, b.tenant_id, b.channel, b.scope, b.route_key, b.status
             FROM session_routes s
             JOIN bindings b ON b.binding_id = s.binding_id AND b.status = 'active'
             WHERE s.tenant_id = ?1 AND s.channel = ?2 AND s.session_key = ?3",
            params![tenant_id, channel, session_key],
            |r| {
                Ok((
                    SessionRoute {
                        tenant_id: r.get(0)?,
                        channel: r.get(1)?,
                        session_key: r.get(2)?,
                        binding_id: r.get(3)?,
                        channel_context_json: r.get(4)?,
                    },
                    Binding {
                        binding_id: r.get(5)?,
                        tenant_id: r.get(6)?,
                        channel: r.get(7)?,
                        scope: r.get(8)?,
                        route_key: r.get(9)?,
                        status: r.get(10)?,
                    },
                ))
            },
        )
        .optional()
    }

    /// Session keys mapped to a binding, newest upsert first.
    pub fn session_keys_for_binding(&self, binding_id: &str) -> rusqlite::Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT session_key FROM session_routes WHERE binding_id = ?1
             ORDER BY updated_at_ms DESC, session_key",
        )?;
        let rows = stmt.query_map(params![binding_id], |r| r.get(0))?;
        rows.collect()
    }

    // --- Idempotency ---

    pub fn purge_expired_idempotency(&self, now: i64) -> rusqlite::Result<usize> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM idempotency_keys WHERE expires_at_ms <= ?1",
            params![now],
        )
    }

    pub fn get_idempotency(
        &self,
        tenant_id: &str,
        key: &str,
    ) -> rusqlite::Result<Option<IdempotencyRow>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT tenant_id, key, request_fingerprint, response_status, response_body, expires_at_ms
             FROM idempotency_keys WHERE tenant_id = ?1 AND key = ?2",
            params![tenant_id, key],
            |r| {
                Ok(IdempotencyRow {
                    tenant_id: r.get(0)?,
                    key: r.get(1)?,
                    request_fingerprint: r.get(2)?,
                    response_status: r.get::<_, i64>(3)? as u16,
                    response_body: r.get(4)?,
                    expires_at_ms: r.get(5)?,
                })
            },
        )
        .optional()
    }

    pub fn put_idempotency(
        &self,
        tenant_id: &str,
        key: &str,
        fingerprint: &str,
        response_status: u16,
        response_body: &str,
        expires_at_ms: i64,
    ) -> rusqlite::Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO idempotency_keys (tenant_id, key, request_fingerprint, response_status, response_body, expires_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(tenant_id, key)
             DO UPDATE SET request_fingerprint = ?3, response_status = ?4, response_body = ?5, expires_at_ms = ?6",
            params![tenant_id, key, fingerprint, response_status as i64, response_body, expires_at_ms],
        )?;
        Ok(())
    }

    // --- Provider offsets ---

    pub fn get_offset(&self, provider: &str, scope: &str) -> rusqlite::Result<Option<String>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT offset_value FROM provider_offsets WHERE provider = ?1 AND scope = ?2",
            params![provider, scope],
            |r| r.get(0),
        )
        .optional()
    }

    pub fn set_offset(&self, provider: &str, scope: &str, value: &str) -> rusqlite::Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO provider_offsets (provider, scope, offset_value, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(provider, scope) DO UPDATE SET offset_value = ?3, updated_at_ms = ?4",
            params![provider, scope, value, now_ms()],
        )?;
        Ok(())
    }

    // --- WhatsApp inbound queue ---

    /// Enqueue a listener snapshot. Returns false when the dedupe key already
    /// exists (the message is queued or mid-retry).
    pub fn enqueue_whatsapp(
        &self,
        dedupe_key: &str,
        payload_json: &str,
        now: i64,
    ) -> rusqlite::Result<bool> {
        let conn = self.lock();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO whatsapp_inbound_queue (dedupe_key, payload_json, next_attempt_at_ms, attempt_count, created_at_ms)
             VALUES (?1, ?2, ?3, 0, ?3)",
            params![dedupe_key, payload_json, now],
        )?;
        Ok(changed > 0)
    }

    pub fn due_whatsapp_rows(&self, now: i64, limit: i64) -> rusqlite::Result<Vec<WaQueueRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, dedupe_key, payload_json, next_attempt_at_ms, attempt_count, last_error
             FROM whatsapp_inbound_queue WHERE next_attempt_at_ms <= ?1
             ORDER BY id ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![now, limit], |r| {
            Ok(WaQueueRow {
                id: r.get(0)?,
                dedupe_key: r.get(1)?,
                payload_json: r.get(2)?,
                next_attempt_at_ms: r.get(3)?,
                attempt_count: r.get(4)?,
                last_error: r.get(5)?,
            })
        })?;
        rows.collect()
    }

    pub fn delete_whatsapp_row(&self, id: i64) -> rusqlite::Result<()> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM whatsapp_inbound_queue WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn defer_whatsapp_row(
        &self,
        id: i64,
        next_attempt_at_ms: i64,
        last_error: &str,
    ) -> rusqlite::Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE whatsapp_inbound_queue
             SET attempt_count = attempt_count + 1, next_attempt_at_ms = ?2, last_error = ?3
             WHERE id = ?1",
            params![id, next_attempt_at_ms, last_error],
        )?;
        Ok(())
    }

    // --- Audit log ---

    pub fn audit(&self, tenant_id: &str, event_type: &str, payload: &serde_json::Value) {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO audit_logs (tenant_id, event_type, payload_json, created_at_ms)
             VALUES (?1, ?2, ?3, ?4)",
            params![tenant_id, event_type, payload.to_string(), now_ms()],
        )
        .ok();
    }
}

fn tenant_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Tenant> {
    Ok(Tenant {
        id: r.get(0)?,
        name: r.get(1)?,
        api_key_hash: r.get(2)?,
        status: r.get(3)?,
        inbound_url: r.get(4)?,
        inbound_token: r.get(5)?,
        inbound_timeout_ms: r.get(6)?,
    })
}

fn binding_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Binding> {
    Ok(Binding {
        binding_id: r.get(0)?,
        tenant_id: r.get(1)?,
        channel: r.get(2)?,
        scope: r.get(3)?,
        route_key: r.get(4)?,
        status: r.get(5)?,
    })
}
