use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::watch;

/// A completed outbound response, replayable byte-for-byte.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub status: u16,
    pub body: String,
}

struct InflightEntry {
    fingerprint: String,
    tx: watch::Sender<Option<CachedResponse>>,
}

/// What `begin` decided for this `(tenant, key)`:
/// exactly one caller dispatches; the rest join or conflict.
pub enum Admission {
    /// This caller owns the dispatch. It must call `complete` when done.
    Dispatch,
    /// Another dispatch is in flight with the same fingerprint; await it.
    Join(watch::Receiver<Option<CachedResponse>>),
    /// Another dispatch is in flight with a different fingerprint.
    Conflict,
}

/// In-memory request coalescing per `(tenantId, idempotencyKey)`.
///
/// The durable TTL cache lives in SQLite; this map only covers the window
/// between dispatch start and the idempotency row landing.
#[derive(Default)]
pub struct InflightMap {
    entries: Mutex<HashMap<(String, String), InflightEntry>>,
}

impl InflightMap {
    pub fn new() -> InflightMap {
        InflightMap::default()
    }

    pub fn begin(&self, tenant_id: &str, key: &str, fingerprint: &str) -> Admission {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let map_key = (tenant_id.to_string(), key.to_string());
        if let Some(entry) = entries.get(&map_key) {
            if entry.fingerprint == fingerprint {
                return Admission::Join(entry.tx.subscribe());
            }
            return Admission::Conflict;
        }
        let (tx, _rx) = watch::channel(None);
        entries.insert(
            map_key,
            InflightEntry {
                fingerprint: fingerprint.to_string(),
                tx,
            },
        );
        Admission::Dispatch
    }

    /// Publish the dispatch result to joiners and drop the entry. Called after
    /// the idempotency row is persisted, so late arrivals hit the DB cache.
    pub fn complete(&self, tenant_id: &str, key: &str, response: CachedResponse) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.remove(&(tenant_id.to_string(), key.to_string())) {
            let _ = entry.tx.send(Some(response));
        }
    }

    /// Drop the entry without publishing (dispatch task died before producing
    /// a response). Joiners observe a closed channel.
    pub fn abandon(&self, tenant_id: &str, key: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(&(tenant_id.to_string(), key.to_string()));
    }
}

/// Await the owning dispatch's result. None when the owner abandoned.
pub async fn await_joined(
    mut rx: watch::Receiver<Option<CachedResponse>>,
) -> Option<CachedResponse> {
    loop {
        if let Some(response) = rx.borrow().clone() {
            return Some(response);
        }
        if rx.changed().await.is_err() {
            return rx.borrow().clone();
        }
    }
}
