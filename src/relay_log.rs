use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;

/// Append-only JSON-lines event log. One line per event:
/// `{"ts":"<rfc3339>","type":"<event>", ...fields}`.
///
/// Logging never fails the caller; write errors go to stderr once per event.
/// Token and API-key material must not be passed in `fields`.
pub struct RelayLog {
    file: Mutex<Option<File>>,
}

impl RelayLog {
    pub fn open(path: &str) -> RelayLog {
        if let Some(parent) = std::path::Path::new(path).parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let file = OpenOptions::new().create(true).append(true).open(path);
        if let Err(ref e) = file {
            eprintln!("⚠️ relay log: failed to open {path}: {e} (events go to stderr only)");
        }
        RelayLog {
            file: Mutex::new(file.ok()),
        }
    }

    /// A log that drops events. Used by unit tests that don't care about output.
    pub fn sink() -> RelayLog {
        RelayLog {
            file: Mutex::new(None),
        }
    }

    pub fn event(&self, event_type: &str, fields: serde_json::Value) {
        let mut line = serde_json::json!({
            "ts": chrono::Utc::now().to_rfc3339(),
            "type": event_type,
        });
        if let (Some(obj), Some(extra)) = (line.as_object_mut(), fields.as_object()) {
            for (k, v) in extra {
                obj.insert(k.clone(), v.clone());
            }
        }
        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(file) = guard.as_mut() {
            let mut text = line.to_string();
            text.push('\n');
            if let Err(e) = file.write_all(text.as_bytes()) {
                eprintln!("⚠️ relay log write failed: {e}");
            }
        }
    }

    /// Internal-error event plus a stderr mirror.
    pub fn relay_error(&self, context: &str, error: &str) {
        eprintln!("⚠️ {context}: {error}");
        self.event(
            "relay_error",
            serde_json::json!({"context": context, "error": error}),
        );
    }
}
