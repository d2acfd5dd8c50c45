use crate::common::cleanup_db;
use messaging_mux::config::Config;
use messaging_mux::db::{self, Db};
use messaging_mux::forward::InboundForwarder;
use messaging_mux::providers::ProviderError;
use messaging_mux::providers::whatsapp::{
    WaInboundMessage, WaListener, WhatsAppRuntime, enqueue_inbound,
};
use messaging_mux::relay_log::RelayLog;
use messaging_mux::wa_queue::WaQueueWorker;
use serde_json::json;
use std::sync::{Arc, Mutex};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn temp_db_path() -> String {
    format!("/tmp/mux_wa_test_{}.db", uuid::Uuid::new_v4())
}

/// Test double for the WhatsApp session library: records every send.
#[derive(Default)]
struct FakeRuntime {
    sent: Mutex<Vec<(String, Option<String>, Option<String>)>>,
}

#[async_trait::async_trait]
impl WhatsAppRuntime for FakeRuntime {
    fn set_active_listener(&self, _listener: WaListener) {}

    async fn monitor_inbox(&self) -> Result<(), String> {
        Ok(())
    }

    async fn send_message(
        &self,
        chat_jid: &str,
        text: Option<&str>,
        media_url: Option<&str>,
    ) -> Result<String, ProviderError> {
        let mut sent = self.sent.lock().unwrap();
        sent.push((
            chat_jid.to_string(),
            text.map(String::from),
            media_url.map(String::from),
        ));
        Ok(format!("fake-{}", sent.len()))
    }

    async fn send_typing(&self, _chat_jid: &str) -> Result<(), ProviderError> {
        Ok(())
    }
}

fn worker(db_path: &str, runtime: Arc<FakeRuntime>) -> WaQueueWorker {
    WaQueueWorker {
        db: Db::new(db_path),
        forwarder: InboundForwarder::new(),
        runtime,
        log: Arc::new(RelayLog::sink()),
        media_max_bytes: 5 * 1024 * 1024,
        messages: Config::default().messages,
        batch_size: 25,
        retry_initial_ms: 1,
        retry_max_ms: 1000,
    }
}

fn snapshot(message_id: &str, body: &str) -> WaInboundMessage {
    WaInboundMessage {
        account_id: "default".to_string(),
        chat_jid: "555@s.whatsapp.net".to_string(),
        message_id: Some(message_id.to_string()),
        from: "555@s.whatsapp.net".to_string(),
        body: body.to_string(),
        timestamp_ms: 1_700_000_000_000,
        media_path: None,
        media_mime: None,
        media_file_name: None,
        raw: json!({"key": {"id": message_id}}),
    }
}

// --- S6: defer on tenant 500, deliver exactly once on recovery ---

#[tokio::test]
async fn failed_forward_defers_then_delivers_once() {
    let tenant_app = MockServer::start().await;

    let db_path = temp_db_path();
    let runtime = Arc::new(FakeRuntime::default());
    let w = worker(&db_path, runtime);
    w.db.upsert_tenant(
        "acme",
        "Acme",
        &db::hash_secret("acme-key"),
        Some(&format!("{}/inbound", tenant_app.uri())),
        None,
    )
    .unwrap();
    w.db.insert_binding(
        "bind_1",
        "acme",
        "whatsapp",
        "chat",
        "whatsapp:default:chat:555@s.whatsapp.net",
        "active",
    )
    .unwrap();

    enqueue_inbound(&w.db, &RelayLog::sink(), &snapshot("wa-1", "hello"));

    Mock::given(method("POST"))
        .and(path("/inbound"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&tenant_app)
        .await;
    Mock::given(method("POST"))
        .and(path("/inbound"))
        .and(body_partial_json(json!({
            "channel": "whatsapp",
            "body": "hello",
            "messageId": "wa-1",
            "chatType": "direct"
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&tenant_app)
        .await;

    w.run_pass().await.unwrap();
    let now = db::now_ms();
    let rows = w.db.due_whatsapp_rows(now + 2000, 10).unwrap();
    assert_eq!(rows.len(), 1, "row deferred, not deleted");
    assert_eq!(rows[0].attempt_count, 1);
    assert!(rows[0].last_error.as_deref().unwrap().contains("500"));

    // Let the 1 ms backoff elapse, then the retry lands and the row is gone.
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    w.run_pass().await.unwrap();
    assert!(w.db.due_whatsapp_rows(db::now_ms() + 2000, 10).unwrap().is_empty());

    cleanup_db(&db_path);
}

// --- Listener dedupe ---

#[tokio::test]
async fn duplicate_listener_deliveries_enqueue_once() {
    let tenant_app = MockServer::start().await;
    let db_path = temp_db_path();
    let runtime = Arc::new(FakeRuntime::default());
    let w = worker(&db_path, runtime);
    w.db.upsert_tenant(
        "acme",
        "Acme",
        &db::hash_secret("acme-key"),
        Some(&format!("{}/inbound", tenant_app.uri())),
        None,
    )
    .unwrap();
    w.db.insert_binding(
        "bind_1",
        "acme",
        "whatsapp",
        "chat",
        "whatsapp:default:chat:555@s.whatsapp.net",
        "active",
    )
    .unwrap();

    let log = RelayLog::sink();
    enqueue_inbound(&w.db, &log, &snapshot("wa-7", "once"));
    enqueue_inbound(&w.db, &log, &snapshot("wa-7", "once"));
    assert_eq!(w.db.due_whatsapp_rows(db::now_ms(), 10).unwrap().len(), 1);

    Mock::given(method("POST"))
        .and(path("/inbound"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&tenant_app)
        .await;

    w.run_pass().await.unwrap();
    cleanup_db(&db_path);
}

// --- Pairing token redemption through the queue ---

#[tokio::test]
async fn unbound_chat_token_pairs_and_notifies() {
    let db_path = temp_db_path();
    let runtime = Arc::new(FakeRuntime::default());
    let w = worker(&db_path, runtime.clone());
    let tenant = w
        .db
        .upsert_tenant("acme", "Acme", &db::hash_secret("acme-key"), None, None)
        .unwrap();

    let issued = match messaging_mux::pairing::issue_token(
        &w.db,
        &Config::default(),
        &tenant,
        messaging_mux::route_key::Channel::WhatsApp,
        Some("wa-session-1"),
        None,
        None,
    ) {
        Ok(issued) => issued,
        Err(_) => panic!("token issue failed"),
    };

    enqueue_inbound(&w.db, &RelayLog::sink(), &snapshot("wa-2", &issued.token));
    w.run_pass().await.unwrap();

    let binding = w
        .db
        .find_active_binding_by_route("whatsapp", "whatsapp:default:chat:555@s.whatsapp.net")
        .unwrap()
        .expect("binding created");
    assert_eq!(binding.tenant_id, "acme");
    assert!(
        w.db.resolve_session_route("acme", "whatsapp", "wa-session-1")
            .unwrap()
            .is_some()
    );

    // Success notice went back into the chat; the queue row is finished.
    let sent = runtime.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "555@s.whatsapp.net");
    assert!(w.db.due_whatsapp_rows(db::now_ms() + 2000, 10).unwrap().is_empty());

    cleanup_db(&db_path);
}

// --- Unbound chatter is dropped, not retried forever ---

#[tokio::test]
async fn unbound_plain_message_is_dropped() {
    let db_path = temp_db_path();
    let runtime = Arc::new(FakeRuntime::default());
    let w = worker(&db_path, runtime.clone());

    enqueue_inbound(&w.db, &RelayLog::sink(), &snapshot("wa-3", "who dis"));
    w.run_pass().await.unwrap();

    assert!(w.db.due_whatsapp_rows(db::now_ms() + 2000, 10).unwrap().is_empty());
    assert!(runtime.sent.lock().unwrap().is_empty());
    cleanup_db(&db_path);
}

// --- Image media from the listener's file becomes an attachment ---

#[tokio::test]
async fn listener_media_file_is_forwarded_as_attachment() {
    let tenant_app = MockServer::start().await;
    let db_path = temp_db_path();
    let runtime = Arc::new(FakeRuntime::default());
    let w = worker(&db_path, runtime);
    w.db.upsert_tenant(
        "acme",
        "Acme",
        &db::hash_secret("acme-key"),
        Some(&format!("{}/inbound", tenant_app.uri())),
        None,
    )
    .unwrap();
    w.db.insert_binding(
        "bind_1",
        "acme",
        "whatsapp",
        "chat",
        "whatsapp:default:chat:555@s.whatsapp.net",
        "active",
    )
    .unwrap();

    let media_path = format!("/tmp/mux_wa_media_{}.jpg", uuid::Uuid::new_v4());
    std::fs::write(&media_path, b"WAIMG").unwrap();
    let mut message = snapshot("wa-4", "");
    message.media_path = Some(media_path.clone());
    message.media_mime = Some("image/jpeg".to_string());
    message.media_file_name = Some("photo.jpg".to_string());
    enqueue_inbound(&w.db, &RelayLog::sink(), &message);

    let expected_b64 = {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(b"WAIMG")
    };
    Mock::given(method("POST"))
        .and(path("/inbound"))
        .and(body_partial_json(json!({
            "attachments": [{"type": "image", "mimeType": "image/jpeg", "fileName": "photo.jpg", "content": expected_b64}]
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&tenant_app)
        .await;

    w.run_pass().await.unwrap();
    std::fs::remove_file(&media_path).ok();
    cleanup_db(&db_path);
}
